use std::env::var;

const FORWARDED_ENV: [(&str, &str); 3] = [
    ("CARGO_CFG_TARGET_ARCH", "BREEZE_TARGET_ARCH"),
    ("CARGO_CFG_TARGET_OS", "BREEZE_TARGET_OS"),
    ("PROFILE", "BREEZE_PROFILE"),
];

fn main() {
    for (source, target) in FORWARDED_ENV {
        if let Ok(value) = var(source) {
            println!("cargo:rustc-env={target}={value}");
        }
    }

    println!("cargo:rerun-if-changed=build.rs");
}
