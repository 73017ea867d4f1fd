use std::path::Path;

use eyre::{Context, Result};

use crate::config::Config;

pub async fn read_and_print(path: &Path) -> Result<()> {
    let config = Config::load(path).await?;

    println!("{config}\n");

    let yaml = serde_yaml::to_string(&config).wrap_err("Failed to serialise config")?;
    println!("{yaml}");

    Ok(())
}
