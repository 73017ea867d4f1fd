use eyre::{Context, Result, bail};
use serde_json::Value;

use crate::defs::Command;

pub async fn post_command(url: &str, device: &str, action: &str, value: Option<f64>) -> Result<()> {
    let mut command = Command::new(device, action);

    if let Some(value) = value {
        command = command.with_speed(value);
    }

    let endpoint = format!("{}/api/command", url.trim_end_matches('/'));

    let response = reqwest::Client::new()
        .post(&endpoint)
        .json(&command)
        .send()
        .await
        .wrap_err_with(|| format!("Failed to reach {endpoint}"))?;

    let status = response.status();
    let body: Value = response.json().await.wrap_err("Invalid response body")?;

    if !status.is_success() {
        let error = body["error"].as_str().unwrap_or("unknown error");
        bail!("Device rejected command ({status}): {error}");
    }

    tracing::info!(
        "{} for {} at {}",
        body["message"].as_str().unwrap_or("Accepted"),
        device,
        body["timestamp"].as_str().unwrap_or("?"),
    );

    Ok(())
}
