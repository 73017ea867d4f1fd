use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use eyre::{Context, Result, bail, eyre};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    emitter::{DEFAULT_ALARM_THRESHOLD, DEFAULT_PUBLISH_TIMEOUT},
    event_log::DEFAULT_CAPACITY,
    misc::{
        ColourDot,
        serde::{deserialise_empty_to_default, deserialise_seconds, serialise_seconds},
    },
    scheduler::DEFAULT_STATUS_INTERVAL,
};

/// Longest accepted status period. Keeps timer arithmetic in range.
const MAX_STATUS_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default, deserialize_with = "deserialise_empty_to_default")]
    pub queue: Option<QueueConfig>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub event_log: EventLogConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default = "default_device_name")]
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    pub host: Option<String>,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub names: QueueNames,
    #[serde(
        default = "default_keep_alive",
        deserialize_with = "deserialise_seconds",
        serialize_with = "serialise_seconds"
    )]
    pub keep_alive: Duration,
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialise_seconds",
        serialize_with = "serialise_seconds"
    )]
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueNames {
    #[serde(default = "default_status_queue")]
    pub status: String,
    #[serde(default = "default_command_queue")]
    pub command: String,
    #[serde(default = "default_alarm_queue")]
    pub alarm: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_alarm_speed")]
    pub alarm_speed: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Timing {
    #[serde(
        default = "default_status_interval",
        deserialize_with = "deserialise_seconds",
        serialize_with = "serialise_seconds"
    )]
    pub status_interval: Duration,
    #[serde(
        default = "default_publish_timeout",
        deserialize_with = "deserialise_seconds",
        serialize_with = "serialise_seconds"
    )]
    pub publish_timeout: Duration,
    #[serde(
        default = "default_publish_timeout",
        deserialize_with = "deserialise_seconds",
        serialize_with = "serialise_seconds"
    )]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventLogConfig {
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
    pub path: Option<PathBuf>,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let data = fs::read(path)
            .await
            .wrap_err_with(|| format!("Failed to read config {}", path.display()))?;

        Self::parse(&data)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let config: Config = serde_yaml::from_slice(data).wrap_err("Failed to parse config")?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.device.id.trim().is_empty() {
            bail!("device.id must not be empty");
        }

        if !self.thresholds.alarm_speed.is_finite() {
            bail!("thresholds.alarm_speed must be a finite number");
        }

        if self.timing.status_interval.is_zero() {
            bail!("timing.status_interval must be positive");
        }

        if self.timing.status_interval > MAX_STATUS_INTERVAL {
            bail!(
                "timing.status_interval must not exceed {} s",
                MAX_STATUS_INTERVAL.as_secs()
            );
        }

        Ok(())
    }
}

impl QueueConfig {
    /// The broker host, or an error describing why the queue channel cannot
    /// be used.
    pub fn host(&self) -> Result<&str> {
        self.host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .ok_or_else(|| eyre!("Queue broker host missing"))
    }

    /// MQTT keep-alive is whole seconds, so anything between zero (disabled)
    /// and one second cannot be expressed.
    pub fn keep_alive(&self) -> Result<Duration> {
        let keep_alive = self.keep_alive;

        if !keep_alive.is_zero() && keep_alive < Duration::from_secs(1) {
            bail!("Queue keep_alive must be 0 or at least 1 s, got {keep_alive:?}");
        }

        Ok(keep_alive)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let broker = self
            .queue
            .as_ref()
            .and_then(|queue| Some((queue.host().ok()?, queue.port)));

        writeln!(f, "Device {} ({})", self.device.name, self.device.id)?;
        writeln!(
            f,
            "  {} http   {}",
            ColourDot(self.http.enabled),
            self.http.bind
        )?;

        match broker {
            Some((host, port)) => write!(f, "  {} queue  {host}:{port}", ColourDot(true)),
            None => write!(f, "  {} queue  disabled", ColourDot(false)),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_mqtt_port(),
            client_id: None,
            username: None,
            password: None,
            names: QueueNames::default(),
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            status: default_status_queue(),
            command: default_command_queue(),
            alarm: default_alarm_queue(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            alarm_speed: default_alarm_speed(),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            status_interval: default_status_interval(),
            publish_timeout: default_publish_timeout(),
            shutdown_timeout: default_publish_timeout(),
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            capacity: default_log_capacity(),
            path: None,
        }
    }
}

fn default_device_name() -> String {
    "Fan".to_owned()
}

const fn default_true() -> bool {
    true
}

const fn default_bind() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5001)
}

const fn default_mqtt_port() -> u16 {
    1883
}

const fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_status_queue() -> String {
    "device-status".to_owned()
}

fn default_command_queue() -> String {
    "device-commands".to_owned()
}

fn default_alarm_queue() -> String {
    "device-alarms".to_owned()
}

const fn default_alarm_speed() -> f64 {
    DEFAULT_ALARM_THRESHOLD
}

const fn default_status_interval() -> Duration {
    DEFAULT_STATUS_INTERVAL
}

const fn default_publish_timeout() -> Duration {
    DEFAULT_PUBLISH_TIMEOUT
}

const fn default_log_capacity() -> usize {
    DEFAULT_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config = Config::parse(b"device:\n  id: fan-001\n").unwrap();

        assert_eq!(config.device.id, "fan-001");
        assert!(config.http.enabled);
        assert_eq!(config.http.bind.port(), 5001);
        assert!(config.queue.is_none());
        assert_eq!(config.thresholds.alarm_speed, 2.8);
        assert_eq!(config.timing.status_interval, Duration::from_secs(5));
        assert_eq!(config.event_log.capacity, 50);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
device:
  id: fan-002
  name: Hall fan
http:
  bind: 0.0.0.0:8080
queue:
  host: broker.local
  port: 8883
  names:
    command: commands
thresholds:
  alarm_speed: 2.5
timing:
  status_interval: 1.5
event_log:
  capacity: 10
  path: logs/events.log
"#;

        let config = Config::parse(yaml.as_bytes()).unwrap();
        let queue = config.queue.as_ref().unwrap();

        assert_eq!(config.http.bind.port(), 8080);
        assert_eq!(queue.host().unwrap(), "broker.local");
        assert_eq!(queue.port, 8883);
        assert_eq!(queue.names.command, "commands");
        assert_eq!(queue.names.status, "device-status");
        assert_eq!(config.thresholds.alarm_speed, 2.5);
        assert_eq!(config.timing.status_interval, Duration::from_millis(1500));
        assert_eq!(config.event_log.path, Some(PathBuf::from("logs/events.log")));
    }

    #[test]
    fn test_sample_config() {
        let config = Config::parse(include_bytes!("../config.yaml")).unwrap();

        assert_eq!(config.device.id, "fan-001");
        assert_eq!(config.queue.unwrap().host().unwrap(), "localhost");
    }

    #[test]
    fn test_empty_queue_section_is_missing_host() {
        let config = Config::parse(b"device:\n  id: fan-001\nqueue:\n").unwrap();
        let queue = config.queue.unwrap();

        assert!(queue.host().is_err());
        assert_eq!(queue.port, 1883);
    }

    #[test]
    fn test_sub_second_keep_alive_disables_queue_only() {
        let yaml = b"device:\n  id: fan-001\nqueue:\n  host: localhost\n  keep_alive: 0.5\n";
        let config = Config::parse(yaml).unwrap();
        let queue = config.queue.unwrap();

        assert!(queue.keep_alive().is_err());

        for accepted in ["0", "1", "30"] {
            let yaml = format!("device:\n  id: a\nqueue:\n  keep_alive: {accepted}\n");
            let config = Config::parse(yaml.as_bytes()).unwrap();

            assert!(config.queue.unwrap().keep_alive().is_ok());
        }
    }

    #[test]
    fn test_invalid_configs() {
        assert!(Config::parse(b"device:\n  id: \"\"\n").is_err());
        assert!(Config::parse(b"http:\n  enabled: true\n").is_err());
        assert!(Config::parse(b"device:\n  id: a\ntiming:\n  status_interval: 0\n").is_err());
        assert!(Config::parse(b"device:\n  id: a\ntiming:\n  status_interval: 1000000000000000.0\n").is_err());
    }
}
