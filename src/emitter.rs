use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::time::timeout;

use crate::{
    defs::{AlarmEvent, DEVICE_TYPE_FAN, Properties, Severity, StateCode, StatusEvent},
    device::DeviceState,
    event_log::EventLog,
};

pub const DEFAULT_ALARM_THRESHOLD: f64 = 2.8;
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Margin above the threshold from which an alarm becomes critical.
const CRITICAL_MARGIN: f64 = 0.5;

/* === Definitions === */

/// Outbound channel for status and alarm events.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish_status(&self, status: &StatusEvent) -> Result<(), PublishError>;

    async fn publish_alarm(&self, alarm: &AlarmEvent) -> Result<(), PublishError>;
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish channel not connected")]
    NotConnected,
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Transport(String),
}

#[derive(Clone, Copy, Debug)]
pub struct AlarmPolicy {
    threshold: f64,
}

/// Turns device snapshots into status and alarm events and hands them to
/// the publisher, if one is attached.
pub struct Emitter {
    log: EventLog,
    policy: AlarmPolicy,
    publisher: Option<Arc<dyn Publisher>>,
    publish_timeout: Duration,
}

/// Outcome of a single emission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Emission {
    /// No publish channel is connected.
    Skipped,
    Failed,
    Sent { alarm: Option<Severity> },
}

/* === Implementations === */

impl AlarmPolicy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Stateless: fires on every evaluation while the fan runs above the
    /// threshold.
    pub fn evaluate(&self, state: &DeviceState) -> Option<(Severity, String)> {
        let speed = state.active_speed()?;
        let severity = self.classify(speed)?;

        let message = format!(
            "Fan speed ({speed:.2}) exceeds threshold ({:.2})",
            self.threshold
        );

        Some((severity, message))
    }

    pub fn classify(&self, speed: f64) -> Option<Severity> {
        if speed <= self.threshold {
            return None;
        }

        match speed > self.threshold + CRITICAL_MARGIN {
            true => Some(Severity::Critical),
            false => Some(Severity::Warning),
        }
    }
}

impl Default for AlarmPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALARM_THRESHOLD)
    }
}

impl Emitter {
    pub fn new(log: EventLog, policy: AlarmPolicy) -> Self {
        Self {
            log,
            policy,
            publisher: None,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.publisher.as_ref().is_some_and(|p| p.is_connected())
    }

    pub fn status_for(&self, state: &DeviceState) -> StatusEvent {
        let state_code = match (state.running(), self.is_connected()) {
            (true, _) => StateCode::Running,
            (false, true) => StateCode::Idle,
            (false, false) => StateCode::Offline,
        };

        StatusEvent {
            device_id: state.device_id().to_owned(),
            device_type: DEVICE_TYPE_FAN,
            state: state_code,
            timestamp: Utc::now(),
            properties: Properties {
                speed: Some(state.speed()),
                is_running: Some(state.running()),
            },
        }
    }

    /// Publishes the status of `state`, followed by an alarm if the policy
    /// fires. Failures are logged and never retried here.
    pub async fn emit(&self, state: &DeviceState) -> Emission {
        let Some(publisher) = self.connected_publisher() else {
            return Emission::Skipped;
        };

        let status = self.status_for(state);

        if let Err(error) = self.bounded(publisher.publish_status(&status)).await {
            self.log.append(format!("Failed to send status: {error}"));
            return Emission::Failed;
        }

        tracing::debug!("Published status {:?}", status.state);

        let Some((severity, message)) = self.policy.evaluate(state) else {
            return Emission::Sent { alarm: None };
        };

        let alarm = AlarmEvent::new(state.device_id(), message, severity);

        match self.bounded(publisher.publish_alarm(&alarm)).await {
            Ok(()) => {
                self.log.append(format!("ALARM: {}", alarm.message));
                Emission::Sent {
                    alarm: Some(severity),
                }
            }

            Err(error) => {
                self.log.append(format!("Failed to send alarm: {error}"));
                Emission::Sent { alarm: None }
            }
        }
    }

    /// Final best-effort status sent during shutdown.
    pub async fn emit_offline(&self, device_id: &str, limit: Duration) -> Result<(), PublishError> {
        let publisher = self
            .connected_publisher()
            .ok_or(PublishError::NotConnected)?;

        let status = StatusEvent::offline(device_id);

        timeout(limit, publisher.publish_status(&status))
            .await
            .map_err(|_| PublishError::Timeout(limit))?
    }

    fn connected_publisher(&self) -> Option<&Arc<dyn Publisher>> {
        self.publisher.as_ref().filter(|p| p.is_connected())
    }

    async fn bounded<F>(&self, publish: F) -> Result<(), PublishError>
    where
        F: Future<Output = Result<(), PublishError>>,
    {
        timeout(self.publish_timeout, publish)
            .await
            .map_err(|_| PublishError::Timeout(self.publish_timeout))?
    }
}
