use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep, timeout},
};
use uuid::Uuid;

use crate::{
    config::QueueConfig,
    defs::{AlarmEvent, Source, StatusEvent},
    device::Dispatcher,
    emitter::{PublishError, Publisher},
    event_log::EventLog,
};

use self::protocol::{Inbound, Topics};

pub mod protocol;

/* === Definitions === */

/// Outbound half of the MQTT link: publishes status and alarm events and
/// reports whether the broker is reachable.
pub struct QueueLink {
    inner: Arc<Inner>,
}

/// Inbound half of the MQTT link. Drives the connection and feeds the
/// command feed to the dispatcher once spawned.
pub struct QueueEvents {
    inner: Arc<Inner>,
    eventloop: EventLoop,
}

struct Inner {
    client: AsyncClient,
    topics: Topics,
    device_id: String,
    connected: watch::Sender<bool>,
}

/* === Implementations === */

impl QueueLink {
    const REQUEST_CAPACITY: usize = 10;

    /// Prepares the client. Nothing touches the network until the returned
    /// [`QueueEvents`] is spawned. Fails only if the configuration cannot
    /// describe a connection.
    pub fn connect(config: &QueueConfig, device_id: &str) -> Result<(Self, QueueEvents)> {
        let host = config.host()?;
        let keep_alive = config.keep_alive()?;

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("breeze-{device_id}-{}", Uuid::new_v4().simple()));

        let mut options = MqttOptions::new(client_id, host, config.port);
        options.set_keep_alive(keep_alive);
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, Self::REQUEST_CAPACITY);

        let inner = Arc::new(Inner {
            client,
            topics: Topics::new(&config.names, device_id),
            device_id: device_id.to_owned(),
            connected: watch::channel(false).0,
        });

        tracing::debug!("Queue broker is {host}:{}", config.port);

        let events = QueueEvents {
            inner: inner.clone(),
            eventloop,
        };

        Ok((Self { inner }, events))
    }

    pub async fn wait_connected(&self, limit: Duration) -> Result<()> {
        let mut connected = self.inner.connected.subscribe();

        timeout(limit, connected.wait_for(|connected| *connected))
            .await
            .wrap_err("Timed out connecting to queue broker")?
            .wrap_err("Queue link closed")?;

        Ok(())
    }

    /// Requests a clean disconnect and waits for the event loop to confirm
    /// it, up to `limit`.
    pub async fn disconnect(&self, limit: Duration) -> Result<()> {
        self.inner
            .client
            .disconnect()
            .await
            .wrap_err("Failed to request queue disconnect")?;

        let mut connected = self.inner.connected.subscribe();

        timeout(limit, connected.wait_for(|connected| !*connected))
            .await
            .wrap_err("Timed out disconnecting from queue broker")?
            .wrap_err("Queue link closed")?;

        Ok(())
    }

    async fn publish<T: Serialize + Sync>(&self, topic: &str, event: &T) -> Result<(), PublishError> {
        let payload = protocol::encode(event)?;

        self.inner
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|error| PublishError::Transport(error.to_string()))
    }
}

#[async_trait]
impl Publisher for QueueLink {
    fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    async fn publish_status(&self, status: &StatusEvent) -> Result<(), PublishError> {
        self.publish(self.inner.topics.status(), status).await
    }

    async fn publish_alarm(&self, alarm: &AlarmEvent) -> Result<(), PublishError> {
        self.publish(self.inner.topics.alarm(), alarm).await
    }
}

impl QueueEvents {
    const RECONNECT_DELAY: Duration = Duration::from_secs(1);

    /// Polls the broker until the link is disconnected, reconnecting after
    /// transport errors.
    pub fn spawn(self, dispatcher: Dispatcher, log: EventLog) -> JoinHandle<()> {
        tokio::spawn(self.run(dispatcher, log))
    }

    async fn run(self, dispatcher: Dispatcher, log: EventLog) {
        let Self {
            inner,
            mut eventloop,
        } = self;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // Subscriptions do not survive a clean session
                    let filter = inner.topics.command_filter();

                    if let Err(error) = inner.client.try_subscribe(filter, QoS::AtLeastOnce) {
                        log.append(format!("Failed to subscribe to command feed: {error}"));
                    }

                    inner.connected.send_replace(true);
                    tracing::info!("Connected to queue broker");
                }

                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    route(
                        &inner.topics,
                        &inner.device_id,
                        &publish.topic,
                        &publish.payload,
                        &dispatcher,
                        &log,
                    );
                }

                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    inner.connected.send_replace(false);
                    tracing::info!("Disconnected from queue broker");
                    break;
                }

                Ok(_) => {}

                Err(error) => {
                    if inner.connected.send_replace(false) {
                        log.append(format!("Queue connection lost: {error}"));
                    } else {
                        tracing::debug!("Queue connection error: {error}");
                    }

                    sleep(Self::RECONNECT_DELAY).await;
                }
            }
        }
    }
}

/// Hands a received message to the dispatcher. Every message is consumed
/// here, whether it is dispatched, ignored or rejected.
fn route(
    topics: &Topics,
    device_id: &str,
    topic: &str,
    payload: &[u8],
    dispatcher: &Dispatcher,
    log: &EventLog,
) {
    match topics.decode(device_id, topic, payload) {
        Inbound::Command(command) => dispatcher.dispatch(command, Source::Queue),
        Inbound::Foreign(key) => tracing::debug!("Discarding command for {key}"),
        Inbound::Malformed(reason) => log.append(format!("Malformed queue message: {reason}")),
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::QueueNames,
        device::DeviceState,
        emitter::{AlarmPolicy, Emitter, tests::RecordingPublisher},
    };

    use super::*;

    const DEVICE: &str = "fan-001";

    fn setup() -> (Topics, Dispatcher, Arc<RecordingPublisher>, EventLog) {
        let log = EventLog::default();
        let publisher = Arc::new(RecordingPublisher::default());
        let emitter =
            Emitter::new(log.clone(), AlarmPolicy::default()).with_publisher(publisher.clone());

        let (dispatcher, _) =
            Dispatcher::spawn(DeviceState::new(DEVICE), Arc::new(emitter), log.clone());

        (Topics::new(&QueueNames::default(), DEVICE), dispatcher, publisher, log)
    }

    #[test]
    fn test_sub_second_keep_alive_is_rejected() {
        let config = QueueConfig {
            host: Some("localhost".into()),
            keep_alive: Duration::from_millis(500),
            ..QueueConfig::default()
        };

        assert!(QueueLink::connect(&config, DEVICE).is_err());
    }

    #[tokio::test]
    async fn test_unparseable_message_is_logged() {
        let (topics, dispatcher, publisher, log) = setup();

        route(&topics, DEVICE, "device-commands/fan-001", b"\x00garbage", &dispatcher, &log);
        dispatcher.flush().await;

        assert!(log.recent()[0].message.starts_with("Malformed queue message: "));
        assert_eq!(dispatcher.snapshot(), DeviceState::new(DEVICE));
        assert_eq!(publisher.status_count(), 0);
    }

    #[tokio::test]
    async fn test_foreign_message_is_consumed_silently() {
        let (topics, dispatcher, publisher, log) = setup();
        let payload = br#"{"deviceId":"fan-002","action":"Start"}"#;

        route(&topics, DEVICE, "device-commands/fan-002", payload, &dispatcher, &log);
        dispatcher.flush().await;

        assert!(log.is_empty());
        assert!(!dispatcher.snapshot().running());
        assert_eq!(publisher.status_count(), 0);
    }

    #[tokio::test]
    async fn test_command_is_dispatched() {
        let (topics, dispatcher, publisher, log) = setup();
        let payload = br#"{"DeviceId":"fan-001","Action":"Start","Parameters":{}}"#;

        route(&topics, DEVICE, "device-commands/fan-001", payload, &dispatcher, &log);
        dispatcher.flush().await;

        assert!(dispatcher.snapshot().running());
        assert_eq!(publisher.status_count(), 1);
        assert_eq!(log.recent()[0].message, "Fan started at 1.00 via queue");
    }
}
