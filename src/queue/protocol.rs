use serde::Serialize;

use crate::{config::QueueNames, defs::Command};

/* === Definitions === */

/// Topic layout on the broker. Every topic ends with the device id, which
/// acts as the routing key.
#[derive(Clone, Debug)]
pub struct Topics {
    status: String,
    alarm: String,
    command_prefix: String,
    command_filter: String,
}

/// A message received on the command feed, classified.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Command(Command),
    /// Addressed to another device sharing the feed.
    Foreign(String),
    Malformed(String),
}

/* === Implementations === */

impl Topics {
    pub fn new(names: &QueueNames, device_id: &str) -> Self {
        Self {
            status: format!("{}/{device_id}", names.status),
            alarm: format!("{}/{device_id}", names.alarm),
            command_prefix: format!("{}/", names.command),
            command_filter: format!("{}/+", names.command),
        }
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn alarm(&self) -> &str {
        &self.alarm
    }

    pub fn command_filter(&self) -> &str {
        &self.command_filter
    }

    /// Routing key of a topic on the command feed.
    pub fn routing_key<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(&self.command_prefix)
            .filter(|key| !key.is_empty() && !key.contains('/'))
    }

    pub fn decode(&self, device_id: &str, topic: &str, payload: &[u8]) -> Inbound {
        let Some(key) = self.routing_key(topic) else {
            return Inbound::Malformed(format!("unexpected topic {topic}"));
        };

        if key != device_id {
            return Inbound::Foreign(key.to_owned());
        }

        match serde_json::from_slice::<Command>(payload) {
            Ok(command) => Inbound::Command(command),
            Err(error) => Inbound::Malformed(error.to_string()),
        }
    }
}

pub fn encode<T: Serialize>(event: &T) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics::new(&QueueNames::default(), "fan-001")
    }

    #[test]
    fn test_topic_layout() {
        let topics = topics();

        assert_eq!(topics.status(), "device-status/fan-001");
        assert_eq!(topics.alarm(), "device-alarms/fan-001");
        assert_eq!(topics.command_filter(), "device-commands/+");
    }

    #[test]
    fn test_routing_key() {
        let topics = topics();

        assert_eq!(topics.routing_key("device-commands/fan-001"), Some("fan-001"));
        assert_eq!(topics.routing_key("device-commands/"), None);
        assert_eq!(topics.routing_key("device-commands/a/b"), None);
        assert_eq!(topics.routing_key("device-status/fan-001"), None);
    }

    #[test]
    fn test_decode() {
        let topics = topics();
        let payload = br#"{"DeviceId":"fan-001","Action":"Start","Parameters":{}}"#;

        match topics.decode("fan-001", "device-commands/fan-001", payload) {
            Inbound::Command(command) => assert_eq!(command.action, "Start"),
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            topics.decode("fan-001", "device-commands/fan-002", payload),
            Inbound::Foreign("fan-002".into())
        );

        let local_time = br#"{"DeviceId":"fan-001","Action":"Start","Parameters":{},"Timestamp":"2024-05-01T12:00:00"}"#;

        assert!(matches!(
            topics.decode("fan-001", "device-commands/fan-001", local_time),
            Inbound::Command(_)
        ));

        assert!(matches!(
            topics.decode("fan-001", "device-commands/fan-001", b"{not json"),
            Inbound::Malformed(_)
        ));
    }
}
