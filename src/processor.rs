//! Per-message processing: route, decode, update the registry.

use tracing::{debug, warn};

use crate::payload;
use crate::registry::SharedRegistry;
use crate::topic::{Route, route};

/// What processing one message did to the registry.
///
/// No variant aborts ingestion; the outcome exists so callers and tests can
/// observe the result without parsing log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Reading decoded and the device's gauges overwritten.
    Applied,
    /// Topic did not match the device update pattern; counted.
    UnknownTopic,
    /// Recognized topic, but the payload did not decode; dropped.
    Undecodable,
}

/// Processes inbound messages against the shared registry.
///
/// Deterministic given (topic, payload) apart from the last-update
/// timestamp. Malformed input is absorbed here; nothing propagates to the
/// ingestion loop.
pub struct MessageProcessor {
    registry: SharedRegistry,
}

impl MessageProcessor {
    /// Create a processor writing to the given registry.
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    /// Process one inbound message.
    pub fn process(&self, topic: &str, payload: &str) -> ProcessOutcome {
        debug!(topic, payload, "Received message");

        match route(topic) {
            Route::Device(device) => match payload::decode(payload) {
                Ok(reading) => {
                    self.registry.record_reading(device, &reading);
                    ProcessOutcome::Applied
                }
                Err(err) => {
                    self.registry.note_undecodable();
                    warn!(topic, error = %err, "No matching schema for payload");
                    ProcessOutcome::Undecodable
                }
            },
            Route::Unrecognized => {
                self.registry.record_unknown_topic(topic);
                warn!(topic, "Unknown topic");
                ProcessOutcome::UnknownTopic
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricRegistry;
    use std::sync::Arc;

    fn make_processor() -> (MessageProcessor, SharedRegistry) {
        let registry = Arc::new(MetricRegistry::new());
        (MessageProcessor::new(registry.clone()), registry)
    }

    #[test]
    fn test_process_device_update() {
        let (processor, registry) = make_processor();

        let outcome = processor.process(
            "zigbee2mqtt/szafa rack",
            r#"{"current":0.54,"energy":1.05,"power":102,"voltage":239.1}"#,
        );

        assert_eq!(outcome, ProcessOutcome::Applied);
        assert_eq!(registry.device_count(), 1);
        assert!(registry.last_update() > 0.0);
    }

    #[test]
    fn test_process_unknown_topic() {
        let (processor, registry) = make_processor();

        let outcome = processor.process("zigbee2mqtt/bridge/state", "{}");

        assert_eq!(outcome, ProcessOutcome::UnknownTopic);
        assert_eq!(registry.unknown_topic_count("zigbee2mqtt/bridge/state"), 1);
        assert_eq!(registry.device_count(), 0);
        assert_eq!(registry.last_update(), 0.0);
    }

    #[test]
    fn test_process_undecodable_payload() {
        let (processor, registry) = make_processor();

        let outcome = processor.process("zigbee2mqtt/lamp", "not json");

        assert_eq!(outcome, ProcessOutcome::Undecodable);
        assert_eq!(registry.device_count(), 0);
        assert_eq!(registry.unknown_topic_count("zigbee2mqtt/lamp"), 0);
        assert_eq!(registry.last_update(), 0.0);
    }

    #[test]
    fn test_process_never_panics_on_garbage() {
        let (processor, _registry) = make_processor();

        processor.process("", "");
        processor.process("zigbee2mqtt/", "{}");
        processor.process("zigbee2mqtt/dev", "\u{0}\u{1}");
    }
}
