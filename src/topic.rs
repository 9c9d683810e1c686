//! Topic classification for the zigbee2mqtt topic tree.

/// Fixed topic prefix all device updates are published under.
pub const TOPIC_PREFIX: &str = "zigbee2mqtt";

/// Wildcard subscription covering the whole zigbee2mqtt topic tree.
///
/// The subscription is broader than the recognized pattern: nested topics
/// such as `zigbee2mqtt/bridge/state` are delivered too and classified as
/// [`Route::Unrecognized`].
pub const SUBSCRIBE_WILDCARD: &str = "zigbee2mqtt/#";

/// Classification of an inbound topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// A device update: `zigbee2mqtt/<device>` with exactly one segment
    /// after the prefix. Carries the device identity.
    Device(&'a str),
    /// Anything else under (or outside) the subscription tree.
    Unrecognized,
}

/// Classify a topic string.
///
/// Matches `zigbee2mqtt/<device>` where `<device>` is a single non-empty
/// path segment. Pure classification, no side effects.
///
/// # Example
/// ```
/// use zigbee2mqtt_exporter_prometheus::topic::{Route, route};
///
/// assert_eq!(route("zigbee2mqtt/szafa rack"), Route::Device("szafa rack"));
/// assert_eq!(route("zigbee2mqtt/bridge/state"), Route::Unrecognized);
/// ```
pub fn route(topic: &str) -> Route<'_> {
    match topic.strip_prefix(TOPIC_PREFIX).and_then(|r| r.strip_prefix('/')) {
        Some(device) if !device.is_empty() && !device.contains('/') => Route::Device(device),
        _ => Route::Unrecognized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_single_segment() {
        assert_eq!(route("zigbee2mqtt/lamp"), Route::Device("lamp"));
        assert_eq!(route("zigbee2mqtt/szafa rack"), Route::Device("szafa rack"));
    }

    #[test]
    fn test_route_nested_topic() {
        assert_eq!(route("zigbee2mqtt/bridge/state"), Route::Unrecognized);
        assert_eq!(route("zigbee2mqtt/lamp/availability"), Route::Unrecognized);
    }

    #[test]
    fn test_route_prefix_only() {
        assert_eq!(route("zigbee2mqtt"), Route::Unrecognized);
        assert_eq!(route("zigbee2mqtt/"), Route::Unrecognized);
    }

    #[test]
    fn test_route_other_prefix() {
        assert_eq!(route("homeassistant/status"), Route::Unrecognized);
        assert_eq!(route(""), Route::Unrecognized);
    }

    #[test]
    fn test_route_prefix_must_match_exactly() {
        // A longer first segment must not be mistaken for the prefix.
        assert_eq!(route("zigbee2mqtt2/lamp"), Route::Unrecognized);
    }
}
