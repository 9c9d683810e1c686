//! Power meter payload schema and decoding.

use serde::Deserialize;

/// A single power meter reading decoded from a device update payload.
///
/// This is the one schema the exporter understands: a flat JSON object as
/// published by zigbee2mqtt for metering plugs. Missing numeric fields
/// default to zero; fields the exporter does not export (`linkquality`,
/// `state`, `power_on_behavior`, the nested `update` object, ...) are
/// ignored. A reading lives only long enough to update the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct PowerMeterReading {
    /// Current draw in amperes.
    #[serde(default)]
    pub current: f64,

    /// Cumulative energy in kWh.
    #[serde(default)]
    pub energy: f64,

    /// Instantaneous power in watts.
    #[serde(default)]
    pub power: f64,

    /// Line voltage in volts.
    #[serde(default)]
    pub voltage: f64,
}

/// Decode a raw payload string against the power meter schema.
///
/// Fails only when the payload is not a JSON object compatible with
/// [`PowerMeterReading`]; the error is reported to the caller and never
/// escalated further.
pub fn decode(payload: &str) -> Result<PowerMeterReading, serde_json::Error> {
    serde_json::from_str(payload)
}
