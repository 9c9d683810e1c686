//! Metric registry holding the exporter's gauge and counter series.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::trace;

use crate::payload::PowerMeterReading;

/// Gauge: current draw in amperes, labeled by device.
pub const METRIC_CURRENT: &str = "zigbee_power_meter_current";
/// Gauge: cumulative energy in kWh, labeled by device.
pub const METRIC_ENERGY: &str = "zigbee_power_meter_energy_total";
/// Gauge: instantaneous power in watts, labeled by device.
pub const METRIC_POWER: &str = "zigbee_power_meter_power";
/// Gauge: line voltage in volts, labeled by device.
pub const METRIC_VOLTAGE: &str = "zigbee_power_meter_voltage";
/// Gauge: Unix timestamp of the last applied reading, no labels.
pub const METRIC_LAST_UPDATE: &str = "zigbee_last_update";
/// Counter: occurrences per unrecognized topic string.
pub const METRIC_UNKNOWN_TOPIC: &str = "zigbee_unknown_topic";

/// Last observed gauge values for one device. Overwritten wholesale on each
/// applied reading; no aggregation across samples.
#[derive(Debug, Clone, Copy, Default)]
struct DeviceGauges {
    current: f64,
    energy: f64,
    power: f64,
    voltage: f64,
}

/// Registry statistics.
///
/// Internal bookkeeping for the readiness probe and the final shutdown log
/// line. Not part of the exposition output.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Readings decoded and applied to the per-device gauges.
    pub readings_applied: u64,
    /// Messages whose topic did not match the device update pattern.
    pub unknown_topics: u64,
    /// Messages on a recognized topic whose payload did not decode.
    pub undecodable_payloads: u64,
}

impl RegistryStats {
    /// Total messages that went through the processor.
    pub fn messages_processed(&self) -> u64 {
        self.readings_applied + self.unknown_topics + self.undecodable_payloads
    }
}

/// Thread-safe registry of the exporter's metric series.
///
/// One instance exists per process run, created at startup and shared by
/// reference between the ingestion task (writes) and the HTTP server
/// (reads). Each update is independently atomic; a scrape may observe a
/// partially applied reading across different series.
pub struct MetricRegistry {
    /// Per-device gauge snapshots, keyed by device identity.
    devices: RwLock<HashMap<String, DeviceGauges>>,
    /// Monotonic counters keyed by the literal unmatched topic string.
    unknown_topics: RwLock<HashMap<String, u64>>,
    /// Unix timestamp (seconds) of the last applied reading, 0 before any.
    last_update: RwLock<f64>,
    /// Statistics.
    stats: RwLock<RegistryStats>,
}

impl MetricRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            unknown_topics: RwLock::new(HashMap::new()),
            last_update: RwLock::new(0.0),
            stats: RwLock::new(RegistryStats::default()),
        }
    }

    /// Overwrite the four gauges for a device and advance the last-update
    /// timestamp.
    pub fn record_reading(&self, device: &str, reading: &PowerMeterReading) {
        {
            let mut devices = self.devices.write();
            devices.insert(
                device.to_string(),
                DeviceGauges {
                    current: reading.current,
                    energy: reading.energy,
                    power: reading.power,
                    voltage: reading.voltage,
                },
            );
        }

        *self.last_update.write() = unix_timestamp();
        self.stats.write().readings_applied += 1;

        trace!(device, "Applied power meter reading");
    }

    /// Increment the counter for an unrecognized topic. The last-update
    /// timestamp is left untouched.
    pub fn record_unknown_topic(&self, topic: &str) {
        {
            let mut topics = self.unknown_topics.write();
            *topics.entry(topic.to_string()).or_insert(0) += 1;
        }
        self.stats.write().unknown_topics += 1;
    }

    /// Note a payload that failed to decode. No exposed series changes.
    pub fn note_undecodable(&self) {
        self.stats.write().undecodable_payloads += 1;
    }

    /// Number of devices with at least one applied reading.
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    /// Unix timestamp of the last applied reading, 0.0 before any.
    pub fn last_update(&self) -> f64 {
        *self.last_update.read()
    }

    /// Current counter value for an unrecognized topic.
    pub fn unknown_topic_count(&self, topic: &str) -> u64 {
        self.unknown_topics.read().get(topic).copied().unwrap_or(0)
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.stats.read().clone()
    }

    /// Render all series in Prometheus text exposition format.
    ///
    /// Devices and topics are sorted so the output is deterministic.
    pub fn render(&self) -> String {
        let devices = self.devices.read();
        let mut output = Vec::with_capacity(devices.len() * 256);

        let mut names: Vec<&str> = devices.keys().map(String::as_str).collect();
        names.sort_unstable();

        let gauges: [(&str, fn(&DeviceGauges) -> f64); 4] = [
            (METRIC_CURRENT, |g| g.current),
            (METRIC_ENERGY, |g| g.energy),
            (METRIC_POWER, |g| g.power),
            (METRIC_VOLTAGE, |g| g.voltage),
        ];

        for (metric, value_of) in gauges {
            if names.is_empty() {
                continue;
            }
            writeln!(output, "# TYPE {} gauge", metric).ok();
            for name in &names {
                let gauge = &devices[*name];
                writeln!(
                    output,
                    "{}{{device=\"{}\"}} {}",
                    metric,
                    escape_label_value(name),
                    format_value(value_of(gauge))
                )
                .ok();
            }
        }
        drop(devices);

        writeln!(output, "# TYPE {} gauge", METRIC_LAST_UPDATE).ok();
        writeln!(
            output,
            "{} {}",
            METRIC_LAST_UPDATE,
            format_value(self.last_update())
        )
        .ok();

        let topics = self.unknown_topics.read();
        if !topics.is_empty() {
            let mut unknown: Vec<(&str, u64)> =
                topics.iter().map(|(t, n)| (t.as_str(), *n)).collect();
            unknown.sort_unstable_by_key(|(t, _)| *t);

            writeln!(output, "# TYPE {} counter", METRIC_UNKNOWN_TOPIC).ok();
            for (topic, count) in unknown {
                writeln!(
                    output,
                    "{}{{topic=\"{}\"}} {}",
                    METRIC_UNKNOWN_TOPIC,
                    escape_label_value(topic),
                    count
                )
                .ok();
            }
        }

        String::from_utf8(output).unwrap_or_default()
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<MetricRegistry>;

/// Current Unix time in seconds.
fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}
