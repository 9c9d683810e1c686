//! Prometheus exporter for zigbee2mqtt power meter telemetry.
//!
//! This crate subscribes to the `zigbee2mqtt/#` MQTT topic tree, decodes
//! power meter payloads, and exposes the latest observed values as gauges
//! on an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   MQTT Broker   │────>│    Processor    │────>│   HTTP Server   │
//! │ (zigbee2mqtt/#) │     │   (registry)    │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! Messages flow from the broker through a single ingestion task into the
//! shared [`registry::MetricRegistry`]; scrapes read the registry
//! concurrently. Per-device gauges are last-write-wins; unrecognized topics
//! are counted, never dropped silently.
//!
//! # Usage
//!
//! Run the exporter binary, optionally with a configuration file:
//!
//! ```bash
//! zigbee2mqtt-exporter-prometheus --config exporter.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod http;
pub mod payload;
pub mod processor;
pub mod registry;
pub mod subscriber;
pub mod topic;

pub use config::ExporterConfig;
pub use http::HttpServer;
pub use payload::PowerMeterReading;
pub use processor::{MessageProcessor, ProcessOutcome};
pub use registry::{MetricRegistry, SharedRegistry};
pub use subscriber::MqttSubscriber;
