//! MQTT subscription lifecycle and ingestion loop.

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::MqttConfig;
use crate::processor::MessageProcessor;
use crate::topic::SUBSCRIBE_WILDCARD;

/// How long to wait for the broker to acknowledge the subscription.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period for the disconnect packet to flush before the task returns.
const DISCONNECT_LINGER: Duration = Duration::from_millis(250);

/// Capacity of the rumqttc request channel (not the message handoff, which
/// is unbounded).
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Pause before polling again after a transport error, so a flapping broker
/// does not spin the event loop.
const REPOLL_DELAY: Duration = Duration::from_secs(1);

/// Fatal ingestion errors. Both end the run; the operator restarts the
/// process.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The broker could not be reached or rejected the connection.
    #[error("Failed to connect to MQTT broker: {0}")]
    Connect(String),

    /// The broker did not accept the subscription in time.
    #[error("Failed to subscribe to {topic}: {message}")]
    Subscribe { topic: String, message: String },
}

/// Events forwarded from the transport event loop to the consuming task.
enum LinkEvent {
    Connected,
    Subscribed,
    Message(Publish),
    Error(ConnectionError),
}

/// Owns the MQTT session: connect, subscribe, receive, disconnect.
///
/// One instance exists per process run. The session is not recreated after
/// a fatal failure; transport hiccups after the initial connection are left
/// to the client library, which reconnects when polled again.
pub struct MqttSubscriber {
    processor: MessageProcessor,
    config: MqttConfig,
}

impl MqttSubscriber {
    /// Create a new subscriber dispatching to the given processor.
    pub fn new(processor: MessageProcessor, config: MqttConfig) -> Self {
        Self { processor, config }
    }

    /// Build rumqttc options from our config.
    ///
    /// The session is persistent (`clean_session = false`) so the broker
    /// queues QoS 1 messages across restarts.
    fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(
            &self.config.client_id,
            &self.config.broker_host,
            self.config.broker_port,
        );
        opts.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        opts.set_clean_session(false);
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            opts.set_credentials(username, password);
        }
        opts
    }

    /// Run the ingestion loop until the shutdown signal is received or a
    /// fatal connect/subscribe failure occurs.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), IngestError> {
        info!(
            host = %self.config.broker_host,
            port = self.config.broker_port,
            client_id = %self.config.client_id,
            "Connecting to MQTT broker"
        );

        let (client, eventloop) = AsyncClient::new(self.options(), CLIENT_CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = spawn_eventloop(eventloop, tx);

        let result = self.drive(&client, rx, shutdown).await;

        driver.abort();
        result
    }

    /// The session state machine: connecting, subscribing, listening,
    /// disconnecting.
    async fn drive(
        &self,
        client: &AsyncClient,
        mut rx: mpsc::UnboundedReceiver<LinkEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), IngestError> {
        // Connecting: a transport error before the broker acknowledges the
        // connection is fatal, no retry.
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(LinkEvent::Connected) => break,
                    Some(LinkEvent::Error(err)) => {
                        return Err(IngestError::Connect(err.to_string()));
                    }
                    Some(_) => {}
                    None => return Err(IngestError::Connect("event loop closed".to_string())),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
        info!("Connected to MQTT broker");

        // Subscribing: bounded wait for the broker's acknowledgement.
        info!(topic = SUBSCRIBE_WILDCARD, "Subscribing to MQTT topics");
        client
            .subscribe(SUBSCRIBE_WILDCARD, QoS::AtLeastOnce)
            .await
            .map_err(|err| IngestError::Subscribe {
                topic: SUBSCRIBE_WILDCARD.to_string(),
                message: err.to_string(),
            })?;
        self.await_subscribe_ack(&mut rx).await?;

        info!("Waiting for zigbee2mqtt updates");

        // Listening: single consumer, messages dispatched in arrival order,
        // never interrupted mid-message.
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(LinkEvent::Message(publish)) => self.dispatch(&publish),
                    Some(LinkEvent::Error(err)) => {
                        warn!(error = %err, "MQTT connection error, waiting for reconnect");
                    }
                    Some(_) => {}
                    None => {
                        warn!("MQTT event loop closed");
                        return Ok(());
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Disconnecting: best effort, bounded linger for the packet to go
        // out, then report completion to the supervisor via task join.
        info!("Disconnecting from MQTT broker");
        if let Err(err) = client.disconnect().await {
            warn!(error = %err, "Error requesting MQTT disconnect");
        }
        tokio::time::sleep(DISCONNECT_LINGER).await;

        Ok(())
    }

    /// Wait for the SUBACK, processing any messages (e.g. retained ones)
    /// that arrive first. Timeout and broker-side rejection are fatal.
    async fn await_subscribe_ack(
        &self,
        rx: &mut mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Result<(), IngestError> {
        let subscribe_error = |message: &str| IngestError::Subscribe {
            topic: SUBSCRIBE_WILDCARD.to_string(),
            message: message.to_string(),
        };

        let wait = tokio::time::timeout(SUBSCRIBE_TIMEOUT, async {
            while let Some(event) = rx.recv().await {
                match event {
                    LinkEvent::Subscribed => return Ok(()),
                    LinkEvent::Message(publish) => self.dispatch(&publish),
                    LinkEvent::Error(err) => return Err(subscribe_error(&err.to_string())),
                    LinkEvent::Connected => {}
                }
            }
            Err(subscribe_error("event loop closed"))
        })
        .await;

        match wait {
            Ok(result) => result,
            Err(_) => Err(subscribe_error("timed out waiting for acknowledgement")),
        }
    }

    /// Hand one publish packet to the processor.
    fn dispatch(&self, publish: &Publish) {
        let payload = String::from_utf8_lossy(&publish.payload);
        self.processor.process(&publish.topic, &payload);
    }
}

/// Spawn the transport driver task.
///
/// Polls the rumqttc event loop and forwards the events the consumer cares
/// about onto the unbounded handoff channel. Exits when the consumer drops
/// the receiver.
fn spawn_eventloop(
    mut eventloop: EventLoop,
    tx: mpsc::UnboundedSender<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => LinkEvent::Connected,
                Ok(Event::Incoming(Packet::SubAck(_))) => LinkEvent::Subscribed,
                Ok(Event::Incoming(Packet::Publish(publish))) => LinkEvent::Message(publish),
                Ok(_) => continue,
                Err(err) => LinkEvent::Error(err),
            };

            let pause = matches!(event, LinkEvent::Error(_));
            if tx.send(event).is_err() {
                break;
            }
            if pause {
                tokio::time::sleep(REPOLL_DELAY).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricRegistry;
    use std::sync::Arc;

    fn make_subscriber(config: MqttConfig) -> (MqttSubscriber, Arc<MetricRegistry>) {
        let registry = Arc::new(MetricRegistry::new());
        let processor = MessageProcessor::new(registry.clone());
        (MqttSubscriber::new(processor, config), registry)
    }

    #[test]
    fn test_options_from_config() {
        let config = MqttConfig {
            broker_host: "broker.lan".to_string(),
            broker_port: 8883,
            client_id: "exporter-01".to_string(),
            ..MqttConfig::default()
        };
        let (subscriber, _) = make_subscriber(config);

        let opts = subscriber.options();
        assert_eq!(opts.broker_address().0, "broker.lan");
        assert_eq!(opts.broker_address().1, 8883);
        assert!(!opts.clean_session());
    }

    #[test]
    fn test_dispatch_updates_registry() {
        let (subscriber, registry) = make_subscriber(MqttConfig::default());

        let publish = Publish::new(
            "zigbee2mqtt/lamp",
            QoS::AtLeastOnce,
            r#"{"current":0.1,"energy":2.0,"power":23.0,"voltage":230.0}"#,
        );
        subscriber.dispatch(&publish);

        assert_eq!(registry.device_count(), 1);
        assert_eq!(registry.stats().readings_applied, 1);
    }

    #[test]
    fn test_dispatch_non_utf8_payload_is_dropped() {
        let (subscriber, registry) = make_subscriber(MqttConfig::default());

        let publish = Publish::new(
            "zigbee2mqtt/lamp",
            QoS::AtLeastOnce,
            vec![0xff, 0xfe, 0x80],
        );
        subscriber.dispatch(&publish);

        assert_eq!(registry.device_count(), 0);
        assert_eq!(registry.stats().undecodable_payloads, 1);
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown_before_connect() {
        // Point at a port nothing listens on; the shutdown signal must win
        // over the connect attempt.
        let config = MqttConfig {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1,
            ..MqttConfig::default()
        };
        let (subscriber, _) = make_subscriber(config);

        let (tx, rx) = watch::channel(true);
        // Dropping the sender makes changed() resolve with an error, which
        // the loop treats as shutdown.
        drop(tx);

        let result = tokio::time::timeout(Duration::from_secs(2), subscriber.run(rx)).await;
        match result {
            Ok(Ok(())) => {}
            // A refused connection may race the dropped sender; both are
            // acceptable terminal outcomes here.
            Ok(Err(IngestError::Connect(_))) => {}
            Ok(Err(err)) => panic!("unexpected error: {err}"),
            Err(_) => panic!("run did not return"),
        }
    }
}
