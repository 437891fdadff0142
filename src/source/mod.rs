//! MQTT ingestion.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::export::health::HealthMetrics;

/// Delay before polling again after a connection error.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// One raw message as received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Subscribes to the configured filters and forwards every publish to the
/// bridge. Filters are re-subscribed on every (re)connect.
pub struct MqttSource {
    cfg: MqttConfig,
    subscriptions: Vec<String>,
    health: Option<Arc<HealthMetrics>>,
    run_task: Option<tokio::task::JoinHandle<()>>,
}

impl MqttSource {
    pub fn new(
        cfg: &MqttConfig,
        subscriptions: Vec<String>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            cfg: cfg.clone(),
            subscriptions,
            health,
            run_task: None,
        }
    }

    /// Spawns the event loop. Messages are sent to `tx`; the loop waits for
    /// capacity rather than dropping.
    pub fn start(
        &mut self,
        ctx: CancellationToken,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<()> {
        if self.run_task.is_some() {
            bail!("MQTT source already started");
        }

        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(&self.cfg), self.cfg.channel_capacity);
        let subscriptions = self.subscriptions.clone();
        let health = self.health.clone();

        let run_task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = ctx.cancelled() => break,
                    event = eventloop.poll() => event,
                };

                match event {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        info!(
                            code = ?ack.code,
                            subscriptions = subscriptions.len(),
                            "connected to MQTT broker"
                        );
                        if let Some(ref h) = health {
                            h.mqtt_connected.set(1.0);
                        }
                        for filter in &subscriptions {
                            if let Err(e) =
                                client.try_subscribe(filter.as_str(), QoS::AtLeastOnce)
                            {
                                warn!(filter = %filter, error = %e, "subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Some(ref h) = health {
                            h.messages_received.inc();
                        }
                        let msg = InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload.to_vec(),
                        };
                        let sent = tokio::select! {
                            _ = ctx.cancelled() => break,
                            sent = tx.send(msg) => sent,
                        };
                        if sent.is_err() {
                            info!("bridge stopped receiving, closing MQTT source");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        debug!(pkid = ack.pkid, "subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "MQTT connection error, retrying");
                        if let Some(ref h) = health {
                            h.mqtt_connected.set(0.0);
                        }
                        tokio::select! {
                            _ = ctx.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        }
                    }
                }
            }

            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "MQTT disconnect request not queued");
            }
            if let Some(ref h) = health {
                h.mqtt_connected.set(0.0);
            }
        });
        self.run_task = Some(run_task);

        info!(
            host = %self.cfg.host,
            port = self.cfg.port,
            client_id = %self.cfg.client_id,
            "MQTT source started"
        );

        Ok(())
    }

    /// Waits for the event loop to exit after cancellation.
    pub async fn wait_for_shutdown(&mut self) {
        if let Some(run_task) = self.run_task.take() {
            if let Err(e) = run_task.await {
                warn!(error = %e, "MQTT source task join failed");
            }
        }
    }
}

fn mqtt_options(cfg: &MqttConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(cfg.client_id.as_str(), cfg.host.as_str(), cfg.port);
    opts.set_keep_alive(cfg.keep_alive);
    opts.set_clean_session(true);
    opts
}
