//! Telemetry aggregation core.
//!
//! Inbound messages are classified and folded into the per-key
//! [`AggregationTable`]; a fixed tick moves due keys to `Flushing` and the
//! [`Publisher`] writes one consolidated record per key to the sink.

pub mod classify;
pub mod field;
pub mod publisher;
pub mod registry;
pub mod scheduler;
pub mod senml;
pub mod state;
pub mod table;
pub mod topic;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::classify::{ChannelKind, ClassifiedEvent, ClassifyError, Classifier};
use self::publisher::{FlushOutcome, Publisher};
use self::registry::{KeyRegistry, UnitKey};
use self::table::{AggregationTable, ApplyOutcome, DueKey};
use crate::catalog::CatalogClient;
use crate::export::health::HealthMetrics;
use crate::sink::BatchSink;
use crate::source::InboundMessage;

/// What ingesting one message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The event was applied to `key`.
    Applied { key: UnitKey, channel: ChannelKind },
    /// No configured pattern matched the topic.
    Unrecognized,
    /// The payload could not be decoded.
    Malformed,
    /// The topic carried an empty user or room.
    BlankKey,
}

/// Ingestion and flush entry points over shared state.
pub struct Pipeline<C, S> {
    classifier: Arc<Classifier>,
    registry: Arc<KeyRegistry<C>>,
    table: Arc<AggregationTable>,
    publisher: Arc<Publisher<C, S>>,
    health: Option<Arc<HealthMetrics>>,
}

impl<C, S> Clone for Pipeline<C, S> {
    fn clone(&self) -> Self {
        Self {
            classifier: Arc::clone(&self.classifier),
            registry: Arc::clone(&self.registry),
            table: Arc::clone(&self.table),
            publisher: Arc::clone(&self.publisher),
            health: self.health.clone(),
        }
    }
}

impl<C: CatalogClient, S: BatchSink> Pipeline<C, S> {
    pub fn new(
        classifier: Arc<Classifier>,
        registry: Arc<KeyRegistry<C>>,
        table: Arc<AggregationTable>,
        sink: Arc<S>,
        send_timeout: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        let publisher = Arc::new(Publisher::new(
            Arc::clone(&table),
            Arc::clone(&registry),
            sink,
            send_timeout,
            health.clone(),
        ));

        Self {
            classifier,
            registry,
            table,
            publisher,
            health,
        }
    }

    pub fn table(&self) -> &Arc<AggregationTable> {
        &self.table
    }

    pub fn registry(&self) -> &Arc<KeyRegistry<C>> {
        &self.registry
    }

    /// Classifies one message and applies it to its key's state.
    pub fn ingest(&self, msg: &InboundMessage, now: Instant) -> IngestOutcome {
        let classified = match self.classifier.classify(&msg.topic, &msg.payload) {
            Ok(Some(c)) => c,
            Ok(None) => {
                if let Some(ref h) = self.health {
                    h.messages_unrecognized.inc();
                }
                debug!(topic = %msg.topic, "no channel matches topic");
                return IngestOutcome::Unrecognized;
            }
            Err(e) => {
                if let Some(ref h) = self.health {
                    let reason = match &e {
                        ClassifyError::Senml(_) => "senml",
                        ClassifyError::NoValues => "no_values",
                    };
                    h.decode_errors.with_label_values(&[reason]).inc();
                }
                debug!(topic = %msg.topic, error = %e, "dropping malformed payload");
                return IngestOutcome::Malformed;
            }
        };

        let Some((key, label)) = self.registry.intern(&classified.user, &classified.room) else {
            debug!(topic = %msg.topic, "blank user or room, dropping message");
            return IngestOutcome::BlankKey;
        };

        let channel = classified.channel;
        debug!(key = %key, channel = channel.as_str(), "classified message");

        match classified.event {
            ClassifiedEvent::Fields(updates) => {
                for update in &updates {
                    let outcome = self.table.apply(&key, &label, update, now);
                    if outcome == ApplyOutcome::UnknownField {
                        if let Some(ref h) = self.health {
                            h.unknown_fields.inc();
                        }
                    }
                }
            }
            ClassifiedEvent::Alerts {
                increments,
                fallback,
            } => {
                let counted = self.table.apply_alerts(&key, &label, increments, now);
                debug!(key = %key, increments, fallback, "alert message");
                if counted {
                    if let Some(ref h) = self.health {
                        h.alerts_counted.inc_by(increments as f64);
                    }
                }
            }
            ClassifiedEvent::Reset(signal) => {
                self.table.reset(&key, &label, &signal, now);
                info!(
                    key = %key,
                    timeawake = signal.timeawake.as_deref().unwrap_or("-"),
                    timesleep = signal.timesleep.as_deref().unwrap_or("-"),
                    "counter reset",
                );
                if let Some(ref h) = self.health {
                    h.resets.inc();
                }
            }
            ClassifiedEvent::Hint => {
                let effect = self.table.hint(&key, &label, now);
                debug!(key = %key, effect = effect.as_str(), "scheduling hint");
                if let Some(ref h) = self.health {
                    h.hints.with_label_values(&[effect.as_str()]).inc();
                }
            }
        }

        if let Some(ref h) = self.health {
            h.messages_by_channel
                .with_label_values(&[channel.as_str()])
                .inc();
            h.keys_tracked.set(self.table.len() as f64);
        }

        IngestOutcome::Applied { key, channel }
    }

    /// Moves due keys to `Flushing`.
    pub fn collect_due(&self, now: Instant) -> Vec<DueKey> {
        self.table.collect_due(now)
    }

    /// Flushes one key previously returned by [`collect_due`](Self::collect_due).
    pub async fn flush(&self, key: &UnitKey, started_at: Instant) -> FlushOutcome {
        if let Some(ref h) = self.health {
            h.flushes_in_flight.inc();
        }

        let outcome = self.publisher.flush(key, started_at).await;

        if let Some(ref h) = self.health {
            h.flushes_in_flight.dec();
            h.flush_duration.observe(started_at.elapsed().as_secs_f64());
        }

        outcome
    }
}

/// Runs ingestion and the flush tick until cancelled.
pub struct Bridge<C, S> {
    pipeline: Pipeline<C, S>,
    tick_interval: Duration,
    max_concurrent_flushes: usize,
    tx: mpsc::Sender<InboundMessage>,
    rx: Option<mpsc::Receiver<InboundMessage>>,
    run_task: Option<tokio::task::JoinHandle<()>>,
}

impl<C, S> Bridge<C, S>
where
    C: CatalogClient + 'static,
    S: BatchSink + 'static,
{
    pub fn new(
        pipeline: Pipeline<C, S>,
        tick_interval: Duration,
        max_concurrent_flushes: usize,
        channel_capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));

        Self {
            pipeline,
            tick_interval,
            max_concurrent_flushes: max_concurrent_flushes.max(1),
            tx,
            rx: Some(rx),
            run_task: None,
        }
    }

    /// Sender for inbound messages.
    pub fn sender(&self) -> mpsc::Sender<InboundMessage> {
        self.tx.clone()
    }

    pub fn pipeline(&self) -> &Pipeline<C, S> {
        &self.pipeline
    }

    /// Spawns the run loop.
    pub fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let Some(mut rx) = self.rx.take() else {
            anyhow::bail!("bridge already started");
        };

        let pipeline = self.pipeline.clone();
        let tick_interval = self.tick_interval;
        let permits = Arc::new(Semaphore::new(self.max_concurrent_flushes));

        let run_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut in_flight: JoinSet<()> = JoinSet::new();

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => break,

                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            pipeline.ingest(&msg, Instant::now());
                        }
                        None => {
                            info!("inbound channel closed");
                            break;
                        }
                    },

                    _ = ticker.tick() => {
                        for due in pipeline.collect_due(Instant::now()) {
                            let pipeline = pipeline.clone();
                            let permits = Arc::clone(&permits);
                            in_flight.spawn(async move {
                                let Ok(_permit) = permits.acquire_owned().await else {
                                    warn!(key = %due.key, "flush limiter closed");
                                    return;
                                };
                                pipeline.flush(&due.key, Instant::now()).await;
                            });
                        }
                    }

                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Err(e) = joined {
                            warn!(error = %e, "flush task failed");
                        }
                    }
                }
            }

            let pending = in_flight.len();
            if pending > 0 {
                info!(pending, "waiting for in-flight flushes");
            }
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "flush task failed");
                }
            }
        });
        self.run_task = Some(run_task);

        info!(
            tick = ?self.tick_interval,
            max_concurrent_flushes = self.max_concurrent_flushes,
            "bridge started"
        );

        Ok(())
    }

    /// Waits for the run loop to finish after cancellation.
    pub async fn wait_for_shutdown(&mut self) {
        if let Some(run_task) = self.run_task.take() {
            if let Err(e) = run_task.await {
                warn!(error = %e, "bridge task join failed");
            }
        }
    }
}
