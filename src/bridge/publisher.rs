use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::field::FieldSpec;
use super::registry::{KeyRegistry, Resolution, UnitKey};
use super::state::Checkout;
use super::table::AggregationTable;
use crate::catalog::{CatalogClient, Credentials};
use crate::export::health::HealthMetrics;
use crate::sink::{BatchSink, SendError, SinkAck, SinkRecord, SlotValue};

/// How one flush ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The sink created an entry.
    Published { entry_id: u64 },
    /// Every slot was null; nothing was sent.
    Empty,
    /// The sink answered without creating an entry.
    Rejected,
    /// Transport error, bad status or timeout.
    Failed,
    /// No credentials for the key; the cycle was skipped.
    NoCredentials,
    /// The key is not in the table.
    Unknown,
}

impl FlushOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Published { .. } => "published",
            Self::Empty => "empty",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::NoCredentials => "no_credentials",
            Self::Unknown => "unknown",
        }
    }
}

/// Renders a key's state into a sink record, sends it, and rolls the state
/// over according to the acknowledgment.
pub struct Publisher<C, S> {
    table: Arc<AggregationTable>,
    registry: Arc<KeyRegistry<C>>,
    sink: Arc<S>,
    send_timeout: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl<C: CatalogClient, S: BatchSink> Publisher<C, S> {
    pub fn new(
        table: Arc<AggregationTable>,
        registry: Arc<KeyRegistry<C>>,
        sink: Arc<S>,
        send_timeout: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            table,
            registry,
            sink,
            send_timeout,
            health,
        }
    }

    /// Flushes one key that the tick moved to `Flushing`. Whenever a sink
    /// attempt is made, the moment of the write (never earlier than
    /// `started_at`) becomes the key's `last_flush`.
    pub async fn flush(&self, key: &UnitKey, started_at: Instant) -> FlushOutcome {
        let policy = self.table.policy();

        let credentials = match self.registry.resolve(key).await {
            Resolution::Found(c) => c,
            Resolution::NotFound => {
                let known = self
                    .table
                    .with_entry(key, |e| e.state.schedule_mut().defer(started_at, policy))
                    .is_some();
                warn!(key = %key, "no credentials, skipping flush cycle");
                return self.finish(if known {
                    FlushOutcome::NoCredentials
                } else {
                    FlushOutcome::Unknown
                });
            }
        };

        let spec = Arc::clone(self.table.spec());
        let Some(checkout) = self.table.with_entry(key, |e| e.state.checkout()) else {
            return self.finish(FlushOutcome::Unknown);
        };

        let record = render(key, &spec, &checkout);

        if record.is_empty() {
            debug!(key = %key, "nothing to publish");
            self.table.with_entry(key, |e| {
                e.state.commit(&checkout);
                e.state.schedule_mut().complete(started_at, policy);
            });
            return self.finish(FlushOutcome::Empty);
        }

        let sent_at = started_at.max(Instant::now());
        let result = self.send(&record, &credentials).await;

        let outcome = match result {
            Ok(SinkAck::Accepted { entry_id }) => {
                info!(
                    key = %key,
                    sink = self.sink.name(),
                    entry_id,
                    samples = checkout.samples(),
                    record = %record.summary(),
                    "published record",
                );
                self.table.with_entry(key, |e| {
                    e.state.commit(&checkout);
                    e.state.schedule_mut().complete(sent_at, policy);
                });
                FlushOutcome::Published { entry_id }
            }
            Ok(SinkAck::Rejected { body }) => {
                let merged = self.roll_back(key, checkout, sent_at);
                warn!(
                    key = %key,
                    sink = self.sink.name(),
                    response = %body,
                    samples_kept = merged,
                    "sink rejected record",
                );
                FlushOutcome::Rejected
            }
            Err(e) => {
                if matches!(&e, SendError::Status { status: 401 | 403, .. }) {
                    self.registry.invalidate(key);
                }
                let merged = self.roll_back(key, checkout, sent_at);
                warn!(
                    key = %key,
                    sink = self.sink.name(),
                    error = %e,
                    samples_kept = merged,
                    "sink write failed",
                );
                FlushOutcome::Failed
            }
        };

        self.finish(outcome)
    }

    async fn send(
        &self,
        record: &SinkRecord,
        credentials: &Credentials,
    ) -> Result<SinkAck, SendError> {
        let write = self.sink.write(record, credentials);
        match tokio::time::timeout(self.send_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(self.send_timeout)),
        }
    }

    /// Merges checked-out samples back and advances the schedule.
    fn roll_back(&self, key: &UnitKey, checkout: Checkout, sent_at: Instant) -> bool {
        let policy = self.table.policy();
        self.table
            .with_entry(key, |e| {
                let merged = e.state.restore(checkout);
                e.state.schedule_mut().complete(sent_at, policy);
                merged
            })
            .unwrap_or(false)
    }

    fn finish(&self, outcome: FlushOutcome) -> FlushOutcome {
        if let Some(ref h) = self.health {
            h.flushes.with_label_values(&[outcome.as_str()]).inc();
        }
        outcome
    }
}

/// Builds the sink record from a checkout. Null slots are omitted.
pub fn render(key: &UnitKey, spec: &FieldSpec, checkout: &Checkout) -> SinkRecord {
    let values = spec
        .fields()
        .iter()
        .zip(&checkout.values)
        .filter_map(|(def, value)| {
            value.map(|v| SlotValue {
                field: Arc::clone(&def.name),
                slot: Arc::clone(&def.slot),
                kind: def.kind,
                value: v,
            })
        })
        .collect();

    SinkRecord {
        key: key.clone(),
        created_at: Utc::now(),
        values,
    }
}
