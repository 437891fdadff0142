use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::classify::{FieldUpdate, ResetSignal};
use super::field::{FieldKind, FieldSpec};
use super::registry::{UnitKey, UnitLabel};
use super::scheduler::{FlushPhase, HintEffect, SchedulePolicy};
use super::state::{AggregationState, FieldSnapshot};

/// One key's label and state, guarded by its own lock.
#[derive(Debug)]
pub struct KeyEntry {
    pub label: UnitLabel,
    pub state: AggregationState,
}

/// Result of applying one field update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(FieldKind),
    UnknownField,
}

/// A key the tick found due and moved to `Flushing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueKey {
    pub key: UnitKey,
    pub label: UnitLabel,
}

/// Diagnostic view of one key.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub key: UnitKey,
    pub user: String,
    pub room: String,
    pub phase: FlushPhase,
    pub next_due_in_ms: u64,
    pub since_last_flush_ms: u64,
    pub fields: Vec<FieldSnapshot>,
}

/// In-memory map of key to aggregation state.
///
/// The map itself only guards membership; each entry carries its own mutex,
/// so work on one key never blocks another.
pub struct AggregationTable {
    spec: Arc<FieldSpec>,
    policy: SchedulePolicy,
    entries: DashMap<UnitKey, Arc<Mutex<KeyEntry>>>,
}

impl AggregationTable {
    pub fn new(spec: Arc<FieldSpec>, policy: SchedulePolicy) -> Self {
        Self {
            spec,
            policy,
            entries: DashMap::new(),
        }
    }

    pub fn spec(&self) -> &Arc<FieldSpec> {
        &self.spec
    }

    pub fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &UnitKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the entry for `key`, creating it at `now` if absent.
    fn entry(&self, key: &UnitKey, label: &UnitLabel, now: Instant) -> Arc<Mutex<KeyEntry>> {
        if let Some(e) = self.entries.get(key) {
            return Arc::clone(e.value());
        }
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "tracking new key");
            Arc::new(Mutex::new(KeyEntry {
                label: label.clone(),
                state: AggregationState::new(&self.spec, now, self.policy),
            }))
        });
        Arc::clone(entry.value())
    }

    fn existing(&self, key: &UnitKey) -> Option<Arc<Mutex<KeyEntry>>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Folds one field update into the key's state. Unknown fields are
    /// logged and dropped; the key is still created.
    pub fn apply(
        &self,
        key: &UnitKey,
        label: &UnitLabel,
        update: &FieldUpdate,
        now: Instant,
    ) -> ApplyOutcome {
        let entry = self.entry(key, label, now);

        let Some((idx, def)) = self.spec.lookup(&update.field) else {
            warn!(key = %key, field = %update.field, "unknown field, dropping value");
            return ApplyOutcome::UnknownField;
        };

        entry.lock().state.record(idx, update.reading, now);
        ApplyOutcome::Applied(def.kind)
    }

    /// Adds `n` alerts to the counter field. Returns false when no counter
    /// is configured.
    pub fn apply_alerts(&self, key: &UnitKey, label: &UnitLabel, n: u64, now: Instant) -> bool {
        let entry = self.entry(key, label, now);

        let Some(idx) = self.spec.counter_index() else {
            warn!(key = %key, increments = n, "no counter field configured, dropping alerts");
            return false;
        };

        if n > 0 {
            entry.lock().state.add_to_counter(idx, n);
        }
        true
    }

    /// Zeroes the counter and clears average windows for the key.
    pub fn reset(&self, key: &UnitKey, label: &UnitLabel, signal: &ResetSignal, now: Instant) {
        let entry = self.entry(key, label, now);
        entry.lock().state.reset();
        debug!(
            key = %key,
            timeawake = signal.timeawake.as_deref(),
            timesleep = signal.timesleep.as_deref(),
            "reset applied",
        );
    }

    /// Applies a scheduling hint to the key.
    pub fn hint(&self, key: &UnitKey, label: &UnitLabel, now: Instant) -> HintEffect {
        let entry = self.entry(key, label, now);
        let effect = entry.lock().state.schedule_mut().hint(now, self.policy);
        effect
    }

    /// Moves every key with `now >= next_due` to `Flushing` and returns them.
    pub fn collect_due(&self, now: Instant) -> Vec<DueKey> {
        let entries: Vec<(UnitKey, Arc<Mutex<KeyEntry>>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        entries
            .into_iter()
            .filter_map(|(key, entry)| {
                let mut guard = entry.lock();
                let schedule = guard.state.schedule_mut();
                if schedule.poll(now) && schedule.begin() {
                    Some(DueKey {
                        key,
                        label: guard.label.clone(),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Runs `f` with the key's entry locked. Returns `None` for unknown keys.
    pub fn with_entry<R>(&self, key: &UnitKey, f: impl FnOnce(&mut KeyEntry) -> R) -> Option<R> {
        let entry = self.existing(key)?;
        let mut guard = entry.lock();
        Some(f(&mut guard))
    }

    /// Read-only view of one key.
    pub fn snapshot(&self, key: &UnitKey, now: Instant) -> Option<StateSnapshot> {
        let entry = self.existing(key)?;
        let guard = entry.lock();
        Some(self.render_snapshot(key, &guard, now))
    }

    /// Read-only view of every key, ordered by key.
    pub fn snapshot_all(&self, now: Instant) -> Vec<StateSnapshot> {
        let entries: Vec<(UnitKey, Arc<Mutex<KeyEntry>>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut out: Vec<StateSnapshot> = entries
            .into_iter()
            .map(|(key, entry)| {
                let guard = entry.lock();
                self.render_snapshot(&key, &guard, now)
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    fn render_snapshot(&self, key: &UnitKey, entry: &KeyEntry, now: Instant) -> StateSnapshot {
        let schedule = entry.state.schedule();
        StateSnapshot {
            key: key.clone(),
            user: entry.label.user.clone(),
            room: entry.label.room.clone(),
            phase: schedule.phase(),
            next_due_in_ms: schedule.next_due().saturating_duration_since(now).as_millis() as u64,
            since_last_flush_ms: now.saturating_duration_since(schedule.last_flush()).as_millis()
                as u64,
            fields: entry.state.snapshot(&self.spec, now),
        }
    }
}
