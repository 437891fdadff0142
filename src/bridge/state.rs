use std::time::Instant;

use serde::Serialize;

use super::classify::Reading;
use super::field::{FieldKind, FieldSpec};
use super::scheduler::{Schedule, SchedulePolicy};

/// Running mean over one flush window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageSlot {
    sum: f64,
    count: u64,
    /// Mean reported by the last successful flush.
    carried: Option<f64>,
}

/// Samples checked out of an [`AverageSlot`] by an in-flight flush.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Window {
    pub sum: f64,
    pub count: u64,
}

impl Window {
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

impl AverageSlot {
    pub fn record(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Current window mean, or the carried value when the window is empty.
    pub fn value(&self) -> Option<f64> {
        self.window().mean().or(self.carried)
    }

    fn window(&self) -> Window {
        assert!(
            self.count > 0 || self.sum == 0.0,
            "average accumulator has sum {} with zero samples",
            self.sum
        );
        Window {
            sum: self.sum,
            count: self.count,
        }
    }

    fn take(&mut self) -> Window {
        let w = self.window();
        self.clear();
        w
    }

    fn merge(&mut self, w: Window) {
        self.sum += w.sum;
        self.count += w.count;
    }

    fn clear(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct LastSlot {
    value: Option<f64>,
    observed_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Average(AverageSlot),
    Last(LastSlot),
    Counter(u64),
}

impl Slot {
    fn for_kind(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Average => Self::Average(AverageSlot::default()),
            FieldKind::Last => Self::Last(LastSlot::default()),
            FieldKind::Counter => Self::Counter(0),
        }
    }

    fn value(&self) -> Option<f64> {
        match self {
            Self::Average(a) => a.value(),
            Self::Last(l) => l.value,
            Self::Counter(n) => Some(*n as f64),
        }
    }
}

/// Values rendered for one flush plus the average windows it consumed.
///
/// Produced under the key lock by [`AggregationState::checkout`] and handed
/// back through [`AggregationState::commit`] or [`AggregationState::restore`].
#[derive(Debug, Clone)]
pub struct Checkout {
    /// Rendered value per field index.
    pub values: Vec<Option<f64>>,
    windows: Vec<Option<Window>>,
    epoch: u64,
}

impl Checkout {
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }

    /// Total average samples consumed by this checkout.
    pub fn samples(&self) -> u64 {
        self.windows.iter().flatten().map(|w| w.count).sum()
    }
}

/// Aggregation and scheduling state of one key.
#[derive(Debug, Clone)]
pub struct AggregationState {
    slots: Vec<Slot>,
    schedule: Schedule,
    /// Bumped by every reset; a checkout from an older epoch is not merged back.
    epoch: u64,
}

impl AggregationState {
    pub fn new(spec: &FieldSpec, now: Instant, policy: SchedulePolicy) -> Self {
        Self {
            slots: spec.fields().iter().map(|f| Slot::for_kind(f.kind)).collect(),
            schedule: Schedule::new(now, policy),
            epoch: 0,
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut Schedule {
        &mut self.schedule
    }

    /// Folds one reading into the field at `idx`.
    pub fn record(&mut self, idx: usize, reading: Reading, now: Instant) {
        match &mut self.slots[idx] {
            Slot::Average(a) => a.record(reading.as_f64()),
            Slot::Last(l) => {
                l.value = Some(reading.as_f64());
                l.observed_at = Some(now);
            }
            Slot::Counter(n) => *n += 1,
        }
    }

    /// Adds `n` to the counter at `idx`.
    pub fn add_to_counter(&mut self, idx: usize, n: u64) {
        match &mut self.slots[idx] {
            Slot::Counter(c) => *c = c.saturating_add(n),
            other => panic!("field {idx} is not a counter: {other:?}"),
        }
    }

    /// Zeroes the counter and clears every average window. LAST values and
    /// carried averages are kept. Idempotent.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            match slot {
                Slot::Average(a) => a.clear(),
                Slot::Counter(c) => *c = 0,
                Slot::Last(_) => {}
            }
        }
        self.epoch += 1;
    }

    /// Renders the current values and takes the average windows. Samples
    /// recorded after this call belong to the next window.
    pub fn checkout(&mut self) -> Checkout {
        let values = self.slots.iter().map(Slot::value).collect();
        let windows = self
            .slots
            .iter_mut()
            .map(|slot| match slot {
                Slot::Average(a) => Some(a.take()),
                _ => None,
            })
            .collect();

        Checkout {
            values,
            windows,
            epoch: self.epoch,
        }
    }

    /// Successful publish: reported averages become the carried values.
    pub fn commit(&mut self, checkout: &Checkout) {
        for (slot, window) in self.slots.iter_mut().zip(&checkout.windows) {
            if let (Slot::Average(a), Some(w)) = (slot, window) {
                if let Some(mean) = w.mean() {
                    a.carried = Some(mean);
                }
            }
        }
    }

    /// Failed publish: checked-out samples are merged into the current
    /// window, unless a reset happened in between. Returns whether the
    /// samples were merged.
    pub fn restore(&mut self, checkout: Checkout) -> bool {
        if checkout.epoch != self.epoch {
            return false;
        }
        for (slot, window) in self.slots.iter_mut().zip(checkout.windows) {
            if let (Slot::Average(a), Some(w)) = (slot, window) {
                a.merge(w);
            }
        }
        true
    }

    /// Read-only view for diagnostics.
    pub fn snapshot(&self, spec: &FieldSpec, now: Instant) -> Vec<FieldSnapshot> {
        spec.fields()
            .iter()
            .zip(&self.slots)
            .map(|(def, slot)| {
                let (samples, age) = match slot {
                    Slot::Average(a) => (Some(a.count), None),
                    Slot::Last(l) => (
                        None,
                        l.observed_at.map(|t| now.saturating_duration_since(t)),
                    ),
                    Slot::Counter(_) => (None, None),
                };
                FieldSnapshot {
                    name: def.name.to_string(),
                    slot: def.slot.to_string(),
                    kind: def.kind,
                    value: slot.value(),
                    samples,
                    age_ms: age.map(|d| d.as_millis() as u64),
                }
            })
            .collect()
    }
}

/// Diagnostic view of one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSnapshot {
    pub name: String,
    pub slot: String,
    pub kind: FieldKind,
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_ms: Option<u64>,
}
