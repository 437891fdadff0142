use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::FieldConfig;

/// How samples for one field are folded into a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Running sum and sample count, reported as the mean.
    Average,
    /// Most recent observation, never cleared by a flush.
    Last,
    /// Monotonic alert count, cleared only by an explicit reset.
    Counter,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Last => "last",
            Self::Counter => "counter",
        }
    }
}

/// One configured field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: Arc<str>,
    pub slot: Arc<str>,
    pub kind: FieldKind,
}

/// Immutable field name to (slot, kind) mapping shared by every key.
///
/// Field indices are stable for the lifetime of the process and index the
/// per-key slot vector in [`AggregationState`](super::state::AggregationState).
#[derive(Debug, Clone)]
pub struct FieldSpec {
    fields: Vec<FieldDef>,
    index: HashMap<Arc<str>, usize>,
    counter: Option<usize>,
}

impl FieldSpec {
    /// Builds the lookup from the configured field map.
    pub fn new(fields: &BTreeMap<String, FieldConfig>) -> Result<Self> {
        let mut defs = Vec::with_capacity(fields.len());
        let mut index = HashMap::with_capacity(fields.len());
        let mut counter = None;

        for (name, field) in fields {
            let name: Arc<str> = Arc::from(name.as_str());
            let idx = defs.len();

            if field.kind == FieldKind::Counter {
                if counter.is_some() {
                    bail!("at most one counter field may be configured");
                }
                counter = Some(idx);
            }

            if defs.iter().any(|d: &FieldDef| *d.slot == *field.slot) {
                bail!("sink slot {} is used by more than one field", field.slot);
            }

            index.insert(Arc::clone(&name), idx);
            defs.push(FieldDef {
                name,
                slot: Arc::from(field.slot.as_str()),
                kind: field.kind,
            });
        }

        if defs.is_empty() {
            bail!("at least one field must be configured");
        }

        Ok(Self {
            fields: defs,
            index,
            counter,
        })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn get(&self, idx: usize) -> Option<&FieldDef> {
        self.fields.get(idx)
    }

    /// Looks up a field by its exact name.
    pub fn lookup(&self, name: &str) -> Option<(usize, &FieldDef)> {
        let idx = *self.index.get(name)?;
        Some((idx, &self.fields[idx]))
    }

    /// Index of the single counter field, if one is configured.
    pub fn counter_index(&self) -> Option<usize> {
        self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(slot: &str, kind: FieldKind) -> FieldConfig {
        FieldConfig {
            slot: slot.to_string(),
            kind,
        }
    }

    #[test]
    fn test_spec_from_default_fields() {
        let spec = FieldSpec::new(&crate::config::default_fields()).expect("spec");
        assert_eq!(spec.len(), 8);

        let (_, temp) = spec.lookup("temp").expect("temp");
        assert_eq!(&*temp.slot, "field1");
        assert_eq!(temp.kind, FieldKind::Average);

        let counter = spec.counter_index().expect("counter");
        assert_eq!(&*spec.fields()[counter].name, "alerts");
    }

    #[test]
    fn test_lookup_is_case_sensitive() {
        let spec = FieldSpec::new(&crate::config::default_fields()).expect("spec");
        assert!(spec.lookup("LedL").is_some());
        assert!(spec.lookup("ledl").is_none());
        assert!(spec.lookup("co2").is_none());
    }

    #[test]
    fn test_rejects_two_counters() {
        let fields = BTreeMap::from([
            ("a".to_string(), field("field1", FieldKind::Counter)),
            ("b".to_string(), field("field2", FieldKind::Counter)),
        ]);
        assert!(FieldSpec::new(&fields).is_err());
    }

    #[test]
    fn test_rejects_duplicate_slots() {
        let fields = BTreeMap::from([
            ("a".to_string(), field("field1", FieldKind::Average)),
            ("b".to_string(), field("field1", FieldKind::Last)),
        ]);
        assert!(FieldSpec::new(&fields).is_err());
    }

    #[test]
    fn test_rejects_empty() {
        assert!(FieldSpec::new(&BTreeMap::new()).is_err());
    }

    #[test]
    fn test_kind_deserializes_snake_case() {
        let kind: FieldKind = serde_yaml::from_str("counter").expect("kind");
        assert_eq!(kind, FieldKind::Counter);
        assert_eq!(kind.as_str(), "counter");
    }
}
