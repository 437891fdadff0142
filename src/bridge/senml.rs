//! Minimal SenML pack decoding.
//!
//! Accepts both the legacy layout (`[{"bn": .., "bt": .., "e": [{"n": .., "v": ..}]}]`)
//! and flat RFC 8428 records (`[{"bn": .., "n": .., "v": ..}]`). A single
//! record object is treated as a pack of one.

use serde::Deserialize;

/// Value carried by one SenML entry.
#[derive(Debug, Clone, PartialEq)]
pub enum SenmlValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

/// One decoded measurement with its base name already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub unit: Option<String>,
    pub value: Option<SenmlValue>,
    /// Base time plus entry time, when present.
    pub time: Option<f64>,
}

impl Measurement {
    /// Last `/`-separated segment of the resolved name.
    pub fn field_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Pack {
    Many(Vec<Record>),
    One(Record),
}

#[derive(Debug, Default, Deserialize)]
struct Record {
    #[serde(default)]
    bn: Option<String>,
    #[serde(default)]
    bt: Option<f64>,
    #[serde(default)]
    e: Vec<Entry>,
    #[serde(flatten)]
    entry: Entry,
}

#[derive(Debug, Default, Deserialize)]
struct Entry {
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    u: Option<String>,
    #[serde(default)]
    v: Option<f64>,
    #[serde(default)]
    vb: Option<bool>,
    #[serde(default)]
    vs: Option<String>,
    #[serde(default)]
    t: Option<f64>,
}

impl Entry {
    fn value(&self) -> Option<SenmlValue> {
        if let Some(v) = self.v {
            return Some(SenmlValue::Number(v));
        }
        if let Some(vb) = self.vb {
            return Some(SenmlValue::Bool(vb));
        }
        self.vs.clone().map(SenmlValue::Text)
    }
}

/// Decodes a SenML pack into a flat list of measurements.
///
/// Entries without a resolvable name are skipped.
pub fn parse(payload: &[u8]) -> Result<Vec<Measurement>, serde_json::Error> {
    let records = match serde_json::from_slice::<Pack>(payload)? {
        Pack::Many(records) => records,
        Pack::One(record) => vec![record],
    };

    let mut out = Vec::new();

    for record in &records {
        let base = record
            .bn
            .as_deref()
            .map(|bn| bn.trim_end_matches('/'))
            .unwrap_or("");

        let entries: Vec<&Entry> = if record.e.is_empty() {
            vec![&record.entry]
        } else {
            record.e.iter().collect()
        };

        for entry in entries {
            let name = match (base, entry.n.as_deref()) {
                ("", None) => continue,
                ("", Some(n)) => n.to_string(),
                (b, None) => b.to_string(),
                (b, Some(n)) => format!("{b}/{n}"),
            };

            if entry.value().is_none() {
                continue;
            }

            let time = match (record.bt, entry.t) {
                (None, None) => None,
                (bt, t) => Some(bt.unwrap_or(0.0) + t.unwrap_or(0.0)),
            };

            out.push(Measurement {
                name,
                unit: entry.u.clone(),
                value: entry.value(),
                time,
            });
        }
    }

    Ok(out)
}
