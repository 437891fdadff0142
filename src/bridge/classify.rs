use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::senml::{self, SenmlValue};
use super::topic::TopicPattern;
use crate::config::ChannelsConfig;

/// Channel category a topic pattern belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Telemetry,
    Alert,
    Reset,
    Hint,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Alert => "alert",
            Self::Reset => "reset",
            Self::Hint => "hint",
        }
    }

    fn from_category(category: &str) -> Self {
        match category {
            "reset" => Self::Reset,
            "hint" => Self::Hint,
            "alerts" => Self::Alert,
            _ => Self::Telemetry,
        }
    }
}

/// A decoded reading destined for one field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Number(f64),
    Bool(bool),
}

impl Reading {
    /// Numeric form; booleans become 1.0 / 0.0.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Number(v) => v,
            Self::Bool(true) => 1.0,
            Self::Bool(false) => 0.0,
        }
    }
}

/// One (field name, reading) pair extracted from a telemetry payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub field: String,
    pub reading: Reading,
}

/// Counter reset, optionally carrying new schedule seed values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResetSignal {
    #[serde(default, deserialize_with = "lenient_string")]
    pub timeawake: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timesleep: Option<String>,
}

/// What an inbound message means for its key.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedEvent {
    Fields(Vec<FieldUpdate>),
    Alerts {
        increments: u64,
        /// The payload was not JSON and the raw marker search was used.
        fallback: bool,
    },
    Reset(ResetSignal),
    Hint,
}

/// A classified message with the raw (untrimmed, original case) user and room.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub user: String,
    pub room: String,
    pub channel: ChannelKind,
    pub event: ClassifiedEvent,
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("payload is not valid SenML: {0}")]
    Senml(#[from] serde_json::Error),

    #[error("SenML pack carried no usable field values")]
    NoValues,
}

struct Route {
    kind: ChannelKind,
    pattern: TopicPattern,
}

/// Maps (topic, payload) to a [`Classified`] event.
pub struct Classifier {
    routes: Vec<Route>,
    alert_marker: String,
    aliases: HashMap<String, String>,
}

impl Classifier {
    /// Builds the classifier from channel configuration. Routes are tried in
    /// order reset, hint, alerts, telemetry; the first match wins.
    pub fn new(cfg: &ChannelsConfig) -> Result<Self> {
        let mut routes = Vec::new();

        for (category, patterns) in cfg.categories() {
            let kind = ChannelKind::from_category(category);
            for raw in patterns {
                let pattern = TopicPattern::parse(raw)
                    .with_context(|| format!("invalid topic pattern in channels.{category}"))?;
                routes.push(Route { kind, pattern });
            }
        }

        Ok(Self {
            routes,
            alert_marker: cfg.alert_marker.trim().to_string(),
            aliases: cfg.aliases.clone(),
        })
    }

    /// Distinct MQTT subscription filters for all configured patterns.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut subs: Vec<String> = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let sub = route.pattern.subscription();
            if !subs.contains(&sub) {
                subs.push(sub);
            }
        }
        subs
    }

    /// Classifies one message. `Ok(None)` means the topic matched no
    /// configured pattern.
    pub fn classify(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<Option<Classified>, ClassifyError> {
        let Some((route, captures)) = self
            .routes
            .iter()
            .find_map(|r| r.pattern.matches(topic).map(|c| (r, c)))
        else {
            return Ok(None);
        };

        let event = match route.kind {
            ChannelKind::Telemetry => ClassifiedEvent::Fields(self.decode_fields(payload)?),
            ChannelKind::Alert => self.scan_alerts(payload),
            ChannelKind::Reset => ClassifiedEvent::Reset(decode_reset(payload)),
            ChannelKind::Hint => ClassifiedEvent::Hint,
        };

        Ok(Some(Classified {
            user: captures.user.to_string(),
            room: captures.room.to_string(),
            channel: route.kind,
            event,
        }))
    }

    fn decode_fields(&self, payload: &[u8]) -> Result<Vec<FieldUpdate>, ClassifyError> {
        let measurements = senml::parse(payload)?;

        let updates: Vec<FieldUpdate> = measurements
            .iter()
            .filter_map(|m| {
                let reading = m.value.as_ref().and_then(to_reading)?;
                let name = m.field_name();
                let field = self.aliases.get(name).map(String::as_str).unwrap_or(name);
                Some(FieldUpdate {
                    field: field.to_string(),
                    reading,
                })
            })
            .collect();

        if updates.is_empty() && !measurements.is_empty() {
            return Err(ClassifyError::NoValues);
        }

        Ok(updates)
    }

    fn scan_alerts(&self, payload: &[u8]) -> ClassifiedEvent {
        let structured = serde_json::from_slice::<Value>(payload)
            .ok()
            .and_then(|doc| count_statuses(&doc, &self.alert_marker));

        match structured {
            Some(increments) => ClassifiedEvent::Alerts {
                increments,
                fallback: false,
            },
            None => {
                let text = String::from_utf8_lossy(payload);
                ClassifiedEvent::Alerts {
                    increments: u64::from(text.contains(self.alert_marker.as_str())),
                    fallback: true,
                }
            }
        }
    }
}

/// Counts the top-level `status` plus each `events[].status` equal to the
/// marker. A top-level array is treated as a list of events. Returns `None`
/// when the document carries no string `status` anywhere it is looked for.
fn count_statuses(doc: &Value, marker: &str) -> Option<u64> {
    fn status(v: &Value) -> Option<&str> {
        v.get("status").and_then(Value::as_str)
    }

    let mut statuses: Vec<&str> = Vec::new();
    match doc {
        Value::Object(_) => {
            statuses.extend(status(doc));
            if let Some(events) = doc.get("events").and_then(Value::as_array) {
                statuses.extend(events.iter().filter_map(status));
            }
        }
        Value::Array(events) => statuses.extend(events.iter().filter_map(status)),
        _ => {}
    }

    if statuses.is_empty() {
        return None;
    }
    Some(statuses.iter().filter(|s| **s == marker).count() as u64)
}

fn decode_reset(payload: &[u8]) -> ResetSignal {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return ResetSignal::default();
    }
    serde_json::from_slice(payload).unwrap_or_default()
}

fn to_reading(value: &SenmlValue) -> Option<Reading> {
    match value {
        SenmlValue::Number(v) if v.is_finite() => Some(Reading::Number(*v)),
        SenmlValue::Number(_) => None,
        SenmlValue::Bool(b) => Some(Reading::Bool(*b)),
        SenmlValue::Text(s) => parse_text(s),
    }
}

/// Accepts `true|on|1` / `false|off|0` (any case) and plain numbers.
fn parse_text(s: &str) -> Option<Reading> {
    let s = s.trim();
    match s.to_ascii_lowercase().as_str() {
        "true" | "on" => return Some(Reading::Bool(true)),
        "false" | "off" => return Some(Reading::Bool(false)),
        _ => {}
    }
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(Reading::Number)
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
