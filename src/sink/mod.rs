pub mod thingspeak;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::bridge::field::FieldKind;
use crate::bridge::registry::UnitKey;
use crate::catalog::Credentials;

/// One rendered, non-null slot value.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotValue {
    pub field: Arc<str>,
    pub slot: Arc<str>,
    pub kind: FieldKind,
    pub value: f64,
}

/// A consolidated record for one key, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    pub key: UnitKey,
    pub created_at: DateTime<Utc>,
    pub values: Vec<SlotValue>,
}

impl SinkRecord {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `field=value` pairs for logging.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{}={}", v.field, format_value(v.kind, v.value));
        }
        out
    }
}

/// Sink acknowledgment for a delivered request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkAck {
    /// The sink created a new entry.
    Accepted { entry_id: u64 },
    /// The sink answered but did not create an entry (typically rate limited).
    Rejected { body: String },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Destination for consolidated records.
pub trait BatchSink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Writes one record with the key's credentials.
    fn write(
        &self,
        record: &SinkRecord,
        credentials: &Credentials,
    ) -> impl std::future::Future<Output = Result<SinkAck, SendError>> + Send;
}

/// Wire formatting: averages carry two decimals, integral values are
/// written without a fraction.
pub fn format_value(kind: FieldKind, value: f64) -> String {
    match kind {
        FieldKind::Average => format!("{:.2}", (value * 100.0).round() / 100.0),
        FieldKind::Last | FieldKind::Counter => {
            if value.fract() == 0.0 && value.abs() < 1e15 {
                format!("{}", value as i64)
            } else {
                format!("{value}")
            }
        }
    }
}
