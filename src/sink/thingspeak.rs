use std::time::Duration;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use tracing::debug;

use super::{format_value, BatchSink, SendError, SinkAck, SinkRecord};
use crate::catalog::Credentials;
use crate::config::SinkConfig;

/// ThingSpeak-style write sink.
///
/// Each record is one `POST {write_url}` with `api_key`, one `fieldN` query
/// parameter per non-null slot, and `created_at`. The response body is the
/// new entry id; `0` means the write was refused.
pub struct ThingSpeakSink {
    http: reqwest::Client,
    write_url: String,
    timeout: Duration,
}

impl ThingSpeakSink {
    pub fn new(cfg: &SinkConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            write_url: cfg.write_url.clone(),
            timeout: cfg.timeout,
        })
    }
}

/// Query parameters for one record.
pub fn query_params(record: &SinkRecord, credentials: &Credentials) -> Vec<(String, String)> {
    let mut params = Vec::with_capacity(record.values.len() + 2);
    params.push(("api_key".to_string(), credentials.write_key.clone()));
    for v in &record.values {
        params.push((v.slot.to_string(), format_value(v.kind, v.value)));
    }
    params.push((
        "created_at".to_string(),
        record.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    ));
    params
}

/// Interprets the response body of a successful request.
fn parse_ack(body: &str) -> SinkAck {
    match body.trim().parse::<u64>() {
        Ok(id) if id > 0 => SinkAck::Accepted { entry_id: id },
        _ => SinkAck::Rejected {
            body: body.trim().chars().take(200).collect(),
        },
    }
}

impl BatchSink for ThingSpeakSink {
    fn name(&self) -> &str {
        "thingspeak"
    }

    async fn write(
        &self,
        record: &SinkRecord,
        credentials: &Credentials,
    ) -> Result<SinkAck, SendError> {
        let params = query_params(record, credentials);

        let resp = self
            .http
            .post(&self.write_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SendError::Timeout(self.timeout)
                } else {
                    SendError::Transport(e)
                }
            })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(SendError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        debug!(key = %record.key, fields = record.values.len(), "wrote record to sink");

        Ok(parse_ack(&body))
    }
}
