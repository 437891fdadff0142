use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::bridge::registry::UnitLabel;
use crate::config::CatalogConfig;

/// Publishing credentials for one (user, room).
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub write_key: String,
    pub channel_id: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("write_key", &"<redacted>")
            .field("channel_id", &self.channel_id)
            .finish()
    }
}

/// Service description sent on self-registration.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRegistration {
    #[serde(rename = "serviceID")]
    pub service_id: String,
    #[serde(rename = "MQTT_sub")]
    pub subscriptions: Vec<String>,
    #[serde(rename = "MQTT_pub")]
    pub publications: Vec<String>,
}

/// Callback type for recording catalog request metrics.
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Catalog service API trait.
pub trait CatalogClient: Send + Sync {
    /// Look up the credentials for one (user, room). `Ok(None)` when the
    /// catalog has no usable entry.
    fn fetch_credentials(
        &self,
        label: &UnitLabel,
    ) -> impl std::future::Future<Output = Result<Option<Credentials>>> + Send;

    /// Fetch credentials for every (user, room) listed in the catalog.
    fn fetch_all_credentials(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<(UnitLabel, Credentials)>>> + Send;
}

/// HTTP-based catalog client.
pub struct Client {
    http: reqwest::Client,
    base: Url,
    write_token: Option<String>,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new catalog client.
    pub fn new(cfg: &CatalogConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let base = Url::parse(&cfg.url)
            .with_context(|| format!("parsing catalog url {}", cfg.url))?;
        if base.cannot_be_a_base() {
            bail!("catalog url {} cannot carry a path", cfg.url);
        }

        Ok(Self {
            http,
            base,
            write_token: cfg.write_token.clone(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (endpoint_name, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    /// Appends percent-encoded path segments to the base URL.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("catalog url {} cannot carry a path", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET a JSON document. `Ok(None)` on 404.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        segments: &[&str],
    ) -> Result<Option<T>> {
        let start = Instant::now();
        let endpoint = endpoint_name(segments);
        let url = self.url(segments)?;
        let path = url.path().to_string();

        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("requesting {path}"))?;

        let status_code = response.status();

        if status_code == StatusCode::NOT_FOUND {
            self.record_request(endpoint, "not_found", start.elapsed());
            return Ok(None);
        }

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(endpoint, "error", start.elapsed());
            bail!("unexpected status {} from {}: {}", status_code, path, body);
        }

        let result: T = response
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"))?;

        self.record_request(endpoint, "success", start.elapsed());

        Ok(Some(result))
    }

    /// Register (or refresh) this service in the catalog. Tries an update
    /// first and falls back to creating the entry when it does not exist.
    pub async fn register_service(&self, service: &ServiceRegistration) -> Result<()> {
        let start = Instant::now();
        let put_url = self.url(&["services", &service.service_id])?;

        let response = self
            .with_token(self.http.put(put_url))
            .json(service)
            .send()
            .await
            .context("updating service entry")?;

        let response = if response.status() == StatusCode::NOT_FOUND {
            let post_url = self.url(&["services"])?;
            self.with_token(self.http.post(post_url))
                .json(service)
                .send()
                .await
                .context("creating service entry")?
        } else {
            response
        };

        let status_code = response.status();
        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request("services", "error", start.elapsed());
            bail!("service registration returned {status_code}: {body}");
        }

        self.record_request("services", "success", start.elapsed());
        info!(service_id = %service.service_id, "registered service in catalog");

        Ok(())
    }

    fn with_token(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.write_token {
            Some(token) => req.header("X-Write-Token", token),
            None => req,
        }
    }
}

/// Extract a short endpoint name from API path segments.
fn endpoint_name(segments: &[&str]) -> &'static str {
    match segments.first().copied() {
        Some("users") => "users",
        Some("catalog") => "catalog",
        Some("services") => "services",
        _ => "other",
    }
}

// --- JSON response structures ---

#[derive(Debug, Deserialize)]
struct UserDocument {
    #[serde(rename = "userID", default)]
    user_id: Option<String>,
    #[serde(rename = "roomID", default)]
    room_id: Option<String>,
    #[serde(default)]
    thingspeak_info: Option<ThingSpeakInfo>,
}

#[derive(Debug, Deserialize)]
struct ThingSpeakInfo {
    #[serde(default)]
    apikeys: Vec<String>,
    #[serde(default)]
    channel: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(rename = "usersList", default)]
    users: Vec<UserDocument>,
}

impl UserDocument {
    fn credentials(&self) -> Option<Credentials> {
        let info = self.thingspeak_info.as_ref()?;
        let write_key = info.apikeys.iter().find(|k| !k.trim().is_empty())?;
        let channel_id = match &info.channel {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };
        Some(Credentials {
            write_key: write_key.trim().to_string(),
            channel_id,
        })
    }
}

impl CatalogClient for Client {
    async fn fetch_credentials(&self, label: &UnitLabel) -> Result<Option<Credentials>> {
        debug!(user = %label.user, room = %label.room, "fetching credentials from catalog");

        let Some(doc): Option<UserDocument> = self
            .get_json(&["users", &label.user])
            .await
            .with_context(|| format!("fetching user {}", label.user))?
        else {
            return Ok(None);
        };

        if let Some(room) = doc.room_id.as_deref() {
            if !room.trim().eq_ignore_ascii_case(label.room.trim()) {
                debug!(
                    user = %label.user,
                    room = %label.room,
                    catalog_room = room,
                    "catalog room differs from topic room",
                );
            }
        }

        Ok(doc.credentials())
    }

    async fn fetch_all_credentials(&self) -> Result<Vec<(UnitLabel, Credentials)>> {
        debug!("fetching full catalog");

        let doc: CatalogDocument = self
            .get_json(&["catalog"])
            .await
            .context("fetching catalog")?
            .context("catalog document not found")?;

        Ok(doc
            .users
            .iter()
            .filter_map(|u| {
                let user = u.user_id.as_deref()?.trim();
                let room = u.room_id.as_deref().unwrap_or("Room1").trim();
                if user.is_empty() || room.is_empty() {
                    return None;
                }
                Some((UnitLabel::new(user, room), u.credentials()?))
            })
            .collect())
    }
}
