use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::catalog::{CatalogClient, Credentials};
use crate::export::health::HealthMetrics;

/// Canonical (user, room) key: both parts trimmed and ASCII-lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey(Arc<str>);

impl UnitKey {
    /// Canonicalizes a raw pair. Returns `None` if either part is blank.
    pub fn canonical(user: &str, room: &str) -> Option<Self> {
        let (user, room) = (user.trim(), room.trim());
        if user.is_empty() || room.is_empty() {
            return None;
        }
        Some(Self(Arc::from(format!(
            "{}/{}",
            user.to_ascii_lowercase(),
            room.to_ascii_lowercase()
        ))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for UnitKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trimmed, case-preserving spelling of a key, used for catalog lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UnitLabel {
    pub user: String,
    pub room: String,
}

impl UnitLabel {
    pub fn new(user: &str, room: &str) -> Self {
        Self {
            user: user.trim().to_string(),
            room: room.trim().to_string(),
        }
    }

    pub fn key(&self) -> Option<UnitKey> {
        UnitKey::canonical(&self.user, &self.room)
    }
}

impl fmt::Display for UnitLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.room)
    }
}

/// Outcome of a credential lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(Credentials),
    NotFound,
}

struct CachedCredentials {
    credentials: Credentials,
    fetched_at: Instant,
}

/// Interns keys and resolves them to publishing credentials.
///
/// Positive lookups are cached for `ttl`; misses and catalog failures are
/// not cached so the next flush cycle retries.
pub struct KeyRegistry<C> {
    catalog: C,
    ttl: Duration,
    labels: DashMap<UnitKey, UnitLabel>,
    credentials: DashMap<UnitKey, CachedCredentials>,
    health: Option<Arc<HealthMetrics>>,
}

impl<C: CatalogClient> KeyRegistry<C> {
    pub fn new(catalog: C, ttl: Duration, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            catalog,
            ttl,
            labels: DashMap::new(),
            credentials: DashMap::new(),
            health,
        }
    }

    /// Canonicalizes a raw pair and remembers the first spelling seen.
    pub fn intern(&self, user: &str, room: &str) -> Option<(UnitKey, UnitLabel)> {
        let key = UnitKey::canonical(user, room)?;
        let label = self
            .labels
            .entry(key.clone())
            .or_insert_with(|| UnitLabel::new(user, room))
            .clone();
        Some((key, label))
    }

    pub fn label(&self, key: &UnitKey) -> Option<UnitLabel> {
        self.labels.get(key).map(|l| l.clone())
    }

    /// Resolves credentials for a key: cache first, then one catalog lookup.
    pub async fn resolve(&self, key: &UnitKey) -> Resolution {
        if let Some(cached) = self.credentials.get(key) {
            if cached.fetched_at.elapsed() < self.ttl {
                self.record_lookup("cached");
                return Resolution::Found(cached.credentials.clone());
            }
        }

        let Some(label) = self.label(key) else {
            warn!(key = %key, "no label recorded for key, cannot resolve credentials");
            self.record_lookup("not_found");
            return Resolution::NotFound;
        };

        match self.catalog.fetch_credentials(&label).await {
            Ok(Some(credentials)) => {
                debug!(key = %key, channel = ?credentials.channel_id, "resolved credentials");
                self.credentials.insert(
                    key.clone(),
                    CachedCredentials {
                        credentials: credentials.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                self.record_lookup("found");
                Resolution::Found(credentials)
            }
            Ok(None) => {
                self.credentials.remove(key);
                warn!(user = %label.user, room = %label.room, "no credentials in catalog");
                self.record_lookup("not_found");
                Resolution::NotFound
            }
            Err(e) => {
                warn!(
                    user = %label.user,
                    room = %label.room,
                    error = %format!("{e:#}"),
                    "credential lookup failed"
                );
                self.record_lookup("error");
                Resolution::NotFound
            }
        }
    }

    /// Warms the cache from the catalog's full user list. Returns the number
    /// of keys loaded.
    pub async fn preload(&self) -> anyhow::Result<usize> {
        let entries = self.catalog.fetch_all_credentials().await?;
        let now = Instant::now();
        let mut loaded = 0;

        for (label, credentials) in entries {
            let Some(key) = label.key() else {
                continue;
            };
            self.labels.entry(key.clone()).or_insert(label);
            self.credentials.insert(
                key,
                CachedCredentials {
                    credentials,
                    fetched_at: now,
                },
            );
            loaded += 1;
        }

        Ok(loaded)
    }

    /// Drops cached credentials for a key.
    pub fn invalidate(&self, key: &UnitKey) {
        self.credentials.remove(key);
    }

    pub fn cached_len(&self) -> usize {
        self.credentials.len()
    }

    fn record_lookup(&self, result: &str) {
        if let Some(ref h) = self.health {
            h.credential_lookups.with_label_values(&[result]).inc();
        }
    }
}
