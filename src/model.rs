//! Domain value types shared by the cache and provider layers.
//!
//! The core treats these as (de)serializable payloads plus a few attribute
//! accessors; the authoritative JSON schemas of the upstream registries
//! live in the provider modules that parse them.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An authoritative suppression record from one list source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DncEntry {
    /// Normalized E.164 phone number.
    pub phone_number: String,

    /// Which list this record came from: `Federal`, `Wireless`,
    /// `State-XX`, or `Internal`.
    pub list_source: String,

    /// Why the number is suppressed.
    pub suppress_reason: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_date: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

// Entries are identified by number + source; the remaining fields are
// registry metadata that may differ between refreshes of the same record.
impl PartialEq for DncEntry {
    fn eq(&self, other: &Self) -> bool {
        self.phone_number == other.phone_number && self.list_source == other.list_source
    }
}

impl Eq for DncEntry {}

impl std::hash::Hash for DncEntry {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.phone_number.hash(state);
        self.list_source.hash(state);
    }
}

/// Which write path produced a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheWriteSource {
    WriteThrough,
    BulkWrite,
    Warming,
}

impl CacheWriteSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriteThrough => "write_through",
            Self::BulkWrite => "bulk_write",
            Self::Warming => "warming",
        }
    }
}

/// A [`DncEntry`] wrapped with access telemetry, as stored in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDncEntry {
    pub entry: DncEntry,
    pub cached_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub access_count: u64,
    pub source: CacheWriteSource,
    pub version: u32,
}

impl CachedDncEntry {
    pub fn new(entry: DncEntry, source: CacheWriteSource) -> Self {
        let now = Utc::now();
        Self {
            entry,
            cached_at: now,
            last_access: now,
            access_count: 0,
            source,
            version: 1,
        }
    }

    /// Record one read. Called from the asynchronous telemetry refresh.
    pub fn touch(&mut self) {
        self.last_access = Utc::now();
        self.access_count += 1;
    }
}

/// The decision returned to upstream callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DncCheckResult {
    /// Normalized E.164 phone number the decision is about.
    pub phone_number: String,

    /// Whether the number is suppressed from contact.
    pub is_blocked: bool,

    /// The list source that produced the decision.
    pub list_source: String,

    /// Human-readable reasons backing the decision.
    pub reasons: Vec<String>,

    /// Provider confidence in [0, 1].
    pub confidence: f64,

    pub last_updated: DateTime<Utc>,

    /// How long this decision stays valid, independent of store TTL.
    pub ttl_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_date: Option<DateTime<Utc>>,
}

impl DncCheckResult {
    /// Expiry predicate on the embedded TTL. Readers re-check this on every
    /// cache hit and treat an expired result as a miss.
    pub fn is_expired(&self) -> bool {
        Utc::now() - self.last_updated > ChronoDuration::seconds(self.ttl_secs as i64)
    }
}

/// One element of the append-only audit log.
///
/// `event_hash` incorporates the predecessor's hash, forming a chain; the
/// body is opaque to the cache layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub sequence_num: i64,
    pub event_hash: String,
    pub body: serde_json::Value,
}

/// Outcome of an incremental or full registry sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResult {
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,

    /// Entries pulled in this pass, ready for a bulk cache write.
    pub entries: Vec<DncEntry>,

    /// Provider-issued checkpoint to resume from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,

    /// Provider's hint for when to sync next.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_sync_after: Option<DateTime<Utc>>,

    pub duration_ms: u64,
    pub records_per_second: f64,
}

/// Result of a provider health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub authenticated: bool,
    pub connective: bool,
    pub rate_limit_ok: bool,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub metadata: HashMap<String, String>,
    pub checked_at: DateTime<Utc>,
}

impl ProviderHealth {
    pub fn unhealthy(reason: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("reason".to_string(), reason.into());
        Self {
            healthy: false,
            authenticated: false,
            connective: false,
            rate_limit_ok: true,
            response_time_ms: 0,
            status_code: None,
            metadata,
            checked_at: Utc::now(),
        }
    }
}

/// Configured rate limit of a provider client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub requests_per_second: u32,
    pub burst: u32,
}

/// Observed quota usage against a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(phone: &str, source: &str) -> DncEntry {
        DncEntry {
            phone_number: phone.to_string(),
            list_source: source.to_string(),
            suppress_reason: "consumer registration".to_string(),
            registration_date: None,
            expires_at: None,
        }
    }

    #[test]
    fn test_entry_identity_is_phone_plus_source() {
        let a = entry("+14155551234", "Federal");
        let mut b = entry("+14155551234", "Federal");
        b.suppress_reason = "different metadata".to_string();
        assert_eq!(a, b);

        let c = entry("+14155551234", "State-CA");
        assert_ne!(a, c);
    }

    #[test]
    fn test_entry_serde_round_trip_is_stable() {
        let e = entry("+14155551234", "Federal");
        let once = serde_json::to_string(&e).unwrap();
        let back: DncEntry = serde_json::from_str(&once).unwrap();
        let twice = serde_json::to_string(&back).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_check_result_expiry_uses_embedded_ttl() {
        let mut result = DncCheckResult {
            phone_number: "+14155551234".to_string(),
            is_blocked: true,
            list_source: "Federal".to_string(),
            reasons: vec!["registered".to_string()],
            confidence: 1.0,
            last_updated: Utc::now(),
            ttl_secs: 3600,
            registration_date: None,
        };
        assert!(!result.is_expired());

        result.last_updated = Utc::now() - ChronoDuration::seconds(3601);
        assert!(result.is_expired());
    }

    #[test]
    fn test_cached_entry_touch() {
        let mut cached = CachedDncEntry::new(entry("+14155551234", "Federal"), CacheWriteSource::WriteThrough);
        assert_eq!(cached.access_count, 0);
        cached.touch();
        assert_eq!(cached.access_count, 1);
    }
}
