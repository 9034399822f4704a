//! Row types persisted by the local store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifetime class of a cached table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Kept until explicitly cleared.
    Persistent,
    /// Evicted from routing once `expires_at` passes.
    Temporary,
}

impl CacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Persistent => "persistent",
            CacheType::Temporary => "temporary",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persistent" => Ok(CacheType::Persistent),
            "temporary" => Ok(CacheType::Temporary),
            other => Err(format!("unknown cache type: {other}")),
        }
    }
}

/// Bookkeeping for one cached table (`_cache_metadata` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub table_name: String,
    pub cache_type: CacheType,
    /// Remote live-query id keeping this table current, if any.
    pub live_query_uuid: Option<String>,
    pub record_count: i64,
    pub last_sync_time: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl CacheMetadata {
    /// Returns true if the entry has an expiry at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Returns true if the cached rows may serve reads at `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired_at(now)
    }
}

/// A journaled offline operation (`_offline_operations` row).
///
/// The store keeps kinds and statuses as plain strings; the engine owns
/// their meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub kind: String,
    pub table_name: String,
    pub record_id: Option<String>,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: String,
    pub tenant_code: Option<String>,
    pub last_error: Option<String>,
    pub queued_at: DateTime<Utc>,
}
