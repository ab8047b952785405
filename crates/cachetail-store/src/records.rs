use chrono::{DateTime, Utc};
use serde::Serialize;

/// One persisted download session row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRow {
    pub id: String,
    pub client_ip: String,
    pub service: String,
    /// Grouping label: app id once resolved, raw content key before.
    pub game_label: String,
    pub game_app_id: Option<u32>,
    pub game_name: Option<String>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub hit_bytes: i64,
    pub miss_bytes: i64,
    pub active: bool,
}

impl DownloadRow {
    pub fn total_bytes(&self) -> i64 {
        self.hit_bytes + self.miss_bytes
    }
}

/// Lifetime aggregate keyed by client address. Mutated incrementally by the
/// batch writer, never recomputed from a scan on the write path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatsRow {
    pub client_ip: String,
    pub total_hit_bytes: i64,
    pub total_miss_bytes: i64,
    pub download_count: i64,
    pub last_seen_ts: DateTime<Utc>,
}

/// Lifetime aggregate keyed by service name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatsRow {
    pub service: String,
    pub total_hit_bytes: i64,
    pub total_miss_bytes: i64,
    pub download_count: i64,
    pub last_seen_ts: DateTime<Utc>,
}

/// Outcome of one committed batch transaction.
#[derive(Debug, Clone, Default)]
pub struct FlushStats {
    pub entries_inserted: usize,
    pub duplicates_dropped: usize,
    pub downloads_opened: usize,
    pub downloads_closed: usize,
    /// Highest source log offset among flushed entries, persisted as the
    /// reader's resume point within the same transaction.
    pub last_offset: Option<u64>,
}

impl FlushStats {
    pub fn merge(&mut self, other: &FlushStats) {
        self.entries_inserted += other.entries_inserted;
        self.duplicates_dropped += other.duplicates_dropped;
        self.downloads_opened += other.downloads_opened;
        self.downloads_closed += other.downloads_closed;
        if other.last_offset > self.last_offset {
            self.last_offset = other.last_offset;
        }
    }
}
