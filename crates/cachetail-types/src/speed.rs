use crate::entry::{CacheStatus, Service};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One byte transfer observed by the speed tracker. Ephemeral, in-memory
/// only; discarded once older than the maximum supported window.
#[derive(Debug, Clone)]
pub struct SpeedSample {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub service: Service,
    /// Grouping label of the download's game key (app id or raw content key).
    pub game_label: Option<String>,
    pub game_name: Option<String>,
    pub bytes: i64,
    pub cache_status: CacheStatus,
}

impl SpeedSample {
    pub fn hit_bytes(&self) -> i64 {
        match self.cache_status {
            CacheStatus::Hit => self.bytes,
            _ => 0,
        }
    }
}

/// Per-game throughput over the snapshot window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSpeedInfo {
    pub game_label: String,
    pub game_name: Option<String>,
    pub service: String,
    pub client_ip: String,
    pub bytes_per_second: f64,
    pub total_bytes: i64,
    pub request_count: usize,
    pub cache_hit_bytes: i64,
    pub cache_miss_bytes: i64,
    pub cache_hit_percent: f64,
}

/// Per-client throughput over the snapshot window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpeedInfo {
    pub client_ip: String,
    pub bytes_per_second: f64,
    pub total_bytes: i64,
    pub active_games: usize,
    pub cache_hit_bytes: i64,
    pub cache_miss_bytes: i64,
}

/// Point-in-time view over the trailing window. Computed on demand from the
/// current sample set, never stored.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSpeedSnapshot {
    pub timestamp_utc: String,
    pub total_bytes_per_second: f64,
    pub game_speeds: Vec<GameSpeedInfo>,
    pub client_speeds: Vec<ClientSpeedInfo>,
    pub window_seconds: i64,
    pub entries_in_window: usize,
    pub has_active_downloads: bool,
}

impl DownloadSpeedSnapshot {
    pub fn empty(window_seconds: i64) -> Self {
        Self {
            timestamp_utc: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            total_bytes_per_second: 0.0,
            game_speeds: Vec::new(),
            client_speeds: Vec::new(),
            window_seconds,
            entries_in_window: 0,
            has_active_downloads: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes_camel_case() {
        let snapshot = DownloadSpeedSnapshot::empty(20);
        let json = serde_json::to_string(&snapshot).unwrap();

        assert!(json.contains("totalBytesPerSecond"));
        assert!(json.contains("hasActiveDownloads"));
        assert!(!json.contains("game_speeds"));
    }
}
