use crate::entry::{GameKey, LogEntry, Service};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// NOTE: Delta design for the ingest write path
// - The correlator never touches the store; it emits immutable deltas that the
//   batch writer applies exactly once inside a single transaction.
// - Extended/Opened carry client and service so the writer can bump the
//   lifetime aggregates from the same delta without re-reading the download row.
// - A relabel (unresolved content key learning its app id mid-stream) rides on
//   the next Extended delta rather than being a separate event, so the store
//   row converges without any read-modify-write race.

/// One unit of pending write work produced by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IngestDelta {
    /// Insert one raw log entry (audit trail, duplicate detection).
    Entry {
        entry: LogEntry,
        /// Owning download session, when the entry matched one.
        download_id: Option<Uuid>,
    },

    /// First chunk for a grouping key: create the download session row.
    DownloadOpened {
        id: Uuid,
        client_ip: String,
        service: Service,
        game: GameKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        hit_bytes: i64,
        miss_bytes: i64,
    },

    /// Subsequent chunk: advance the end timestamp and add the byte split.
    DownloadExtended {
        id: Uuid,
        client_ip: String,
        service: Service,
        end: DateTime<Utc>,
        hit_delta: i64,
        miss_delta: i64,
        /// Present when the game identity changed since the last delta
        /// (content key resolved to an app mid-session).
        relabel: Option<GameKey>,
    },

    /// Idle timeout elapsed or terminal signal: fix the end timestamp.
    DownloadClosed { id: Uuid, end: DateTime<Utc> },
}

impl IngestDelta {
    /// Source log offset carried by this delta, if any. The batch writer
    /// persists the highest flushed offset as the reader's resume point.
    pub fn source_offset(&self) -> Option<u64> {
        match self {
            IngestDelta::Entry { entry, .. } => Some(entry.source_offset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{CacheStatus, ContentKey};

    #[test]
    fn entry_delta_exposes_source_offset() {
        let entry = LogEntry {
            timestamp: Utc::now(),
            client_ip: "10.0.0.5".to_string(),
            method: "GET".to_string(),
            url: "/depot/441/chunk/abc".to_string(),
            status: 200,
            bytes: 512,
            cache_status: CacheStatus::Miss,
            service: Service::Steam,
            content_key: ContentKey::SteamDepot(441),
            source_offset: 4096,
        };

        let delta = IngestDelta::Entry {
            entry,
            download_id: Some(Uuid::new_v4()),
        };
        assert_eq!(delta.source_offset(), Some(4096));

        let closed = IngestDelta::DownloadClosed {
            id: Uuid::new_v4(),
            end: Utc::now(),
        };
        assert_eq!(closed.source_offset(), None);
    }
}
