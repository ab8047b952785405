use crate::entry::GameKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Live notifications emitted by the pipeline alongside the persisted write
/// path. Consumers are advisory; a full or absent subscriber never blocks
/// ingest, and high-throughput mode suppresses the channel entirely.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PipelineEvent {
    DownloadStarted {
        id: Uuid,
        client_ip: String,
        service: String,
        game: GameKey,
        start: DateTime<Utc>,
    },
    DownloadClosed {
        id: Uuid,
        end: DateTime<Utc>,
    },
    BatchFlushed {
        entries_inserted: usize,
        duplicates_dropped: usize,
        downloads_opened: usize,
        downloads_closed: usize,
    },
    /// A stage hit a recoverable fault (flush retry, parse failures piling
    /// up). The pipeline keeps running; this is a health signal.
    Degraded {
        stage: String,
        detail: String,
    },
}
