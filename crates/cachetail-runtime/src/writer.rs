use cachetail_store::{Database, FlushStats};
use cachetail_types::{IngestDelta, PipelineEvent};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Terminal stage of the pipeline: collects deltas from every consumer and
/// applies them to the store in batched transactions. The only component
/// that writes the database.
pub struct BatchWriter {
    db: Arc<Mutex<Database>>,
    /// Key the reader's resume offset is persisted under (the log path).
    offset_key: String,
    batch_size: usize,
    batch_timeout: Duration,
    events: Option<SyncSender<PipelineEvent>>,
}

impl BatchWriter {
    pub fn new(
        db: Arc<Mutex<Database>>,
        offset_key: String,
        batch_size: usize,
        batch_timeout: Duration,
        events: Option<SyncSender<PipelineEvent>>,
    ) -> Self {
        Self {
            db,
            offset_key,
            batch_size,
            batch_timeout,
            events,
        }
    }

    /// Drain the delta channel until every upstream sender is gone, then
    /// flush whatever is pending. Returns the accumulated flush totals.
    pub fn run(self, rx: Receiver<IngestDelta>) -> FlushStats {
        let mut pending: Vec<IngestDelta> = Vec::with_capacity(self.batch_size);
        let mut totals = FlushStats::default();
        let mut last_flush = Instant::now();

        loop {
            match rx.recv_timeout(self.batch_timeout) {
                Ok(delta) => {
                    pending.push(delta);
                    if pending.len() >= self.batch_size
                        || last_flush.elapsed() >= self.batch_timeout
                    {
                        self.flush(&mut pending, &mut totals);
                        last_flush = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !pending.is_empty() {
                        self.flush(&mut pending, &mut totals);
                    }
                    last_flush = Instant::now();
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // Shutdown: everything still queued goes out in one last
                    // transaction, offset watermark included.
                    if !pending.is_empty() {
                        self.flush(&mut pending, &mut totals);
                    }
                    break;
                }
            }
        }

        totals
    }

    /// Apply the pending batch, retrying with capped exponential backoff. The
    /// batch is never dropped; a transient store fault delays it.
    fn flush(&self, pending: &mut Vec<IngestDelta>, totals: &mut FlushStats) {
        let mut backoff = Duration::from_millis(100);

        loop {
            let result = {
                let mut db = self.db.lock().expect("database lock poisoned");
                db.apply_batch(pending, Some(&self.offset_key))
            };

            match result {
                Ok(stats) => {
                    debug!(
                        entries = stats.entries_inserted,
                        duplicates = stats.duplicates_dropped,
                        opened = stats.downloads_opened,
                        closed = stats.downloads_closed,
                        "flushed batch"
                    );
                    self.emit(PipelineEvent::BatchFlushed {
                        entries_inserted: stats.entries_inserted,
                        duplicates_dropped: stats.duplicates_dropped,
                        downloads_opened: stats.downloads_opened,
                        downloads_closed: stats.downloads_closed,
                    });
                    totals.merge(&stats);
                    pending.clear();
                    return;
                }
                Err(err) => {
                    warn!(error = %err, retry_in = ?backoff, "batch flush failed, retrying");
                    self.emit(PipelineEvent::Degraded {
                        stage: "batch-writer".to_string(),
                        detail: err.to_string(),
                    });
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
            }
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            // Slow or absent subscribers lose events, never block ingest.
            let _ = events.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachetail_types::{CacheStatus, ContentKey, LogEntry, Service};
    use chrono::Utc;
    use std::sync::mpsc::sync_channel;

    fn entry(offset: u64) -> IngestDelta {
        IngestDelta::Entry {
            entry: LogEntry {
                timestamp: Utc::now(),
                client_ip: "10.0.0.5".to_string(),
                method: "GET".to_string(),
                url: format!("/depot/441/chunk/{}", offset),
                status: 200,
                bytes: 1024,
                cache_status: CacheStatus::Hit,
                service: Service::Steam,
                content_key: ContentKey::SteamDepot(441),
                source_offset: offset,
            },
            download_id: None,
        }
    }

    #[test]
    fn drains_and_flushes_on_disconnect() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let writer = BatchWriter::new(
            Arc::clone(&db),
            "test.log".to_string(),
            1000,
            Duration::from_millis(50),
            None,
        );

        let (tx, rx) = sync_channel(16);
        for offset in 1..=5 {
            tx.send(entry(offset * 100)).unwrap();
        }
        drop(tx);

        let totals = writer.run(rx);
        assert_eq!(totals.entries_inserted, 5);
        assert_eq!(totals.last_offset, Some(500));

        let db = db.lock().unwrap();
        assert_eq!(db.count_entries().unwrap(), 5);
        assert_eq!(db.get_ingest_offset("test.log").unwrap(), Some(500));
    }

    #[test]
    fn small_batch_size_forces_multiple_flushes() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let writer = BatchWriter::new(
            Arc::clone(&db),
            "test.log".to_string(),
            2,
            Duration::from_millis(50),
            None,
        );

        let (events_tx, events_rx) = sync_channel(16);
        let writer = BatchWriter {
            events: Some(events_tx),
            ..writer
        };

        let (tx, rx) = sync_channel(16);
        for offset in 1..=4 {
            tx.send(entry(offset * 100)).unwrap();
        }
        drop(tx);

        writer.run(rx);

        let flushes: Vec<_> = events_rx
            .try_iter()
            .filter(|e| matches!(e, PipelineEvent::BatchFlushed { .. }))
            .collect();
        assert!(flushes.len() >= 2);
    }
}
