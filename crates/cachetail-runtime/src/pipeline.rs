use crate::config::PipelineConfig;
use crate::reader::LogTailer;
use crate::stats::StatsCache;
use crate::writer::BatchWriter;
use crate::{Error, Result};
use cachetail_engine::{ResolverCache, SessionCorrelator, SpeedTracker};
use cachetail_parse::{is_heartbeat_url, AccessLineParser};
use cachetail_store::Database;
use cachetail_types::{IngestDelta, LogEntry, PipelineEvent, SpeedSample};
use chrono::{DateTime, Utc};
use notify::{PollWatcher, RecursiveMode, Watcher};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// NOTE: Stage topology and ordering
// - reader -> parsers -> consumers -> writer, every hand-off a bounded
//   sync_channel so a stalled store applies backpressure all the way to the
//   tailer instead of buffering unboundedly.
// - Correlation is stateful per grouping key, so per-key arrival order must
//   survive both parallel stages. The reader routes raw lines to a parser by
//   a hash of the client token, and parsers route entries to a consumer by a
//   hash of (client, service); every line of one key traverses exactly one
//   parser and one consumer, and mpsc preserves per-sender order on each hop.
// - Shutdown drains by dropping senders stage by stage: the reader exits and
//   drops the line senders, parsers drain and drop the entry senders,
//   consumers close their remaining sessions and drop the delta sender, the
//   writer flushes what is left and persists the final offset watermark.

/// Handle to a running ingest pipeline. Dropping it without calling
/// [`shutdown`](PipelineHandle::shutdown) detaches the threads.
pub struct PipelineHandle {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    speed: Arc<SpeedTracker>,
    stats: Arc<StatsCache>,
    events: Option<Receiver<PipelineEvent>>,
    malformed_lines: Arc<AtomicU64>,
}

impl PipelineHandle {
    /// Live throughput window shared with the consumer workers.
    pub fn speed_tracker(&self) -> Arc<SpeedTracker> {
        Arc::clone(&self.speed)
    }

    /// Cached store reads for dashboards and the stats command.
    pub fn stats_cache(&self) -> Arc<StatsCache> {
        Arc::clone(&self.stats)
    }

    /// Live event side-channel. `None` in high-throughput mode.
    pub fn events(&self) -> Option<&Receiver<PipelineEvent>> {
        self.events.as_ref()
    }

    /// Lines dropped so far because they did not match the log grammar.
    pub fn malformed_line_count(&self) -> u64 {
        self.malformed_lines.load(Ordering::Relaxed)
    }

    /// Stop the reader and let every stage drain in order, then join all
    /// worker threads. The writer's final flush has already committed (offset
    /// watermark included) by the time this returns.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            handle
                .join()
                .map_err(|_| Error::Pipeline(format!("thread '{}' panicked", name)))?;
        }

        info!("pipeline stopped");
        Ok(())
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Wire up and start every stage. Recovers persisted state first: stale
    /// active rows are closed, the reader resumes from the flushed offset
    /// watermark, and the resolver gets an initial mapping snapshot.
    pub fn start(config: PipelineConfig, db: Arc<Mutex<Database>>) -> Result<PipelineHandle> {
        let offset_key = config.log_path.to_string_lossy().into_owned();

        let (resume_offset, initial_mappings) = {
            let db = db.lock().expect("database lock poisoned");

            let stale = db.close_stale_active_downloads()?;
            if stale > 0 {
                info!(count = stale, "closed downloads left active by previous run");
            }

            let resume = db.get_ingest_offset(&offset_key)?;
            (resume, db.load_depot_mappings()?)
        };

        let resume_offset = match resume_offset {
            Some(offset) => offset,
            None if config.start_from_end => LogTailer::file_len(&config.log_path),
            None => 0,
        };
        info!(
            log = %config.log_path.display(),
            offset = resume_offset,
            mappings = initial_mappings.len(),
            "starting ingest pipeline"
        );

        let resolver = Arc::new(ResolverCache::new());
        resolver.install(initial_mappings);

        let speed = Arc::new(SpeedTracker::new(config.speed_window()));
        let stats = Arc::new(StatsCache::new(
            Arc::clone(&db),
            Duration::from_millis(config.active_stats_ttl_ms),
            Duration::from_secs(config.lifetime_stats_ttl_secs),
        ));

        let (events_tx, events_rx) = if config.high_throughput {
            (None, None)
        } else {
            let (tx, rx) = sync_channel::<PipelineEvent>(1024);
            (Some(tx), Some(rx))
        };

        let stop = Arc::new(AtomicBool::new(false));
        let malformed_lines = Arc::new(AtomicU64::new(0));
        let mut threads = Vec::new();

        let consumer_count = config.consumer_count.max(1);
        let parser_count = config.parser_count.max(1);
        let capacity = config.channel_capacity.max(1);

        let mut line_txs: Vec<SyncSender<(String, u64)>> = Vec::with_capacity(parser_count);
        let mut line_rxs = Vec::with_capacity(parser_count);
        for _ in 0..parser_count {
            let (tx, rx) = sync_channel::<(String, u64)>(capacity);
            line_txs.push(tx);
            line_rxs.push(rx);
        }

        let mut entry_txs: Vec<SyncSender<LogEntry>> = Vec::with_capacity(consumer_count);
        let mut entry_rxs = Vec::with_capacity(consumer_count);
        for _ in 0..consumer_count {
            let (tx, rx) = sync_channel::<LogEntry>(capacity);
            entry_txs.push(tx);
            entry_rxs.push(rx);
        }

        let (tx_deltas, rx_deltas) = sync_channel::<IngestDelta>(capacity);

        threads.push(spawn_reader(
            &config,
            resume_offset,
            Arc::clone(&stop),
            line_txs,
        )?);

        for (worker, rx_lines) in line_rxs.into_iter().enumerate() {
            threads.push(spawn_parser(
                worker,
                rx_lines,
                entry_txs.clone(),
                Arc::clone(&malformed_lines),
            )?);
        }
        drop(entry_txs);

        for (worker, rx_entries) in entry_rxs.into_iter().enumerate() {
            threads.push(spawn_consumer(
                worker,
                &config,
                rx_entries,
                tx_deltas.clone(),
                Arc::clone(&resolver),
                Arc::clone(&speed),
                Arc::clone(&stats),
                events_tx.clone(),
            )?);
        }
        drop(tx_deltas);

        threads.push(spawn_writer(&config, offset_key, Arc::clone(&db), rx_deltas, events_tx)?);

        threads.push(spawn_resolver_refresh(
            &config,
            Arc::clone(&stop),
            Arc::clone(&db),
            resolver,
        )?);

        Ok(PipelineHandle {
            stop,
            threads,
            speed,
            stats,
            events: events_rx,
            malformed_lines,
        })
    }
}

fn spawn_reader(
    config: &PipelineConfig,
    resume_offset: u64,
    stop: Arc<AtomicBool>,
    line_txs: Vec<SyncSender<(String, u64)>>,
) -> Result<JoinHandle<()>> {
    let log_path = config.log_path.clone();

    // The watcher only wakes the loop early; draining on the timeout as well
    // makes a missed event harmless. A watch failure (parent directory not
    // there yet) degrades to pure polling.
    let (tx_fs, rx_fs) = channel::<()>();
    let watcher_config = notify::Config::default().with_poll_interval(Duration::from_millis(500));
    let watcher = PollWatcher::new(
        move |res: std::result::Result<notify::Event, notify::Error>| {
            if res.is_ok() {
                let _ = tx_fs.send(());
            }
        },
        watcher_config,
    )
    .ok()
    .and_then(|mut watcher| {
        let watch_dir = log_path.parent().unwrap_or(std::path::Path::new("."));
        match watcher.watch(watch_dir, RecursiveMode::NonRecursive) {
            Ok(()) => Some(watcher),
            Err(err) => {
                warn!(error = %err, "file watch unavailable, polling only");
                None
            }
        }
    });

    let path = config.log_path.clone();
    std::thread::Builder::new()
        .name("log-reader".to_string())
        .spawn(move || {
            let _watcher = watcher;
            let mut tailer = LogTailer::new(path, resume_offset);

            while !stop.load(Ordering::Relaxed) {
                match rx_fs.recv_timeout(Duration::from_millis(500)) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        std::thread::sleep(Duration::from_millis(500));
                    }
                }
                while rx_fs.try_recv().is_ok() {}

                match tailer.drain() {
                    Ok(lines) => {
                        for (line, offset) in lines {
                            let slot = line_slot(&line, line_txs.len());
                            if line_txs[slot].send((line, offset)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "log read failed"),
                }
            }
        })
        .map_err(Error::Io)
}

fn spawn_parser(
    worker: usize,
    rx_lines: Receiver<(String, u64)>,
    entry_txs: Vec<SyncSender<LogEntry>>,
    malformed_lines: Arc<AtomicU64>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("parser-{}", worker))
        .spawn(move || {
            let parser = AccessLineParser::new();

            while let Ok((line, offset)) = rx_lines.recv() {
                match parser.parse_line(&line, offset) {
                    Ok(entry) => {
                        if is_heartbeat_url(&entry.url) {
                            continue;
                        }
                        let slot = route(&entry.client_ip, entry.service.name(), entry_txs.len());
                        if entry_txs[slot].send(entry).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        malformed_lines.fetch_add(1, Ordering::Relaxed);
                        debug!(error = %err, "dropped malformed line");
                    }
                }
            }
        })
        .map_err(Error::Io)
}

#[allow(clippy::too_many_arguments)]
fn spawn_consumer(
    worker: usize,
    config: &PipelineConfig,
    rx_entries: Receiver<LogEntry>,
    tx_deltas: SyncSender<IngestDelta>,
    resolver: Arc<ResolverCache>,
    speed: Arc<SpeedTracker>,
    stats: Arc<StatsCache>,
    events: Option<SyncSender<PipelineEvent>>,
) -> Result<JoinHandle<()>> {
    let idle_timeout = config.idle_timeout();

    std::thread::Builder::new()
        .name(format!("correlator-{}", worker))
        .spawn(move || {
            let mut correlator = SessionCorrelator::new(idle_timeout, Arc::clone(&resolver));
            let mut watermark: Option<(DateTime<Utc>, Instant)> = None;

            loop {
                match rx_entries.recv_timeout(Duration::from_secs(1)) {
                    Ok(entry) => {
                        watermark = Some(match watermark {
                            Some((ts, _)) => (ts.max(entry.timestamp), Instant::now()),
                            None => (entry.timestamp, Instant::now()),
                        });

                        let game = resolver.game_key_for(&entry.content_key);
                        speed.record(SpeedSample {
                            timestamp: entry.timestamp,
                            client_ip: entry.client_ip.clone(),
                            service: entry.service.clone(),
                            game_label: (!entry.content_key.is_none()).then(|| game.label()),
                            game_name: game.game_name().map(|n| n.to_string()),
                            bytes: entry.bytes,
                            cache_status: entry.cache_status,
                        });

                        let deltas = correlator.ingest(entry);
                        if !forward(deltas, &tx_deltas, &stats, &events) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        let deltas = correlator.tick(sweep_time(watermark, Utc::now()));
                        if !forward(deltas, &tx_deltas, &stats, &events) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        let deltas = correlator.finish();
                        forward(deltas, &tx_deltas, &stats, &events);
                        break;
                    }
                }
            }
        })
        .map_err(Error::Io)
}

fn spawn_writer(
    config: &PipelineConfig,
    offset_key: String,
    db: Arc<Mutex<Database>>,
    rx_deltas: Receiver<IngestDelta>,
    events: Option<SyncSender<PipelineEvent>>,
) -> Result<JoinHandle<()>> {
    let writer = BatchWriter::new(
        db,
        offset_key,
        config.batch_size.max(1),
        config.batch_timeout(),
        events,
    );

    std::thread::Builder::new()
        .name("batch-writer".to_string())
        .spawn(move || {
            let totals = writer.run(rx_deltas);
            info!(
                entries = totals.entries_inserted,
                duplicates = totals.duplicates_dropped,
                downloads = totals.downloads_opened,
                "writer drained"
            );
        })
        .map_err(Error::Io)
}

fn spawn_resolver_refresh(
    config: &PipelineConfig,
    stop: Arc<AtomicBool>,
    db: Arc<Mutex<Database>>,
    resolver: Arc<ResolverCache>,
) -> Result<JoinHandle<()>> {
    let interval = Duration::from_secs(config.resolver_refresh_secs.max(1));

    std::thread::Builder::new()
        .name("resolver-refresh".to_string())
        .spawn(move || {
            let mut waited = Duration::ZERO;
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(250));
                waited += Duration::from_millis(250);
                if waited < interval {
                    continue;
                }
                waited = Duration::ZERO;

                let mappings = {
                    let db = db.lock().expect("database lock poisoned");
                    db.load_depot_mappings()
                };
                match mappings {
                    Ok(mappings) => {
                        debug!(count = mappings.len(), "refreshed depot mapping snapshot");
                        resolver.install(mappings);
                    }
                    Err(err) => warn!(error = %err, "depot mapping refresh failed"),
                }
            }
        })
        .map_err(Error::Io)
}

/// Push deltas to the writer, surfacing open/close as live events and
/// invalidating the active-download cache. Returns false once the writer
/// side is gone.
fn forward(
    deltas: Vec<IngestDelta>,
    tx_deltas: &SyncSender<IngestDelta>,
    stats: &StatsCache,
    events: &Option<SyncSender<PipelineEvent>>,
) -> bool {
    for delta in deltas {
        match &delta {
            IngestDelta::DownloadOpened {
                id,
                client_ip,
                service,
                game,
                start,
                ..
            } => {
                stats.invalidate_active();
                if let Some(events) = events {
                    let _ = events.try_send(PipelineEvent::DownloadStarted {
                        id: *id,
                        client_ip: client_ip.clone(),
                        service: service.name().to_string(),
                        game: game.clone(),
                        start: *start,
                    });
                }
            }
            IngestDelta::DownloadClosed { id, end } => {
                stats.invalidate_active();
                if let Some(events) = events {
                    let _ = events.try_send(PipelineEvent::DownloadClosed { id: *id, end: *end });
                }
            }
            _ => {}
        }

        if tx_deltas.send(delta).is_err() {
            return false;
        }
    }
    true
}

/// Pin a grouping key to one consumer so its entries stay ordered.
fn route(client_ip: &str, service: &str, consumer_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    client_ip.hash(&mut hasher);
    service.hash(&mut hasher);
    (hasher.finish() as usize) % consumer_count
}

/// Cheap client extraction from a raw line: skip the optional bracketed
/// service tag, take the next whitespace-delimited token. Must agree with
/// what the parser later reports as `client_ip`, so that all lines of one
/// client funnel through one parser and stay in arrival order.
fn client_token(line: &str) -> &str {
    let rest = match line.strip_prefix('[') {
        Some(tail) => tail.split_once(']').map_or(line, |(_, after)| after),
        None => line,
    };
    rest.split_whitespace().next().unwrap_or("")
}

/// Pin a raw line to one parser by its client token.
fn line_slot(line: &str, parser_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    client_token(line).hash(&mut hasher);
    (hasher.finish() as usize) % parser_count
}

/// Sweep point for an idle tick. Gaps are measured on the log's clock, not
/// the wall clock, so a backlog of historical lines does not expire
/// mid-catch-up: the sweep sits at the highest log timestamp this consumer
/// has seen plus the wall time it has since sat idle. Wall time serves only
/// before the first entry, when there is nothing to close anyway.
fn sweep_time(watermark: Option<(DateTime<Utc>, Instant)>, now: DateTime<Utc>) -> DateTime<Utc> {
    match watermark {
        Some((ts, seen)) => {
            let idle = chrono::Duration::from_std(seen.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero());
            ts + idle
        }
        None => now,
    }
}
