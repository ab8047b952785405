use crate::args::{Cli, Commands};
use anyhow::{Context, Result};
use cachetail_engine::SpeedTracker;
use cachetail_runtime::{Pipeline, PipelineConfig, PipelineHandle, StatsCache};
use cachetail_store::Database;
use cachetail_types::PipelineEvent;
use chrono::Utc;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

pub fn run(cli: Cli) -> Result<()> {
    let mut config = PipelineConfig::load_from(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    if let Some(path) = cli.log_path {
        config.log_path = path;
    }
    if let Some(path) = cli.db_path {
        config.db_path = path;
    }

    match cli.command {
        Commands::Run {
            high_throughput,
            start_from_end,
        } => {
            config.high_throughput |= high_throughput;
            config.start_from_end |= start_from_end;
            run_pipeline(config)
        }
        Commands::Stats => print_stats(&config),
        Commands::Speed { window } => print_speed(&config, window),
    }
}

fn open_db(config: &PipelineConfig) -> Result<Arc<Mutex<Database>>> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db = Database::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    Ok(Arc::new(Mutex::new(db)))
}

fn run_pipeline(config: PipelineConfig) -> Result<()> {
    let db = open_db(&config)?;
    let handle = Pipeline::start(config, db)?;

    let (tx_stop, rx_stop) = channel();
    ctrlc::set_handler(move || {
        let _ = tx_stop.send(());
    })
    .context("installing ctrl-c handler")?;
    info!("ingesting, ctrl-c to stop");

    loop {
        match rx_stop.recv_timeout(Duration::from_millis(250)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        log_events(&handle);
    }

    info!("shutting down");
    handle.shutdown()?;
    Ok(())
}

fn log_events(handle: &PipelineHandle) {
    let Some(events) = handle.events() else {
        return;
    };

    for event in events.try_iter() {
        match event {
            PipelineEvent::DownloadStarted {
                client_ip,
                service,
                game,
                ..
            } => {
                info!(client = %client_ip, service = %service, game = %game.label(), "download started");
            }
            PipelineEvent::DownloadClosed { id, .. } => {
                info!(id = %id, "download closed");
            }
            PipelineEvent::Degraded { stage, detail } => {
                warn!(stage = %stage, detail = %detail, "pipeline degraded");
            }
            PipelineEvent::BatchFlushed { .. } => {}
        }
    }
}

fn print_stats(config: &PipelineConfig) -> Result<()> {
    let db = open_db(config)?;
    let cache = StatsCache::new(
        db,
        Duration::from_millis(config.active_stats_ttl_ms),
        Duration::from_secs(config.lifetime_stats_ttl_secs),
    );

    let report = serde_json::json!({
        "services": cache.service_stats()?,
        "clients": cache.client_stats()?,
        "activeDownloads": cache.active_downloads()?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_speed(config: &PipelineConfig, window: i64) -> Result<()> {
    let window = window.max(1);
    let db = open_db(config)?;

    let since = Utc::now() - chrono::Duration::seconds(window);
    let samples = {
        let db = db.lock().expect("database lock poisoned");
        db.get_speed_samples_since(&since)?
    };

    let tracker = SpeedTracker::new(Duration::from_secs(window as u64));
    for sample in samples {
        tracker.record(sample);
    }

    let snapshot = tracker.snapshot(window);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
