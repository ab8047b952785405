use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tuning knobs for the ingest pipeline. Loaded from a toml file; a missing
/// file yields the defaults so a bare `cachetail run` works out of the box.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Access log to tail.
    pub log_path: PathBuf,

    /// SQLite database location.
    pub db_path: PathBuf,

    /// Bound of every inter-stage channel. A full channel blocks the
    /// upstream stage rather than growing without limit.
    pub channel_capacity: usize,

    /// Deltas per flush transaction.
    pub batch_size: usize,

    /// Flush a partial batch after this long without reaching batch_size.
    pub batch_timeout_ms: u64,

    /// Parallel line parsers.
    pub parser_count: usize,

    /// Parallel correlator workers. Entries are routed by a hash of
    /// (client, service) so one grouping key always lands on one worker.
    pub consumer_count: usize,

    /// Gap after which a download session is considered finished.
    pub idle_timeout_secs: u64,

    /// Largest speed window a snapshot may ask for; samples older than this
    /// are discarded.
    pub speed_window_secs: i64,

    /// Freshness of cached active-download reads.
    pub active_stats_ttl_ms: u64,

    /// Freshness of cached lifetime aggregates.
    pub lifetime_stats_ttl_secs: u64,

    /// How often the depot mapping snapshot is re-read from the store.
    pub resolver_refresh_secs: u64,

    /// Suppress the live event side-channel during bulk catch-up.
    pub high_throughput: bool,

    /// On first run (no persisted offset), start tailing at the end of the
    /// log instead of ingesting its entire history.
    pub start_from_end: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("logs/access.log"),
            db_path: PathBuf::from("data/cachetail.db"),
            channel_capacity: 10_000,
            batch_size: 1000,
            batch_timeout_ms: 2000,
            parser_count: 2,
            consumer_count: 2,
            idle_timeout_secs: 30,
            speed_window_secs: 20,
            active_stats_ttl_ms: 500,
            lifetime_stats_ttl_secs: 10,
            resolver_refresh_secs: 60,
            high_throughput: false,
            start_from_end: false,
        }
    }
}

impl PipelineConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn batch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn speed_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.speed_window_secs.max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_nonexistent_returns_default() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config = PipelineConfig::load_from(&temp_dir.path().join("absent.toml"))?;

        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.idle_timeout_secs, 30);
        assert!(!config.start_from_end);

        Ok(())
    }

    #[test]
    fn save_and_load_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("cachetail.toml");

        let mut config = PipelineConfig::default();
        config.batch_size = 250;
        config.high_throughput = true;
        config.log_path = PathBuf::from("/var/log/nginx/access.log");

        config.save_to(&config_path)?;
        assert!(config_path.exists());

        let loaded = PipelineConfig::load_from(&config_path)?;
        assert_eq!(loaded.batch_size, 250);
        assert!(loaded.high_throughput);
        assert_eq!(loaded.log_path, PathBuf::from("/var/log/nginx/access.log"));

        Ok(())
    }

    #[test]
    fn partial_file_fills_in_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("partial.toml");
        std::fs::write(&config_path, "batch_size = 42\n")?;

        let config = PipelineConfig::load_from(&config_path)?;
        assert_eq!(config.batch_size, 42);
        assert_eq!(config.consumer_count, 2);

        Ok(())
    }
}
