use cachetail_types::{
    CacheStatus, ClientSpeedInfo, DownloadSpeedSnapshot, GameSpeedInfo, SpeedSample,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Rolling window of recent byte transfers, independent of the persisted
/// store. Holds its own lock; the batch writer never touches it, so live
/// snapshot reads cannot contend with ingest flushes.
pub struct SpeedTracker {
    max_window: Duration,
    samples: Mutex<VecDeque<SpeedSample>>,
}

impl SpeedTracker {
    pub fn new(max_window: std::time::Duration) -> Self {
        Self {
            max_window: Duration::from_std(max_window).unwrap_or(Duration::seconds(20)),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Append one sample. Samples older than the maximum window are evicted
    /// lazily here, on the write side, so reads stay cheap.
    pub fn record(&self, sample: SpeedSample) {
        // Zero-byte probes (manifests, 304s) carry no speed information.
        if sample.bytes <= 0 {
            return;
        }

        let mut samples = self.samples.lock().expect("speed samples poisoned");
        let cutoff = sample.timestamp - self.max_window;
        while let Some(front) = samples.front() {
            if front.timestamp < cutoff {
                samples.pop_front();
            } else {
                break;
            }
        }
        samples.push_back(sample);
    }

    /// Aggregate all samples in the trailing `window_seconds` into per-game
    /// and per-client rates, as of now.
    pub fn snapshot(&self, window_seconds: i64) -> DownloadSpeedSnapshot {
        self.snapshot_at(window_seconds, Utc::now())
    }

    pub fn snapshot_at(&self, window_seconds: i64, now: DateTime<Utc>) -> DownloadSpeedSnapshot {
        if window_seconds <= 0 {
            return DownloadSpeedSnapshot::empty(window_seconds);
        }

        let window_start = now - Duration::seconds(window_seconds);
        let window_entries: Vec<SpeedSample> = {
            let samples = self.samples.lock().expect("speed samples poisoned");
            samples
                .iter()
                .filter(|s| s.timestamp >= window_start && s.timestamp <= now)
                .cloned()
                .collect()
        };

        let window = window_seconds as f64;

        let mut game_groups: HashMap<(String, String), Vec<&SpeedSample>> = HashMap::new();
        for sample in &window_entries {
            if let Some(label) = &sample.game_label {
                game_groups
                    .entry((label.clone(), sample.client_ip.clone()))
                    .or_default()
                    .push(sample);
            }
        }

        let mut game_speeds: Vec<GameSpeedInfo> = game_groups
            .into_iter()
            .map(|((game_label, client_ip), samples)| {
                let total_bytes: i64 = samples.iter().map(|s| s.bytes).sum();
                let cache_hit_bytes: i64 = samples.iter().map(|s| s.hit_bytes()).sum();
                let cache_miss_bytes: i64 = samples
                    .iter()
                    .filter(|s| s.cache_status == CacheStatus::Miss)
                    .map(|s| s.bytes)
                    .sum();
                let cache_hit_percent = if total_bytes > 0 {
                    (cache_hit_bytes as f64 / total_bytes as f64) * 100.0
                } else {
                    0.0
                };
                let game_name = samples.iter().find_map(|s| s.game_name.clone());
                let service = samples
                    .first()
                    .map(|s| s.service.name().to_string())
                    .unwrap_or_default();

                GameSpeedInfo {
                    game_label,
                    game_name,
                    service,
                    client_ip,
                    bytes_per_second: total_bytes as f64 / window,
                    total_bytes,
                    request_count: samples.len(),
                    cache_hit_bytes,
                    cache_miss_bytes,
                    cache_hit_percent,
                }
            })
            .collect();

        game_speeds.sort_by(|a, b| {
            b.bytes_per_second
                .partial_cmp(&a.bytes_per_second)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut client_groups: HashMap<String, Vec<&SpeedSample>> = HashMap::new();
        for sample in &window_entries {
            client_groups
                .entry(sample.client_ip.clone())
                .or_default()
                .push(sample);
        }

        let mut client_speeds: Vec<ClientSpeedInfo> = client_groups
            .into_iter()
            .map(|(client_ip, samples)| {
                let total_bytes: i64 = samples.iter().map(|s| s.bytes).sum();
                let cache_hit_bytes: i64 = samples.iter().map(|s| s.hit_bytes()).sum();
                let cache_miss_bytes: i64 = samples
                    .iter()
                    .filter(|s| s.cache_status == CacheStatus::Miss)
                    .map(|s| s.bytes)
                    .sum();
                let active_games = samples
                    .iter()
                    .filter_map(|s| s.game_label.as_ref())
                    .collect::<HashSet<_>>()
                    .len();

                ClientSpeedInfo {
                    client_ip,
                    bytes_per_second: total_bytes as f64 / window,
                    total_bytes,
                    active_games,
                    cache_hit_bytes,
                    cache_miss_bytes,
                }
            })
            .collect();

        client_speeds.sort_by(|a, b| {
            b.bytes_per_second
                .partial_cmp(&a.bytes_per_second)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let total_bytes: i64 = window_entries.iter().map(|s| s.bytes).sum();
        let keyed = window_entries.iter().filter(|s| s.game_label.is_some()).count();

        DownloadSpeedSnapshot {
            timestamp_utc: now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            total_bytes_per_second: total_bytes as f64 / window,
            game_speeds,
            client_speeds,
            window_seconds,
            entries_in_window: window_entries.len(),
            has_active_downloads: keyed > 0,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().expect("speed samples poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachetail_types::Service;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.timestamp_opt(1_756_500_000, 0).unwrap()
    }

    fn sample(secs: i64, bytes: i64, status: CacheStatus) -> SpeedSample {
        SpeedSample {
            timestamp: base_time() + Duration::seconds(secs),
            client_ip: "10.0.0.5".to_string(),
            service: Service::Steam,
            game_label: Some("depot:441".to_string()),
            game_name: None,
            bytes,
            cache_status: status,
        }
    }

    #[test]
    fn evenly_spread_bytes_report_b_over_w() {
        let tracker = SpeedTracker::new(std::time::Duration::from_secs(60));

        // 10 MB spread evenly over a 10-second window.
        for secs in 1..=10 {
            tracker.record(sample(secs, 1_000_000, CacheStatus::Hit));
        }

        let now = base_time() + Duration::seconds(10);
        let snapshot = tracker.snapshot_at(10, now);

        let expected = 10_000_000.0 / 10.0;
        let tolerance = expected * 0.01;
        assert!(
            (snapshot.total_bytes_per_second - expected).abs() < tolerance,
            "got {} expected ~{}",
            snapshot.total_bytes_per_second,
            expected
        );

        assert_eq!(snapshot.game_speeds.len(), 1);
        assert!((snapshot.game_speeds[0].bytes_per_second - expected).abs() < tolerance);
    }

    #[test]
    fn hit_miss_split_and_percent() {
        let tracker = SpeedTracker::new(std::time::Duration::from_secs(60));
        tracker.record(sample(1, 750, CacheStatus::Hit));
        tracker.record(sample(2, 250, CacheStatus::Miss));

        let snapshot = tracker.snapshot_at(10, base_time() + Duration::seconds(3));
        let game = &snapshot.game_speeds[0];

        assert_eq!(game.cache_hit_bytes, 750);
        assert_eq!(game.cache_miss_bytes, 250);
        assert!((game.cache_hit_percent - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_window_reports_zero_not_nan() {
        let tracker = SpeedTracker::new(std::time::Duration::from_secs(60));
        let snapshot = tracker.snapshot_at(10, base_time());

        assert_eq!(snapshot.total_bytes_per_second, 0.0);
        assert_eq!(snapshot.entries_in_window, 0);
        assert!(!snapshot.has_active_downloads);
        assert!(snapshot.game_speeds.is_empty());
    }

    #[test]
    fn samples_outside_window_are_excluded() {
        let tracker = SpeedTracker::new(std::time::Duration::from_secs(120));
        tracker.record(sample(0, 5000, CacheStatus::Hit));
        tracker.record(sample(55, 1000, CacheStatus::Hit));

        let snapshot = tracker.snapshot_at(10, base_time() + Duration::seconds(60));
        assert_eq!(snapshot.entries_in_window, 1);

        let total: i64 = snapshot.game_speeds.iter().map(|g| g.total_bytes).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn old_samples_evicted_on_write() {
        let tracker = SpeedTracker::new(std::time::Duration::from_secs(20));
        tracker.record(sample(0, 100, CacheStatus::Hit));
        tracker.record(sample(5, 100, CacheStatus::Hit));
        assert_eq!(tracker.sample_count(), 2);

        // 30s later: both earlier samples fall out of the max window.
        tracker.record(sample(35, 100, CacheStatus::Hit));
        assert_eq!(tracker.sample_count(), 1);
    }

    #[test]
    fn zero_byte_samples_are_ignored() {
        let tracker = SpeedTracker::new(std::time::Duration::from_secs(20));
        tracker.record(sample(0, 0, CacheStatus::Hit));
        assert_eq!(tracker.sample_count(), 0);
    }

    #[test]
    fn keyless_traffic_counts_for_clients_but_not_games() {
        let tracker = SpeedTracker::new(std::time::Duration::from_secs(60));
        let mut s = sample(1, 4000, CacheStatus::Miss);
        s.game_label = None;
        tracker.record(s);

        let snapshot = tracker.snapshot_at(10, base_time() + Duration::seconds(2));
        assert!(snapshot.game_speeds.is_empty());
        assert_eq!(snapshot.client_speeds.len(), 1);
        assert!(!snapshot.has_active_downloads);
    }
}
