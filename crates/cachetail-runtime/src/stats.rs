use crate::Result;
use cachetail_store::{ClientStatsRow, Database, DownloadRow, ServiceStatsRow};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Cached<T> {
    value: Option<T>,
    fetched_at: Instant,
}

impl<T> Cached<T> {
    fn empty() -> Self {
        Self {
            value: None,
            fetched_at: Instant::now(),
        }
    }

    fn fresh(&self, ttl: Duration) -> bool {
        self.value.is_some() && self.fetched_at.elapsed() < ttl
    }
}

/// TTL read-through cache over store queries, so a dashboard polling several
/// times a second does not turn into a query storm against the same
/// connection the batch writer needs. Active downloads use a short TTL;
/// lifetime aggregates change slowly and get a longer one.
pub struct StatsCache {
    db: Arc<Mutex<Database>>,
    active_ttl: Duration,
    lifetime_ttl: Duration,
    active: Mutex<Cached<Vec<DownloadRow>>>,
    clients: Mutex<Cached<Vec<ClientStatsRow>>>,
    services: Mutex<Cached<Vec<ServiceStatsRow>>>,
}

impl StatsCache {
    pub fn new(db: Arc<Mutex<Database>>, active_ttl: Duration, lifetime_ttl: Duration) -> Self {
        Self {
            db,
            active_ttl,
            lifetime_ttl,
            active: Mutex::new(Cached::empty()),
            clients: Mutex::new(Cached::empty()),
            services: Mutex::new(Cached::empty()),
        }
    }

    /// Currently active downloads, de-duplicated at read time by
    /// (game label, client, service). Rows carrying a resolved name win over
    /// placeholder-labeled rows left behind by a restart.
    pub fn active_downloads(&self) -> Result<Vec<DownloadRow>> {
        let mut cached = self.active.lock().expect("stats cache poisoned");
        if cached.fresh(self.active_ttl) {
            if let Some(rows) = &cached.value {
                return Ok(rows.clone());
            }
        }

        let rows = {
            let db = self.db.lock().expect("database lock poisoned");
            db.get_active_downloads()?
        };
        let rows = dedup_active(rows);

        cached.value = Some(rows.clone());
        cached.fetched_at = Instant::now();
        Ok(rows)
    }

    pub fn client_stats(&self) -> Result<Vec<ClientStatsRow>> {
        let mut cached = self.clients.lock().expect("stats cache poisoned");
        if cached.fresh(self.lifetime_ttl) {
            if let Some(rows) = &cached.value {
                return Ok(rows.clone());
            }
        }

        let rows = {
            let db = self.db.lock().expect("database lock poisoned");
            db.get_client_stats()?
        };

        cached.value = Some(rows.clone());
        cached.fetched_at = Instant::now();
        Ok(rows)
    }

    pub fn service_stats(&self) -> Result<Vec<ServiceStatsRow>> {
        let mut cached = self.services.lock().expect("stats cache poisoned");
        if cached.fresh(self.lifetime_ttl) {
            if let Some(rows) = &cached.value {
                return Ok(rows.clone());
            }
        }

        let rows = {
            let db = self.db.lock().expect("database lock poisoned");
            db.get_service_stats()?
        };

        cached.value = Some(rows.clone());
        cached.fetched_at = Instant::now();
        Ok(rows)
    }

    /// Drop the active-download cache so the next read reflects a download
    /// that just opened or closed, without waiting out the TTL.
    pub fn invalidate_active(&self) {
        self.active.lock().expect("stats cache poisoned").value = None;
    }
}

fn dedup_active(rows: Vec<DownloadRow>) -> Vec<DownloadRow> {
    let mut best: HashMap<(String, String, String), DownloadRow> = HashMap::new();

    for row in rows {
        let key = (
            row.game_label.clone(),
            row.client_ip.clone(),
            row.service.clone(),
        );
        match best.get(&key) {
            Some(existing) => {
                let prefer = (row.game_name.is_some() && existing.game_name.is_none())
                    || (row.game_name.is_some() == existing.game_name.is_some()
                        && row.end_ts > existing.end_ts);
                if prefer {
                    best.insert(key, row);
                }
            }
            None => {
                best.insert(key, row);
            }
        }
    }

    let mut rows: Vec<DownloadRow> = best.into_values().collect();
    rows.sort_by(|a, b| b.end_ts.cmp(&a.end_ts));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachetail_types::{CacheStatus, ContentKey, GameKey, IngestDelta, LogEntry, Service};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn seeded_db() -> Arc<Mutex<Database>> {
        let mut db = Database::open_in_memory().unwrap();
        let start = Utc.timestamp_opt(1_756_500_000, 0).unwrap();

        let deltas = vec![
            IngestDelta::Entry {
                entry: LogEntry {
                    timestamp: start,
                    client_ip: "10.0.0.5".to_string(),
                    method: "GET".to_string(),
                    url: "/depot/441/chunk/a".to_string(),
                    status: 200,
                    bytes: 1000,
                    cache_status: CacheStatus::Hit,
                    service: Service::Steam,
                    content_key: ContentKey::SteamDepot(441),
                    source_offset: 100,
                },
                download_id: None,
            },
            IngestDelta::DownloadOpened {
                id: Uuid::new_v4(),
                client_ip: "10.0.0.5".to_string(),
                service: Service::Steam,
                game: GameKey::Content(ContentKey::SteamDepot(441)),
                start,
                end: start,
                hit_bytes: 1000,
                miss_bytes: 0,
            },
        ];

        db.apply_batch(&deltas, None).unwrap();
        Arc::new(Mutex::new(db))
    }

    #[test]
    fn active_reads_are_cached_within_ttl() {
        let db = seeded_db();
        let cache = StatsCache::new(
            Arc::clone(&db),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );

        let first = cache.active_downloads().unwrap();
        assert_eq!(first.len(), 1);

        // Close the row behind the cache's back; the cached view persists.
        {
            let db = db.lock().unwrap();
            db.close_stale_active_downloads().unwrap();
        }
        let second = cache.active_downloads().unwrap();
        assert_eq!(second.len(), 1);

        // Explicit invalidation forces a re-read.
        cache.invalidate_active();
        let third = cache.active_downloads().unwrap();
        assert!(third.is_empty());
    }

    #[test]
    fn lifetime_stats_survive_closed_downloads() {
        let db = seeded_db();
        {
            let db = db.lock().unwrap();
            db.close_stale_active_downloads().unwrap();
        }

        let cache = StatsCache::new(db, Duration::from_millis(0), Duration::from_secs(60));
        assert!(cache.active_downloads().unwrap().is_empty());

        let clients = cache.client_stats().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].total_hit_bytes, 1000);

        let services = cache.service_stats().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service, "steam");
    }

    #[test]
    fn dedup_prefers_resolved_names() {
        let now = Utc.timestamp_opt(1_756_500_000, 0).unwrap();
        let row = |name: Option<&str>| DownloadRow {
            id: Uuid::new_v4().to_string(),
            client_ip: "10.0.0.5".to_string(),
            service: "steam".to_string(),
            game_label: "730".to_string(),
            game_app_id: Some(730),
            game_name: name.map(|n| n.to_string()),
            start_ts: now,
            end_ts: now,
            hit_bytes: 0,
            miss_bytes: 0,
            active: true,
        };

        let deduped = dedup_active(vec![row(None), row(Some("Counter-Strike 2"))]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].game_name.as_deref(), Some("Counter-Strike 2"));
    }
}
