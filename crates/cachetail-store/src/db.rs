use crate::error::Result;
use crate::records::{ClientStatsRow, DownloadRow, FlushStats, ServiceStatsRow};
use cachetail_types::{CacheStatus, GameKey, IngestDelta, ResolvedApp, Service, SpeedSample};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

// NOTE: Write-path design
//
// Why delta application (not read-modify-write)?
// - The correlator emits immutable deltas; aggregates are bumped with
//   incremental UPSERTs, so no row is ever read then written back
// - Lost-update races are impossible even if consumer parallelism grows
//
// Why a natural-key unique index for duplicate suppression?
// - Log rotation re-reads and restart replay re-ingest identical lines
// - (client, service, ts, url, bytes) identifies a physical request; INSERT
//   OR IGNORE makes re-ingestion a no-op instead of an error
//
// Why replay credits?
// - A replayed line still flows through a fresh correlator, which emits
//   open/extend deltas under a new download id; dropping only the entry row
//   would double-count every aggregate and mint a phantom download
// - Each suppressed duplicate banks one credit against its download id; the
//   next session delta for that id consumes the credit and is skipped whole
// - Credits are keyed per id, so mixed batches (some lines new, some
//   replayed) suppress exactly the replayed portion
//
// Why persist the reader offset inside the batch transaction?
// - The offset must never point past data that was not committed; riding in
//   the same transaction keeps the resume point and the rows atomic

/// Owning handle over the SQLite store. One writer at a time; the pipeline
/// shares it behind `Arc<Mutex<Database>>`.
pub struct Database {
    conn: Connection,
    /// Outstanding duplicate-entry credits per download id. An entry and its
    /// session deltas can land in different batches, so this outlives a
    /// single `apply_batch` call.
    replay_credits: HashMap<Uuid, u32>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(60))?;

        let db = Self {
            conn,
            replay_credits: HashMap::new(),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            replay_credits: HashMap::new(),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS log_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                client_ip TEXT NOT NULL,
                service TEXT NOT NULL,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                status INTEGER NOT NULL,
                bytes INTEGER NOT NULL,
                cache_status TEXT NOT NULL,
                content_key TEXT,
                download_id TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_natural_key
                ON log_entries(client_ip, service, ts, url, bytes);
            CREATE INDEX IF NOT EXISTS idx_entries_download
                ON log_entries(download_id);

            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                client_ip TEXT NOT NULL,
                service TEXT NOT NULL,
                game_label TEXT NOT NULL,
                game_app_id INTEGER,
                game_name TEXT,
                start_ts TEXT NOT NULL,
                end_ts TEXT NOT NULL,
                hit_bytes INTEGER NOT NULL DEFAULT 0,
                miss_bytes INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_active ON downloads(active);
            CREATE INDEX IF NOT EXISTS idx_downloads_client ON downloads(client_ip);
            CREATE INDEX IF NOT EXISTS idx_downloads_end ON downloads(end_ts DESC);

            CREATE TABLE IF NOT EXISTS client_stats (
                client_ip TEXT PRIMARY KEY,
                total_hit_bytes INTEGER NOT NULL DEFAULT 0,
                total_miss_bytes INTEGER NOT NULL DEFAULT 0,
                download_count INTEGER NOT NULL DEFAULT 0,
                last_seen_ts TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS service_stats (
                service TEXT PRIMARY KEY,
                total_hit_bytes INTEGER NOT NULL DEFAULT 0,
                total_miss_bytes INTEGER NOT NULL DEFAULT 0,
                download_count INTEGER NOT NULL DEFAULT 0,
                last_seen_ts TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ingest_state (
                log_path TEXT PRIMARY KEY,
                byte_offset INTEGER NOT NULL,
                updated_ts TEXT NOT NULL
            );

            -- Written by the external depot resolver; the pipeline only reads it.
            CREATE TABLE IF NOT EXISTS depot_mappings (
                depot_id INTEGER PRIMARY KEY,
                app_id INTEGER NOT NULL,
                app_name TEXT
            );
            "#,
        )?;

        Ok(())
    }

    /// Apply one batch of pending deltas in a single atomic transaction.
    /// `offset_key` is the log path the offset watermark is recorded under.
    pub fn apply_batch(
        &mut self,
        deltas: &[IngestDelta],
        offset_key: Option<&str>,
    ) -> Result<FlushStats> {
        // Work on a copy of the credit ledger; a failed flush is retried with
        // the same batch, so credits must not be consumed until the commit
        // actually lands.
        let mut credits = self.replay_credits.clone();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut stats = FlushStats::default();

        for delta in deltas {
            match delta {
                IngestDelta::Entry { entry, download_id } => {
                    let changed = tx.execute(
                        r#"
                        INSERT OR IGNORE INTO log_entries
                            (ts, client_ip, service, method, url, status, bytes,
                             cache_status, content_key, download_id)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                        "#,
                        params![
                            ts_to_sql(&entry.timestamp),
                            &entry.client_ip,
                            entry.service.name(),
                            &entry.method,
                            &entry.url,
                            entry.status,
                            entry.bytes,
                            entry.cache_status.as_str(),
                            entry.content_key.label(),
                            download_id.map(|id| id.to_string()),
                        ],
                    )?;

                    if changed == 0 {
                        stats.duplicates_dropped += 1;
                        if let Some(id) = download_id {
                            *credits.entry(*id).or_insert(0) += 1;
                        }
                    } else {
                        stats.entries_inserted += 1;
                    }

                    if Some(entry.source_offset) > stats.last_offset {
                        stats.last_offset = Some(entry.source_offset);
                    }
                }

                IngestDelta::DownloadOpened {
                    id,
                    client_ip,
                    service,
                    game,
                    start,
                    end,
                    hit_bytes,
                    miss_bytes,
                } => {
                    if consume_credit(&mut credits, id) {
                        continue;
                    }

                    tx.execute(
                        r#"
                        INSERT INTO downloads
                            (id, client_ip, service, game_label, game_app_id, game_name,
                             start_ts, end_ts, hit_bytes, miss_bytes, active)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)
                        ON CONFLICT(id) DO UPDATE SET
                            end_ts = ?8,
                            hit_bytes = ?9,
                            miss_bytes = ?10,
                            active = 1
                        "#,
                        params![
                            id.to_string(),
                            client_ip,
                            service.name(),
                            game.label(),
                            game.app_id(),
                            game.game_name(),
                            ts_to_sql(start),
                            ts_to_sql(end),
                            hit_bytes,
                            miss_bytes,
                        ],
                    )?;
                    stats.downloads_opened += 1;

                    bump_client_stats(&tx, client_ip, *hit_bytes, *miss_bytes, 1, end)?;
                    bump_service_stats(&tx, service.name(), *hit_bytes, *miss_bytes, 1, end)?;
                }

                IngestDelta::DownloadExtended {
                    id,
                    client_ip,
                    service,
                    end,
                    hit_delta,
                    miss_delta,
                    relabel,
                } => {
                    if consume_credit(&mut credits, id) {
                        continue;
                    }

                    match relabel {
                        Some(game) => {
                            tx.execute(
                                r#"
                                UPDATE downloads SET
                                    end_ts = ?2,
                                    hit_bytes = hit_bytes + ?3,
                                    miss_bytes = miss_bytes + ?4,
                                    game_label = ?5,
                                    game_app_id = ?6,
                                    game_name = ?7
                                WHERE id = ?1
                                "#,
                                params![
                                    id.to_string(),
                                    ts_to_sql(end),
                                    hit_delta,
                                    miss_delta,
                                    game.label(),
                                    game.app_id(),
                                    game.game_name(),
                                ],
                            )?;
                        }
                        None => {
                            tx.execute(
                                r#"
                                UPDATE downloads SET
                                    end_ts = ?2,
                                    hit_bytes = hit_bytes + ?3,
                                    miss_bytes = miss_bytes + ?4
                                WHERE id = ?1
                                "#,
                                params![id.to_string(), ts_to_sql(end), hit_delta, miss_delta],
                            )?;
                        }
                    }

                    bump_client_stats(&tx, client_ip, *hit_delta, *miss_delta, 0, end)?;
                    bump_service_stats(&tx, service.name(), *hit_delta, *miss_delta, 0, end)?;
                }

                IngestDelta::DownloadClosed { id, end } => {
                    let changed = tx.execute(
                        "UPDATE downloads SET active = 0, end_ts = MAX(end_ts, ?2) WHERE id = ?1",
                        params![id.to_string(), ts_to_sql(end)],
                    )?;
                    stats.downloads_closed += changed;
                    // A fully suppressed download never got a row; its close
                    // retires whatever credits remain for the id.
                    credits.remove(id);
                }
            }
        }

        if let (Some(offset), Some(key)) = (stats.last_offset, offset_key) {
            save_offset(&tx, key, offset)?;
        }

        tx.commit()?;
        self.replay_credits = credits;
        Ok(stats)
    }

    /// Close download rows left active by an unclean shutdown. Called once at
    /// startup before the pipeline begins.
    pub fn close_stale_active_downloads(&self) -> Result<usize> {
        let changed = self
            .conn
            .execute("UPDATE downloads SET active = 0 WHERE active = 1", [])?;
        Ok(changed)
    }

    pub fn get_ingest_offset(&self, log_path: &str) -> Result<Option<u64>> {
        let offset: Option<i64> = self
            .conn
            .query_row(
                "SELECT byte_offset FROM ingest_state WHERE log_path = ?1",
                [log_path],
                |row| row.get(0),
            )
            .optional()?;

        Ok(offset.map(|o| o as u64))
    }

    pub fn set_ingest_offset(&self, log_path: &str, offset: u64) -> Result<()> {
        save_offset(&self.conn, log_path, offset)?;
        Ok(())
    }

    pub fn get_active_downloads(&self) -> Result<Vec<DownloadRow>> {
        self.query_downloads("WHERE active = 1 ORDER BY end_ts DESC", &[])
    }

    pub fn get_recent_downloads(&self, limit: usize) -> Result<Vec<DownloadRow>> {
        self.query_downloads(
            "ORDER BY end_ts DESC LIMIT ?1",
            &[&(limit as i64) as &dyn rusqlite::ToSql],
        )
    }

    pub fn get_download(&self, id: &str) -> Result<Option<DownloadRow>> {
        let mut rows = self.query_downloads(
            "WHERE id = ?1 LIMIT 1",
            &[&id.to_string() as &dyn rusqlite::ToSql],
        )?;
        Ok(rows.pop())
    }

    fn query_downloads(
        &self,
        suffix: &str,
        query_params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<DownloadRow>> {
        let sql = format!(
            r#"
            SELECT id, client_ip, service, game_label, game_app_id, game_name,
                   start_ts, end_ts, hit_bytes, miss_bytes, active
            FROM downloads {}
            "#,
            suffix
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let downloads = stmt
            .query_map(query_params, |row| {
                Ok(DownloadRow {
                    id: row.get(0)?,
                    client_ip: row.get(1)?,
                    service: row.get(2)?,
                    game_label: row.get(3)?,
                    game_app_id: row.get(4)?,
                    game_name: row.get(5)?,
                    start_ts: sql_to_ts(row.get::<_, String>(6)?),
                    end_ts: sql_to_ts(row.get::<_, String>(7)?),
                    hit_bytes: row.get(8)?,
                    miss_bytes: row.get(9)?,
                    active: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(downloads)
    }

    pub fn get_client_stats(&self) -> Result<Vec<ClientStatsRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT client_ip, total_hit_bytes, total_miss_bytes, download_count, last_seen_ts
            FROM client_stats
            ORDER BY total_hit_bytes + total_miss_bytes DESC
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(ClientStatsRow {
                    client_ip: row.get(0)?,
                    total_hit_bytes: row.get(1)?,
                    total_miss_bytes: row.get(2)?,
                    download_count: row.get(3)?,
                    last_seen_ts: sql_to_ts(row.get::<_, String>(4)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    pub fn get_service_stats(&self) -> Result<Vec<ServiceStatsRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT service, total_hit_bytes, total_miss_bytes, download_count, last_seen_ts
            FROM service_stats
            ORDER BY total_hit_bytes + total_miss_bytes DESC
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(ServiceStatsRow {
                    service: row.get(0)?,
                    total_hit_bytes: row.get(1)?,
                    total_miss_bytes: row.get(2)?,
                    download_count: row.get(3)?,
                    last_seen_ts: sql_to_ts(row.get::<_, String>(4)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Recent entries re-shaped as speed samples, so a one-shot snapshot can
    /// be computed without a running pipeline. Names are not joined in;
    /// placeholder labels are good enough for a throughput view.
    pub fn get_speed_samples_since(&self, since: &DateTime<Utc>) -> Result<Vec<SpeedSample>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT ts, client_ip, service, content_key, bytes, cache_status
            FROM log_entries
            WHERE ts >= ?1
            ORDER BY ts ASC
            "#,
        )?;

        let samples = stmt
            .query_map([ts_to_sql(since)], |row| {
                let content_key: String = row.get(3)?;
                let status: String = row.get(5)?;
                Ok(SpeedSample {
                    timestamp: sql_to_ts(row.get::<_, String>(0)?),
                    client_ip: row.get(1)?,
                    service: Service::from_tag(&row.get::<_, String>(2)?),
                    game_label: (!content_key.is_empty()).then_some(content_key),
                    game_name: None,
                    bytes: row.get(4)?,
                    cache_status: CacheStatus::from_token(&status),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(samples)
    }

    pub fn count_entries(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM log_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Full depot mapping table, loaded periodically into the resolver cache.
    pub fn load_depot_mappings(&self) -> Result<Vec<(u32, ResolvedApp)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT depot_id, app_id, app_name FROM depot_mappings")?;

        let mappings = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    ResolvedApp {
                        app_id: row.get(1)?,
                        name: row.get(2)?,
                    },
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(mappings)
    }

    /// Glue for the external resolver (and for tests): record one mapping.
    pub fn upsert_depot_mapping(&self, depot_id: u32, app: &ResolvedApp) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO depot_mappings (depot_id, app_id, app_name)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(depot_id) DO UPDATE SET
                app_id = ?2,
                app_name = COALESCE(?3, app_name)
            "#,
            params![depot_id, app.app_id, app.name],
        )?;

        Ok(())
    }
}

/// Spend one banked duplicate credit for `id`, if any. Returns true when the
/// caller's session delta stems from a replayed line and must be skipped.
fn consume_credit(credits: &mut HashMap<Uuid, u32>, id: &Uuid) -> bool {
    match credits.get_mut(id) {
        Some(count) => {
            *count -= 1;
            if *count == 0 {
                credits.remove(id);
            }
            true
        }
        None => false,
    }
}

fn bump_client_stats(
    tx: &Transaction<'_>,
    client_ip: &str,
    hit_delta: i64,
    miss_delta: i64,
    download_delta: i64,
    last_seen: &DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO client_stats
            (client_ip, total_hit_bytes, total_miss_bytes, download_count, last_seen_ts)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(client_ip) DO UPDATE SET
            total_hit_bytes = total_hit_bytes + ?2,
            total_miss_bytes = total_miss_bytes + ?3,
            download_count = download_count + ?4,
            last_seen_ts = MAX(last_seen_ts, ?5)
        "#,
        params![
            client_ip,
            hit_delta,
            miss_delta,
            download_delta,
            ts_to_sql(last_seen)
        ],
    )?;

    Ok(())
}

fn bump_service_stats(
    tx: &Transaction<'_>,
    service: &str,
    hit_delta: i64,
    miss_delta: i64,
    download_delta: i64,
    last_seen: &DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO service_stats
            (service, total_hit_bytes, total_miss_bytes, download_count, last_seen_ts)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(service) DO UPDATE SET
            total_hit_bytes = total_hit_bytes + ?2,
            total_miss_bytes = total_miss_bytes + ?3,
            download_count = download_count + ?4,
            last_seen_ts = MAX(last_seen_ts, ?5)
        "#,
        params![
            service,
            hit_delta,
            miss_delta,
            download_delta,
            ts_to_sql(last_seen)
        ],
    )?;

    Ok(())
}

fn save_offset(conn: &Connection, log_path: &str, offset: u64) -> rusqlite::Result<()> {
    conn.execute(
        r#"
        INSERT INTO ingest_state (log_path, byte_offset, updated_ts)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(log_path) DO UPDATE SET
            byte_offset = ?2,
            updated_ts = ?3
        "#,
        params![log_path, offset as i64, ts_to_sql(&Utc::now())],
    )?;

    Ok(())
}

/// Timestamps are stored as RFC 3339 text in UTC. The fixed `+00:00` suffix
/// keeps lexical and chronological order identical, which MAX() relies on.
fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn sql_to_ts(text: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
