use crate::resolver::ResolverCache;
use cachetail_types::{GameKey, IngestDelta, LogEntry};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

// NOTE: Correlation key choice (resolves the unresolved-merge question)
//
// Sessions are grouped by (client, service, raw content key), never by the
// resolved label. A depot learning its app id mid-stream therefore cannot
// split one physical session into two or force a merge of rows: the key is
// stable, and resolution is a relabel riding on the next Extended delta.
// The tie-break "prefer the session with a resolved name" falls out of the
// same choice: there is at most one candidate session per key, and it keeps
// its resolved name once it has one.

/// Per grouping key the lifecycle is `absent → active → closed`. A session
/// with no matching entry for longer than `idle_timeout` is closed either by
/// the periodic [`tick`](SessionCorrelator::tick) sweep or, retroactively, by
/// the next entry for its key; an entry arriving before the sweep observes a
/// gap within the timeout and extends the session instead, which is exactly
/// the `closing → active` reversion the lifecycle requires.
pub struct SessionCorrelator {
    idle_timeout: Duration,
    resolver: Arc<ResolverCache>,
    sessions: HashMap<SessionKey, ActiveSession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    client_ip: String,
    service: String,
    content: String,
}

impl SessionKey {
    fn for_entry(entry: &LogEntry) -> Self {
        Self {
            client_ip: entry.client_ip.clone(),
            service: entry.service.name().to_string(),
            content: entry.content_key.label(),
        }
    }
}

#[derive(Debug)]
struct ActiveSession {
    id: Uuid,
    start: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    game: GameKey,
    hit_bytes: i64,
    miss_bytes: i64,
}

impl SessionCorrelator {
    pub fn new(idle_timeout: std::time::Duration, resolver: Arc<ResolverCache>) -> Self {
        Self {
            idle_timeout: Duration::from_std(idle_timeout).unwrap_or(Duration::seconds(30)),
            resolver,
            sessions: HashMap::new(),
        }
    }

    /// Consume one entry (entries for the same key arrive in order) and
    /// produce the resulting create/extend/close deltas.
    pub fn ingest(&mut self, entry: LogEntry) -> Vec<IngestDelta> {
        let key = SessionKey::for_entry(&entry);
        let mut deltas = Vec::with_capacity(3);

        // A stale session under this key is closed before the entry is
        // attached, so a gap larger than the timeout starts a fresh session.
        let stale = self
            .sessions
            .get(&key)
            .map(|s| entry.timestamp.signed_duration_since(s.last_seen) > self.idle_timeout)
            .unwrap_or(false);
        if stale {
            if let Some(session) = self.sessions.remove(&key) {
                deltas.push(IngestDelta::DownloadClosed {
                    id: session.id,
                    end: session.last_seen,
                });
            }
        }

        let hit = entry.hit_bytes();
        let miss = entry.miss_bytes();
        let resolved_now = self.resolver.game_key_for(&entry.content_key);

        match self.sessions.get_mut(&key) {
            Some(session) => {
                // end advances monotonically even if chunk timestamps jitter
                let end = session.last_seen.max(entry.timestamp);
                session.last_seen = end;
                session.hit_bytes += hit;
                session.miss_bytes += miss;

                let relabel = if resolved_now.is_resolved() && resolved_now != session.game {
                    session.game = resolved_now.clone();
                    Some(resolved_now)
                } else {
                    None
                };

                let id = session.id;
                deltas.push(IngestDelta::Entry {
                    download_id: Some(id),
                    entry: entry.clone(),
                });
                deltas.push(IngestDelta::DownloadExtended {
                    id,
                    client_ip: entry.client_ip,
                    service: entry.service,
                    end,
                    hit_delta: hit,
                    miss_delta: miss,
                    relabel,
                });
            }
            None => {
                let id = Uuid::new_v4();
                self.sessions.insert(
                    key,
                    ActiveSession {
                        id,
                        start: entry.timestamp,
                        last_seen: entry.timestamp,
                        game: resolved_now.clone(),
                        hit_bytes: hit,
                        miss_bytes: miss,
                    },
                );

                deltas.push(IngestDelta::Entry {
                    download_id: Some(id),
                    entry: entry.clone(),
                });
                deltas.push(IngestDelta::DownloadOpened {
                    id,
                    client_ip: entry.client_ip,
                    service: entry.service,
                    game: resolved_now,
                    start: entry.timestamp,
                    end: entry.timestamp,
                    hit_bytes: hit,
                    miss_bytes: miss,
                });
            }
        }

        deltas
    }

    /// Sweep sessions whose idle gap exceeded the timeout as of `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<IngestDelta> {
        let idle_timeout = self.idle_timeout;
        let expired: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, session)| now.signed_duration_since(session.last_seen) > idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();

        let mut deltas = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(session) = self.sessions.remove(&key) {
                deltas.push(IngestDelta::DownloadClosed {
                    id: session.id,
                    end: session.last_seen,
                });
            }
        }

        deltas
    }

    /// Close every remaining session. Called on shutdown so no row is left
    /// active across a clean restart.
    pub fn finish(&mut self) -> Vec<IngestDelta> {
        let mut deltas = Vec::with_capacity(self.sessions.len());
        for (_, session) in self.sessions.drain() {
            deltas.push(IngestDelta::DownloadClosed {
                id: session.id,
                end: session.last_seen,
            });
        }
        deltas
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Duration covered so far by the session owning `entry`'s key, if any.
    #[cfg(test)]
    fn session_span(&self, entry: &LogEntry) -> Option<Duration> {
        self.sessions
            .get(&SessionKey::for_entry(entry))
            .map(|s| s.last_seen.signed_duration_since(s.start))
    }
}
