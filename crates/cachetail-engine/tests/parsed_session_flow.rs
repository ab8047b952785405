//! End-to-end over the in-memory half of the pipeline: real access-log lines
//! through the parser, then the correlator, checking the deltas that would
//! reach the batch writer.

use cachetail_engine::{ResolverCache, SessionCorrelator};
use cachetail_parse::AccessLineParser;
use cachetail_types::{CacheStatus, ContentKey, GameKey, IngestDelta, ResolvedApp};
use std::sync::Arc;
use std::time::Duration;

fn steam_line(secs: u32, bytes: i64, status: &str) -> String {
    format!(
        r#"[steam] 172.16.1.143 / - - - [29/Aug/2025:19:48:{:02} -0500] "GET /depot/2767031/chunk/{} HTTP/1.1" 200 {} "-" "Valve/Steam HTTP Client 1.0" "{}" "fastly.cdn.steampipe.steamcontent.com" "-""#,
        secs, secs, bytes, status
    )
}

#[test]
fn three_chunk_burst_becomes_one_download() {
    let parser = AccessLineParser::new();
    let resolver = Arc::new(ResolverCache::new());
    let mut correlator = SessionCorrelator::new(Duration::from_secs(30), Arc::clone(&resolver));

    let mut deltas = Vec::new();
    for (i, line) in [
        steam_line(10, 1000, "HIT"),
        steam_line(11, 2000, "MISS"),
        steam_line(12, 500, "HIT"),
    ]
    .iter()
    .enumerate()
    {
        let entry = parser.parse_line(line, i as u64).unwrap();
        assert_eq!(entry.content_key, ContentKey::SteamDepot(2767031));
        deltas.extend(correlator.ingest(entry));
    }

    let opened: Vec<_> = deltas
        .iter()
        .filter(|d| matches!(d, IngestDelta::DownloadOpened { .. }))
        .collect();
    assert_eq!(opened.len(), 1);
    assert_eq!(correlator.active_session_count(), 1);

    let (mut hit, mut miss) = (0i64, 0i64);
    for delta in &deltas {
        match delta {
            IngestDelta::DownloadOpened {
                hit_bytes,
                miss_bytes,
                ..
            } => {
                hit += hit_bytes;
                miss += miss_bytes;
            }
            IngestDelta::DownloadExtended {
                hit_delta,
                miss_delta,
                ..
            } => {
                hit += hit_delta;
                miss += miss_delta;
            }
            _ => {}
        }
    }
    assert_eq!(hit, 1500);
    assert_eq!(miss, 2000);
}

#[test]
fn resolved_depot_opens_with_app_identity() {
    let parser = AccessLineParser::new();
    let resolver = Arc::new(ResolverCache::new());
    resolver.install(vec![(
        2767031,
        ResolvedApp {
            app_id: 2767030,
            name: Some("Marvel Rivals".to_string()),
        },
    )]);
    let mut correlator = SessionCorrelator::new(Duration::from_secs(30), Arc::clone(&resolver));

    let entry = parser.parse_line(&steam_line(10, 1000, "MISS"), 0).unwrap();
    assert_eq!(entry.cache_status, CacheStatus::Miss);

    let deltas = correlator.ingest(entry);
    let game = deltas.iter().find_map(|d| match d {
        IngestDelta::DownloadOpened { game, .. } => Some(game.clone()),
        _ => None,
    });

    assert_eq!(
        game,
        Some(GameKey::App(ResolvedApp {
            app_id: 2767030,
            name: Some("Marvel Rivals".to_string()),
        }))
    );
}

#[test]
fn shutdown_closes_parsed_sessions() {
    let parser = AccessLineParser::new();
    let resolver = Arc::new(ResolverCache::new());
    let mut correlator = SessionCorrelator::new(Duration::from_secs(30), resolver);

    let entry = parser.parse_line(&steam_line(10, 1000, "HIT"), 0).unwrap();
    correlator.ingest(entry);

    let deltas = correlator.finish();
    assert_eq!(deltas.len(), 1);
    assert!(matches!(deltas[0], IngestDelta::DownloadClosed { .. }));
    assert_eq!(correlator.active_session_count(), 0);
}
