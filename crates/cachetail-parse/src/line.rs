use crate::error::{ParseError, Result};
use cachetail_types::{CacheStatus, ContentKey, LogEntry, Service};
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

/// Health-check endpoints legitimately carry no cache status and should not
/// feed the correlator or the speed window.
pub fn is_heartbeat_url(url: &str) -> bool {
    url.contains("/lancache-heartbeat") || url.contains("/health") || url.contains("/ping")
}

/// Parser for the proxy's fixed access-log grammar:
///
/// ```text
/// [service] ip / - - - [timestamp] "METHOD URL HTTP/v" status bytes "ref" "ua" "HIT|MISS" "upstream" "-"
/// ```
///
/// One instance per parser worker; instances are independent and the parse is
/// a pure function of the line.
pub struct AccessLineParser {
    main: Regex,
    steam_depot: Regex,
    blizzard_archive: Regex,
}

impl AccessLineParser {
    pub fn new() -> Self {
        let main = Regex::new(
            r#"^(?:\[(?P<service>[^\]]+)\]\s+)?(?P<ip>\S+)\s+/\s+-\s+-\s+-\s+\[(?P<time>[^\]]+)\]\s+"(?P<method>[A-Z]+)\s+(?P<url>\S+)(?:\s+HTTP/(?P<httpVersion>[^"\s]+))?"\s+(?P<status>\d{3})\s+(?P<bytes>-|\d+)(?P<rest>.*)$"#,
        )
        .expect("access-log grammar regex");

        let steam_depot = Regex::new(r"/depot/(\d+)/").expect("steam depot regex");
        let blizzard_archive =
            Regex::new(r"/tpr/[^/]+/data/[0-9a-f]{2}/[0-9a-f]{2}/([0-9a-f]{16,})")
                .expect("blizzard archive regex");

        Self {
            main,
            steam_depot,
            blizzard_archive,
        }
    }

    /// Parse one physical line. `source_offset` is the byte offset of the end
    /// of this line in the log file; it travels with the entry so the batch
    /// writer can persist a resume point.
    pub fn parse_line(&self, line: &str, source_offset: u64) -> Result<LogEntry> {
        let captures = self.main.captures(line).ok_or(ParseError::Grammar)?;

        let service = captures
            .name("service")
            .map(|m| Service::from_tag(m.as_str()))
            .unwrap_or(Service::Other("unknown".to_string()));

        let client_ip = captures
            .name("ip")
            .ok_or(ParseError::Field("client"))?
            .as_str()
            .to_string();
        let method = captures
            .name("method")
            .ok_or(ParseError::Field("method"))?
            .as_str()
            .to_string();
        let url = captures
            .name("url")
            .ok_or(ParseError::Field("url"))?
            .as_str()
            .to_string();
        let status: u16 = captures
            .name("status")
            .ok_or(ParseError::Field("status"))?
            .as_str()
            .parse()
            .map_err(|_| ParseError::Field("status"))?;

        let bytes_str = captures
            .name("bytes")
            .ok_or(ParseError::Field("bytes"))?
            .as_str();
        let bytes: i64 = if bytes_str == "-" {
            0
        } else {
            bytes_str.parse().map_err(|_| ParseError::Field("bytes"))?
        };

        let time_str = captures
            .name("time")
            .ok_or(ParseError::Field("timestamp"))?
            .as_str();
        let timestamp = parse_timestamp(time_str)?;

        let rest = captures.name("rest").map(|m| m.as_str()).unwrap_or("");
        let cache_status = extract_cache_status(rest);

        let content_key = self.extract_content_key(&service, &url);

        Ok(LogEntry {
            timestamp,
            client_ip,
            method,
            url,
            status,
            bytes,
            cache_status,
            service,
            content_key,
            source_offset,
        })
    }

    /// Content-key recognition is service-specific: a Steam depot path
    /// segment, a Blizzard TACT archive hash, none for everything else.
    fn extract_content_key(&self, service: &Service, url: &str) -> ContentKey {
        match service {
            Service::Steam => self
                .steam_depot
                .captures(url)
                .and_then(|cap| cap.get(1))
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .map(ContentKey::SteamDepot)
                .unwrap_or(ContentKey::None),
            Service::Blizzard => self
                .blizzard_archive
                .captures(url)
                .and_then(|cap| cap.get(1))
                .map(|m| ContentKey::BlizzardArchive(m.as_str().to_string()))
                .unwrap_or(ContentKey::None),
            _ => ContentKey::None,
        }
    }
}

impl Default for AccessLineParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an nginx-style `dd/MMM/yyyy:HH:mm:ss ±HHMM` timestamp into UTC.
/// ISO-shaped timestamps without an explicit offset are taken as already-UTC.
fn parse_timestamp(time_str: &str) -> Result<DateTime<Utc>> {
    // Only a trailing `±HHMM` counts as a timezone; the hyphens inside an
    // ISO date must not be latched onto.
    let (naive_part, tz_offset_secs) = match time_str.rfind(['+', '-']) {
        Some(pos) if is_tz_suffix(&time_str[pos..]) => {
            let tz_str = &time_str[pos..];
            let sign = if tz_str.starts_with('-') { -1 } else { 1 };
            let hours: i32 = tz_str[1..3]
                .parse()
                .map_err(|_| ParseError::Timestamp(time_str.to_string()))?;
            let minutes: i32 = tz_str[3..5]
                .parse()
                .map_err(|_| ParseError::Timestamp(time_str.to_string()))?;
            (
                time_str[..pos].trim(),
                Some(sign * (hours * 3600 + minutes * 60)),
            )
        }
        _ => (time_str, None),
    };

    let naive = NaiveDateTime::parse_from_str(naive_part, "%d/%b/%Y:%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(naive_part, "%Y-%m-%d %H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(naive_part, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|_| ParseError::Timestamp(time_str.to_string()))?;

    if let Some(offset_secs) = tz_offset_secs {
        if let Some(offset) = FixedOffset::east_opt(offset_secs) {
            if let Some(dt) = offset.from_local_datetime(&naive).earliest() {
                return Ok(dt.with_timezone(&Utc));
            }
        }
    }

    Ok(Utc.from_utc_datetime(&naive))
}

fn is_tz_suffix(s: &str) -> bool {
    s.len() == 5 && s[1..].bytes().all(|b| b.is_ascii_digit())
}

/// The cache status is the third trailing quoted field: `"ref" "ua" "HIT"`.
fn extract_cache_status(rest: &str) -> CacheStatus {
    let mut quote_count = 0;
    let mut start_idx = None;

    for (i, ch) in rest.char_indices() {
        if ch == '"' {
            quote_count += 1;
            if quote_count == 5 {
                start_idx = Some(i + 1);
            } else if quote_count == 6 {
                if let Some(start) = start_idx {
                    return CacheStatus::from_token(&rest[start..i]);
                }
                break;
            }
        }
    }

    CacheStatus::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEAM_LINE: &str = r#"[steam] 172.16.1.143 / - - - [29/Aug/2025:19:48:49 -0500] "GET /depot/2767031/chunk/115d1e0e2ea9e4ed02b5111c5e3d061d052c292a HTTP/1.1" 200 414016 "-" "Valve/Steam HTTP Client 1.0" "MISS" "fastly.cdn.steampipe.steamcontent.com" "-""#;

    #[test]
    fn parses_steam_chunk_line() {
        let parser = AccessLineParser::new();
        let entry = parser.parse_line(STEAM_LINE, 42).unwrap();

        assert_eq!(entry.service, Service::Steam);
        assert_eq!(entry.client_ip, "172.16.1.143");
        assert_eq!(entry.method, "GET");
        assert_eq!(entry.status, 200);
        assert_eq!(entry.bytes, 414016);
        assert_eq!(entry.cache_status, CacheStatus::Miss);
        assert_eq!(entry.content_key, ContentKey::SteamDepot(2767031));
        assert_eq!(entry.source_offset, 42);
    }

    #[test]
    fn parses_heartbeat_line_with_localhost_service() {
        let parser = AccessLineParser::new();
        let line = r#"[127.0.0.1] 127.0.0.1 / - - - [10/Jan/2024:16:28:34 -0600] "GET /lancache-heartbeat HTTP/1.1" 204 0 "-" "Wget/1.19.4 (linux-gnu)" "-" "127.0.0.1" "-""#;

        let entry = parser.parse_line(line, 0).unwrap();
        assert_eq!(entry.service, Service::Localhost);
        assert_eq!(entry.bytes, 0);
        assert_eq!(entry.cache_status, CacheStatus::Unknown);
        assert!(is_heartbeat_url(&entry.url));
    }

    #[test]
    fn dash_bytes_parse_as_zero() {
        let parser = AccessLineParser::new();
        let line = r#"[steam] 10.0.0.7 / - - - [10/Jan/2024:16:28:34 -0600] "GET /depot/441/manifest HTTP/1.1" 304 - "-" "Valve/Steam HTTP Client 1.0" "HIT" "-" "-""#;

        let entry = parser.parse_line(line, 0).unwrap();
        assert_eq!(entry.bytes, 0);
        assert_eq!(entry.cache_status, CacheStatus::Hit);
    }

    #[test]
    fn timestamp_offset_converts_to_utc() {
        let parser = AccessLineParser::new();
        let entry = parser.parse_line(STEAM_LINE, 0).unwrap();

        // 19:48:49 -0500 is 00:48:49 UTC the next day.
        assert_eq!(entry.timestamp.to_rfc3339(), "2025-08-30T00:48:49+00:00");
    }

    #[test]
    fn iso_timestamps_without_offset_parse_as_utc() {
        let parser = AccessLineParser::new();

        let spaced = r#"[steam] 10.0.0.7 / - - - [2024-01-10 16:28:34] "GET /depot/441/chunk/aa HTTP/1.1" 200 100 "-" "Valve/Steam HTTP Client 1.0" "HIT" "-" "-""#;
        let entry = parser.parse_line(spaced, 0).unwrap();
        assert_eq!(entry.timestamp.to_rfc3339(), "2024-01-10T16:28:34+00:00");

        let t_separated = r#"[steam] 10.0.0.7 / - - - [2024-01-10T16:28:34] "GET /depot/441/chunk/bb HTTP/1.1" 200 100 "-" "Valve/Steam HTTP Client 1.0" "HIT" "-" "-""#;
        let entry = parser.parse_line(t_separated, 0).unwrap();
        assert_eq!(entry.timestamp.to_rfc3339(), "2024-01-10T16:28:34+00:00");
    }

    #[test]
    fn blizzard_archive_key_extracted() {
        let parser = AccessLineParser::new();
        let line = r#"[blizzard] 10.0.0.9 / - - - [10/Jan/2024:10:00:00 +0000] "GET /tpr/wow/data/3b/f0/3bf0a72e9d1f2a44c0e8b1b65a29c1f0 HTTP/1.1" 206 1048576 "-" "Battle.net" "HIT" "level3.blizzard.com" "-""#;

        let entry = parser.parse_line(line, 0).unwrap();
        assert_eq!(
            entry.content_key,
            ContentKey::BlizzardArchive("3bf0a72e9d1f2a44c0e8b1b65a29c1f0".to_string())
        );
    }

    #[test]
    fn depot_path_outside_steam_is_not_a_key() {
        let parser = AccessLineParser::new();
        let line = r#"[epicgames] 10.0.0.9 / - - - [10/Jan/2024:10:00:00 +0000] "GET /depot/999/chunk/aa HTTP/1.1" 200 100 "-" "EpicGamesLauncher" "MISS" "epicgames-download1.akamaized.net" "-""#;

        let entry = parser.parse_line(line, 0).unwrap();
        assert_eq!(entry.service, Service::Epic);
        assert_eq!(entry.content_key, ContentKey::None);
    }

    #[test]
    fn malformed_line_is_grammar_error() {
        let parser = AccessLineParser::new();
        assert_eq!(
            parser.parse_line("not a log line at all", 0),
            Err(ParseError::Grammar)
        );
        assert_eq!(parser.parse_line("", 0), Err(ParseError::Grammar));
    }

    #[test]
    fn missing_cache_status_is_unknown() {
        let parser = AccessLineParser::new();
        let line = r#"[steam] 10.0.0.7 / - - - [10/Jan/2024:16:28:34 -0600] "GET /depot/441/chunk/aa HTTP/1.1" 200 100"#;

        let entry = parser.parse_line(line, 0).unwrap();
        assert_eq!(entry.cache_status, CacheStatus::Unknown);
    }
}
