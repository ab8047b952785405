use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a request was served from local cache storage or fetched upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Unknown,
}

impl CacheStatus {
    pub fn from_token(token: &str) -> Self {
        match token {
            "HIT" => CacheStatus::Hit,
            "MISS" => CacheStatus::Miss,
            _ => CacheStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Unknown => "UNKNOWN",
        }
    }
}

/// Closed set of cache-proxy upstreams we recognize from the log's service tag.
///
/// The tag is whatever the proxy wrote between the leading brackets. Localhost
/// and bare-IP tags are collapsed into dedicated variants so heartbeat traffic
/// and direct-IP requests group consistently instead of producing one service
/// per address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Steam,
    Epic,
    Origin,
    Blizzard,
    Wsus,
    Riot,
    Localhost,
    IpAddress,
    Other(String),
}

impl Service {
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.to_lowercase();

        if tag == "localhost" || tag == "127" || tag.starts_with("127.") {
            return Service::Localhost;
        }

        // A tag made of nothing but digits and dots is an address, not a name.
        if tag.contains('.') && !tag.is_empty() {
            let non_ip = tag.chars().filter(|c| !c.is_ascii_digit() && *c != '.').count();
            if non_ip == 0 {
                return Service::IpAddress;
            }
        }

        match tag.as_str() {
            "steam" => Service::Steam,
            "epicgames" | "epic" => Service::Epic,
            "origin" => Service::Origin,
            "blizzard" => Service::Blizzard,
            "wsus" | "windowsupdates" => Service::Wsus,
            "riot" => Service::Riot,
            // Round-trips names written by `name()` back out of the store.
            "ip-address" => Service::IpAddress,
            _ => Service::Other(tag),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Service::Steam => "steam",
            Service::Epic => "epic",
            Service::Origin => "origin",
            Service::Blizzard => "blizzard",
            Service::Wsus => "wsus",
            Service::Riot => "riot",
            Service::Localhost => "localhost",
            Service::IpAddress => "ip-address",
            Service::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self::from_tag(name)
    }
}

/// Service-specific identifier extracted from a request URL, prior to being
/// resolved to a game identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentKey {
    /// Steam depot id from a `/depot/<id>/chunk/...` path.
    SteamDepot(u32),
    /// Blizzard TACT archive hash from a `/tpr/<product>/data/xx/yy/<hash>` path.
    BlizzardArchive(String),
    None,
}

impl ContentKey {
    pub fn is_none(&self) -> bool {
        matches!(self, ContentKey::None)
    }

    /// Stable string form used for session grouping and unresolved labels.
    pub fn label(&self) -> String {
        match self {
            ContentKey::SteamDepot(id) => format!("depot:{}", id),
            ContentKey::BlizzardArchive(hash) => format!("archive:{}", hash),
            ContentKey::None => String::new(),
        }
    }
}

/// A content key resolved to a known app by the external mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedApp {
    pub app_id: u32,
    pub name: Option<String>,
}

/// Game identity attached to a download: the resolved app when the mapping is
/// known, otherwise the raw content key as a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameKey {
    App(ResolvedApp),
    Content(ContentKey),
}

impl GameKey {
    pub fn is_resolved(&self) -> bool {
        matches!(self, GameKey::App(_))
    }

    pub fn app_id(&self) -> Option<u32> {
        match self {
            GameKey::App(app) => Some(app.app_id),
            GameKey::Content(_) => None,
        }
    }

    pub fn game_name(&self) -> Option<&str> {
        match self {
            GameKey::App(app) => app.name.as_deref(),
            GameKey::Content(_) => None,
        }
    }

    /// Display/grouping label: app id once resolved, raw content key before.
    pub fn label(&self) -> String {
        match self {
            GameKey::App(app) => app.app_id.to_string(),
            GameKey::Content(key) => key.label(),
        }
    }
}

/// One physical request from the access log. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub bytes: i64,
    pub cache_status: CacheStatus,
    pub service: Service,
    pub content_key: ContentKey,
    /// Byte offset of the end of this line in the source log file.
    pub source_offset: u64,
}

impl LogEntry {
    pub fn hit_bytes(&self) -> i64 {
        match self.cache_status {
            CacheStatus::Hit => self.bytes,
            _ => 0,
        }
    }

    pub fn miss_bytes(&self) -> i64 {
        match self.cache_status {
            CacheStatus::Miss => self.bytes,
            _ => 0,
        }
    }
}
