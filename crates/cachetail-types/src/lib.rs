pub mod delta;
pub mod entry;
pub mod event;
pub mod speed;

pub use delta::IngestDelta;
pub use event::PipelineEvent;
pub use entry::{CacheStatus, ContentKey, GameKey, LogEntry, ResolvedApp, Service};
pub use speed::{ClientSpeedInfo, DownloadSpeedSnapshot, GameSpeedInfo, SpeedSample};
