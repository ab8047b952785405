mod db;
mod error;
mod records;

pub use db::Database;
pub use error::{Error, Result};
pub use records::{ClientStatsRow, DownloadRow, FlushStats, ServiceStatsRow};
