mod error;
mod line;

pub use error::{ParseError, Result};
pub use line::{is_heartbeat_url, AccessLineParser};
