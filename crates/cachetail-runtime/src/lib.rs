mod config;
mod error;
mod pipeline;
mod reader;
mod stats;
mod writer;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineHandle};
pub use reader::LogTailer;
pub use stats::StatsCache;
pub use writer::BatchWriter;
