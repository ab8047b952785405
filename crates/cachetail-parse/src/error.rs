use std::fmt;

/// Result type for cachetail-parse operations
pub type Result<T> = std::result::Result<T, ParseError>;

/// Reasons a log line failed to parse. Parse failures are counted and
/// skipped by the pipeline, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Line does not match the access-log grammar at all
    Grammar,
    /// Matched the grammar but a required field was missing or malformed
    Field(&'static str),
    /// Timestamp field did not match any accepted format
    Timestamp(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Grammar => write!(f, "line does not match access-log grammar"),
            ParseError::Field(name) => write!(f, "malformed field: {}", name),
            ParseError::Timestamp(value) => write!(f, "unparseable timestamp: {}", value),
        }
    }
}

impl std::error::Error for ParseError {}
