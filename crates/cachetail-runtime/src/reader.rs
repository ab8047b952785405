use crate::Result;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Incremental reader over one append-only access log.
///
/// Tracks the byte offset up to which complete lines have been emitted, so a
/// restart resumes exactly where the last flushed batch left off. A trailing
/// partial line (writer mid-append) stays buffered until its newline arrives.
pub struct LogTailer {
    path: PathBuf,
    /// File position of the first byte not yet emitted as a complete line.
    committed: u64,
    /// Bytes read past `committed` that do not yet end in a newline.
    partial: Vec<u8>,
}

impl LogTailer {
    pub fn new(path: PathBuf, resume_offset: u64) -> Self {
        Self {
            path,
            committed: resume_offset,
            partial: Vec::new(),
        }
    }

    /// Resume point to persist alongside flushed batches.
    pub fn offset(&self) -> u64 {
        self.committed
    }

    /// Current size of the log, or 0 when it does not exist yet.
    pub fn file_len(path: &Path) -> u64 {
        std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    /// Read everything appended since the last drain and return the complete
    /// lines, each paired with the file offset just past its newline. A
    /// missing file is not an error; the log may appear later.
    pub fn drain(&mut self) -> Result<Vec<(String, u64)>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let len = file.metadata()?.len();
        let read_from = self.committed + self.partial.len() as u64;

        // Shrinking below our position means rotation or truncation; the old
        // offsets no longer describe this file.
        if len < read_from {
            warn!(
                path = %self.path.display(),
                old_offset = read_from,
                new_len = len,
                "log shrank, restarting from offset 0"
            );
            self.committed = 0;
            self.partial.clear();
            return self.drain_from(&mut file, 0);
        }

        if len == read_from {
            return Ok(Vec::new());
        }

        self.drain_from(&mut file, read_from)
    }

    fn drain_from(&mut self, file: &mut File, from: u64) -> Result<Vec<(String, u64)>> {
        file.seek(SeekFrom::Start(from))?;

        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk)?;
        self.partial.extend_from_slice(&chunk);

        let mut lines = Vec::new();
        while let Some(newline_pos) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=newline_pos).collect();
            self.committed += raw.len() as u64;

            let mut line = String::from_utf8_lossy(&raw).into_owned();
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push((line, self.committed));
            }
        }

        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn missing_file_yields_no_lines() {
        let temp_dir = TempDir::new().unwrap();
        let mut tailer = LogTailer::new(temp_dir.path().join("absent.log"), 0);

        assert!(tailer.drain().unwrap().is_empty());
        assert_eq!(tailer.offset(), 0);
    }

    #[test]
    fn emits_complete_lines_with_end_offsets() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("access.log");
        append(&path, "alpha\nbravo\n");

        let mut tailer = LogTailer::new(path, 0);
        let lines = tailer.drain().unwrap();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], ("alpha".to_string(), 6));
        assert_eq!(lines[1], ("bravo".to_string(), 12));
        assert_eq!(tailer.offset(), 12);
    }

    #[test]
    fn partial_trailing_line_waits_for_newline() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("access.log");
        append(&path, "alpha\nbra");

        let mut tailer = LogTailer::new(path.clone(), 0);
        let lines = tailer.drain().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(tailer.offset(), 6);

        // Writer finishes the line.
        append(&path, "vo\ncharlie\n");
        let lines = tailer.drain().unwrap();
        assert_eq!(
            lines,
            vec![("bravo".to_string(), 12), ("charlie".to_string(), 20)]
        );
    }

    #[test]
    fn resumes_from_persisted_offset() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("access.log");
        append(&path, "alpha\nbravo\n");

        let mut tailer = LogTailer::new(path, 6);
        let lines = tailer.drain().unwrap();

        assert_eq!(lines, vec![("bravo".to_string(), 12)]);
    }

    #[test]
    fn shrunken_file_restarts_from_zero() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("access.log");
        append(&path, "a much longer first generation line\n");

        let mut tailer = LogTailer::new(path.clone(), 0);
        tailer.drain().unwrap();
        assert!(tailer.offset() > 0);

        // Rotation: a fresh, shorter file replaces the old one.
        std::fs::write(&path, "fresh\n").unwrap();
        let lines = tailer.drain().unwrap();

        assert_eq!(lines, vec![("fresh".to_string(), 6)]);
        assert_eq!(tailer.offset(), 6);
    }

    #[test]
    fn crlf_lines_are_trimmed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("access.log");
        append(&path, "alpha\r\n");

        let mut tailer = LogTailer::new(path, 0);
        let lines = tailer.drain().unwrap();
        assert_eq!(lines[0].0, "alpha");
        assert_eq!(lines[0].1, 7);
    }

    #[test]
    fn blank_lines_are_skipped_but_advance_offset() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("access.log");
        append(&path, "\n\nalpha\n");

        let mut tailer = LogTailer::new(path, 0);
        let lines = tailer.drain().unwrap();
        assert_eq!(lines, vec![("alpha".to_string(), 8)]);
        assert_eq!(tailer.offset(), 8);
    }
}
