//! File-backed log source
//!
//! Each service writes to `{log_root}/{service}/current`. Offsets are byte
//! positions in that file.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use telecast_core::{LogChunk, LogSource, LogSourceError};

/// Name of the active log file inside a service directory
pub const CURRENT_LOG: &str = "current";

/// Block size for reading a log backwards from its end
const TAIL_BLOCK: u64 = 64 * 1024;

/// Log source reading service logs from a directory tree
#[derive(Debug, Clone)]
pub struct FileLogSource {
    root: PathBuf,
}

impl FileLogSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a service's active log file
    pub fn log_path(&self, service: &str) -> Result<PathBuf, LogSourceError> {
        if service.is_empty()
            || service.contains(['/', '\\', '\0'])
            || service == "."
            || service.contains("..")
        {
            return Err(LogSourceError::InvalidService(service.to_string()));
        }
        Ok(self.root.join(service).join(CURRENT_LOG))
    }
}

fn io_error(service: &str, source: std::io::Error) -> LogSourceError {
    LogSourceError::Io {
        service: service.to_string(),
        source,
    }
}

/// Length of `bytes` without a trailing, not yet complete UTF-8 sequence
///
/// A writer may have flushed only part of a multibyte character. Those bytes
/// are left for the next read instead of being decoded as replacements.
fn complete_len(bytes: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(_) => return bytes.len(),
            Err(e) => match e.error_len() {
                None => return start + e.valid_up_to(),
                Some(invalid) => start += e.valid_up_to() + invalid,
            },
        }
    }
}

/// Last `lines` lines of `text`, keeping line terminators
fn last_lines(text: &str, lines: usize) -> &str {
    if lines == 0 {
        return "";
    }
    let body = text.strip_suffix('\n').unwrap_or(text);
    match body.rmatch_indices('\n').nth(lines - 1) {
        Some((idx, _)) => &text[idx + 1..],
        None => text,
    }
}

#[async_trait]
impl LogSource for FileLogSource {
    async fn read_from(&self, service: &str, offset: u64) -> Result<LogChunk, LogSourceError> {
        let path = self.log_path(service)?;
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(service = %service, path = ?path, "log file not found");
                return Ok(LogChunk::new("", Some(0)));
            }
            Err(e) => return Err(io_error(service, e)),
        };

        let size = file
            .metadata()
            .await
            .map_err(|e| io_error(service, e))?
            .len();
        // A file smaller than the offset was truncated or rotated.
        let start = offset.min(size);
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| io_error(service, e))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .await
            .map_err(|e| io_error(service, e))?;

        let complete = complete_len(&bytes);
        let text = String::from_utf8_lossy(&bytes[..complete]);
        Ok(LogChunk::new(text, Some(start + complete as u64)))
    }

    async fn read_tail(&self, service: &str, lines: usize) -> Result<LogChunk, LogSourceError> {
        let path = self.log_path(service)?;
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(service = %service, path = ?path, "log file not found");
                return Ok(LogChunk::new("", Some(0)));
            }
            Err(e) => return Err(io_error(service, e)),
        };

        let size = file
            .metadata()
            .await
            .map_err(|e| io_error(service, e))?
            .len();

        // Read backwards until the buffer holds more than `lines` newlines.
        let mut pos = size;
        let mut bytes: Vec<u8> = Vec::new();
        let mut newlines = 0;
        while pos > 0 && newlines <= lines {
            let len = TAIL_BLOCK.min(pos);
            pos -= len;
            file.seek(SeekFrom::Start(pos))
                .await
                .map_err(|e| io_error(service, e))?;
            let mut block = vec![0; len as usize];
            file.read_exact(&mut block)
                .await
                .map_err(|e| io_error(service, e))?;
            newlines += block.iter().filter(|&&b| b == b'\n').count();
            block.extend_from_slice(&bytes);
            bytes = block;
        }

        let complete = complete_len(&bytes);
        let text = String::from_utf8_lossy(&bytes[..complete]);
        Ok(LogChunk::new(
            last_lines(&text, lines),
            Some(pos + complete as u64),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn setup(content: &str) -> (tempfile::TempDir, FileLogSource) {
        let dir = tempfile::tempdir().unwrap();
        let service_dir = dir.path().join("planner");
        fs::create_dir_all(&service_dir).unwrap();
        fs::write(service_dir.join(CURRENT_LOG), content).unwrap();
        let source = FileLogSource::new(dir.path());
        (dir, source)
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\nb\nc\n", 2), "b\nc\n");
        assert_eq!(last_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(last_lines("a\nb\n", 5), "a\nb\n");
        assert_eq!(last_lines("a\nb\n", 0), "");
        assert_eq!(last_lines("", 3), "");
    }

    #[test]
    fn test_rejects_path_like_service_names() {
        let source = FileLogSource::new("/var/log");
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", "x..y"] {
            assert!(
                matches!(source.log_path(bad), Err(LogSourceError::InvalidService(_))),
                "{bad:?} should be rejected"
            );
        }
        assert_eq!(
            source.log_path("planner").unwrap(),
            PathBuf::from("/var/log/planner/current")
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileLogSource::new(dir.path());

        assert_eq!(
            source.read_tail("ghost", 100).await.unwrap(),
            LogChunk::new("", Some(0))
        );
        assert_eq!(
            source.read_from("ghost", 42).await.unwrap(),
            LogChunk::new("", Some(0))
        );
    }

    #[tokio::test]
    async fn test_tail_reports_file_size() {
        let (_dir, source) = setup("one\ntwo\nthree\n");
        let chunk = source.read_tail("planner", 2).await.unwrap();
        assert_eq!(chunk.text, "two\nthree\n");
        assert_eq!(chunk.cursor, Some(14));
    }

    #[tokio::test]
    async fn test_read_from_offset_and_append() {
        let (dir, source) = setup("one\ntwo\n");
        let chunk = source.read_from("planner", 4).await.unwrap();
        assert_eq!(chunk, LogChunk::new("two\n", Some(8)));

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("planner").join(CURRENT_LOG))
            .unwrap();
        file.write_all(b"three\n").unwrap();

        let chunk = source.read_from("planner", 8).await.unwrap();
        assert_eq!(chunk, LogChunk::new("three\n", Some(14)));
    }

    #[test]
    fn test_complete_len_holds_back_partial_character() {
        assert_eq!(complete_len(b"abc"), 3);
        assert_eq!(complete_len(b"caf\xC3"), 3);
        assert_eq!(complete_len(b"caf\xC3\xA9"), 5);
        assert_eq!(complete_len(b"\xE2\x82"), 0);
        // Invalid bytes in the middle are not a pending character.
        assert_eq!(complete_len(b"a\xFFb"), 3);
    }

    #[tokio::test]
    async fn test_character_split_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let service_dir = dir.path().join("planner");
        fs::create_dir_all(&service_dir).unwrap();
        let log_path = service_dir.join(CURRENT_LOG);
        fs::write(&log_path, b"caf\xC3").unwrap();
        let source = FileLogSource::new(dir.path());

        let first = source.read_from("planner", 0).await.unwrap();
        assert_eq!(first, LogChunk::new("caf", Some(3)));

        let mut file = fs::OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(b"\xA9\n").unwrap();

        let second = source.read_from("planner", 3).await.unwrap();
        assert_eq!(second, LogChunk::new("\u{e9}\n", Some(6)));
        assert_eq!(format!("{}{}", first.text, second.text), "caf\u{e9}\n");
    }

    #[tokio::test]
    async fn test_tail_cursor_stops_before_partial_character() {
        let dir = tempfile::tempdir().unwrap();
        let service_dir = dir.path().join("planner");
        fs::create_dir_all(&service_dir).unwrap();
        fs::write(service_dir.join(CURRENT_LOG), b"one\ncaf\xC3").unwrap();
        let source = FileLogSource::new(dir.path());

        let chunk = source.read_tail("planner", 10).await.unwrap();
        assert_eq!(chunk, LogChunk::new("one\ncaf", Some(7)));
    }

    #[tokio::test]
    async fn test_tail_spans_several_blocks() {
        let content: String = (0..20_000).map(|i| format!("line {i:05}\n")).collect();
        assert!(content.len() as u64 > 2 * TAIL_BLOCK);
        let (_dir, source) = setup(&content);

        let chunk = source.read_tail("planner", 3).await.unwrap();
        assert_eq!(chunk.text, "line 19997\nline 19998\nline 19999\n");
        assert_eq!(chunk.cursor, Some(content.len() as u64));

        let chunk = source.read_tail("planner", 10_000).await.unwrap();
        assert_eq!(chunk.text.lines().count(), 10_000);
        assert!(chunk.text.starts_with("line 10000\n"));
    }

    #[tokio::test]
    async fn test_offset_past_end_clamps_to_size() {
        let (dir, source) = setup(&"x".repeat(500));
        fs::write(dir.path().join("planner").join(CURRENT_LOG), "y".repeat(100)).unwrap();

        let chunk = source.read_from("planner", 500).await.unwrap();
        assert_eq!(chunk, LogChunk::new("", Some(100)));
    }

    #[tokio::test]
    async fn test_invalid_service_is_error() {
        let (_dir, source) = setup("");
        let result = source.read_from("../planner", 0).await;
        assert!(matches!(result, Err(LogSourceError::InvalidService(_))));
    }
}
