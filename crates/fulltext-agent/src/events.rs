//! Announcement event stream.
//!
//! Events arrive as JSON lines appended to a file by the publishing
//! side. The source reads forward from a byte offset and only ever
//! consumes complete lines, so a half-written tail line is picked up
//! on the next poll once its newline lands.

use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use serde::Deserialize;

/// One announcement: a document became available for extraction.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEvent {
    /// Publisher-assigned id, forwarded as the idempotency key so
    /// redeliveries collapse onto one task.
    pub event_id: String,
    pub document_id: String,
    #[serde(default)]
    pub bucket: Option<String>,
}

pub struct JsonlEventSource {
    path: PathBuf,
    offset: u64,
}

impl JsonlEventSource {
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
        }
    }

    /// Offset of the first unconsumed byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read events appended since the last poll. Each event is paired
    /// with the offset to checkpoint once it has been handled.
    /// Malformed lines are logged and skipped, their offset still
    /// advances past them.
    pub fn poll(&mut self) -> std::io::Result<Vec<(TaskEvent, u64)>> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut events = Vec::new();
        let mut consumed = 0usize;
        while let Some(nl) = buf[consumed..].iter().position(|&b| b == b'\n') {
            let line = &buf[consumed..consumed + nl];
            consumed += nl + 1;
            let after = self.offset + consumed as u64;
            let line = String::from_utf8_lossy(line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TaskEvent>(line) {
                Ok(event) => events.push((event, after)),
                Err(e) => {
                    tracing::warn!(offset = after, error = %e, "skipping malformed event line");
                }
            }
        }
        self.offset += consumed as u64;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_complete_lines_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"{{"event_id":"e1","document_id":"1802.00125"}}"#).unwrap();
        write!(file, r#"{{"event_id":"e2","docum"#).unwrap();

        let mut source = JsonlEventSource::new(&path, 0);
        let events = source.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0.event_id, "e1");

        // Complete the dangling line; a later poll picks it up.
        writeln!(file, r#"ent_id":"1802.00126"}}"#).unwrap();
        let events = source.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0.document_id, "1802.00126");
    }

    #[test]
    fn malformed_lines_are_skipped_but_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(
            &path,
            concat!(
                "not json at all\n",
                r#"{"event_id":"e2","document_id":"1802.00125"}"#,
                "\n"
            ),
        )
        .unwrap();

        let mut source = JsonlEventSource::new(&path, 0);
        let events = source.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0.event_id, "e2");
        // The bad line does not get re-read.
        assert!(source.poll().unwrap().is_empty());
    }

    #[test]
    fn resumes_from_checkpointed_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"event_id":"e1","document_id":"1802.00125"}"#,
                "\n",
                r#"{"event_id":"e2","document_id":"1802.00126"}"#,
                "\n"
            ),
        )
        .unwrap();

        let mut source = JsonlEventSource::new(&path, 0);
        let events = source.poll().unwrap();
        assert_eq!(events.len(), 2);
        let after_first = events[0].1;

        // Restart from the offset recorded after the first event.
        let mut resumed = JsonlEventSource::new(&path, after_first);
        let events = resumed.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0.event_id, "e2");
    }

    #[test]
    fn missing_file_is_just_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = JsonlEventSource::new(dir.path().join("absent.jsonl"), 0);
        assert!(source.poll().unwrap().is_empty());
    }
}
