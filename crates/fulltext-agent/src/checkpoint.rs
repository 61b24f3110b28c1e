//! Durable stream position.
//!
//! The checkpoint is a single byte offset written with the usual
//! temp-file-and-rename dance, so a crash mid-write leaves the old
//! offset intact. Re-processing from a stale offset is safe because
//! every event carries an idempotency key.

use std::path::PathBuf;

pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Last stored offset, zero when no checkpoint exists yet.
    pub fn load(&self) -> std::io::Result<u64> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw.trim().parse().unwrap_or(0)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn store(&self, offset: u64) -> std::io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, offset.to_string())?;
        std::fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path().join("offset"));
        assert_eq!(checkpoint.load().unwrap(), 0);

        checkpoint.store(1234).unwrap();
        assert_eq!(checkpoint.load().unwrap(), 1234);

        checkpoint.store(5678).unwrap();
        assert_eq!(checkpoint.load().unwrap(), 5678);
    }

    #[test]
    fn garbage_contents_reset_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offset");
        std::fs::write(&path, "not a number").unwrap();
        assert_eq!(Checkpoint::new(&path).load().unwrap(), 0);
    }
}
