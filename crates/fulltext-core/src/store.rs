//! Filesystem-backed versioned artifact storage.
//!
//! Layout under the volume root, by bucket:
//!
//! - New-style e-print: `{volume}/arxiv/{prefix}/{id}/{version}/`
//! - Old-style e-print: `{volume}/arxiv/{archive}/{yymm}/{num}/{version}/`
//! - Anything else:     `{volume}/{bucket}/{id}/{version}/`
//!
//! Each version directory holds `plain`, `psv`, and `meta.json`. A
//! write stages everything into a dot-prefixed sibling directory and
//! publishes with a single `rename`, so readers never observe a partial
//! artifact; dot-prefixed entries are invisible to every read path.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{Bucket, DocumentId, ExtractorVersion, epoch_secs};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such extraction")]
    DoesNotExist,
    #[error("storage failed: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt artifact metadata: {0}")]
    Meta(#[from] serde_json::Error),
}

/// Requested content format of an artifact read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Plain,
    Psv,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Psv => "psv",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plain" => Some(Self::Plain),
            "psv" => Some(Self::Psv),
            _ => None,
        }
    }
}

/// Metadata committed alongside artifact content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub document_id: DocumentId,
    pub version: ExtractorVersion,
    /// SHA-256 of the plain-text payload, hex encoded.
    pub etag: String,
    /// Commit time, epoch seconds.
    pub created: u64,
    pub plain_len: u64,
    pub psv_len: u64,
}

pub struct Store {
    volume: PathBuf,
}

impl Store {
    pub fn new(volume: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(volume)?;
        Ok(Self {
            volume: volume.to_path_buf(),
        })
    }

    /// Whether the volume is writable; used by the health endpoint.
    pub fn is_available(&self) -> bool {
        let probe = self.volume.join(format!(".probe-{}", epoch_secs()));
        match fs::write(&probe, b"probe") {
            Ok(()) => {
                let _ = fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        }
    }

    /// Base directory for one document's artifacts.
    fn paper_path(&self, document_id: &DocumentId, bucket: Bucket) -> PathBuf {
        let id = document_id.as_str();
        let root = self.volume.join(bucket.as_str());
        if let Some((archive, num)) = id.split_once('/') {
            // Old-style: alg-geom/9204001 -> alg-geom/9204/9204001
            let yymm = &num[..num.len().min(4)];
            root.join(archive).join(yymm).join(num)
        } else if let Some((prefix, _)) = id.split_once('.') {
            // New-style: 1802.00125 -> 1802/1802.00125
            root.join(prefix).join(id)
        } else {
            root.join(id)
        }
    }

    fn version_dir(
        &self,
        document_id: &DocumentId,
        bucket: Bucket,
        version: ExtractorVersion,
    ) -> PathBuf {
        self.paper_path(document_id, bucket).join(version.to_string())
    }

    /// Commit an artifact. Stages into `.{version}.partial` next to the
    /// final directory, then flips visibility with one atomic rename.
    ///
    /// Re-committing an already-visible version is a no-op equivalent:
    /// the existing artifact wins and its metadata is returned. That
    /// makes a stale worker finishing after a lease timeout harmless.
    pub fn write(
        &self,
        document_id: &DocumentId,
        bucket: Bucket,
        version: ExtractorVersion,
        plain: &str,
        psv: &str,
    ) -> Result<ArtifactMeta, StoreError> {
        let final_dir = self.version_dir(document_id, bucket, version);
        if final_dir.is_dir() {
            return self.meta(document_id, bucket, version);
        }

        let paper = self.paper_path(document_id, bucket);
        let staging = paper.join(format!(".{version}.partial"));
        if staging.exists() {
            // Leftover from a writer that died before the flip.
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let meta = ArtifactMeta {
            document_id: document_id.clone(),
            version,
            etag: hex_digest(plain),
            created: epoch_secs(),
            plain_len: plain.len() as u64,
            psv_len: psv.len() as u64,
        };
        fs::write(staging.join("plain"), plain)?;
        fs::write(staging.join("psv"), psv)?;
        fs::write(staging.join("meta.json"), serde_json::to_vec_pretty(&meta)?)?;

        match fs::rename(&staging, &final_dir) {
            Ok(()) => Ok(meta),
            Err(_) if final_dir.is_dir() => {
                // Concurrent commit of the same version won the flip.
                let _ = fs::remove_dir_all(&staging);
                self.meta(document_id, bucket, version)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, document_id: &DocumentId, bucket: Bucket, version: ExtractorVersion) -> bool {
        self.version_dir(document_id, bucket, version)
            .join("meta.json")
            .is_file()
    }

    pub fn meta(
        &self,
        document_id: &DocumentId,
        bucket: Bucket,
        version: ExtractorVersion,
    ) -> Result<ArtifactMeta, StoreError> {
        let path = self.version_dir(document_id, bucket, version).join("meta.json");
        let bytes = fs::read(&path).map_err(not_found)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Read one committed artifact in the requested format.
    pub fn read(
        &self,
        document_id: &DocumentId,
        bucket: Bucket,
        version: ExtractorVersion,
        format: Format,
    ) -> Result<(ArtifactMeta, String), StoreError> {
        let meta = self.meta(document_id, bucket, version)?;
        let path = self
            .version_dir(document_id, bucket, version)
            .join(format.as_str());
        let content = fs::read_to_string(&path).map_err(not_found)?;
        Ok((meta, content))
    }

    /// Committed versions for a document, ascending. Staging directories
    /// and anything else dot-prefixed are skipped.
    pub fn versions(
        &self,
        document_id: &DocumentId,
        bucket: Bucket,
    ) -> Result<Vec<ExtractorVersion>, StoreError> {
        let paper = self.paper_path(document_id, bucket);
        let entries = match fs::read_dir(&paper) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Ok(v) = ExtractorVersion::parse(name)
                && entry.path().join("meta.json").is_file()
            {
                versions.push(v);
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// The highest committed version on disk, bounded by `max`.
    pub fn latest_on_disk(
        &self,
        document_id: &DocumentId,
        bucket: Bucket,
        max: Option<ExtractorVersion>,
    ) -> Result<Option<ExtractorVersion>, StoreError> {
        Ok(self
            .versions(document_id, bucket)?
            .into_iter()
            .filter(|v| max.is_none_or(|m| *v <= m))
            .next_back())
    }

    /// Lazy traversal of every committed `(document, version)` pair in a
    /// bucket, ordered by document id. Used for corpus-wide
    /// re-extraction; safe to restart, since it holds no cursor state
    /// beyond the iterator itself.
    pub fn enumerate(&self, bucket: Bucket) -> Enumerate {
        Enumerate {
            stack: vec![self.volume.join(bucket.as_str())],
            bucket_root: self.volume.join(bucket.as_str()),
            pending: VecDeque::new(),
        }
    }
}

fn not_found(e: io::Error) -> StoreError {
    if e.kind() == io::ErrorKind::NotFound {
        StoreError::DoesNotExist
    } else {
        StoreError::Io(e)
    }
}

fn hex_digest(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Iterator behind [`Store::enumerate`]. Depth-first over sorted
/// directory names; a directory containing version subdirectories with
/// `meta.json` is a document directory.
pub struct Enumerate {
    stack: Vec<PathBuf>,
    bucket_root: PathBuf,
    pending: VecDeque<(DocumentId, ExtractorVersion)>,
}

impl Enumerate {
    fn document_id_for(&self, dir: &Path) -> Option<DocumentId> {
        let rel = dir.strip_prefix(&self.bucket_root).ok()?;
        let parts: Vec<&str> = rel.iter().filter_map(|p| p.to_str()).collect();
        let id = match parts.as_slice() {
            [] => return None,
            [id] => (*id).to_string(),
            // Old-style {archive}/{yymm}/{num}: the id drops the yymm level.
            [archive, .., num] if !num.contains('.') => format!("{archive}/{num}"),
            [.., id] => (*id).to_string(),
        };
        DocumentId::new(&id).ok()
    }

    fn visit(&mut self, dir: &Path) -> io::Result<()> {
        let mut children: Vec<PathBuf> = Vec::new();
        let mut versions: Vec<ExtractorVersion> = Vec::new();

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Ok(v) = ExtractorVersion::parse(name) {
                if entry.path().join("meta.json").is_file() {
                    versions.push(v);
                    continue;
                }
            }
            children.push(entry.path());
        }

        if !versions.is_empty()
            && let Some(doc) = self.document_id_for(dir)
        {
            versions.sort();
            for v in versions {
                self.pending.push_back((doc.clone(), v));
            }
        }

        // Reverse-sorted so the stack pops in ascending name order.
        children.sort();
        children.reverse();
        self.stack.extend(children);
        Ok(())
    }
}

impl Iterator for Enumerate {
    type Item = (DocumentId, ExtractorVersion);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            let dir = self.stack.pop()?;
            // Unreadable directories are skipped rather than aborting
            // the whole traversal.
            let _ = self.visit(&dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn doc(s: &str) -> DocumentId {
        DocumentId::new(s).unwrap()
    }

    fn v(s: &str) -> ExtractorVersion {
        ExtractorVersion::parse(s).unwrap()
    }

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn write_then_read_round_trip() {
        let (_dir, store) = store();
        let d = doc("1802.00125");
        let meta = store
            .write(&d, Bucket::Arxiv, v("0.3"), "plain text body", "plain text body")
            .unwrap();
        assert_eq!(meta.plain_len, 15);

        let (read_meta, content) = store.read(&d, Bucket::Arxiv, v("0.3"), Format::Plain).unwrap();
        assert_eq!(content, "plain text body");
        assert_eq!(read_meta.etag, meta.etag);
    }

    #[test]
    fn new_style_path_layout() {
        let (dir, store) = store();
        let d = doc("2003.00012");
        store.write(&d, Bucket::Arxiv, v("0.3"), "x y z", "x y z").unwrap();
        assert!(
            dir.path()
                .join("arxiv/2003/2003.00012/0.3/plain")
                .is_file()
        );
    }

    #[test]
    fn old_style_path_layout() {
        let (dir, store) = store();
        let d = doc("alg-geom/9204001");
        store.write(&d, Bucket::Arxiv, v("0.3"), "x y z", "x y z").unwrap();
        assert!(
            dir.path()
                .join("arxiv/alg-geom/9204/9204001/0.3/plain")
                .is_file()
        );
    }

    #[test]
    fn interrupted_write_is_invisible() {
        let (_dir, store) = store();
        let d = doc("1802.00125");

        // Simulate a writer killed before the flip: a staging directory
        // with complete-looking content.
        let paper = store.paper_path(&d, Bucket::Arxiv);
        let staging = paper.join(".0.3.partial");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("plain"), "half-written").unwrap();

        assert!(!store.exists(&d, Bucket::Arxiv, v("0.3")));
        assert!(store.versions(&d, Bucket::Arxiv).unwrap().is_empty());
        assert!(matches!(
            store.read(&d, Bucket::Arxiv, v("0.3"), Format::Plain),
            Err(StoreError::DoesNotExist)
        ));

        // A real commit replaces the leftovers and becomes visible.
        store
            .write(&d, Bucket::Arxiv, v("0.3"), "full text", "full text")
            .unwrap();
        let (_, content) = store.read(&d, Bucket::Arxiv, v("0.3"), Format::Plain).unwrap();
        assert_eq!(content, "full text");
    }

    #[test]
    fn recommit_of_same_version_is_noop() {
        let (_dir, store) = store();
        let d = doc("1802.00125");
        let first = store
            .write(&d, Bucket::Arxiv, v("0.3"), "original", "original")
            .unwrap();
        let second = store
            .write(&d, Bucket::Arxiv, v("0.3"), "late duplicate", "late duplicate")
            .unwrap();
        assert_eq!(second.etag, first.etag);

        let (_, content) = store.read(&d, Bucket::Arxiv, v("0.3"), Format::Plain).unwrap();
        assert_eq!(content, "original");
    }

    #[test]
    fn latest_on_disk_respects_cap() {
        let (_dir, store) = store();
        let d = doc("1802.00125");
        store.write(&d, Bucket::Arxiv, v("0.2"), "a b", "a b").unwrap();
        store.write(&d, Bucket::Arxiv, v("0.3"), "a b", "a b").unwrap();
        store.write(&d, Bucket::Arxiv, v("1.0"), "a b", "a b").unwrap();

        assert_eq!(store.latest_on_disk(&d, Bucket::Arxiv, None).unwrap(), Some(v("1.0")));
        assert_eq!(
            store.latest_on_disk(&d, Bucket::Arxiv, Some(v("0.3"))).unwrap(),
            Some(v("0.3"))
        );
        assert_eq!(
            store.latest_on_disk(&d, Bucket::Arxiv, Some(v("0.1"))).unwrap(),
            None
        );
    }

    #[test]
    fn enumerate_orders_by_document() {
        let (_dir, store) = store();
        for id in ["1802.00125", "1801.00001", "alg-geom/9204001"] {
            store
                .write(&doc(id), Bucket::Arxiv, v("0.3"), "a b", "a b")
                .unwrap();
        }
        store
            .write(&doc("1801.00001"), Bucket::Arxiv, v("0.4"), "a b", "a b")
            .unwrap();

        let all: Vec<_> = store.enumerate(Bucket::Arxiv).collect();
        assert_eq!(all.len(), 4);
        let ids: Vec<&str> = all.iter().map(|(d, _)| d.as_str()).collect();
        assert_eq!(
            ids,
            vec!["1801.00001", "1801.00001", "1802.00125", "alg-geom/9204001"]
        );
        // Versions ascend within a document.
        assert_eq!(all[0].1, v("0.3"));
        assert_eq!(all[1].1, v("0.4"));
    }

    #[test]
    fn buckets_do_not_leak_into_each_other() {
        let (_dir, store) = store();
        let d = doc("sub42");
        store
            .write(&d, Bucket::Submission, v("0.3"), "secret draft", "secret draft")
            .unwrap();
        assert!(!store.exists(&d, Bucket::Arxiv, v("0.3")));
        assert!(store.enumerate(Bucket::Arxiv).next().is_none());
    }
}
