//! Upstream PDF retrieval.
//!
//! The canonical copy of every PDF lives in another service: the
//! public e-print endpoint for announced papers, the preview service
//! for submissions. [`DocumentSource`] abstracts over both plus a
//! filesystem-backed variant used in tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::{Bucket, DocumentId};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("document does not exist upstream")]
    NotFound,
    #[error("upstream returned HTTP {0}")]
    Http(u16),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Cheap existence probe, used before any task is created.
    async fn exists(&self, id: &DocumentId, bucket: Bucket) -> Result<bool, SourceError>;

    /// Owner of a submission, if the upstream records one. Announced
    /// e-prints have no owner.
    async fn owner(&self, id: &DocumentId, bucket: Bucket) -> Result<Option<String>, SourceError>;

    /// Download the PDF into `dest`. `dest`'s parent must exist.
    async fn fetch(&self, id: &DocumentId, bucket: Bucket, dest: &Path) -> Result<(), SourceError>;
}

/// Source backed by the e-print and preview HTTP services.
pub struct HttpDocumentSource {
    client: reqwest::Client,
    arxiv_base: String,
    submission_base: String,
}

impl HttpDocumentSource {
    pub fn new(arxiv_base: impl Into<String>, submission_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            arxiv_base: arxiv_base.into(),
            submission_base: submission_base.into(),
        }
    }

    fn url(&self, id: &DocumentId, bucket: Bucket) -> String {
        match bucket {
            Bucket::Arxiv => format!("{}/pdf/{}", self.arxiv_base.trim_end_matches('/'), id),
            Bucket::Submission => format!(
                "{}/preview/{}/content",
                self.submission_base.trim_end_matches('/'),
                id
            ),
        }
    }

    fn owner_url(&self, id: &DocumentId) -> String {
        format!(
            "{}/preview/{}",
            self.submission_base.trim_end_matches('/'),
            id
        )
    }
}

#[derive(serde::Deserialize)]
struct PreviewMeta {
    #[serde(default)]
    owner: Option<String>,
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    async fn exists(&self, id: &DocumentId, bucket: Bucket) -> Result<bool, SourceError> {
        let response = self.client.head(self.url(id, bucket)).send().await?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            code => Err(SourceError::Http(code)),
        }
    }

    async fn owner(&self, id: &DocumentId, bucket: Bucket) -> Result<Option<String>, SourceError> {
        if bucket != Bucket::Submission {
            return Ok(None);
        }
        let response = self.client.get(self.owner_url(id)).send().await?;
        match response.status().as_u16() {
            200 => Ok(response.json::<PreviewMeta>().await?.owner),
            404 => Err(SourceError::NotFound),
            code => Err(SourceError::Http(code)),
        }
    }

    async fn fetch(&self, id: &DocumentId, bucket: Bucket, dest: &Path) -> Result<(), SourceError> {
        let mut response = self.client.get(self.url(id, bucket)).send().await?;
        match response.status().as_u16() {
            200 => {}
            404 => return Err(SourceError::NotFound),
            code => return Err(SourceError::Http(code)),
        }
        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Source reading PDFs straight off a directory tree. Owners come
/// from an optional sibling `{id}.owner` file. Test and local-dev use.
pub struct FsDocumentSource {
    root: PathBuf,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pdf_path(&self, id: &DocumentId, bucket: Bucket) -> PathBuf {
        self.root
            .join(bucket.as_str())
            .join(format!("{}.pdf", id.as_str().replace('/', "_")))
    }
}

#[async_trait]
impl DocumentSource for FsDocumentSource {
    async fn exists(&self, id: &DocumentId, bucket: Bucket) -> Result<bool, SourceError> {
        Ok(tokio::fs::try_exists(self.pdf_path(id, bucket)).await?)
    }

    async fn owner(&self, id: &DocumentId, bucket: Bucket) -> Result<Option<String>, SourceError> {
        if bucket != Bucket::Submission {
            return Ok(None);
        }
        let path = self.pdf_path(id, bucket).with_extension("owner");
        match tokio::fs::read_to_string(&path).await {
            Ok(owner) => Ok(Some(owner.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(&self, id: &DocumentId, bucket: Bucket, dest: &Path) -> Result<(), SourceError> {
        let src = self.pdf_path(id, bucket);
        match tokio::fs::copy(&src, dest).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SourceError::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DocumentId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn fs_source_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = FsDocumentSource::new(dir.path());
        std::fs::create_dir_all(dir.path().join("arxiv")).unwrap();
        std::fs::write(dir.path().join("arxiv/1234.5678.pdf"), b"%PDF-1.4").unwrap();

        assert!(src.exists(&id("1234.5678"), Bucket::Arxiv).await.unwrap());
        assert!(!src.exists(&id("1234.9999"), Bucket::Arxiv).await.unwrap());

        let dest = dir.path().join("out.pdf");
        src.fetch(&id("1234.5678"), Bucket::Arxiv, &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"%PDF-1.4");
    }

    #[tokio::test]
    async fn fs_source_reports_owner() {
        let dir = tempfile::tempdir().unwrap();
        let src = FsDocumentSource::new(dir.path());
        std::fs::create_dir_all(dir.path().join("submission")).unwrap();
        std::fs::write(dir.path().join("submission/12345.pdf"), b"%PDF").unwrap();
        std::fs::write(dir.path().join("submission/12345.owner"), "user42\n").unwrap();

        let owner = src.owner(&id("12345"), Bucket::Submission).await.unwrap();
        assert_eq!(owner.as_deref(), Some("user42"));
        // No ownership concept for announced papers.
        assert_eq!(src.owner(&id("12345"), Bucket::Arxiv).await.unwrap(), None);
    }

    #[tokio::test]
    async fn fetch_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let src = FsDocumentSource::new(dir.path());
        let dest = dir.path().join("out.pdf");
        let err = src
            .fetch(&id("nope"), Bucket::Arxiv, &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::NotFound));
    }
}
