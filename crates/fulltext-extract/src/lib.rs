//! Extraction engine backed by an external PDF-to-text converter.
//!
//! The converter is any `pdftotext`-compatible binary: invoked as
//! `{binary} {input.pdf} {output.txt}`, exit code zero on success,
//! plain UTF-8 text in the output file. Runs are bounded by a hard
//! timeout and the child is killed when it fires.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use fulltext_core::{EngineError, ExtractionEngine, ExtractorVersion};

pub struct SubprocessEngine {
    binary: PathBuf,
    version: ExtractorVersion,
}

impl SubprocessEngine {
    pub fn new(binary: impl Into<PathBuf>, version: ExtractorVersion) -> Self {
        Self {
            binary: binary.into(),
            version,
        }
    }
}

#[async_trait]
impl ExtractionEngine for SubprocessEngine {
    fn version(&self) -> ExtractorVersion {
        self.version
    }

    async fn run(&self, pdf: &Path, timeout: Duration) -> Result<String, EngineError> {
        let out = pdf.with_extension("txt");
        let mut child = Command::new(&self.binary)
            .arg(pdf)
            .arg(&out)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Failed(format!("failed to spawn converter: {e}")))?;

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "failed to kill timed-out converter");
                }
                let _ = child.wait().await;
                return Err(EngineError::Timeout(timeout));
            }
        };
        if !status.success() {
            let stderr = match child.stderr.take() {
                Some(mut pipe) => {
                    let mut buf = String::new();
                    use tokio::io::AsyncReadExt;
                    let _ = pipe.read_to_string(&mut buf).await;
                    buf
                }
                None => String::new(),
            };
            return Err(EngineError::Failed(format!(
                "converter exited with {status}: {}",
                stderr.trim()
            )));
        }

        let text = tokio::fs::read_to_string(&out).await?;
        if text.trim().is_empty() {
            return Err(EngineError::EmptyOutput);
        }
        Ok(text)
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-v")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The tests drive the engine with small shell scripts standing in
    // for the converter, so they only assume a POSIX /bin/sh.

    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("converter.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn reads_converter_output() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "printf 'extracted text' > \"$2\"");
        let pdf = dir.path().join("input.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();

        let engine = SubprocessEngine::new(bin, "0.3".parse().unwrap());
        let text = engine.run(&pdf, Duration::from_secs(5)).await.unwrap();
        assert_eq!(text, "extracted text");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "echo 'corrupt pdf' >&2; exit 1");
        let pdf = dir.path().join("input.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();

        let engine = SubprocessEngine::new(bin, "0.3".parse().unwrap());
        let err = engine.run(&pdf, Duration::from_secs(5)).await.unwrap_err();
        match err {
            EngineError::Failed(msg) => assert!(msg.contains("corrupt pdf")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_output_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), ": > \"$2\"");
        let pdf = dir.path().join("input.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();

        let engine = SubprocessEngine::new(bin, "0.3".parse().unwrap());
        let err = engine.run(&pdf, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyOutput));
    }

    #[tokio::test]
    async fn hung_converter_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "sleep 30");
        let pdf = dir.path().join("input.pdf");
        std::fs::write(&pdf, b"%PDF").unwrap();

        let engine = SubprocessEngine::new(bin, "0.3".parse().unwrap());
        let err = engine
            .run(&pdf, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let engine = SubprocessEngine::new("/nonexistent/converter", "0.3".parse().unwrap());
        assert!(!engine.is_available().await);
    }
}
