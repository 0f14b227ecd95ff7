use crate::model::AnalysisResult;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Receives every completed analysis, e.g. for historical storage.
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn store<'a>(&'a self, result: &'a AnalysisResult) -> BoxFuture<'a, Result<()>>;
}

/// Appends each result as one JSON line to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    // Serializes appends so lines never interleave.
    write: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }
}

impl ReportSink for JsonLinesSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn store<'a>(&'a self, result: &'a AnalysisResult) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut line = serde_json::to_vec(result)?;
            line.push(b'\n');

            let _guard = self.write.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| format!("Failed to open report file {}", self.path.display()))?;

            file.write_all(&line).await?;
            file.flush().await?;
            Ok(())
        })
    }
}
