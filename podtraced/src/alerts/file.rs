//! Local JSONL sink: appends each alert as one JSON line. Useful on hosts
//! with no outbound network and as a durable breadcrumb trail next to the
//! HTTP sinks.

use std::path::PathBuf;

use anyhow::Context;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::Alert;

pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> FileSink {
        FileSink {
            path: path.into(),
            file: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl super::AlertSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(alert)?;
        line.push(b'\n');

        let mut slot = self.file.lock().await;
        if slot.is_none() {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .with_context(|| format!("open {}", self.path.display()))?;
            *slot = Some(file);
        }

        let file = slot.as_mut().expect("file opened above");
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
