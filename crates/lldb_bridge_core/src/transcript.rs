use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
    Internal,
}

/// Append-only JSONL record of everything exchanged with one debugger.
#[derive(Debug)]
pub struct Transcript {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl Transcript {
    pub async fn create(dir: &Path, label: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let filename = format!("lldb_session_{label}_{}.jsonl", timestamp_millis());
        let path = dir.join(filename);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Failures are logged and swallowed; a transcript never fails a command.
    pub async fn record(&self, direction: Direction, text: &str) {
        if let Err(e) = self.write_line(direction, text).await {
            tracing::warn!(
                "Failed to write transcript line to {}: {e}",
                self.path.display()
            );
        }
    }

    async fn write_line(&self, direction: Direction, text: &str) -> std::io::Result<()> {
        let envelope = json!({
            "ts_ms": timestamp_millis(),
            "direction": direction,
            "text": text,
        });
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await
    }
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
