use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Buffered events are written out once the buffer grows past this
const FLUSH_THRESHOLD: usize = 64;

/// Event log implementation using JSONL (JSON Lines), one file per run:
/// `<base_path>/<run_id>.jsonl`
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Events not yet written to disk
    buffer: Mutex<Vec<Event>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            buffer: Mutex::new(Vec::new()),
        })
    }

    /// Path of the event log file for a run
    pub fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", run_id))
    }

    /// Write buffered events to disk, appending to each run's file
    pub async fn flush_buffer(&self) -> Result<()> {
        let events: Vec<Event> = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return Ok(());
            }
            buffer.drain(..).collect()
        };

        // Group by run, keeping append order within a run
        let mut by_run: Vec<(RunId, String)> = Vec::new();
        for event in &events {
            let mut line = serde_json::to_string(event).context("Failed to serialize event")?;
            line.push('\n');
            match by_run.iter_mut().find(|(id, _)| *id == event.run_id) {
                Some((_, lines)) => lines.push_str(&line),
                None => by_run.push((event.run_id, line)),
            }
        }

        for (run_id, lines) in by_run {
            let path = self.run_path(&run_id);
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .with_context(|| format!("Failed to open event log {}", path.display()))?;
            file.write_all(lines.as_bytes())
                .await
                .context("Failed to write events")?;
            file.flush().await.context("Failed to flush event log")?;
        }

        Ok(())
    }

    async fn read_jsonl(path: &Path) -> Result<Vec<Event>> {
        let content = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read event log")?;

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Failed to parse event"))
            .collect()
    }
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let len = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(event);
            buffer.len()
        };

        if len >= FLUSH_THRESHOLD {
            self.flush_buffer().await?;
        }

        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        // Flush any buffered events first
        self.flush_buffer().await?;

        let path = self.run_path(&run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        Self::read_jsonl(&path).await
    }

    async fn flush(&self) -> Result<()> {
        self.flush_buffer().await
    }
}
