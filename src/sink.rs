// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Observation sink: JSONL file writer plus in-process subscriber fan-out.

use crate::error::{Error, Result};
use crate::record::RequestRecord;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

/// Per-subscriber ring size. A subscriber that falls further behind than
/// this loses its oldest events, never the proxy's time.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Clone)]
struct ArcFile {
    inner: Arc<Mutex<tokio::fs::File>>,
}

impl ArcFile {
    async fn new(path: &std::path::Path) -> Result<Self> {
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| Error::Sink(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(f)),
        })
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut file = self.inner.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

/// Fans observed records out to the append-only JSONL file and to any
/// in-process subscribers (the embedded dashboard attaches here).
///
/// `emit` never fails toward the proxy path: a file write error is logged
/// and the record dropped for that sink only.
#[derive(Clone)]
pub struct ObservationSink {
    file: ArcFile,
    events: broadcast::Sender<RequestRecord>,
}

impl ObservationSink {
    pub async fn new<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let file = ArcFile::new(&path).await?;
        let (events, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Ok(Self { file, events })
    }

    /// Emit one observation event: a line in the JSONL file, a broadcast to
    /// subscribers, and a terminal log line.
    pub async fn emit(&self, record: &RequestRecord) {
        match record.status_code {
            Some(code) => info!(
                method = %record.method,
                host = %record.host,
                path = %record.path,
                watched = record.watched,
                status = code,
                "response"
            ),
            None => info!(
                method = %record.method,
                host = %record.host,
                path = %record.path,
                watched = record.watched,
                "request"
            ),
        }

        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = self.file.write_line(&line).await {
                    warn!(%e, "record dropped: log file write failed");
                }
            }
            Err(e) => warn!(%e, "record dropped: serialization failed"),
        }

        // No receivers is fine; lagging receivers drop their oldest events.
        let _ = self.events.send(record.clone());
    }

    /// Attach an in-process subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<RequestRecord> {
        self.events.subscribe()
    }
}
