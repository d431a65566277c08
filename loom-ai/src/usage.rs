//! Best-effort usage recording
//!
//! Requests enqueue usage entries on a bounded channel drained by a single
//! background writer. Recording never blocks or fails the request; a full
//! queue or a failed insert is logged and the entry is dropped.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default capacity of the pending-record queue
pub const DEFAULT_USAGE_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub user_id: String,
    /// Endpoint class name, e.g. "suggest" or "scene_image"
    pub endpoint: String,
    pub model: Option<String>,
}

enum UsageMessage {
    Record(UsageEntry),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<UsageMessage>,
}

impl std::fmt::Debug for UsageMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsageMessage::Record(entry) => f.debug_tuple("Record").field(entry).finish(),
            UsageMessage::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl UsageRecorder {
    /// Start the background writer; it exits once every recorder clone is dropped
    pub fn spawn(pool: SqlitePool, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<UsageMessage>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    UsageMessage::Record(entry) => {
                        let now = loom_common::time::now();
                        if let Err(e) = crate::db::usage::insert_usage(&pool, &entry, now).await {
                            tracing::warn!(
                                user_id = %entry.user_id,
                                endpoint = %entry.endpoint,
                                error = %e,
                                "Failed to persist usage record"
                            );
                        }
                    }
                    UsageMessage::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            tracing::debug!("Usage recorder stopped");
        });

        (Self { tx }, handle)
    }

    /// Enqueue a record without waiting
    pub fn record(&self, entry: UsageEntry) {
        if let Err(e) = self.tx.try_send(UsageMessage::Record(entry)) {
            let (reason, entry) = match e {
                mpsc::error::TrySendError::Full(UsageMessage::Record(entry)) => ("queue full", Some(entry)),
                mpsc::error::TrySendError::Closed(UsageMessage::Record(entry)) => ("recorder stopped", Some(entry)),
                _ => ("unavailable", None),
            };
            tracing::warn!(
                reason,
                user_id = entry.as_ref().map(|e| e.user_id.as_str()).unwrap_or(""),
                endpoint = entry.as_ref().map(|e| e.endpoint.as_str()).unwrap_or(""),
                "Usage record dropped"
            );
        }
    }

    /// Wait until every record enqueued before this call has been written
    ///
    /// Returns false when the writer is no longer running.
    pub async fn flush(&self) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(UsageMessage::Flush(ack_tx)).await.is_err() {
            return false;
        }
        ack_rx.await.is_ok()
    }
}
