//! Notification sink port and the non-blocking notifier in front of it.
//!
//! The pipeline never awaits a sink directly: [`Notifier::notify`] redacts the
//! text and pushes it onto a bounded channel drained by a background task, so
//! a slow or failing sink cannot stall task execution.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use crate::core::redact::Redactor;

/// Destination for operator-facing messages.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, text: &str) -> Result<()>;
}

/// Prints each notification to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

#[async_trait]
impl NotificationSink for StdoutSink {
    async fn deliver(&self, text: &str) -> Result<()> {
        println!("{text}");
        Ok(())
    }
}

/// Emits each notification as an `info` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, text: &str) -> Result<()> {
        info!(target: "dispatcher::notification", "{text}");
        Ok(())
    }
}

/// Fire-and-forget handle to a sink. Cloning shares the same channel; the
/// drain task ends once every clone is dropped and the queue is empty.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<String>,
    redactor: Arc<Redactor>,
}

impl Notifier {
    /// Spawn the drain task for `sink`. Must be called inside a tokio runtime.
    pub fn spawn(
        sink: Arc<dyn NotificationSink>,
        redactor: Arc<Redactor>,
        capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
        let drain_redactor = Arc::clone(&redactor);
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = sink.deliver(&text).await {
                    warn!(
                        err = %drain_redactor.redact(&format!("{e:#}")),
                        "notification delivery failed"
                    );
                }
            }
        });
        Self { tx, redactor }
    }

    /// Queue a message. Never blocks and never fails; drops are logged.
    pub fn notify(&self, text: impl AsRef<str>) {
        let text = self.redactor.redact(text.as_ref());
        match self.tx.try_send(text) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("notification queue full, dropping message"),
            Err(TrySendError::Closed(_)) => warn!("notification sink closed, dropping message"),
        }
    }
}
