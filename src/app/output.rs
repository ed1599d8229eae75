use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastEvent;

#[derive(Default)]
struct OutputLines {
    lines: Vec<String>,
    flushed: bool,
}

/// Records broadcast and delivery events, writing them to a file when flushed. Events recorded
///  after the flush are discarded so the file reflects the state at shutdown.
pub struct OutputLog {
    path: PathBuf,
    inner: Mutex<OutputLines>,
}

impl OutputLog {
    pub fn new(path: impl Into<PathBuf>) -> OutputLog {
        OutputLog {
            path: path.into(),
            inner: Default::default(),
        }
    }

    /// `b <seq>` for a broadcast, `d <origin> <seq>` for a delivery
    pub fn format_event(event: &BroadcastEvent) -> Option<String> {
        match event {
            BroadcastEvent::Broadcast(payload) => payload.sequence_number()
                .map(|seq| format!("b {}", seq)),
            BroadcastEvent::Deliver(delivery) => delivery.payload.sequence_number()
                .map(|seq| format!("d {} {}", delivery.from.id, seq)),
        }
    }

    pub async fn record(&self, event: &BroadcastEvent) {
        let Some(line) = Self::format_event(event) else {
            warn!("event without sequence number - not logged: {:?}", event);
            return;
        };

        let mut inner = self.inner.lock().await;
        if inner.flushed {
            debug!("output was flushed already - discarding {:?}", line);
            return;
        }
        inner.lines.push(line);
    }

    /// Records events until the channel is closed
    pub async fn consume(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<BroadcastEvent>) {
        while let Some(event) = events.recv().await {
            self.record(&event).await;
        }
    }

    /// Lets the consumer record the events that are still buffered in its channel, and then
    ///  flushes. The consumer is aborted if its channel is not closed within `grace_period`.
    pub async fn drain_and_flush(&self, mut consumer: JoinHandle<()>, grace_period: Duration) -> anyhow::Result<()> {
        if timeout(grace_period, &mut consumer).await.is_err() {
            warn!("event channel was not closed within {:?} - flushing anyway", grace_period);
            consumer.abort();
        }
        self.flush().await
    }

    pub async fn lines(&self) -> Vec<String> {
        self.inner.lock().await
            .lines
            .clone()
    }

    /// Writes all recorded lines to the output file. Only the first call writes, later calls are
    ///  no-ops.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.flushed {
            return Ok(());
        }
        inner.flushed = true;

        let mut content = inner.lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }

        let mut file = tokio::fs::File::create(&self.path).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        info!("wrote {} lines to {:?}", inner.lines.len(), self.path);
        Ok(())
    }
}
