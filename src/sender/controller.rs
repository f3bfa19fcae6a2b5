use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::{MetricsSnapshot, SenderMetrics};
use crate::models::StreamKind;

use super::loop_worker::{sender_loop, ReliableSender};

struct RunningSender {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
    metrics: SenderMetrics,
}

/// Owns the sender tasks of one process, at most one per stream.
pub struct SenderController {
    root_token: CancellationToken,
    senders: HashMap<StreamKind, RunningSender>,
}

impl Default for SenderController {
    fn default() -> Self {
        Self::new()
    }
}

impl SenderController {
    pub fn new() -> Self {
        Self {
            root_token: CancellationToken::new(),
            senders: HashMap::new(),
        }
    }

    /// Token cancelled by the next [`SenderController::stop_all`]; every sender listens on a
    /// child of it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root_token.clone()
    }

    pub fn start(&mut self, sender: ReliableSender) -> Result<()> {
        let stream = sender.stream();
        if let Some(running) = self.senders.get(&stream) {
            if !running.handle.is_finished() {
                bail!("{} sender already active", stream.as_str());
            }
        }

        let cancel_token = self.root_token.child_token();
        let metrics = sender.metrics().clone();
        let handle = tokio::spawn(sender_loop(sender, cancel_token.clone()));
        info!("Started {} sender", stream.as_str());

        self.senders.insert(
            stream,
            RunningSender {
                handle,
                cancel_token,
                metrics,
            },
        );
        Ok(())
    }

    pub fn is_running(&self, stream: StreamKind) -> bool {
        self.senders
            .get(&stream)
            .is_some_and(|running| !running.handle.is_finished())
    }

    pub async fn metrics(&self, stream: StreamKind) -> Option<MetricsSnapshot> {
        match self.senders.get(&stream) {
            Some(running) => Some(running.metrics.get_snapshot().await),
            None => None,
        }
    }

    pub async fn stop(&mut self, stream: StreamKind) -> Result<()> {
        let Some(running) = self.senders.remove(&stream) else {
            return Ok(());
        };
        running.cancel_token.cancel();
        running
            .handle
            .await
            .with_context(|| format!("{} sender task failed to join", stream.as_str()))
    }

    /// Stops every sender. The controller can start new senders afterwards.
    pub async fn stop_all(&mut self) -> Result<()> {
        std::mem::replace(&mut self.root_token, CancellationToken::new()).cancel();
        let mut first_error = None;
        for (stream, running) in self.senders.drain() {
            if let Err(err) = running.handle.await {
                first_error.get_or_insert_with(|| {
                    anyhow::Error::new(err)
                        .context(format!("{} sender task failed to join", stream.as_str()))
                });
            }
        }
        info!("All senders stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ReadingBuffer;
    use crate::sender::{DeliveryChain, SenderConfig};
    use std::time::Duration;
    use tempfile::TempDir;

    fn sender_for(buffer: &ReadingBuffer) -> Result<ReliableSender> {
        ReliableSender::new(
            buffer.clone(),
            DeliveryChain::default(),
            SenderConfig {
                polling_interval: Duration::from_millis(10),
                ..SenderConfig::default()
            },
            SenderMetrics::new(),
        )
    }

    #[tokio::test]
    async fn one_sender_per_stream() {
        let dir = TempDir::new().unwrap();
        let foot = ReadingBuffer::open(dir.path().join("foot.sqlite3"), StreamKind::Foot).unwrap();
        let other_foot =
            ReadingBuffer::open(dir.path().join("foot2.sqlite3"), StreamKind::Foot).unwrap();
        let accel =
            ReadingBuffer::open(dir.path().join("accel.sqlite3"), StreamKind::Inertial).unwrap();

        let mut controller = SenderController::new();
        controller.start(sender_for(&foot).unwrap()).unwrap();
        controller.start(sender_for(&accel).unwrap()).unwrap();
        assert!(controller.start(sender_for(&other_foot).unwrap()).is_err());
        assert!(controller.is_running(StreamKind::Foot));
        assert!(controller.is_running(StreamKind::Inertial));

        controller.stop(StreamKind::Foot).await.unwrap();
        assert!(!controller.is_running(StreamKind::Foot));
        // The stopped sender released its claim on the buffer.
        assert!(sender_for(&foot).is_ok());

        tokio::time::timeout(Duration::from_secs(2), controller.stop_all())
            .await
            .unwrap()
            .unwrap();
        assert!(!controller.is_running(StreamKind::Inertial));
    }

    #[tokio::test]
    async fn restarts_after_stop_all() {
        let dir = TempDir::new().unwrap();
        let foot = ReadingBuffer::open(dir.path().join("foot.sqlite3"), StreamKind::Foot).unwrap();

        let mut controller = SenderController::new();
        let first_run = controller.shutdown_token();
        controller.start(sender_for(&foot).unwrap()).unwrap();
        controller.stop_all().await.unwrap();
        assert!(first_run.is_cancelled());
        assert!(!controller.shutdown_token().is_cancelled());

        controller.start(sender_for(&foot).unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(controller.is_running(StreamKind::Foot));

        controller.stop_all().await.unwrap();
        assert!(!controller.is_running(StreamKind::Foot));
    }
}
