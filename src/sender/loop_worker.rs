use anyhow::Result;
use chrono::Utc;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::buffer::{ReadingBuffer, SenderClaim};
use crate::metrics::{CycleMetrics, CycleOutcome, SenderMetrics};
use crate::models::{Reading, StreamKind};

use super::backoff::{apply_jitter, backoff_delay};
use super::config::SenderConfig;
use super::transport::DeliveryChain;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// What one send cycle did and how long to wait before the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub records: usize,
    pub next_delay: Duration,
}

/// Drains one stream's buffer through a delivery chain.
///
/// Holds the buffer's sender claim for its whole lifetime, so a second sender
/// cannot be built for the same buffer while this one exists.
pub struct ReliableSender {
    buffer: ReadingBuffer,
    chain: DeliveryChain,
    config: SenderConfig,
    metrics: SenderMetrics,
    consecutive_failures: u32,
    _claim: SenderClaim,
}

impl ReliableSender {
    pub fn new(
        buffer: ReadingBuffer,
        chain: DeliveryChain,
        config: SenderConfig,
        metrics: SenderMetrics,
    ) -> Result<Self> {
        config.validate()?;
        let claim = buffer.claim_sender()?;
        Ok(Self {
            buffer,
            chain,
            config,
            metrics,
            consecutive_failures: 0,
            _claim: claim,
        })
    }

    pub fn stream(&self) -> StreamKind {
        self.buffer.stream()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn metrics(&self) -> &SenderMetrics {
        &self.metrics
    }

    /// Fetch, deliver and mark one batch. Either every id of the batch is marked
    /// sent or none is.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let stream = self.stream();
        let cycle_start = Instant::now();

        let batch = match self.buffer.fetch_unsent(self.config.max_records).await {
            Ok(batch) => batch,
            Err(err) => {
                log_error!("{} buffer fetch failed: {err:#}", stream.as_str());
                return self
                    .finish(
                        CycleOutcome::Failed {
                            reason: format!("fetch failed: {err}"),
                        },
                        0,
                        cycle_start,
                        cycle_start.elapsed(),
                        Duration::ZERO,
                        self.config.polling_interval,
                    )
                    .await;
            }
        };
        let fetch_elapsed = cycle_start.elapsed();

        if batch.is_empty() {
            log_debug!("No pending {} records", self.stream().as_str());
            return self
                .finish(
                    CycleOutcome::Idle,
                    0,
                    cycle_start,
                    fetch_elapsed,
                    Duration::ZERO,
                    self.config.polling_interval,
                )
                .await;
        }

        let (ids, records): (Vec<i64>, Vec<Reading>) = batch
            .into_iter()
            .map(|record| (record.id, record.reading))
            .unzip();

        let deliver_start = Instant::now();
        let delivered = self.chain.deliver(stream, &records).await;
        let deliver_elapsed = deliver_start.elapsed();

        match delivered {
            Ok(channel) => {
                if let Err(err) = self.buffer.mark_sent(&ids).await {
                    log_error!(
                        "{} batch of {} delivered via {channel} but could not be marked sent, it will be resent: {err:#}",
                        stream.as_str(),
                        ids.len()
                    );
                    return self
                        .finish(
                            CycleOutcome::Failed {
                                reason: format!("mark_sent failed: {err}"),
                            },
                            ids.len(),
                            cycle_start,
                            fetch_elapsed,
                            deliver_elapsed,
                            self.config.polling_interval,
                        )
                        .await;
                }

                self.consecutive_failures = 0;
                log_info!(
                    "Sent {} {} records via {channel} in {}ms",
                    ids.len(),
                    stream.as_str(),
                    deliver_elapsed.as_millis()
                );
                self.finish(
                    CycleOutcome::Delivered { channel },
                    ids.len(),
                    cycle_start,
                    fetch_elapsed,
                    deliver_elapsed,
                    self.config.polling_interval,
                )
                .await
            }
            Err(err) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let delay = self.backoff();
                log_warn!(
                    "{} batch of {} not delivered ({err}); consecutive failures: {}, retrying in {:?}",
                    stream.as_str(),
                    ids.len(),
                    self.consecutive_failures,
                    delay
                );
                self.finish(
                    CycleOutcome::Failed {
                        reason: err.to_string(),
                    },
                    ids.len(),
                    cycle_start,
                    fetch_elapsed,
                    deliver_elapsed,
                    delay,
                )
                .await
            }
        }
    }

    /// Delay for the current failure count, jittered when configured.
    pub fn backoff(&self) -> Duration {
        let delay = backoff_delay(
            self.config.backoff_base,
            self.consecutive_failures,
            self.config.max_backoff,
        );
        apply_jitter(
            delay,
            self.config.jitter_ratio,
            self.config.max_backoff,
            &mut rand::thread_rng(),
        )
    }

    /// Remove delivered rows past retention.
    pub async fn prune(&self) -> Result<usize> {
        let removed = self
            .buffer
            .delete_sent_older_than(self.config.retention)
            .await?;
        if removed > 0 {
            log_info!("Pruned {removed} sent {} records", self.stream().as_str());
            self.metrics.record_pruned(removed).await;
        }
        Ok(removed)
    }

    async fn finish(
        &self,
        outcome: CycleOutcome,
        records: usize,
        cycle_start: Instant,
        fetch_elapsed: Duration,
        deliver_elapsed: Duration,
        next_delay: Duration,
    ) -> CycleReport {
        self.metrics
            .record_cycle(CycleMetrics {
                timestamp: Utc::now(),
                stream: self.stream(),
                records,
                outcome: outcome.clone(),
                fetch_ms: fetch_elapsed.as_millis() as u64,
                deliver_ms: deliver_elapsed.as_millis() as u64,
                total_ms: cycle_start.elapsed().as_millis() as u64,
                consecutive_failures: self.consecutive_failures,
                next_delay_ms: next_delay.as_millis() as u64,
            })
            .await;

        CycleReport {
            outcome,
            records,
            next_delay,
        }
    }
}

/// Run until cancelled. A cycle in flight always completes before cancellation is
/// observed; waits between cycles are interrupted immediately.
pub async fn sender_loop(mut sender: ReliableSender, cancel_token: CancellationToken) {
    let stream = sender.stream();
    if let Err(err) = sender.config.validate() {
        log_error!("{} sender not started: {err:#}", stream.as_str());
        return;
    }
    let mut cleanup = tokio::time::interval(sender.config.cleanup_interval);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // First cycle runs immediately.
    let mut delay = Duration::ZERO;

    loop {
        let wait = tokio::time::sleep(delay);
        tokio::pin!(wait);

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    log_info!("{} sender shutting down", stream.as_str());
                    return;
                }
                _ = cleanup.tick() => {
                    if let Err(err) = sender.prune().await {
                        log_error!("{} retention cleanup failed: {err:#}", stream.as_str());
                    }
                }
                _ = &mut wait => break,
            }
        }

        delay = sender.run_cycle().await.next_delay;
    }
}
