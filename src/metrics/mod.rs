mod types;

pub use types::{CycleMetrics, CycleOutcome, MetricsSnapshot};

use std::sync::Arc;
use tokio::sync::Mutex;

const MAX_RECENT_CYCLES: usize = 20;

/// Delivery counters shared between a sender loop and whoever reports on it.
#[derive(Clone, Default)]
pub struct SenderMetrics {
    inner: Arc<Mutex<MetricsState>>,
}

#[derive(Default)]
struct MetricsState {
    recent_cycles: Vec<CycleMetrics>,
    batches_sent: u64,
    records_sent: u64,
    failed_batches: u64,
    pruned_records: u64,
    last_success: Option<chrono::DateTime<chrono::Utc>>,
}

impl SenderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_cycle(&self, metrics: CycleMetrics) {
        let mut state = self.inner.lock().await;

        match &metrics.outcome {
            CycleOutcome::Delivered { .. } => {
                state.batches_sent += 1;
                state.records_sent += metrics.records as u64;
                state.last_success = Some(metrics.timestamp);
            }
            CycleOutcome::Failed { .. } => state.failed_batches += 1,
            CycleOutcome::Idle => {}
        }

        state.recent_cycles.push(metrics);
        if state.recent_cycles.len() > MAX_RECENT_CYCLES {
            state.recent_cycles.remove(0);
        }
    }

    pub async fn record_pruned(&self, count: usize) {
        self.inner.lock().await.pruned_records += count as u64;
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let state = self.inner.lock().await;
        MetricsSnapshot {
            recent_cycles: state.recent_cycles.clone(),
            batches_sent: state.batches_sent,
            records_sent: state.records_sent,
            failed_batches: state.failed_batches,
            pruned_records: state.pruned_records,
            last_success: state.last_success,
        }
    }
}
