use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::StreamKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Nothing pending.
    Idle,
    Delivered { channel: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamKind,
    pub records: usize,
    pub outcome: CycleOutcome,
    pub fetch_ms: u64,
    pub deliver_ms: u64,
    pub total_ms: u64,
    pub consecutive_failures: u32,
    pub next_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub recent_cycles: Vec<CycleMetrics>,
    pub batches_sent: u64,
    pub records_sent: u64,
    pub failed_batches: u64,
    pub pruned_records: u64,
    pub last_success: Option<DateTime<Utc>>,
}
