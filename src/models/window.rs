use serde::{Deserialize, Serialize};
use serde_json::json;

use super::reading::{Reading, StreamKind};

/// In-progress, session-scoped aggregate of readings. Times are epoch milliseconds.
#[derive(Debug, Clone)]
pub struct SensorWindow {
    pub session_id: String,
    pub device: String,
    pub start_time: i64,
    pub end_time: i64,
    pub foot_readings: Vec<Reading>,
    pub accel_readings: Vec<Reading>,
    pub label: Option<String>,
}

impl SensorWindow {
    pub fn new(session_id: impl Into<String>, device: impl Into<String>, start_time: i64) -> Self {
        Self {
            session_id: session_id.into(),
            device: device.into(),
            start_time,
            end_time: start_time,
            foot_readings: Vec::new(),
            accel_readings: Vec::new(),
            label: None,
        }
    }

    pub fn push(&mut self, reading: Reading, timestamp_ms: i64) {
        match reading.kind() {
            StreamKind::Foot => self.foot_readings.push(reading),
            StreamKind::Inertial => self.accel_readings.push(reading),
        }
        self.end_time = timestamp_ms;
    }

    /// Readings for one stream in arrival order.
    pub fn readings(&self, stream: StreamKind) -> &[Reading] {
        match stream {
            StreamKind::Foot => &self.foot_readings,
            StreamKind::Inertial => &self.accel_readings,
        }
    }

    pub fn span_ms(&self) -> i64 {
        self.end_time - self.start_time
    }

    pub fn reading_count(&self) -> usize {
        self.foot_readings.len() + self.accel_readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reading_count() == 0
    }
}

/// Payload stored alongside each vector. `raw_data` keeps the readings for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowPayload {
    pub session_id: String,
    pub device: String,
    pub start_time: i64,
    pub end_time: i64,
    pub foot_count: usize,
    pub accel_count: usize,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub raw_data: String,
}

impl WindowPayload {
    pub fn from_window(window: &SensorWindow) -> serde_json::Result<Self> {
        let raw_data = serde_json::to_string(&json!({
            "foot": window.foot_readings,
            "accel": window.accel_readings,
        }))?;

        Ok(Self {
            session_id: window.session_id.clone(),
            device: window.device.clone(),
            start_time: window.start_time,
            end_time: window.end_time,
            foot_count: window.foot_readings.len(),
            accel_count: window.accel_readings.len(),
            label: window.label.clone(),
            raw_data,
        })
    }

    pub fn raw_readings(&self) -> serde_json::Result<serde_json::Value> {
        if self.raw_data.is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&self.raw_data)
    }
}

/// Durable unit of the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: WindowPayload,
}
