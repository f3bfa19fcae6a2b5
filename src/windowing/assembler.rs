use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::index::VectorIndex;
use crate::models::{Reading, SensorWindow, SessionHandle, StreamKind, VectorPoint, WindowPayload};

use super::config::WindowConfig;
use super::encoder::VectorEncoder;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Groups incoming readings into per-session windows and hands finished windows to
/// the vector index.
///
/// The session map is guarded by one lock. Appending, the threshold check and the
/// removal of a finished window happen under it; encoding and the index write do
/// not, so a slow index never blocks ingestion for other sessions.
pub struct WindowAssembler {
    window_size_ms: i64,
    encoder: VectorEncoder,
    index: Arc<dyn VectorIndex>,
    windows: Mutex<HashMap<SessionHandle, SensorWindow>>,
}

impl WindowAssembler {
    pub fn new(config: &WindowConfig, index: Arc<dyn VectorIndex>) -> Result<Self> {
        Ok(Self {
            window_size_ms: config.window_size_ms,
            encoder: VectorEncoder::new(config)?,
            index,
            windows: Mutex::new(HashMap::new()),
        })
    }

    pub fn encoder(&self) -> &VectorEncoder {
        &self.encoder
    }

    /// Add one reading. Returns the stored point id when this reading completed a window.
    pub async fn add_reading(
        &self,
        session: &SessionHandle,
        stream: StreamKind,
        reading: Reading,
    ) -> Option<String> {
        if session.is_empty() {
            log_warn!("Dropping {} reading without a session", stream.as_str());
            return None;
        }
        if reading.kind() != stream {
            log_warn!(
                "Dropping reading for session {session}: declared {} but carries {} data",
                stream.as_str(),
                reading.kind().as_str()
            );
            return None;
        }

        let timestamp = match reading.timestamp_ms() {
            Ok(timestamp) => timestamp,
            Err(err) => {
                let now = Utc::now().timestamp_millis();
                log_warn!("{err}; using receive time {now} for session {session}");
                now
            }
        };

        let finished = {
            let mut windows = self.windows.lock().await;
            let window = windows.entry(session.clone()).or_insert_with(|| {
                SensorWindow::new(session.as_str(), reading.device.clone(), timestamp)
            });
            window.push(reading, timestamp);

            if window.span_ms() >= self.window_size_ms {
                windows.remove(session)
            } else {
                None
            }
        };

        match finished {
            Some(window) => self.finalize(window).await,
            None => None,
        }
    }

    /// Finalize whatever has accumulated for the session, even below the size threshold.
    pub async fn flush(&self, session: &SessionHandle) -> Option<String> {
        let pending = self.windows.lock().await.remove(session);
        match pending {
            Some(window) if !window.is_empty() => self.finalize(window).await,
            _ => None,
        }
    }

    /// Drop the in-progress window without producing a point.
    pub async fn discard(&self, session: &SessionHandle) -> bool {
        self.windows.lock().await.remove(session).is_some()
    }

    pub async fn pending_sessions(&self) -> Vec<SessionHandle> {
        let mut sessions: Vec<SessionHandle> =
            self.windows.lock().await.keys().cloned().collect();
        sessions.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        sessions
    }

    async fn finalize(&self, window: SensorWindow) -> Option<String> {
        let vector = self.encoder.encode(&window);
        let payload = match WindowPayload::from_window(&window) {
            Ok(payload) => payload,
            Err(err) => {
                log_error!(
                    "Failed to serialize window for session {}: {err}",
                    window.session_id
                );
                return None;
            }
        };

        let point = VectorPoint {
            id: Uuid::new_v4().to_string(),
            vector,
            payload,
        };
        let id = point.id.clone();
        let summary = format!(
            "session={} start={} end={} foot={} accel={}",
            point.payload.session_id,
            point.payload.start_time,
            point.payload.end_time,
            point.payload.foot_count,
            point.payload.accel_count
        );

        match self.index.upsert(point).await {
            Ok(()) => {
                log_info!("Stored window {id} ({summary})");
                Some(id)
            }
            Err(err) => {
                log_error!("Dropping window {id} ({summary}): {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexError;
    use crate::index::{
        Distance, Filter, IndexResult, ScoredPoint, Scroll, ScrollPage, SqliteVectorIndex,
    };
    use crate::models::{FootData, FootSide, InertialData};
    use async_trait::async_trait;
    use serde_json::Value;
    use tempfile::TempDir;

    fn foot_at(ms: i64) -> Reading {
        let timestamp = chrono::DateTime::from_timestamp_millis(1_714_557_600_000 + ms)
            .unwrap()
            .to_rfc3339();
        Reading::foot(
            timestamp,
            "LEFT_FOOT",
            FootData {
                foot: FootSide::Left,
                max: 1.0,
                avg: 1.0,
                active_count: 1,
                values: vec![1.0; 18],
            },
        )
    }

    async fn sqlite_assembler(dir: &TempDir) -> (Arc<SqliteVectorIndex>, WindowAssembler) {
        let index = Arc::new(
            SqliteVectorIndex::open(dir.path().join("index.sqlite3"), "sensor_windows").unwrap(),
        );
        index.ensure_collection(270, Distance::Cosine).await.unwrap();
        let assembler = WindowAssembler::new(&WindowConfig::default(), index.clone()).unwrap();
        (index, assembler)
    }

    #[tokio::test]
    async fn finalizes_on_threshold_crossing() {
        let dir = TempDir::new().unwrap();
        let (index, assembler) = sqlite_assembler(&dir).await;
        let session = SessionHandle::new("s1");

        let mut produced = Vec::new();
        for step in 0..=15 {
            let id = assembler
                .add_reading(&session, StreamKind::Foot, foot_at(step * 100))
                .await;
            if let Some(id) = id {
                produced.push((step, id));
            }
        }

        // Windows start at 0 and 600 and close at 500 and 1100; 1200..1500 stays pending.
        assert_eq!(produced.iter().map(|(step, _)| *step).collect::<Vec<_>>(), vec![5, 11]);
        assert_eq!(assembler.pending_sessions().await, vec![session.clone()]);

        let first = index.retrieve(&produced[0].1).await.unwrap().unwrap();
        assert_eq!(first.payload.foot_count, 6);
        assert_eq!(first.payload.accel_count, 0);
        assert_eq!(first.payload.end_time - first.payload.start_time, 500);

        let flushed = assembler.flush(&session).await.unwrap();
        let rest = index.retrieve(&flushed).await.unwrap().unwrap();
        assert_eq!(rest.payload.foot_count, 4);
        assert!(assembler.pending_sessions().await.is_empty());
        assert_eq!(index.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn flush_without_readings_produces_nothing() {
        let dir = TempDir::new().unwrap();
        let (index, assembler) = sqlite_assembler(&dir).await;
        assert!(assembler.flush(&SessionHandle::new("idle")).await.is_none());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sessions_do_not_share_windows() {
        let dir = TempDir::new().unwrap();
        let (index, assembler) = sqlite_assembler(&dir).await;
        let a = SessionHandle::new("a");
        let b = SessionHandle::new("b");

        assembler.add_reading(&a, StreamKind::Foot, foot_at(0)).await;
        assembler.add_reading(&b, StreamKind::Foot, foot_at(400)).await;
        assert!(assembler
            .add_reading(&a, StreamKind::Foot, foot_at(450))
            .await
            .is_none());
        assert!(assembler
            .add_reading(&b, StreamKind::Foot, foot_at(900))
            .await
            .is_some());

        let b_points = Scroll::new(index.as_ref(), Filter::session("b"), 10)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(b_points.len(), 1);
        assert_eq!(assembler.pending_sessions().await, vec![a]);
    }

    #[tokio::test]
    async fn bad_timestamp_falls_back_to_receive_time() {
        let dir = TempDir::new().unwrap();
        let (index, assembler) = sqlite_assembler(&dir).await;
        let session = SessionHandle::new("s1");
        let reading = Reading::inertial("garbage", "ACCELEROMETER", InertialData::default());

        let before = Utc::now().timestamp_millis();
        assembler
            .add_reading(&session, StreamKind::Inertial, reading)
            .await;
        let id = assembler.flush(&session).await.unwrap();
        let point = index.retrieve(&id).await.unwrap().unwrap();
        assert!(point.payload.start_time >= before);
        assert_eq!(point.payload.accel_count, 1);
    }

    #[tokio::test]
    async fn rejects_missing_session_and_mismatched_stream() {
        let dir = TempDir::new().unwrap();
        let (_index, assembler) = sqlite_assembler(&dir).await;
        assert!(assembler
            .add_reading(&SessionHandle::new(""), StreamKind::Foot, foot_at(0))
            .await
            .is_none());
        assert!(assembler
            .add_reading(&SessionHandle::new("s"), StreamKind::Inertial, foot_at(0))
            .await
            .is_none());
        assert!(assembler.pending_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn discard_drops_pending_window() {
        let dir = TempDir::new().unwrap();
        let (index, assembler) = sqlite_assembler(&dir).await;
        let session = SessionHandle::new("s1");
        assembler.add_reading(&session, StreamKind::Foot, foot_at(0)).await;

        assert!(assembler.discard(&session).await);
        assert!(!assembler.discard(&session).await);
        assert!(assembler.flush(&session).await.is_none());
        assert_eq!(index.count().await.unwrap(), 0);
    }

    struct UnreachableIndex;

    #[async_trait]
    impl VectorIndex for UnreachableIndex {
        async fn ensure_collection(&self, _: usize, _: Distance) -> IndexResult<()> {
            Err(IndexError::Unavailable("offline".into()))
        }
        async fn upsert(&self, _: VectorPoint) -> IndexResult<()> {
            Err(IndexError::Unavailable("offline".into()))
        }
        async fn retrieve(&self, _: &str) -> IndexResult<Option<VectorPoint>> {
            Err(IndexError::Unavailable("offline".into()))
        }
        async fn query_similar(&self, _: &[f32], _: usize, _: &Filter) -> IndexResult<Vec<ScoredPoint>> {
            Err(IndexError::Unavailable("offline".into()))
        }
        async fn scroll_page(&self, _: &Filter, _: Option<&str>, _: usize) -> IndexResult<ScrollPage> {
            Err(IndexError::Unavailable("offline".into()))
        }
        async fn update_payload_field(&self, _: &str, _: &str, _: Value) -> IndexResult<bool> {
            Err(IndexError::Unavailable("offline".into()))
        }
        async fn delete_points(&self, _: &[String]) -> IndexResult<usize> {
            Err(IndexError::Unavailable("offline".into()))
        }
        async fn count(&self) -> IndexResult<u64> {
            Err(IndexError::Unavailable("offline".into()))
        }
        async fn is_available(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn index_failure_still_clears_window() {
        let assembler =
            WindowAssembler::new(&WindowConfig::default(), Arc::new(UnreachableIndex)).unwrap();
        let session = SessionHandle::new("s1");

        assembler.add_reading(&session, StreamKind::Foot, foot_at(0)).await;
        assert!(assembler
            .add_reading(&session, StreamKind::Foot, foot_at(500))
            .await
            .is_none());
        assert!(assembler.pending_sessions().await.is_empty());

        // The next reading opens a fresh window.
        assembler.add_reading(&session, StreamKind::Foot, foot_at(600)).await;
        assert_eq!(assembler.pending_sessions().await.len(), 1);
    }
}
