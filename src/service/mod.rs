//! Server-side contract: session registry, reading ingestion, similarity queries
//! and session export on top of the window assembler and the vector index.

mod export;

pub use export::windows_to_csv;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::IndexError;
use crate::index::{Distance, Filter, IndexResult, Scroll, ScoredPoint, VectorIndex};
use crate::models::{Reading, SessionHandle, SessionInfo, SessionStatus, StreamKind};
use crate::windowing::{WindowAssembler, WindowConfig};

const SCROLL_PAGE_SIZE: usize = 100;

/// A stored window as reported to clients, without its vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowRecord {
    pub id: String,
    pub session_id: String,
    pub device: String,
    pub start_time: i64,
    pub end_time: i64,
    pub foot_count: usize,
    pub accel_count: usize,
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetails {
    #[serde(flatten)]
    pub info: SessionInfo,
    pub window_count: usize,
    pub windows: Vec<WindowRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUpdate {
    pub name: Option<String>,
    pub status: Option<SessionStatus>,
    /// Window id to label.
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub index_available: bool,
    pub point_count: Option<u64>,
    pub sessions: usize,
    pub pending_sessions: Vec<String>,
}

pub struct SensorService {
    index: Arc<dyn VectorIndex>,
    assembler: WindowAssembler,
    dimension: usize,
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

impl SensorService {
    pub fn new(index: Arc<dyn VectorIndex>, config: &WindowConfig) -> Result<Self> {
        let assembler = WindowAssembler::new(config, Arc::clone(&index))?;
        Ok(Self {
            index,
            assembler,
            dimension: config.dimension,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Create the collection on the index if it does not exist yet.
    pub async fn ensure_collection(&self) -> IndexResult<()> {
        self.index
            .ensure_collection(self.dimension, Distance::Cosine)
            .await
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    // ------------------------------------------------------------------
    // Session registry
    // ------------------------------------------------------------------

    pub async fn create_session(&self, name: Option<String>) -> SessionInfo {
        let now = Utc::now();
        let info = SessionInfo {
            id: Uuid::new_v4().to_string(),
            name: name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| format!("recording_{}", now.format("%Y%m%d_%H%M%S"))),
            status: SessionStatus::Recording,
            created_at: now,
            stopped_at: None,
            labels_updated: None,
        };
        info!("Created session {} ({})", info.id, info.name);
        self.sessions
            .write()
            .await
            .insert(info.id.clone(), info.clone());
        info
    }

    /// Registered sessions, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn get_session(&self, session_id: &str) -> IndexResult<Option<SessionDetails>> {
        let Some(info) = self.sessions.read().await.get(session_id).cloned() else {
            return Ok(None);
        };
        let windows = self.get_session_data(&info.handle(), false).await?;
        Ok(Some(SessionDetails {
            info,
            window_count: windows.len(),
            windows,
        }))
    }

    pub async fn update_session(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> IndexResult<Option<SessionInfo>> {
        if !self.sessions.read().await.contains_key(session_id) {
            return Ok(None);
        }

        let labels_updated = match &update.labels {
            Some(labels) => Some(
                self.update_labels(&SessionHandle::new(session_id), labels)
                    .await?,
            ),
            None => None,
        };

        let closing = {
            let mut sessions = self.sessions.write().await;
            let Some(info) = sessions.get_mut(session_id) else {
                return Ok(None);
            };
            if let Some(name) = update.name {
                info.name = name;
            }
            if labels_updated.is_some() {
                info.labels_updated = labels_updated;
            }
            match update.status {
                Some(status) if info.is_recording() && status != SessionStatus::Recording => {
                    Some(status)
                }
                Some(status) => {
                    info.status = status;
                    None
                }
                None => None,
            }
        };

        match closing {
            Some(status) => Ok(self.close_session(session_id, status).await),
            None => Ok(self.sessions.read().await.get(session_id).cloned()),
        }
    }

    /// Mark the session stopped and flush its pending window.
    pub async fn stop_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.close_session(session_id, SessionStatus::Stopped).await
    }

    /// Leave the recording state, then flush. `ingest` holds the registry read guard
    /// while it feeds the assembler, so after the status is written no reading can
    /// open another window for this session.
    async fn close_session(&self, session_id: &str, status: SessionStatus) -> Option<SessionInfo> {
        let info = {
            let mut sessions = self.sessions.write().await;
            let info = sessions.get_mut(session_id)?;
            info.status = status;
            info.stopped_at = Some(Utc::now());
            info.clone()
        };

        if let Some(point_id) = self.flush(&info.handle()).await {
            info!("Flushed final window {point_id} of session {session_id}");
        }
        Some(info)
    }

    /// Remove every stored window of the session, its pending window and its registry
    /// entry. Returns the number of points deleted.
    pub async fn delete_session(&self, session: &SessionHandle) -> IndexResult<usize> {
        // Unregister first so no ingest can reopen a window while points are removed.
        self.sessions.write().await.remove(session.as_str());
        self.assembler.discard(session).await;
        let deleted = self
            .index
            .delete_by_filter(&Filter::session(session.as_str()))
            .await?;
        info!("Deleted session {session} ({deleted} windows)");
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Validate a raw record and feed it to the assembler. Malformed records and
    /// records for unknown or stopped sessions are logged and skipped.
    pub async fn ingest(
        &self,
        session: &SessionHandle,
        stream: StreamKind,
        record: &Value,
    ) -> Option<String> {
        // Held until the reading is in the assembler so stop and delete wait for it.
        let sessions = self.sessions.read().await;
        let recording = sessions
            .get(session.as_str())
            .is_some_and(SessionInfo::is_recording);
        if !recording {
            warn!(
                "Ignoring {} reading for inactive session '{session}'",
                stream.as_str()
            );
            return None;
        }

        let stored = match Reading::from_wire(stream, record) {
            Ok(reading) => self.add_reading(session, stream, reading).await,
            Err(err) => {
                warn!("Skipping malformed reading for session {session}: {err}");
                None
            }
        };
        drop(sessions);
        stored
    }

    pub async fn add_reading(
        &self,
        session: &SessionHandle,
        stream: StreamKind,
        reading: Reading,
    ) -> Option<String> {
        self.assembler.add_reading(session, stream, reading).await
    }

    pub async fn flush(&self, session: &SessionHandle) -> Option<String> {
        self.assembler.flush(session).await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn query_similar(
        &self,
        vector: &[f32],
        k: usize,
        filter: &Filter,
    ) -> IndexResult<Vec<ScoredPoint>> {
        self.index.query_similar(vector, k, filter).await
    }

    /// Neighbours of a stored window, excluding the window itself.
    pub async fn query_similar_to(
        &self,
        window_id: &str,
        k: usize,
        filter: &Filter,
    ) -> IndexResult<Vec<ScoredPoint>> {
        let reference = self
            .index
            .retrieve(window_id)
            .await?
            .ok_or_else(|| IndexError::NotFound(window_id.to_string()))?;

        let mut hits = self
            .index
            .query_similar(&reference.vector, k.saturating_add(1), filter)
            .await?;
        hits.retain(|hit| hit.id != window_id);
        hits.truncate(k);
        Ok(hits)
    }

    /// All windows of a session in ascending start time.
    pub async fn get_session_data(
        &self,
        session: &SessionHandle,
        include_raw: bool,
    ) -> IndexResult<Vec<WindowRecord>> {
        let records = Scroll::new(
            self.index.as_ref(),
            Filter::session(session.as_str()),
            SCROLL_PAGE_SIZE,
        )
        .collect_all()
        .await?;

        let mut windows = Vec::with_capacity(records.len());
        for record in records {
            let raw_data = if include_raw {
                Some(record.payload.raw_readings()?)
            } else {
                None
            };
            let payload = record.payload;
            windows.push(WindowRecord {
                id: record.id,
                session_id: payload.session_id,
                device: payload.device,
                start_time: payload.start_time,
                end_time: payload.end_time,
                foot_count: payload.foot_count,
                accel_count: payload.accel_count,
                label: payload.label,
                raw_data,
            });
        }
        windows.sort_by_key(|window| window.start_time);
        Ok(windows)
    }

    /// Apply labels to windows of the session. Ids that do not exist or belong to
    /// another session are skipped.
    pub async fn update_labels(
        &self,
        session: &SessionHandle,
        labels: &HashMap<String, String>,
    ) -> IndexResult<usize> {
        let mut updated = 0;
        for (window_id, label) in labels {
            let belongs = match self.index.retrieve(window_id).await? {
                Some(point) => point.payload.session_id == session.as_str(),
                None => false,
            };
            if !belongs {
                warn!("Window {window_id} not found in session {session}, label skipped");
                continue;
            }
            if self
                .index
                .update_payload_field(window_id, "label", Value::String(label.clone()))
                .await?
            {
                updated += 1;
            }
        }
        Ok(updated)
    }

    pub async fn export_csv(&self, session: &SessionHandle) -> IndexResult<String> {
        let windows = self.get_session_data(session, false).await?;
        Ok(windows_to_csv(&windows))
    }

    pub async fn health(&self) -> HealthReport {
        let index_available = self.index.is_available().await;
        let point_count = if index_available {
            self.index.count().await.ok()
        } else {
            None
        };
        let pending_sessions = self
            .assembler
            .pending_sessions()
            .await
            .into_iter()
            .map(|session| session.to_string())
            .collect();

        HealthReport {
            status: if index_available { "healthy" } else { "degraded" },
            index_available,
            point_count,
            sessions: self.sessions.read().await.len(),
            pending_sessions,
        }
    }
}
