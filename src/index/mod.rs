//! Persistent vector index over finalized session windows.
//!
//! Two backends implement [`VectorIndex`]: a local SQLite store with brute-force
//! scoring and a client for a Qdrant server. Both expose the same payload schema
//! ([`WindowPayload`]) and the same exact-match [`Filter`] semantics.

mod filter;
mod qdrant;
mod scroll;
mod sqlite;

pub use filter::{validate_field_name, FieldCondition, Filter};
pub use qdrant::{QdrantConfig, QdrantIndex};
pub use scroll::Scroll;
pub use sqlite::SqliteVectorIndex;

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{IndexBackend, IndexSettings};
use crate::error::IndexError;
use crate::models::{VectorPoint, WindowPayload};

pub type IndexResult<T> = Result<T, IndexError>;

/// Page size used when resolving ids for a filtered delete.
const DELETE_SCAN_PAGE: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    #[default]
    Cosine,
    Dot,
    Euclid,
}

impl Distance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distance::Cosine => "cosine",
            Distance::Dot => "dot",
            Distance::Euclid => "euclid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "cosine" => Some(Distance::Cosine),
            "dot" => Some(Distance::Dot),
            "euclid" | "euclidean" => Some(Distance::Euclid),
            _ => None,
        }
    }

    /// Score of `b` against `a`. Accumulates in f64.
    pub fn score(&self, a: &[f32], b: &[f32]) -> f64 {
        match self {
            Distance::Cosine => {
                let (mut dot, mut norm_a, mut norm_b) = (0.0_f64, 0.0_f64, 0.0_f64);
                for (&x, &y) in a.iter().zip(b) {
                    let (x, y) = (f64::from(x), f64::from(y));
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    0.0
                } else {
                    dot / (norm_a.sqrt() * norm_b.sqrt())
                }
            }
            Distance::Dot => a
                .iter()
                .zip(b)
                .map(|(&x, &y)| f64::from(x) * f64::from(y))
                .sum(),
            Distance::Euclid => a
                .iter()
                .zip(b)
                .map(|(&x, &y)| {
                    let d = f64::from(x) - f64::from(y);
                    d * d
                })
                .sum::<f64>()
                .sqrt(),
        }
    }

    /// Order two scores so that the better match comes first.
    pub fn rank(&self, a: f64, b: f64) -> Ordering {
        let ordering = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        match self {
            Distance::Euclid => ordering,
            Distance::Cosine | Distance::Dot => ordering.reverse(),
        }
    }
}

/// One hit of a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f64,
    pub payload: WindowPayload,
}

/// A payload as returned by scrolling (vectors are never transferred).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadRecord {
    pub id: String,
    pub payload: WindowPayload,
}

#[derive(Debug, Clone, Default)]
pub struct ScrollPage {
    pub records: Vec<PayloadRecord>,
    /// Opaque continuation; `None` on the last page.
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if absent. An existing collection with a different
    /// dimension is an error.
    async fn ensure_collection(&self, dimension: usize, distance: Distance) -> IndexResult<()>;

    /// Insert or replace one point.
    async fn upsert(&self, point: VectorPoint) -> IndexResult<()>;

    async fn retrieve(&self, id: &str) -> IndexResult<Option<VectorPoint>>;

    /// Up to `k` best matches among the points satisfying `filter`.
    async fn query_similar(
        &self,
        vector: &[f32],
        k: usize,
        filter: &Filter,
    ) -> IndexResult<Vec<ScoredPoint>>;

    async fn scroll_page(
        &self,
        filter: &Filter,
        cursor: Option<&str>,
        page_size: usize,
    ) -> IndexResult<ScrollPage>;

    /// Set one payload field, leaving the vector untouched. Returns false if the
    /// point does not exist.
    async fn update_payload_field(&self, id: &str, field: &str, value: Value)
        -> IndexResult<bool>;

    async fn delete_points(&self, ids: &[String]) -> IndexResult<usize>;

    async fn count(&self) -> IndexResult<u64>;

    async fn is_available(&self) -> bool;

    /// Resolve matching ids with a full scroll, then delete them in bulk. Points
    /// inserted during the scan may survive.
    async fn delete_by_filter(&self, filter: &Filter) -> IndexResult<usize> {
        let records = Scroll::new(self, filter.clone(), DELETE_SCAN_PAGE)
            .collect_all()
            .await?;
        if records.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = records.into_iter().map(|record| record.id).collect();
        self.delete_points(&ids).await
    }
}

/// Scroll helper usable on trait objects.
/// Set `field` on a stored payload. Rejects updates that would leave the payload
/// unreadable as a [`WindowPayload`].
pub(crate) fn apply_payload_field(
    mut payload: Value,
    field: &str,
    value: Value,
) -> IndexResult<Value> {
    validate_field_name(field)?;
    let Some(object) = payload.as_object_mut() else {
        return Err(IndexError::Protocol("stored payload is not an object".into()));
    };
    object.insert(field.to_string(), value);
    if serde_json::from_value::<WindowPayload>(payload.clone()).is_err() {
        return Err(IndexError::InvalidField(field.to_string()));
    }
    Ok(payload)
}

pub fn scroll<I: VectorIndex + ?Sized>(index: &I, filter: Filter, page_size: usize) -> Scroll<'_, I> {
    Scroll::new(index, filter, page_size)
}

/// Build the backend selected in `settings`. Nothing is contacted yet.
pub fn open_index(settings: &IndexSettings) -> anyhow::Result<Arc<dyn VectorIndex>> {
    match settings.backend {
        IndexBackend::Sqlite => {
            if let Some(parent) = settings.sqlite_path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create index directory {}", parent.display())
                })?;
            }
            let index =
                SqliteVectorIndex::open(settings.sqlite_path.clone(), settings.qdrant.collection.clone())?;
            Ok(Arc::new(index))
        }
        IndexBackend::Qdrant => Ok(Arc::new(QdrantIndex::new(&settings.qdrant)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cosine_is_scale_invariant_and_handles_zero() {
        let a = [1.0_f32, 0.0, 0.0];
        let b = [3.0_f32, 0.0, 0.0];
        assert!((Distance::Cosine.score(&a, &b) - 1.0).abs() < 1e-12);
        assert_eq!(Distance::Cosine.score(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn euclid_ranks_smaller_first() {
        let mut scores = vec![3.0, 1.0, 2.0];
        scores.sort_by(|a, b| Distance::Euclid.rank(*a, *b));
        assert_eq!(scores, vec![1.0, 2.0, 3.0]);

        scores.sort_by(|a, b| Distance::Cosine.rank(*a, *b));
        assert_eq!(scores, vec![3.0, 2.0, 1.0]);
    }

    fn stored_payload() -> Value {
        json!({
            "session_id": "s1", "device": "LEFT_FOOT",
            "start_time": 0, "end_time": 500,
            "foot_count": 3, "accel_count": 2,
            "label": null, "raw_data": ""
        })
    }

    #[test]
    fn payload_updates_keep_the_schema() {
        let updated = apply_payload_field(stored_payload(), "label", json!("walking")).unwrap();
        assert_eq!(updated["label"], "walking");
        assert_eq!(updated["foot_count"], 3);

        assert!(matches!(
            apply_payload_field(stored_payload(), "start_time", json!("soon")),
            Err(IndexError::InvalidField(field)) if field == "start_time"
        ));
        assert!(matches!(
            apply_payload_field(stored_payload(), "foot_count", json!(-1)),
            Err(IndexError::InvalidField(_))
        ));
        assert!(matches!(
            apply_payload_field(json!([1, 2]), "label", json!("x")),
            Err(IndexError::Protocol(_))
        ));
    }

    #[test]
    fn distance_names_round_trip() {
        for distance in [Distance::Cosine, Distance::Dot, Distance::Euclid] {
            assert_eq!(Distance::parse(distance.as_str()), Some(distance));
        }
        assert_eq!(Distance::parse("Euclidean"), Some(Distance::Euclid));
        assert_eq!(Distance::parse("manhattan"), None);
    }
}
