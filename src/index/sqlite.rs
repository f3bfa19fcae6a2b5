use std::path::PathBuf;

use async_trait::async_trait;
use log::warn;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use super::{
    apply_payload_field, filter::validate_field_name, Distance, Filter, IndexResult,
    PayloadRecord, ScoredPoint, ScrollPage, VectorIndex,
};
use crate::db::{
    helpers::{decode_vector_blob, encode_vector_blob},
    repositories::{PayloadPredicate, PointRow},
    Database, INDEX_SCHEMA,
};
use crate::error::IndexError;
use crate::models::{VectorPoint, WindowPayload};

/// Vector index persisted in a local SQLite file. Similarity is computed by a full
/// scan of the filtered points.
#[derive(Clone)]
pub struct SqliteVectorIndex {
    db: Database,
    collection: String,
}

impl SqliteVectorIndex {
    pub fn open(path: impl Into<PathBuf>, collection: impl Into<String>) -> anyhow::Result<Self> {
        let db = Database::open(path, &INDEX_SCHEMA)?;
        Ok(Self::new(db, collection))
    }

    pub fn new(db: Database, collection: impl Into<String>) -> Self {
        Self {
            db,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn collection_params(&self) -> IndexResult<(usize, Distance)> {
        let row = self
            .db
            .get_collection(&self.collection)
            .await?
            .ok_or_else(|| IndexError::MissingCollection(self.collection.clone()))?;
        let distance = Distance::parse(&row.metric).ok_or_else(|| {
            IndexError::Protocol(format!("unknown metric '{}' stored", row.metric))
        })?;
        Ok((row.dimension, distance))
    }
}

fn check_dimension(expected: usize, vector: &[f32]) -> IndexResult<()> {
    if vector.len() != expected {
        return Err(IndexError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Translate a filter into a `json_extract` conjunction over the payload column.
fn payload_predicate(filter: &Filter) -> IndexResult<PayloadPredicate> {
    filter.validate()?;

    let mut clauses = Vec::with_capacity(filter.must.len());
    let mut args = Vec::new();
    for condition in &filter.must {
        let path = format!("json_extract(payload, '$.{}')", condition.key);
        match &condition.value {
            Value::Null => clauses.push(format!("{path} IS NULL")),
            Value::Bool(flag) => {
                clauses.push(format!("{path} = ?"));
                args.push(SqlValue::Integer(i64::from(*flag)));
            }
            Value::Number(number) => {
                clauses.push(format!("{path} = ?"));
                args.push(match number.as_i64() {
                    Some(int) => SqlValue::Integer(int),
                    None => SqlValue::Real(number.as_f64().unwrap_or_default()),
                });
            }
            Value::String(text) => {
                clauses.push(format!("{path} = ?"));
                args.push(SqlValue::Text(text.clone()));
            }
            Value::Array(_) | Value::Object(_) => {
                return Err(IndexError::InvalidField(condition.key.clone()))
            }
        }
    }

    Ok(PayloadPredicate {
        sql: clauses.join(" AND "),
        args,
    })
}

fn decode_payload(row: &PointRow) -> IndexResult<WindowPayload> {
    Ok(serde_json::from_str(&row.payload)?)
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn ensure_collection(&self, dimension: usize, distance: Distance) -> IndexResult<()> {
        let row = self
            .db
            .ensure_collection(&self.collection, dimension, distance.as_str())
            .await?;
        if row.dimension != dimension {
            return Err(IndexError::DimensionMismatch {
                expected: row.dimension,
                actual: dimension,
            });
        }
        if row.metric != distance.as_str() {
            warn!(
                "Collection {} already uses {} distance, ignoring requested {}",
                self.collection,
                row.metric,
                distance.as_str()
            );
        }
        Ok(())
    }

    async fn upsert(&self, point: VectorPoint) -> IndexResult<()> {
        let (dimension, _) = self.collection_params().await?;
        check_dimension(dimension, &point.vector)?;
        let payload = serde_json::to_string(&point.payload)?;
        self.db
            .upsert_point(
                &self.collection,
                &point.id,
                encode_vector_blob(&point.vector),
                payload,
            )
            .await?;
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> IndexResult<Option<VectorPoint>> {
        let (dimension, _) = self.collection_params().await?;
        let Some(row) = self.db.get_point(&self.collection, id).await? else {
            return Ok(None);
        };
        let blob = row.vector.as_deref().unwrap_or_default();
        let vector = decode_vector_blob(blob, dimension)?;
        let payload = decode_payload(&row)?;
        Ok(Some(VectorPoint {
            id: row.id,
            vector,
            payload,
        }))
    }

    async fn query_similar(
        &self,
        vector: &[f32],
        k: usize,
        filter: &Filter,
    ) -> IndexResult<Vec<ScoredPoint>> {
        let (dimension, distance) = self.collection_params().await?;
        check_dimension(dimension, vector)?;
        let predicate = payload_predicate(filter)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = self.db.load_points(&self.collection, predicate).await?;
        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let blob = row.vector.as_deref().unwrap_or_default();
            let candidate = match decode_vector_blob(blob, dimension) {
                Ok(candidate) => candidate,
                Err(err) => {
                    warn!("Skipping point {} with unreadable vector: {err:#}", row.id);
                    continue;
                }
            };
            let payload = match decode_payload(&row) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("Skipping point {} with unreadable payload: {err}", row.id);
                    continue;
                }
            };
            hits.push(ScoredPoint {
                score: distance.score(vector, &candidate),
                id: row.id,
                payload,
            });
        }

        hits.sort_by(|a, b| distance.rank(a.score, b.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn scroll_page(
        &self,
        filter: &Filter,
        cursor: Option<&str>,
        page_size: usize,
    ) -> IndexResult<ScrollPage> {
        let predicate = payload_predicate(filter)?;
        let after_seq = match cursor {
            Some(cursor) => cursor
                .parse::<i64>()
                .map_err(|_| IndexError::Protocol(format!("invalid scroll cursor '{cursor}'")))?,
            None => 0,
        };
        let page_size = page_size.max(1);

        let mut rows = self
            .db
            .scroll_points(&self.collection, predicate, after_seq, page_size.saturating_add(1))
            .await?;
        let has_more = rows.len() > page_size;
        rows.truncate(page_size);

        let next_cursor = if has_more {
            rows.last().map(|row| row.seq.to_string())
        } else {
            None
        };

        let records = rows
            .iter()
            .map(|row| {
                Ok(PayloadRecord {
                    id: row.id.clone(),
                    payload: decode_payload(row)?,
                })
            })
            .collect::<IndexResult<Vec<_>>>()?;

        Ok(ScrollPage {
            records,
            next_cursor,
        })
    }

    async fn update_payload_field(
        &self,
        id: &str,
        field: &str,
        value: Value,
    ) -> IndexResult<bool> {
        validate_field_name(field)?;
        let field_name = field.to_string();

        let result = self
            .db
            .modify_payload(&self.collection, id, move |payload| {
                Ok(apply_payload_field(payload, &field_name, value)?)
            })
            .await;

        match result {
            Ok(found) => Ok(found),
            Err(err) => match err.downcast::<IndexError>() {
                Ok(index_err) => Err(index_err),
                Err(other) => Err(IndexError::Storage(other)),
            },
        }
    }

    async fn delete_points(&self, ids: &[String]) -> IndexResult<usize> {
        Ok(self.db.delete_points(&self.collection, ids).await?)
    }

    async fn count(&self) -> IndexResult<u64> {
        Ok(self.db.count_points(&self.collection).await?)
    }

    async fn is_available(&self) -> bool {
        self.db.count_points(&self.collection).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Scroll;
    use serde_json::json;
    use tempfile::TempDir;

    const DIM: usize = 4;

    fn payload(session: &str, start: i64) -> WindowPayload {
        WindowPayload {
            session_id: session.to_string(),
            device: "LEFT_FOOT".to_string(),
            start_time: start,
            end_time: start + 500,
            foot_count: 2,
            accel_count: 1,
            label: None,
            raw_data: String::new(),
        }
    }

    fn point(id: &str, session: &str, start: i64, vector: [f32; DIM]) -> VectorPoint {
        VectorPoint {
            id: id.to_string(),
            vector: vector.to_vec(),
            payload: payload(session, start),
        }
    }

    async fn open_index(dir: &TempDir) -> SqliteVectorIndex {
        let index = SqliteVectorIndex::open(dir.path().join("index.sqlite3"), "sensor_windows")
            .unwrap();
        index.ensure_collection(DIM, Distance::Cosine).await.unwrap();
        index
    }

    #[tokio::test]
    async fn ensure_collection_is_idempotent_and_checks_dimension() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;
        index.ensure_collection(DIM, Distance::Cosine).await.unwrap();
        assert!(matches!(
            index.ensure_collection(DIM + 1, Distance::Cosine).await,
            Err(IndexError::DimensionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn operations_before_creation_report_missing_collection() {
        let dir = TempDir::new().unwrap();
        let index =
            SqliteVectorIndex::open(dir.path().join("index.sqlite3"), "sensor_windows").unwrap();
        assert!(matches!(
            index.upsert(point("a", "s1", 0, [1.0, 0.0, 0.0, 0.0])).await,
            Err(IndexError::MissingCollection(_))
        ));
    }

    #[tokio::test]
    async fn upsert_replaces_and_retrieve_returns_vector() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;
        index.upsert(point("a", "s1", 0, [1.0, 0.0, 0.0, 0.0])).await.unwrap();
        index.upsert(point("a", "s1", 10, [0.0, 1.0, 0.0, 0.0])).await.unwrap();

        assert_eq!(index.count().await.unwrap(), 1);
        let stored = index.retrieve("a").await.unwrap().unwrap();
        assert_eq!(stored.vector, vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(stored.payload.start_time, 10);
        assert!(index.retrieve("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;
        let mut bad = point("a", "s1", 0, [1.0, 0.0, 0.0, 0.0]);
        bad.vector.push(0.5);
        assert!(matches!(
            index.upsert(bad).await,
            Err(IndexError::DimensionMismatch { expected: 4, actual: 5 })
        ));
        assert!(index
            .query_similar(&[1.0, 0.0], 3, &Filter::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn query_ranks_by_cosine_and_applies_filter() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;
        index.upsert(point("same", "s1", 0, [1.0, 0.0, 0.0, 0.0])).await.unwrap();
        index.upsert(point("close", "s1", 1, [0.9, 0.1, 0.0, 0.0])).await.unwrap();
        index.upsert(point("far", "s1", 2, [0.0, 0.0, 1.0, 0.0])).await.unwrap();
        index.upsert(point("other", "s2", 3, [1.0, 0.0, 0.0, 0.0])).await.unwrap();

        let query = [1.0, 0.0, 0.0, 0.0];
        let hits = index
            .query_similar(&query, 2, &Filter::session("s1"))
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["same", "close"]);
        assert!(hits[0].score >= hits[1].score);

        assert!(index
            .query_similar(&query, 0, &Filter::new())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            index.query_similar(&query, 10, &Filter::new()).await.unwrap().len(),
            4
        );
    }

    #[tokio::test]
    async fn scroll_visits_every_match_across_pages() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;
        for i in 0..7 {
            let session = if i % 2 == 0 { "even" } else { "odd" };
            index
                .upsert(point(&format!("p{i}"), session, i, [1.0, i as f32, 0.0, 0.0]))
                .await
                .unwrap();
        }

        let mut scroll = Scroll::new(&index, Filter::session("even"), 2);
        let mut pages = 0;
        let mut ids = Vec::new();
        while let Some(page) = scroll.next_page().await.unwrap() {
            pages += 1;
            ids.extend(page.into_iter().map(|record| record.id));
        }
        assert_eq!(ids, vec!["p0", "p2", "p4", "p6"]);
        assert_eq!(pages, 2);

        scroll.restart();
        assert_eq!(scroll.next_page().await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unbounded_page_size_returns_everything() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;
        for n in 0..3 {
            index
                .upsert(point(&format!("p{n}"), "s1", n * 500, [1.0, 0.0, 0.0, 0.0]))
                .await
                .unwrap();
        }

        let page = index
            .scroll_page(&Filter::new(), None, usize::MAX)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 3);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn update_payload_field_keeps_vector() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;
        index.upsert(point("a", "s1", 0, [0.5, 0.5, 0.0, 0.0])).await.unwrap();

        assert!(index
            .update_payload_field("a", "label", json!("walking"))
            .await
            .unwrap());
        let stored = index.retrieve("a").await.unwrap().unwrap();
        assert_eq!(stored.payload.label.as_deref(), Some("walking"));
        assert_eq!(stored.vector, vec![0.5, 0.5, 0.0, 0.0]);

        assert!(!index
            .update_payload_field("missing", "label", json!("x"))
            .await
            .unwrap());
        assert!(matches!(
            index.update_payload_field("a", "start_time", json!("soon")).await,
            Err(IndexError::InvalidField(_))
        ));
        assert!(matches!(
            index.update_payload_field("a", "bad.key", json!(1)).await,
            Err(IndexError::InvalidField(_))
        ));
    }

    #[tokio::test]
    async fn delete_by_filter_leaves_other_sessions() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;
        for i in 0..5 {
            index
                .upsert(point(&format!("x{i}"), "x", i, [1.0, 0.0, 0.0, 0.0]))
                .await
                .unwrap();
        }
        index.upsert(point("y0", "y", 0, [0.0, 1.0, 0.0, 0.0])).await.unwrap();

        assert_eq!(index.delete_by_filter(&Filter::session("x")).await.unwrap(), 5);
        assert!(Scroll::new(&index, Filter::session("x"), 10)
            .collect_all()
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            Scroll::new(&index, Filter::session("y"), 10)
                .collect_all()
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn filters_on_numbers_and_null() {
        let dir = TempDir::new().unwrap();
        let index = open_index(&dir).await;
        index.upsert(point("a", "s1", 100, [1.0, 0.0, 0.0, 0.0])).await.unwrap();
        index.upsert(point("b", "s1", 200, [1.0, 0.0, 0.0, 0.0])).await.unwrap();
        index.update_payload_field("b", "label", json!("run")).await.unwrap();

        let by_start = Scroll::new(&index, Filter::new().with("start_time", 200), 10)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(by_start.len(), 1);
        assert_eq!(by_start[0].id, "b");

        let unlabeled = Scroll::new(&index, Filter::new().with("label", Value::Null), 10)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(unlabeled.len(), 1);
        assert_eq!(unlabeled[0].id, "a");
    }
}
