use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, OptionalExtension};
use serde_json::Value;

use crate::db::{
    connection::Database,
    helpers::{placeholders, to_u64},
};

/// Collection parameters as persisted: dimension and metric name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRow {
    pub dimension: usize,
    pub metric: String,
}

#[derive(Debug, Clone)]
pub struct PointRow {
    pub seq: i64,
    pub id: String,
    pub vector: Option<Vec<u8>>,
    pub payload: String,
}

/// A `WHERE` fragment over the `payload` column plus its bound values.
#[derive(Debug, Clone, Default)]
pub struct PayloadPredicate {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

impl PayloadPredicate {
    fn clause(&self) -> String {
        if self.sql.is_empty() {
            String::new()
        } else {
            format!(" AND ({})", self.sql)
        }
    }
}

const ID_CHUNK: usize = 500;

impl Database {
    /// Create the collection if absent and return whatever parameters are stored.
    pub async fn ensure_collection(
        &self,
        name: &str,
        dimension: usize,
        metric: &str,
    ) -> Result<CollectionRow> {
        let name = name.to_string();
        let metric = metric.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO collections (name, dimension, metric, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, dimension as i64, metric, Utc::now().to_rfc3339()],
            )
            .context("failed to create collection")?;

            let (dimension, metric): (i64, String) = conn.query_row(
                "SELECT dimension, metric FROM collections WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(CollectionRow {
                dimension: to_u64(dimension, "dimension")? as usize,
                metric,
            })
        })
        .await
    }

    pub async fn get_collection(&self, name: &str) -> Result<Option<CollectionRow>> {
        let name = name.to_string();
        self.execute(move |conn| {
            let row = conn
                .query_row(
                    "SELECT dimension, metric FROM collections WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            row.map(|(dimension, metric)| {
                Ok(CollectionRow {
                    dimension: to_u64(dimension, "dimension")? as usize,
                    metric,
                })
            })
            .transpose()
        })
        .await
    }

    /// Insert or replace one point; a replaced point keeps its scroll position.
    pub async fn upsert_point(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<u8>,
        payload: String,
    ) -> Result<()> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO points (collection, id, vector, payload)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(collection, id) DO UPDATE SET
                     vector = excluded.vector,
                     payload = excluded.payload",
                params![collection, id, vector, payload],
            )
            .context("failed to upsert point")?;
            Ok(())
        })
        .await
    }

    pub async fn get_point(&self, collection: &str, id: &str) -> Result<Option<PointRow>> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.execute(move |conn| {
            let row = conn
                .query_row(
                    "SELECT seq, id, vector, payload FROM points
                     WHERE collection = ?1 AND id = ?2",
                    params![collection, id],
                    |row| {
                        Ok(PointRow {
                            seq: row.get(0)?,
                            id: row.get(1)?,
                            vector: Some(row.get(2)?),
                            payload: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Every point matching the predicate, vectors included, in insertion order.
    pub async fn load_points(
        &self,
        collection: &str,
        predicate: PayloadPredicate,
    ) -> Result<Vec<PointRow>> {
        let collection = collection.to_string();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT seq, id, vector, payload FROM points
                 WHERE collection = ?{} ORDER BY seq ASC",
                predicate.clause()
            );
            let args = std::iter::once(SqlValue::Text(collection)).chain(predicate.args);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), |row| {
                Ok(PointRow {
                    seq: row.get(0)?,
                    id: row.get(1)?,
                    vector: Some(row.get(2)?),
                    payload: row.get(3)?,
                })
            })?;

            let mut points = Vec::new();
            for row in rows {
                points.push(row?);
            }
            Ok(points)
        })
        .await
    }

    /// One page of payloads after `after_seq`, at most `limit` rows.
    pub async fn scroll_points(
        &self,
        collection: &str,
        predicate: PayloadPredicate,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<PointRow>> {
        let collection = collection.to_string();
        self.execute(move |conn| {
            let sql = format!(
                "SELECT seq, id, payload FROM points
                 WHERE collection = ? AND seq > ?{} ORDER BY seq ASC LIMIT ?",
                predicate.clause()
            );
            let args = [SqlValue::Text(collection), SqlValue::Integer(after_seq)]
                .into_iter()
                .chain(predicate.args)
                .chain(std::iter::once(SqlValue::Integer(
                    i64::try_from(limit).unwrap_or(i64::MAX),
                )));
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), |row| {
                Ok(PointRow {
                    seq: row.get(0)?,
                    id: row.get(1)?,
                    vector: None,
                    payload: row.get(2)?,
                })
            })?;

            let mut points = Vec::new();
            for row in rows {
                points.push(row?);
            }
            Ok(points)
        })
        .await
    }

    /// Read-modify-write of one payload inside a single DB task. Returns false if the
    /// point does not exist.
    pub async fn modify_payload<F>(&self, collection: &str, id: &str, modify: F) -> Result<bool>
    where
        F: FnOnce(Value) -> Result<Value> + Send + 'static,
    {
        let collection = collection.to_string();
        let id = id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT payload FROM points WHERE collection = ?1 AND id = ?2",
                    params![collection, id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(current) = current else {
                return Ok(false);
            };

            let value: Value =
                serde_json::from_str(&current).context("stored payload is not valid JSON")?;
            let updated = serde_json::to_string(&modify(value)?)?;
            tx.execute(
                "UPDATE points SET payload = ?1 WHERE collection = ?2 AND id = ?3",
                params![updated, collection, id],
            )?;
            tx.commit().context("failed to commit payload update")?;
            Ok(true)
        })
        .await
    }

    pub async fn delete_points(&self, collection: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let collection = collection.to_string();
        let ids = ids.to_vec();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0;
            for chunk in ids.chunks(ID_CHUNK) {
                let sql = format!(
                    "DELETE FROM points WHERE collection = ? AND id IN ({})",
                    placeholders(chunk.len())
                );
                let args = std::iter::once(collection.as_str()).chain(chunk.iter().map(String::as_str));
                deleted += tx.execute(&sql, params_from_iter(args))?;
            }
            tx.commit().context("failed to commit point deletion")?;
            Ok(deleted)
        })
        .await
    }

    pub async fn count_points(&self, collection: &str) -> Result<u64> {
        let collection = collection.to_string();
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM points WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )?;
            to_u64(count, "count")
        })
        .await
    }
}
