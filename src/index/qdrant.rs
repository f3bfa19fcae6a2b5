//! Client for a Qdrant server's REST API.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use super::{
    apply_payload_field, filter::validate_field_name, Distance, Filter, IndexResult,
    PayloadRecord, ScoredPoint, ScrollPage, VectorIndex,
};
use crate::error::IndexError;
use crate::models::{VectorPoint, WindowPayload};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
    pub timeout_secs: u64,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            api_key: None,
            collection: "sensor_windows".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

pub struct QdrantIndex {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    collection: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct CollectionInfo {
    config: CollectionConfig,
}

#[derive(Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Deserialize)]
struct VectorParams {
    size: usize,
}

#[derive(Deserialize)]
struct RemotePoint {
    id: Value,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    payload: Option<WindowPayload>,
}

#[derive(Deserialize)]
struct RemoteHit {
    id: Value,
    score: f64,
    #[serde(default)]
    payload: Option<WindowPayload>,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<RemotePoint>,
    #[serde(default)]
    next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
struct CountResult {
    count: u64,
}

fn qdrant_distance(distance: Distance) -> &'static str {
    match distance {
        Distance::Cosine => "Cosine",
        Distance::Dot => "Dot",
        Distance::Euclid => "Euclid",
    }
}

/// Qdrant ids are unsigned integers or UUID strings.
fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn id_to_json(id: &str) -> Value {
    match id.parse::<u64>() {
        Ok(number) => Value::from(number),
        Err(_) => Value::String(id.to_string()),
    }
}

fn filter_body(filter: &Filter) -> IndexResult<Option<Value>> {
    filter.validate()?;
    if filter.is_empty() {
        return Ok(None);
    }
    let must: Vec<Value> = filter
        .must
        .iter()
        .map(|condition| match &condition.value {
            Value::Null => json!({ "is_null": { "key": condition.key } }),
            value => json!({ "key": condition.key, "match": { "value": value } }),
        })
        .collect();
    Ok(Some(json!({ "must": must })))
}

fn require_payload(id: &Value, payload: Option<WindowPayload>) -> IndexResult<WindowPayload> {
    payload.ok_or_else(|| IndexError::Protocol(format!("point {id} returned without payload")))
}

impl QdrantIndex {
    pub fn new(config: &QdrantConfig) -> IndexResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| IndexError::Protocol(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            collection: config.collection.clone(),
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    /// Send and unwrap the `result` envelope. `Ok(None)` means 404.
    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> IndexResult<Option<T>> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Protocol(format!("status {status}: {body}")));
        }
        let envelope: Envelope<T> = response.json().await?;
        Ok(Some(envelope.result))
    }

    async fn call_collection<T: DeserializeOwned>(&self, request: RequestBuilder) -> IndexResult<T> {
        self.call(request)
            .await?
            .ok_or_else(|| IndexError::MissingCollection(self.collection.clone()))
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self, dimension: usize, distance: Distance) -> IndexResult<()> {
        let existing: Option<CollectionInfo> =
            self.call(self.client.get(self.collection_url(""))).await?;

        match existing {
            Some(info) => {
                let size = info.config.params.vectors.size;
                if size != dimension {
                    return Err(IndexError::DimensionMismatch {
                        expected: size,
                        actual: dimension,
                    });
                }
                debug!("Qdrant collection {} already exists", self.collection);
            }
            None => {
                let body = json!({
                    "vectors": { "size": dimension, "distance": qdrant_distance(distance) }
                });
                let _: Value = self
                    .call_collection(self.client.put(self.collection_url("")).json(&body))
                    .await?;
                debug!("Created Qdrant collection {}", self.collection);
            }
        }
        Ok(())
    }

    async fn upsert(&self, point: VectorPoint) -> IndexResult<()> {
        let body = json!({
            "points": [{
                "id": id_to_json(&point.id),
                "vector": point.vector,
                "payload": point.payload,
            }]
        });
        let _: Value = self
            .call_collection(
                self.client
                    .put(self.collection_url("/points?wait=true"))
                    .json(&body),
            )
            .await?;
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> IndexResult<Option<VectorPoint>> {
        let body = json!({
            "ids": [id_to_json(id)],
            "with_payload": true,
            "with_vector": true,
        });
        let points: Vec<RemotePoint> = self
            .call_collection(self.client.post(self.collection_url("/points")).json(&body))
            .await?;

        let Some(point) = points.into_iter().next() else {
            return Ok(None);
        };
        let vector = point
            .vector
            .ok_or_else(|| IndexError::Protocol(format!("point {id} returned without vector")))?;
        Ok(Some(VectorPoint {
            id: id_to_string(&point.id),
            payload: require_payload(&point.id, point.payload)?,
            vector,
        }))
    }

    async fn query_similar(
        &self,
        vector: &[f32],
        k: usize,
        filter: &Filter,
    ) -> IndexResult<Vec<ScoredPoint>> {
        let filter = filter_body(filter)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut body = json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }

        let hits: Vec<RemoteHit> = self
            .call_collection(
                self.client
                    .post(self.collection_url("/points/search"))
                    .json(&body),
            )
            .await?;

        hits.into_iter()
            .map(|hit| {
                Ok(ScoredPoint {
                    id: id_to_string(&hit.id),
                    payload: require_payload(&hit.id, hit.payload)?,
                    score: hit.score,
                })
            })
            .collect()
    }

    async fn scroll_page(
        &self,
        filter: &Filter,
        cursor: Option<&str>,
        page_size: usize,
    ) -> IndexResult<ScrollPage> {
        let mut body = json!({
            "limit": page_size.max(1),
            "with_payload": true,
            "with_vector": false,
        });
        if let Some(filter) = filter_body(filter)? {
            body["filter"] = filter;
        }
        if let Some(cursor) = cursor {
            let offset: Value = serde_json::from_str(cursor)
                .map_err(|_| IndexError::Protocol(format!("invalid scroll cursor '{cursor}'")))?;
            body["offset"] = offset;
        }

        let page: ScrollResult = self
            .call_collection(
                self.client
                    .post(self.collection_url("/points/scroll"))
                    .json(&body),
            )
            .await?;

        let records = page
            .points
            .into_iter()
            .map(|point| {
                Ok(PayloadRecord {
                    id: id_to_string(&point.id),
                    payload: require_payload(&point.id, point.payload)?,
                })
            })
            .collect::<IndexResult<Vec<_>>>()?;

        Ok(ScrollPage {
            records,
            next_cursor: page
                .next_page_offset
                .filter(|offset| !offset.is_null())
                .map(|offset| offset.to_string()),
        })
    }

    async fn update_payload_field(
        &self,
        id: &str,
        field: &str,
        value: Value,
    ) -> IndexResult<bool> {
        validate_field_name(field)?;

        let lookup = json!({ "ids": [id_to_json(id)], "with_payload": true, "with_vector": false });
        let existing: Vec<RemotePoint> = self
            .call_collection(self.client.post(self.collection_url("/points")).json(&lookup))
            .await?;
        let Some(point) = existing.into_iter().next() else {
            return Ok(false);
        };

        // Checked against the stored payload so a bad value never reaches the server.
        let current = serde_json::to_value(require_payload(&point.id, point.payload)?)
            .map_err(|err| IndexError::Protocol(format!("failed to encode payload: {err}")))?;
        apply_payload_field(current, field, value.clone())?;

        let mut payload = serde_json::Map::new();
        payload.insert(field.to_string(), value);
        let body = json!({ "payload": payload, "points": [id_to_json(id)] });
        let _: Value = self
            .call_collection(
                self.client
                    .post(self.collection_url("/points/payload?wait=true"))
                    .json(&body),
            )
            .await?;
        Ok(true)
    }

    /// Qdrant does not report how many ids existed; the requested count is returned.
    async fn delete_points(&self, ids: &[String]) -> IndexResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let points: Vec<Value> = ids.iter().map(|id| id_to_json(id)).collect();
        let body = json!({ "points": points });
        let _: Value = self
            .call_collection(
                self.client
                    .post(self.collection_url("/points/delete?wait=true"))
                    .json(&body),
            )
            .await?;
        Ok(ids.len())
    }

    async fn count(&self) -> IndexResult<u64> {
        let result: CountResult = self
            .call_collection(
                self.client
                    .post(self.collection_url("/points/count"))
                    .json(&json!({ "exact": true })),
            )
            .await?;
        Ok(result.count)
    }

    async fn is_available(&self) -> bool {
        let request = self.authorize(self.client.get(format!("{}/collections", self.base_url)));
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!("Qdrant at {} unreachable: {err}", self.base_url);
                false
            }
        }
    }
}
