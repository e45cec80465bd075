//! HTTP client wrapper for interacting with Qdrant.

use crate::config::get_config;
use crate::qdrant::types::{PointInsert, QdrantError, QueryResponse, QueryResponseResult, ScoredPoint};
use crate::resilience::timeouts;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};

/// Number of points written per bulk upsert request.
const UPSERT_BATCH_SIZE: usize = 100;

/// Lightweight HTTP client for Qdrant operations.
#[derive(Debug)]
pub struct QdrantService {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
}

impl QdrantService {
    /// Construct a new client using configuration derived from the environment.
    pub fn new() -> Result<Self, QdrantError> {
        let config = get_config();
        let client = Client::builder()
            .user_agent("docquery/0.3")
            .connect_timeout(timeouts::INDEX_CONNECT)
            .build()?;

        let base_url = normalize_base_url(&config.qdrant_url).map_err(QdrantError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            has_api_key = %config
                .qdrant_api_key
                .as_deref()
                .map(|value| !value.is_empty())
                .unwrap_or(false),
            "Initialized Qdrant HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key: config.qdrant_api_key.clone(),
        })
    }

    /// Check whether the named collection exists.
    pub async fn collection_exists(&self, collection_name: &str) -> Result<bool, QdrantError> {
        let response = self
            .request(Method::GET, &format!("collections/{collection_name}"))?
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = QdrantError::UnexpectedStatus { status, body };
                tracing::error!(collection = collection_name, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    /// Create a collection with the given vector size and cosine distance.
    pub async fn create_collection(
        &self,
        collection_name: &str,
        vector_size: u64,
    ) -> Result<(), QdrantError> {
        let body = json!({
            "vectors": {
                "size": vector_size,
                "distance": "Cosine"
            }
        });

        let response = self
            .request(Method::PUT, &format!("collections/{collection_name}"))?
            .json(&body)
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection = collection_name, vector_size, "Collection created");
        })
        .await
    }

    /// Create the collection only when it is missing, then wait for it to settle.
    ///
    /// The settle delay compensates for eventual consistency in index propagation: a freshly
    /// created collection may reject writes for a short window.
    pub async fn ensure_collection(
        &self,
        collection_name: &str,
        vector_size: u64,
    ) -> Result<(), QdrantError> {
        if self.collection_exists(collection_name).await? {
            tracing::debug!(collection = collection_name, "Collection already exists");
            return Ok(());
        }

        tracing::info!(
            collection = collection_name,
            vector_size,
            "Collection missing; creating it now"
        );
        self.create_collection(collection_name, vector_size).await?;
        tokio::time::sleep(timeouts::INDEX_SETTLE).await;
        Ok(())
    }

    /// Upload vectors to the given collection in bounded batches.
    pub async fn upsert_points(
        &self,
        collection_name: &str,
        points: Vec<PointInsert>,
    ) -> Result<usize, QdrantError> {
        if points.is_empty() {
            return Ok(0);
        }

        let total = points.len();
        for batch in points.chunks(UPSERT_BATCH_SIZE) {
            let serialized: Vec<_> = batch
                .iter()
                .map(|point| {
                    let mut payload = serde_json::Map::new();
                    payload.insert("text".into(), Value::String(point.payload.text.clone()));
                    for (key, value) in &point.payload.metadata {
                        payload.insert(key.clone(), Value::String(value.clone()));
                    }
                    json!({
                        "id": point.id,
                        "vector": point.vector,
                        "payload": payload,
                    })
                })
                .collect();

            let batch_len = serialized.len();
            let response = self
                .request(
                    Method::PUT,
                    &format!("collections/{collection_name}/points"),
                )?
                .query(&[("wait", true)])
                .json(&json!({ "points": serialized }))
                .send()
                .await?;

            self.ensure_success(response, || {
                tracing::debug!(
                    collection = collection_name,
                    points = batch_len,
                    "Point batch indexed"
                );
            })
            .await?;
        }

        tracing::debug!(collection = collection_name, points = total, "Points indexed");
        Ok(total)
    }

    /// Perform a similarity search against a collection, returning scored payloads.
    pub async fn search_points(
        &self,
        collection_name: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, QdrantError> {
        let body = json!({
            "query": vector,
            "limit": limit,
            "with_payload": true,
        });

        let response = self
            .request(
                Method::POST,
                &format!("collections/{collection_name}/points/query"),
            )?
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = QdrantError::UnexpectedStatus { status, body };
            tracing::error!(collection = collection_name, error = %error, "Qdrant search failed");
            return Err(error);
        }

        let payload: QueryResponse = response.json().await?;
        let points = match payload.result {
            QueryResponseResult::Points(points) => points,
            QueryResponseResult::Object { points } => points,
        };
        let results = points
            .into_iter()
            .map(|point| {
                let text = point.payload.as_ref().and_then(|map| {
                    map.get("text").and_then(|value| match value {
                        Value::String(text) => Some(text.clone()),
                        _ => None,
                    })
                });
                ScoredPoint {
                    id: stringify_point_id(point.id),
                    score: point.score,
                    text,
                }
            })
            .collect();

        Ok(results)
    }

    fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder, QdrantError> {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        Ok(req)
    }

    async fn ensure_success<F>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), QdrantError>
    where
        F: FnOnce(),
    {
        if response.status().is_success() {
            on_success();
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = QdrantError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Qdrant request failed");
            Err(error)
        }
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn stringify_point_id(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qdrant::types::ChunkPayload;
    use httpmock::{Method::POST, Method::PUT, MockServer};
    use reqwest::Client;
    use std::collections::BTreeMap;

    fn service_for(server: &MockServer) -> QdrantService {
        QdrantService {
            client: Client::builder()
                .user_agent("docquery-test")
                .build()
                .expect("client"),
            base_url: server.base_url(),
            api_key: None,
        }
    }

    #[tokio::test]
    async fn search_points_maps_scored_payloads() {
        let server = MockServer::start_async().await;

        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/collections/demo/points/query");
                then.status(200).json_body(serde_json::json!({
                    "status": "ok",
                    "time": 0.0,
                    "result": [
                        {
                            "id": "chunk-1",
                            "score": 0.42,
                            "payload": {
                                "text": "Example clause",
                                "source": "https://example.org/policy.pdf"
                            }
                        }
                    ]
                }));
            })
            .await;

        let service = service_for(&server);
        let results = service
            .search_points("demo", vec![0.1, 0.2], 3)
            .await
            .expect("search request");

        mock.assert();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "chunk-1");
        assert!((results[0].score - 0.42).abs() < f32::EPSILON);
        assert_eq!(results[0].text.as_deref(), Some("Example clause"));
    }

    #[tokio::test]
    async fn upsert_points_splits_large_inputs_into_batches() {
        let server = MockServer::start_async().await;

        let mock = server
            .mock_async(|when, then| {
                when.method(PUT).path("/collections/demo/points");
                then.status(200).json_body(serde_json::json!({
                    "status": "ok",
                    "time": 0.0,
                    "result": { "operation_id": 1, "status": "completed" }
                }));
            })
            .await;

        let points: Vec<_> = (0..150)
            .map(|i| PointInsert {
                id: format!("point-{i}"),
                payload: ChunkPayload {
                    text: format!("chunk {i}"),
                    metadata: BTreeMap::new(),
                },
                vector: vec![0.0, 1.0],
            })
            .collect();

        let service = service_for(&server);
        let written = service
            .upsert_points("demo", points)
            .await
            .expect("upsert request");

        assert_eq!(written, 150);
        mock.assert_hits(2);
    }

    #[tokio::test]
    async fn collection_exists_distinguishes_missing_collections() {
        let server = MockServer::start_async().await;

        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/collections/absent");
                then.status(404).body("not found");
            })
            .await;

        let service = service_for(&server);
        let exists = service
            .collection_exists("absent")
            .await
            .expect("existence check");
        assert!(!exists);
    }
}
