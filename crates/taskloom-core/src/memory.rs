//! Execution memory: write-through storage to a vector store and the
//! relational store, plus similarity search with hydration.
//!
//! The embedding is a deterministic function of the text so stored vectors
//! and query vectors agree without an external model; a model-backed
//! embedder slots in behind the same [`VectorStore`] seam.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::error::TaskloomError;
use crate::events::{Event, EventBus};
use crate::graph::MemoryRecord;
use crate::store::{MemoryRow, Store};

pub const EMBEDDING_DIM: usize = 128;

/// Deterministic 128-float embedding via SHA-256 expansion, L2-normalized.
pub fn embed(text: &str) -> Vec<f32> {
    let mut out = Vec::with_capacity(EMBEDDING_DIM);
    let mut chunk_index = 0u32;
    while out.len() < EMBEDDING_DIM {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(chunk_index.to_le_bytes());
        let digest = hasher.finalize();
        for bytes in digest.chunks_exact(4) {
            if out.len() == EMBEDDING_DIM {
                break;
            }
            let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            // Map to [-1, 1].
            out.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
        }
        chunk_index += 1;
    }

    let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut out {
            *x /= norm;
        }
    }
    out
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add_embedding(
        &self,
        id: &str,
        vector: Vec<f32>,
        payload: Value,
    ) -> Result<(), TaskloomError>;

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorHit>, TaskloomError>;

    async fn delete(&self, id: &str) -> Result<(), TaskloomError>;
}

/// In-memory vector store with real cosine scoring.
pub struct MemoryVectorStore {
    points: DashMap<String, (Vec<f32>, Value)>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self {
            points: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl Default for MemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn add_embedding(
        &self,
        id: &str,
        vector: Vec<f32>,
        payload: Value,
    ) -> Result<(), TaskloomError> {
        self.points.insert(id.to_string(), (vector, payload));
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorHit>, TaskloomError> {
        let mut hits: Vec<VectorHit> = self
            .points
            .iter()
            .map(|entry| VectorHit {
                id: entry.key().clone(),
                score: cosine(vector, &entry.value().0),
                payload: entry.value().1.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, id: &str) -> Result<(), TaskloomError> {
        self.points.remove(id);
        Ok(())
    }
}

#[cfg(feature = "qdrant-vector")]
pub use self::qdrant_vector::QdrantVectorStore;

#[cfg(feature = "qdrant-vector")]
mod qdrant_vector {
    use qdrant_client::Qdrant;
    use qdrant_client::qdrant::{
        CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder,
        UpsertPointsBuilder, VectorParamsBuilder,
    };

    use super::*;

    pub struct QdrantVectorStore {
        client: Qdrant,
        collection: String,
    }

    impl QdrantVectorStore {
        pub async fn connect(url: &str, collection: &str) -> Result<Self, TaskloomError> {
            let client = Qdrant::from_url(url)
                .build()
                .map_err(|err| TaskloomError::Persistence(format!("qdrant client: {err}")))?;

            let exists = client
                .collection_exists(collection)
                .await
                .map_err(|err| TaskloomError::Persistence(format!("qdrant probe: {err}")))?;
            if !exists {
                client
                    .create_collection(
                        CreateCollectionBuilder::new(collection).vectors_config(
                            VectorParamsBuilder::new(EMBEDDING_DIM as u64, Distance::Cosine),
                        ),
                    )
                    .await
                    .map_err(|err| {
                        TaskloomError::Persistence(format!("qdrant create collection: {err}"))
                    })?;
                tracing::info!(collection, "created qdrant collection");
            }

            Ok(Self {
                client,
                collection: collection.to_string(),
            })
        }
    }

    #[async_trait]
    impl VectorStore for QdrantVectorStore {
        async fn add_embedding(
            &self,
            id: &str,
            vector: Vec<f32>,
            payload: Value,
        ) -> Result<(), TaskloomError> {
            let payload: qdrant_client::Payload = payload
                .try_into()
                .map_err(|err| TaskloomError::Persistence(format!("qdrant payload: {err}")))?;
            let point = PointStruct::new(id.to_string(), vector, payload);
            self.client
                .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
                .await
                .map_err(|err| TaskloomError::Persistence(format!("qdrant upsert: {err}")))?;
            Ok(())
        }

        async fn search(
            &self,
            vector: &[f32],
            limit: usize,
        ) -> Result<Vec<VectorHit>, TaskloomError> {
            let response = self
                .client
                .search_points(
                    SearchPointsBuilder::new(&self.collection, vector.to_vec(), limit as u64)
                        .with_payload(true),
                )
                .await
                .map_err(|err| TaskloomError::Persistence(format!("qdrant search: {err}")))?;

            Ok(response
                .result
                .into_iter()
                .map(|point| {
                    let payload: std::collections::HashMap<String, Value> = point
                        .payload
                        .into_iter()
                        .map(|(k, v)| (k, v.into()))
                        .collect();
                    VectorHit {
                        id: point
                            .id
                            .map(|id| format!("{id:?}"))
                            .unwrap_or_default(),
                        score: point.score,
                        payload: serde_json::to_value(payload).unwrap_or(Value::Null),
                    }
                })
                .collect())
        }

        async fn delete(&self, _id: &str) -> Result<(), TaskloomError> {
            Ok(())
        }
    }
}

/// Request to persist one execution's memory.
#[derive(Debug, Clone)]
pub struct StoreMemoryRequest {
    pub category: String,
    pub goal_summary: String,
    pub task_graph_snapshot: Option<Value>,
    pub execution_logs: Vec<Value>,
    pub errors: Vec<Value>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub record_id: String,
    pub similarity: f32,
    pub data: Value,
}

/// Per-category usage summary derived from stored rows.
#[derive(Debug, Clone, Serialize)]
pub struct CategorySummary {
    pub category: String,
    pub records: usize,
    pub with_errors: usize,
}

pub struct MemoryService {
    store: Arc<dyn Store>,
    vectors: Arc<dyn VectorStore>,
    bus: Arc<EventBus>,
    config: MemoryConfig,
}

impl MemoryService {
    pub fn new(
        store: Arc<dyn Store>,
        vectors: Arc<dyn VectorStore>,
        bus: Arc<EventBus>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            bus,
            config,
        }
    }

    /// Write-through store: vector upsert first, then the relational row.
    /// A vector-store failure degrades gracefully and never blocks the
    /// relational write.
    pub async fn store_execution(
        &self,
        request: StoreMemoryRequest,
    ) -> Result<String, TaskloomError> {
        let record_id = Uuid::new_v4().to_string();
        let embedding = embed(&request.goal_summary);

        let record = MemoryRecord {
            record_id: record_id.clone(),
            category: request.category.clone(),
            goal_summary: request.goal_summary.clone(),
            task_graph_snapshot: request.task_graph_snapshot,
            execution_logs: request.execution_logs,
            errors_and_resolutions: request.errors.clone(),
            context_tags: request.tags.clone(),
            embedding: Some(embedding.clone()),
            access_count: 0,
            created_at: Utc::now(),
            ttl_hours: None,
        };

        let embedding_id = Uuid::new_v4().to_string();
        let vector_payload = json!({
            "record_id": record_id,
            "category": request.category,
            "tags": request.tags,
        });
        let mut stored_embedding_id = Some(embedding_id.clone());
        if let Err(err) = self
            .vectors
            .add_embedding(&embedding_id, embedding, vector_payload)
            .await
        {
            tracing::error!(error = %err, "vector store write failed, keeping relational row");
            stored_embedding_id = None;
        }

        let content = serde_json::to_string(&record)
            .map_err(|err| TaskloomError::Persistence(format!("encode record: {err}")))?;
        self.store
            .upsert_memory(MemoryRow {
                id: record_id.clone(),
                content,
                kind: record.category.clone(),
                timestamp: record.created_at,
                embedding_id: stored_embedding_id,
                metadata: json!({
                    "tags": record.context_tags,
                    "goal": record.goal_summary,
                    "errors": !request.errors.is_empty(),
                }),
            })
            .await?;

        let event = Event::new("memory.stored", "memory_service").with_payload(json!({
            "record_id": record_id,
            "category": record.category,
            "tags": record.context_tags,
        }));
        if let Err(err) = self.bus.publish(event).await {
            tracing::warn!(error = %err, "failed to publish memory.stored");
        }

        tracing::info!(record_id = %record_id, "persisted execution memory");
        Ok(record_id)
    }

    /// Similarity search: embed the query, vector-search top-k, hydrate by
    /// record id, filter by threshold, sorted by similarity descending.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>, TaskloomError> {
        let query_embedding = embed(query);
        let hits = self.vectors.search(&query_embedding, limit).await?;

        let record_ids: Vec<String> = hits
            .iter()
            .filter_map(|hit| {
                hit.payload
                    .get("record_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect();
        let rows = self.store.load_memories(&record_ids).await?;

        let mut results = Vec::new();
        for hit in &hits {
            let Some(record_id) = hit.payload.get("record_id").and_then(Value::as_str) else {
                continue;
            };
            if hit.score < self.config.similarity_threshold {
                continue;
            }
            if let Some(row) = rows.iter().find(|r| r.id == record_id) {
                let data =
                    serde_json::from_str(&row.content).unwrap_or_else(|_| Value::Null);
                results.push(MemoryHit {
                    record_id: record_id.to_string(),
                    similarity: hit.score,
                    data,
                });
            }
        }
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }

    /// Fetch one record by id.
    pub async fn recall(&self, record_id: &str) -> Result<Option<Value>, TaskloomError> {
        let rows = self.store.load_memories(&[record_id.to_string()]).await?;
        Ok(rows
            .first()
            .map(|row| serde_json::from_str(&row.content).unwrap_or(Value::Null)))
    }

    /// Aggregate stored rows into per-category usage counts.
    pub async fn category_summaries(&self) -> Result<Vec<CategorySummary>, TaskloomError> {
        let rows = self.store.all_memories().await?;
        let mut summaries: Vec<CategorySummary> = Vec::new();
        for row in rows {
            let with_error = row
                .metadata
                .get("errors")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            match summaries.iter_mut().find(|s| s.category == row.kind) {
                Some(summary) => {
                    summary.records += 1;
                    if with_error {
                        summary.with_errors += 1;
                    }
                }
                None => summaries.push(CategorySummary {
                    category: row.kind.clone(),
                    records: 1,
                    with_errors: usize::from(with_error),
                }),
            }
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BusConfig;
    use crate::store::MemoryStore;

    fn service() -> (MemoryService, Arc<MemoryVectorStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let vectors = Arc::new(MemoryVectorStore::new());
        let bus = Arc::new(EventBus::new(BusConfig::default()));
        let svc = MemoryService::new(
            store.clone(),
            vectors.clone(),
            bus,
            MemoryConfig {
                similarity_threshold: 0.85,
            },
        );
        (svc, vectors, store)
    }

    fn request(goal: &str) -> StoreMemoryRequest {
        StoreMemoryRequest {
            category: "orchestrated_execution".to_string(),
            goal_summary: goal.to_string(),
            task_graph_snapshot: Some(json!({"nodes": []})),
            execution_logs: vec![json!({"node_id": "a"})],
            errors: Vec::new(),
            tags: vec!["risk:low".to_string()],
        }
    }

    #[test]
    fn embeddings_are_deterministic_and_normalized() {
        let a = embed("index the quarterly report");
        let b = embed("index the quarterly report");
        let c = embed("something entirely different");
        assert_eq!(a.len(), EMBEDDING_DIM);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn store_writes_both_sides_and_search_hydrates() {
        let (svc, vectors, _store) = service();
        let record_id = svc.store_execution(request("summarize sales data")).await.unwrap();
        assert_eq!(vectors.len(), 1);

        // Identical goal text embeds identically, so similarity is 1.0.
        let hits = svc.search("summarize sales data", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_id, record_id);
        assert!(hits[0].similarity > 0.99);
        assert_eq!(
            hits[0].data["goal_summary"],
            json!("summarize sales data")
        );
    }

    #[tokio::test]
    async fn search_filters_below_threshold() {
        let (svc, _vectors, _store) = service();
        svc.store_execution(request("deploy the web service")).await.unwrap();
        let hits = svc.search("bake a chocolate cake", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn vector_failure_does_not_block_relational_write() {
        struct FailingVectors;

        #[async_trait]
        impl VectorStore for FailingVectors {
            async fn add_embedding(
                &self,
                _id: &str,
                _vector: Vec<f32>,
                _payload: Value,
            ) -> Result<(), TaskloomError> {
                Err(TaskloomError::Persistence("vector backend down".into()))
            }

            async fn search(
                &self,
                _vector: &[f32],
                _limit: usize,
            ) -> Result<Vec<VectorHit>, TaskloomError> {
                Ok(Vec::new())
            }

            async fn delete(&self, _id: &str) -> Result<(), TaskloomError> {
                Ok(())
            }
        }

        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(BusConfig::default()));
        let svc = MemoryService::new(
            store.clone(),
            Arc::new(FailingVectors),
            bus,
            MemoryConfig::default(),
        );

        let record_id = svc.store_execution(request("resilient store")).await.unwrap();
        let rows = store.load_memories(&[record_id]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].embedding_id.is_none());
    }

    #[tokio::test]
    async fn recall_returns_stored_record() {
        let (svc, _vectors, _store) = service();
        let record_id = svc.store_execution(request("recall me")).await.unwrap();
        let record = svc.recall(&record_id).await.unwrap().unwrap();
        assert_eq!(record["goal_summary"], json!("recall me"));
        assert!(svc.recall("missing-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn category_summaries_aggregate() {
        let (svc, _vectors, _store) = service();
        svc.store_execution(request("one")).await.unwrap();
        svc.store_execution(request("two")).await.unwrap();
        let mut failing = request("three");
        failing.errors = vec![json!({"node_id": "x", "error": "boom"})];
        svc.store_execution(failing).await.unwrap();

        let summaries = svc.category_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].records, 3);
        assert_eq!(summaries[0].with_errors, 1);
    }
}
