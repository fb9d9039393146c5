//! `DocumentStore` — a reference `KeyValueStore` (§6) good enough for
//! integration tests and local runs: no durability guarantees beyond
//! process lifetime, but a correct `cosineSimilarity` vector query and a
//! genuinely serializing `Transaction`.
//!
//! Grounded on `store::db`/`store::memory`'s document-store shape
//! (`openintent-store` keeps its authoritative state behind a `DashMap`
//! guarded for blocking SQLite access; here there is no disk, so the
//! `DashMap` *is* the store) and on `store::cache::CacheLayer`'s
//! moka-backed pattern for the cache half (`crate::cache`).

use std::sync::Arc;

use adk_core::error::{AdkError, Result};
use adk_core::interfaces::{KeyValueStore, QueryFilter};
use adk_core::model::Embedding;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;

/// In-memory, path-addressed document store.
///
/// Paths follow a `"{collection}/{id}"` convention; `query`'s `collection`
/// argument matches the prefix before the first `/`. Nothing enforces the
/// convention beyond `query` itself — `get`/`set`/`update`/`delete` treat
/// `path` as an opaque key, exactly as the `KeyValueStore` contract
/// describes.
#[derive(Clone)]
pub struct DocumentStore {
    docs: Arc<DashMap<String, Value>>,
    /// Global critical section for `transaction`. §C calls this "adequate
    /// for the core's correctness contract; not a performance target" —
    /// every transaction body runs with exclusive access to the whole
    /// store, not just the paths it touches.
    txn_lock: Arc<Mutex<()>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self {
            docs: Arc::new(DashMap::new()),
            txn_lock: Arc::new(Mutex::new(())),
        }
    }

    fn collection_prefix(collection: &str) -> String {
        format!("{collection}/")
    }

    /// Raw vector stored in a document's `embedding` field. Not validated
    /// against `EMBEDDING_DIM` here — a length mismatch against the query
    /// vector simply yields a similarity of 0.0 (`cosine` below), which is
    /// the store's problem to tolerate, not reject; callers populate this
    /// field with whatever their embedding provider returned.
    fn embedding_of(doc: &Value) -> Option<Vec<f32>> {
        let arr = doc.get("embedding")?.as_array()?;
        let vec: Vec<f32> = arr.iter().filter_map(|v| v.as_f64()).map(|f| f as f32).collect();
        if vec.len() != arr.len() {
            return None;
        }
        Some(vec)
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for DocumentStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.docs.get(path).map(|e| e.value().clone()))
    }

    async fn set(&self, path: &str, doc: Value) -> Result<()> {
        self.docs.insert(path.to_string(), doc);
        Ok(())
    }

    async fn update(&self, path: &str, patch: Value) -> Result<()> {
        let Some(patch_obj) = patch.as_object() else {
            return Err(AdkError::Store(format!(
                "update patch for `{path}` must be a JSON object"
            )));
        };
        let mut entry = self
            .docs
            .entry(path.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        let Some(existing) = entry.value_mut().as_object_mut() else {
            return Err(AdkError::Store(format!(
                "existing document at `{path}` is not a JSON object"
            )));
        };
        for (k, v) in patch_obj {
            existing.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.docs.remove(path);
        Ok(())
    }

    async fn query(&self, collection: &str, filter: QueryFilter) -> Result<Vec<(String, Value)>> {
        let prefix = Self::collection_prefix(collection);
        let mut rows: Vec<(String, Value)> = self
            .docs
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .filter(|e| {
                filter.where_eq.iter().all(|(field, expected)| {
                    e.value().get(field).map(|v| v == expected).unwrap_or(false)
                })
            })
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        if let Some(query_vec) = &filter.nearest_to {
            let mut scored: Vec<(f32, String, Value)> = rows
                .into_iter()
                .filter_map(|(path, doc)| {
                    let emb = Self::embedding_of(&doc)?;
                    Some((cosine(&query_vec.0, &emb), path, doc))
                })
                .filter(|(score, _, _)| filter.min_score.map(|m| *score >= m).unwrap_or(true))
                .collect();
            // Descending similarity (invariant 8: "For Query results r1, r2
            // with scores s1 > s2, r1 precedes r2").
            scored.sort_by(|(sa, _, _), (sb, _, _)| sb.partial_cmp(sa).unwrap_or(std::cmp::Ordering::Equal));
            rows = scored.into_iter().map(|(_, path, doc)| (path, doc)).collect();
        } else if let Some(field) = &filter.order_by {
            rows.sort_by(|(_, a), (_, b)| {
                let av = a.get(field);
                let bv = b.get(field);
                let ord = compare_json(av, bv);
                if filter.descending { ord.reverse() } else { ord }
            });
        }

        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn transaction(&self, body: Box<dyn FnOnce() -> Result<()> + Send>) -> Result<()> {
        let _guard = self.txn_lock.lock().await;
        body()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 { 0.0 } else { dot / (norm_a * norm_b) }
}

fn compare_json(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&b.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = DocumentStore::new();
        store.set("knowledge/k1", json!({"title": "Refunds"})).await.unwrap();
        let doc = store.get("knowledge/k1").await.unwrap();
        assert_eq!(doc.unwrap()["title"], "Refunds");
    }

    #[tokio::test]
    async fn get_missing_path_returns_none() {
        let store = DocumentStore::new();
        assert!(store.get("knowledge/nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_merges_shallow() {
        let store = DocumentStore::new();
        store
            .set("tasks/t1", json!({"status": "queued", "repairCount": 0}))
            .await
            .unwrap();
        store.update("tasks/t1", json!({"status": "running"})).await.unwrap();
        let doc = store.get("tasks/t1").await.unwrap().unwrap();
        assert_eq!(doc["status"], "running");
        assert_eq!(doc["repairCount"], 0);
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let store = DocumentStore::new();
        store.set("tasks/t1", json!({})).await.unwrap();
        store.delete("tasks/t1").await.unwrap();
        assert!(store.get("tasks/t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_filters_by_collection_and_where_eq() {
        let store = DocumentStore::new();
        store.set("tasks/t1", json!({"userId": "u1", "status": "queued"})).await.unwrap();
        store.set("tasks/t2", json!({"userId": "u2", "status": "queued"})).await.unwrap();
        store.set("other/o1", json!({"userId": "u1"})).await.unwrap();

        let filter = QueryFilter {
            where_eq: vec![("userId".to_string(), json!("u1"))],
            ..Default::default()
        };
        let rows = store.query("tasks", filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "tasks/t1");
    }

    fn unit_vec(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[hot] = 1.0;
        v
    }

    #[tokio::test]
    async fn query_by_vector_orders_by_descending_cosine_similarity() {
        let store = DocumentStore::new();
        store
            .set("memory/close", json!({"embedding": unit_vec(adk_core::model::EMBEDDING_DIM, 0)}))
            .await
            .unwrap();
        store
            .set("memory/far", json!({"embedding": unit_vec(adk_core::model::EMBEDDING_DIM, 1)}))
            .await
            .unwrap();

        let mut query = unit_vec(adk_core::model::EMBEDDING_DIM, 0);
        query[1] = 0.01;
        let filter = QueryFilter {
            nearest_to: Some(Embedding::new(query).unwrap()),
            ..Default::default()
        };
        let rows = store.query("memory", filter).await.unwrap();
        assert_eq!(rows[0].0, "memory/close");
        assert_eq!(rows[1].0, "memory/far");
    }

    #[tokio::test]
    async fn query_limit_truncates_results() {
        let store = DocumentStore::new();
        for i in 0..5 {
            store.set(&format!("knowledge/k{i}"), json!({})).await.unwrap();
        }
        let filter = QueryFilter { limit: Some(2), ..Default::default() };
        let rows = store.query("knowledge", filter).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn transaction_serializes_concurrent_bodies() {
        let store = Arc::new(DocumentStore::new());
        store.set("counters/c1", json!({"n": 0})).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let s2 = Arc::clone(&store);
                store
                    .transaction(Box::new(move || {
                        let current = s2
                            .docs
                            .get("counters/c1")
                            .map(|e| e.value()["n"].as_i64().unwrap_or(0))
                            .unwrap_or(0);
                        s2.docs.insert("counters/c1".to_string(), json!({"n": current + 1}));
                        Ok(())
                    }))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let doc = store.get("counters/c1").await.unwrap().unwrap();
        assert_eq!(doc["n"], 20);
    }
}
