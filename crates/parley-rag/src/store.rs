use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use parley_core::error::ParleyError;

/// Metadata attached to one vector entry. `doc_id` links back to the source
/// document; `chunk_index` is the vector's position within it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagMetadata {
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,
    pub chunk_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// One entry in a collection: the chunk id (`"<doc_id>-<i>"`), its vector,
/// metadata, and the original text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: RagMetadata,
    pub data: String,
}

/// A similarity hit. Distance is Euclidean; lower is closer.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub entry: RagEntry,
    pub distance: f32,
}

/// Retrieval filters, applied before ranking.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Restrict to entries whose `doc_id` is in this set.
    pub doc_ids: Option<HashSet<String>>,
    /// Restrict to entries with this `include` value (e.g. "always").
    pub include: Option<String>,
}

impl QueryOptions {
    fn admits(&self, meta: &RagMetadata) -> bool {
        if let Some(ids) = &self.doc_ids {
            if !ids.contains(&meta.doc_id) {
                return false;
            }
        }
        if let Some(include) = &self.include {
            if meta.include.as_deref() != Some(include.as_str()) {
                return false;
            }
        }
        true
    }
}

/// sled-backed vector store. One named tree per collection; values are
/// bincode-encoded [`RagEntry`]s keyed by entry id. Cheap to clone.
#[derive(Clone)]
pub struct RagStore {
    db: sled::Db,
}

fn tree_name(collection: &str) -> String {
    format!("rag:{collection}")
}

impl RagStore {
    /// Open (or create) the vector store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ParleyError> {
        let db = sled::open(path).map_err(|e| ParleyError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    /// Ephemeral store for tests; removed on drop.
    pub fn temporary() -> Result<Self, ParleyError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| ParleyError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    fn tree(&self, collection: &str) -> Result<sled::Tree, ParleyError> {
        self.db
            .open_tree(tree_name(collection))
            .map_err(|e| ParleyError::Storage(e.to_string()))
    }

    /// Upsert a batch of entries by id.
    pub fn store_batch(&self, collection: &str, entries: &[RagEntry]) -> Result<(), ParleyError> {
        let tree = self.tree(collection)?;
        let mut batch = sled::Batch::default();
        for entry in entries {
            let bytes = bincode::serialize(entry)
                .map_err(|e| ParleyError::Serialization(e.to_string()))?;
            batch.insert(entry.id.as_bytes(), bytes);
        }
        tree.apply_batch(batch)
            .map_err(|e| ParleyError::Storage(e.to_string()))
    }

    /// Top-`limit` entries by ascending Euclidean distance to `query`,
    /// after applying `options`.
    pub fn search(
        &self,
        collection: &str,
        query: &[f32],
        limit: usize,
        options: &QueryOptions,
    ) -> Result<Vec<SearchResult>, ParleyError> {
        let tree = self.tree(collection)?;
        let mut hits: Vec<SearchResult> = Vec::new();

        for item in tree.iter() {
            let (_, value) = item.map_err(|e| ParleyError::Storage(e.to_string()))?;
            let entry: RagEntry = bincode::deserialize(&value)
                .map_err(|e| ParleyError::Serialization(e.to_string()))?;
            if !options.admits(&entry.metadata) {
                continue;
            }
            if entry.vector.len() != query.len() {
                return Err(ParleyError::VectorSizeMismatch {
                    expected: query.len(),
                    got: entry.vector.len(),
                });
            }
            let distance = euclidean(query, &entry.vector);
            hits.push(SearchResult { entry, distance });
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Run `search` for every query vector.
    pub fn search_batch(
        &self,
        collection: &str,
        queries: &[Vec<f32>],
        limit: usize,
        options: &QueryOptions,
    ) -> Result<Vec<Vec<SearchResult>>, ParleyError> {
        queries
            .iter()
            .map(|q| self.search(collection, q, limit, options))
            .collect()
    }

    /// Retrieve without similarity: by id set and/or metadata predicates,
    /// in key order.
    pub fn get(
        &self,
        collection: &str,
        ids: Option<&HashSet<String>>,
        options: &QueryOptions,
    ) -> Result<Vec<RagEntry>, ParleyError> {
        let tree = self.tree(collection)?;
        let mut out = Vec::new();
        for item in tree.iter() {
            let (key, value) = item.map_err(|e| ParleyError::Storage(e.to_string()))?;
            if let Some(ids) = ids {
                let key = String::from_utf8_lossy(&key);
                if !ids.contains(key.as_ref()) {
                    continue;
                }
            }
            let entry: RagEntry = bincode::deserialize(&value)
                .map_err(|e| ParleyError::Serialization(e.to_string()))?;
            if options.admits(&entry.metadata) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    pub fn count(&self, collection: &str) -> Result<usize, ParleyError> {
        Ok(self.tree(collection)?.len())
    }

    pub fn delete_collection(&self, collection: &str) -> Result<(), ParleyError> {
        self.db
            .drop_tree(tree_name(collection))
            .map(|_| ())
            .map_err(|e| ParleyError::Storage(e.to_string()))
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
