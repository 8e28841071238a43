use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use parley_core::error::ParleyError;
use parley_rag::{QueryOptions, RagStore};

use crate::traits::Embedder;

/// Retrieval context source: embeds the question, queries the collection,
/// and always folds in entries pinned with `include = "always"`.
pub struct RagContext {
    pub rag: RagStore,
    pub collection: String,
    pub embedder: Arc<dyn Embedder>,
    pub top_k: usize,
    /// When set, an empty retrieval result means the expert has nothing to
    /// say and quotes `no_knowledge` instead of a price.
    pub require_context: bool,
}

impl RagContext {
    pub fn new(rag: RagStore, collection: &str, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            rag,
            collection: collection.to_string(),
            embedder,
            top_k: 5,
            require_context: false,
        }
    }

    /// Context snippets for `question`, similarity hits first, pinned
    /// entries appended, deduplicated by entry id.
    pub async fn context_for(&self, question: &str) -> Result<Vec<String>, ParleyError> {
        let vectors = self.embedder.embed(&[question.to_string()]).await?;
        let rankings =
            self.rag
                .search_batch(&self.collection, &vectors, self.top_k, &QueryOptions::default())?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut snippets = Vec::new();
        for ranking in rankings {
            for hit in ranking {
                if seen.insert(hit.entry.id.clone()) {
                    snippets.push(hit.entry.data);
                }
            }
        }

        let pinned = self.rag.get(
            &self.collection,
            None,
            &QueryOptions { doc_ids: None, include: Some("always".into()) },
        )?;
        for entry in pinned {
            if seen.insert(entry.id.clone()) {
                snippets.push(entry.data);
            }
        }

        debug!(collection = %self.collection, snippets = snippets.len(), "context assembled");
        Ok(snippets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HashEmbedder;
    use parley_rag::{RagEntry, RagMetadata};

    fn entry(id: &str, vector: Vec<f32>, data: &str, include: Option<&str>) -> RagEntry {
        RagEntry {
            id: id.to_string(),
            vector,
            metadata: RagMetadata {
                doc_id: id.to_string(),
                include: include.map(str::to_string),
                chunk_index: 0,
                doc_type: None,
                timestamp: None,
            },
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn pinned_entries_always_ride_along() {
        let rag = RagStore::temporary().unwrap();
        let embedder = Arc::new(HashEmbedder::new(4));
        let near = embedder.embed(&["paris".to_string()]).await.unwrap().remove(0);

        rag.store_batch(
            "kb",
            &[
                entry("close", near, "Paris is the capital of France", None),
                entry("pinned", vec![99.0; 4], "Always cite sources", Some("always")),
            ],
        )
        .unwrap();

        let ctx = RagContext::new(rag, "kb", embedder);
        let snippets = ctx.context_for("paris").await.unwrap();
        assert!(snippets.iter().any(|s| s.contains("capital of France")));
        assert!(snippets.iter().any(|s| s.contains("Always cite")));
    }
}
