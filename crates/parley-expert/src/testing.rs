//! Test support: deterministic stand-ins for the injected model backends.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use parley_core::error::ParleyError;
use parley_core::payload::PromptPayload;

use crate::traits::{Embedder, ReplyEngine};

/// Replies with a fixed answer, optionally echoing the context.
pub struct CannedEngine {
    pub answer: String,
}

impl CannedEngine {
    pub fn new(answer: &str) -> Self {
        Self { answer: answer.to_string() }
    }
}

#[async_trait]
impl ReplyEngine for CannedEngine {
    async fn reply(
        &self,
        _prompt: &PromptPayload,
        _context: &[String],
    ) -> Result<String, ParleyError> {
        Ok(self.answer.clone())
    }
}

/// Deterministic embedding: hash the text into a fixed-size unit-less
/// vector. Identical texts embed identically, so similarity behaves.
pub struct HashEmbedder {
    vector_size: usize,
}

impl HashEmbedder {
    pub fn new(vector_size: usize) -> Self {
        Self { vector_size }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ParleyError> {
        Ok(texts
            .iter()
            .map(|text| {
                let digest = Sha256::digest(text.as_bytes());
                (0..self.vector_size)
                    .map(|i| digest[i % digest.len()] as f32 / 255.0)
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_sized() {
        let embedder = HashEmbedder::new(8);
        let a = embedder.embed(&["paris".to_string()]).await.unwrap();
        let b = embedder.embed(&["paris".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 8);

        let c = embedder.embed(&["london".to_string()]).await.unwrap();
        assert_ne!(a, c);
    }
}
