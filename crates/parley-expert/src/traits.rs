use async_trait::async_trait;

use parley_core::error::ParleyError;
use parley_core::payload::PromptPayload;

/// The answer generator (LLM backend). Injected; the engine never knows
/// which model is behind it.
#[async_trait]
pub trait ReplyEngine: Send + Sync {
    /// Produce the full answer for `prompt`, given retrieval context
    /// snippets.
    async fn reply(&self, prompt: &PromptPayload, context: &[String])
        -> Result<String, ParleyError>;
}

/// The embedding model. Injected; must produce vectors matching the RAG
/// collection's vector size.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ParleyError>;
}

/// Price policy for quotes.
pub trait Pricing: Send + Sync {
    /// Price in sats for a prompt of `prompt_chars` with `context_chars` of
    /// retrieval context attached.
    fn price_sats(&self, prompt_chars: usize, context_chars: usize) -> u64;
}

/// Base price plus per-character token pricing with a percentage margin.
#[derive(Debug, Clone)]
pub struct MarginPricing {
    pub base_sats: u64,
    pub sats_per_1k_chars: u64,
    pub margin_pct: u64,
}

impl MarginPricing {
    /// Flat price regardless of size.
    pub fn flat(sats: u64) -> Self {
        Self { base_sats: sats, sats_per_1k_chars: 0, margin_pct: 0 }
    }
}

impl Pricing for MarginPricing {
    fn price_sats(&self, prompt_chars: usize, context_chars: usize) -> u64 {
        let chars = (prompt_chars + context_chars) as u64;
        let usage = self.base_sats + chars * self.sats_per_1k_chars / 1000;
        (usage + usage * self.margin_pct / 100).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_pricing_ignores_size() {
        let pricing = MarginPricing::flat(10);
        assert_eq!(pricing.price_sats(10, 0), 10);
        assert_eq!(pricing.price_sats(100_000, 50_000), 10);
    }

    #[test]
    fn margin_applies_on_top_of_usage() {
        let pricing = MarginPricing { base_sats: 100, sats_per_1k_chars: 1000, margin_pct: 50 };
        // 100 base + 1000 chars * 1 sat/char = 1100, +50% margin = 1650.
        assert_eq!(pricing.price_sats(1000, 0), 1650);
    }

    #[test]
    fn price_never_hits_zero() {
        let pricing = MarginPricing { base_sats: 0, sats_per_1k_chars: 0, margin_pct: 0 };
        assert_eq!(pricing.price_sats(0, 0), 1);
    }
}
