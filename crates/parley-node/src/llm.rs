//! OpenAI-compatible backends for the injected model traits: chat
//! completions for answers, the embeddings endpoint for vectors. Works
//! against OpenRouter or any API-compatible server.

use async_trait::async_trait;
use serde_json::json;

use parley_core::error::ParleyError;
use parley_core::payload::PromptPayload;
use parley_expert::{Embedder, ReplyEngine};

pub struct OpenAiEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEngine {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ReplyEngine for OpenAiEngine {
    async fn reply(
        &self,
        prompt: &PromptPayload,
        context: &[String],
    ) -> Result<String, ParleyError> {
        let question = prompt
            .content
            .as_ref()
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let mut messages = Vec::new();
        if !context.is_empty() {
            messages.push(json!({
                "role": "system",
                "content": format!("Use the following context when answering:\n{}", context.join("\n---\n")),
            }));
        }
        messages.push(json!({ "role": "user", "content": question }));

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "messages": messages }))
            .send()
            .await
            .map_err(|e| ParleyError::Internal(format!("llm request: {e}")))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ParleyError::Parse(format!("llm response: {e}")))?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ParleyError::Internal(format!("llm returned no content: {body}")))
    }
}

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ParleyError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(|e| ParleyError::Internal(format!("embedding request: {e}")))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ParleyError::Parse(format!("embedding response: {e}")))?;
        let data = body["data"]
            .as_array()
            .ok_or_else(|| ParleyError::Parse(format!("embedding response shape: {body}")))?;

        data.iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|v| v.as_f64())
                            .map(|v| v as f32)
                            .collect()
                    })
                    .ok_or_else(|| ParleyError::Parse("embedding entry missing vector".into()))
            })
            .collect()
    }
}
