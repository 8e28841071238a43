//! Worker-side job runner: turns a scheduler dispatch into a running
//! expert persona. The dispatch carries the expert secret, the wallet
//! connection string, and persona settings in `env`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use parley_core::error::ParleyError;
use parley_crypto::Keys;
use parley_expert::{ExpertConfig, ExpertServer, MarginPricing};
use parley_relay::RelayPool;
use parley_scheduler::{Job, JobContext, JobRunner, JobState, RunningJob};

use crate::llm::OpenAiEngine;
use crate::wallet::RelayWallet;

pub const EXPERT_TYPE_OPENROUTER: &str = "openrouter";

pub struct ExpertJobRunner {
    pub pool: Arc<RelayPool>,
    pub discovery_relays: Vec<String>,
    pub llm_base_url: String,
    pub llm_api_key: String,
}

fn env_str(env: &serde_json::Value, key: &str) -> Option<String> {
    env.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn env_list(env: &serde_json::Value, key: &str) -> Vec<String> {
    env.get(key)
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).map(str::to_string).collect())
        .unwrap_or_default()
}

#[async_trait]
impl JobRunner for ExpertJobRunner {
    fn expert_types(&self) -> Vec<String> {
        vec![EXPERT_TYPE_OPENROUTER.to_string()]
    }

    async fn start(&self, job: Job, ctx: JobContext) -> Result<RunningJob, ParleyError> {
        let keys = Keys::from_secret_hex(&job.expert_privkey)?;
        let wallet = Arc::new(RelayWallet::from_connection_string(
            self.pool.clone(),
            &job.wallet_nwc,
        )?);

        let nickname = env_str(&job.env, "nickname").unwrap_or_else(|| "expert".into());
        let hashtags = env_list(&job.env, "hashtags");
        let model = env_str(&job.env, "model")
            .unwrap_or_else(|| "openai/gpt-4o-mini".into());
        let base_sats = job.env.get("base_sats").and_then(|v| v.as_u64()).unwrap_or(10);

        let mut config = ExpertConfig::new(&nickname, hashtags, self.discovery_relays.clone());
        if let Some(offer) = env_str(&job.env, "offer") {
            config.offer = offer;
        }

        let engine = Arc::new(OpenAiEngine::new(&self.llm_base_url, &self.llm_api_key, &model));
        let pricing = Arc::new(MarginPricing { base_sats, sats_per_1k_chars: 1, margin_pct: 10 });

        let server =
            ExpertServer::new(keys, self.pool.clone(), wallet, engine, pricing, None, config);
        info!(job_id = %ctx.job_id(), expert = %server.pubkey(), "starting dispatched expert");

        let handle = tokio::spawn(async move {
            ctx.status(JobState::Running, None).await;
            if let Err(e) = server.run().await {
                warn!(error = %e, "dispatched expert stopped");
                ctx.status(JobState::Failed, Some(e.to_string())).await;
            }
        });
        Ok(RunningJob::from_handle(handle))
    }
}
