use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use parley_core::constants::{
    DEFAULT_PUBLISH_TIMEOUT_SECS, ENCRYPTED_CHUNK_BUDGET, KIND_ASK, KIND_BID, KIND_BID_PAYLOAD,
    KIND_EXPERT_PROFILE, KIND_PROMPT, KIND_PROOF, KIND_QUOTE, KIND_REPLY,
};
use parley_core::error::ParleyError;
use parley_core::event::{Event, UnsignedEvent};
use parley_core::filter::Filter;
use parley_core::payload::{
    BidPayload, ExpertProfile, Invoice, PromptPayload, ProofPayload, QuotePayload, ReplyPayload,
};
use parley_core::types::{now_unix, Pubkey, Timestamp};
use parley_crypto::{decrypt, encrypt, sign_event, Keys};
use parley_payments::{verify_proof, Wallet};
use parley_relay::{RelayPool, SubscriptionItem};
use parley_stream::{ReaderLimits, StreamReader, StreamWriter, WriterConfig};

use crate::context::RagContext;
use crate::traits::{Pricing, ReplyEngine};

/// Expert identity and capabilities.
#[derive(Debug, Clone)]
pub struct ExpertConfig {
    pub nickname: String,
    pub description: String,
    pub hashtags: Vec<String>,
    pub formats: Vec<String>,
    pub compressions: Vec<String>,
    pub methods: Vec<String>,
    pub discovery_relays: Vec<String>,
    pub prompt_relays: Vec<String>,
    /// Offer text placed in bids.
    pub offer: String,
    /// Answers longer than this stream instead of going inline.
    pub stream_threshold: usize,
    /// Quote state lives this long awaiting a proof.
    pub quote_ttl: Duration,
}

impl ExpertConfig {
    pub fn new(nickname: &str, hashtags: Vec<String>, relays: Vec<String>) -> Self {
        Self {
            nickname: nickname.to_string(),
            description: String::new(),
            hashtags,
            formats: vec!["text".into()],
            compressions: vec!["none".into(), "gzip".into()],
            methods: vec!["lightning".into()],
            discovery_relays: relays.clone(),
            prompt_relays: relays,
            offer: "I can answer".into(),
            stream_threshold: ENCRYPTED_CHUNK_BUDGET,
            quote_ttl: Duration::from_secs(3600),
        }
    }
}

/// Everything remembered between quote and proof for one prompt.
struct QuoteState {
    prompt: PromptPayload,
    context: Vec<String>,
    invoice: String,
    amount_sats: u64,
    client_pubkey: Pubkey,
    created_at: Timestamp,
}

/// Expert-side protocol engine. Listens for asks and prompt/proof traffic,
/// quotes, verifies, replies. Spawn [`ExpertServer::run`] on its own task.
pub struct ExpertServer {
    keys: Keys,
    pool: Arc<RelayPool>,
    wallet: Arc<dyn Wallet>,
    engine: Arc<dyn ReplyEngine>,
    pricing: Arc<dyn Pricing>,
    rag: Option<RagContext>,
    config: ExpertConfig,
    sessions: Mutex<HashMap<String, QuoteState>>,
}

impl ExpertServer {
    pub fn new(
        keys: Keys,
        pool: Arc<RelayPool>,
        wallet: Arc<dyn Wallet>,
        engine: Arc<dyn ReplyEngine>,
        pricing: Arc<dyn Pricing>,
        rag: Option<RagContext>,
        config: ExpertConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            keys,
            pool,
            wallet,
            engine,
            pricing,
            rag,
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keys.public()
    }

    fn publish_timeout(&self) -> Duration {
        Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS)
    }

    /// Announce the profile, then serve asks, prompts and proofs until the
    /// task is cancelled.
    pub async fn run(self: Arc<Self>) -> Result<(), ParleyError> {
        self.publish_profile().await?;

        let ask_filter = Filter::new()
            .kinds(vec![KIND_ASK])
            .hashtags(self.config.hashtags.clone());
        let mut ask_sub = self
            .pool
            .subscribe(vec![ask_filter], &self.config.discovery_relays)
            .await?;

        let session_filter = Filter::new()
            .kinds(vec![KIND_PROMPT, KIND_PROOF])
            .pubkey_ref(&self.keys.public());
        let mut session_sub = self
            .pool
            .subscribe(vec![session_filter], &self.config.prompt_relays)
            .await?;

        info!(expert = %self.keys.public(), nickname = %self.config.nickname, "expert serving");

        loop {
            tokio::select! {
                item = ask_sub.next() => match item {
                    Some(SubscriptionItem::Event(event)) => {
                        if let Err(e) = self.handle_ask(&event).await {
                            debug!(error = %e, "ask handling failed");
                        }
                    }
                    Some(SubscriptionItem::Eose) => continue,
                    None => return Err(ParleyError::Disconnected("ask subscription ended".into())),
                },
                item = session_sub.next() => match item {
                    Some(SubscriptionItem::Event(event)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            let result = match event.kind {
                                KIND_PROMPT => server.handle_prompt(&event).await,
                                KIND_PROOF => server.handle_proof(&event).await,
                                other => Err(ParleyError::UnexpectedKind {
                                    kind: other,
                                    state: "serving",
                                }),
                            };
                            if let Err(e) = result {
                                debug!(error = %e, kind = event.kind, "session event failed");
                            }
                        });
                    }
                    Some(SubscriptionItem::Eose) => continue,
                    None => return Err(ParleyError::Disconnected("session subscription ended".into())),
                },
            }
        }
    }

    async fn publish_profile(&self) -> Result<(), ParleyError> {
        let profile = ExpertProfile {
            name: self.config.nickname.clone(),
            description: self.config.description.clone(),
            hashtags: self.config.hashtags.clone(),
            prompt_relays: self.config.prompt_relays.clone(),
        };
        let mut tags: Vec<Vec<String>> = self
            .config
            .hashtags
            .iter()
            .map(|t| vec!["t".to_string(), t.clone()])
            .collect();
        tags.push(vec!["name".into(), self.config.nickname.clone()]);

        let event = sign_event(
            &self.keys,
            UnsignedEvent::new(
                self.keys.public(),
                KIND_EXPERT_PROFILE,
                tags,
                serde_json::to_string(&profile)?,
            ),
        );
        self.pool
            .publish(&event, &self.config.discovery_relays, self.publish_timeout())
            .await?;
        Ok(())
    }

    // ── Bidding ──────────────────────────────────────────────────────────────

    /// Answer a matching ask with a two-layer bid: the inner payload signed
    /// with the real expert key, the envelope signed by a single-use key so
    /// the bid links to nothing else.
    async fn handle_ask(&self, ask: &Event) -> Result<(), ParleyError> {
        if ask.kind != KIND_ASK || !self.capabilities_match(ask) {
            return Ok(());
        }
        let ask_id = ask.id.to_hex();

        let payload = BidPayload {
            offer: self.config.offer.clone(),
            prompt_relays: self.config.prompt_relays.clone(),
            formats: self.config.formats.clone(),
            compressions: self.config.compressions.clone(),
            methods: self.config.methods.clone(),
        };
        let inner = sign_event(
            &self.keys,
            UnsignedEvent::new(
                self.keys.public(),
                KIND_BID_PAYLOAD,
                vec![vec!["e".into(), ask_id.clone()]],
                serde_json::to_string(&payload)?,
            ),
        );

        let envelope_keys = Keys::generate();
        let content = encrypt(&serde_json::to_vec(&inner)?, &ask.pubkey, &envelope_keys)?;
        let outer = sign_event(
            &envelope_keys,
            UnsignedEvent::new(
                envelope_keys.public(),
                KIND_BID,
                vec![
                    vec!["e".into(), ask_id.clone()],
                    vec!["p".into(), ask.pubkey.to_hex()],
                ],
                content,
            ),
        );

        self.pool
            .publish(&outer, &self.config.discovery_relays, self.publish_timeout())
            .await?;
        debug!(ask_id = %ask_id, bid_id = %outer.id, "bid published");
        Ok(())
    }

    /// Hashtag overlap is enforced by the subscription filter; formats and
    /// methods must also overlap when the ask constrains them.
    fn capabilities_match(&self, ask: &Event) -> bool {
        let overlap = |wanted: Vec<&str>, ours: &[String]| {
            wanted.is_empty() || wanted.iter().any(|w| ours.iter().any(|o| o == w))
        };
        overlap(ask.tag_values("format"), &self.config.formats)
            && overlap(ask.tag_values("method"), &self.config.methods)
            && overlap(ask.tag_values("compr"), &self.config.compressions)
    }

    // ── Quoting ──────────────────────────────────────────────────────────────

    async fn handle_prompt(&self, event: &Event) -> Result<(), ParleyError> {
        let prompt_id = event.id.to_hex();
        let client_pubkey = event.pubkey;

        let plain = decrypt(&event.content, &event.pubkey, &self.keys)?;
        let mut prompt: PromptPayload = serde_json::from_slice(&plain)
            .map_err(|e| ParleyError::Parse(format!("prompt payload: {e}")))?;

        // Large prompts arrive as a stream reference.
        if let Some(meta) = prompt.stream.take() {
            let mut reader =
                StreamReader::open(&self.pool, &meta, ReaderLimits::default()).await?;
            let bytes = reader.read_to_end().await?;
            prompt = serde_json::from_slice(&bytes)
                .map_err(|e| ParleyError::Parse(format!("streamed prompt: {e}")))?;
        }

        if !self.config.formats.contains(&prompt.format) {
            let quote = QuotePayload {
                invoices: vec![],
                reason: None,
                error: Some(format!("unsupported format {}", prompt.format)),
            };
            return self.send_quote(&prompt_id, &client_pubkey, &quote).await;
        }

        let question = prompt
            .content
            .as_ref()
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let context = match &self.rag {
            Some(rag) => rag.context_for(&question).await?,
            None => Vec::new(),
        };
        if let Some(rag) = &self.rag {
            if rag.require_context && context.is_empty() {
                let quote = QuotePayload {
                    invoices: vec![],
                    reason: Some("no_knowledge".into()),
                    error: None,
                };
                return self.send_quote(&prompt_id, &client_pubkey, &quote).await;
            }
        }

        let context_chars = context.iter().map(String::len).sum();
        let amount_sats = self.pricing.price_sats(question.len(), context_chars);
        let bolt11 = self.wallet.make_invoice(amount_sats, "parley answer").await?;

        {
            let mut sessions = self.sessions.lock().expect("session mutex poisoned");
            let now = now_unix();
            let ttl = self.config.quote_ttl.as_secs() as i64;
            sessions.retain(|_, s| now - s.created_at < ttl);
            sessions.insert(
                prompt_id.clone(),
                QuoteState {
                    prompt,
                    context,
                    invoice: bolt11.clone(),
                    amount_sats,
                    client_pubkey,
                    created_at: now,
                },
            );
        }

        let quote = QuotePayload {
            invoices: vec![Invoice {
                method: "lightning".into(),
                unit: "sat".into(),
                amount: amount_sats,
                invoice: bolt11,
            }],
            reason: None,
            error: None,
        };
        debug!(prompt_id = %prompt_id, amount_sats, "quote sent");
        self.send_quote(&prompt_id, &client_pubkey, &quote).await
    }

    async fn send_quote(
        &self,
        prompt_id: &str,
        client: &Pubkey,
        quote: &QuotePayload,
    ) -> Result<(), ParleyError> {
        let content = encrypt(&serde_json::to_vec(quote)?, client, &self.keys)?;
        let event = sign_event(
            &self.keys,
            UnsignedEvent::new(
                self.keys.public(),
                KIND_QUOTE,
                vec![
                    vec!["e".into(), prompt_id.to_string()],
                    vec!["p".into(), client.to_hex()],
                ],
                content,
            ),
        );
        self.pool
            .publish(&event, &self.config.prompt_relays, self.publish_timeout())
            .await?;
        Ok(())
    }

    // ── Proof and reply ──────────────────────────────────────────────────────

    async fn handle_proof(&self, event: &Event) -> Result<(), ParleyError> {
        let prompt_id = event
            .tag_value("e")
            .ok_or_else(|| ParleyError::Parse("proof missing e tag".into()))?
            .to_string();

        let state = {
            let mut sessions = self.sessions.lock().expect("session mutex poisoned");
            sessions.remove(&prompt_id)
        }
        .ok_or_else(|| ParleyError::UnknownReference(prompt_id.clone()))?;

        // Only the session counterparty can settle the quote.
        if event.pubkey != state.client_pubkey {
            return Err(ParleyError::ProofInvalid);
        }

        let plain = decrypt(&event.content, &event.pubkey, &self.keys)?;
        let proof: ProofPayload = serde_json::from_slice(&plain)
            .map_err(|e| ParleyError::Parse(format!("proof payload: {e}")))?;

        let valid = proof.method == "lightning"
            && verify_proof(&state.invoice, &proof.preimage).unwrap_or(false);
        if !valid {
            warn!(prompt_id = %prompt_id, "payment proof rejected");
            let payload = ReplyPayload {
                content: String::new(),
                error: Some("invalid payment proof".into()),
                code: Some("proof-invalid".into()),
                stream: None,
            };
            return self.send_reply(&prompt_id, &state.client_pubkey, &payload, true).await;
        }

        info!(prompt_id = %prompt_id, amount_sats = state.amount_sats, "payment verified");
        match self.engine.reply(&state.prompt, &state.context).await {
            Ok(answer) => self.deliver_answer(&prompt_id, &state, answer).await,
            Err(e) => {
                warn!(prompt_id = %prompt_id, error = %e, "reply generation failed");
                let payload = ReplyPayload {
                    content: String::new(),
                    error: Some(e.to_string()),
                    code: Some("reply-failed".into()),
                    stream: None,
                };
                self.send_reply(&prompt_id, &state.client_pubkey, &payload, true).await
            }
        }
    }

    async fn deliver_answer(
        &self,
        prompt_id: &str,
        state: &QuoteState,
        answer: String,
    ) -> Result<(), ParleyError> {
        if answer.len() <= self.config.stream_threshold {
            let payload = ReplyPayload {
                content: answer,
                error: None,
                code: None,
                stream: None,
            };
            return self.send_reply(prompt_id, &state.client_pubkey, &payload, true).await;
        }

        // Streamed delivery: the reply event carries only the metadata, the
        // answer rides the chunk stream.
        let (mut writer, meta) = StreamWriter::new(
            self.pool.clone(),
            WriterConfig::new(self.config.prompt_relays.clone()),
        );
        let payload = ReplyPayload {
            content: String::new(),
            error: None,
            code: None,
            stream: Some(meta),
        };
        self.send_reply(prompt_id, &state.client_pubkey, &payload, true).await?;
        writer.write(answer.as_bytes(), true).await
    }

    async fn send_reply(
        &self,
        prompt_id: &str,
        client: &Pubkey,
        payload: &ReplyPayload,
        done: bool,
    ) -> Result<(), ParleyError> {
        let content = encrypt(&serde_json::to_vec(payload)?, client, &self.keys)?;
        let mut tags = vec![
            vec!["e".to_string(), prompt_id.to_string()],
            vec!["p".to_string(), client.to_hex()],
        ];
        if done {
            tags.push(vec!["done".to_string()]);
        }
        let event = sign_event(
            &self.keys,
            UnsignedEvent::new(self.keys.public(), KIND_REPLY, tags, content),
        );
        self.pool
            .publish(&event, &self.config.prompt_relays, self.publish_timeout())
            .await?;
        Ok(())
    }
}
