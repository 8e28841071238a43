use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use parley_core::constants::{
    DEFAULT_DISCOVERY_TIMEOUT_SECS, DEFAULT_PUBLISH_TIMEOUT_SECS, DEFAULT_QUOTE_TIMEOUT_SECS,
    DEFAULT_REPLY_TIMEOUT_SECS, ENCRYPTED_CHUNK_BUDGET, KIND_ASK, KIND_BID, KIND_BID_PAYLOAD,
    KIND_PROMPT, KIND_PROOF, KIND_QUOTE, KIND_REPLY,
};
use parley_core::error::ParleyError;
use parley_core::event::{Event, UnsignedEvent};
use parley_core::filter::Filter;
use parley_core::payload::{
    BidPayload, Invoice, PromptPayload, ProofPayload, QuotePayload, ReplyPayload,
};
use parley_core::types::{now_unix, Pubkey};
use parley_crypto::{decrypt, encrypt, sign_event, verify_event, Keys};
use parley_payments::PaymentClient;
use parley_relay::{RelayPool, SubscriptionItem};
use parley_stream::{ReaderLimits, StreamReader, StreamWriter, WriterConfig};

use crate::registry::{Bid, BidRegistry};
use crate::select::{dedupe_experts, select_all, BidSelector};

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub discovery_relays: Vec<String>,
    pub discovery_timeout: Duration,
    pub quote_timeout: Duration,
    pub reply_timeout: Duration,
    pub publish_timeout: Duration,
}

impl ClientConfig {
    pub fn new(discovery_relays: Vec<String>) -> Self {
        Self {
            discovery_relays,
            discovery_timeout: Duration::from_secs(DEFAULT_DISCOVERY_TIMEOUT_SECS),
            quote_timeout: Duration::from_secs(DEFAULT_QUOTE_TIMEOUT_SECS),
            reply_timeout: Duration::from_secs(DEFAULT_REPLY_TIMEOUT_SECS),
            publish_timeout: Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS),
        }
    }
}

/// Parameters of one public ask.
#[derive(Debug, Clone)]
pub struct AskParams {
    /// Short anonymized summary; this is public.
    pub summary: String,
    pub hashtags: Vec<String>,
    pub formats: Vec<String>,
    pub compressions: Vec<String>,
    pub methods: Vec<String>,
}

impl AskParams {
    pub fn new(summary: &str, hashtags: Vec<String>) -> Self {
        Self {
            summary: summary.to_string(),
            hashtags,
            formats: vec!["text".into()],
            compressions: vec!["none".into(), "gzip".into()],
            methods: vec!["lightning".into()],
        }
    }
}

/// Quote approval hook; `false` ends the session without charge.
pub type QuoteDecision = Arc<dyn Fn(&QuotePayload) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct AskExpertOptions {
    pub question: String,
    pub format: String,
    pub max_amount_sats: u64,
    pub on_quote: Option<QuoteDecision>,
}

impl AskExpertOptions {
    pub fn new(question: &str, max_amount_sats: u64) -> Self {
        Self {
            question: question.to_string(),
            format: "text".into(),
            max_amount_sats,
            on_quote: None,
        }
    }
}

/// A paid, completed answer.
#[derive(Debug, Clone)]
pub struct ExpertReply {
    pub expert_pubkey: Pubkey,
    pub content: String,
    pub amount_sats: u64,
}

/// Terminal state of one client↔expert session that ended without an engine
/// error.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Answered(ExpertReply),
    /// The expert declined (e.g. `no_knowledge`) or the caller rejected the
    /// quote. No charge.
    Declined { reason: Option<String> },
}

/// Per-expert result of an aggregate ask. Sub-sessions are independent; one
/// failure never cancels the others.
#[derive(Debug)]
pub struct ExpertResult {
    pub expert_pubkey: Pubkey,
    pub outcome: Result<SessionOutcome, ParleyError>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Client-side protocol engine.
pub struct AskClient {
    pool: Arc<RelayPool>,
    payments: Arc<PaymentClient>,
    registry: BidRegistry,
    /// Single-shot guard: at most one proof per prompt id ever leaves this
    /// process.
    proofs_sent: Mutex<HashSet<String>>,
    config: ClientConfig,
}

impl AskClient {
    pub fn new(pool: Arc<RelayPool>, payments: Arc<PaymentClient>, config: ClientConfig) -> Self {
        Self {
            pool,
            payments,
            registry: BidRegistry::new(),
            proofs_sent: Mutex::new(HashSet::new()),
            config,
        }
    }

    pub fn registry(&self) -> &BidRegistry {
        &self.registry
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    /// Publish an ask under a fresh session key and collect bids for the
    /// discovery window. Bids are returned in arrival order, deduplicated by
    /// bid id, and recorded in the registry for later prompting.
    pub async fn find_experts(&self, params: &AskParams) -> Result<Vec<Bid>, ParleyError> {
        let session = Keys::generate();

        let mut tags: Vec<Vec<String>> = Vec::new();
        for t in &params.hashtags {
            tags.push(vec!["t".into(), t.clone()]);
        }
        for f in &params.formats {
            tags.push(vec!["format".into(), f.clone()]);
        }
        for c in &params.compressions {
            tags.push(vec!["compr".into(), c.clone()]);
        }
        for m in &params.methods {
            tags.push(vec!["method".into(), m.clone()]);
        }

        let ask = sign_event(
            &session,
            UnsignedEvent::new(session.public(), KIND_ASK, tags, params.summary.clone()),
        );
        let ask_id = ask.id.to_hex();

        // Subscribe before publishing so no bid can slip past.
        let filter = Filter::new().kinds(vec![KIND_BID]).event_ref(&ask_id);
        let mut sub = self
            .pool
            .subscribe(vec![filter], &self.config.discovery_relays)
            .await?;
        self.pool
            .publish(&ask, &self.config.discovery_relays, self.config.publish_timeout)
            .await?;
        info!(ask_id = %ask_id, hashtags = ?params.hashtags, "ask published");

        let deadline = tokio::time::Instant::now() + self.config.discovery_timeout;
        let mut bids: Vec<Bid> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            let item = tokio::select! {
                item = sub.next() => item,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            match item {
                Some(SubscriptionItem::Event(event)) => {
                    if let Some(bid) = self.decode_bid(&event, &session, &ask_id) {
                        if seen.insert(bid.bid_id.clone()) {
                            debug!(bid_id = %bid.bid_id, expert = %bid.expert_pubkey, "bid received");
                            self.registry.insert(bid.clone(), session.clone(), now_unix());
                            bids.push(bid);
                        }
                    }
                }
                Some(SubscriptionItem::Eose) => continue,
                None => break,
            }
        }
        sub.close().await;
        Ok(bids)
    }

    /// Unwrap a two-layer bid: decrypt the envelope with the ask session
    /// keys, verify the inner expert-signed payload, check it references our
    /// ask. Anything malformed is dropped.
    fn decode_bid(&self, outer: &Event, session: &Keys, ask_id: &str) -> Option<Bid> {
        if outer.kind != KIND_BID {
            return None;
        }
        let plain = match decrypt(&outer.content, &outer.pubkey, session) {
            Ok(plain) => plain,
            Err(e) => {
                debug!(error = %e, "bid envelope undecryptable");
                return None;
            }
        };
        let inner: Event = match serde_json::from_slice(&plain) {
            Ok(inner) => inner,
            Err(e) => {
                debug!(error = %e, "bid payload unparseable");
                return None;
            }
        };
        if let Err(e) = verify_event(&inner) {
            debug!(error = %e, "bid payload failed verification");
            return None;
        }
        if inner.kind != KIND_BID_PAYLOAD || inner.tag_value("e") != Some(ask_id) {
            return None;
        }
        let payload: BidPayload = serde_json::from_str(&inner.content).ok()?;

        Some(Bid {
            bid_id: outer.id.to_hex(),
            payload_id: inner.id.to_hex(),
            expert_pubkey: inner.pubkey,
            offer: payload.offer,
            prompt_relays: payload.prompt_relays,
            formats: payload.formats,
            compressions: payload.compressions,
            methods: payload.methods,
            created_at: outer.created_at,
        })
    }

    // ── Single-expert session ────────────────────────────────────────────────

    /// Run Prompt→Quote→Pay→Proof→Reply against one previously collected
    /// bid.
    pub async fn ask_expert(
        &self,
        bid_id: &str,
        options: &AskExpertOptions,
    ) -> Result<SessionOutcome, ParleyError> {
        let (bid, session) = self
            .registry
            .get(bid_id, now_unix())
            .ok_or_else(|| ParleyError::UnknownReference(bid_id.to_string()))?;

        let relays = if bid.prompt_relays.is_empty() {
            self.config.discovery_relays.clone()
        } else {
            bid.prompt_relays.clone()
        };

        // ── Prompting ────────────────────────────────────────────────────────
        let inline = PromptPayload {
            format: options.format.clone(),
            content: Some(serde_json::Value::String(options.question.clone())),
            stream: None,
        };
        let inline_bytes = serde_json::to_vec(&inline)?;
        let payload = if inline_bytes.len() > ENCRYPTED_CHUNK_BUDGET {
            // Too big for one envelope: ship the body over a stream and put
            // only the metadata in the prompt.
            let (mut writer, meta) =
                StreamWriter::new(self.pool.clone(), WriterConfig::new(relays.clone()));
            writer.write(&inline_bytes, true).await?;
            PromptPayload { format: options.format.clone(), content: None, stream: Some(meta) }
        } else {
            inline
        };

        let content = encrypt(&serde_json::to_vec(&payload)?, &bid.expert_pubkey, &session)?;
        let prompt = sign_event(
            &session,
            UnsignedEvent::new(
                session.public(),
                KIND_PROMPT,
                vec![
                    vec!["e".into(), bid.bid_id.clone()],
                    vec!["p".into(), bid.expert_pubkey.to_hex()],
                    vec!["format".into(), options.format.clone()],
                ],
                content,
            ),
        );
        let prompt_id = prompt.id.to_hex();

        let quote_filter = Filter::new().kinds(vec![KIND_QUOTE]).event_ref(&prompt_id);
        let mut quote_sub = self.pool.subscribe(vec![quote_filter], &relays).await?;
        self.pool.publish(&prompt, &relays, self.config.publish_timeout).await?;
        debug!(prompt_id = %prompt_id, expert = %bid.expert_pubkey, "prompt sent");

        // ── Quoting ──────────────────────────────────────────────────────────
        let quote = self.wait_for_quote(&mut quote_sub, &bid, &session).await;
        quote_sub.close().await;
        let quote = quote?;

        if let Some(reason) = quote.reason.clone() {
            info!(expert = %bid.expert_pubkey, %reason, "expert declined");
            return Ok(SessionOutcome::Declined { reason: Some(reason) });
        }
        if let Some(error) = quote.error {
            return Err(ParleyError::CapabilityMismatch(error));
        }

        let invoice = choose_invoice(&quote.invoices)
            .ok_or_else(|| ParleyError::Parse("quote carries no invoices".into()))?
            .clone();
        if invoice.amount > options.max_amount_sats {
            return Err(ParleyError::AmountOverCap {
                amount: invoice.amount,
                cap: options.max_amount_sats,
            });
        }
        if let Some(on_quote) = &options.on_quote {
            if !on_quote(&quote) {
                return Ok(SessionOutcome::Declined { reason: None });
            }
        }

        // ── Paying ───────────────────────────────────────────────────────────
        let preimage = self.payments.pay(&invoice.invoice, options.max_amount_sats).await?;

        // ── Proving ──────────────────────────────────────────────────────────
        {
            let mut sent = self.proofs_sent.lock().expect("proof guard mutex poisoned");
            if !sent.insert(prompt_id.clone()) {
                return Err(ParleyError::Internal(format!(
                    "second proof attempted for prompt {prompt_id}"
                )));
            }
        }
        let proof_payload = ProofPayload { method: invoice.method.clone(), preimage };
        let content = encrypt(&serde_json::to_vec(&proof_payload)?, &bid.expert_pubkey, &session)?;
        let proof = sign_event(
            &session,
            UnsignedEvent::new(
                session.public(),
                KIND_PROOF,
                vec![
                    vec!["e".into(), prompt_id.clone()],
                    vec!["p".into(), bid.expert_pubkey.to_hex()],
                ],
                content,
            ),
        );

        let reply_filter = Filter::new().kinds(vec![KIND_REPLY]).event_ref(&prompt_id);
        let mut reply_sub = self.pool.subscribe(vec![reply_filter], &relays).await?;
        self.pool.publish(&proof, &relays, self.config.publish_timeout).await?;
        debug!(prompt_id = %prompt_id, "proof sent");

        // ── Receiving ────────────────────────────────────────────────────────
        let content = self.collect_reply(&mut reply_sub, &bid, &session).await;
        reply_sub.close().await;
        let content = content?;

        Ok(SessionOutcome::Answered(ExpertReply {
            expert_pubkey: bid.expert_pubkey,
            content,
            amount_sats: invoice.amount,
        }))
    }

    async fn wait_for_quote(
        &self,
        sub: &mut parley_relay::Subscription,
        bid: &Bid,
        session: &Keys,
    ) -> Result<QuotePayload, ParleyError> {
        loop {
            let item = tokio::time::timeout(self.config.quote_timeout, sub.next())
                .await
                .map_err(|_| ParleyError::NoQuote)?;
            match item {
                Some(SubscriptionItem::Event(event)) => {
                    if event.pubkey != bid.expert_pubkey {
                        continue;
                    }
                    let plain = match decrypt(&event.content, &event.pubkey, session) {
                        Ok(plain) => plain,
                        Err(e) => {
                            debug!(error = %e, "quote undecryptable");
                            continue;
                        }
                    };
                    return serde_json::from_slice(&plain)
                        .map_err(|e| ParleyError::Parse(format!("quote payload: {e}")));
                }
                Some(SubscriptionItem::Eose) => continue,
                None => return Err(ParleyError::NoQuote),
            }
        }
    }

    /// Accumulate reply content until the `done` marker. Streamed replies
    /// hand off to the stream reader; silence past the reply timeout is the
    /// stream-ttl terminal.
    async fn collect_reply(
        &self,
        sub: &mut parley_relay::Subscription,
        bid: &Bid,
        session: &Keys,
    ) -> Result<String, ParleyError> {
        let mut content = String::new();
        loop {
            let item = tokio::time::timeout(self.config.reply_timeout, sub.next())
                .await
                .map_err(|_| ParleyError::TtlExceeded)?;
            let event = match item {
                Some(SubscriptionItem::Event(event)) => event,
                Some(SubscriptionItem::Eose) => continue,
                None => return Err(ParleyError::Disconnected("reply subscription ended".into())),
            };
            if event.pubkey != bid.expert_pubkey {
                continue;
            }

            let plain = match decrypt(&event.content, &event.pubkey, session) {
                Ok(plain) => plain,
                Err(e) => {
                    debug!(error = %e, "reply undecryptable");
                    continue;
                }
            };
            let payload: ReplyPayload = serde_json::from_slice(&plain)
                .map_err(|e| ParleyError::Parse(format!("reply payload: {e}")))?;

            if let Some(error) = payload.error {
                return match payload.code.as_deref() {
                    Some("proof-invalid") => Err(ParleyError::ProofInvalid),
                    code => Err(ParleyError::StreamRemote {
                        code: code.unwrap_or("error").to_string(),
                        message: error,
                    }),
                };
            }

            if let Some(meta) = payload.stream {
                let mut reader = StreamReader::open(
                    &self.pool,
                    &meta,
                    ReaderLimits { ttl: self.config.reply_timeout, ..Default::default() },
                )
                .await?;
                let bytes = reader.read_to_end().await?;
                content.push_str(&String::from_utf8_lossy(&bytes));
                return Ok(content);
            }

            content.push_str(&payload.content);
            if event.has_tag("done") {
                return Ok(content);
            }
        }
    }

    // ── Aggregate ask ────────────────────────────────────────────────────────

    /// Discovery plus one parallel sub-session per selected expert. Returns
    /// one result per expert; failures stay local to their session.
    pub async fn ask(
        self: &Arc<Self>,
        params: &AskParams,
        selector: Option<BidSelector>,
        options: &AskExpertOptions,
    ) -> Result<Vec<ExpertResult>, ParleyError> {
        let bids = self.find_experts(params).await?;
        if bids.is_empty() {
            return Err(ParleyError::NoBids);
        }

        let selector = selector.unwrap_or_else(select_all);
        let selected = dedupe_experts(selector(&bids));
        if selected.is_empty() {
            return Err(ParleyError::NoBids);
        }

        let mut join = JoinSet::new();
        for bid in selected {
            let client = Arc::clone(self);
            let options = options.clone();
            join.spawn(async move {
                let outcome = client.ask_expert(&bid.bid_id, &options).await;
                ExpertResult { expert_pubkey: bid.expert_pubkey, outcome }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "expert sub-session panicked"),
            }
        }
        Ok(results)
    }
}

/// Pick the invoice to pay: `lightning` first, then array order.
fn choose_invoice(invoices: &[Invoice]) -> Option<&Invoice> {
    invoices
        .iter()
        .find(|inv| inv.method == "lightning")
        .or_else(|| invoices.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(method: &str, amount: u64) -> Invoice {
        Invoice {
            method: method.to_string(),
            unit: "sat".into(),
            amount,
            invoice: format!("ln-{method}-{amount}"),
        }
    }

    #[test]
    fn choose_invoice_prefers_lightning_then_first() {
        let invoices = vec![invoice("cashu", 5), invoice("lightning", 10)];
        assert_eq!(choose_invoice(&invoices).unwrap().method, "lightning");

        let invoices = vec![invoice("cashu", 5), invoice("fedimint", 7)];
        assert_eq!(choose_invoice(&invoices).unwrap().method, "cashu");

        assert!(choose_invoice(&[]).is_none());
    }

    #[test]
    fn ask_params_default_capabilities() {
        let params = AskParams::new("capital of france?", vec!["geography".into()]);
        assert_eq!(params.formats, vec!["text"]);
        assert!(params.methods.contains(&"lightning".to_string()));
    }
}
