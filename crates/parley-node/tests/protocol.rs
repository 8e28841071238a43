//! End-to-end protocol tests: a real expert and a real client talking
//! through an in-process relay, with a shared mock wallet standing in for
//! the Lightning network.
//!
//! Run with:
//!   cargo test -p parley-node --test protocol

use std::sync::Arc;
use std::time::Duration;

use parley_client::{select_first, AskClient, AskExpertOptions, AskParams, ClientConfig, SessionOutcome};
use parley_core::error::ParleyError;
use parley_expert::testing::{CannedEngine, HashEmbedder};
use parley_expert::{ExpertConfig, ExpertServer, MarginPricing, RagContext};
use parley_payments::testing::MockWallet;
use parley_payments::PaymentClient;
use parley_rag::RagStore;
use parley_relay::testing::LocalRelay;
use parley_relay::RelayPool;

// ── Harness ───────────────────────────────────────────────────────────────────

struct Market {
    relay: LocalRelay,
    relays: Vec<String>,
    wallet: Arc<MockWallet>,
}

impl Market {
    async fn start() -> Self {
        let relay = LocalRelay::start().await.unwrap();
        let relays = vec![relay.url()];
        Self { relay, relays, wallet: Arc::new(MockWallet::new()) }
    }

    /// Spawn an expert answering `answer` for a flat `price`.
    async fn spawn_expert(&self, hashtags: &[&str], answer: &str, price: u64) -> Arc<ExpertServer> {
        self.spawn_expert_with(hashtags, answer, price, |_| {}).await
    }

    async fn spawn_expert_with<F>(
        &self,
        hashtags: &[&str],
        answer: &str,
        price: u64,
        tweak: F,
    ) -> Arc<ExpertServer>
    where
        F: FnOnce(&mut ExpertConfig),
    {
        let keys = parley_crypto::Keys::generate();
        let pool = Arc::new(RelayPool::new());
        let mut config = ExpertConfig::new(
            "test-expert",
            hashtags.iter().map(|s| s.to_string()).collect(),
            self.relays.clone(),
        );
        tweak(&mut config);

        let server = ExpertServer::new(
            keys,
            pool,
            self.wallet.clone(),
            Arc::new(CannedEngine::new(answer)),
            Arc::new(MarginPricing::flat(price)),
            None,
            config,
        );
        tokio::spawn(Arc::clone(&server).run());
        // Give the subscriptions a moment to land.
        tokio::time::sleep(Duration::from_millis(300)).await;
        server
    }

    fn client(&self) -> Arc<AskClient> {
        let pool = Arc::new(RelayPool::new());
        let payments = Arc::new(PaymentClient::new(self.wallet.clone()));
        let mut config = ClientConfig::new(self.relays.clone());
        config.discovery_timeout = Duration::from_secs(2);
        config.quote_timeout = Duration::from_secs(5);
        config.reply_timeout = Duration::from_secs(10);
        Arc::new(AskClient::new(pool, payments, config))
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

/// Discovery: one listening expert produces exactly one bid.
#[tokio::test]
async fn discovery_returns_the_single_bid() {
    let market = Market::start().await;
    let _expert = market.spawn_expert(&["geography"], "Paris", 10).await;

    let client = market.client();
    let bids = client
        .find_experts(&AskParams::new(
            "capital of france?",
            vec!["geography".into(), "test".into()],
        ))
        .await
        .unwrap();

    assert_eq!(bids.len(), 1);
    assert_eq!(bids[0].offer, "I can answer");
    market.relay.stop();
}

/// The happy path: ask, quote for 10 sats, accept, pay, prove, receive.
#[tokio::test]
async fn ask_expert_happy_path() {
    let market = Market::start().await;
    let expert = market.spawn_expert(&["geography"], "Paris", 10).await;

    let client = market.client();
    let bids = client
        .find_experts(&AskParams::new("capital of france?", vec!["geography".into()]))
        .await
        .unwrap();
    assert_eq!(bids.len(), 1);

    let outcome = client
        .ask_expert(
            &bids[0].bid_id,
            &AskExpertOptions::new("What is the capital of France?", 100),
        )
        .await
        .unwrap();

    match outcome {
        SessionOutcome::Answered(reply) => {
            assert_eq!(reply.expert_pubkey, expert.pubkey());
            assert_eq!(reply.content, "Paris");
            assert_eq!(reply.amount_sats, 10);
        }
        other => panic!("expected an answer, got {other:?}"),
    }
    assert_eq!(market.wallet.payments_made(), 1);
    market.relay.stop();
}

/// A quote above the spending cap terminates without payment or proof.
#[tokio::test]
async fn quote_over_cap_is_rejected_before_payment() {
    let market = Market::start().await;
    let _expert = market.spawn_expert(&["geography"], "Paris", 10).await;

    let client = market.client();
    let bids = client
        .find_experts(&AskParams::new("capital of france?", vec!["geography".into()]))
        .await
        .unwrap();

    let err = client
        .ask_expert(
            &bids[0].bid_id,
            &AskExpertOptions::new("What is the capital of France?", 5),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "payment");
    assert_eq!(err.code(), "amount-over-cap");
    assert_eq!(market.wallet.payments_made(), 0, "no payment may have happened");
    market.relay.stop();
}

/// Long answers arrive over the chunk stream and reassemble exactly.
#[tokio::test]
async fn streamed_reply_reassembles() {
    let market = Market::start().await;
    let long_answer = "Hello, world! ".repeat(50);
    let answer = long_answer.clone();
    let _expert = market
        .spawn_expert_with(&["streams"], &answer, 10, |config| {
            // Force streaming regardless of answer size.
            config.stream_threshold = 1;
        })
        .await;

    let client = market.client();
    let bids = client
        .find_experts(&AskParams::new("tell me a story", vec!["streams".into()]))
        .await
        .unwrap();

    let outcome = client
        .ask_expert(&bids[0].bid_id, &AskExpertOptions::new("go on then", 100))
        .await
        .unwrap();

    match outcome {
        SessionOutcome::Answered(reply) => assert_eq!(reply.content, long_answer),
        other => panic!("expected an answer, got {other:?}"),
    }
    market.relay.stop();
}

/// Zero bids by the deadline is the `no-bids` terminal for the aggregate
/// ask.
#[tokio::test]
async fn no_bids_is_terminal() {
    let market = Market::start().await;
    let client = market.client();

    let err = client
        .ask(
            &AskParams::new("anyone?", vec!["nobody-listens-here".into()]),
            None,
            &AskExpertOptions::new("hello?", 10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ParleyError::NoBids));
    market.relay.stop();
}

/// Two experts answer independently; one aggregate ask returns both.
#[tokio::test]
async fn aggregate_ask_runs_sub_sessions_independently() {
    let market = Market::start().await;
    let _alpha = market.spawn_expert(&["geography"], "Paris", 10).await;
    let _beta = market.spawn_expert(&["geography"], "It is Paris.", 20).await;

    let client = market.client();
    let results = client
        .ask(
            &AskParams::new("capital of france?", vec!["geography".into()]),
            None,
            &AskExpertOptions::new("What is the capital of France?", 100),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    let mut answers = Vec::new();
    for result in results {
        match result.outcome.unwrap() {
            SessionOutcome::Answered(reply) => answers.push(reply.content),
            other => panic!("expected answers, got {other:?}"),
        }
    }
    answers.sort();
    assert_eq!(answers, vec!["It is Paris.", "Paris"]);
    assert_eq!(market.wallet.payments_made(), 2);
    market.relay.stop();
}

/// A selector can narrow the field; duplicate experts are never prompted
/// twice.
#[tokio::test]
async fn selector_limits_prompted_experts() {
    let market = Market::start().await;
    let _alpha = market.spawn_expert(&["geography"], "Paris", 10).await;
    let _beta = market.spawn_expert(&["geography"], "Paris again", 10).await;

    let client = market.client();
    let results = client
        .ask(
            &AskParams::new("capital of france?", vec!["geography".into()]),
            Some(select_first(1)),
            &AskExpertOptions::new("What is the capital of France?", 100),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(market.wallet.payments_made(), 1);
    market.relay.stop();
}

/// An expert that requires context but has none declines with
/// `no_knowledge`; the client is never charged.
#[tokio::test]
async fn empty_rag_declines_with_no_knowledge() {
    let market = Market::start().await;

    let keys = parley_crypto::Keys::generate();
    let pool = Arc::new(RelayPool::new());
    let config = ExpertConfig::new("kb-expert", vec!["geography".into()], market.relays.clone());
    let mut rag = RagContext::new(
        RagStore::temporary().unwrap(),
        "kb",
        Arc::new(HashEmbedder::new(4)),
    );
    rag.require_context = true;

    let server = ExpertServer::new(
        keys,
        pool,
        market.wallet.clone(),
        Arc::new(CannedEngine::new("never used")),
        Arc::new(MarginPricing::flat(10)),
        Some(rag),
        config,
    );
    tokio::spawn(Arc::clone(&server).run());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let client = market.client();
    let bids = client
        .find_experts(&AskParams::new("capital of france?", vec!["geography".into()]))
        .await
        .unwrap();

    let outcome = client
        .ask_expert(&bids[0].bid_id, &AskExpertOptions::new("what is the capital?", 100))
        .await
        .unwrap();
    match outcome {
        SessionOutcome::Declined { reason } => {
            assert_eq!(reason.as_deref(), Some("no_knowledge"));
        }
        other => panic!("expected a decline, got {other:?}"),
    }
    assert_eq!(market.wallet.payments_made(), 0);
    market.relay.stop();
}

/// The caller's quote hook can reject; the session ends without charge.
#[tokio::test]
async fn quote_callback_rejection_ends_without_charge() {
    let market = Market::start().await;
    let _expert = market.spawn_expert(&["geography"], "Paris", 10).await;

    let client = market.client();
    let bids = client
        .find_experts(&AskParams::new("capital of france?", vec!["geography".into()]))
        .await
        .unwrap();

    let mut options = AskExpertOptions::new("What is the capital of France?", 100);
    options.on_quote = Some(Arc::new(|_quote| false));
    let outcome = client.ask_expert(&bids[0].bid_id, &options).await.unwrap();

    assert!(matches!(outcome, SessionOutcome::Declined { reason: None }));
    assert_eq!(market.wallet.payments_made(), 0);
    market.relay.stop();
}
