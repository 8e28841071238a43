use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_core::constants::PUBLISH_RETRY_MAX;
use parley_core::error::ParleyError;
use parley_core::event::Event;
use parley_core::filter::Filter;
use parley_core::types::EventId;

use crate::connection::{Incoming, RelayConnection};

/// How long to wait for stragglers before synthesizing the end-of-stored
/// -events marker when a relay never reports it.
const EOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Item delivered by [`Subscription::next`].
#[derive(Debug, Clone)]
pub enum SubscriptionItem {
    Event(Event),
    /// All relays finished replaying stored events; live events follow.
    Eose,
}

/// A live subscription across one or more relays, deduplicated by event id.
pub struct Subscription {
    sub_id: String,
    rx: mpsc::Receiver<SubscriptionItem>,
    conns: Vec<Arc<RelayConnection>>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.sub_id
    }

    /// Next item, or `None` once the subscription is closed everywhere.
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        self.rx.recv().await
    }

    /// Close on every relay.
    pub async fn close(self) {
        for conn in &self.conns {
            conn.unsubscribe(&self.sub_id).await;
        }
    }
}

/// Process-wide pool of relay connections. Connections are created on first
/// use and kept for reuse; reconnection is handled inside each connection
/// actor.
#[derive(Default)]
pub struct RelayPool {
    connections: Mutex<HashMap<String, Arc<RelayConnection>>>,
}

impl RelayPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent connect: returns the existing connection for `uri` or
    /// spawns a new one.
    pub async fn ensure(&self, uri: &str) -> Arc<RelayConnection> {
        let mut conns = self.connections.lock().await;
        conns
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(RelayConnection::connect(uri)))
            .clone()
    }

    /// Publish `event` to `relays`, waiting up to `timeout` for acks.
    /// Returns the relays that accepted. Partial failure is fine; total
    /// failure is retried with jitter and then reported.
    pub async fn publish(
        &self,
        event: &Event,
        relays: &[String],
        timeout: Duration,
    ) -> Result<Vec<String>, ParleyError> {
        if relays.is_empty() {
            return Err(ParleyError::PublishNoRelay);
        }

        let mut conns = Vec::with_capacity(relays.len());
        for uri in relays {
            conns.push(self.ensure(uri).await);
        }

        for attempt in 1..=PUBLISH_RETRY_MAX {
            let sends = conns.iter().map(|conn| {
                let event = event.clone();
                async move { (conn.uri().to_string(), conn.publish(event, timeout).await) }
            });
            let results = futures::future::join_all(sends).await;

            let mut accepted = Vec::new();
            for (uri, result) in results {
                match result {
                    Ok(true) => accepted.push(uri),
                    Ok(false) => debug!(relay = %uri, "relay rejected event"),
                    Err(e) => debug!(relay = %uri, error = %e, "publish failed"),
                }
            }
            if !accepted.is_empty() {
                return Ok(accepted);
            }

            if attempt < PUBLISH_RETRY_MAX {
                let jitter = rand::thread_rng().gen_range(100..600);
                warn!(attempt, "publish accepted nowhere; retrying");
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
        }
        Err(ParleyError::PublishNoRelay)
    }

    /// Subscribe to the union of `filters` on every relay in `relays`.
    /// Cross-relay duplicates are suppressed before delivery.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        relays: &[String],
    ) -> Result<Subscription, ParleyError> {
        if relays.is_empty() {
            return Err(ParleyError::Connect("no relays given".into()));
        }

        let sub_id = format!("parley-{}", Uuid::new_v4().simple());
        let mut conns = Vec::with_capacity(relays.len());
        let mut tagged = Vec::with_capacity(relays.len());

        for (idx, uri) in relays.iter().enumerate() {
            let conn = self.ensure(uri).await;
            let (tx, rx) = mpsc::channel::<Incoming>(256);
            conn.subscribe(&sub_id, filters.clone(), tx).await?;
            tagged.push(ReceiverStream::new(rx).map(move |inc| (idx, inc)).boxed());
            conns.push(conn);
        }

        let (out_tx, out_rx) = mpsc::channel(256);
        let relay_count = conns.len();
        tokio::spawn(aggregate(tagged, relay_count, out_tx));

        Ok(Subscription { sub_id, rx: out_rx, conns })
    }

    /// Drop every connection. Outstanding subscriptions terminate.
    pub async fn shutdown(&self) {
        let mut conns = self.connections.lock().await;
        for (_, conn) in conns.drain() {
            conn.shutdown().await;
        }
    }
}

/// Merge per-relay streams: dedup events by id, emit one Eose once every
/// relay reported (or the straggler timeout fires).
async fn aggregate(
    tagged: Vec<futures::stream::BoxStream<'static, (usize, Incoming)>>,
    relay_count: usize,
    out_tx: mpsc::Sender<SubscriptionItem>,
) {
    let mut merged = futures::stream::select_all(tagged);
    let mut seen: HashSet<EventId> = HashSet::new();
    let mut eosed: HashSet<usize> = HashSet::new();
    let mut eose_sent = false;
    let eose_deadline = tokio::time::Instant::now() + EOSE_TIMEOUT;

    loop {
        let item = tokio::select! {
            item = merged.next() => item,
            _ = tokio::time::sleep_until(eose_deadline), if !eose_sent => {
                eose_sent = true;
                if out_tx.send(SubscriptionItem::Eose).await.is_err() {
                    return;
                }
                continue;
            }
        };

        match item {
            Some((_, Incoming::Event(event))) => {
                if !seen.insert(event.id) {
                    continue;
                }
                if out_tx.send(SubscriptionItem::Event(event)).await.is_err() {
                    return;
                }
            }
            Some((idx, Incoming::Eose)) => {
                eosed.insert(idx);
                if !eose_sent && eosed.len() == relay_count {
                    eose_sent = true;
                    if out_tx.send(SubscriptionItem::Eose).await.is_err() {
                        return;
                    }
                }
            }
            None => return,
        }
    }
}
