use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, warn};

use parley_core::constants::{DOC_BATCH_SIZE, DOC_RETRY_INTERVAL_SECS};

use crate::store::{DocStore, Document};

/// Tailable-cursor options. The cursor replays existing documents in `aid`
/// order, signals end-of-snapshot once, then keeps polling for new ones.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub docstore_id: String,
    pub doc_type: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub batch_size: usize,
    pub retry_interval: Duration,
}

impl SubscribeOptions {
    pub fn new(docstore_id: &str) -> Self {
        Self {
            docstore_id: docstore_id.to_string(),
            doc_type: None,
            since: None,
            until: None,
            batch_size: DOC_BATCH_SIZE,
            retry_interval: Duration::from_secs(DOC_RETRY_INTERVAL_SECS),
        }
    }
}

/// Backpressured delivery callback. `Some(doc)` per document; `None` once
/// when the initial snapshot is exhausted. The cursor awaits each call
/// before fetching more.
pub type DocCallback = Box<dyn FnMut(Option<Document>) -> BoxFuture<'static, ()> + Send>;

/// Handle to a running cursor.
pub struct DocSubscription {
    stop: watch::Sender<bool>,
}

impl DocSubscription {
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl DocStore {
    /// Start a tailable cursor over this store.
    pub fn subscribe(&self, options: SubscribeOptions, on_doc: DocCallback) -> DocSubscription {
        let (stop_tx, stop_rx) = watch::channel(false);
        let store = self.clone();
        tokio::spawn(run_cursor(store, options, on_doc, stop_rx));
        DocSubscription { stop: stop_tx }
    }
}

async fn run_cursor(
    store: DocStore,
    options: SubscribeOptions,
    mut on_doc: DocCallback,
    mut stop: watch::Receiver<bool>,
) {
    let mut last_aid: i64 = 0;
    let mut eof_sent = false;

    loop {
        if *stop.borrow() {
            return;
        }

        let batch = {
            let store = store.clone();
            let options = options.clone();
            tokio::task::spawn_blocking(move || {
                store.fetch_batch(
                    &options.docstore_id,
                    options.doc_type.as_deref(),
                    options.since,
                    options.until,
                    last_aid,
                    options.batch_size,
                )
            })
            .await
        };

        let batch = match batch {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => {
                warn!(docstore = %options.docstore_id, error = %e, "cursor query failed");
                if !eof_sent {
                    on_doc(None).await;
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "cursor task join failed");
                if !eof_sent {
                    on_doc(None).await;
                }
                return;
            }
        };

        let partial = batch.len() < options.batch_size;
        for (aid, doc) in batch {
            last_aid = aid;
            on_doc(Some(doc)).await;
            if *stop.borrow() {
                return;
            }
        }

        if partial {
            if !eof_sent {
                debug!(docstore = %options.docstore_id, last_aid, "snapshot complete");
                on_doc(None).await;
                eof_sent = true;
            }
            tokio::select! {
                _ = tokio::time::sleep(options.retry_interval) => {}
                _ = stop.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn sample_doc(docstore_id: &str, id: &str) -> Document {
        Document {
            id: id.to_string(),
            docstore_id: docstore_id.to_string(),
            timestamp: 0,
            created_at: 0,
            doc_type: "note".into(),
            data: id.to_string(),
            embeddings: vec![vec![1.0, 0.0, 0.0]],
            include: None,
        }
    }

    /// Docs 1..5 replay in insertion order under a deliberately slow
    /// consumer, then EOF, then a live doc arrives.
    #[tokio::test]
    async fn cursor_with_backpressure_then_live_tail() {
        let store = DocStore::open_in_memory().unwrap();
        let ds = store.create_docstore("kb", "x", 3, "").unwrap();
        for i in 1..=5 {
            store.upsert(&sample_doc(&ds, &format!("d{i}"))).unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();
        let tx = Arc::new(tx);
        let mut options = SubscribeOptions::new(&ds);
        options.retry_interval = Duration::from_millis(50);

        let sub = store.subscribe(
            options,
            Box::new(move |doc| {
                let tx = tx.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = tx.send(doc.map(|d| d.id));
                })
            }),
        );

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                Some("d1".to_string()),
                Some("d2".to_string()),
                Some("d3".to_string()),
                Some("d4".to_string()),
                Some("d5".to_string()),
                None,
            ]
        );

        // Live tail: a later upsert is delivered after EOF.
        store.upsert(&sample_doc(&ds, "d6")).unwrap();
        let live = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live, Some("d6".to_string()));

        sub.stop();
    }

    #[tokio::test]
    async fn type_filter_narrows_the_cursor() {
        let store = DocStore::open_in_memory().unwrap();
        let ds = store.create_docstore("kb", "x", 3, "").unwrap();
        for (id, ty) in [("a", "note"), ("b", "page"), ("c", "note")] {
            let mut doc = sample_doc(&ds, id);
            doc.doc_type = ty.into();
            store.upsert(&doc).unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();
        let tx = Arc::new(tx);
        let mut options = SubscribeOptions::new(&ds);
        options.doc_type = Some("note".into());
        options.retry_interval = Duration::from_millis(20);

        let sub = store.subscribe(
            options,
            Box::new(move |doc| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(doc.map(|d| d.id));
                })
            }),
        );

        assert_eq!(rx.recv().await.unwrap(), Some("a".to_string()));
        assert_eq!(rx.recv().await.unwrap(), Some("c".to_string()));
        assert_eq!(rx.recv().await.unwrap(), None);
        sub.stop();
    }

    /// An updated document gets a fresh aid and re-enters the live tail.
    #[tokio::test]
    async fn replaced_doc_reappears_in_tail() {
        let store = DocStore::open_in_memory().unwrap();
        let ds = store.create_docstore("kb", "x", 3, "").unwrap();
        store.upsert(&sample_doc(&ds, "d1")).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();
        let tx = Arc::new(tx);
        let mut options = SubscribeOptions::new(&ds);
        options.retry_interval = Duration::from_millis(20);

        let sub = store.subscribe(
            options,
            Box::new(move |doc| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(doc.map(|d| d.data));
                })
            }),
        );

        assert_eq!(rx.recv().await.unwrap(), Some("d1".to_string()));
        assert_eq!(rx.recv().await.unwrap(), None);

        let mut updated = sample_doc(&ds, "d1");
        updated.data = "d1-v2".into();
        store.upsert(&updated).unwrap();

        let live = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live, Some("d1-v2".to_string()));
        sub.stop();
    }
}
