//! DocStore→RagStore bridge: subscribes the tailable cursor and mirrors
//! each document into the collection, one entry per embedding vector with
//! chunk id `"<doc_id>-<i>"`. Writes are batched; EOF fires the caller's
//! hook once the snapshot is mirrored.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use parley_docstore::{DocStore, DocSubscription, Document, SubscribeOptions};

use crate::store::{RagEntry, RagMetadata, RagStore};

/// Bridge configuration.
#[derive(Clone)]
pub struct SyncConfig {
    pub docstore_id: String,
    pub collection: String,
    /// Entries buffered before a collection write.
    pub write_batch: usize,
    /// Cursor re-poll interval.
    pub retry_interval: Duration,
}

impl SyncConfig {
    pub fn new(docstore_id: &str, collection: &str) -> Self {
        Self {
            docstore_id: docstore_id.to_string(),
            collection: collection.to_string(),
            write_batch: 64,
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// Handle to a running bridge.
pub struct SyncController {
    sub: DocSubscription,
}

impl SyncController {
    pub fn stop(&self) {
        self.sub.stop();
    }
}

/// Convert one document into its per-vector entries.
pub fn entries_for(doc: &Document) -> Vec<RagEntry> {
    doc.embeddings
        .iter()
        .enumerate()
        .map(|(i, vector)| RagEntry {
            id: format!("{}-{}", doc.id, i),
            vector: vector.clone(),
            metadata: RagMetadata {
                doc_id: doc.id.clone(),
                include: doc.include.clone(),
                chunk_index: i,
                doc_type: Some(doc.doc_type.clone()),
                timestamp: Some(doc.timestamp),
            },
            data: doc.data.clone(),
        })
        .collect()
}

/// Start mirroring. `on_doc` observes each mirrored document; `on_eof` fires
/// once after the initial snapshot is fully written.
pub fn sync(
    docstore: &DocStore,
    rag: RagStore,
    config: SyncConfig,
    on_doc: Option<Box<dyn Fn(&Document) + Send + Sync>>,
    on_eof: Option<Box<dyn FnOnce() + Send>>,
) -> SyncController {
    struct State {
        buffer: Vec<RagEntry>,
        on_eof: Option<Box<dyn FnOnce() + Send>>,
    }

    let state = Arc::new(Mutex::new(State { buffer: Vec::new(), on_eof }));
    let on_doc = on_doc.map(Arc::new);

    let mut options = SubscribeOptions::new(&config.docstore_id);
    options.retry_interval = config.retry_interval;

    let collection = config.collection.clone();
    let write_batch = config.write_batch;

    let sub = docstore.subscribe(
        options,
        Box::new(move |doc| {
            let state = state.clone();
            let rag = rag.clone();
            let collection = collection.clone();
            let on_doc = on_doc.clone();
            Box::pin(async move {
                let mut state = state.lock().await;
                match doc {
                    Some(doc) => {
                        state.buffer.extend(entries_for(&doc));
                        if let Some(hook) = &on_doc {
                            hook(&doc);
                        }
                        if state.buffer.len() >= write_batch {
                            flush(&rag, &collection, &mut state.buffer);
                        }
                    }
                    None => {
                        flush(&rag, &collection, &mut state.buffer);
                        if let Some(hook) = state.on_eof.take() {
                            debug!(%collection, "rag sync snapshot complete");
                            hook();
                        }
                    }
                }
            })
        }),
    );

    SyncController { sub }
}

fn flush(rag: &RagStore, collection: &str, buffer: &mut Vec<RagEntry>) {
    if buffer.is_empty() {
        return;
    }
    let entries = std::mem::take(buffer);
    if let Err(e) = rag.store_batch(collection, &entries) {
        warn!(%collection, error = %e, "rag batch write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::QueryOptions;
    use tokio::sync::oneshot;

    fn doc(docstore_id: &str, id: &str, vectors: Vec<Vec<f32>>) -> Document {
        Document {
            id: id.to_string(),
            docstore_id: docstore_id.to_string(),
            timestamp: 42,
            created_at: 42,
            doc_type: "note".into(),
            data: format!("body of {id}"),
            embeddings: vectors,
            include: None,
        }
    }

    #[tokio::test]
    async fn snapshot_is_mirrored_then_eof_fires() {
        let store = DocStore::open_in_memory().unwrap();
        let ds = store.create_docstore("kb", "m", 2, "").unwrap();
        store.upsert(&doc(&ds, "d1", vec![vec![1.0, 0.0], vec![0.0, 1.0]])).unwrap();
        store.upsert(&doc(&ds, "d2", vec![vec![5.0, 5.0]])).unwrap();

        let rag = RagStore::temporary().unwrap();
        let (eof_tx, eof_rx) = oneshot::channel();

        let mut config = SyncConfig::new(&ds, "kb");
        config.retry_interval = Duration::from_millis(20);
        let controller = sync(
            &store,
            rag.clone(),
            config,
            None,
            Some(Box::new(move || {
                let _ = eof_tx.send(());
            })),
        );

        tokio::time::timeout(Duration::from_secs(3), eof_rx).await.unwrap().unwrap();

        // d1 contributes two chunk entries, d2 one.
        assert_eq!(rag.count("kb").unwrap(), 3);
        let hits = rag.search("kb", &[1.0, 0.0], 1, &QueryOptions::default()).unwrap();
        assert_eq!(hits[0].entry.id, "d1-0");
        assert_eq!(hits[0].entry.metadata.chunk_index, 0);
        assert_eq!(hits[0].entry.metadata.doc_id, "d1");

        controller.stop();
    }

    #[tokio::test]
    async fn live_upserts_keep_flowing_after_eof() {
        let store = DocStore::open_in_memory().unwrap();
        let ds = store.create_docstore("kb", "m", 1, "").unwrap();

        let rag = RagStore::temporary().unwrap();
        let (eof_tx, eof_rx) = oneshot::channel();
        let mut config = SyncConfig::new(&ds, "kb");
        config.retry_interval = Duration::from_millis(20);
        // Flush every document immediately so the live tail is observable.
        config.write_batch = 1;
        let controller = sync(
            &store,
            rag.clone(),
            config,
            None,
            Some(Box::new(move || {
                let _ = eof_tx.send(());
            })),
        );
        tokio::time::timeout(Duration::from_secs(3), eof_rx).await.unwrap().unwrap();
        assert_eq!(rag.count("kb").unwrap(), 0);

        store.upsert(&doc(&ds, "late", vec![vec![3.0]])).unwrap();
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if rag.count("kb").unwrap() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        controller.stop();
    }
}
