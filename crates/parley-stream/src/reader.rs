use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::mpsc;
use tracing::debug;

use parley_core::constants::{
    DEFAULT_MAX_CHUNKS, DEFAULT_MAX_RESULT_SIZE, DEFAULT_STREAM_TTL_SECS, KIND_STREAM_CHUNK,
};
use parley_core::error::ParleyError;
use parley_core::event::Event;
use parley_core::filter::Filter;
use parley_core::payload::{ChunkStatus, StreamCompression, StreamEncryption, StreamMetadata};
use parley_crypto::compress::{decompress, Codec};
use parley_crypto::{decrypt, Keys};
use parley_relay::{RelayPool, SubscriptionItem};

/// Reader-side safety bounds.
#[derive(Debug, Clone, Copy)]
pub struct ReaderLimits {
    /// Highest accepted chunk count; the chunk with index `max_chunks` is
    /// one too many.
    pub max_chunks: usize,
    /// Cap on the total reassembled size in bytes.
    pub max_result_size: usize,
    /// Progress deadline, reset on every received chunk.
    pub ttl: Duration,
}

impl Default for ReaderLimits {
    fn default() -> Self {
        Self {
            max_chunks: DEFAULT_MAX_CHUNKS,
            max_result_size: DEFAULT_MAX_RESULT_SIZE,
            ttl: Duration::from_secs(DEFAULT_STREAM_TTL_SECS),
        }
    }
}

/// Ordered stream consumer. Chunks arriving out of order are buffered and
/// delivered strictly by ascending index starting at 0.
pub struct StreamReader {
    rx: mpsc::Receiver<Result<Vec<u8>, ParleyError>>,
}

impl StreamReader {
    /// Subscribe to the stream described by `meta` and start reassembly.
    pub async fn open(
        pool: &RelayPool,
        meta: &StreamMetadata,
        limits: ReaderLimits,
    ) -> Result<Self, ParleyError> {
        let receiver_keys = match meta.encryption {
            StreamEncryption::Nip44 => {
                let hex = meta.receiver_privkey.as_deref().ok_or_else(|| {
                    ParleyError::StreamParse("encrypted stream without receiver key".into())
                })?;
                Some(Keys::from_secret_hex(hex)?)
            }
            StreamEncryption::None => None,
        };

        let filter = Filter::new()
            .authors(vec![meta.stream_id])
            .kinds(vec![KIND_STREAM_CHUNK]);
        let sub = pool.subscribe(vec![filter], &meta.relays).await?;

        let (tx, rx) = mpsc::channel(16);
        let task = ReaderTask {
            meta: meta.clone(),
            receiver_keys,
            limits,
            tx,
        };
        tokio::spawn(task.run(sub));
        Ok(Self { rx })
    }

    /// Next ordered slice of the stream. `None` after successful `done`
    /// termination; an `Err` item is terminal.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, ParleyError>> {
        self.rx.recv().await
    }

    /// Drain the whole stream into one buffer.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, ParleyError> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.extend_from_slice(&item?);
        }
        Ok(out)
    }
}

struct ReaderTask {
    meta: StreamMetadata,
    receiver_keys: Option<Keys>,
    limits: ReaderLimits,
    tx: mpsc::Sender<Result<Vec<u8>, ParleyError>>,
}

impl ReaderTask {
    async fn run(self, mut sub: parley_relay::Subscription) {
        let mut pending: HashMap<u64, Event> = HashMap::new();
        let mut next_seq: u64 = 0;
        let mut total: usize = 0;
        let mut deadline = tokio::time::Instant::now() + self.limits.ttl;

        loop {
            let item = tokio::select! {
                item = sub.next() => item,
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = self.tx.send(Err(ParleyError::TtlExceeded)).await;
                    break;
                }
            };

            let event = match item {
                Some(SubscriptionItem::Event(event)) => event,
                Some(SubscriptionItem::Eose) => continue,
                None => {
                    let _ = self
                        .tx
                        .send(Err(ParleyError::Disconnected("stream subscription ended".into())))
                        .await;
                    break;
                }
            };

            deadline = tokio::time::Instant::now() + self.limits.ttl;

            let (seq, status) = match parse_chunk_tags(&event) {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = self.tx.send(Err(e)).await;
                    break;
                }
            };

            if seq as usize >= self.limits.max_chunks {
                let _ = self
                    .tx
                    .send(Err(ParleyError::MaxChunksExceeded { max: self.limits.max_chunks }))
                    .await;
                break;
            }

            pending.insert(seq, event);

            // Drain everything now in order.
            let mut finished = false;
            while let Some(event) = pending.remove(&next_seq) {
                next_seq += 1;
                let status = parse_chunk_tags(&event).map(|(_, s)| s).unwrap_or(ChunkStatus::Active);

                if status == ChunkStatus::Error {
                    let err = parse_remote_error(&event.content);
                    let _ = self.tx.send(Err(err)).await;
                    finished = true;
                    break;
                }

                match self.decode_chunk(&event) {
                    Ok(bytes) => {
                        total += bytes.len();
                        if total > self.limits.max_result_size {
                            let _ = self
                                .tx
                                .send(Err(ParleyError::MaxSizeExceeded {
                                    max: self.limits.max_result_size,
                                }))
                                .await;
                            finished = true;
                            break;
                        }
                        if !bytes.is_empty() && self.tx.send(Ok(bytes)).await.is_err() {
                            finished = true;
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = self.tx.send(Err(e)).await;
                        finished = true;
                        break;
                    }
                }

                if status == ChunkStatus::Done {
                    debug!(stream = %self.meta.stream_id, chunks = next_seq, "stream complete");
                    finished = true;
                    break;
                }
            }

            if finished {
                break;
            }
        }

        sub.close().await;
    }

    fn decode_chunk(&self, event: &Event) -> Result<Vec<u8>, ParleyError> {
        let codec = match self.meta.compression {
            StreamCompression::Gzip => Codec::Gzip,
            StreamCompression::None => Codec::None,
        };

        match self.meta.encryption {
            StreamEncryption::Nip44 => {
                let keys = self
                    .receiver_keys
                    .as_ref()
                    .ok_or_else(|| ParleyError::Internal("reader lost receiver keys".into()))?;
                let packed = decrypt(&event.content, &self.meta.stream_id, keys)?;
                decompress(&packed, codec)
            }
            StreamEncryption::None => match self.meta.compression {
                StreamCompression::Gzip => {
                    let raw = BASE64
                        .decode(event.content.trim())
                        .map_err(|e| ParleyError::StreamParse(format!("base64: {e}")))?;
                    decompress(&raw, Codec::Gzip)
                }
                StreamCompression::None => {
                    if self.meta.binary {
                        BASE64
                            .decode(event.content.trim())
                            .map_err(|e| ParleyError::StreamParse(format!("base64: {e}")))
                    } else {
                        Ok(event.content.as_bytes().to_vec())
                    }
                }
            },
        }
    }
}

fn parse_chunk_tags(event: &Event) -> Result<(u64, ChunkStatus), ParleyError> {
    let seq = event
        .tag_value("i")
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| ParleyError::StreamParse("chunk missing i tag".into()))?;
    let status = event
        .tag_value("status")
        .and_then(ChunkStatus::parse)
        .ok_or_else(|| ParleyError::StreamParse("chunk missing status tag".into()))?;
    Ok((seq, status))
}

fn parse_remote_error(content: &str) -> ParleyError {
    #[derive(serde::Deserialize)]
    struct Remote {
        code: String,
        message: String,
    }
    match serde_json::from_str::<Remote>(content) {
        Ok(r) => ParleyError::StreamRemote { code: r.code, message: r.message },
        Err(_) => ParleyError::StreamRemote {
            code: "unknown".into(),
            message: content.to_string(),
        },
    }
}
