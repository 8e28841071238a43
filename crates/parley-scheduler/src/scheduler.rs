use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use parley_core::constants::{DEFAULT_PUBLISH_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS, MISSED_HEARTBEATS_MAX};
use parley_core::error::ParleyError;
use parley_crypto::verify_event;
use parley_relay::RelayPool;

use crate::message::{Job, WireMessage};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Relays the scheduler forwards worker-produced events to.
    pub publish_relays: Vec<String>,
    /// A worker silent longer than this is not dispatched to.
    pub liveness_timeout: Duration,
}

impl SchedulerConfig {
    pub fn new(publish_relays: Vec<String>) -> Self {
        Self {
            publish_relays,
            liveness_timeout: Duration::from_secs(
                HEARTBEAT_INTERVAL_SECS * MISSED_HEARTBEATS_MAX as u64,
            ),
        }
    }
}

struct WorkerHandle {
    tx: mpsc::Sender<WireMessage>,
    expert_types: Vec<String>,
    jobs: HashSet<String>,
    last_seen: Instant,
}

struct SchedulerInner {
    pool: Arc<RelayPool>,
    config: SchedulerConfig,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    /// job id → worker id, for cancellation routing.
    jobs: Mutex<HashMap<String, String>>,
}

/// The central side of the split deployment. Owns the listener; workers
/// connect and advertise their expert types; jobs are dispatched only to
/// compatible, live workers.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    local_url: String,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    /// Bind the worker listener on `addr` (e.g. `127.0.0.1:0`) and start
    /// accepting.
    pub async fn bind(
        addr: &str,
        pool: Arc<RelayPool>,
        config: SchedulerConfig,
    ) -> Result<Self, ParleyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ParleyError::Connect(format!("scheduler bind: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| ParleyError::Connect(e.to_string()))?;
        let local_url = format!("ws://{local}");

        let inner = Arc::new(SchedulerInner {
            pool,
            config,
            workers: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
        });

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let accept_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "worker connecting");
                            tokio::spawn(serve_worker(stream, Arc::clone(&accept_inner)));
                        }
                        Err(e) => {
                            warn!(error = %e, "worker accept failed");
                            return;
                        }
                    },
                }
            }
        });

        info!(url = %local_url, "scheduler listening");
        Ok(Self { inner, local_url, shutdown })
    }

    /// The `ws://` URL workers connect to.
    pub fn url(&self) -> String {
        self.local_url.clone()
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.workers.lock().await.len()
    }

    /// Dispatch a job to the least-loaded live worker supporting the job's
    /// expert type. Incompatible workers are never considered.
    pub async fn dispatch(&self, job: Job) -> Result<(), ParleyError> {
        let liveness = self.inner.config.liveness_timeout;
        let mut workers = self.inner.workers.lock().await;

        let candidate = workers
            .iter()
            .filter(|(_, w)| w.expert_types.contains(&job.expert_type))
            .filter(|(_, w)| w.last_seen.elapsed() < liveness)
            .min_by_key(|(_, w)| w.jobs.len())
            .map(|(id, _)| id.clone());

        let worker_id = candidate.ok_or_else(|| {
            ParleyError::CapabilityMismatch(format!(
                "no live worker supports expert type {}",
                job.expert_type
            ))
        })?;

        let worker = workers.get_mut(&worker_id).expect("candidate just resolved");
        let job_id = job.job_id.clone();
        worker
            .tx
            .send(WireMessage::Dispatch { job })
            .await
            .map_err(|_| ParleyError::Disconnected(format!("worker {worker_id}")))?;
        worker.jobs.insert(job_id.clone());
        drop(workers);

        self.inner.jobs.lock().await.insert(job_id.clone(), worker_id.clone());
        info!(%job_id, %worker_id, "job dispatched");
        Ok(())
    }

    /// Revoke a job; the worker acknowledges within the grace period.
    pub async fn cancel(&self, job_id: &str) -> Result<(), ParleyError> {
        let worker_id = self
            .inner
            .jobs
            .lock()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| ParleyError::UnknownReference(job_id.to_string()))?;

        let workers = self.inner.workers.lock().await;
        let worker = workers
            .get(&worker_id)
            .ok_or_else(|| ParleyError::Disconnected(format!("worker {worker_id}")))?;
        worker
            .tx
            .send(WireMessage::Cancel { job_id: job_id.to_string() })
            .await
            .map_err(|_| ParleyError::Disconnected(format!("worker {worker_id}")))?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Per-worker connection actor on the scheduler side.
async fn serve_worker(stream: TcpStream, inner: Arc<SchedulerInner>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "worker handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    // First frame must be Hello.
    let registered = loop {
        match source.next().await {
            Some(Ok(WsMessage::Text(text))) => match WireMessage::from_json(&text) {
                Ok(WireMessage::Hello { worker_id, expert_types }) => {
                    let (tx, rx) = mpsc::channel(64);
                    inner.workers.lock().await.insert(
                        worker_id.clone(),
                        WorkerHandle {
                            tx,
                            expert_types: expert_types.clone(),
                            jobs: HashSet::new(),
                            last_seen: Instant::now(),
                        },
                    );
                    if sink
                        .send(WsMessage::Text(WireMessage::HelloAck.to_json()))
                        .await
                        .is_err()
                    {
                        inner.workers.lock().await.remove(&worker_id);
                        return;
                    }
                    info!(%worker_id, ?expert_types, "worker registered");
                    break (worker_id, rx);
                }
                Ok(other) => {
                    debug!(?other, "frame before hello; dropping worker");
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "undecodable pre-hello frame");
                    return;
                }
            },
            Some(Ok(_)) => continue,
            _ => return,
        }
    };
    let (worker_id, mut outbound) = registered;

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(msg) => {
                    if sink.send(WsMessage::Text(msg.to_json())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = source.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sink.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(%worker_id, error = %e, "worker socket error");
                        break;
                    }
                };
                let msg = match WireMessage::from_json(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!(%worker_id, error = %e, "undecodable worker frame");
                        continue;
                    }
                };
                touch(&inner, &worker_id).await;
                match msg {
                    WireMessage::Ping { seq } => {
                        let pong = WireMessage::Pong { seq }.to_json();
                        if sink.send(WsMessage::Text(pong)).await.is_err() {
                            break;
                        }
                    }
                    WireMessage::PublishEvent { job_id, event } => {
                        if let Err(e) = verify_event(&event) {
                            debug!(%job_id, error = %e, "worker event failed verification");
                            continue;
                        }
                        let pool = Arc::clone(&inner.pool);
                        let relays = inner.config.publish_relays.clone();
                        tokio::spawn(async move {
                            let timeout = Duration::from_secs(DEFAULT_PUBLISH_TIMEOUT_SECS);
                            if let Err(e) = pool.publish(&event, &relays, timeout).await {
                                warn!(%job_id, error = %e, "forwarding worker event failed");
                            }
                        });
                    }
                    WireMessage::JobStatus { job_id, state, detail } => {
                        debug!(%worker_id, %job_id, ?state, ?detail, "job status");
                    }
                    WireMessage::JobAccepted { job_id } => {
                        debug!(%worker_id, %job_id, "job accepted");
                    }
                    WireMessage::JobRejected { job_id, reason } => {
                        warn!(%worker_id, %job_id, %reason, "job rejected");
                        inner.jobs.lock().await.remove(&job_id);
                    }
                    WireMessage::CancelAck { job_id } => {
                        debug!(%worker_id, %job_id, "cancel acknowledged");
                        inner.jobs.lock().await.remove(&job_id);
                        if let Some(w) = inner.workers.lock().await.get_mut(&worker_id) {
                            w.jobs.remove(&job_id);
                        }
                    }
                    other => debug!(%worker_id, ?other, "unexpected worker frame"),
                }
            }
        }
    }

    inner.workers.lock().await.remove(&worker_id);
    info!(%worker_id, "worker disconnected");
}

async fn touch(inner: &SchedulerInner, worker_id: &str) {
    if let Some(worker) = inner.workers.lock().await.get_mut(worker_id) {
        worker.last_seen = Instant::now();
    }
}
