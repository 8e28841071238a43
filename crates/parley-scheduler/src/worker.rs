use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_core::constants::{
    CANCEL_GRACE_SECS, HEARTBEAT_INTERVAL_SECS, MISSED_HEARTBEATS_MAX, RELAY_BACKOFF_CAP_SECS,
    RELAY_BACKOFF_INITIAL_SECS,
};
use parley_core::error::ParleyError;
use parley_core::event::Event;

use crate::message::{Job, JobState, WireMessage};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub scheduler_url: String,
    pub worker_id: String,
    pub heartbeat_interval: Duration,
    pub cancel_grace: Duration,
}

impl WorkerConfig {
    pub fn new(scheduler_url: &str) -> Self {
        Self {
            scheduler_url: scheduler_url.to_string(),
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            cancel_grace: Duration::from_secs(CANCEL_GRACE_SECS),
        }
    }
}

/// Streams produced by a running job back to the scheduler.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    tx: mpsc::Sender<WireMessage>,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Queue a signed expert event for the scheduler to publish.
    pub async fn publish_event(&self, event: Event) {
        let _ = self
            .tx
            .send(WireMessage::PublishEvent { job_id: self.job_id.clone(), event })
            .await;
    }

    pub async fn status(&self, state: JobState, detail: Option<String>) {
        let _ = self
            .tx
            .send(WireMessage::JobStatus { job_id: self.job_id.clone(), state, detail })
            .await;
    }
}

/// A started job; stopping aborts the task and waits out the grace period.
pub struct RunningJob {
    handle: JoinHandle<()>,
}

impl RunningJob {
    pub fn from_handle(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    async fn stop(self, grace: Duration) {
        self.handle.abort();
        let _ = tokio::time::timeout(grace, self.handle).await;
    }
}

/// Runs expert personas dispatched by the scheduler.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Expert types advertised in the handshake.
    fn expert_types(&self) -> Vec<String>;

    /// Start `job`; produced events and status updates go through `ctx`.
    async fn start(&self, job: Job, ctx: JobContext) -> Result<RunningJob, ParleyError>;
}

/// Worker process: connects to the scheduler, heartbeats, runs dispatched
/// jobs, reconnects with backoff when the link drops. Jobs keep running
/// across reconnects.
pub struct Worker {
    config: WorkerConfig,
    runner: Arc<dyn JobRunner>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(config: WorkerConfig, runner: Arc<dyn JobRunner>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self { config, runner, shutdown, shutdown_rx }
    }

    /// Handle that stops `run` from another task.
    pub fn stopper(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    pub async fn run(mut self) {
        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(64);
        let mut jobs: HashMap<String, RunningJob> = HashMap::new();
        let mut backoff = RELAY_BACKOFF_INITIAL_SECS;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match connect_async(self.config.scheduler_url.as_str()).await {
                Ok((ws, _)) => {
                    info!(url = %self.config.scheduler_url, "connected to scheduler");
                    backoff = RELAY_BACKOFF_INITIAL_SECS;
                    if self.session(ws, &out_tx, &mut out_rx, &mut jobs).await {
                        break;
                    }
                    warn!("scheduler link lost; reconnecting");
                }
                Err(e) => {
                    warn!(error = %e, "scheduler connect failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                _ = self.shutdown_rx.changed() => break,
            }
            backoff = (backoff * 2).min(RELAY_BACKOFF_CAP_SECS);
        }

        // Release everything on the way out.
        for (_, job) in jobs.drain() {
            job.stop(self.config.cancel_grace).await;
        }
    }

    /// One connected session. Returns true on shutdown, false to reconnect.
    async fn session(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        out_tx: &mpsc::Sender<WireMessage>,
        out_rx: &mut mpsc::Receiver<WireMessage>,
        jobs: &mut HashMap<String, RunningJob>,
    ) -> bool {
        let (mut sink, mut source) = ws.split();

        let hello = WireMessage::Hello {
            worker_id: self.config.worker_id.clone(),
            expert_types: self.runner.expert_types(),
        };
        if sink.send(WsMessage::Text(hello.to_json())).await.is_err() {
            return false;
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut seq: u64 = 0;
        let mut missed: u32 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    let _ = sink.close().await;
                    return true;
                }

                _ = heartbeat.tick() => {
                    if missed >= MISSED_HEARTBEATS_MAX {
                        warn!(missed, "heartbeats unanswered; dropping link");
                        return false;
                    }
                    seq += 1;
                    missed += 1;
                    let ping = WireMessage::Ping { seq }.to_json();
                    if sink.send(WsMessage::Text(ping)).await.is_err() {
                        return false;
                    }
                }

                queued = out_rx.recv() => {
                    if let Some(msg) = queued {
                        if sink.send(WsMessage::Text(msg.to_json())).await.is_err() {
                            return false;
                        }
                    }
                }

                frame = source.next() => {
                    let text = match frame {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Ping(data))) => {
                            if sink.send(WsMessage::Pong(data)).await.is_err() {
                                return false;
                            }
                            continue;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return false,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!(error = %e, "worker socket error");
                            return false;
                        }
                    };
                    let msg = match WireMessage::from_json(&text) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!(error = %e, "undecodable scheduler frame");
                            continue;
                        }
                    };
                    match msg {
                        WireMessage::Pong { .. } => missed = 0,
                        WireMessage::HelloAck => {}
                        WireMessage::Dispatch { job } => {
                            self.handle_dispatch(job, out_tx, jobs).await;
                        }
                        WireMessage::Cancel { job_id } => {
                            if let Some(running) = jobs.remove(&job_id) {
                                running.stop(self.config.cancel_grace).await;
                            }
                            let ack = WireMessage::CancelAck { job_id };
                            if sink.send(WsMessage::Text(ack.to_json())).await.is_err() {
                                return false;
                            }
                        }
                        other => debug!(?other, "unexpected scheduler frame"),
                    }
                }
            }
        }
    }

    async fn handle_dispatch(
        &self,
        job: Job,
        out_tx: &mpsc::Sender<WireMessage>,
        jobs: &mut HashMap<String, RunningJob>,
    ) {
        let job_id = job.job_id.clone();

        // The scheduler filters by type; rejecting here is a defense against
        // a confused peer.
        if !self.runner.expert_types().contains(&job.expert_type) {
            warn!(%job_id, expert_type = %job.expert_type, "incompatible dispatch");
            let _ = out_tx
                .send(WireMessage::JobRejected {
                    job_id,
                    reason: format!("unsupported expert type {}", job.expert_type),
                })
                .await;
            return;
        }

        let ctx = JobContext { job_id: job_id.clone(), tx: out_tx.clone() };
        match self.runner.start(job, ctx.clone()).await {
            Ok(running) => {
                jobs.insert(job_id.clone(), running);
                let _ = out_tx.send(WireMessage::JobAccepted { job_id: job_id.clone() }).await;
                ctx.status(JobState::Running, None).await;
            }
            Err(e) => {
                warn!(%job_id, error = %e, "job start failed");
                let _ = out_tx
                    .send(WireMessage::JobRejected { job_id, reason: e.to_string() })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use parley_core::constants::KIND_EXPERT_PROFILE;
    use parley_core::event::UnsignedEvent;
    use parley_core::Filter;
    use parley_crypto::{sign_event, Keys};
    use parley_relay::testing::LocalRelay;
    use parley_relay::{RelayPool, SubscriptionItem};

    struct EchoRunner;

    #[async_trait]
    impl JobRunner for EchoRunner {
        fn expert_types(&self) -> Vec<String> {
            vec!["echo".into()]
        }

        async fn start(&self, job: Job, ctx: JobContext) -> Result<RunningJob, ParleyError> {
            let keys = Keys::from_secret_hex(&job.expert_privkey)?;
            let handle = tokio::spawn(async move {
                let event = sign_event(
                    &keys,
                    UnsignedEvent::new(
                        keys.public(),
                        KIND_EXPERT_PROFILE,
                        vec![],
                        "echo expert online".into(),
                    ),
                );
                ctx.publish_event(event).await;
                // Stay alive until cancelled.
                std::future::pending::<()>().await;
            });
            Ok(RunningJob::from_handle(handle))
        }
    }

    #[tokio::test]
    async fn dispatch_runs_job_and_forwards_signed_events() {
        let relay = LocalRelay::start().await.unwrap();
        let relays = vec![relay.url()];
        let pool = Arc::new(RelayPool::new());

        let scheduler = Scheduler::bind(
            "127.0.0.1:0",
            pool.clone(),
            SchedulerConfig::new(relays.clone()),
        )
        .await
        .unwrap();

        let mut config = WorkerConfig::new(&scheduler.url());
        config.heartbeat_interval = Duration::from_millis(100);
        let worker = Worker::new(config, Arc::new(EchoRunner));
        let stopper = worker.stopper();
        tokio::spawn(worker.run());

        // Wait for registration.
        for _ in 0..300 {
            if scheduler.worker_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.worker_count().await, 1);

        let expert = Keys::generate();
        let expert_pubkey = expert.public();
        scheduler
            .dispatch(Job {
                job_id: "j1".into(),
                expert_type: "echo".into(),
                expert_privkey: expert.secret_hex(),
                wallet_nwc: "nwc://test".into(),
                docstore_id: None,
                env: serde_json::Value::Null,
            })
            .await
            .unwrap();

        // The event the job published must reach the relay, signed by the
        // dispatched expert identity.
        let listener_pool = RelayPool::new();
        let mut sub = listener_pool
            .subscribe(
                vec![Filter::new().kinds(vec![KIND_EXPERT_PROFILE]).authors(vec![expert_pubkey])],
                &relays,
            )
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match sub.next().await {
                    Some(SubscriptionItem::Event(event)) => return event,
                    Some(SubscriptionItem::Eose) => continue,
                    None => panic!("subscription closed early"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.pubkey, expert_pubkey);
        assert_eq!(event.content, "echo expert online");

        scheduler.cancel("j1").await.unwrap();
        let _ = stopper.send(true);
        scheduler.shutdown();
        relay.stop();
    }

    #[tokio::test]
    async fn incompatible_expert_type_is_never_dispatched() {
        let pool = Arc::new(RelayPool::new());
        let scheduler = Scheduler::bind("127.0.0.1:0", pool, SchedulerConfig::new(vec![]))
            .await
            .unwrap();

        let mut config = WorkerConfig::new(&scheduler.url());
        config.heartbeat_interval = Duration::from_millis(100);
        let worker = Worker::new(config, Arc::new(EchoRunner));
        let stopper = worker.stopper();
        tokio::spawn(worker.run());

        for _ in 0..300 {
            if scheduler.worker_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = scheduler
            .dispatch(Job {
                job_id: "j2".into(),
                expert_type: "vision".into(),
                expert_privkey: Keys::generate().secret_hex(),
                wallet_nwc: String::new(),
                docstore_id: None,
                env: serde_json::Value::Null,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "capability-mismatch");

        let _ = stopper.send(true);
        scheduler.shutdown();
    }
}
