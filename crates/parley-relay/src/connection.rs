use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use parley_core::constants::{RELAY_BACKOFF_CAP_SECS, RELAY_BACKOFF_INITIAL_SECS};
use parley_core::error::ParleyError;
use parley_core::event::Event;
use parley_core::filter::Filter;
use parley_crypto::verify_event;

use crate::message::{ClientMessage, RelayMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Item delivered to a subscription channel.
#[derive(Debug, Clone)]
pub(crate) enum Incoming {
    Event(Event),
    Eose,
}

enum Command {
    Publish {
        event: Box<Event>,
        ack: oneshot::Sender<Result<bool, ParleyError>>,
    },
    Subscribe {
        sub_id: String,
        filters: Vec<Filter>,
        tx: mpsc::Sender<Incoming>,
    },
    Unsubscribe {
        sub_id: String,
    },
    Shutdown,
}

/// Handle to one relay connection. The socket is owned by a background task;
/// this handle only queues commands. Cheap to clone via `Arc`.
pub struct RelayConnection {
    uri: String,
    cmd_tx: mpsc::Sender<Command>,
}

impl RelayConnection {
    /// Spawn the connection actor for `uri`. Connecting, reconnecting and
    /// re-subscribing happen inside the task; callers never see the socket.
    pub fn connect(uri: &str) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let task = ConnectionTask {
            uri: uri.to_string(),
            cmd_rx,
            subs: HashMap::new(),
            pending: HashMap::new(),
        };
        tokio::spawn(task.run());
        Self { uri: uri.to_string(), cmd_tx }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Publish one event and wait for the relay's OK ack.
    pub async fn publish(&self, event: Event, timeout: Duration) -> Result<bool, ParleyError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish { event: Box::new(event), ack: ack_tx })
            .await
            .map_err(|_| ParleyError::Disconnected(self.uri.clone()))?;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ParleyError::Disconnected(self.uri.clone())),
            Err(_) => Err(ParleyError::SubscribeTimeout),
        }
    }

    /// Register a subscription; matching events flow into `tx`. Survives
    /// reconnects (the REQ is re-issued).
    pub(crate) async fn subscribe(
        &self,
        sub_id: &str,
        filters: Vec<Filter>,
        tx: mpsc::Sender<Incoming>,
    ) -> Result<(), ParleyError> {
        self.cmd_tx
            .send(Command::Subscribe { sub_id: sub_id.to_string(), filters, tx })
            .await
            .map_err(|_| ParleyError::Disconnected(self.uri.clone()))
    }

    pub(crate) async fn unsubscribe(&self, sub_id: &str) {
        let _ = self.cmd_tx.send(Command::Unsubscribe { sub_id: sub_id.to_string() }).await;
    }

    /// Stop the actor and drop the socket.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

struct SubState {
    filters: Vec<Filter>,
    tx: mpsc::Sender<Incoming>,
}

struct ConnectionTask {
    uri: String,
    cmd_rx: mpsc::Receiver<Command>,
    subs: HashMap<String, SubState>,
    pending: HashMap<String, oneshot::Sender<Result<bool, ParleyError>>>,
}

enum Exit {
    Shutdown,
    Reconnect,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut backoff = RELAY_BACKOFF_INITIAL_SECS;
        loop {
            match connect_async(self.uri.as_str()).await {
                Ok((ws, _resp)) => {
                    info!(relay = %self.uri, "relay connected");
                    backoff = RELAY_BACKOFF_INITIAL_SECS;
                    match self.run_connected(ws).await {
                        Exit::Shutdown => return,
                        Exit::Reconnect => {
                            warn!(relay = %self.uri, "relay connection lost");
                        }
                    }
                }
                Err(e) => {
                    warn!(relay = %self.uri, error = %e, "relay connect failed");
                }
            }

            // Fail queued publishes fast while down; subscriptions persist.
            self.fail_pending();
            if self.wait_backoff(Duration::from_secs(backoff)).await {
                return;
            }
            backoff = (backoff * 2).min(RELAY_BACKOFF_CAP_SECS);
        }
    }

    /// Sleep the backoff while still servicing commands. Returns true on
    /// shutdown.
    async fn wait_backoff(&mut self, dur: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => return true,
                    Some(Command::Publish { ack, .. }) => {
                        let _ = ack.send(Err(ParleyError::Disconnected(self.uri.clone())));
                    }
                    Some(Command::Subscribe { sub_id, filters, tx }) => {
                        self.subs.insert(sub_id, SubState { filters, tx });
                    }
                    Some(Command::Unsubscribe { sub_id }) => {
                        self.subs.remove(&sub_id);
                    }
                },
            }
        }
    }

    async fn run_connected(&mut self, mut ws: WsStream) -> Exit {
        // Re-issue every registered subscription on (re)connect.
        for (sub_id, state) in &self.subs {
            let req = ClientMessage::Req { sub_id: sub_id.clone(), filters: state.filters.clone() };
            if ws.send(WsMessage::Text(req.to_json())).await.is_err() {
                return Exit::Reconnect;
            }
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        let _ = ws.close(None).await;
                        return Exit::Shutdown;
                    }
                    Some(Command::Publish { event, ack }) => {
                        let id_hex = event.id.to_hex();
                        let msg = ClientMessage::Event(*event).to_json();
                        if ws.send(WsMessage::Text(msg)).await.is_err() {
                            let _ = ack.send(Err(ParleyError::Disconnected(self.uri.clone())));
                            return Exit::Reconnect;
                        }
                        self.pending.insert(id_hex, ack);
                    }
                    Some(Command::Subscribe { sub_id, filters, tx }) => {
                        let req = ClientMessage::Req {
                            sub_id: sub_id.clone(),
                            filters: filters.clone(),
                        };
                        self.subs.insert(sub_id, SubState { filters, tx });
                        if ws.send(WsMessage::Text(req.to_json())).await.is_err() {
                            return Exit::Reconnect;
                        }
                    }
                    Some(Command::Unsubscribe { sub_id }) => {
                        self.subs.remove(&sub_id);
                        let close = ClientMessage::Close { sub_id }.to_json();
                        if ws.send(WsMessage::Text(close)).await.is_err() {
                            return Exit::Reconnect;
                        }
                    }
                },

                frame = ws.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(WsMessage::Ping(data))) => {
                        if ws.send(WsMessage::Pong(data)).await.is_err() {
                            return Exit::Reconnect;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Exit::Reconnect,
                    Some(Ok(_)) => {} // binary/pong frames are ignored
                    Some(Err(e)) => {
                        debug!(relay = %self.uri, error = %e, "websocket error");
                        return Exit::Reconnect;
                    }
                },
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let msg = match RelayMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(relay = %self.uri, error = %e, "undecodable relay message");
                return;
            }
        };

        match msg {
            RelayMessage::Event { sub_id, event } => {
                if let Err(e) = verify_event(&event) {
                    debug!(relay = %self.uri, error = %e, "dropping unverifiable event");
                    return;
                }
                if let Some(state) = self.subs.get(&sub_id) {
                    if state.tx.send(Incoming::Event(event)).await.is_err() {
                        // Receiver gone; tear the subscription down lazily.
                        self.subs.remove(&sub_id);
                    }
                }
            }
            RelayMessage::Ok { event_id, accepted, message } => {
                if let Some(ack) = self.pending.remove(&event_id) {
                    if !accepted {
                        debug!(relay = %self.uri, %event_id, %message, "event rejected");
                    }
                    let _ = ack.send(Ok(accepted));
                }
            }
            RelayMessage::Eose { sub_id } => {
                if let Some(state) = self.subs.get(&sub_id) {
                    let _ = state.tx.send(Incoming::Eose).await;
                }
            }
            RelayMessage::Closed { sub_id, message } => {
                debug!(relay = %self.uri, %sub_id, %message, "subscription closed by relay");
                self.subs.remove(&sub_id);
            }
            RelayMessage::Notice { message } => {
                debug!(relay = %self.uri, %message, "relay notice");
            }
        }
    }

    fn fail_pending(&mut self) {
        for (_, ack) in self.pending.drain() {
            let _ = ack.send(Err(ParleyError::Disconnected(self.uri.clone())));
        }
    }
}
