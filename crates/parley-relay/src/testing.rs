//! In-process relay speaking the relay side of the wire protocol, for
//! integration tests. Stores every accepted event in memory, replays matches
//! on REQ, then streams live events. Not for production use.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use parley_core::event::Event;
use parley_core::filter::Filter;

use crate::message::{ClientMessage, RelayMessage};

/// A local relay bound to an ephemeral 127.0.0.1 port.
pub struct LocalRelay {
    url: String,
    shutdown: broadcast::Sender<()>,
}

#[derive(Clone)]
struct Shared {
    store: Arc<Mutex<Vec<Event>>>,
    live: broadcast::Sender<Event>,
}

impl LocalRelay {
    /// Bind and start serving. Returns once the listener is ready.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = format!("ws://{addr}");

        let (live, _) = broadcast::channel(1024);
        let (shutdown, _) = broadcast::channel(1);
        let shared = Shared { store: Arc::new(Mutex::new(Vec::new())), live };

        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(serve_client(stream, shared.clone()));
                        }
                        Err(e) => {
                            debug!(error = %e, "local relay accept failed");
                            return;
                        }
                    },
                }
            }
        });

        Ok(Self { url, shutdown })
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

async fn serve_client(stream: TcpStream, shared: Shared) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "local relay handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();
    let mut subs: HashMap<String, Vec<Filter>> = HashMap::new();
    let mut live = shared.live.subscribe();

    loop {
        tokio::select! {
            frame = source.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Ping(data))) => {
                        if sink.send(WsMessage::Pong(data)).await.is_err() {
                            return;
                        }
                        continue;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => return,
                };
                let msg = match ClientMessage::from_json(&text) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                };
                match msg {
                    ClientMessage::Event(event) => {
                        let ok = RelayMessage::Ok {
                            event_id: event.id.to_hex(),
                            accepted: true,
                            message: String::new(),
                        };
                        shared.store.lock().await.push(event.clone());
                        let _ = shared.live.send(event);
                        if sink.send(WsMessage::Text(ok.to_json())).await.is_err() {
                            return;
                        }
                    }
                    ClientMessage::Req { sub_id, filters } => {
                        let stored = shared.store.lock().await.clone();
                        for event in stored {
                            if filters.iter().any(|f| f.matches(&event)) {
                                let msg = RelayMessage::Event {
                                    sub_id: sub_id.clone(),
                                    event,
                                };
                                if sink.send(WsMessage::Text(msg.to_json())).await.is_err() {
                                    return;
                                }
                            }
                        }
                        let eose = RelayMessage::Eose { sub_id: sub_id.clone() };
                        if sink.send(WsMessage::Text(eose.to_json())).await.is_err() {
                            return;
                        }
                        subs.insert(sub_id, filters);
                    }
                    ClientMessage::Close { sub_id } => {
                        subs.remove(&sub_id);
                    }
                }
            }

            event = live.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                for (sub_id, filters) in &subs {
                    if filters.iter().any(|f| f.matches(&event)) {
                        let msg = RelayMessage::Event {
                            sub_id: sub_id.clone(),
                            event: event.clone(),
                        };
                        if sink.send(WsMessage::Text(msg.to_json())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
