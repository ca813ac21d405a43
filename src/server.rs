//! Relay server
//!
//! The intermediary both peers register with. Clients announce themselves
//! with a `connection` message; `offer`, `answer` and `ice-candidate` messages
//! are forwarded to their `target` with `from` set to the sender.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::model::SignalingMessage;

type Outbox = mpsc::UnboundedSender<Message>;

#[derive(Clone, Default)]
struct Clients(Arc<Mutex<HashMap<String, Outbox>>>);

impl Clients {
    fn register(&self, id: &str, outbox: &Outbox) -> usize {
        let mut clients = self.0.lock();
        clients.insert(id.to_string(), outbox.clone());
        clients.len()
    }

    /// Removes `id` unless it has been taken over by a newer connection.
    fn unregister(&self, id: &str, outbox: &Outbox) -> usize {
        let mut clients = self.0.lock();
        if clients.get(id).is_some_and(|o| o.same_channel(outbox)) {
            clients.remove(id);
        }
        clients.len()
    }

    fn get(&self, id: &str) -> Option<Outbox> {
        self.0.lock().get(id).cloned()
    }
}

pub async fn run(addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Relay listening on ws://{}/ws", listener.local_addr()?);
    serve(listener).await;
    Ok(())
}

/// Binds `addr` and serves in the background.
pub async fn spawn(addr: &str) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    Ok((local, tokio::spawn(serve(listener))))
}

pub async fn serve(listener: TcpListener) {
    let clients = Clients::default();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(stream, peer, clients.clone()));
            }
            Err(e) => warn!("Relay accept failed: {}", e),
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, clients: Clients) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let (mut sink, mut frames) = ws.split();
    let (outbox, mut queued) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = queued.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut client_id: Option<String> = None;

    while let Some(frame) = frames.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let message = match SignalingMessage::from_json(&text) {
            Ok(message) => message,
            Err(e) => {
                deliver(&outbox, &SignalingMessage::error(format!("malformed message: {e}")));
                continue;
            }
        };

        match message {
            SignalingMessage::Connection { client_id: id, .. } => {
                info!("Received connection from client {}", id);
                if id.is_empty() {
                    deliver(&outbox, &SignalingMessage::error("Client ID is required"));
                    break;
                }
                let total = clients.register(&id, &outbox);
                info!("Client {} connected. Total clients: {}", id, total);
                deliver(
                    &outbox,
                    &SignalingMessage::Connection {
                        client_id: id.clone(),
                        status: Some("connected".to_string()),
                    },
                );
                client_id = Some(id);
            }
            SignalingMessage::Error { message } => {
                warn!("Client {:?} reported an error: {}", client_id, message);
            }
            addressed => route(&clients, client_id.as_deref(), addressed, &outbox),
        }
    }

    if let Some(id) = client_id {
        let total = clients.unregister(&id, &outbox);
        info!("Client {} disconnected. Total clients: {}", id, total);
    }

    drop(outbox);
    let _ = writer.await;
}

fn route(clients: &Clients, sender: Option<&str>, message: SignalingMessage, reply: &Outbox) {
    let kind = message.kind();
    let Some(sender) = sender else {
        deliver(
            reply,
            &SignalingMessage::error(format!("register before sending {kind}")),
        );
        return;
    };
    let Some(target) = message.target().map(str::to_string) else {
        deliver(reply, &SignalingMessage::error(format!("{kind} without target")));
        return;
    };

    info!("Received {} from client {} to client {}", kind, sender, target);
    let Some(forwarded) = message.forwarded_from(sender) else {
        return;
    };

    match clients.get(&target) {
        Some(peer) => deliver(&peer, &forwarded),
        None if kind == "offer" => deliver(
            reply,
            &SignalingMessage::error(format!("Target client {target} not found")),
        ),
        None => debug!("Dropping {} for unknown client {}", kind, target),
    }
}

fn deliver(outbox: &Outbox, message: &SignalingMessage) {
    match message.to_json() {
        Ok(text) => {
            let _ = outbox.send(Message::Text(text));
        }
        Err(e) => warn!("Could not encode {}: {}", message.kind(), e),
    }
}
