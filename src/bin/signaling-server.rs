// Arena mesh signaling server
// Places players into rooms and relays offers/answers/ICE candidates between them
//
// Usage: cargo run --bin signaling-server [-- --port <n>]

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arena_mesh::config;
use arena_mesh::network::signaling::{Decoded, SignalingMessage};
use arena_mesh::rendezvous::{RoomDirectory, SharedDirectory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::load_config().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        config::Config::default()
    });

    let mut addr: SocketAddr = config.server.bind_addr.parse()?;
    let args: Vec<String> = std::env::args().collect();
    if let Some(port) = args
        .iter()
        .position(|a| a == "--port")
        .and_then(|i| args.get(i + 1))
        .and_then(|p| p.parse::<u16>().ok())
    {
        addr.set_port(port);
    }

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, capacity = config.server.room_capacity, "signaling server listening");

    let directory: SharedDirectory = Arc::new(RwLock::new(RoomDirectory::new(
        config.server.room_capacity,
    )));

    while let Ok((stream, addr)) = listener.accept().await {
        let directory = directory.clone();
        tokio::spawn(handle_connection(stream, addr, directory));
    }

    Ok(())
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn reply(tx: &mpsc::UnboundedSender<String>, msg: &SignalingMessage) {
    if let Ok(json) = msg.to_json() {
        let _ = tx.send(json);
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, directory: SharedDirectory) {
    info!(%addr, "new connection");

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!(error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let mut player_id: Option<String> = None;

    // Spawn task to send messages to this connection
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%addr, error = %e, "error receiving message");
                break;
            }
        };

        if let Message::Text(text) = msg {
            handle_text(&text, &mut player_id, &tx, &directory).await;
        }
    }

    // A dropped socket counts as leaving
    if let Some(id) = player_id {
        directory.write().await.leave(&id);
        info!(player = %id, %addr, "connection closed");
    }

    send_task.abort();
}

async fn handle_text(
    text: &str,
    player_id: &mut Option<String>,
    tx: &mpsc::UnboundedSender<String>,
    directory: &SharedDirectory,
) {
    let msg = match SignalingMessage::decode(text) {
        Ok(Decoded::Message(msg)) => msg,
        Ok(Decoded::Unknown(kind)) => {
            warn!(?kind, "unknown message type");
            reply(tx, &SignalingMessage::Error {
                message: "Unknown message type".to_string(),
            });
            return;
        }
        Err(e) => {
            warn!(error = %e, "failed to parse message");
            reply(tx, &SignalingMessage::Error {
                message: format!("Invalid message format: {}", e),
            });
            return;
        }
    };

    match msg {
        SignalingMessage::Join { player_id: id } => {
            let mut dir = directory.write().await;
            if let Some(previous) = player_id.take() {
                if previous != id {
                    dir.leave(&previous);
                }
            }
            dir.join(&id, tx.clone(), unix_secs());
            *player_id = Some(id);
        }

        SignalingMessage::Leave { .. } => {
            if let Some(id) = player_id.take() {
                directory.write().await.leave(&id);
            }
        }

        SignalingMessage::Offer { ref to, ref from, .. }
        | SignalingMessage::Answer { ref to, ref from, .. }
        | SignalingMessage::IceCandidate { ref to, ref from, .. } => {
            info!(%from, %to, "relaying negotiation message");
            directory.read().await.forward(to, text);
        }

        SignalingMessage::Ping { timestamp } => {
            reply(tx, &SignalingMessage::Pong { timestamp });
        }

        other => {
            warn!(?other, "unexpected client message");
            reply(tx, &SignalingMessage::Error {
                message: "Unknown message type".to_string(),
            });
        }
    }
}
