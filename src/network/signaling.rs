// Signaling client for the arena mesh
// JSON control messages over a single WebSocket to the rendezvous server,
// plus the reconnect-with-backoff policy for that socket

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;

/// Session description exchanged during offer/answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's RTCIceCandidateInit shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }
}

/// Control messages exchanged with the rendezvous server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    /// Enter the shared room
    Join { player_id: String },

    /// Leave the room before closing the socket
    Leave { player_id: String },

    /// Sent to a joiner: everyone already in the room
    RoomInfo { players: Vec<String> },

    /// Sent to existing members when someone joins
    NewPlayer { player_id: String },

    /// Sent to remaining members when someone leaves or drops
    PlayerLeft { player_id: String },

    Offer {
        offer: SessionDescription,
        to: String,
        from: String,
    },

    Answer {
        answer: SessionDescription,
        to: String,
        from: String,
    },

    IceCandidate {
        candidate: IceCandidateInit,
        to: String,
        from: String,
    },

    /// Keepalive probe, answered with Pong
    Ping { timestamp: u64 },

    Pong { timestamp: u64 },

    /// Server-side complaint about a message it could not handle
    Error { message: String },
}

const KNOWN_TYPES: &[&str] = &[
    "join",
    "leave",
    "room_info",
    "new_player",
    "player_left",
    "offer",
    "answer",
    "ice_candidate",
    "ping",
    "pong",
    "error",
];

/// Result of decoding one inbound control frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(SignalingMessage),
    /// Well-formed JSON whose `type` we do not handle
    Unknown(Option<String>),
}

impl SignalingMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a control frame. Malformed JSON, or a known type with bad
    /// fields, is an error; an unrecognised `type` is not.
    pub fn decode(text: &str) -> serde_json::Result<Decoded> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);

        match kind.as_deref() {
            Some(k) if KNOWN_TYPES.contains(&k) => {
                serde_json::from_value(value).map(Decoded::Message)
            }
            _ => Ok(Decoded::Unknown(kind)),
        }
    }
}

/// Anything that can carry control messages to the rendezvous server.
///
/// Sending is fire-and-forget: a closed socket drops the message and
/// reports `false`, it never fails the caller.
pub trait SignalSink {
    fn send(&mut self, msg: &SignalingMessage) -> bool;
    fn is_open(&self) -> bool;
}

/// Outgoing side of the signaling socket as seen by the coordinator.
/// Detached while the socket is down.
#[derive(Debug, Default)]
pub struct SignalingOutbox {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl SignalingOutbox {
    pub fn attach(&mut self, tx: mpsc::UnboundedSender<String>) {
        self.tx = Some(tx);
    }

    pub fn detach(&mut self) {
        self.tx = None;
    }
}

impl SignalSink for SignalingOutbox {
    fn send(&mut self, msg: &SignalingMessage) -> bool {
        let Some(tx) = &self.tx else {
            debug!(?msg, "signaling socket not open, dropping message");
            return false;
        };

        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode signaling message");
                return false;
            }
        };

        if tx.send(text).is_err() {
            warn!("signaling writer is gone, dropping message");
            self.tx = None;
            return false;
        }
        true
    }

    fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// What to do after the signaling socket closed unexpectedly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

/// Bounded exponential backoff: delay = min(max_delay, 2^attempts * base)
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    reset_on_open: bool,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            base_delay,
            max_delay,
            reset_on_open: true,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        let mut policy = Self::new(
            config.max_reconnect_attempts,
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
        );
        policy.reset_on_open = config.reset_attempts_on_open;
        policy
    }

    pub fn with_reset_on_open(mut self, reset: bool) -> Self {
        self.reset_on_open = reset;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Socket opened successfully
    pub fn on_open(&mut self) {
        if self.reset_on_open {
            self.attempts = 0;
        }
    }

    /// Socket closed without us asking for it
    pub fn on_abnormal_close(&mut self) -> ReconnectDecision {
        if self.attempts >= self.max_attempts {
            return ReconnectDecision::GiveUp;
        }

        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        self.attempts += 1;

        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }
}

/// Events coming off the signaling socket
#[derive(Debug)]
pub enum SocketEvent {
    Text(String),
    Closed,
}

/// An open signaling socket: a writer fed through `outgoing` and a reader
/// publishing to `incoming`. Dropping `outgoing` (and every clone of it)
/// closes the socket.
pub struct SignalingSocket {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SignalingSocket {
    /// Connect to the rendezvous server and spawn the reader/writer tasks
    pub async fn open(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        info!(url, "connected to signaling server");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        // Writer: runs until every sender is dropped, then closes the socket
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(text)).await {
                    warn!(error = %e, "failed to write to signaling socket");
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(SocketEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "signaling server closed the socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "signaling socket error");
                        break;
                    }
                }
            }
            let _ = in_tx.send(SocketEvent::Closed);
        });

        Ok(Self {
            outgoing: out_tx,
            incoming: in_rx,
            reader,
            writer,
        })
    }

    /// Stop reading. The writer finishes once the outbox detaches.
    pub fn shutdown(self) {
        self.reader.abort();
    }

    /// Stop reading and give the writer up to `grace` to flush queued
    /// messages. The outbox must already be detached.
    pub async fn close(self, grace: Duration) {
        self.reader.abort();
        drop(self.outgoing);
        if tokio::time::timeout(grace, self.writer).await.is_err() {
            debug!("signaling writer did not finish in time");
        }
    }
}
