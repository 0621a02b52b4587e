// Multiplayer coordinator for the arena mesh
// Composes signaling, per-peer negotiation, the roster and game-state sync.
// Everything runs on one thread; each handler finishes before the next starts.

use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::client::ConnectionStatus;
use super::negotiation::{Negotiator, PeerRegistry, Role, TransportEvent, TransportFactory};
use super::protocol::{GameMessage, HitData, PlayerData, ProjectileData, TargetType};
use super::roster::{Admission, JoinNotice, Roster};
use super::signaling::{Decoded, ReconnectDecision, ReconnectPolicy, SignalSink, SignalingMessage};
use super::simulation::{LocalProjectile, SimulationPort};
use super::sync::{self, BroadcastGate};
use crate::config::{NetworkConfig, SessionConfig};

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 26;

/// Generate an opaque participant id (26 lowercase base-36 chars)
pub fn generate_participant_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Things the runtime should surface to the game, drained after each call
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Status(ConnectionStatus),
    Error(String),
}

pub struct MultiplayerManager<S, F, P>
where
    S: SignalSink,
    F: TransportFactory,
    P: SimulationPort,
{
    signal: S,
    negotiator: Negotiator<F>,
    roster: Roster,
    sim: P,
    local_id: Option<String>,
    reconnect: ReconnectPolicy,
    gate: BroadcastGate,
    /// Latched once any data channel has opened
    connection_established: bool,
    notices: Vec<Notice>,
}

impl<S, F, P> MultiplayerManager<S, F, P>
where
    S: SignalSink,
    F: TransportFactory,
    P: SimulationPort,
{
    pub fn new(
        network: &NetworkConfig,
        session: &SessionConfig,
        signal: S,
        factory: F,
        sim: P,
    ) -> Self {
        Self {
            signal,
            negotiator: Negotiator::new(factory),
            roster: Roster::new(session),
            sim,
            local_id: None,
            reconnect: ReconnectPolicy::from_config(network),
            gate: BroadcastGate::new(Duration::from_millis(network.broadcast_interval_ms)),
            connection_established: false,
            notices: Vec::new(),
        }
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn connection_established(&self) -> bool {
        self.connection_established
    }

    pub fn peers(&self) -> &PeerRegistry<F::Transport> {
        self.negotiator.peers()
    }

    pub fn peers_mut(&mut self) -> &mut PeerRegistry<F::Transport> {
        self.negotiator.peers_mut()
    }

    pub fn signal_mut(&mut self) -> &mut S {
        &mut self.signal
    }

    pub fn sim(&self) -> &P {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut P {
        &mut self.sim
    }

    pub fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    /// Register a join observer; fires for every remote participant added
    /// and once for ourselves when the room is entered
    pub fn on_participant_joined(&mut self, observer: impl FnMut(&JoinNotice) + Send + 'static) {
        self.roster.on_participant_joined(observer);
    }

    pub fn on_participant_left(&mut self, observer: impl FnMut(&str) + Send + 'static) {
        self.roster.on_participant_left(observer);
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    // ---- signaling ----

    /// The control socket just opened: start a fresh session and join
    pub fn handle_signaling_open(&mut self) -> String {
        self.reconnect.on_open();
        self.reset_session();

        let local_id = generate_participant_id();
        info!(player_id = %local_id, "connected to signaling server, joining");
        self.local_id = Some(local_id.clone());

        self.signal.send(&SignalingMessage::Join {
            player_id: local_id.clone(),
        });
        info!(target: "telemetry", event = "multiplayer_connected", player_id = %local_id);
        self.notices.push(Notice::Status(ConnectionStatus::Joining));
        local_id
    }

    /// Close every transport and forget the previous identity's roster
    fn reset_session(&mut self) {
        if !self.negotiator.peers().is_empty() || !self.roster.is_empty() {
            debug!(
                peers = self.negotiator.peers().len(),
                participants = self.roster.len(),
                "resetting previous session"
            );
        }
        self.negotiator.close_all();
        self.roster.reset();
        self.connection_established = false;
    }

    /// The control socket closed without us asking
    pub fn handle_signaling_closed(&mut self) -> ReconnectDecision {
        let decision = self.reconnect.on_abnormal_close();
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "signaling lost, reconnecting");
                self.notices
                    .push(Notice::Status(ConnectionStatus::Reconnecting { attempt, delay }));
            }
            ReconnectDecision::GiveUp => {
                error!(
                    attempts = self.reconnect.attempts(),
                    "max reconnection attempts reached, continuing solo"
                );
                self.notices.push(Notice::Status(ConnectionStatus::Failed));
            }
        }
        decision
    }

    /// Decode and dispatch one inbound control frame
    pub fn handle_signaling_text(&mut self, text: &str) {
        match SignalingMessage::decode(text) {
            Ok(Decoded::Message(msg)) => self.handle_signaling_message(msg),
            Ok(Decoded::Unknown(kind)) => warn!(?kind, "unknown signaling message type"),
            Err(e) => warn!(error = %e, raw = %text, "error parsing signaling message"),
        }
    }

    pub fn handle_signaling_message(&mut self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::RoomInfo { players } => self.apply_room_info(&players),
            SignalingMessage::NewPlayer { player_id } => self.apply_new_player(&player_id),
            SignalingMessage::PlayerLeft { player_id } => self.apply_player_left(&player_id),
            SignalingMessage::Offer { offer, from, .. } => {
                let Some(local_id) = self.local_id.clone() else {
                    return;
                };
                self.negotiator
                    .handle_offer(&from, &offer, &local_id, &mut self.signal);
            }
            SignalingMessage::Answer { answer, from, .. } => {
                self.negotiator.handle_answer(&from, &answer);
            }
            SignalingMessage::IceCandidate { candidate, from, .. } => {
                self.negotiator.handle_ice_candidate(&from, candidate);
            }
            SignalingMessage::Pong { timestamp } => debug!(timestamp, "pong from signaling server"),
            SignalingMessage::Error { message } => warn!(%message, "signaling server error"),
            other => debug!(?other, "ignoring client-bound message type"),
        }
    }

    /// We just entered a room that already holds `existing`
    pub fn apply_room_info(&mut self, existing: &[String]) {
        let Some(local_id) = self.local_id.clone() else {
            warn!("room_info before join, ignoring");
            return;
        };

        if existing.len() >= self.roster.max_players() {
            let message = format!(
                "room already has {} players (max {})",
                existing.len(),
                self.roster.max_players()
            );
            warn!(%message, "refusing to join full room");
            self.signal.send(&SignalingMessage::Leave {
                player_id: local_id,
            });
            self.notices.push(Notice::Error(message));
            return;
        }

        info!(existing = existing.len(), "joined room");
        self.roster.assign_local_slot(existing.len(), &local_id);

        for peer_id in existing {
            if *peer_id == local_id {
                continue;
            }
            match self.roster.admit(peer_id) {
                Admission::Added(_) | Admission::Existing(_) => {
                    self.negotiator
                        .open_peer(peer_id, Role::Initiator, &local_id, &mut self.signal);
                }
                Admission::Full => warn!(peer = %peer_id, "no free slot for existing player"),
            }
        }

        self.roster.reconcile_ai(self.roster.human_count(), &mut self.sim);
        self.notices.push(Notice::Status(ConnectionStatus::InRoom {
            players: self.roster.human_count(),
        }));
    }

    /// Someone joined after us; they will send the offer
    pub fn apply_new_player(&mut self, peer_id: &str) {
        let Some(local_id) = self.local_id.clone() else {
            return;
        };
        if peer_id == local_id {
            return;
        }

        if self.roster.admit(peer_id) == Admission::Full {
            warn!(peer = %peer_id, "roster full, ignoring new player");
            return;
        }
        info!(peer = %peer_id, "new player joined");

        self.negotiator
            .open_peer(peer_id, Role::Responder, &local_id, &mut self.signal);
        self.roster.reconcile_ai(self.roster.human_count(), &mut self.sim);
    }

    pub fn apply_player_left(&mut self, peer_id: &str) {
        let had_transport = self.negotiator.close(peer_id);
        let had_entry = self.roster.remove(peer_id).is_some();
        if had_transport || had_entry {
            info!(peer = %peer_id, "player left");
        }
        self.roster.reconcile_ai(self.roster.human_count(), &mut self.sim);
    }

    /// Send the one-shot keepalive if the socket is still up
    pub fn send_ping(&mut self, timestamp: u64) -> bool {
        if !self.signal.is_open() {
            return false;
        }
        debug!(timestamp, "sending ping");
        self.signal.send(&SignalingMessage::Ping { timestamp })
    }

    // ---- transports ----

    /// Route one event from `peer_id`'s transport. Events from transports
    /// that are no longer registered are dropped.
    pub fn handle_transport_event(&mut self, peer_id: &str, event: TransportEvent) {
        if !self.negotiator.peers().contains(peer_id) {
            debug!(peer = %peer_id, ?event, "event for closed transport, dropping");
            return;
        }
        let Some(local_id) = self.local_id.clone() else {
            return;
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.negotiator
                    .send_local_candidate(peer_id, candidate, &local_id, &mut self.signal);
            }
            TransportEvent::Connected => {
                info!(peer = %peer_id, "peer connection established");
                self.negotiator.mark_connected(peer_id);
                self.notices.push(Notice::Status(ConnectionStatus::PeerConnected(
                    peer_id.to_string(),
                )));
            }
            TransportEvent::ChannelOpen => {
                info!(peer = %peer_id, "data channel open");
                self.connection_established = true;
                if let Admission::Added(slot) = self.roster.admit(peer_id) {
                    debug!(peer = %peer_id, slot, "participant added on channel open");
                    self.roster.reconcile_ai(self.roster.human_count(), &mut self.sim);
                }
            }
            TransportEvent::Message(text) => {
                sync::apply_inbound(
                    peer_id,
                    &text,
                    Some(local_id.as_str()),
                    &mut self.roster,
                    &mut self.sim,
                );
            }
            TransportEvent::ChannelClosed => debug!(peer = %peer_id, "data channel closed"),
            TransportEvent::Closed => {
                warn!(peer = %peer_id, "peer connection closed");
                self.negotiator.close(peer_id);
                self.notices.push(Notice::Status(ConnectionStatus::PeerFailed(
                    peer_id.to_string(),
                )));
            }
        }
    }

    // ---- outbound game state ----

    /// Broadcast the local tank if a channel is open and the rate gate allows.
    /// Returns whether anything was sent.
    pub fn broadcast_player_update(&mut self, now: Instant) -> bool {
        if !self.connection_established || !self.gate.try_pass(now) {
            return false;
        }
        let msg = GameMessage::PlayerUpdate {
            player_data: PlayerData::from(&self.sim.local_player()),
        };
        sync::broadcast(self.negotiator.peers_mut(), &msg) > 0
    }

    pub fn broadcast_projectile_fired(&mut self, projectile: &LocalProjectile) -> usize {
        let Some(local_id) = self.local_id.as_deref() else {
            return 0;
        };
        let msg = GameMessage::ProjectileFired {
            projectile: ProjectileData::from_local(projectile, local_id),
        };
        sync::broadcast(self.negotiator.peers_mut(), &msg)
    }

    pub fn broadcast_hit(&mut self, target_type: TargetType, target_id: &str, damage: f32) -> usize {
        let msg = GameMessage::PlayerHit {
            hit_data: HitData {
                target_type,
                target_id: target_id.to_string(),
                damage,
            },
        };
        sync::broadcast(self.negotiator.peers_mut(), &msg)
    }

    /// Release every transport, then say goodbye if the socket is still up
    pub fn disconnect(&mut self) {
        self.negotiator.close_all();
        self.connection_established = false;

        if let Some(local_id) = self.local_id.clone() {
            if self.signal.is_open() {
                self.signal.send(&SignalingMessage::Leave {
                    player_id: local_id.clone(),
                });
            }
            info!(target: "telemetry", event = "multiplayer_disconnected", player_id = %local_id);
        }
    }
}
