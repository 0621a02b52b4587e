// Peer negotiation for the arena mesh
// One transport per remote participant, brought up through the
// offer/answer/ICE exchange relayed by the signaling server

use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::signaling::{IceCandidateInit, SessionDescription, SignalSink, SignalingMessage};

/// Label of the game data channel opened by the initiator
pub const GAME_CHANNEL_LABEL: &str = "game";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session description rejected: {0}")]
    Sdp(String),
    #[error("ICE candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("transport is closed")]
    Closed,
    #[error("rtc error: {0}")]
    Rtc(String),
}

/// Which side of the offer/answer exchange we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We create the data channel and send the offer
    Initiator,
    /// We wait for an offer and accept the remote's data channel
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Negotiating(Role),
    Connected,
    Closed,
}

/// Things a transport reports back to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local ICE candidate to trickle to the remote
    LocalCandidate(IceCandidateInit),
    /// ICE + DTLS are up
    Connected,
    /// Game data channel is ready for sends
    ChannelOpen,
    /// Text frame received on the game data channel
    Message(String),
    ChannelClosed,
    /// Transport is gone for good
    Closed,
}

/// One negotiated connection to one remote participant
pub trait PeerTransport {
    /// Announce the outbound data channel; it is carried in the next offer
    fn create_data_channel(&mut self, label: &str) -> Result<(), TransportError>;

    /// Produce an offer and install it as the local description
    fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    fn set_remote_description(&mut self, desc: &SessionDescription)
        -> Result<(), TransportError>;

    /// Produce an answer to the applied remote offer and install it locally
    fn create_answer(&mut self) -> Result<SessionDescription, TransportError>;

    fn add_ice_candidate(&mut self, candidate: &IceCandidateInit) -> Result<(), TransportError>;

    fn is_channel_open(&self) -> bool;

    fn send(&mut self, text: &str) -> Result<(), TransportError>;

    /// Must be safe to call in any state, including mid-negotiation
    fn close(&mut self);
}

/// Creates transports on demand
pub trait TransportFactory {
    type Transport: PeerTransport;

    fn create(&mut self, peer_id: &str, role: Role) -> Result<Self::Transport, TransportError>;
}

/// Registry entry: the transport plus its negotiation bookkeeping
pub struct PeerLink<T> {
    pub transport: T,
    state: PeerState,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidateInit>,
}

impl<T: PeerTransport> PeerLink<T> {
    fn new(transport: T, role: Role) -> Self {
        Self {
            transport,
            state: PeerState::Negotiating(role),
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> &[IceCandidateInit] {
        &self.pending_candidates
    }

    /// Apply buffered candidates in arrival order, then clear the buffer
    fn flush_candidates(&mut self, peer_id: &str) {
        for candidate in self.pending_candidates.drain(..) {
            if let Err(e) = self.transport.add_ice_candidate(&candidate) {
                error!(peer = %peer_id, error = %e, "error adding pending ICE candidate");
            }
        }
    }
}

/// Participant id -> transport. At most one entry per id.
pub struct PeerRegistry<T> {
    links: HashMap<String, PeerLink<T>>,
}

impl<T> Default for PeerRegistry<T> {
    fn default() -> Self {
        Self {
            links: HashMap::new(),
        }
    }
}

impl<T: PeerTransport> PeerRegistry<T> {
    pub fn get(&self, peer_id: &str) -> Option<&PeerLink<T>> {
        self.links.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerLink<T>> {
        self.links.get_mut(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.links.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PeerLink<T>)> {
        self.links.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut PeerLink<T>)> {
        self.links.iter_mut()
    }

    fn insert(&mut self, peer_id: &str, link: PeerLink<T>) {
        self.links.insert(peer_id.to_string(), link);
    }

    /// Close the transport and forget it. Returns whether it existed.
    pub fn close(&mut self, peer_id: &str) -> bool {
        match self.links.remove(peer_id) {
            Some(mut link) => {
                link.state = PeerState::Closed;
                link.transport.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for (_, mut link) in self.links.drain() {
            link.state = PeerState::Closed;
            link.transport.close();
        }
    }
}

/// Runs the offer/answer/ICE state machine for every peer
pub struct Negotiator<F: TransportFactory> {
    factory: F,
    peers: PeerRegistry<F::Transport>,
}

impl<F: TransportFactory> Negotiator<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            peers: PeerRegistry::default(),
        }
    }

    pub fn peers(&self) -> &PeerRegistry<F::Transport> {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerRegistry<F::Transport> {
        &mut self.peers
    }

    pub fn factory_mut(&mut self) -> &mut F {
        &mut self.factory
    }

    /// Create and register a transport for `peer_id`. An existing transport
    /// for the same id is reused. Returns false only if creation failed.
    pub fn open_peer(
        &mut self,
        peer_id: &str,
        role: Role,
        local_id: &str,
        signal: &mut dyn SignalSink,
    ) -> bool {
        if self.peers.contains(peer_id) {
            debug!(peer = %peer_id, "transport already exists, reusing it");
            return true;
        }

        info!(peer = %peer_id, ?role, "creating peer connection");
        let transport = match self.factory.create(peer_id, role) {
            Ok(transport) => transport,
            Err(e) => {
                error!(peer = %peer_id, error = %e, "error creating peer connection");
                return false;
            }
        };
        self.peers.insert(peer_id, PeerLink::new(transport, role));

        if role == Role::Initiator {
            self.send_offer(peer_id, local_id, signal);
        }
        true
    }

    fn send_offer(&mut self, peer_id: &str, local_id: &str, signal: &mut dyn SignalSink) {
        let Some(link) = self.peers.get_mut(peer_id) else {
            return;
        };

        let offer = link
            .transport
            .create_data_channel(GAME_CHANNEL_LABEL)
            .and_then(|_| link.transport.create_offer());

        match offer {
            Ok(offer) => {
                signal.send(&SignalingMessage::Offer {
                    offer,
                    to: peer_id.to_string(),
                    from: local_id.to_string(),
                });
                debug!(peer = %peer_id, "offer sent");
            }
            // Transport stays registered; a fresh offer from the remote can still revive it
            Err(e) => error!(peer = %peer_id, error = %e, "error creating offer"),
        }
    }

    /// Remote wants to connect: accept (creating a responder transport if
    /// needed), answer, then apply any candidates that arrived early.
    pub fn handle_offer(
        &mut self,
        from: &str,
        offer: &SessionDescription,
        local_id: &str,
        signal: &mut dyn SignalSink,
    ) {
        if !self.peers.contains(from) && !self.open_peer(from, Role::Responder, local_id, signal) {
            return;
        }
        let Some(link) = self.peers.get_mut(from) else {
            return;
        };

        if let Err(e) = link.transport.set_remote_description(offer) {
            error!(peer = %from, error = %e, "error handling offer");
            return;
        }
        link.remote_description_set = true;
        link.flush_candidates(from);

        let answer = match link.transport.create_answer() {
            Ok(answer) => answer,
            Err(e) => {
                error!(peer = %from, error = %e, "error creating answer");
                return;
            }
        };

        signal.send(&SignalingMessage::Answer {
            answer,
            to: from.to_string(),
            from: local_id.to_string(),
        });
    }

    pub fn handle_answer(&mut self, from: &str, answer: &SessionDescription) {
        let Some(link) = self.peers.get_mut(from) else {
            warn!(peer = %from, "answer from unknown peer, ignoring");
            return;
        };

        if let Err(e) = link.transport.set_remote_description(answer) {
            error!(peer = %from, error = %e, "error handling answer");
            return;
        }
        link.remote_description_set = true;
        link.flush_candidates(from);
    }

    pub fn handle_ice_candidate(&mut self, from: &str, candidate: IceCandidateInit) {
        let Some(link) = self.peers.get_mut(from) else {
            debug!(peer = %from, "ICE candidate for unknown peer, dropping");
            return;
        };

        if link.remote_description_set {
            if let Err(e) = link.transport.add_ice_candidate(&candidate) {
                error!(peer = %from, error = %e, "error adding ICE candidate");
            }
        } else {
            link.pending_candidates.push(candidate);
        }
    }

    /// Trickle a locally discovered candidate to the remote
    pub fn send_local_candidate(
        &self,
        peer_id: &str,
        candidate: IceCandidateInit,
        local_id: &str,
        signal: &mut dyn SignalSink,
    ) {
        if !self.peers.contains(peer_id) {
            return;
        }
        signal.send(&SignalingMessage::IceCandidate {
            candidate,
            to: peer_id.to_string(),
            from: local_id.to_string(),
        });
    }

    pub fn mark_connected(&mut self, peer_id: &str) {
        if let Some(link) = self.peers.get_mut(peer_id) {
            link.state = PeerState::Connected;
        }
    }

    pub fn close(&mut self, peer_id: &str) -> bool {
        self.peers.close(peer_id)
    }

    pub fn close_all(&mut self) {
        self.peers.close_all();
    }
}
