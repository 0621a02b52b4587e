// In-memory stand-ins for the coordinator's seams, shared by unit tests

use super::negotiation::{PeerTransport, Role, TransportError, TransportFactory};
use super::signaling::{IceCandidateInit, SessionDescription, SignalSink, SignalingMessage};
use super::simulation::{AiHandle, LocalPlayerState, RemoteProjectile, SimulationPort};

#[derive(Debug)]
pub struct FakeTransport {
    pub peer_id: String,
    pub role: Role,
    pub channels: Vec<String>,
    pub remote: Option<SessionDescription>,
    pub candidates: Vec<IceCandidateInit>,
    pub channel_open: bool,
    pub sent: Vec<String>,
    pub closed: bool,
    pub fail_offer: bool,
    pub fail_remote: bool,
    pub fail_answer: bool,
    pub fail_send: bool,
}

impl PeerTransport for FakeTransport {
    fn create_data_channel(&mut self, label: &str) -> Result<(), TransportError> {
        self.channels.push(label.to_string());
        Ok(())
    }

    fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        if self.fail_offer {
            return Err(TransportError::Sdp("offer refused".to_string()));
        }
        Ok(SessionDescription::offer(format!(
            "offer-from-{}-transport",
            self.peer_id
        )))
    }

    fn set_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<(), TransportError> {
        if self.fail_remote {
            return Err(TransportError::Sdp("remote refused".to_string()));
        }
        self.remote = Some(desc.clone());
        Ok(())
    }

    fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        if self.fail_answer {
            return Err(TransportError::Sdp("answer refused".to_string()));
        }
        Ok(SessionDescription::answer(format!(
            "answer-from-{}-transport",
            self.peer_id
        )))
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidateInit) -> Result<(), TransportError> {
        self.candidates.push(candidate.clone());
        Ok(())
    }

    fn is_channel_open(&self) -> bool {
        self.channel_open && !self.closed
    }

    fn send(&mut self, text: &str) -> Result<(), TransportError> {
        if !self.is_channel_open() {
            return Err(TransportError::ChannelNotOpen);
        }
        if self.fail_send {
            return Err(TransportError::Rtc("send refused".to_string()));
        }
        self.sent.push(text.to_string());
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug, Default)]
pub struct FakeFactory {
    pub created: usize,
    pub fail_create: bool,
    pub fail_offer: bool,
    pub fail_remote: bool,
    pub fail_answer: bool,
}

impl TransportFactory for FakeFactory {
    type Transport = FakeTransport;

    fn create(&mut self, peer_id: &str, role: Role) -> Result<FakeTransport, TransportError> {
        if self.fail_create {
            return Err(TransportError::Rtc("no sockets left".to_string()));
        }
        self.created += 1;
        Ok(FakeTransport {
            peer_id: peer_id.to_string(),
            role,
            channels: Vec::new(),
            remote: None,
            candidates: Vec::new(),
            channel_open: false,
            sent: Vec::new(),
            closed: false,
            fail_offer: self.fail_offer,
            fail_remote: self.fail_remote,
            fail_answer: self.fail_answer,
            fail_send: false,
        })
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub sent: Vec<SignalingMessage>,
    pub open: bool,
}

impl RecordingSink {
    pub fn open() -> Self {
        Self {
            sent: Vec::new(),
            open: true,
        }
    }
}

impl SignalSink for RecordingSink {
    fn send(&mut self, msg: &SignalingMessage) -> bool {
        if !self.open {
            return false;
        }
        self.sent.push(msg.clone());
        true
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[derive(Debug, Default)]
pub struct FakeSimulation {
    pub local: LocalPlayerState,
    pub next_ai: u64,
    pub live_ai: Vec<AiHandle>,
    pub removed_ai: Vec<AiHandle>,
    pub damage: Vec<f32>,
    pub projectiles: Vec<RemoteProjectile>,
}

impl SimulationPort for FakeSimulation {
    fn local_player(&self) -> LocalPlayerState {
        self.local.clone()
    }

    fn spawn_ai(&mut self) -> AiHandle {
        self.next_ai += 1;
        let handle = AiHandle(self.next_ai);
        self.live_ai.push(handle);
        handle
    }

    fn remove_ai(&mut self, handle: AiHandle) {
        self.live_ai.retain(|h| *h != handle);
        self.removed_ai.push(handle);
    }

    fn apply_damage(&mut self, amount: f32) {
        self.damage.push(amount);
    }

    fn spawn_remote_projectile(&mut self, projectile: RemoteProjectile) {
        self.projectiles.push(projectile);
    }
}
