// WebRTC peer transport using str0m Sans-I/O implementation
// One Rtc per remote participant, all sharing a single UDP socket

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::{ChannelConfig, ChannelId, Reliability};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};

use super::negotiation::{PeerTransport, Role, TransportError, TransportEvent, TransportFactory};
use super::signaling::{IceCandidateInit, SdpKind, SessionDescription};

/// Pick the interface to bind for host candidates.
///
/// Prefers a home LAN address (192.168.x.x), then corporate ranges, then
/// anything else that is IPv4 and not loopback.
fn discover_local_ip() -> Result<IpAddr> {
    let interfaces =
        if_addrs::get_if_addrs().map_err(|e| anyhow!("Failed to get network interfaces: {}", e))?;

    let mut candidates: Vec<(String, IpAddr)> = interfaces
        .into_iter()
        .filter_map(|iface| match iface.addr.ip() {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => Some((iface.name, IpAddr::V4(ipv4))),
            _ => None,
        })
        .collect();

    if candidates.is_empty() {
        return Err(anyhow!("No suitable network interfaces found"));
    }

    candidates.sort_by_key(|(_, ip)| match ip {
        IpAddr::V4(ipv4) => {
            let octets = ipv4.octets();
            if octets[0] == 192 && octets[1] == 168 {
                0
            } else if octets[0] == 172 && (16..=31).contains(&octets[1]) {
                1
            } else if octets[0] == 10 {
                2
            } else {
                3
            }
        }
        IpAddr::V6(_) => 99,
    });

    let (name, ip) = &candidates[0];
    debug!(interface = %name, %ip, "selected local interface");
    Ok(*ip)
}

/// Query the STUN server for our public address.
/// Must use the ICE socket itself, otherwise the NAT mapping differs.
async fn query_stun_server(udp_socket: &UdpSocket, stun_server: &str) -> Result<SocketAddr> {
    let stun_addr = tokio::net::lookup_host(stun_server)
        .await?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| anyhow!("Failed to resolve STUN server to IPv4 address"))?;

    let socket_clone = udp_socket.try_clone()?;
    let client = stunclient::StunClient::new(stun_addr);

    let public_addr = tokio::task::spawn_blocking(
        move || -> Result<SocketAddr, Box<dyn std::error::Error + Send + Sync>> {
            socket_clone.set_read_timeout(Some(Duration::from_secs(5)))?;
            let result = client.query_external_address(&socket_clone)?;
            socket_clone.set_read_timeout(None)?;
            Ok(result)
        },
    )
    .await?
    .map_err(|e| anyhow!("STUN query failed: {}", e))?;

    Ok(public_addr)
}

/// Local ICE setup shared by every peer transport
pub struct GatheredCandidates {
    pub socket: UdpSocket,
    pub local_addr: SocketAddr,
    pub candidates: Vec<Candidate>,
}

/// Bind the shared UDP socket and collect host + server-reflexive candidates.
/// A failed STUN query leaves us with the host candidate only.
pub async fn gather_candidates(stun_server: &str) -> Result<GatheredCandidates> {
    let local_ip = discover_local_ip().unwrap_or_else(|e| {
        warn!(error = %e, "local IP discovery failed, using loopback");
        IpAddr::from([127, 0, 0, 1])
    });

    // Bind to the specific IP so local_addr() matches our host candidate
    let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))?;
    let local_addr = socket.local_addr()?;
    info!(%local_addr, "bound UDP socket");

    let mut candidates = vec![Candidate::host(local_addr, "udp")
        .map_err(|e| anyhow!("Failed to create local candidate: {}", e))?];

    match query_stun_server(&socket, stun_server).await {
        Ok(public_addr) => {
            info!(%public_addr, "public address from STUN");
            match Candidate::server_reflexive(public_addr, local_addr, "udp") {
                Ok(srflx) => candidates.push(srflx),
                Err(e) => warn!(error = %e, "failed to create server reflexive candidate"),
            }
        }
        Err(e) => warn!(error = %e, "STUN query failed, using host candidate only"),
    }

    Ok(GatheredCandidates {
        socket,
        local_addr,
        candidates,
    })
}

/// Accept both the bare `candidate:` form and the `a=candidate:` attribute form
fn parse_candidate(line: &str) -> Result<Candidate, TransportError> {
    let bare = line.trim().trim_start_matches("a=");
    Candidate::from_sdp_string(bare)
        .or_else(|_| Candidate::from_sdp_string(&format!("a={bare}")))
        .map_err(|e| TransportError::Candidate(e.to_string()))
}

fn candidate_init(candidate: &Candidate) -> IceCandidateInit {
    let line = candidate.to_sdp_string();
    IceCandidateInit::new(line.trim().trim_start_matches("a="))
}

pub struct RtcFactory {
    local_addr: SocketAddr,
    candidates: Vec<Candidate>,
}

impl RtcFactory {
    pub fn new(local_addr: SocketAddr, candidates: Vec<Candidate>) -> Self {
        Self {
            local_addr,
            candidates,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl TransportFactory for RtcFactory {
    type Transport = RtcTransport;

    fn create(&mut self, peer_id: &str, role: Role) -> Result<RtcTransport, TransportError> {
        let mut rtc = Rtc::builder()
            .set_rtp_mode(false) // Data channels only, no RTP media
            .build();

        let mut events = VecDeque::new();
        for candidate in &self.candidates {
            if rtc.add_local_candidate(candidate.clone()).is_none() {
                warn!(peer = %peer_id, "rtc refused local candidate");
                continue;
            }
            events.push_back(TransportEvent::LocalCandidate(candidate_init(candidate)));
        }
        if events.is_empty() {
            return Err(TransportError::Rtc("no usable local candidates".to_string()));
        }

        debug!(peer = %peer_id, ?role, "created rtc instance");
        Ok(RtcTransport {
            peer_id: peer_id.to_string(),
            rtc,
            channel_label: None,
            channel_id: None,
            pending_offer: None,
            answer: None,
            events,
            deadline: None,
            negotiated: false,
            closed: false,
        })
    }
}

pub struct RtcTransport {
    peer_id: String,
    rtc: Rtc,
    channel_label: Option<String>,
    channel_id: Option<ChannelId>,
    pending_offer: Option<SdpPendingOffer>,
    answer: Option<SdpAnswer>,
    events: VecDeque<TransportEvent>,
    /// When str0m next wants Input::Timeout
    deadline: Option<Instant>,
    /// Set once an offer or answer has been accepted. str0m must not be
    /// polled, timed out or fed datagrams before that.
    negotiated: bool,
    closed: bool,
}

impl RtcTransport {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated
    }

    fn is_driving(&self) -> bool {
        self.negotiated && !self.closed
    }

    /// Feed a datagram if it belongs to this peer. Returns whether it was consumed.
    pub fn try_receive(
        &mut self,
        now: Instant,
        source: SocketAddr,
        destination: SocketAddr,
        contents: &[u8],
    ) -> bool {
        if !self.is_driving() {
            return false;
        }
        let Ok(contents) = contents.try_into() else {
            return false;
        };
        let input = Input::Receive(
            now,
            Receive {
                proto: Protocol::Udp,
                source,
                destination,
                contents,
            },
        );
        if !self.rtc.accepts(&input) {
            return false;
        }
        if let Err(e) = self.rtc.handle_input(input) {
            warn!(peer = %self.peer_id, error = %e, "rtc rejected input");
            self.fail();
        }
        true
    }

    /// Notify str0m of the time if its requested deadline has passed
    pub fn handle_timeout(&mut self, now: Instant) {
        if !self.is_driving() || self.deadline.is_some_and(|deadline| now < deadline) {
            return;
        }
        self.deadline = None;
        if let Err(e) = self.rtc.handle_input(Input::Timeout(now)) {
            warn!(peer = %self.peer_id, error = %e, "rtc timeout handling failed");
            self.fail();
        }
    }

    /// Drain str0m outputs: transmit datagrams and queue events.
    /// Returns the next deadline str0m wants to be woken at.
    pub fn poll(&mut self, socket: &tokio::net::UdpSocket) -> Option<Instant> {
        while self.is_driving() {
            match self.rtc.poll_output() {
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = socket.try_send_to(&transmit.contents, transmit.destination) {
                        warn!(peer = %self.peer_id, error = %e, "failed to send UDP packet");
                    }
                }
                Ok(Output::Timeout(deadline)) => {
                    self.deadline = Some(deadline);
                    return Some(deadline);
                }
                Ok(Output::Event(event)) => self.handle_event(event),
                Err(e) => {
                    warn!(peer = %self.peer_id, error = %e, "rtc poll failed");
                    self.fail();
                }
            }
        }
        None
    }

    pub fn take_events(&mut self) -> Vec<TransportEvent> {
        self.events.drain(..).collect()
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected => {
                info!(peer = %self.peer_id, "WebRTC connection established (ICE + DTLS)");
                self.events.push_back(TransportEvent::Connected);
            }
            Event::IceConnectionStateChange(state) => {
                debug!(peer = %self.peer_id, ?state, "ICE state");
                if state == IceConnectionState::Disconnected {
                    self.fail();
                }
            }
            Event::ChannelOpen(cid, label) => {
                debug!(peer = %self.peer_id, %label, "data channel opened");
                self.channel_id = Some(cid);
                self.events.push_back(TransportEvent::ChannelOpen);
            }
            Event::ChannelData(data) => match String::from_utf8(data.data) {
                Ok(text) => self.events.push_back(TransportEvent::Message(text)),
                Err(_) => debug!(peer = %self.peer_id, "non-text channel frame, dropping"),
            },
            Event::ChannelClose(cid) => {
                if self.channel_id == Some(cid) {
                    self.channel_id = None;
                    self.events.push_back(TransportEvent::ChannelClosed);
                }
            }
            _ => {}
        }
    }

    fn fail(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.channel_id = None;
        self.rtc.disconnect();
        self.events.push_back(TransportEvent::Closed);
    }
}

impl PeerTransport for RtcTransport {
    fn create_data_channel(&mut self, label: &str) -> Result<(), TransportError> {
        self.channel_label = Some(label.to_string());
        Ok(())
    }

    fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let mut change = self.rtc.sdp_api();
        if let Some(label) = &self.channel_label {
            change.add_channel_with_config(ChannelConfig {
                label: label.clone(),
                ordered: false,
                reliability: Reliability::MaxRetransmits { retransmits: 3 },
                negotiated: None,
                protocol: String::new(),
            });
        }
        let (offer, pending) = change
            .apply()
            .ok_or_else(|| TransportError::Sdp("nothing to offer".to_string()))?;

        self.pending_offer = Some(pending);
        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    fn set_remote_description(&mut self, desc: &SessionDescription) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        match desc.kind {
            SdpKind::Offer => {
                let offer = SdpOffer::from_sdp_string(&desc.sdp)
                    .map_err(|e| TransportError::Sdp(e.to_string()))?;
                let answer = self
                    .rtc
                    .sdp_api()
                    .accept_offer(offer)
                    .map_err(|e| TransportError::Sdp(e.to_string()))?;
                self.answer = Some(answer);
                self.negotiated = true;
            }
            SdpKind::Answer => {
                let pending = self
                    .pending_offer
                    .take()
                    .ok_or_else(|| TransportError::Sdp("answer without pending offer".to_string()))?;
                let answer = SdpAnswer::from_sdp_string(&desc.sdp)
                    .map_err(|e| TransportError::Sdp(e.to_string()))?;
                self.rtc
                    .sdp_api()
                    .accept_answer(pending, answer)
                    .map_err(|e| TransportError::Sdp(e.to_string()))?;
                self.negotiated = true;
            }
        }
        Ok(())
    }

    fn create_answer(&mut self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .answer
            .take()
            .ok_or_else(|| TransportError::Sdp("no remote offer applied".to_string()))?;
        Ok(SessionDescription::answer(answer.to_sdp_string()))
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidateInit) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if candidate.candidate.is_empty() {
            // End-of-candidates marker
            return Ok(());
        }
        let parsed = parse_candidate(&candidate.candidate)?;
        self.rtc.add_remote_candidate(parsed);
        Ok(())
    }

    fn is_channel_open(&self) -> bool {
        !self.closed && self.channel_id.is_some()
    }

    fn send(&mut self, text: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let cid = self.channel_id.ok_or(TransportError::ChannelNotOpen)?;
        let mut channel = self.rtc.channel(cid).ok_or(TransportError::ChannelNotOpen)?;
        channel
            .write(false, text.as_bytes())
            .map_err(|e| TransportError::Rtc(e.to_string()))?;
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.channel_id = None;
        self.rtc.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> RtcFactory {
        let addr: SocketAddr = "192.168.1.20:50000".parse().unwrap();
        RtcFactory::new(addr, vec![Candidate::host(addr, "udp").unwrap()])
    }

    #[test]
    fn test_new_transport_announces_local_candidates() {
        let mut transport = factory().create("bob", Role::Initiator).unwrap();
        let events = transport.take_events();

        assert_eq!(events.len(), 1);
        match &events[0] {
            TransportEvent::LocalCandidate(init) => {
                assert!(init.candidate.starts_with("candidate:"));
                assert!(init.candidate.contains("192.168.1.20"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_offer_answer_between_two_transports() {
        let mut factory = factory();
        let mut alice = factory.create("bob", Role::Initiator).unwrap();
        let mut bob = factory.create("alice", Role::Responder).unwrap();

        alice.create_data_channel("game").unwrap();
        let offer = alice.create_offer().unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("webrtc-datachannel"));

        bob.set_remote_description(&offer).unwrap();
        let answer = bob.create_answer().unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);

        alice.set_remote_description(&answer).unwrap();
    }

    #[test]
    fn test_answer_without_offer_is_rejected() {
        let mut transport = factory().create("bob", Role::Initiator).unwrap();
        let err = transport
            .set_remote_description(&SessionDescription::answer("v=0"))
            .unwrap_err();
        assert!(matches!(err, TransportError::Sdp(_)));
    }

    #[test]
    fn test_send_before_channel_open_fails() {
        let mut transport = factory().create("bob", Role::Initiator).unwrap();
        assert!(!transport.is_channel_open());
        assert!(matches!(
            transport.send("hi"),
            Err(TransportError::ChannelNotOpen)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut transport = factory().create("bob", Role::Responder).unwrap();
        transport.close();
        transport.close();
        assert!(transport.is_closed());
        assert!(matches!(transport.send("hi"), Err(TransportError::Closed)));
        assert!(matches!(transport.create_offer(), Err(TransportError::Closed)));
    }

    #[test]
    fn test_candidate_line_forms() {
        let line = "candidate:1 1 udp 2130706431 192.168.1.30 40000 typ host";
        assert!(parse_candidate(line).is_ok());
        assert!(parse_candidate(&format!("a={line}")).is_ok());
        assert!(parse_candidate("garbage").is_err());
    }

    async fn loopback_factory() -> (RtcFactory, tokio::net::UdpSocket) {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let factory = RtcFactory::new(addr, vec![Candidate::host(addr, "udp").unwrap()]);
        (factory, socket)
    }

    /// One round for one side: fire due timers, transmit, feed what arrived
    async fn pump(
        transport: &mut RtcTransport,
        socket: &tokio::net::UdpSocket,
    ) -> Vec<TransportEvent> {
        let local = socket.local_addr().unwrap();
        let mut buf = vec![0u8; 2048];

        transport.handle_timeout(Instant::now());
        transport.poll(socket);
        while let Ok(Ok((n, source))) =
            tokio::time::timeout(Duration::from_millis(2), socket.recv_from(&mut buf)).await
        {
            transport.try_receive(Instant::now(), source, local, &buf[..n]);
            transport.poll(socket);
        }
        transport.take_events()
    }

    fn assert_still_alive(transport: &mut RtcTransport) {
        assert!(!transport.is_closed());
        assert!(!transport
            .take_events()
            .iter()
            .any(|e| matches!(e, TransportEvent::Closed)));
    }

    #[tokio::test]
    async fn test_idle_before_negotiation_is_inert() {
        let (mut factory, socket) = loopback_factory().await;
        let now = Instant::now();

        // Responder still waiting for its offer
        let mut responder = factory.create("bob", Role::Responder).unwrap();
        responder.take_events();
        responder.poll(&socket);
        responder.handle_timeout(now);
        responder.poll(&socket);
        assert!(!responder.is_negotiated());
        let addr = socket.local_addr().unwrap();
        assert!(!responder.try_receive(now, addr, addr, b"\x00\x01"));
        assert_still_alive(&mut responder);

        // Initiator that sent an offer but has no answer yet
        let mut initiator = factory.create("carol", Role::Initiator).unwrap();
        initiator.take_events();
        initiator.create_data_channel("game").unwrap();
        initiator.create_offer().unwrap();
        initiator.handle_timeout(now);
        initiator.poll(&socket);
        assert!(!initiator.is_negotiated());
        assert_still_alive(&mut initiator);
    }

    #[tokio::test]
    async fn test_loopback_pair_exchanges_text() {
        let (mut factory_a, socket_a) = loopback_factory().await;
        let (mut factory_b, socket_b) = loopback_factory().await;

        let mut alice = factory_a.create("bob", Role::Initiator).unwrap();
        let mut bob = factory_b.create("alice", Role::Responder).unwrap();
        let candidates_a = alice.take_events();
        let candidates_b = bob.take_events();

        alice.create_data_channel("game").unwrap();
        let offer = alice.create_offer().unwrap();
        bob.set_remote_description(&offer).unwrap();
        let answer = bob.create_answer().unwrap();
        alice.set_remote_description(&answer).unwrap();
        assert!(alice.is_negotiated() && bob.is_negotiated());

        for event in candidates_a {
            if let TransportEvent::LocalCandidate(init) = event {
                bob.add_ice_candidate(&init).unwrap();
            }
        }
        for event in candidates_b {
            if let TransportEvent::LocalCandidate(init) = event {
                alice.add_ice_candidate(&init).unwrap();
            }
        }

        let mut received = None;
        let mut sent = false;
        for _ in 0..1000 {
            pump(&mut alice, &socket_a).await;
            for event in pump(&mut bob, &socket_b).await {
                assert_ne!(event, TransportEvent::Closed);
                if let TransportEvent::Message(text) = event {
                    received = Some(text);
                }
            }
            if received.is_some() {
                break;
            }
            if !sent && alice.is_channel_open() && bob.is_channel_open() {
                alice.send("hello").unwrap();
                sent = true;
            }
        }

        assert!(sent, "data channel never opened");
        assert_eq!(received.as_deref(), Some("hello"));
    }

    #[test]
    fn test_end_of_candidates_is_accepted() {
        let mut transport = factory().create("bob", Role::Responder).unwrap();
        assert!(transport.add_ice_candidate(&IceCandidateInit::new("")).is_ok());
    }
}
