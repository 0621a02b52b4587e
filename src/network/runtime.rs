// Network runtime - drives the coordinator on a background thread
// Bridges the async signaling socket and the shared UDP socket with the sync game loop via channels

use anyhow::Result;
use std::future::pending;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc, RwLock,
};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::client::{ConnectionStatus, NetworkCommand, NetworkEvent};
use super::manager::{MultiplayerManager, Notice};
use super::negotiation::TransportEvent;
use super::roster::ParticipantView;
use super::rtc::{self, RtcFactory};
use super::signaling::{ReconnectDecision, SignalingOutbox, SignalingSocket, SocketEvent};
use super::simulation::{AiHandle, LocalPlayerState, RemoteProjectile, SimulationPort};
use crate::config::{Config, SessionConfig};

/// How often str0m timers, the ping and the broadcast gate are checked
const TICK: Duration = Duration::from_millis(10);

/// Time the signaling writer gets to flush `leave` on shutdown
const CLOSE_GRACE: Duration = Duration::from_millis(500);

type Manager = MultiplayerManager<SignalingOutbox, RtcFactory, ChannelSimulation>;

/// State shared with the `NetworkClient` handle
#[derive(Clone, Default)]
pub struct SharedState {
    pub connected: Arc<AtomicBool>,
    pub roster: Arc<RwLock<Vec<ParticipantView>>>,
    pub local_id: Arc<RwLock<Option<String>>>,
}

/// Simulation seam backed by the event channel to the game loop.
/// AI handles are issued here; the game maps them to its own enemies.
pub struct ChannelSimulation {
    events: mpsc::Sender<NetworkEvent>,
    local: LocalPlayerState,
    next_ai: u64,
}

impl ChannelSimulation {
    pub fn new(events: mpsc::Sender<NetworkEvent>, session: &SessionConfig) -> Self {
        Self {
            events,
            local: LocalPlayerState {
                health: session.default_health,
                current_weapon: session.default_weapon.clone(),
                ..LocalPlayerState::default()
            },
            next_ai: 0,
        }
    }

    pub fn set_local(&mut self, state: LocalPlayerState) {
        self.local = state;
    }

    fn emit(&self, event: NetworkEvent) {
        if self.events.send(event).is_err() {
            debug!("game loop dropped its event receiver");
        }
    }
}

impl SimulationPort for ChannelSimulation {
    fn local_player(&self) -> LocalPlayerState {
        self.local.clone()
    }

    fn spawn_ai(&mut self) -> AiHandle {
        self.next_ai += 1;
        let handle = AiHandle(self.next_ai);
        self.emit(NetworkEvent::SpawnAi(handle));
        handle
    }

    fn remove_ai(&mut self, handle: AiHandle) {
        self.emit(NetworkEvent::RemoveAi(handle));
    }

    fn apply_damage(&mut self, amount: f32) {
        self.emit(NetworkEvent::ApplyDamage(amount));
    }

    fn spawn_remote_projectile(&mut self, projectile: RemoteProjectile) {
        self.emit(NetworkEvent::RemoteProjectile(projectile));
    }
}

/// Initialize and run the network in a background thread
pub fn spawn_network_thread(
    config: Config,
    event_tx: mpsc::Sender<NetworkEvent>,
    cmd_rx: tokio_mpsc::UnboundedReceiver<NetworkCommand>,
    shared: SharedState,
) -> std::io::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name("arena-mesh-net".to_string())
        .spawn(move || {
            info!("network thread started");
            rt.block_on(async move {
                if let Err(e) = run_session(config, event_tx.clone(), cmd_rx, shared).await {
                    error!(error = %e, "network session failed");
                    let _ = event_tx.send(NetworkEvent::Error(e.to_string()));
                }
            });
            info!("network thread ending");
        })?;

    Ok(())
}

/// Wait for the next signaling event, or forever while disconnected
async fn next_socket_event(socket: &mut Option<SignalingSocket>) -> SocketEvent {
    match socket {
        Some(socket) => socket.incoming.recv().await.unwrap_or(SocketEvent::Closed),
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => pending().await,
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Main network event loop
async fn run_session(
    config: Config,
    event_tx: mpsc::Sender<NetworkEvent>,
    mut cmd_rx: tokio_mpsc::UnboundedReceiver<NetworkCommand>,
    shared: SharedState,
) -> Result<()> {
    let gathered = rtc::gather_candidates(&config.network.stun_server).await?;
    gathered.socket.set_nonblocking(true)?;
    let udp = UdpSocket::from_std(gathered.socket)?;
    let local_addr = gathered.local_addr;

    let mut manager: Manager = MultiplayerManager::new(
        &config.network,
        &config.session,
        SignalingOutbox::default(),
        RtcFactory::new(local_addr, gathered.candidates),
        ChannelSimulation::new(event_tx.clone(), &config.session),
    );

    let tx = event_tx.clone();
    manager.on_participant_joined(move |notice| {
        let _ = tx.send(NetworkEvent::ParticipantJoined {
            participant_id: notice.participant_id.clone(),
            slot: notice.slot,
            is_local: notice.is_local,
        });
    });
    let tx = event_tx.clone();
    manager.on_participant_left(move |id| {
        let _ = tx.send(NetworkEvent::ParticipantLeft {
            participant_id: id.to_string(),
        });
    });

    let url = config.network.signaling_server.clone();
    let ping_delay = Duration::from_millis(config.network.ping_delay_ms);

    let mut socket: Option<SignalingSocket> = None;
    let mut reconnect_at: Option<Instant> = Some(Instant::now());
    let mut ping_at: Option<Instant> = None;
    let mut buf = vec![0u8; 2048];

    let mut tick = time::interval(TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = next_socket_event(&mut socket) => match event {
                SocketEvent::Text(text) => manager.handle_signaling_text(&text),
                SocketEvent::Closed => {
                    warn!("disconnected from signaling server");
                    manager.signal_mut().detach();
                    if let Some(closed) = socket.take() {
                        closed.shutdown();
                    }
                    ping_at = None;
                    reconnect_at = schedule_reconnect(&mut manager);
                }
            },

            _ = sleep_until_opt(reconnect_at) => {
                reconnect_at = None;
                publish_status(&event_tx, ConnectionStatus::Connecting);
                match SignalingSocket::open(&url).await {
                    Ok(opened) => {
                        manager.signal_mut().attach(opened.outgoing.clone());
                        socket = Some(opened);
                        let local_id = manager.handle_signaling_open();
                        if let Ok(mut shared_id) = shared.local_id.write() {
                            *shared_id = Some(local_id);
                        }
                        ping_at = Some(Instant::now() + ping_delay);
                    }
                    Err(e) => {
                        warn!(error = %e, url = %url, "failed to connect to signaling server");
                        reconnect_at = schedule_reconnect(&mut manager);
                    }
                }
            },

            recv = udp.recv_from(&mut buf) => match recv {
                Ok((n, source)) => route_datagram(&mut manager, source, local_addr, &buf[..n]),
                Err(e) => warn!(error = %e, "UDP receive failed"),
            },

            _ = tick.tick() => {
                let now = std::time::Instant::now();
                for (_, link) in manager.peers_mut().iter_mut() {
                    link.transport.handle_timeout(now);
                }
                if ping_at.is_some_and(|at| Instant::now() >= at) {
                    ping_at = None;
                    manager.send_ping(unix_millis());
                }
                manager.broadcast_player_update(now);
            },

            cmd = cmd_rx.recv() => match cmd {
                Some(NetworkCommand::PlayerUpdate(state)) => {
                    manager.sim_mut().set_local(state);
                    manager.broadcast_player_update(std::time::Instant::now());
                }
                Some(NetworkCommand::ProjectileFired(projectile)) => {
                    manager.broadcast_projectile_fired(&projectile);
                }
                Some(NetworkCommand::Hit { target_type, target_id, damage }) => {
                    manager.broadcast_hit(target_type, &target_id, damage);
                }
                Some(NetworkCommand::Disconnect) | None => {
                    info!("disconnect requested");
                    manager.disconnect();
                    drive_transports(&mut manager, &udp);
                    manager.signal_mut().detach();
                    if let Some(open) = socket.take() {
                        open.close(CLOSE_GRACE).await;
                    }
                    publish_shared(&manager, &shared);
                    return Ok(());
                }
            },
        }

        drive_transports(&mut manager, &udp);
        forward_notices(&mut manager, &event_tx);
        publish_shared(&manager, &shared);
    }
}

/// Ask the reconnect policy what to do after losing the socket
fn schedule_reconnect(manager: &mut Manager) -> Option<Instant> {
    match manager.handle_signaling_closed() {
        ReconnectDecision::Retry { delay, .. } => Some(Instant::now() + delay),
        ReconnectDecision::GiveUp => None,
    }
}

/// Hand a datagram to whichever transport claims it
fn route_datagram(
    manager: &mut Manager,
    source: std::net::SocketAddr,
    destination: std::net::SocketAddr,
    contents: &[u8],
) {
    let now = std::time::Instant::now();
    let claimed = manager
        .peers_mut()
        .iter_mut()
        .any(|(_, link)| link.transport.try_receive(now, source, destination, contents));
    if !claimed {
        debug!(%source, len = contents.len(), "datagram matched no peer");
    }
}

/// Flush str0m output for every peer and route the resulting events.
/// Routing can produce more output (answers, closes), so repeat until quiet.
fn drive_transports(manager: &mut Manager, udp: &UdpSocket) {
    for _ in 0..4 {
        let mut pending: Vec<(String, Vec<TransportEvent>)> = Vec::new();
        for (peer_id, link) in manager.peers_mut().iter_mut() {
            link.transport.poll(udp);
            let events = link.transport.take_events();
            if !events.is_empty() {
                pending.push((peer_id.clone(), events));
            }
        }
        if pending.is_empty() {
            return;
        }
        for (peer_id, events) in pending {
            for event in events {
                manager.handle_transport_event(&peer_id, event);
            }
        }
    }
}

fn publish_status(event_tx: &mpsc::Sender<NetworkEvent>, status: ConnectionStatus) {
    let _ = event_tx.send(NetworkEvent::Status(status));
}

fn forward_notices(manager: &mut Manager, event_tx: &mpsc::Sender<NetworkEvent>) {
    for notice in manager.take_notices() {
        match notice {
            Notice::Status(ConnectionStatus::Failed) => {
                publish_status(event_tx, ConnectionStatus::Failed);
                let _ = event_tx.send(NetworkEvent::SignalingFailed);
            }
            Notice::Status(status) => publish_status(event_tx, status),
            Notice::Error(message) => {
                let _ = event_tx.send(NetworkEvent::Error(message));
            }
        }
    }
}

fn publish_shared(manager: &Manager, shared: &SharedState) {
    shared
        .connected
        .store(manager.connection_established(), Ordering::Relaxed);
    if let Ok(mut roster) = shared.roster.write() {
        let snapshot = manager.roster().snapshot();
        if *roster != snapshot {
            *roster = snapshot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_simulation_forwards_events() {
        let (tx, rx) = mpsc::channel();
        let mut sim = ChannelSimulation::new(tx, &SessionConfig::default());

        let first = sim.spawn_ai();
        let second = sim.spawn_ai();
        sim.remove_ai(first);
        sim.apply_damage(12.5);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                NetworkEvent::SpawnAi(AiHandle(1)),
                NetworkEvent::SpawnAi(AiHandle(2)),
                NetworkEvent::RemoveAi(AiHandle(1)),
                NetworkEvent::ApplyDamage(12.5),
            ]
        );
        assert_ne!(first, second);
    }

    #[test]
    fn test_channel_simulation_reports_latest_local_state() {
        let (tx, _rx) = mpsc::channel();
        let mut sim = ChannelSimulation::new(tx, &SessionConfig::default());
        assert_eq!(sim.local_player().health, 1000.0);
        assert_eq!(sim.local_player().current_weapon, "Cannon");

        sim.set_local(LocalPlayerState {
            x: 4.0,
            y: 2.0,
            rotation: 0.0,
            health: 300.0,
            current_weapon: "Laser".to_string(),
        });
        assert_eq!(sim.local_player().health, 300.0);
    }

    #[test]
    fn test_simulation_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let mut sim = ChannelSimulation::new(tx, &SessionConfig::default());
        assert_eq!(sim.spawn_ai(), AiHandle(1));
    }

    #[tokio::test]
    async fn test_drive_with_peers_mid_negotiation() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_addr = udp.local_addr().unwrap();
        let candidate = str0m::Candidate::host(local_addr, "udp").unwrap();
        let config = Config::default();
        let (tx, _rx) = mpsc::channel();

        let mut manager: Manager = MultiplayerManager::new(
            &config.network,
            &config.session,
            SignalingOutbox::default(),
            RtcFactory::new(local_addr, vec![candidate]),
            ChannelSimulation::new(tx, &config.session),
        );
        manager.handle_signaling_open();
        manager.handle_signaling_text(r#"{"type":"room_info","players":["peer-a"]}"#);
        manager.handle_signaling_text(r#"{"type":"new_player","playerId":"peer-b"}"#);

        drive_transports(&mut manager, &udp);
        let now = std::time::Instant::now();
        for (_, link) in manager.peers_mut().iter_mut() {
            link.transport.handle_timeout(now);
        }
        drive_transports(&mut manager, &udp);

        assert!(manager.peers().contains("peer-a"));
        assert!(manager.peers().contains("peer-b"));
        assert!(manager
            .take_notices()
            .iter()
            .all(|n| !matches!(n, Notice::Status(ConnectionStatus::PeerFailed(_)))));
    }

    #[test]
    fn test_status_is_published() {
        let (tx, rx) = mpsc::channel();
        publish_status(&tx, ConnectionStatus::Connecting);
        assert_eq!(
            rx.try_recv().unwrap(),
            NetworkEvent::Status(ConnectionStatus::Connecting)
        );
    }
}
