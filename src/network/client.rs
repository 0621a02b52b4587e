// Network client interface for the game loop
// Provides channels to communicate with the network thread

use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc, RwLock,
};
use std::time::Duration;
use tokio::sync::mpsc as tokio_mpsc;

use super::protocol::TargetType;
use super::roster::ParticipantView;
use super::simulation::{AiHandle, LocalPlayerState, LocalProjectile, RemoteProjectile};

/// Connection status line shown to the player
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Opening the signaling socket
    Connecting,
    /// Socket open, join sent
    Joining,
    /// Room entered; `players` counts ourselves
    InRoom { players: usize },
    Reconnecting { attempt: u32, delay: Duration },
    PeerConnected(String),
    PeerFailed(String),
    /// Retries exhausted; multiplayer is off until restart
    Failed,
}

/// Commands the game loop sends to the network thread
#[derive(Debug)]
pub enum NetworkCommand {
    /// Latest local tank state; broadcast at the configured rate
    PlayerUpdate(LocalPlayerState),

    /// Local player fired
    ProjectileFired(LocalProjectile),

    /// Our projectile struck something owned by a remote participant
    Hit {
        target_type: TargetType,
        target_id: String,
        damage: f32,
    },

    /// Gracefully disconnect
    Disconnect,
}

/// Events the network thread sends to the game loop
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    ParticipantJoined {
        participant_id: String,
        slot: usize,
        is_local: bool,
    },
    ParticipantLeft {
        participant_id: String,
    },

    /// Create one AI enemy, identified by `handle` from now on
    SpawnAi(AiHandle),
    RemoveAi(AiHandle),

    /// Damage addressed to the local player
    ApplyDamage(f32),

    /// Someone else's projectile to play out locally
    RemoteProjectile(RemoteProjectile),

    Status(ConnectionStatus),

    /// Signaling retries exhausted; keep playing solo
    SignalingFailed,

    /// Network error occurred
    Error(String),
}

/// Handle for the game loop to communicate with the network
pub struct NetworkClient {
    /// Send commands TO the network thread
    tx: tokio_mpsc::UnboundedSender<NetworkCommand>,

    /// Receive events FROM the network thread
    rx: mpsc::Receiver<NetworkEvent>,

    /// Any data channel open
    connected: Arc<AtomicBool>,

    roster: Arc<RwLock<Vec<ParticipantView>>>,
    local_id: Arc<RwLock<Option<String>>>,
}

impl NetworkClient {
    /// Create a new network client (called by start_network)
    pub fn new(
        tx: tokio_mpsc::UnboundedSender<NetworkCommand>,
        rx: mpsc::Receiver<NetworkEvent>,
        connected: Arc<AtomicBool>,
        roster: Arc<RwLock<Vec<ParticipantView>>>,
        local_id: Arc<RwLock<Option<String>>>,
    ) -> Self {
        Self {
            tx,
            rx,
            connected,
            roster,
            local_id,
        }
    }

    /// Check if at least one peer data channel is open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn broadcast_player_update(&self, state: LocalPlayerState) -> io::Result<()> {
        self.send(NetworkCommand::PlayerUpdate(state))
    }

    pub fn broadcast_projectile_fired(&self, projectile: LocalProjectile) -> io::Result<()> {
        self.send(NetworkCommand::ProjectileFired(projectile))
    }

    pub fn broadcast_hit(
        &self,
        target_type: TargetType,
        target_id: impl Into<String>,
        damage: f32,
    ) -> io::Result<()> {
        self.send(NetworkCommand::Hit {
            target_type,
            target_id: target_id.into(),
            damage,
        })
    }

    /// Try to receive network events (non-blocking)
    pub fn try_recv_event(&self) -> Option<NetworkEvent> {
        self.rx.try_recv().ok()
    }

    /// Remote participants ordered by slot, as of the last network tick
    pub fn roster(&self) -> Vec<ParticipantView> {
        self.roster
            .read()
            .map(|roster| roster.clone())
            .unwrap_or_default()
    }

    pub fn local_id(&self) -> Option<String> {
        self.local_id.read().ok().and_then(|id| id.clone())
    }

    /// Gracefully disconnect from all peers and the signaling server
    pub fn disconnect(&self) -> io::Result<()> {
        self.send(NetworkCommand::Disconnect)
    }

    fn send(&self, cmd: NetworkCommand) -> io::Result<()> {
        self.tx
            .send(cmd)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (
        NetworkClient,
        tokio_mpsc::UnboundedReceiver<NetworkCommand>,
        mpsc::Sender<NetworkEvent>,
    ) {
        let (cmd_tx, cmd_rx) = tokio_mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel();
        let client = NetworkClient::new(
            cmd_tx,
            event_rx,
            Arc::new(AtomicBool::new(false)),
            Arc::new(RwLock::new(Vec::new())),
            Arc::new(RwLock::new(None)),
        );
        (client, cmd_rx, event_tx)
    }

    #[test]
    fn test_commands_reach_network_thread() {
        let (client, mut cmd_rx, _events) = client();

        client.broadcast_hit(TargetType::Player, "p2", 30.0).unwrap();
        client.disconnect().unwrap();

        match cmd_rx.try_recv().unwrap() {
            NetworkCommand::Hit { target_id, damage, .. } => {
                assert_eq!(target_id, "p2");
                assert_eq!(damage, 30.0);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(matches!(cmd_rx.try_recv().unwrap(), NetworkCommand::Disconnect));
    }

    #[test]
    fn test_send_after_thread_exit_reports_error() {
        let (client, cmd_rx, _events) = client();
        drop(cmd_rx);
        assert!(client.disconnect().is_err());
    }

    #[test]
    fn test_events_are_polled_without_blocking() {
        let (client, _cmds, events) = client();
        assert_eq!(client.try_recv_event(), None);

        events.send(NetworkEvent::ApplyDamage(5.0)).unwrap();
        assert_eq!(client.try_recv_event(), Some(NetworkEvent::ApplyDamage(5.0)));
    }
}
