// Peer-mesh networking for Arena Mesh
// Signaling, per-peer WebRTC negotiation, roster/AI bookkeeping and game-state sync

pub mod client;
pub mod manager;
pub mod negotiation;
pub mod protocol;
pub mod roster;
pub mod rtc;
pub mod runtime;
pub mod signaling;
pub mod simulation;
pub mod sync;

#[cfg(test)]
mod testing;

pub use client::{ConnectionStatus, NetworkClient, NetworkCommand, NetworkEvent};
pub use manager::MultiplayerManager;
pub use protocol::{GameMessage, TargetType};
pub use roster::ParticipantView;
pub use simulation::{AiHandle, LocalPlayerState, LocalProjectile, RemoteProjectile, SimulationPort};

use std::io;
use std::sync::mpsc;
use tokio::sync::mpsc as tokio_mpsc;

use crate::config::Config;
use runtime::SharedState;

/// Initialize and start the network layer
/// Returns a NetworkClient handle for the game loop to communicate with
pub fn start_network(config: Config) -> io::Result<NetworkClient> {
    let (event_tx, event_rx) = mpsc::channel();
    let (cmd_tx, cmd_rx) = tokio_mpsc::unbounded_channel();

    let shared = SharedState::default();
    runtime::spawn_network_thread(config, event_tx, cmd_rx, shared.clone())?;

    Ok(NetworkClient::new(
        cmd_tx,
        event_rx,
        shared.connected,
        shared.roster,
        shared.local_id,
    ))
}
