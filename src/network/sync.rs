// Game-state synchronization over the per-peer data channels
// Outbound fan-out with per-peer error isolation, inbound application to roster/simulation

use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::negotiation::{PeerRegistry, PeerTransport};
use super::protocol::{GameMessage, HitData, PlayerData, TargetType};
use super::roster::Roster;
use super::simulation::SimulationPort;

/// Limits player_update broadcasts to one per interval
#[derive(Debug, Clone)]
pub struct BroadcastGate {
    interval: Duration,
    last: Option<Instant>,
}

impl BroadcastGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True (and arms the gate) if a broadcast may go out at `now`
    pub fn try_pass(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Send one message to every peer whose channel is open.
/// A failing peer is logged and skipped. Returns the number of deliveries.
pub fn broadcast<T: PeerTransport>(peers: &mut PeerRegistry<T>, msg: &GameMessage) -> usize {
    let text = match msg.to_text() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode game message");
            return 0;
        }
    };

    let mut delivered = 0;
    for (peer_id, link) in peers.iter_mut() {
        if !link.transport.is_channel_open() {
            continue;
        }
        match link.transport.send(&text) {
            Ok(()) => delivered += 1,
            Err(e) => warn!(peer = %peer_id, error = %e, "error sending data"),
        }
    }
    delivered
}

/// What an inbound frame did, mostly for logging and tests
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEffect {
    PlayerUpdated,
    ProjectileSpawned,
    DamageApplied(f32),
    /// Valid message that did not concern us (unknown sender, hit for someone else)
    Ignored,
    /// Undecodable frame
    Discarded,
}

/// Apply one frame received from `from` on its data channel
pub fn apply_inbound(
    from: &str,
    text: &str,
    local_id: Option<&str>,
    roster: &mut Roster,
    sim: &mut dyn SimulationPort,
) -> InboundEffect {
    let msg = match GameMessage::from_text(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(peer = %from, error = %e, "error processing data channel message");
            return InboundEffect::Discarded;
        }
    };

    match msg {
        GameMessage::PlayerUpdate { player_data } => {
            if merge_player_data(roster, from, player_data) {
                InboundEffect::PlayerUpdated
            } else {
                debug!(peer = %from, "player_update for unknown participant, dropping");
                InboundEffect::Ignored
            }
        }
        GameMessage::ProjectileFired { projectile } => {
            sim.spawn_remote_projectile(projectile.into_remote());
            InboundEffect::ProjectileSpawned
        }
        GameMessage::PlayerHit { hit_data } => apply_hit(hit_data, local_id, sim),
    }
}

/// Overwrite only the fields present in the update. Never creates entries.
fn merge_player_data(roster: &mut Roster, from: &str, data: PlayerData) -> bool {
    let Some(participant) = roster.get_mut(from) else {
        return false;
    };

    if let Some(x) = data.x {
        participant.x = x;
    }
    if let Some(y) = data.y {
        participant.y = y;
    }
    if let Some(rotation) = data.rotation {
        participant.rotation = rotation;
    }
    if let Some(health) = data.health {
        participant.health = health;
    }
    if let Some(weapon) = data.current_weapon {
        participant.current_weapon = weapon;
    }
    true
}

/// The mesh is full-broadcast, so each client filters hits by target id
fn apply_hit(hit: HitData, local_id: Option<&str>, sim: &mut dyn SimulationPort) -> InboundEffect {
    let for_us = hit.target_type == TargetType::Player && local_id == Some(hit.target_id.as_str());
    if !for_us {
        return InboundEffect::Ignored;
    }
    sim.apply_damage(hit.damage);
    InboundEffect::DamageApplied(hit.damage)
}
