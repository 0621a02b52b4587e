// Boundary between the multiplayer coordinator and the game simulation
// The coordinator never touches simulation-owned containers directly

use serde::{Deserialize, Serialize};

/// Opaque handle for an AI-controlled tank, issued by the simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AiHandle(pub u64);

/// Local player values read on every broadcast tick
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPlayerState {
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    pub health: f32,
    pub current_weapon: String,
}

impl Default for LocalPlayerState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            health: 1000.0,
            current_weapon: "Cannon".to_string(),
        }
    }
}

/// A projectile the local player just fired
#[derive(Debug, Clone, PartialEq)]
pub struct LocalProjectile {
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    pub weapon_name: String,
}

/// A projectile fired by a remote participant, to be played out locally.
/// Visual only: damage arrives separately as a hit report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteProjectile {
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    pub weapon_name: String,
    pub owner_id: String,
}

/// What the coordinator needs from the game simulation
pub trait SimulationPort {
    /// Current transform/health/weapon of the local player
    fn local_player(&self) -> LocalPlayerState;

    /// Create one AI-controlled enemy
    fn spawn_ai(&mut self) -> AiHandle;

    /// Remove a previously spawned AI enemy
    fn remove_ai(&mut self, handle: AiHandle);

    /// Apply damage reported against the local player
    fn apply_damage(&mut self, amount: f32);

    /// Instantiate a projectile fired by someone else
    fn spawn_remote_projectile(&mut self, projectile: RemoteProjectile);
}
