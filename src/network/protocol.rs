// Arena mesh data-channel protocol
// JSON messages exchanged directly between peers during gameplay

use serde::{Deserialize, Serialize};

use super::simulation::{LocalPlayerState, LocalProjectile, RemoteProjectile};

/// Snapshot of a player's tank. Every field is optional on the wire so a
/// receiver only overwrites what was actually sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_weapon: Option<String>,
}

impl From<&LocalPlayerState> for PlayerData {
    fn from(state: &LocalPlayerState) -> Self {
        Self {
            x: Some(state.x),
            y: Some(state.y),
            rotation: Some(state.rotation),
            health: Some(state.health),
            current_weapon: Some(state.current_weapon.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectileData {
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    pub weapon_name: String,
    pub player_id: String,
}

impl ProjectileData {
    pub fn from_local(projectile: &LocalProjectile, player_id: &str) -> Self {
        Self {
            x: projectile.x,
            y: projectile.y,
            rotation: projectile.rotation,
            weapon_name: projectile.weapon_name.clone(),
            player_id: player_id.to_string(),
        }
    }

    pub fn into_remote(self) -> RemoteProjectile {
        RemoteProjectile {
            x: self.x,
            y: self.y,
            rotation: self.rotation,
            weapon_name: self.weapon_name,
            owner_id: self.player_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Player,
    Enemy,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitData {
    pub target_type: TargetType,
    pub target_id: String,
    pub damage: f32,
}

/// Messages exchanged between peers during gameplay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum GameMessage {
    /// Periodic tank snapshot (~10 Hz)
    PlayerUpdate { player_data: PlayerData },

    /// Someone fired; play it out, but damage only comes via PlayerHit
    ProjectileFired { projectile: ProjectileData },

    /// Sender's projectile struck `target_id`; only that target applies it
    PlayerHit { hit_data: HitData },
}

impl GameMessage {
    /// Serialize message to text for the data channel
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize message from a data channel frame
    pub fn from_text(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
