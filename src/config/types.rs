// Arena mesh configuration types
// All settings with defaults matching the multiplayer arena's tuned values

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    // Signaling server WebSocket URL
    pub signaling_server: String,

    // STUN server used to discover the public (server reflexive) candidate
    pub stun_server: String,

    // Reconnect attempts before the signaling failure becomes terminal
    pub max_reconnect_attempts: u32,

    // Backoff delay is min(max, 2^attempts * base)
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,

    // Give the retry budget back after every successful open
    pub reset_attempts_on_open: bool,

    // Interval between player_update broadcasts (100ms = 10 Hz)
    pub broadcast_interval_ms: u64,

    // Delay between join and the keepalive ping
    pub ping_delay_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_server: "ws://127.0.0.1:8080".to_string(),
            stun_server: "stun.l.google.com:19302".to_string(),
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            reset_attempts_on_open: true,
            broadcast_interval_ms: 100,
            ping_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    // Humans plus AI tanks always add up to this
    pub max_players: usize,

    // One colour per slot index, slot i uses palette[i]
    pub palette: Vec<String>,

    // Values a remote participant starts with before its first update
    pub default_health: f32,
    pub default_weapon: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_players: 5,
            palette: vec![
                "#FF0000".to_string(), // Red (Player 1)
                "#00FF00".to_string(), // Green (Player 2)
                "#0000FF".to_string(), // Blue (Player 3)
                "#FFFF00".to_string(), // Yellow (Player 4)
                "#FF00FF".to_string(), // Magenta (Player 5)
            ],
            default_health: 1000.0,
            default_weapon: "Cannon".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    // Address the signaling server listens on
    pub bind_addr: String,

    // Players per room before a new room is opened
    pub room_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            room_capacity: 5,
        }
    }
}
