// Configuration module for Arena Mesh
// Handles loading and managing multiplayer configuration from TOML file

pub mod loader;
pub mod types;

pub use loader::{create_default_config, get_config_path, load_config, load_config_from};
pub use types::{Config, NetworkConfig, ServerConfig, SessionConfig};
