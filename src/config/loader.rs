// Configuration file loading and creation

use super::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Get the path to the configuration file
pub fn get_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("arena-mesh");

    // Create config directory if it doesn't exist
    fs::create_dir_all(&path).ok();

    path.push("config.toml");
    path
}

/// Load configuration from file, or create default if it doesn't exist
pub fn load_config() -> Result<Config> {
    load_config_from(&get_config_path())
}

/// Load configuration from an explicit path
pub fn load_config_from(config_path: &Path) -> Result<Config> {
    if config_path.exists() {
        let contents = fs::read_to_string(config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        Ok(parse_config(&contents))
    } else {
        create_default_config(config_path)?;
        Ok(Config::default())
    }
}

/// Parse a config file body, falling back to defaults when it is unreadable
pub fn parse_config(contents: &str) -> Config {
    match toml::from_str(contents) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "failed to parse config file, using default configuration");
            Config::default()
        }
    }
}

/// Create a default configuration file with helpful comments
pub fn create_default_config(path: &Path) -> Result<()> {
    let config = Config::default();
    let toml_string = toml::to_string_pretty(&config)?;

    let commented_toml = format!(
        "# Arena Mesh Configuration File\n\
         # Edit this file to point at your own signaling server or tune the mesh\n\
         # After editing, restart the game for changes to take effect\n\
         #\n\
         # [network] reconnect delay = min(reconnect_max_delay_ms, 2^attempt * reconnect_base_delay_ms)\n\
         # [session] palette needs one colour per player slot (max_players entries)\n\n\
         {}",
        toml_string
    );

    fs::write(path, commented_toml).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "created default config file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serialization() {
        let config = Config::default();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        let parsed: Config = toml::from_str(&toml_string).unwrap();

        assert_eq!(
            parsed.network.signaling_server,
            config.network.signaling_server
        );
        assert_eq!(
            parsed.network.max_reconnect_attempts,
            config.network.max_reconnect_attempts
        );
        assert_eq!(parsed.session.max_players, config.session.max_players);
        assert_eq!(parsed.session.palette, config.session.palette);
        assert_eq!(parsed.server.room_capacity, config.server.room_capacity);
    }

    #[test]
    fn test_partial_config_with_defaults() {
        let partial_toml = r#"
            [network]
            signaling_server = "wss://arena.example.com"
        "#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        assert_eq!(config.network.signaling_server, "wss://arena.example.com");

        // Everything else keeps its default
        assert_eq!(config.network.max_reconnect_attempts, 5);
        assert_eq!(config.network.broadcast_interval_ms, 100);
        assert_eq!(config.session.max_players, 5);
        assert_eq!(config.session.palette.len(), 5);
    }

    #[test]
    fn test_broken_config_falls_back_to_defaults() {
        let config = parse_config("[network\nsignaling_server = ");
        assert_eq!(config.network.signaling_server, "ws://127.0.0.1:8080");
    }

    #[test]
    fn test_missing_file_is_created() {
        let dir = std::env::temp_dir().join(format!("arena-mesh-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        let _ = fs::remove_file(&path);

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.session.max_players, 5);
        assert!(path.exists());

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# Arena Mesh Configuration File"));

        let _ = fs::remove_dir_all(&dir);
    }
}
