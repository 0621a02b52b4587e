// Logging setup for Arena Mesh
// Installs the tracing subscriber, optionally redirected to a debug log file via --debug

use anyhow::{anyhow, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;
use std::time::SystemTime;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_PATH: &str = "/tmp/arena-mesh-debug.log";

/// Initialize logging
///
/// # Arguments
/// * `enabled` - Whether debug logging should be enabled (controlled by --debug flag)
///
/// # Behavior
/// - `RUST_LOG` always wins when set
/// - If enabled=false: INFO and above to stderr
/// - If enabled=true: DEBUG and above, written to a freshly truncated log file
pub fn init(enabled: bool) -> Result<()> {
    let default_level = if enabled { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if !enabled {
        return tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"));
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(LOG_FILE_PATH)?;

    writeln!(file, "=== Arena Mesh Debug Log ===")?;
    writeln!(file, "Session started: {:?}", SystemTime::now())?;
    writeln!(file, "To monitor: tail -f {}", LOG_FILE_PATH)?;
    writeln!(file, "========================================\n")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
