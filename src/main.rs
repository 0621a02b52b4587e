// Arena Mesh headless peer
// Drives a scripted tank through the multiplayer coordinator so a mesh can be
// exercised without the browser client

use anyhow::Result;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use arena_mesh::config::{self, Config};
use arena_mesh::debug;
use arena_mesh::network::{
    self, AiHandle, ConnectionStatus, LocalPlayerState, LocalProjectile, NetworkClient,
    NetworkEvent,
};

const TARGET_FPS: u64 = 60;
const FRAME_DURATION: Duration = Duration::from_millis(1000 / TARGET_FPS);
const FIRE_INTERVAL: Duration = Duration::from_secs(2);

// Scripted movement: a circle around the arena centre
const ORBIT_CENTER: (f32, f32) = (400.0, 300.0);
const ORBIT_RADIUS: f32 = 150.0;
const ORBIT_SPEED: f32 = 0.5; // radians per second

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage(&args[0]);
        return Ok(());
    }

    let debug_enabled = args.iter().any(|a| a == "--debug");
    debug::init(debug_enabled)?;

    let mut config = config::load_config().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });
    if let Some(server) = arg_value(&args, "--server") {
        config.network.signaling_server = server;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_ctrl_c_watcher(shutdown.clone())?;

    info!(server = %config.network.signaling_server, "starting headless peer");
    let client = network::start_network(config.clone())?;

    run_loop(&client, &config, &shutdown);

    client.disconnect()?;
    // Let the network thread send leave before the process exits
    std::thread::sleep(Duration::from_millis(300));
    info!("headless peer stopped");
    Ok(())
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn print_usage(program: &str) {
    println!("Arena Mesh headless peer");
    println!();
    println!("Usage:");
    println!("  {}                     Join using the configured signaling server", program);
    println!("  {} --server <url>      Override the signaling server", program);
    println!("  {} --debug             Write debug logs to {}", program, debug::LOG_FILE_PATH);
}

/// Ctrl-C sets the shutdown flag; the game loop polls it each frame
fn spawn_ctrl_c_watcher(shutdown: Arc<AtomicBool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            rt.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, shutting down");
                }
            });
            shutdown.store(true, Ordering::Relaxed);
        })?;
    Ok(())
}

/// Local stand-in for the game simulation
struct DemoState {
    tank: LocalPlayerState,
    enemies: HashSet<AiHandle>,
    angle: f32,
}

impl DemoState {
    fn new(config: &Config) -> Self {
        Self {
            tank: LocalPlayerState {
                health: config.session.default_health,
                current_weapon: config.session.default_weapon.clone(),
                ..LocalPlayerState::default()
            },
            enemies: HashSet::new(),
            angle: 0.0,
        }
    }

    fn advance(&mut self, dt: f32) {
        self.angle = (self.angle + ORBIT_SPEED * dt) % std::f32::consts::TAU;
        self.tank.x = ORBIT_CENTER.0 + ORBIT_RADIUS * self.angle.cos();
        self.tank.y = ORBIT_CENTER.1 + ORBIT_RADIUS * self.angle.sin();
        // Facing along the direction of travel
        self.tank.rotation = self.angle + std::f32::consts::FRAC_PI_2;
    }

    fn projectile(&self) -> LocalProjectile {
        LocalProjectile {
            x: self.tank.x,
            y: self.tank.y,
            rotation: self.tank.rotation,
            weapon_name: self.tank.current_weapon.clone(),
        }
    }
}

fn run_loop(client: &NetworkClient, config: &Config, shutdown: &AtomicBool) {
    let mut state = DemoState::new(config);
    let mut last_frame = Instant::now();
    let mut last_fire = Instant::now();
    let mut signaling_failed = false;

    while !shutdown.load(Ordering::Relaxed) {
        let frame_start = Instant::now();
        let dt = frame_start.duration_since(last_frame).as_secs_f32();
        last_frame = frame_start;

        while let Some(event) = client.try_recv_event() {
            handle_event(event, &mut state, &mut signaling_failed);
        }

        state.advance(dt);
        if client.broadcast_player_update(state.tank.clone()).is_err() {
            warn!("network thread is gone, continuing solo");
            break;
        }

        if client.is_connected() && last_fire.elapsed() >= FIRE_INTERVAL {
            last_fire = Instant::now();
            let _ = client.broadcast_projectile_fired(state.projectile());
        }

        let elapsed = frame_start.elapsed();
        if elapsed < FRAME_DURATION {
            std::thread::sleep(FRAME_DURATION - elapsed);
        }
    }

    info!(
        enemies = state.enemies.len(),
        remote_players = client.roster().len(),
        solo = signaling_failed,
        "leaving arena"
    );
}

fn handle_event(event: NetworkEvent, state: &mut DemoState, signaling_failed: &mut bool) {
    match event {
        NetworkEvent::ParticipantJoined {
            participant_id,
            slot,
            is_local,
        } => {
            if is_local {
                info!(id = %participant_id, slot, "we joined the room");
            } else {
                info!(id = %participant_id, slot, "player joined");
            }
        }
        NetworkEvent::ParticipantLeft { participant_id } => {
            info!(id = %participant_id, "player left");
        }
        NetworkEvent::SpawnAi(handle) => {
            state.enemies.insert(handle);
        }
        NetworkEvent::RemoveAi(handle) => {
            state.enemies.remove(&handle);
        }
        NetworkEvent::ApplyDamage(amount) => {
            state.tank.health = (state.tank.health - amount).max(0.0);
            info!(amount, health = state.tank.health, "took damage");
        }
        NetworkEvent::RemoteProjectile(projectile) => {
            info!(owner = %projectile.owner_id, weapon = %projectile.weapon_name, "incoming projectile");
        }
        NetworkEvent::Status(ConnectionStatus::Reconnecting { attempt, delay }) => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to signaling server");
        }
        NetworkEvent::Status(status) => info!(?status, "connection status"),
        NetworkEvent::SignalingFailed => {
            *signaling_failed = true;
            warn!("multiplayer unavailable, continuing solo until Ctrl-C");
        }
        NetworkEvent::Error(message) => warn!(%message, "network error"),
    }
}
