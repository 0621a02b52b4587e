// Arena Mesh: peer-mesh multiplayer coordinator for a browser-compatible tank arena

pub mod config;
pub mod debug;
pub mod network;
pub mod rendezvous;
