// Room bookkeeping for the signaling server
// Players are packed into the first room with space; control messages are
// addressed by player id

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::network::signaling::SignalingMessage;

/// A room and its members in join order
struct Room {
    name: String,
    players: Vec<String>,
}

/// A connected player
struct Member {
    room: String,
    tx: mpsc::UnboundedSender<String>,
}

pub struct RoomDirectory {
    capacity: usize,
    rooms: Vec<Room>,
    members: HashMap<String, Member>,
}

/// Shared directory behind an async RwLock.
pub type SharedDirectory = Arc<RwLock<RoomDirectory>>;

impl RoomDirectory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rooms: Vec::new(),
            members: HashMap::new(),
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_of(&self, player_id: &str) -> Option<&str> {
        self.members.get(player_id).map(|m| m.room.as_str())
    }

    pub fn members_of(&self, room: &str) -> Vec<String> {
        self.rooms
            .iter()
            .find(|r| r.name == room)
            .map(|r| r.players.clone())
            .unwrap_or_default()
    }

    /// Place a player and announce them. Returns the room name.
    ///
    /// The joiner gets `room_info` listing everyone already there; every
    /// other member gets `new_player`.
    pub fn join(
        &mut self,
        player_id: &str,
        tx: mpsc::UnboundedSender<String>,
        now_secs: u64,
    ) -> String {
        if self.members.contains_key(player_id) {
            debug!(player = %player_id, "rejoin, dropping previous membership");
            self.leave(player_id);
        }

        let index = match self
            .rooms
            .iter()
            .position(|r| !r.players.is_empty() && r.players.len() < self.capacity)
        {
            Some(index) => index,
            None => {
                let prefix: String = player_id.chars().take(8).collect();
                let name = format!("game-{now_secs}-{prefix}");
                info!(room = %name, "creating room");
                self.rooms.push(Room {
                    name,
                    players: Vec::new(),
                });
                self.rooms.len() - 1
            }
        };

        let room = &mut self.rooms[index];
        let existing = room.players.clone();
        room.players.push(player_id.to_string());
        let room_name = room.name.clone();

        info!(player = %player_id, room = %room_name, existing = existing.len(), "player joined");
        send(&tx, &SignalingMessage::RoomInfo {
            players: existing.clone(),
        });
        self.members.insert(
            player_id.to_string(),
            Member {
                room: room_name.clone(),
                tx,
            },
        );

        let notice = SignalingMessage::NewPlayer {
            player_id: player_id.to_string(),
        };
        for other in &existing {
            self.send_to(other, &notice);
        }
        room_name
    }

    /// Remove a player and tell the rest of the room. Empty rooms are dropped.
    pub fn leave(&mut self, player_id: &str) -> Option<String> {
        let member = self.members.remove(player_id)?;

        let index = self.rooms.iter().position(|r| r.name == member.room)?;
        self.rooms[index].players.retain(|p| p != player_id);
        let remaining = self.rooms[index].players.clone();
        if remaining.is_empty() {
            info!(room = %member.room, "room empty, removing");
            self.rooms.remove(index);
        }

        info!(player = %player_id, room = %member.room, "player left");
        let notice = SignalingMessage::PlayerLeft {
            player_id: player_id.to_string(),
        };
        for other in &remaining {
            self.send_to(other, &notice);
        }
        Some(member.room)
    }

    /// Forward a raw control frame to the player it is addressed to
    pub fn forward(&self, to: &str, text: &str) -> bool {
        match self.members.get(to) {
            Some(member) => member.tx.send(text.to_string()).is_ok(),
            None => {
                warn!(target_player = %to, "target player not found");
                false
            }
        }
    }

    fn send_to(&self, player_id: &str, msg: &SignalingMessage) {
        if let Some(member) = self.members.get(player_id) {
            send(&member.tx, msg);
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, msg: &SignalingMessage) {
    match msg.to_json() {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => warn!(error = %e, "failed to encode signaling message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> SignalingMessage {
        let text = rx.try_recv().unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_first_joiner_creates_room() {
        let mut dir = RoomDirectory::new(5);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let room = dir.join("abcdefghijk", tx, 1700000000);

        assert_eq!(room, "game-1700000000-abcdefgh");
        assert_eq!(recv(&mut rx), SignalingMessage::RoomInfo { players: vec![] });
        assert_eq!(dir.room_count(), 1);
    }

    #[test]
    fn test_second_joiner_sees_first() {
        let mut dir = RoomDirectory::new(5);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        let room_a = dir.join("a", tx_a, 1);
        let room_b = dir.join("b", tx_b, 2);
        assert_eq!(room_a, room_b);

        recv(&mut rx_a); // own room_info
        assert_eq!(
            recv(&mut rx_a),
            SignalingMessage::NewPlayer {
                player_id: "b".to_string()
            }
        );
        assert_eq!(
            recv(&mut rx_b),
            SignalingMessage::RoomInfo {
                players: vec!["a".to_string()]
            }
        );
    }

    #[test]
    fn test_full_room_overflows_to_new_room() {
        let mut dir = RoomDirectory::new(2);
        let mut receivers = Vec::new();
        for id in ["a", "b", "c"] {
            let (tx, rx) = mpsc::unbounded_channel();
            receivers.push(rx);
            dir.join(id, tx, 10);
        }

        assert_eq!(dir.room_count(), 2);
        assert_ne!(dir.room_of("a"), dir.room_of("c"));
        assert_eq!(dir.members_of(dir.room_of("a").unwrap()).len(), 2);
    }

    #[test]
    fn test_leave_notifies_and_cleans_up() {
        let mut dir = RoomDirectory::new(5);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();
        let room = dir.join("a", tx_a, 1);
        dir.join("b", tx_b, 1);
        while rx_a.try_recv().is_ok() {}

        assert_eq!(dir.leave("b"), Some(room.clone()));
        assert_eq!(
            recv(&mut rx_a),
            SignalingMessage::PlayerLeft {
                player_id: "b".to_string()
            }
        );

        dir.leave("a");
        assert_eq!(dir.room_count(), 0);
        assert_eq!(dir.leave("a"), None);
    }

    #[test]
    fn test_forward_by_recipient() {
        let mut dir = RoomDirectory::new(5);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        dir.join("a", tx_a, 1);
        rx_a.try_recv().unwrap();

        let frame = r#"{"type":"offer","offer":{"type":"offer","sdp":"v=0"},"to":"a","from":"b"}"#;
        assert!(dir.forward("a", frame));
        assert_eq!(rx_a.try_recv().unwrap(), frame);
        assert!(!dir.forward("ghost", frame));
    }

    #[test]
    fn test_rejoin_moves_membership() {
        let mut dir = RoomDirectory::new(5);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        dir.join("a", tx1, 1);
        dir.join("a", tx2, 2);

        assert_eq!(dir.room_count(), 1);
        assert_eq!(recv(&mut rx2), SignalingMessage::RoomInfo { players: vec![] });
    }
}
