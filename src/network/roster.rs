// Session roster for the arena mesh
// Slot indices, colours, remote participant mirrors, and the AI population ledger

use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use super::simulation::{AiHandle, SimulationPort};
use crate::config::SessionConfig;

/// Used when the configured palette is shorter than max_players
const FALLBACK_COLOR: &str = "#FFFFFF";

/// A remote human player as last reported over the data channel
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: String,
    pub slot: usize,
    pub color: String,
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    pub health: f32,
    pub current_weapon: String,
}

/// Read-only copy handed to the renderer
pub type ParticipantView = Participant;

/// Outcome of trying to put someone on the roster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added(usize),
    Existing(usize),
    Full,
}

/// Fired for each participant that appears, including ourselves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinNotice {
    pub participant_id: String,
    pub slot: usize,
    pub is_local: bool,
}

type JoinObserver = Box<dyn FnMut(&JoinNotice) + Send>;
type LeaveObserver = Box<dyn FnMut(&str) + Send>;

/// AI tanks we asked the simulation to create, oldest first
#[derive(Debug, Default)]
pub struct AiLedger {
    spawned: VecDeque<AiHandle>,
}

impl AiLedger {
    pub fn count(&self) -> usize {
        self.spawned.len()
    }

    pub fn handles(&self) -> impl Iterator<Item = &AiHandle> {
        self.spawned.iter()
    }

    /// Spawn or retire AI tanks until exactly `target` exist.
    /// Excess is removed oldest-spawned first.
    pub fn reconcile(&mut self, target: usize, sim: &mut dyn SimulationPort) {
        while self.spawned.len() < target {
            let handle = sim.spawn_ai();
            self.spawned.push_back(handle);
        }
        while self.spawned.len() > target {
            if let Some(handle) = self.spawned.pop_front() {
                sim.remove_ai(handle);
            }
        }
    }
}

pub struct Roster {
    max_players: usize,
    palette: Vec<String>,
    default_health: f32,
    default_weapon: String,
    local_slot: Option<usize>,
    participants: HashMap<String, Participant>,
    ai: AiLedger,
    join_observers: Vec<JoinObserver>,
    leave_observers: Vec<LeaveObserver>,
}

impl Roster {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            max_players: config.max_players,
            palette: config.palette.clone(),
            default_health: config.default_health,
            default_weapon: config.default_weapon.clone(),
            local_slot: None,
            participants: HashMap::new(),
            ai: AiLedger::default(),
            join_observers: Vec::new(),
            leave_observers: Vec::new(),
        }
    }

    pub fn max_players(&self) -> usize {
        self.max_players
    }

    pub fn color_for(&self, slot: usize) -> String {
        self.palette
            .get(slot)
            .cloned()
            .unwrap_or_else(|| FALLBACK_COLOR.to_string())
    }

    pub fn local_slot(&self) -> Option<usize> {
        self.local_slot
    }

    pub fn local_color(&self) -> Option<String> {
        self.local_slot.map(|slot| self.color_for(slot))
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    /// Field updates only; entries are created through `admit`
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Participant> {
        self.participants.get_mut(id)
    }

    /// Remote participants ordered by slot
    pub fn snapshot(&self) -> Vec<ParticipantView> {
        let mut views: Vec<_> = self.participants.values().cloned().collect();
        views.sort_by_key(|p| p.slot);
        views
    }

    /// Remote participants plus ourselves
    pub fn human_count(&self) -> usize {
        self.participants.len() + 1
    }

    pub fn ai_target(&self, human_count: usize) -> usize {
        self.max_players.saturating_sub(human_count)
    }

    pub fn ai(&self) -> &AiLedger {
        &self.ai
    }

    pub fn on_participant_joined(&mut self, observer: impl FnMut(&JoinNotice) + Send + 'static) {
        self.join_observers.push(Box::new(observer));
    }

    pub fn on_participant_left(&mut self, observer: impl FnMut(&str) + Send + 'static) {
        self.leave_observers.push(Box::new(observer));
    }

    /// Take the slot after everyone already present
    pub fn assign_local_slot(&mut self, existing: usize, local_id: &str) -> usize {
        self.local_slot = Some(existing);
        info!(slot = existing, color = %self.color_for(existing), "assigned local player slot");
        self.notify_joined(JoinNotice {
            participant_id: local_id.to_string(),
            slot: existing,
            is_local: true,
        });
        existing
    }

    /// Lowest slot not held by us or a remote participant
    pub fn next_free_slot(&self) -> Option<usize> {
        (0..self.max_players).find(|slot| {
            self.local_slot != Some(*slot) && !self.participants.values().any(|p| p.slot == *slot)
        })
    }

    pub fn admit(&mut self, id: &str) -> Admission {
        if let Some(existing) = self.participants.get(id) {
            return Admission::Existing(existing.slot);
        }
        let Some(slot) = self.next_free_slot() else {
            return Admission::Full;
        };

        let participant = Participant {
            id: id.to_string(),
            slot,
            color: self.color_for(slot),
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            health: self.default_health,
            current_weapon: self.default_weapon.clone(),
        };
        debug!(peer = %id, slot, "participant added to roster");
        self.participants.insert(id.to_string(), participant);

        self.notify_joined(JoinNotice {
            participant_id: id.to_string(),
            slot,
            is_local: false,
        });
        Admission::Added(slot)
    }

    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        let removed = self.participants.remove(id)?;
        for observer in &mut self.leave_observers {
            observer(id);
        }
        Some(removed)
    }

    /// Bring the AI population in line with the given human count
    pub fn reconcile_ai(&mut self, human_count: usize, sim: &mut dyn SimulationPort) {
        let target = self.ai_target(human_count);
        debug!(human_count, target, current = self.ai.count(), "reconciling AI population");
        self.ai.reconcile(target, sim);
    }

    /// Forget every remote participant and our own slot; AI is untouched
    pub fn reset(&mut self) {
        let ids: Vec<String> = self.participants.keys().cloned().collect();
        for id in ids {
            self.remove(&id);
        }
        self.local_slot = None;
    }

    fn notify_joined(&mut self, notice: JoinNotice) {
        for observer in &mut self.join_observers {
            observer(&notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::FakeSimulation;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    fn roster() -> Roster {
        Roster::new(&SessionConfig::default())
    }

    fn occupied_slots(roster: &Roster) -> Vec<usize> {
        let mut slots: Vec<usize> = roster.snapshot().iter().map(|p| p.slot).collect();
        slots.extend(roster.local_slot());
        slots
    }

    #[test]
    fn test_slot_maps_to_palette_color() {
        let mut roster = roster();
        roster.assign_local_slot(2, "me");
        assert_eq!(roster.local_color().as_deref(), Some("#0000FF"));

        assert_eq!(roster.admit("a"), Admission::Added(0));
        assert_eq!(roster.admit("b"), Admission::Added(1));
        assert_eq!(roster.admit("c"), Admission::Added(3));

        for p in roster.snapshot() {
            assert_eq!(p.color, SessionConfig::default().palette[p.slot]);
        }
    }

    #[test]
    fn test_admit_is_idempotent() {
        let mut roster = roster();
        assert_eq!(roster.admit("a"), Admission::Added(0));
        assert_eq!(roster.admit("a"), Admission::Existing(0));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_full_roster_refuses() {
        let mut roster = roster();
        roster.assign_local_slot(0, "me");
        for id in ["a", "b", "c", "d"] {
            assert!(matches!(roster.admit(id), Admission::Added(_)));
        }
        assert_eq!(roster.admit("e"), Admission::Full);
        assert_eq!(roster.len(), 4);
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut roster = roster();
        roster.assign_local_slot(0, "me");
        roster.admit("a");
        roster.admit("b");
        roster.remove("a");
        assert_eq!(roster.admit("c"), Admission::Added(1));
        // b keeps its slot
        assert_eq!(roster.get("b").unwrap().slot, 2);
    }

    #[test]
    fn test_slots_stay_distinct_under_churn() {
        let mut roster = roster();
        roster.assign_local_slot(1, "me");

        let script = [
            ("join", "a"),
            ("join", "b"),
            ("leave", "a"),
            ("join", "c"),
            ("join", "d"),
            ("join", "e"),
            ("join", "f"),
            ("leave", "c"),
            ("leave", "zzz"),
            ("join", "g"),
            ("leave", "b"),
            ("join", "a"),
        ];

        for (op, id) in script {
            match op {
                "join" => {
                    roster.admit(id);
                }
                _ => {
                    roster.remove(id);
                }
            }
            let slots = occupied_slots(&roster);
            let unique: HashSet<_> = slots.iter().copied().collect();
            assert_eq!(unique.len(), slots.len(), "duplicate slot after {op} {id}");
            assert!(slots.iter().all(|s| *s < roster.max_players()));
        }
    }

    #[test]
    fn test_ai_target_for_every_human_count() {
        let roster = roster();
        for humans in 0..7 {
            assert_eq!(roster.ai_target(humans), 5usize.saturating_sub(humans));
        }
    }

    #[test]
    fn test_reconcile_spawns_and_retires_oldest_first() {
        let mut roster = roster();
        let mut sim = FakeSimulation::default();

        roster.reconcile_ai(1, &mut sim);
        assert_eq!(roster.ai().count(), 4);
        assert_eq!(sim.live_ai.len(), 4);

        roster.reconcile_ai(3, &mut sim);
        assert_eq!(roster.ai().count(), 2);
        assert_eq!(sim.removed_ai, vec![AiHandle(1), AiHandle(2)]);
        assert_eq!(sim.live_ai, vec![AiHandle(3), AiHandle(4)]);

        roster.reconcile_ai(6, &mut sim);
        assert_eq!(roster.ai().count(), 0);
        assert!(sim.live_ai.is_empty());

        roster.reconcile_ai(0, &mut sim);
        assert_eq!(roster.ai().count(), 5);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut roster = roster();
        let mut sim = FakeSimulation::default();

        roster.reconcile_ai(2, &mut sim);
        let spawned = sim.next_ai;
        roster.reconcile_ai(2, &mut sim);

        assert_eq!(sim.next_ai, spawned);
        assert!(sim.removed_ai.is_empty());
        assert_eq!(roster.ai().count(), 3);
    }

    #[test]
    fn test_observers_fire_for_local_and_remote() {
        let mut roster = roster();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let left = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        roster.on_participant_joined(move |notice| sink.lock().unwrap().push(notice.clone()));
        let sink = Arc::clone(&left);
        roster.on_participant_left(move |id| sink.lock().unwrap().push(id.to_string()));

        roster.assign_local_slot(1, "me");
        roster.admit("a");
        roster.admit("a");
        roster.remove("a");
        roster.remove("a");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_local);
        assert_eq!(seen[0].slot, 1);
        assert_eq!(seen[1].participant_id, "a");
        assert_eq!(seen[1].slot, 0);
        assert_eq!(*left.lock().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_reset_clears_people_not_ai() {
        let mut roster = roster();
        let mut sim = FakeSimulation::default();
        roster.assign_local_slot(0, "me");
        roster.admit("a");
        roster.reconcile_ai(2, &mut sim);

        roster.reset();

        assert!(roster.is_empty());
        assert_eq!(roster.local_slot(), None);
        assert_eq!(roster.ai().count(), 3);
    }

    #[test]
    fn test_short_palette_falls_back() {
        let config = SessionConfig {
            palette: vec!["#123456".to_string()],
            ..SessionConfig::default()
        };
        let roster = Roster::new(&config);
        assert_eq!(roster.color_for(0), "#123456");
        assert_eq!(roster.color_for(3), FALLBACK_COLOR);
    }
}
