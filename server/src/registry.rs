//! Server-authoritative player registry
//!
//! The registry is the single source of truth for player position, health
//! and metadata. All mutation goes through its contract methods; every
//! successful mutation yields a [`RegistryEvent`] that the network layer
//! turns into a broadcast. There is no polling path.

use log::{debug, info};
use rand::Rng;
use shared::{
    ActionFlags, CharacterType, LeaveReason, PlayerInfo, UpdateDelta, Vec3, WeaponType, MAX_HEALTH,
};
use std::collections::HashMap;
use std::time::Instant;

/// Lifecycle state distinguishing "connected" from "has explicitly joined".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Connection exists but no join has been accepted yet.
    Provisional,
    /// Fully joined; visible to other players.
    Registered,
}

/// Broadcast-worthy outcome of a registry mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Joined(PlayerInfo),
    Updated { id: u32, delta: UpdateDelta },
    Left {
        id: u32,
        name: String,
        reason: LeaveReason,
    },
    HealthChanged { id: u32, health: i32 },
    Defeated { id: u32 },
    Respawned { id: u32, position: Vec3 },
}

/// Attributes supplied with an explicit join request.
#[derive(Debug, Clone, Default)]
pub struct JoinAttributes {
    pub name: String,
    pub character: CharacterType,
    pub weapon: WeaponType,
    pub position: Vec3,
    pub session_id: String,
}

/// One player's authoritative state, keyed by connection identity.
#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub id: u32,
    pub name: String,
    pub session_id: String,
    pub character: CharacterType,
    pub weapon: WeaponType,
    pub position: Vec3,
    pub rotation: f32,
    pub flags: ActionFlags,
    pub health: i32,
    /// Cleared when health reaches zero; guards the single defeat broadcast.
    pub alive: bool,
    pub state: RegistrationState,
    /// Set when an explicit join was refused; blocks auto-promotion.
    pub auto_register_blocked: bool,
    /// Last *accepted* update. Heartbeats do not move this; they only keep
    /// the transport connection alive.
    pub last_activity: Instant,
}

impl PlayerRecord {
    fn provisional(id: u32, now: Instant) -> Self {
        Self {
            id,
            name: String::new(),
            session_id: String::new(),
            character: CharacterType::default(),
            weapon: WeaponType::default(),
            position: Vec3::default(),
            rotation: 0.0,
            flags: ActionFlags::default(),
            health: MAX_HEALTH,
            alive: true,
            state: RegistrationState::Provisional,
            auto_register_blocked: false,
            last_activity: now,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.state == RegistrationState::Registered
    }

    pub fn to_info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.id,
            name: self.name.clone(),
            session_id: self.session_id.clone(),
            character: self.character,
            weapon: self.weapon,
            position: self.position,
            rotation: self.rotation,
            health: self.health,
        }
    }
}

/// Sanitizes a display name: trimmed, or a generated fallback when empty.
pub fn sanitize_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        let suffix: String = rand::thread_rng()
            .sample_iter(rand::distributions::Alphanumeric)
            .take(4)
            .map(char::from)
            .collect();
        format!("Player_{}", suffix)
    } else {
        trimmed.to_string()
    }
}

/// Authoritative roster of all live connections and their player state.
///
/// Owned by the server's main loop; one writer at a time. Mutation methods
/// return the events to broadcast so that callers never reach into records
/// directly.
pub struct PlayerRegistry {
    records: HashMap<u32, PlayerRecord>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Creates a Provisional record for a fresh connection. No broadcast:
    /// nothing is visible to other players until registration.
    pub fn create_provisional(&mut self, id: u32, now: Instant) {
        self.records
            .entry(id)
            .or_insert_with(|| PlayerRecord::provisional(id, now));
    }

    /// Creates or promotes a record to Registered. Idempotent: re-registering
    /// an already-Registered connection updates attributes in place.
    ///
    /// A join carrying a non-finite position is rejected outright and bars
    /// the connection from auto-promotion; a later well-formed join lifts
    /// the bar.
    pub fn register(&mut self, id: u32, attrs: JoinAttributes, now: Instant) -> Vec<RegistryEvent> {
        let record = self
            .records
            .entry(id)
            .or_insert_with(|| PlayerRecord::provisional(id, now));

        if !attrs.position.is_finite() {
            debug!("Rejecting join with non-finite position from {}", id);
            record.auto_register_blocked = true;
            return Vec::new();
        }
        record.auto_register_blocked = false;

        let was_registered = record.is_registered();

        record.name = sanitize_name(&attrs.name);
        record.character = attrs.character;
        record.weapon = attrs.weapon;
        record.position = attrs.position;
        record.session_id = attrs.session_id;
        record.state = RegistrationState::Registered;
        record.last_activity = now;

        if was_registered {
            debug!("Re-register for connection {} updated in place", id);
            vec![RegistryEvent::Updated {
                id,
                delta: UpdateDelta {
                    position: Some(record.position),
                    name: Some(record.name.clone()),
                    weapon: Some(record.weapon),
                    ..Default::default()
                },
            }]
        } else {
            info!("Player '{}' registered on connection {}", record.name, id);
            vec![RegistryEvent::Joined(record.to_info())]
        }
    }

    /// Applies a partial state delta. Returns the events to broadcast, or an
    /// empty vector when the update was rejected (non-finite position,
    /// unknown connection). Rejection never mutates state.
    ///
    /// A Provisional record is auto-promoted to Registered on its first
    /// accepted update unless auto-registration was blocked earlier.
    pub fn apply_update(&mut self, id: u32, delta: &UpdateDelta, now: Instant) -> Vec<RegistryEvent> {
        let Some(record) = self.records.get_mut(&id) else {
            debug!("Dropping update for unknown connection {}", id);
            return Vec::new();
        };

        if let Some(pos) = &delta.position {
            if !pos.is_finite() {
                debug!("Dropping update with non-finite position from {}", id);
                return Vec::new();
            }
        }
        if let Some(rot) = delta.rotation {
            if !rot.is_finite() {
                debug!("Dropping update with non-finite rotation from {}", id);
                return Vec::new();
            }
        }

        let mut events = Vec::new();

        if !record.is_registered() {
            if record.auto_register_blocked {
                debug!("Auto-registration blocked for connection {}", id);
                return Vec::new();
            }
            record.state = RegistrationState::Registered;
            if record.name.is_empty() {
                record.name = sanitize_name("");
            }
            info!(
                "Auto-promoted connection {} to registered as '{}'",
                id, record.name
            );
            events.push(RegistryEvent::Joined(record.to_info()));
        }

        if let Some(pos) = delta.position {
            record.position = pos;
        }
        if let Some(rot) = delta.rotation {
            record.rotation = rot;
        }
        if let Some(flags) = delta.flags {
            record.flags = flags;
        }
        if let Some(weapon) = delta.weapon {
            record.weapon = weapon;
        }
        if let Some(name) = &delta.name {
            record.name = sanitize_name(name);
        }
        record.last_activity = now;

        events.push(RegistryEvent::Updated {
            id,
            delta: delta.clone(),
        });
        events
    }

    /// Deletes the record unconditionally. Used for graceful disconnects and
    /// by the ghost sweep. The connection id is never reused.
    pub fn remove(&mut self, id: u32, reason: LeaveReason) -> Option<RegistryEvent> {
        let record = self.records.remove(&id)?;
        info!(
            "Removed player '{}' (connection {}, {:?})",
            record.name, id, reason
        );
        // Provisional records were never announced, so there is nothing to
        // retract.
        if record.is_registered() {
            Some(RegistryEvent::Left {
                id,
                name: record.name,
                reason,
            })
        } else {
            None
        }
    }

    /// All Registered records except the caller's own. Answers
    /// "give me existing players" for snapshot requests.
    pub fn snapshot(&self, excluding: u32) -> HashMap<u32, PlayerInfo> {
        self.records
            .iter()
            .filter(|(id, record)| **id != excluding && record.is_registered())
            .map(|(id, record)| (*id, record.to_info()))
            .collect()
    }

    /// Registered connections whose session token matches, excluding one id.
    /// Used by the reconciler to find a reconnect's predecessor.
    pub fn find_by_session(&self, session_id: &str, excluding: u32) -> Vec<u32> {
        if session_id.is_empty() {
            return Vec::new();
        }
        self.records
            .iter()
            .filter(|(id, record)| {
                **id != excluding && record.is_registered() && record.session_id == session_id
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Groups of Registered connections sharing a display name.
    pub fn duplicate_names(&self) -> Vec<Vec<u32>> {
        let mut by_name: HashMap<&str, Vec<u32>> = HashMap::new();
        for (id, record) in &self.records {
            if record.is_registered() {
                by_name.entry(record.name.as_str()).or_default().push(*id);
            }
        }
        by_name.into_values().filter(|ids| ids.len() > 1).collect()
    }

    pub fn get(&self, id: u32) -> Option<&PlayerRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut PlayerRecord> {
        self.records.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(name: &str, session: &str) -> JoinAttributes {
        JoinAttributes {
            name: name.to_string(),
            session_id: session.to_string(),
            position: Vec3::new(1.0, 0.0, 1.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_creates_registered_record() {
        let mut registry = PlayerRegistry::new();
        let events = registry.register(1, attrs("Rin", "s1"), Instant::now());

        assert_eq!(events.len(), 1);
        match &events[0] {
            RegistryEvent::Joined(info) => {
                assert_eq!(info.id, 1);
                assert_eq!(info.name, "Rin");
                assert_eq!(info.health, MAX_HEALTH);
            }
            other => panic!("Expected Joined, got {:?}", other),
        }
        assert!(registry.get(1).unwrap().is_registered());
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = PlayerRegistry::new();
        registry.register(1, attrs("Rin", "s1"), Instant::now());
        let events = registry.register(1, attrs("Rin", "s1"), Instant::now());

        assert_eq!(registry.len(), 1);
        assert!(matches!(events[0], RegistryEvent::Updated { id: 1, .. }));
    }

    #[test]
    fn test_register_sanitizes_empty_name() {
        let mut registry = PlayerRegistry::new();
        registry.register(1, attrs("   ", "s1"), Instant::now());

        let name = &registry.get(1).unwrap().name;
        assert!(name.starts_with("Player_"), "got {}", name);
        assert!(name.len() > "Player_".len());
    }

    #[test]
    fn test_apply_update_rejects_non_finite_position() {
        let mut registry = PlayerRegistry::new();
        registry.register(1, attrs("Rin", "s1"), Instant::now());
        let before = registry.get(1).unwrap().position;

        let delta = UpdateDelta {
            position: Some(Vec3::new(f32::NAN, 0.0, 0.0)),
            ..Default::default()
        };
        let events = registry.apply_update(1, &delta, Instant::now());

        assert!(events.is_empty());
        assert_eq!(registry.get(1).unwrap().position, before);
    }

    #[test]
    fn test_apply_update_moves_position() {
        let mut registry = PlayerRegistry::new();
        registry.register(1, attrs("Rin", "s1"), Instant::now());

        let delta = UpdateDelta {
            position: Some(Vec3::new(5.0, 0.0, -3.0)),
            rotation: Some(0.7),
            ..Default::default()
        };
        let events = registry.apply_update(1, &delta, Instant::now());

        assert_eq!(events.len(), 1);
        assert_eq!(registry.get(1).unwrap().position, Vec3::new(5.0, 0.0, -3.0));
        assert_eq!(registry.get(1).unwrap().rotation, 0.7);
    }

    #[test]
    fn test_auto_promotion_on_first_update() {
        let mut registry = PlayerRegistry::new();
        registry.create_provisional(1, Instant::now());
        assert!(!registry.get(1).unwrap().is_registered());

        let delta = UpdateDelta {
            position: Some(Vec3::new(2.0, 0.0, 2.0)),
            ..Default::default()
        };
        let events = registry.apply_update(1, &delta, Instant::now());

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RegistryEvent::Joined(_)));
        assert!(matches!(events[1], RegistryEvent::Updated { .. }));
        assert!(registry.get(1).unwrap().is_registered());
        assert!(registry.get(1).unwrap().name.starts_with("Player_"));
    }

    #[test]
    fn test_rejected_join_blocks_auto_promotion() {
        let mut registry = PlayerRegistry::new();
        registry.create_provisional(1, Instant::now());

        let bad = JoinAttributes {
            position: Vec3::new(f32::NAN, 0.0, 0.0),
            ..attrs("Rin", "s1")
        };
        let events = registry.register(1, bad, Instant::now());
        assert!(events.is_empty());
        assert!(!registry.get(1).unwrap().is_registered());

        // The refused connection does not sneak in through auto-promotion.
        let delta = UpdateDelta {
            position: Some(Vec3::new(2.0, 0.0, 2.0)),
            ..Default::default()
        };
        let events = registry.apply_update(1, &delta, Instant::now());
        assert!(events.is_empty());
        assert!(!registry.get(1).unwrap().is_registered());
    }

    #[test]
    fn test_corrected_join_lifts_auto_promotion_bar() {
        let mut registry = PlayerRegistry::new();
        let bad = JoinAttributes {
            position: Vec3::new(f32::INFINITY, 0.0, 0.0),
            ..attrs("Rin", "s1")
        };
        assert!(registry.register(1, bad, Instant::now()).is_empty());

        let events = registry.register(1, attrs("Rin", "s1"), Instant::now());
        assert!(matches!(events[0], RegistryEvent::Joined(_)));
        assert!(registry.get(1).unwrap().is_registered());
        assert!(!registry.get(1).unwrap().auto_register_blocked);
    }

    #[test]
    fn test_remove_registered_emits_left() {
        let mut registry = PlayerRegistry::new();
        registry.register(1, attrs("Rin", "s1"), Instant::now());

        let event = registry.remove(1, LeaveReason::Disconnect);
        match event {
            Some(RegistryEvent::Left { id, name, reason }) => {
                assert_eq!(id, 1);
                assert_eq!(name, "Rin");
                assert_eq!(reason, LeaveReason::Disconnect);
            }
            other => panic!("Expected Left, got {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_provisional_is_silent() {
        let mut registry = PlayerRegistry::new();
        registry.create_provisional(1, Instant::now());

        assert!(registry.remove(1, LeaveReason::Disconnect).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_excludes_caller_and_provisional() {
        let mut registry = PlayerRegistry::new();
        registry.register(1, attrs("Rin", "s1"), Instant::now());
        registry.register(2, attrs("Kael", "s2"), Instant::now());
        registry.create_provisional(3, Instant::now());

        let snapshot = registry.snapshot(1);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&2));
        assert!(!snapshot.contains_key(&1));
        assert!(!snapshot.contains_key(&3));
    }

    #[test]
    fn test_find_by_session() {
        let mut registry = PlayerRegistry::new();
        registry.register(1, attrs("Rin", "s1"), Instant::now());
        registry.register(2, attrs("Kael", "s2"), Instant::now());

        assert_eq!(registry.find_by_session("s1", 99), vec![1]);
        assert!(registry.find_by_session("s1", 1).is_empty());
        assert!(registry.find_by_session("", 99).is_empty());
    }

    #[test]
    fn test_duplicate_names() {
        let mut registry = PlayerRegistry::new();
        registry.register(1, attrs("Rin", "s1"), Instant::now());
        registry.register(2, attrs("Rin", "s2"), Instant::now());
        registry.register(3, attrs("Kael", "s3"), Instant::now());

        let groups = registry.duplicate_names();
        assert_eq!(groups.len(), 1);
        let mut ids = groups[0].clone();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }
}
