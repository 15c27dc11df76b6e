use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MAX_HEALTH: i32 = 100;
pub const DEFAULT_ATTACK_DAMAGE: i32 = 10;
pub const SNAP_THRESHOLD: f32 = 5.0;
pub const SNAP_EPSILON: f32 = 0.01;
pub const LATENCY_SAMPLE_CAPACITY: usize = 50;
pub const DEFAULT_INTERPOLATION_MS: u64 = 100;
pub const HEARTBEAT_MISS_LIMIT: u32 = 3;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const GHOST_GRACE_SECS: u64 = 10;
pub const GHOST_INACTIVITY_SECS: u64 = 60;
pub const GHOST_HARD_CEILING_SECS: u64 = 120;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// True only if every component is a real number (no NaN/Infinity).
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn distance(&self, other: &Vec3) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Linear blend from `self` toward `target` by `t` in [0, 1].
    pub fn lerp(&self, target: &Vec3, t: f32) -> Vec3 {
        Vec3 {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
            z: self.z + (target.z - self.z) * t,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CharacterType {
    #[default]
    Knight,
    Ranger,
    Mage,
    Rogue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WeaponType {
    #[default]
    Sword,
    Bow,
    Staff,
    Dagger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActionFlags {
    pub moving: bool,
    pub attacking: bool,
}

/// Wire form of a registered player, as broadcast to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: u32,
    pub name: String,
    pub session_id: String,
    pub character: CharacterType,
    pub weapon: WeaponType,
    pub position: Vec3,
    pub rotation: f32,
    pub health: i32,
}

/// Explicit partial state update. Every recognized field is listed here;
/// anything else a client sends simply has nowhere to land.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDelta {
    pub position: Option<Vec3>,
    pub rotation: Option<f32>,
    pub flags: Option<ActionFlags>,
    pub weapon: Option<WeaponType>,
    pub name: Option<String>,
}

impl UpdateDelta {
    pub fn is_empty(&self) -> bool {
        self.position.is_none()
            && self.rotation.is_none()
            && self.flags.is_none()
            && self.weapon.is_none()
            && self.name.is_none()
    }
}

/// Raw attack report as sent by a client. Fields are optional because the
/// server fills defaults rather than trusting the sender.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttackPayload {
    pub position: Option<Vec3>,
    pub direction: Option<Vec3>,
    pub weapon: Option<WeaponType>,
    pub damage: Option<i32>,
    pub hit_targets: Vec<u32>,
}

/// Sanitized attack as rebroadcast by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackEvent {
    pub position: Vec3,
    pub direction: Vec3,
    pub weapon: WeaponType,
    pub damage: i32,
    pub hit_targets: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    Disconnect,
    TransportTimeout,
    GhostInactivity,
    DuplicateName,
    SessionReclaimed,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Client -> server
    Join {
        name: String,
        character: CharacterType,
        weapon: WeaponType,
        position: Vec3,
        session_id: String,
    },
    PositionUpdate {
        position: Vec3,
        rotation: f32,
        flags: ActionFlags,
        weapon: WeaponType,
        client_timestamp: u64,
    },
    Attack {
        payload: AttackPayload,
    },
    DamageReport {
        target_id: u32,
        amount: i32,
    },
    RespawnRequest {
        position: Vec3,
    },
    RequestSnapshot,
    HeartbeatPing {
        client_timestamp: u64,
    },
    Disconnect,

    // Server -> client
    ConnectAck {
        client_id: u32,
        server_time: u64,
        active_ids: Vec<u32>,
    },
    SnapshotResponse {
        players: HashMap<u32, PlayerInfo>,
    },
    PlayerJoined {
        player: PlayerInfo,
    },
    PlayerUpdated {
        id: u32,
        delta: UpdateDelta,
        server_timestamp: u64,
        update_id: u64,
    },
    PlayerLeft {
        id: u32,
        name: String,
        reason: LeaveReason,
    },
    AttackBroadcast {
        attacker_id: u32,
        attack: AttackEvent,
    },
    HealthChanged {
        id: u32,
        health: i32,
    },
    PlayerDefeated {
        id: u32,
    },
    PlayerRespawned {
        id: u32,
        position: Vec3,
    },
    HeartbeatPong {
        client_timestamp: u64,
        server_timestamp: u64,
    },
    ServerClose {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_vec3_finite_check() {
        assert!(Vec3::new(1.0, 2.0, 3.0).is_finite());
        assert!(!Vec3::new(f32::NAN, 0.0, 0.0).is_finite());
        assert!(!Vec3::new(0.0, f32::INFINITY, 0.0).is_finite());
        assert!(!Vec3::new(0.0, 0.0, f32::NEG_INFINITY).is_finite());
    }

    #[test]
    fn test_vec3_distance() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 4.0, 0.0);
        assert_approx_eq!(a.distance(&b), 5.0, 0.0001);
        assert_approx_eq!(b.distance(&a), 5.0, 0.0001);
    }

    #[test]
    fn test_vec3_lerp() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(10.0, -10.0, 4.0);

        let mid = a.lerp(&b, 0.5);
        assert_approx_eq!(mid.x, 5.0, 0.0001);
        assert_approx_eq!(mid.y, -5.0, 0.0001);
        assert_approx_eq!(mid.z, 2.0, 0.0001);

        let end = a.lerp(&b, 1.0);
        assert_approx_eq!(end.x, b.x, 0.0001);

        let start = a.lerp(&b, 0.0);
        assert_approx_eq!(start.x, a.x, 0.0001);
    }

    #[test]
    fn test_update_delta_is_empty() {
        assert!(UpdateDelta::default().is_empty());

        let delta = UpdateDelta {
            rotation: Some(1.5),
            ..Default::default()
        };
        assert!(!delta.is_empty());
    }

    #[test]
    fn test_ghost_threshold_ordering() {
        assert!(GHOST_GRACE_SECS < GHOST_INACTIVITY_SECS);
        assert!(GHOST_INACTIVITY_SECS < GHOST_HARD_CEILING_SECS);
    }

    #[test]
    fn test_packet_serialization_join() {
        let packet = Packet::Join {
            name: "Rin".to_string(),
            character: CharacterType::Mage,
            weapon: WeaponType::Staff,
            position: Vec3::new(1.0, 0.0, -2.0),
            session_id: "s1".to_string(),
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Join {
                name,
                character,
                weapon,
                position,
                session_id,
            } => {
                assert_eq!(name, "Rin");
                assert_eq!(character, CharacterType::Mage);
                assert_eq!(weapon, WeaponType::Staff);
                assert_eq!(position, Vec3::new(1.0, 0.0, -2.0));
                assert_eq!(session_id, "s1");
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_position_update() {
        let packet = Packet::PositionUpdate {
            position: Vec3::new(4.0, 0.0, 9.0),
            rotation: 1.57,
            flags: ActionFlags {
                moving: true,
                attacking: false,
            },
            weapon: WeaponType::Bow,
            client_timestamp: 123456,
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::PositionUpdate {
                position,
                rotation,
                flags,
                weapon,
                client_timestamp,
            } => {
                assert_eq!(position, Vec3::new(4.0, 0.0, 9.0));
                assert_approx_eq!(rotation, 1.57, 0.0001);
                assert!(flags.moving);
                assert!(!flags.attacking);
                assert_eq!(weapon, WeaponType::Bow);
                assert_eq!(client_timestamp, 123456);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_snapshot() {
        let mut players = HashMap::new();
        players.insert(
            7,
            PlayerInfo {
                id: 7,
                name: "Rin".to_string(),
                session_id: "s1".to_string(),
                character: CharacterType::Knight,
                weapon: WeaponType::Sword,
                position: Vec3::default(),
                rotation: 0.0,
                health: MAX_HEALTH,
            },
        );

        let packet = Packet::SnapshotResponse { players };
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::SnapshotResponse { players } => {
                assert_eq!(players.len(), 1);
                assert_eq!(players.get(&7).unwrap().name, "Rin");
                assert_eq!(players.get(&7).unwrap().health, MAX_HEALTH);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_attack_payload_defaults() {
        let payload = AttackPayload::default();
        assert!(payload.position.is_none());
        assert!(payload.damage.is_none());
        assert!(payload.hit_targets.is_empty());
    }
}
