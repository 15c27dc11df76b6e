//! Client-side position synchronization
//!
//! Turns discrete authoritative updates into visually continuous motion.
//! Each remote player has one shadow holding the latest authoritative
//! target and the currently rendered position; `tick` blends one toward
//! the other over the interpolation window supplied by the quality
//! monitor. Large jumps (teleports, respawns, first sight) snap instead of
//! sliding across the map.

use log::{debug, info};
use shared::{PlayerInfo, UpdateDelta, Vec3, SNAP_EPSILON, SNAP_THRESHOLD};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Seam to whatever owns the visual representation of remote players.
/// Rendering is an external collaborator; the synchronizer only tells it
/// what exists and where it is, keyed by connection id so no scene-graph
/// scanning is ever needed.
pub trait SceneSink {
    fn spawn(&mut self, id: u32, player: &PlayerInfo);
    fn move_to(&mut self, id: u32, position: Vec3, rotation: f32);
    fn despawn(&mut self, id: u32, name: &str);
    fn health_changed(&mut self, id: u32, health: i32);
    fn defeated(&mut self, id: u32);
}

/// Sink for headless operation: events go to the log and nowhere else.
pub struct LogSink;

impl SceneSink for LogSink {
    fn spawn(&mut self, id: u32, player: &PlayerInfo) {
        info!("Remote player '{}' appeared (connection {})", player.name, id);
    }

    fn move_to(&mut self, _id: u32, _position: Vec3, _rotation: f32) {}

    fn despawn(&mut self, id: u32, name: &str) {
        info!("Remote player '{}' left (connection {})", name, id);
    }

    fn health_changed(&mut self, id: u32, health: i32) {
        debug!("Remote player {} health now {}", id, health);
    }

    fn defeated(&mut self, id: u32) {
        info!("Remote player {} defeated", id);
    }
}

/// Locally-owned mirror of one remote player.
#[derive(Debug, Clone)]
pub struct RemotePlayerShadow {
    pub name: String,
    pub health: i32,
    /// Latest authoritative position.
    pub target_position: Vec3,
    /// Position currently shown; converges toward the target.
    pub rendered_position: Vec3,
    /// Rendered position captured when the last update arrived; the
    /// interpolation start point.
    start_position: Vec3,
    pub target_rotation: f32,
    pub rendered_rotation: f32,
    start_rotation: f32,
    /// Authoritative timestamp of the last applied update. Anything older
    /// is discarded rather than allowed to regress the target.
    pub last_server_timestamp: u64,
    /// De-dup token of the last applied update; redelivered broadcasts
    /// carry one we have already seen.
    pub last_update_id: u64,
    /// Local arrival time of the last applied update; interpolation clock.
    received_at: Instant,
    /// True once rendered has reached target exactly.
    settled: bool,
}

impl RemotePlayerShadow {
    fn from_info(info: &PlayerInfo, now: Instant) -> Self {
        Self {
            name: info.name.clone(),
            health: info.health,
            target_position: info.position,
            rendered_position: info.position,
            start_position: info.position,
            target_rotation: info.rotation,
            rendered_rotation: info.rotation,
            start_rotation: info.rotation,
            last_server_timestamp: 0,
            last_update_id: 0,
            received_at: now,
            settled: true,
        }
    }

    /// Returns true when the update snapped instead of starting a glide.
    fn retarget(&mut self, position: Vec3, rotation: f32, now: Instant, snap_threshold: f32) -> bool {
        let snapped = self.rendered_position.distance(&position) > snap_threshold;
        if snapped {
            // Teleport/respawn/large correction: sliding there over the
            // interpolation window would look worse than the jump.
            self.rendered_position = position;
            self.rendered_rotation = rotation;
            self.settled = true;
        } else {
            self.settled = false;
        }
        self.start_position = self.rendered_position;
        self.start_rotation = self.rendered_rotation;
        self.target_position = position;
        self.target_rotation = rotation;
        self.received_at = now;
        snapped
    }
}

/// Applies authoritative updates to local shadows and interpolates them.
pub struct PositionSynchronizer {
    shadows: HashMap<u32, RemotePlayerShadow>,
    snap_threshold: f32,
}

impl PositionSynchronizer {
    pub fn new() -> Self {
        Self::with_snap_threshold(SNAP_THRESHOLD)
    }

    pub fn with_snap_threshold(snap_threshold: f32) -> Self {
        Self {
            shadows: HashMap::new(),
            snap_threshold,
        }
    }

    /// Replaces the known remote set with an authoritative snapshot.
    /// Players missing from the snapshot are despawned; new ones appear at
    /// their reported position (first sight is always a snap). Players
    /// already known are retargeted from the snapshot, since their shadows
    /// may be arbitrarily stale after a reconnect.
    pub fn apply_snapshot(
        &mut self,
        players: &HashMap<u32, PlayerInfo>,
        now: Instant,
        sink: &mut dyn SceneSink,
    ) {
        let stale: Vec<u32> = self
            .shadows
            .keys()
            .filter(|id| !players.contains_key(id))
            .copied()
            .collect();
        for id in stale {
            if let Some(shadow) = self.shadows.remove(&id) {
                sink.despawn(id, &shadow.name);
            }
        }

        for (id, info) in players {
            if !self.shadows.contains_key(id) {
                sink.spawn(*id, info);
                self.shadows
                    .insert(*id, RemotePlayerShadow::from_info(info, now));
                continue;
            }
            if let Some(shadow) = self.shadows.get_mut(id) {
                shadow.name = info.name.clone();
                if shadow.health != info.health {
                    shadow.health = info.health;
                    sink.health_changed(*id, info.health);
                }
                if shadow.retarget(info.position, info.rotation, now, self.snap_threshold) {
                    sink.move_to(*id, shadow.rendered_position, shadow.rendered_rotation);
                }
            }
        }
    }

    pub fn on_player_joined(&mut self, info: &PlayerInfo, now: Instant, sink: &mut dyn SceneSink) {
        // A rejoin after reconnect can race the leave broadcast; replacing
        // the shadow keeps exactly one avatar either way.
        if self.shadows.remove(&info.id).is_some() {
            sink.despawn(info.id, &info.name);
        }
        sink.spawn(info.id, info);
        self.shadows
            .insert(info.id, RemotePlayerShadow::from_info(info, now));
    }

    /// Applies one authoritative delta. Returns false when the update was
    /// discarded: unknown player, older timestamp than what we already
    /// have, or a redelivered `update_id`.
    pub fn on_authoritative_update(
        &mut self,
        id: u32,
        delta: &UpdateDelta,
        server_timestamp: u64,
        update_id: u64,
        now: Instant,
        sink: &mut dyn SceneSink,
    ) -> bool {
        let Some(shadow) = self.shadows.get_mut(&id) else {
            debug!("Dropping update for unknown remote player {}", id);
            return false;
        };

        if server_timestamp < shadow.last_server_timestamp {
            debug!(
                "Discarding out-of-order update for {} ({} < {})",
                id, server_timestamp, shadow.last_server_timestamp
            );
            return false;
        }
        if update_id != 0 && update_id <= shadow.last_update_id {
            debug!("Discarding redelivered update {} for {}", update_id, id);
            return false;
        }
        shadow.last_server_timestamp = server_timestamp;
        shadow.last_update_id = update_id;

        if let Some(name) = &delta.name {
            shadow.name = name.clone();
        }
        if let Some(position) = delta.position {
            let rotation = delta.rotation.unwrap_or(shadow.target_rotation);
            if shadow.retarget(position, rotation, now, self.snap_threshold) {
                // A settled shadow never ticks, so the jump is published
                // here instead.
                sink.move_to(id, shadow.rendered_position, shadow.rendered_rotation);
            }
        } else if let Some(rotation) = delta.rotation {
            shadow.target_rotation = rotation;
        }
        true
    }

    pub fn on_player_left(&mut self, id: u32, sink: &mut dyn SceneSink) {
        if let Some(shadow) = self.shadows.remove(&id) {
            sink.despawn(id, &shadow.name);
        }
    }

    pub fn on_health_changed(&mut self, id: u32, health: i32, sink: &mut dyn SceneSink) {
        if let Some(shadow) = self.shadows.get_mut(&id) {
            shadow.health = health;
            sink.health_changed(id, health);
        }
    }

    pub fn on_defeated(&mut self, id: u32, sink: &mut dyn SceneSink) {
        if self.shadows.contains_key(&id) {
            sink.defeated(id);
        }
    }

    /// Respawn is always a teleport, regardless of distance.
    pub fn on_respawned(&mut self, id: u32, position: Vec3, now: Instant, sink: &mut dyn SceneSink) {
        if let Some(shadow) = self.shadows.get_mut(&id) {
            shadow.health = shared::MAX_HEALTH;
            shadow.rendered_position = position;
            shadow.start_position = position;
            shadow.target_position = position;
            shadow.received_at = now;
            shadow.settled = true;
            sink.move_to(id, position, shadow.rendered_rotation);
            sink.health_changed(id, shared::MAX_HEALTH);
        }
    }

    /// Advances every shadow toward its target. `window` comes from the
    /// quality monitor and may change between ticks; the factor is simply
    /// recomputed against the new window. Visual attachments move in the
    /// same pass, so they can never lag the avatar.
    pub fn tick(&mut self, now: Instant, window: Duration, sink: &mut dyn SceneSink) {
        for (id, shadow) in &mut self.shadows {
            if shadow.settled {
                continue;
            }

            let elapsed = now.saturating_duration_since(shadow.received_at);
            let factor = if window.is_zero() {
                1.0
            } else {
                (elapsed.as_secs_f32() / window.as_secs_f32()).min(1.0)
            };

            shadow.rendered_position = shadow.start_position.lerp(&shadow.target_position, factor);
            shadow.rendered_rotation =
                shadow.start_rotation + (shadow.target_rotation - shadow.start_rotation) * factor;

            if factor >= 1.0 {
                // Final exact snap clears any float residue.
                if shadow.rendered_position.distance(&shadow.target_position) > SNAP_EPSILON {
                    shadow.rendered_position = shadow.target_position;
                }
                shadow.rendered_rotation = shadow.target_rotation;
                shadow.settled = true;
            }

            sink.move_to(*id, shadow.rendered_position, shadow.rendered_rotation);
        }
    }

    pub fn get(&self, id: u32) -> Option<&RemotePlayerShadow> {
        self.shadows.get(&id)
    }

    pub fn len(&self) -> usize {
        self.shadows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shadows.is_empty()
    }

    /// Drops all shadows, despawning their visuals. Used when the session
    /// reconnects and will receive a fresh snapshot.
    pub fn clear(&mut self, sink: &mut dyn SceneSink) {
        for (id, shadow) in self.shadows.drain() {
            sink.despawn(id, &shadow.name);
        }
    }
}

impl Default for PositionSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}
