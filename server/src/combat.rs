//! Combat and attack relay
//!
//! Validates attack, damage and respawn reports against registry state
//! before they are rebroadcast. Attacker identity always comes from the
//! authoritative connection, never from client-supplied data.

use crate::registry::{PlayerRegistry, RegistryEvent};
use log::{debug, info};
use shared::{AttackEvent, AttackPayload, Vec3, DEFAULT_ATTACK_DAMAGE, MAX_HEALTH};
use std::time::Instant;

/// Upper bound on a single reported hit; anything larger is a garbage or
/// hostile report and gets clamped.
const MAX_ATTACK_DAMAGE: i32 = MAX_HEALTH;

/// Fills defaults for missing or invalid payload fields. `fallback_position`
/// is the attacker's authoritative position.
pub fn sanitize_attack(payload: &AttackPayload, fallback_position: Vec3) -> AttackEvent {
    let position = payload
        .position
        .filter(Vec3::is_finite)
        .unwrap_or(fallback_position);
    let direction = payload
        .direction
        .filter(Vec3::is_finite)
        .unwrap_or(Vec3::new(0.0, 0.0, 1.0));
    let damage = payload
        .damage
        .unwrap_or(DEFAULT_ATTACK_DAMAGE)
        .clamp(0, MAX_ATTACK_DAMAGE);

    AttackEvent {
        position,
        direction,
        weapon: payload.weapon.unwrap_or_default(),
        damage,
        hit_targets: payload.hit_targets.clone(),
    }
}

/// Validates an attack report. Returns the sanitized event to rebroadcast,
/// stamped with the attacker's connection id, or `None` when the attacker
/// is unknown or not yet registered.
pub fn on_attack(
    registry: &mut PlayerRegistry,
    attacker_id: u32,
    payload: &AttackPayload,
    now: Instant,
) -> Option<(u32, AttackEvent)> {
    let record = registry.get(attacker_id)?;
    if !record.is_registered() {
        debug!("Dropping attack from unregistered connection {}", attacker_id);
        return None;
    }
    let event = sanitize_attack(payload, record.position);

    if let Some(record) = registry.get_mut(attacker_id) {
        record.last_activity = now;
    }
    Some((attacker_id, event))
}

/// Applies damage to a target. Health clamps at zero; the defeat event is
/// emitted exactly once per life, no matter how many redundant damage
/// reports arrive afterwards.
pub fn apply_damage(registry: &mut PlayerRegistry, target_id: u32, amount: i32) -> Vec<RegistryEvent> {
    let Some(record) = registry.get_mut(target_id) else {
        debug!("Dropping damage report for unknown target {}", target_id);
        return Vec::new();
    };
    if !record.is_registered() || amount <= 0 {
        return Vec::new();
    }

    let new_health = (record.health - amount).max(0);
    let mut events = Vec::new();

    if new_health != record.health {
        record.health = new_health;
        events.push(RegistryEvent::HealthChanged {
            id: target_id,
            health: new_health,
        });
    }

    if new_health == 0 && record.alive {
        record.alive = false;
        info!("Player '{}' (connection {}) defeated", record.name, target_id);
        events.push(RegistryEvent::Defeated { id: target_id });
    }

    events
}

/// Resets a player for a new life: full health, requested spawn position.
/// Independent of any client-local respawn timer.
pub fn respawn(registry: &mut PlayerRegistry, id: u32, position: Vec3, now: Instant) -> Vec<RegistryEvent> {
    let Some(record) = registry.get_mut(id) else {
        return Vec::new();
    };
    if !record.is_registered() {
        return Vec::new();
    }

    record.health = MAX_HEALTH;
    record.alive = true;
    if position.is_finite() {
        record.position = position;
    }
    record.last_activity = now;

    info!("Player '{}' (connection {}) respawned", record.name, id);
    vec![RegistryEvent::Respawned {
        id,
        position: record.position,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JoinAttributes;
    use shared::WeaponType;

    fn registry_with_player(id: u32) -> PlayerRegistry {
        let mut registry = PlayerRegistry::new();
        registry.register(
            id,
            JoinAttributes {
                name: format!("P{}", id),
                session_id: format!("s{}", id),
                position: Vec3::new(3.0, 0.0, 3.0),
                ..Default::default()
            },
            Instant::now(),
        );
        registry
    }

    #[test]
    fn test_sanitize_fills_defaults() {
        let event = sanitize_attack(&AttackPayload::default(), Vec3::new(1.0, 2.0, 3.0));

        assert_eq!(event.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(event.damage, DEFAULT_ATTACK_DAMAGE);
        assert_eq!(event.weapon, WeaponType::Sword);
        assert!(event.hit_targets.is_empty());
    }

    #[test]
    fn test_sanitize_rejects_non_finite_position() {
        let payload = AttackPayload {
            position: Some(Vec3::new(f32::NAN, 0.0, 0.0)),
            damage: Some(500),
            ..Default::default()
        };
        let event = sanitize_attack(&payload, Vec3::new(1.0, 0.0, 1.0));

        assert_eq!(event.position, Vec3::new(1.0, 0.0, 1.0));
        assert_eq!(event.damage, MAX_ATTACK_DAMAGE);
    }

    #[test]
    fn test_attack_stamped_with_authoritative_identity() {
        let mut registry = registry_with_player(1);

        let payload = AttackPayload {
            damage: Some(25),
            hit_targets: vec![2],
            ..Default::default()
        };
        let (attacker, event) = on_attack(&mut registry, 1, &payload, Instant::now()).unwrap();

        assert_eq!(attacker, 1);
        assert_eq!(event.damage, 25);
        // Missing position comes from the registry, not the payload.
        assert_eq!(event.position, Vec3::new(3.0, 0.0, 3.0));
    }

    #[test]
    fn test_attack_from_unknown_connection_dropped() {
        let mut registry = PlayerRegistry::new();
        assert!(on_attack(&mut registry, 9, &AttackPayload::default(), Instant::now()).is_none());
    }

    #[test]
    fn test_damage_clamps_at_zero() {
        let mut registry = registry_with_player(1);

        let events = apply_damage(&mut registry, 1, 150);
        assert_eq!(registry.get(1).unwrap().health, 0);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            RegistryEvent::HealthChanged { id: 1, health: 0 }
        ));
        assert!(matches!(events[1], RegistryEvent::Defeated { id: 1 }));
    }

    #[test]
    fn test_defeat_broadcast_exactly_once() {
        let mut registry = registry_with_player(1);

        let first = apply_damage(&mut registry, 1, 150);
        let second = apply_damage(&mut registry, 1, 50);

        let defeats = |events: &[RegistryEvent]| {
            events
                .iter()
                .filter(|e| matches!(e, RegistryEvent::Defeated { .. }))
                .count()
        };
        assert_eq!(defeats(&first), 1);
        assert_eq!(defeats(&second), 0);
        // Redundant damage at zero changes nothing and broadcasts nothing.
        assert!(second.is_empty());
    }

    #[test]
    fn test_negative_damage_ignored() {
        let mut registry = registry_with_player(1);
        let events = apply_damage(&mut registry, 1, -20);

        assert!(events.is_empty());
        assert_eq!(registry.get(1).unwrap().health, MAX_HEALTH);
    }

    #[test]
    fn test_respawn_resets_health_and_position() {
        let mut registry = registry_with_player(1);
        apply_damage(&mut registry, 1, 150);

        let events = respawn(&mut registry, 1, Vec3::new(0.0, 0.0, 0.0), Instant::now());

        assert_eq!(events.len(), 1);
        let record = registry.get(1).unwrap();
        assert_eq!(record.health, MAX_HEALTH);
        assert!(record.alive);
        assert_eq!(record.position, Vec3::new(0.0, 0.0, 0.0));

        // A defeat after respawn broadcasts again: once per defeat.
        let again = apply_damage(&mut registry, 1, 200);
        assert!(again
            .iter()
            .any(|e| matches!(e, RegistryEvent::Defeated { id: 1 })));
    }

    #[test]
    fn test_respawn_keeps_position_on_non_finite_request() {
        let mut registry = registry_with_player(1);
        let events = respawn(
            &mut registry,
            1,
            Vec3::new(f32::INFINITY, 0.0, 0.0),
            Instant::now(),
        );

        assert_eq!(events.len(), 1);
        assert_eq!(registry.get(1).unwrap().position, Vec3::new(3.0, 0.0, 3.0));
    }
}
