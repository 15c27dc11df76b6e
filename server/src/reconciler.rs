//! Ghost and identity reconciliation
//!
//! Keeps the registry free of entries that no longer correspond to a live,
//! intended player without evicting players who are merely idle. Three
//! signals feed the sweep: record age, the transport layer's active
//! connection snapshot, and display-name collisions. Session reclamation
//! handles the common refresh/reconnect case directly instead of waiting
//! for a sweep.

use crate::registry::{PlayerRegistry, RegistryEvent};
use log::{info, warn};
use shared::{LeaveReason, GHOST_GRACE_SECS, GHOST_HARD_CEILING_SECS, GHOST_INACTIVITY_SECS};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Timing policy for ghost detection. Invariant: grace < inactivity < ceiling.
#[derive(Debug, Clone, Copy)]
pub struct GhostPolicy {
    /// T0: a record updated within this window is never a candidate,
    /// regardless of any other signal.
    pub grace: Duration,
    /// T1: older than this and absent from the active-connection snapshot
    /// makes a record a ghost candidate.
    pub inactivity: Duration,
    /// T2: older than this is removed unconditionally, covering transport
    /// layers that falsely report a connection as still alive.
    pub hard_ceiling: Duration,
}

impl GhostPolicy {
    pub fn new(grace: Duration, inactivity: Duration, hard_ceiling: Duration) -> Self {
        assert!(
            grace < inactivity && inactivity < hard_ceiling,
            "ghost policy requires grace < inactivity < hard_ceiling"
        );
        Self {
            grace,
            inactivity,
            hard_ceiling,
        }
    }
}

impl Default for GhostPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(GHOST_GRACE_SECS),
            Duration::from_secs(GHOST_INACTIVITY_SECS),
            Duration::from_secs(GHOST_HARD_CEILING_SECS),
        )
    }
}

pub struct GhostReconciler {
    policy: GhostPolicy,
}

impl GhostReconciler {
    pub fn new(policy: GhostPolicy) -> Self {
        Self { policy }
    }

    /// Removes lingering records left by a predecessor connection of the
    /// same logical session. Called when a join carrying a previously-seen
    /// session token arrives; this is the primary defense against duplicate
    /// avatars after a refresh or reconnect.
    pub fn reclaim_session(
        &self,
        registry: &mut PlayerRegistry,
        session_id: &str,
        new_id: u32,
    ) -> Vec<RegistryEvent> {
        let stale = registry.find_by_session(session_id, new_id);
        let mut events = Vec::new();
        for id in stale {
            info!(
                "Reclaiming session '{}': removing predecessor connection {}",
                session_id, id
            );
            if let Some(event) = registry.remove(id, LeaveReason::SessionReclaimed) {
                events.push(event);
            }
        }
        events
    }

    /// One sweep pass over the registry. Idempotent: running it twice with
    /// the same inputs removes nothing the second time.
    pub fn sweep(
        &self,
        registry: &mut PlayerRegistry,
        active_connections: &HashSet<u32>,
        now: Instant,
    ) -> Vec<RegistryEvent> {
        let mut doomed: Vec<(u32, LeaveReason)> = Vec::new();

        for id in registry.ids() {
            let Some(record) = registry.get(id) else {
                continue;
            };
            let age = now.saturating_duration_since(record.last_activity);

            if age <= self.policy.grace {
                continue;
            }

            if age > self.policy.hard_ceiling {
                // The transport may still claim this connection is alive;
                // past the ceiling we stop believing it.
                doomed.push((id, LeaveReason::GhostInactivity));
            } else if age > self.policy.inactivity && !active_connections.contains(&id) {
                doomed.push((id, LeaveReason::GhostInactivity));
            }
        }

        // Duplicate display names: the stalest record of each group is a
        // ghost candidate immediately, bypassing the inactivity threshold
        // (but never the grace window).
        for group in registry.duplicate_names() {
            let mut aged: Vec<(u32, Instant)> = group
                .iter()
                .filter_map(|id| registry.get(*id).map(|r| (*id, r.last_activity)))
                .collect();
            // Most recently active last; everything before it is suspect.
            aged.sort_by_key(|(_, at)| *at);
            let Some((_survivor, _)) = aged.last().copied() else {
                continue;
            };
            for (id, last_activity) in aged.iter().take(aged.len() - 1) {
                let age = now.saturating_duration_since(*last_activity);
                if age > self.policy.grace && !doomed.iter().any(|(d, _)| d == id) {
                    warn!("Duplicate name detected; flagging older connection {}", id);
                    doomed.push((*id, LeaveReason::DuplicateName));
                }
            }
        }

        let mut events = Vec::new();
        for (id, reason) in doomed {
            if let Some(event) = registry.remove(id, reason) {
                events.push(event);
            }
        }
        events
    }
}

impl Default for GhostReconciler {
    fn default() -> Self {
        Self::new(GhostPolicy::default())
    }
}
