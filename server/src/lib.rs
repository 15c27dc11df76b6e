//! # Synchronization Server Library
//!
//! Authoritative server for the multiplayer avatar synchronization layer.
//! It owns the canonical player registry, arbitrates conflicting reports
//! from clients, and broadcasts every accepted mutation so that all
//! connected clients converge on the same world state.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! The registry is the single source of truth for position, health and
//! player metadata. Clients hold read-only shadows; nothing a client sends
//! is applied without validation here.
//!
//! ### Identity Reconciliation
//! Abrupt disconnects, refreshes and duplicate names all leave stale
//! registry entries behind. The ghost reconciler removes them using record
//! age, the transport's active-connection snapshot and session tokens,
//! without ever evicting a player who is merely idle.
//!
//! ### Event Broadcasting
//! Every successful register/update/remove emits a typed event that is
//! rebroadcast to all other connections. Broadcast is the sole propagation
//! mechanism; there is no polling path.
//!
//! ## Architecture
//!
//! A single `tokio::select!` loop owns all registry mutation, so every
//! record sees one writer at a time. Spawned tasks handle socket receive,
//! socket send and transport timeout detection, communicating with the
//! main loop over mpsc channels. Errors inside one connection's handler
//! degrade to "drop this update"; they never take down the process or
//! other connections' state.
//!
//! ## Module Organization
//!
//! - [`registry`]: player records, registration lifecycle, typed events
//! - [`reconciler`]: ghost sweep and session reclamation policy
//! - [`combat`]: attack sanitization, damage clamping, respawn
//! - [`network`]: UDP transport, connection table, main event loop

pub mod combat;
pub mod network;
pub mod reconciler;
pub mod registry;
