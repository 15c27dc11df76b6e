//! # Synchronization Client Library
//!
//! Client-side implementation of the multiplayer avatar synchronization
//! layer. It keeps a local shadow of every remote player, smooths their
//! authoritative updates into continuous motion, and keeps the connection
//! itself alive across the failure modes UDP offers.
//!
//! ## Architecture Overview
//!
//! The client is a single event loop over one UDP socket. Three passive
//! components hang off it, each owning one concern and none touching the
//! network themselves:
//!
//! ### Position Synchronization
//! Authoritative updates arrive as discrete corrections at network rate.
//! The synchronizer interpolates each remote avatar from where it is
//! rendered toward where the server says it should be, snapping only for
//! teleport-scale jumps, so remote players glide instead of stutter.
//!
//! ### Quality Monitoring
//! Heartbeat round-trips feed a bounded latency history. Derived average
//! and jitter classify the link, and the classification sets the
//! interpolation window: a clean link tracks tightly, a rough one trades
//! latency for smoothness.
//!
//! ### Session Management
//! An explicit state machine owns connection lifecycle: heartbeat liveness
//! detection, bounded reconnect attempts with cause-dependent backoff, and
//! a stable session token that lets the server link a reconnect to its
//! predecessor record.
//!
//! ## Module Organization
//!
//! - [`sync`]: remote player shadows and interpolation
//! - [`quality`]: latency sampling and link classification
//! - [`session`]: connection state machine and retry policy
//! - [`network`]: UDP transport and the main event loop
pub mod network;
pub mod quality;
pub mod session;
pub mod sync;
