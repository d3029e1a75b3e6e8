//! # Fcache
//!
//! An in-memory key-value cache served over a line-oriented TCP protocol.
//!
//! All reads and writes go through a single engine task that owns the map, so
//! requests never interleave. Keys can carry an expiry, enforced by one timer
//! per entry. Mutations can be journaled to an append-only file and replayed
//! on startup.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod expire;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod store;
