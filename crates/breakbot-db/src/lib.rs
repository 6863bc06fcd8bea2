//! # Breakbot DB
//!
//! SQLite-backed durable storage. Every mutation a command handler makes is
//! written here first and only then reflected in the in-memory registry.

pub mod store;

pub use store::{AddOutcome, IncidentStore, RemoveOutcome};
