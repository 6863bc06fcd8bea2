//! # Breakbot Scheduler
//!
//! Three independently timed engines over the shared incident registry.
//!
//! ## Architecture
//! ```text
//! spawn_engine (tokio interval, one task per engine)
//!   ├── Syntrax     every tick → logs since watermark → IssueTracker::sync (jittered, fan-out)
//!   ├── Annoyotron  every tick → active, unblocked incidents → nag thresholds → ChatAdapter::send
//!   └── Archivist   every tick → completed past retention → store.archive → registry.remove
//!                                                            └── ChatAdapter::leave (fire-and-forget)
//! ```
//! Each tick runs in its own task, so a slow tick never holds up the timer
//! and stopping an engine never cancels a tick that already started.

pub mod annoyotron;
pub mod archivist;
pub mod engine;
pub mod nag;
pub mod notify;
pub mod syntrax;

pub use annoyotron::Annoyotron;
pub use archivist::Archivist;
pub use engine::{Engine, EngineHandle, spawn_engine};
pub use nag::{Nag, due_nags};
pub use notify::NagNotice;
pub use syntrax::{SyncReport, Syntrax};
