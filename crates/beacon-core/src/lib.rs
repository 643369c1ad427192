//! Beacon Core - Shared types for the broadcast hub
//!
//! This crate provides the types shared between the daemon (beacond)
//! and its collaborators:
//! - `message` - Broadcast payloads and their validated outbound frames
//! - `canned` - The immutable canned message table loaded at startup
//! - `config` - Hub configuration with defaults, TOML loading and validation
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod canned;
pub mod config;
pub mod message;

// Re-exports for convenience
pub use canned::{CannedError, CannedMessages, UnknownKeys};
pub use config::{BeaconConfig, ConfigError};
pub use message::{Frame, FrameError, Message};
