//! Beacon Protocol - Operator command grammar
//!
//! This crate turns lines typed by the operator into [`Command`]s for the
//! daemon's console: a literal broadcast, a list of canned message keys,
//! a key listing request, or exit.

pub mod command;

pub use command::{parse, Command, CommandError};
