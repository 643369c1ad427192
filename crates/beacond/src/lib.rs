//! Beacon Daemon - SSE broadcast hub
//!
//! This crate provides the broadcast core of the beacon daemon:
//! - `hub` - Subscriber registry and fan-out engine
//! - `broadcast` - Publish queue and the single broadcast loop
//! - `server` - HTTP listener serving the event stream
//! - `lifecycle` - Startup ordering and graceful shutdown
//! - `console` - Operator command loop feeding the publish queue
//! - `cli` - Command-line entry point
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       beacond daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │    Console      │────▶│  Publish queue (mpsc FIFO)  │    │
//! │  │ (operator input)│     └──────────────┬──────────────┘    │
//! │  └─────────────────┘                    │                   │
//! │                                         ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │   EventServer   │────▶│  BroadcastLoop ─▶ Hub       │    │
//! │  │  (axum, /events)│     │  (single writer)            │    │
//! │  └────────┬────────┘     └──────────────┬──────────────┘    │
//! │           │ subscribe                   │ frames            │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │        Subscription streams (one per client)        │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod broadcast;
pub mod cli;
pub mod console;
pub mod hub;
pub mod lifecycle;
pub mod server;
