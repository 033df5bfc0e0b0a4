//! Client-side SyncPlay core.
//!
//! This crate is the distributed-coordination heart of a SyncPlay-capable
//! media receiver: time synchronization, remote-timed command scheduling,
//! continuous drift correction, and group queue management. It consumes two
//! opaque capabilities from its embedder — a [`player::MediaEngine`] and a
//! [`transport::Transport`] — and drives no UI, CLI, or network transport of
//! its own; see [`manager::Manager`] for the facade that ties everything
//! together.
//!
//! # Layout
//!
//! - [`time`] — tick/instant arithmetic shared by every other module.
//! - [`protocol`] — wire types for commands, queue updates, and group info.
//! - [`settings`] — tunable thresholds with change notification.
//! - [`player`] — the player adapter and the underlying media engine trait.
//! - [`transport`] — the server-request capability the core consumes.
//! - [`time_sync`] — Component A: offset/RTT estimation.
//! - [`queue_model`] — Component C: the in-memory shared playlist.
//! - [`playback_core`] — Component D: command scheduling and drift
//!   correction.
//! - [`queue_core`] — Component E: queue-update application.
//! - [`manager`] — Component F: session state and message routing.
//!
//! This crate is not `Send`: it is designed to be driven from a single
//! `tokio::task::LocalSet`-bound task, matching the single-threaded
//! cooperative scheduling model the protocol assumes (commands and queue
//! updates are applied in arrival order against shared, un-locked state).

pub mod error;
pub mod manager;
pub mod player;
pub mod playback_core;
pub mod protocol;
pub mod queue_core;
pub mod queue_model;
mod scheduler;
pub mod settings;
pub mod time;
pub mod time_sync;
pub mod transport;

pub use error::{Error, Result};
