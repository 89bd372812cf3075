//! Gas Town - multi-agent work orchestration.
//!
//! This library backs the `gt` CLI: dispatching work from the beads work
//! database onto tmux-hosted workers, supervising worker health, draining
//! finished branches through per-rig merge queues, and projecting work state
//! into a read-only dashboard store.

pub mod beads;
pub mod commands;
pub mod config;
pub mod error;
pub mod git;
pub mod lifecycle;
pub mod mail;
pub mod projection;
pub mod refinery;
pub mod session;
pub mod sling;
pub mod subprocess;
pub mod telemetry;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_utils;
