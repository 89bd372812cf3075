//! Mail delivery between agents.
//!
//! Messages are durable: delivery writes through the work store's message
//! primitive, which is the source of truth. On top of that the router makes a
//! best-effort status-line notification to the recipient's session; a failed
//! notification is dropped silently because the message itself already
//! landed.

pub mod protocol;

use std::path::PathBuf;

use crate::beads::Beads;
use crate::session::{Tmux, MAYOR_SESSION};

/// Message priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// A mail message between agents. Addresses are agent paths such as
/// `mayor`, `greenplace/witness`, or `greenplace/polecats/alice`.
#[derive(Debug, Clone)]
pub struct Message {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
}

/// Routes messages through the work store and notifies live sessions.
pub struct Router {
    beads: Beads,
    tmux: Tmux,
}

impl Router {
    /// `work_dir` must contain (or resolve to) a `.beads` database.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            beads: Beads::new(work_dir),
            tmux: Tmux::new(),
        }
    }

    /// Deliver a message. Store delivery errors surface to the caller;
    /// notification errors do not.
    pub fn send(&self, msg: &Message) -> anyhow::Result<()> {
        self.beads.send_message(
            &msg.to,
            &msg.from,
            &msg.body,
            &msg.subject,
            msg.priority == Priority::High,
        )?;

        self.notify_recipient(msg);
        Ok(())
    }

    /// Best-effort status-line notification in the recipient's session.
    fn notify_recipient(&self, msg: &Message) {
        let Some(session) = address_to_session(&msg.to) else {
            return;
        };
        match self.tmux.has_session(&session) {
            Ok(true) => {}
            _ => return,
        }
        let notification = format!("[MAIL] From {}: {}", msg.from, msg.subject);
        let _ = self.tmux.display_message(&session, &notification);
    }
}

/// Map a mail address to its session name. Returns None for addresses with
/// no session mapping.
fn address_to_session(address: &str) -> Option<String> {
    if address.starts_with("mayor") {
        return Some(MAYOR_SESSION.to_string());
    }

    // Rig-scoped address: rig/target or rig/polecats/name.
    let mut parts = address.splitn(2, '/');
    let rig = parts.next()?;
    let rest = parts.next()?;
    if rig.is_empty() || rest.is_empty() {
        return None;
    }
    let target = rest.rsplit('/').next()?;
    if target.is_empty() {
        return None;
    }
    Some(format!("gt-{rig}-{target}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mayor_addresses_map_to_mayor_session() {
        assert_eq!(address_to_session("mayor").unwrap(), "gt-mayor");
        assert_eq!(address_to_session("mayor/").unwrap(), "gt-mayor");
    }

    #[test]
    fn rig_addresses_map_to_rig_sessions() {
        assert_eq!(
            address_to_session("greenplace/witness").unwrap(),
            "gt-greenplace-witness"
        );
        assert_eq!(
            address_to_session("greenplace/polecats/alice").unwrap(),
            "gt-greenplace-alice"
        );
        assert_eq!(
            address_to_session("sandport/refinery").unwrap(),
            "gt-sandport-refinery"
        );
    }

    #[test]
    fn unmapped_addresses_yield_none() {
        assert!(address_to_session("").is_none());
        assert!(address_to_session("loner").is_none());
        assert!(address_to_session("rig/").is_none());
    }
}
