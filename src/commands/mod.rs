//! CLI command implementations.

pub mod convoy;
pub mod health;
pub mod heartbeat;
pub mod lifecycle;
pub mod mail;
pub mod molecules;
pub mod mq;
pub mod projection_daemon;
pub mod refinery;
pub mod sling;

use serde::Serialize;

/// Print a value as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// The `--json` failure envelope: `{"error": {"kind", "message"}}`.
pub fn json_error_envelope(kind: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "error": { "kind": kind, "message": message }
    })
}

pub fn print_json_error(kind: &str, message: &str) {
    println!("{}", json_error_envelope(kind, message));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_error_envelope_shape() {
        // The envelope is part of the CLI contract; keep its shape stable.
        let envelope = json_error_envelope("not_found", "bead gt-x not found");
        assert_eq!(envelope["error"]["kind"], "not_found");
        assert_eq!(envelope["error"]["message"], "bead gt-x not found");
        assert_eq!(envelope.as_object().unwrap().len(), 1);
    }
}
