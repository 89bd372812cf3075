//! Validation rules for agent and convoy beads.

use anyhow::bail;

/// Minimum allowed heartbeat timeout in seconds. Workers must heartbeat at
/// least once per hour and at most once per minute.
pub const MIN_HEARTBEAT_TIMEOUT: u32 = 60;
pub const MAX_HEARTBEAT_TIMEOUT: u32 = 3600;

/// Default timeout when a worker does not specify one.
pub const DEFAULT_HEARTBEAT_TIMEOUT: u32 = 180;

/// Accept a heartbeat timeout iff 60 <= t <= 3600 seconds.
pub fn validate_heartbeat_timeout(timeout_secs: u32) -> anyhow::Result<()> {
    if timeout_secs < MIN_HEARTBEAT_TIMEOUT {
        bail!(
            "heartbeat timeout {timeout_secs} seconds is too short (minimum: {MIN_HEARTBEAT_TIMEOUT} seconds)"
        );
    }
    if timeout_secs > MAX_HEARTBEAT_TIMEOUT {
        bail!(
            "heartbeat timeout {timeout_secs} seconds is too long (maximum: {MAX_HEARTBEAT_TIMEOUT} seconds)"
        );
    }
    Ok(())
}

/// Convoy stages, in order.
pub const STAGE_PLANNING: &str = "planning";
pub const STAGE_EXECUTION: &str = "execution";
pub const STAGE_REVIEW: &str = "review";
pub const STAGE_COMPLETE: &str = "complete";

fn stage_order(stage: &str) -> Option<u8> {
    match stage {
        STAGE_PLANNING => Some(1),
        STAGE_EXECUTION => Some(2),
        STAGE_REVIEW => Some(3),
        STAGE_COMPLETE => Some(4),
        _ => None,
    }
}

pub fn validate_convoy_stage(stage: &str) -> anyhow::Result<()> {
    if stage_order(stage).is_none() {
        bail!("invalid convoy stage {stage:?} (must be: planning, execution, review, or complete)");
    }
    Ok(())
}

/// Convoy stage transitions move forward only (skip-ahead allowed).
pub fn validate_convoy_stage_transition(current: &str, new: &str) -> anyhow::Result<()> {
    let cur = stage_order(current)
        .ok_or_else(|| anyhow::anyhow!("current stage: invalid convoy stage {current:?}"))?;
    let next =
        stage_order(new).ok_or_else(|| anyhow::anyhow!("new stage: invalid convoy stage {new:?}"))?;

    if next <= cur {
        bail!(
            "invalid stage transition from {current:?} to {new:?} (must move forward: planning → execution → review → complete)"
        );
    }
    Ok(())
}

/// Like [`validate_convoy_stage_transition`] but additionally allows
/// reopening a completed convoy (complete → planning).
pub fn validate_convoy_stage_transition_with_reopening(
    current: &str,
    new: &str,
) -> anyhow::Result<()> {
    if current == STAGE_COMPLETE && new == STAGE_PLANNING {
        return Ok(());
    }
    validate_convoy_stage_transition(current, new)
}
