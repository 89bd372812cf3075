use std::process::ExitCode;

/// Errors that cause gt to exit with a specific code.
///
/// Exit codes: 0 success, 1 generic failure, 2 invocation/config error.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) | ExitError::Usage(_) => ExitCode::from(2),
            _ => ExitCode::FAILURE,
        }
    }
}

/// Error kinds raised by the work store adapter and consumed by the engines.
///
/// Engines branch on the kind: `Conflict` means an atomic update lost the
/// race and the caller decides whether to retry; `Transport` means the store
/// was unreachable and the current tick should end.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict updating {0}")]
    Conflict(String),

    #[error("store unreachable: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Stable kind name used in `--json` error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::Conflict(_) => "conflict",
            StoreError::Transport(_) => "transport",
            StoreError::Timeout(_) => "timeout",
            StoreError::Invalid(_) => "invalid",
        }
    }
}

/// Errors from the git adapter. Conflicts are recoverable (the caller aborts
/// the merge and requeues); everything else is a plain failure.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("merge conflict: {0}")]
    Conflict(String),

    #[error("push failed: {0}")]
    PushFailed(String),

    #[error("{0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_of(err: &ExitError) -> String {
        format!("{:?}", err.exit_code())
    }

    #[test]
    fn config_errors_exit_2() {
        assert_eq!(code_of(&ExitError::Config("bad".into())), format!("{:?}", ExitCode::from(2)));
        assert_eq!(code_of(&ExitError::Usage("bad".into())), format!("{:?}", ExitCode::from(2)));
    }

    #[test]
    fn tool_errors_exit_1() {
        let err = ExitError::ToolFailed {
            tool: "bd".into(),
            code: 3,
            message: "boom".into(),
        };
        assert_eq!(code_of(&err), format!("{:?}", ExitCode::FAILURE));
    }

    #[test]
    fn store_error_kinds() {
        assert_eq!(StoreError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(StoreError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(StoreError::Transport("x".into()).kind(), "transport");
        assert_eq!(StoreError::Invalid("x".into()).kind(), "invalid");
    }
}
