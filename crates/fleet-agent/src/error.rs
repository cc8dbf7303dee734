use std::time::Duration;

/// Upper bound for text carried back in a command's terminal frame.
pub const MAX_OUTPUT_BYTES: usize = 32 * 1024;

/// Classified failure of a coordinator call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// Network trouble or an overloaded coordinator; retry later.
    #[error("coordinator unavailable: {0}")]
    Transient(String),
    /// The coordinator lost (or never had) our registration.
    #[error("agent is not registered: {0}")]
    NotRegistered(String),
    /// Rejected outright; surface to the operator, do not retry automatically.
    #[error("coordinator rejected request: {0}")]
    Fatal(String),
}

impl RpcError {
    pub fn not_connected() -> Self {
        Self::Transient("not connected".to_string())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_registered(&self) -> bool {
        matches!(self, Self::NotRegistered(_))
    }
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;

        let msg = status.message().to_string();
        if status.code() == Code::NotFound || msg.to_ascii_lowercase().contains("not registered") {
            return Self::NotRegistered(msg);
        }
        match status.code() {
            Code::Unavailable
            | Code::DeadlineExceeded
            | Code::Cancelled
            | Code::Aborted
            | Code::ResourceExhausted
            | Code::Internal
            | Code::Unknown => Self::Transient(format!("{:?}: {msg}", status.code())),
            code => Self::Fatal(format!("{code:?}: {msg}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("launcher not found: {0}")]
    LauncherNotFound(String),
    #[error("spawn {program} failed: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("launcher exited with {0}")]
    LauncherFailed(String),
    #[error("process did not appear within {0:?}")]
    StartTimeout(Duration),
    #[error("signal to pid {pid} failed: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

pub fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_classified() {
        let e: RpcError = tonic::Status::not_found("agent-7").into();
        assert!(e.is_not_registered());

        let e: RpcError = tonic::Status::failed_precondition("agent not registered").into();
        assert!(e.is_not_registered());

        let e: RpcError = tonic::Status::unavailable("connection closed").into();
        assert!(e.is_transient());

        let e: RpcError = tonic::Status::invalid_argument("bad node name").into();
        assert!(matches!(e, RpcError::Fatal(_)));
    }

    #[test]
    fn error_chain_skips_duplicates() {
        let err = anyhow::anyhow!("root cause")
            .context("root cause")
            .context("start seatunnel");
        assert_eq!(format_error_chain(&err), "start seatunnel: root cause");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(100);
        let out = truncate_utf8(&s, 51);
        assert!(out.len() <= 51);
        assert!(out.ends_with("…(truncated)"));
        assert_eq!(truncate_utf8("short", 51), "short");
    }
}
