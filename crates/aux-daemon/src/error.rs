use aux_proto::protocol::VibeReport;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Every way a request can terminate short of success. Each variant maps to
/// one stable machine-readable kind on the wire; handlers never invent
/// ad-hoc failure shapes.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Malformed input. Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The delegated credential is unusable even after one refresh attempt.
    /// Recovering requires the host to redo the login handshake.
    #[error("not authenticated: {0}")]
    Auth(String),

    /// The client spent its window allowance. Informational; includes when
    /// the window rolls over.
    #[error("queue limit reached; resets at {reset_at}")]
    QuotaExceeded { reset_at: DateTime<Utc> },

    /// The candidate track fell outside the active vibe policy. The guest
    /// may retry with a different track.
    #[error("{}", .report.primary_reason.as_deref().unwrap_or("track does not match the vibe"))]
    VibeRejected { report: VibeReport },

    /// Network failure, timeout, or a 5xx from the mediated service. Safe to
    /// retry later.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upstream account has no active playback device. The fix is
    /// operator action (start playback somewhere), not a retry.
    #[error("no active playback device; the host needs to start playback first")]
    NoActiveTarget,

    /// Login round trip could not be correlated: unknown or expired state.
    #[error("login session not found or expired")]
    HandshakeNotFound,

    /// Host-only operation attempted without the host key.
    #[error("this operation requires the host key")]
    Forbidden,
}

impl AdmissionError {
    /// Stable wire identifier for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Auth(_) => "auth_error",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::VibeRejected { .. } => "vibe_rejected",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::NoActiveTarget => "no_active_target",
            Self::HandshakeNotFound => "not_found",
            Self::Forbidden => "forbidden",
        }
    }
}
