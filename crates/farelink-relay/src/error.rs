use thiserror::Error;

/// Top-level error type for the `farelink-relay` crate.
///
/// Covers every failure mode of a relayed router call: transport to the
/// relay endpoint, the relay's own envelope, and the fault codes the relay
/// reports back from the router. `farelink-core` maps these into
/// reconciliation outcomes.
#[derive(Debug, Error)]
pub enum RelayError {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error reaching the relay (connection refused, DNS
    /// failure, etc.)
    #[error("relay transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The relay call timed out.
    #[error("relay call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The relay endpoint itself answered with a non-success HTTP status.
    #[error("relay endpoint returned HTTP {status}")]
    Endpoint { status: u16 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Router faults (relayed) ─────────────────────────────────────
    /// The relay could not reach the router behind it.
    #[error("router unreachable through relay: {message}")]
    RouterUnreachable { message: String },

    /// The router rejected the relay's credentials.
    #[error("router authentication rejected: {message}")]
    Auth { message: String },

    /// The router rejected the command itself (malformed operand, unknown
    /// list, etc.) -- retrying will never succeed.
    #[error("router rejected '{op}': {message}")]
    Rejected { op: String, message: String },

    /// An ensure-style operation found the entry already present.
    #[error("entry already exists")]
    AlreadyExists,

    /// A remove-style operation found no entry to remove.
    #[error("entry not found")]
    NotFound,

    // ── Data ────────────────────────────────────────────────────────
    /// The relay's response envelope could not be parsed.
    #[error("malformed relay response: {message}")]
    Protocol { message: String },
}

impl RelayError {
    /// Returns `true` if this is a transient failure worth retrying:
    /// transport-level trouble between here and the router, not a verdict
    /// on the command itself.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::RouterUnreachable { .. } => true,
            Self::Endpoint { status } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` for the "already exists" / "not found" pair that
    /// idempotent ensure/remove operations fold into success.
    pub fn is_idempotent_conflict(&self) -> bool {
        matches!(self, Self::AlreadyExists | Self::NotFound)
    }

    /// Returns `true` if the router will never accept this call as issued.
    /// Permanent errors are surfaced for operator attention instead of
    /// being retried.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient() && !self.is_idempotent_conflict()
    }
}

#[cfg(test)]
mod tests {
    use super::RelayError;

    #[test]
    fn classification_is_exclusive() {
        let cases = [
            RelayError::Timeout { timeout_secs: 5 },
            RelayError::Endpoint { status: 502 },
            RelayError::RouterUnreachable {
                message: "no route".into(),
            },
            RelayError::Auth {
                message: "bad password".into(),
            },
            RelayError::Rejected {
                op: "ensure-ip-binding".into(),
                message: "invalid mac".into(),
            },
            RelayError::AlreadyExists,
            RelayError::NotFound,
            RelayError::Protocol {
                message: "truncated".into(),
            },
        ];

        for err in cases {
            let classes = [
                err.is_transient(),
                err.is_idempotent_conflict(),
                err.is_permanent(),
            ];
            assert_eq!(
                classes.iter().filter(|c| **c).count(),
                1,
                "{err} must fall in exactly one class"
            );
        }
    }

    #[test]
    fn endpoint_4xx_is_permanent() {
        assert!(RelayError::Endpoint { status: 400 }.is_permanent());
        assert!(RelayError::Endpoint { status: 503 }.is_transient());
    }
}
