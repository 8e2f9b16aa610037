//! Classification of transfer attempts into a closed set of outcomes.
//!
//! Every attempt ends as a [`TransferOutcome`]. The worker's retry loop and
//! the orchestrator's checkpoint update both match on it exhaustively, so a
//! new kind of remote answer means a new variant here, not a new conditional
//! somewhere else.
//!
//! Which HTTP status means what is remote-specific and lives in a
//! [`StatusPolicy`]: the document host answers a lapsed session with a bare
//! `302`, while the CDN storage API uses `401` for a rejected access key.

use std::time::Duration;

use super::TransferError;
use super::retry::parse_retry_after;

/// Result of one attempt, or the terminal result of a whole transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Payload transferred; carries the byte count.
    Success {
        /// Bytes written (download) or sent (upload).
        bytes: u64,
    },

    /// The remote confirmed the item does not exist. Never retried.
    NotFound,

    /// The remote asked us to stop hammering it.
    RateLimited {
        /// Server-provided Retry-After delay, if any.
        retry_after: Option<Duration>,
    },

    /// The remote is overloaded.
    ServerBusy,

    /// The credential bundle is no longer accepted. Never retried.
    CredentialExpired,

    /// Unexpected status, timeout, or connection-level failure.
    TransientError(String),

    /// The retry budget ran out; carries the last error seen.
    RetriesExhausted {
        /// Description of the last failed attempt.
        last_error: String,
    },
}

impl TransferOutcome {
    /// Whether this outcome ends the transfer of an item.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success { .. }
                | Self::NotFound
                | Self::CredentialExpired
                | Self::RetriesExhausted { .. }
        )
    }

    /// Short label used in logs and summaries.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::NotFound => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerBusy => "server_busy",
            Self::CredentialExpired => "credential_expired",
            Self::TransientError(_) => "transient_error",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

/// Remote-specific meaning of HTTP status codes.
///
/// Statuses not listed in any set (and not 2xx) are transient errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPolicy {
    /// Explicit absence, e.g. 404.
    pub not_found: Vec<u16>,
    /// "Slow down", e.g. 429.
    pub rate_limited: Vec<u16>,
    /// Overload, e.g. 503.
    pub overloaded: Vec<u16>,
    /// Session no longer valid, e.g. a login redirect.
    pub session_expired: Vec<u16>,
}

impl StatusPolicy {
    /// Status meanings of the document host.
    ///
    /// Redirects are not followed, and the host only redirects when the
    /// anti-bot cookies have lapsed.
    #[must_use]
    pub fn document_host() -> Self {
        Self {
            not_found: vec![404],
            rate_limited: vec![429],
            overloaded: vec![503],
            session_expired: vec![302],
        }
    }

    /// Status meanings of the CDN storage API.
    #[must_use]
    pub fn cdn_storage() -> Self {
        Self {
            not_found: Vec::new(),
            rate_limited: vec![429],
            overloaded: vec![502, 503, 504],
            session_expired: vec![401],
        }
    }

    /// Classifies a failed attempt.
    #[must_use]
    pub fn classify(&self, error: &TransferError) -> TransferOutcome {
        match error {
            TransferError::HttpStatus {
                status,
                retry_after,
                ..
            } => self.classify_status(*status, retry_after.as_deref()),
            // Retrying cannot repair a malformed URL.
            TransferError::InvalidUrl { .. } => TransferOutcome::RetriesExhausted {
                last_error: error.to_string(),
            },
            other => TransferOutcome::TransientError(other.to_string()),
        }
    }

    fn classify_status(&self, status: u16, retry_after: Option<&str>) -> TransferOutcome {
        if self.not_found.contains(&status) {
            TransferOutcome::NotFound
        } else if self.session_expired.contains(&status) {
            TransferOutcome::CredentialExpired
        } else if self.rate_limited.contains(&status) {
            TransferOutcome::RateLimited {
                retry_after: retry_after.and_then(parse_retry_after),
            }
        } else if self.overloaded.contains(&status) {
            TransferOutcome::ServerBusy
        } else {
            TransferOutcome::TransientError(format!("unexpected HTTP status {status}"))
        }
    }
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self::document_host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> TransferError {
        TransferError::http_status("https://example.com/f.pdf", code)
    }

    #[test]
    fn test_document_host_404_is_not_found() {
        let policy = StatusPolicy::document_host();
        assert_eq!(policy.classify(&status(404)), TransferOutcome::NotFound);
    }

    #[test]
    fn test_document_host_302_is_credential_expired() {
        let policy = StatusPolicy::document_host();
        assert_eq!(
            policy.classify(&status(302)),
            TransferOutcome::CredentialExpired
        );
    }

    #[test]
    fn test_invalid_url_is_not_retried() {
        let policy = StatusPolicy::document_host();
        assert!(matches!(
            policy.classify(&TransferError::invalid_url("files/EFTA1.pdf")),
            TransferOutcome::RetriesExhausted { .. }
        ));
    }

    #[test]
    fn test_document_host_503_is_server_busy() {
        let policy = StatusPolicy::document_host();
        assert_eq!(policy.classify(&status(503)), TransferOutcome::ServerBusy);
    }

    #[test]
    fn test_429_carries_retry_after() {
        let policy = StatusPolicy::document_host();
        let error = TransferError::http_status_with_retry_after(
            "https://example.com/f.pdf",
            429,
            Some("45".to_string()),
        );
        assert_eq!(
            policy.classify(&error),
            TransferOutcome::RateLimited {
                retry_after: Some(Duration::from_secs(45))
            }
        );
    }

    #[test]
    fn test_unlisted_status_is_transient() {
        let policy = StatusPolicy::document_host();
        assert!(matches!(
            policy.classify(&status(500)),
            TransferOutcome::TransientError(msg) if msg.contains("500")
        ));
        assert!(matches!(
            policy.classify(&status(403)),
            TransferOutcome::TransientError(_)
        ));
    }

    #[test]
    fn test_timeout_is_transient() {
        let policy = StatusPolicy::document_host();
        let error = TransferError::timeout("https://example.com/f.pdf");
        assert!(matches!(
            policy.classify(&error),
            TransferOutcome::TransientError(_)
        ));
    }

    #[test]
    fn test_cdn_storage_401_is_credential_expired_and_404_transient() {
        let policy = StatusPolicy::cdn_storage();
        assert_eq!(
            policy.classify(&status(401)),
            TransferOutcome::CredentialExpired
        );
        assert!(matches!(
            policy.classify(&status(404)),
            TransferOutcome::TransientError(_)
        ));
        assert_eq!(policy.classify(&status(502)), TransferOutcome::ServerBusy);
    }

    #[test]
    fn test_terminal_outcomes() {
        assert!(TransferOutcome::Success { bytes: 1 }.is_terminal());
        assert!(TransferOutcome::NotFound.is_terminal());
        assert!(TransferOutcome::CredentialExpired.is_terminal());
        assert!(
            TransferOutcome::RetriesExhausted {
                last_error: String::new()
            }
            .is_terminal()
        );
        assert!(!TransferOutcome::ServerBusy.is_terminal());
        assert!(!TransferOutcome::RateLimited { retry_after: None }.is_terminal());
        assert!(!TransferOutcome::TransientError("x".into()).is_terminal());
    }
}
