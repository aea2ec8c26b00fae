//! Credential attempt tracking for rotation diagnostics.

use std::fmt;

/// Why a credential was passed over without being used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySkipReason {
    /// Local rate limiter had no token for its kind.
    RateLimited,
}

impl fmt::Display for KeySkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limited"),
        }
    }
}

/// Record of a single credential attempt. Holds the masked label only.
#[derive(Clone, Debug)]
pub struct KeyAttempt {
    pub label: String,
    pub skipped: Option<KeySkipReason>,
    pub error: Option<String>,
    pub success: bool,
}

/// All credential attempts made by one rotation.
#[derive(Clone, Debug, Default)]
pub struct KeyDiagnostics {
    pub attempts: Vec<KeyAttempt>,
}

impl KeyDiagnostics {
    pub fn new() -> Self {
        Self {
            attempts: Vec::new(),
        }
    }

    pub fn record_skip(&mut self, label: String, reason: KeySkipReason) {
        self.attempts.push(KeyAttempt {
            label,
            skipped: Some(reason),
            error: None,
            success: false,
        });
    }

    pub fn record_error(&mut self, label: String, error: String) {
        self.attempts.push(KeyAttempt {
            label,
            skipped: None,
            error: Some(error),
            success: false,
        });
    }

    pub fn record_success(&mut self, label: String) {
        self.attempts.push(KeyAttempt {
            label,
            skipped: None,
            error: None,
            success: true,
        });
    }

    /// Number of credentials that were actually used, skips excluded.
    pub fn tried(&self) -> usize {
        self.attempts.iter().filter(|a| a.skipped.is_none()).count()
    }

    /// One-line trail, e.g. `paid:CG***kl failed (HTTP 401 ...) -> demo:***: skipped (rate limited)`.
    pub fn summary(&self) -> String {
        self.attempts
            .iter()
            .map(|a| {
                if let Some(reason) = &a.skipped {
                    format!("{}: skipped ({})", a.label, reason)
                } else if let Some(err) = &a.error {
                    format!("{} failed ({})", a.label, err)
                } else if a.success {
                    format!("{} succeeded", a.label)
                } else {
                    a.label.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}
