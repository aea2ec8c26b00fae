//! Shared upstream types: credentials and fetched payloads.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Raw upstream payloads keyed by identifier.
///
/// Values are the exact JSON bytes the upstream returned for one identifier;
/// they are never deserialized into a schema here.
pub type Payloads = HashMap<String, Bytes>;

/// Credential tier accepted by the upstream API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Paid,
    Demo,
    Anonymous,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Demo => "demo",
            Self::Anonymous => "anonymous",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One API credential.
///
/// `Debug` and `Display` mask the secret so credentials can be logged.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential {
    pub secret: String,
    pub kind: CredentialKind,
}

impl Credential {
    pub fn paid(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            kind: CredentialKind::Paid,
        }
    }

    pub fn demo(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            kind: CredentialKind::Demo,
        }
    }

    /// The unauthenticated pseudo-credential. Adds no query parameter.
    pub fn anonymous() -> Self {
        Self {
            secret: String::new(),
            kind: CredentialKind::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.kind == CredentialKind::Anonymous
    }

    /// Secret reduced to its first and last two characters.
    pub fn masked(&self) -> String {
        if self.is_anonymous() {
            return "anonymous".to_string();
        }
        let chars: Vec<char> = self.secret.chars().collect();
        if chars.len() <= 6 {
            return format!("{}:***", self.kind);
        }
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("{}:{}***{}", self.kind, head, tail)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &self.masked())
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}
