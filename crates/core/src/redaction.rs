//! Secret redaction for logs
//!
//! The session password is injected into shell commands (`chpasswd`, the
//! remote-visualization auth setup) and would otherwise land verbatim in the
//! detail log. A [`Redactor`] holds the known secret values and masks them with
//! naive substring replacement.

use std::sync::{Arc, RwLock};

/// Minimum length for a value to be considered for redaction
const MIN_REDACTION_LENGTH: usize = 4;

/// Replacement text for redacted secrets
pub const REDACTION_PLACEHOLDER: &str = "****";

/// Thread-safe set of secret values to mask
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Arc<RwLock<Vec<String>>>,
}

impl Redactor {
    /// Create a redactor with no secrets registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret value. Values shorter than the minimum length are ignored
    /// to avoid masking common short substrings.
    pub fn add_secret(&self, secret: &str) {
        if secret.len() < MIN_REDACTION_LENGTH {
            return;
        }
        if let Ok(mut secrets) = self.secrets.write() {
            if !secrets.iter().any(|s| s == secret) {
                secrets.push(secret.to_string());
                // longest first so overlapping secrets are fully masked
                secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
            }
        }
    }

    /// Number of registered secrets
    pub fn len(&self) -> usize {
        self.secrets.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Whether no secrets are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mask every registered secret in `text`
    pub fn redact(&self, text: &str) -> String {
        let Ok(secrets) = self.secrets.read() else {
            return text.to_string();
        };
        let mut out = text.to_string();
        for secret in secrets.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTION_PLACEHOLDER);
            }
        }
        out
    }
}
