// Thread-safe masking of secret values in streamed output.
// Stored step outputs keep the real values; only live stdout/stderr and log
// lines pass through the masker.

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text for a matched secret.
const MASK: &str = "*****";

/// Replaces registered secret values with `*****` in arbitrary strings.
///
/// Cheap to clone; clones share the same secret set.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    inner: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret value. Empty values are ignored. Longer secrets are
    /// matched first so a secret that contains another is never half-masked.
    pub fn add_value(&self, secret: &str) {
        if secret.is_empty() {
            return;
        }
        let mut secrets = self.inner.write();
        if !secrets.iter().any(|s| s == secret) {
            secrets.push(secret.to_string());
            secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    /// Drop every registered secret.
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn secret_count(&self) -> usize {
        self.inner.read().len()
    }

    /// Replace every registered secret in `input` with the mask.
    /// Idempotent: the mask itself is never registered as a secret.
    pub fn mask(&self, input: &str) -> String {
        let secrets = self.inner.read();
        if secrets.is_empty() {
            return input.to_string();
        }
        let mut out = input.to_string();
        for secret in secrets.iter() {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), MASK);
            }
        }
        out
    }
}
