//! Correlation ids for produced requests.

use sha2::{Digest, Sha256};

/// Incremental digest over everything a produce request forwards.
///
/// The correlation id is `{idempotency key}-{sha256 hex}`, so retrying the
/// same request with the same idempotency key correlates to the same reply.
#[derive(Debug, Clone)]
pub struct ProduceHash {
    idempotency_key: String,
    hasher: Sha256,
    correlation_id: Option<String>,
}

impl ProduceHash {
    pub fn new(idempotency_key: impl Into<String>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            hasher: Sha256::new(),
            correlation_id: None,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        if self.correlation_id.is_none() {
            self.hasher.update(bytes);
        }
    }

    /// Finish the digest; later updates are ignored.
    pub fn digest(&mut self) -> &str {
        if self.correlation_id.is_none() {
            let digest = std::mem::take(&mut self.hasher).finalize();
            self.correlation_id = Some(format!("{}-{:x}", self.idempotency_key, digest));
        }
        self.correlation_id.as_deref().unwrap_or_default()
    }

    /// Correlation id once [`digest`](Self::digest) has run.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }
}
