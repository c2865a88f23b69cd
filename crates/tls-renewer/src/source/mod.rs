//! Certificate source abstraction
//!
//! A source issues one certificate bundle per call. It never retries: the
//! renewal state machine owns backoff and rescheduling because only it knows
//! whether a failed fetch is urgent (the active bundle is about to expire)
//! or harmless.
//!
//! Implementations:
//!
//! - **Vault PKI** - `POST /v1/<pki mount>/issue/<role>` via [`VaultPkiSource`]

mod vault;

pub use vault::VaultPkiSource;

use async_trait::async_trait;
use thiserror::Error;

/// Errors a certificate source can report
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP request failed before a response was received
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// CA answered with a non-success status
    #[error("CA API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// CA response could not be interpreted
    #[error("failed to parse CA response: {0}")]
    Parse(String),

    /// Source could not be constructed from configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// A certificate and its private key as issued by the CA
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    /// PEM certificate (leaf first, followed by any chain)
    pub certificate: String,
    /// PEM private key
    pub private_key: String,
    /// Expiry as seconds since the Unix epoch
    pub expiration: i64,
}

impl CertificateBundle {
    /// Expiry in milliseconds since the Unix epoch
    pub fn expires_at_ms(&self) -> i64 {
        self.expiration.saturating_mul(1000)
    }

    /// Milliseconds of validity left at `now_ms` (negative once expired)
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.expires_at_ms().saturating_sub(now_ms)
    }
}

// Keeps key material out of logs.
impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &"<redacted>")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Issues certificate bundles on request
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// Request a fresh bundle
    async fn fetch(&self) -> Result<CertificateBundle, SourceError>;

    /// Short name for logs
    fn name(&self) -> &str;
}
