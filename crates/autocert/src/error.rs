//! Error types for certificate management

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::client::AuthorizationStatus;
use crate::dns::DnsProviderError;

/// Errors that can occur while obtaining or renewing a certificate
#[derive(Debug, Error)]
pub enum AcmeError {
    /// A required setting is missing; raised before any network call
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Account registration failed
    #[error("Failed to register ACME account: {0}")]
    Registration(String),

    /// The account is already registered with the authority
    #[error("ACME account is already registered")]
    AlreadyRegistered,

    /// The terms of service were rejected by the configured predicate
    #[error("Terms of service at '{url}' were not accepted")]
    TermsRejected { url: String },

    /// Requesting the domain authorization failed
    #[error("Failed to authorize domain '{domain}': {message}")]
    Authorization { domain: String, message: String },

    /// No DNS-01 challenge offered for the domain
    #[error("No DNS-01 challenge available for domain '{0}'")]
    NoDns01Challenge(String),

    /// Accepting the challenge failed
    #[error("Failed to accept challenge: {0}")]
    ChallengeAccept(String),

    /// The authorization ended in a non-valid state
    #[error("Authorization for domain '{domain}' ended with status {status:?}")]
    ChallengeInvalid {
        domain: String,
        status: AuthorizationStatus,
    },

    /// Certificate issuance failed
    #[error("Failed to issue certificate: {0}")]
    Issuance(String),

    /// ACME protocol error from the client library
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// Provisioning the challenge record failed
    #[error("DNS provider error: {0}")]
    Provision(#[from] DnsProviderError),

    /// Cache read or write failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// No certificate has been obtained yet
    #[error("No certificate available yet")]
    NoCertificate,

    /// The renewal loop is already running for this manager
    #[error("Certificate manager is already running")]
    AlreadyRunning,

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Certificate parsing error
    #[error("Failed to parse certificate: {0}")]
    CertificateParse(String),
}

impl AcmeError {
    /// Whether this error only says something is already absent
    pub fn is_not_found(&self) -> bool {
        match self {
            AcmeError::Storage(e) => e.is_not_found(),
            AcmeError::Provision(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Errors specific to the on-disk key and certificate cache
#[derive(Debug, Error)]
pub enum StorageError {
    /// File does not exist
    #[error("Not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// File exists but its content could not be decoded
    #[error("Malformed content in {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Whether the file simply does not exist yet
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        AcmeError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let err = AcmeError::from(StorageError::NotFound {
            path: PathBuf::from("certs/example.com.crt"),
        });
        assert!(err.is_not_found());
        assert!(err.to_string().contains("example.com.crt"));

        let err = AcmeError::from(DnsProviderError::RecordNotFound {
            record_name: "_acme-challenge.www".to_string(),
        });
        assert!(err.is_not_found());

        let err = AcmeError::from(StorageError::Malformed {
            path: PathBuf::from("certs/example.com.crt"),
            reason: "no certificates".to_string(),
        });
        assert!(!err.is_not_found());
        assert!(!AcmeError::Cancelled.is_not_found());
    }

    #[test]
    fn test_challenge_invalid_display() {
        let err = AcmeError::ChallengeInvalid {
            domain: "example.com".to_string(),
            status: AuthorizationStatus::Invalid,
        };
        assert!(err.to_string().contains("example.com"));
        assert!(err.to_string().contains("Invalid"));
    }
}
