//! ACME client seam
//!
//! The certificate manager talks to the authority only through
//! [`AcmeClient`], so the protocol engine can be swapped (or mocked).

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AcmeError;

/// Decides whether to agree to the authority's terms of service
///
/// Called with the terms URL advertised in the directory.
pub type TermsPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Terms predicate that agrees to any terms
pub fn accept_tos(_terms_url: &str) -> bool {
    true
}

/// Challenge types an authority may offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    Dns01,
    Http01,
    TlsAlpn01,
    Other(String),
}

/// A challenge offered for an authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedChallenge {
    pub kind: ChallengeKind,
    /// Challenge token
    pub token: String,
    /// Challenge URL, used to signal readiness
    pub url: String,
}

/// Authorization status as reported by the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// An authorization for one domain with its offered challenges
#[derive(Debug, Clone)]
pub struct Authorization {
    /// Domain being authorized
    pub domain: String,
    /// Status at the time the authorization was fetched
    pub status: AuthorizationStatus,
    /// Offered challenges, in the authority's order
    pub challenges: Vec<OfferedChallenge>,
}

impl Authorization {
    /// The DNS-01 challenge, if offered
    pub fn dns01(&self) -> Option<&OfferedChallenge> {
        self.challenges
            .iter()
            .find(|c| c.kind == ChallengeKind::Dns01)
    }
}

/// ACME protocol operations used by the certificate manager
///
/// Implementations must be thread-safe; the manager never issues two
/// renewals concurrently, so per-order state may be kept internally.
#[async_trait]
pub trait AcmeClient: Send + Sync + Debug {
    /// Register the account
    ///
    /// Returns [`AcmeError::AlreadyRegistered`] when the account already
    /// exists; callers treat that as success.
    async fn register(&self, email: &str, accept_tos: &TermsPredicate) -> Result<(), AcmeError>;

    /// Request authorization for `domain` and return the offered challenges
    async fn authorize(&self, domain: &str) -> Result<Authorization, AcmeError>;

    /// The TXT record value proving control for a DNS-01 challenge
    async fn dns01_record_value(&self, challenge: &OfferedChallenge) -> Result<String, AcmeError>;

    /// Tell the authority the challenge is ready to be validated
    async fn accept(&self, challenge: &OfferedChallenge) -> Result<(), AcmeError>;

    /// Poll the authorization until it leaves the pending state
    async fn wait_authorization(
        &self,
        authorization: &Authorization,
    ) -> Result<AuthorizationStatus, AcmeError>;

    /// Submit a DER-encoded CSR and return the issued PEM chain
    async fn create_cert(&self, csr_der: &[u8]) -> Result<String, AcmeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(kind: ChallengeKind) -> OfferedChallenge {
        OfferedChallenge {
            kind,
            token: "token".to_string(),
            url: "https://acme.test/chall/1".to_string(),
        }
    }

    #[test]
    fn test_dns01_selection() {
        let authz = Authorization {
            domain: "example.com".to_string(),
            status: AuthorizationStatus::Pending,
            challenges: vec![
                challenge(ChallengeKind::Http01),
                challenge(ChallengeKind::TlsAlpn01),
                challenge(ChallengeKind::Dns01),
            ],
        };
        assert_eq!(authz.dns01().map(|c| &c.kind), Some(&ChallengeKind::Dns01));

        let authz = Authorization {
            challenges: vec![challenge(ChallengeKind::Http01)],
            ..authz
        };
        assert!(authz.dns01().is_none());
    }

    #[test]
    fn test_accept_tos() {
        assert!(accept_tos("https://letsencrypt.org/documents/LE-SA-v1.5.pdf"));
        assert!(accept_tos(""));
    }
}
