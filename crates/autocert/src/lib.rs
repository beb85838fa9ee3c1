//! Automatic certificate management over ACME DNS-01
//!
//! Issues a certificate for a single domain from an ACME authority (Let's
//! Encrypt by default), caches it on disk and renews it before it expires.
//! Domain control is proven with DNS-01 challenges, so no inbound HTTP access
//! is needed.
//!
//! # Architecture
//!
//! - [`CertificateManager`] - Drives registration, authorization, issuance and renewal
//! - [`KeyMaterialStore`] - On-disk cache for keys, certificates and account credentials
//! - [`AcmeClient`] - Seam over the ACME protocol engine ([`InstantAcmeClient`])
//! - [`dns::Provisioner`] - Creates and removes `_acme-challenge` TXT records
//! - [`dns::PropagationVerifier`] - Confirms all authoritative nameservers serve a record
//!
//! # Challenge Flow
//!
//! 1. [`CertificateManager`] registers the account (idempotent)
//! 2. The authority offers challenges for the domain; DNS-01 is selected
//! 3. The provisioner publishes `_acme-challenge.<domain>` and waits for propagation
//! 4. The challenge is accepted and the authorization polled to a terminal state
//! 5. The challenge record is removed, whatever the outcome
//! 6. A CSR is built from the cached domain key and the certificate issued
//! 7. The chain is persisted and swapped into the live slot
//!
//! The live certificate is exposed through [`rustls::server::ResolvesServerCert`],
//! so a manager can be plugged straight into a rustls `ServerConfig`.

mod client;
pub mod dns;
mod error;
mod instant;
mod manager;
mod scheduler;
mod storage;

pub use client::{
    accept_tos, AcmeClient, Authorization, AuthorizationStatus, ChallengeKind, OfferedChallenge,
    TermsPredicate,
};
pub use error::{AcmeError, StorageError};
pub use instant::{HttpClientFactory, InstantAcmeClient};
pub use manager::{CertificateManager, ErrorCallback, LiveCertificate, ManagerConfig};
pub use scheduler::{renewal_delay, RenewalHandle, RenewalState};
pub use storage::{CachedCertificate, KeyMaterialStore};

pub use autocert_config::{LETSENCRYPT_PRODUCTION, LETSENCRYPT_STAGING};

/// Install aws-lc-rs as the process-wide rustls crypto provider
///
/// Both rustls backends are compiled in (reqwest pulls `ring`), so rustls
/// cannot pick one by itself. Must run before the first TLS client is built;
/// later calls are no-ops.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
