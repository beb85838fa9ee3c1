//! DNS-01 challenge provisioning
//!
//! # Architecture
//!
//! - [`Provisioner`] - Creates and removes the `_acme-challenge` TXT record
//! - [`ZoneProvisioner`] - [`Provisioner`] over any zone-scoped [`RecordApi`]
//! - [`PropagationVerifier`] - Waits until every authoritative nameserver serves the record
//! - [`CredentialLoader`] - Secure loading of provider credentials
//!
//! # Providers
//!
//! - [`DigitalOceanApi`] - DigitalOcean DNS API
//! - [`WebhookApi`] - Generic webhook for custom DNS backends
//!
//! # Example
//!
//! ```kdl
//! dns-provider "digitalocean" {
//!     zone "example.com"
//!     credentials-file "/etc/autocert/secrets/do-token"
//!
//!     propagation {
//!         nameservers "ns1.digitalocean.com" "ns2.digitalocean.com" "ns3.digitalocean.com"
//!         timeout-secs 60
//!     }
//! }
//! ```

mod credentials;
mod propagation;
mod provider;
mod providers;

pub use credentials::{CredentialLoader, Credentials};
pub use propagation::{HickoryTxtLookup, PropagationConfig, PropagationVerifier, TxtLookup};
pub use provider::{
    challenge_record_fqdn, relative_record_name, txt_value_matches, DnsProviderError, DnsResult,
    Provisioner, RecordApi, ZoneProvisioner, ZoneRecord, ACME_CHALLENGE_PREFIX, CHALLENGE_TTL,
    TXT_RECORD,
};
pub use providers::{create_provisioner, DigitalOceanApi, WebhookApi};
