//! DNS-01 provisioning contract
//!
//! Defines the interface the certificate manager uses to publish challenge
//! records, and a zone-scoped implementation shared by concrete backends.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::propagation::PropagationVerifier;

/// Result type for DNS operations
pub type DnsResult<T> = Result<T, DnsProviderError>;

/// Errors that can occur during DNS provider operations
#[derive(Debug, Error)]
pub enum DnsProviderError {
    /// Only TXT records can be provisioned
    #[error("Unsupported record type '{0}', only TXT is supported")]
    UnsupportedRecordType(String),

    /// The record is outside the managed zone
    #[error("Record '{fqdn}' is not within managed zone '{zone}'")]
    DomainMismatch { fqdn: String, zone: String },

    /// The record name relative to the zone is empty
    #[error("Record '{fqdn}' is the zone apex; a challenge record needs a name")]
    EmptyRecordName { fqdn: String },

    /// No record matched name, type and value
    #[error("No matching TXT record '{record_name}'")]
    RecordNotFound { record_name: String },

    /// Authentication failed with the DNS provider
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// API request failed
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Record creation failed
    #[error("Failed to create TXT record for '{record_name}': {message}")]
    RecordCreation { record_name: String, message: String },

    /// Record deletion failed
    #[error("Failed to delete TXT record '{record_id}': {message}")]
    RecordDeletion { record_id: String, message: String },

    /// Rate limited by provider
    #[error("Rate limited by DNS provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Request timeout
    #[error("Request timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    /// Not every nameserver served the record before the deadline
    #[error("DNS propagation timeout for record '{record}' on {nameservers:?} after {elapsed:?}")]
    PropagationTimeout {
        record: String,
        nameservers: Vec<String>,
        elapsed: Duration,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Credential loading failed
    #[error("Failed to load credentials: {0}")]
    Credentials(String),

    /// The operation was cancelled
    #[error("DNS operation cancelled")]
    Cancelled,
}

impl DnsProviderError {
    /// Whether the record was simply not there
    pub fn is_not_found(&self) -> bool {
        matches!(self, DnsProviderError::RecordNotFound { .. })
    }
}

/// ACME challenge record name prefix
pub const ACME_CHALLENGE_PREFIX: &str = "_acme-challenge.";

/// The only supported record type
pub const TXT_RECORD: &str = "TXT";

/// Recommended TTL for challenge records (60 seconds)
pub const CHALLENGE_TTL: u32 = 60;

/// Build the full ACME challenge record name
///
/// For `example.com`, returns `_acme-challenge.example.com`
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("{}{}", ACME_CHALLENGE_PREFIX, domain.trim_end_matches('.'))
}

/// Compute the record name relative to `zone`
///
/// `_acme-challenge.www.example.com` in zone `example.com` yields
/// `_acme-challenge.www`. Trailing dots are ignored and the comparison is
/// case-insensitive.
pub fn relative_record_name(fqdn: &str, zone: &str) -> DnsResult<String> {
    let fqdn = fqdn.trim_end_matches('.');
    let zone = zone.trim_end_matches('.');

    if fqdn.eq_ignore_ascii_case(zone) {
        return Err(DnsProviderError::EmptyRecordName {
            fqdn: fqdn.to_string(),
        });
    }

    let mismatch = || DnsProviderError::DomainMismatch {
        fqdn: fqdn.to_string(),
        zone: zone.to_string(),
    };

    if zone.is_empty() || fqdn.len() <= zone.len() + 1 {
        return Err(mismatch());
    }

    let split = fqdn.len() - zone.len();
    if !fqdn.is_char_boundary(split) {
        return Err(mismatch());
    }
    let (name, suffix) = fqdn.split_at(split);
    if !suffix.eq_ignore_ascii_case(zone) {
        return Err(mismatch());
    }

    match name.strip_suffix('.') {
        Some("") => Err(DnsProviderError::EmptyRecordName {
            fqdn: fqdn.to_string(),
        }),
        Some(name) => Ok(name.to_string()),
        None => Err(mismatch()),
    }
}

/// Compare a served TXT value with the expected one, ignoring surrounding quotes
pub fn txt_value_matches(served: &str, expected: &str) -> bool {
    served.trim_matches('"') == expected.trim_matches('"')
}

fn ensure_txt(record_type: &str) -> DnsResult<()> {
    if record_type.eq_ignore_ascii_case(TXT_RECORD) {
        Ok(())
    } else {
        Err(DnsProviderError::UnsupportedRecordType(
            record_type.to_string(),
        ))
    }
}

/// Publishes and removes DNS-01 challenge records
///
/// Implementations must be thread-safe. A successful `provision` means the
/// record is visible to the authority, so implementations that can verify
/// propagation do it before returning.
#[async_trait]
pub trait Provisioner: Send + Sync + Debug {
    /// Returns the provider name (e.g., "digitalocean", "webhook")
    fn name(&self) -> &'static str;

    /// Create the record `fqdn` of `record_type` with `value`
    ///
    /// On error, including cancellation, no record is left behind; callers
    /// only unprovision after a successful provision.
    ///
    /// Fails with [`DnsProviderError::DomainMismatch`] when `fqdn` is outside
    /// the managed zone and [`DnsProviderError::UnsupportedRecordType`] for
    /// anything but TXT.
    async fn provision(
        &self,
        cancel: &CancellationToken,
        record_type: &str,
        fqdn: &str,
        value: &str,
    ) -> DnsResult<()>;

    /// Remove exactly the record matching name, type and value
    ///
    /// Fails with [`DnsProviderError::RecordNotFound`] if there is none.
    async fn unprovision(
        &self,
        cancel: &CancellationToken,
        record_type: &str,
        fqdn: &str,
        value: &str,
    ) -> DnsResult<()>;
}

/// A record as listed by a zone API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRecord {
    /// Provider record ID
    pub id: String,
    /// Name relative to the zone
    pub name: String,
    pub record_type: String,
    pub value: String,
}

/// Record CRUD within a single DNS zone
#[async_trait]
pub trait RecordApi: Send + Sync + Debug {
    /// Returns the provider name
    fn name(&self) -> &'static str;

    /// The managed zone (e.g. "example.com")
    fn zone(&self) -> &str;

    /// Create a record; `name` is relative to the zone. Returns the record ID.
    async fn create_record(
        &self,
        name: &str,
        record_type: &str,
        value: &str,
        ttl: u32,
    ) -> DnsResult<String>;

    /// List records with the given relative name and type
    async fn list_records(&self, name: &str, record_type: &str) -> DnsResult<Vec<ZoneRecord>>;

    /// Delete a record by ID
    async fn delete_record(&self, record_id: &str) -> DnsResult<()>;
}

/// [`Provisioner`] over a [`RecordApi`]
///
/// Checks the record type and zone boundary, optionally waits for
/// propagation, and removes only value-matching records.
#[derive(Debug)]
pub struct ZoneProvisioner<A> {
    api: A,
    verifier: Option<PropagationVerifier>,
}

impl<A: RecordApi> ZoneProvisioner<A> {
    /// Create a provisioner that returns as soon as the API accepts the record
    pub fn new(api: A) -> Self {
        Self {
            api,
            verifier: None,
        }
    }

    /// Verify propagation before `provision` returns
    pub fn with_verifier(mut self, verifier: PropagationVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Get the underlying record API
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Best-effort removal of a record `provision` is not handing over
    async fn discard(&self, fqdn: &str, record_id: &str) {
        if let Err(e) = self.api.delete_record(record_id).await {
            warn!(
                record = %fqdn,
                record_id = %record_id,
                error = %e,
                "Failed to remove abandoned challenge record"
            );
        }
    }
}

#[async_trait]
impl<A: RecordApi> Provisioner for ZoneProvisioner<A> {
    fn name(&self) -> &'static str {
        self.api.name()
    }

    async fn provision(
        &self,
        cancel: &CancellationToken,
        record_type: &str,
        fqdn: &str,
        value: &str,
    ) -> DnsResult<()> {
        ensure_txt(record_type)?;
        let name = relative_record_name(fqdn, self.api.zone())?;

        debug!(
            provider = self.api.name(),
            zone = %self.api.zone(),
            record = %fqdn,
            name = %name,
            "Creating challenge record"
        );

        if cancel.is_cancelled() {
            return Err(DnsProviderError::Cancelled);
        }

        // Runs to completion so the record ID is known; the API timeout bounds it
        let record_id = self
            .api
            .create_record(&name, TXT_RECORD, value, CHALLENGE_TTL)
            .await?;

        if cancel.is_cancelled() {
            debug!(record = %fqdn, record_id = %record_id, "Cancelled during create, removing record");
            self.discard(fqdn, &record_id).await;
            return Err(DnsProviderError::Cancelled);
        }

        if let Some(verifier) = &self.verifier {
            if let Err(e) = verifier.verify(fqdn, value, cancel).await {
                warn!(record = %fqdn, error = %e, "Challenge record did not propagate");
                self.discard(fqdn, &record_id).await;
                return Err(e);
            }
        }

        info!(
            provider = self.api.name(),
            record = %fqdn,
            record_id = %record_id,
            "Challenge record provisioned"
        );
        Ok(())
    }

    async fn unprovision(
        &self,
        cancel: &CancellationToken,
        record_type: &str,
        fqdn: &str,
        value: &str,
    ) -> DnsResult<()> {
        ensure_txt(record_type)?;
        let name = relative_record_name(fqdn, self.api.zone())?;

        let records = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DnsProviderError::Cancelled),
            listed = self.api.list_records(&name, TXT_RECORD) => listed?,
        };

        let matching: Vec<ZoneRecord> = records
            .into_iter()
            .filter(|r| {
                r.name.eq_ignore_ascii_case(&name)
                    && r.record_type.eq_ignore_ascii_case(TXT_RECORD)
                    && txt_value_matches(&r.value, value)
            })
            .collect();

        if matching.is_empty() {
            return Err(DnsProviderError::RecordNotFound {
                record_name: fqdn.to_string(),
            });
        }

        for record in matching {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DnsProviderError::Cancelled),
                deleted = self.api.delete_record(&record.id) => deleted?,
            }
            debug!(record = %fqdn, record_id = %record.id, "Challenge record removed");
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory zone for testing
    #[derive(Debug)]
    pub struct MemoryZone {
        zone: String,
        pub records: Mutex<Vec<ZoneRecord>>,
        next_id: AtomicU64,
        pub fail_on_create: bool,
        pub create_delay: Duration,
    }

    impl MemoryZone {
        pub fn new(zone: &str) -> Self {
            Self {
                zone: zone.to_string(),
                records: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                fail_on_create: false,
                create_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl RecordApi for MemoryZone {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn zone(&self) -> &str {
            &self.zone
        }

        async fn create_record(
            &self,
            name: &str,
            record_type: &str,
            value: &str,
            _ttl: u32,
        ) -> DnsResult<String> {
            if !self.create_delay.is_zero() {
                tokio::time::sleep(self.create_delay).await;
            }
            if self.fail_on_create {
                return Err(DnsProviderError::RecordCreation {
                    record_name: name.to_string(),
                    message: "Mock failure".to_string(),
                });
            }
            let id = format!("record-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.records.lock().push(ZoneRecord {
                id: id.clone(),
                name: name.to_string(),
                record_type: record_type.to_string(),
                value: value.to_string(),
            });
            Ok(id)
        }

        async fn list_records(&self, name: &str, record_type: &str) -> DnsResult<Vec<ZoneRecord>> {
            Ok(self
                .records
                .lock()
                .iter()
                .filter(|r| r.name == name && r.record_type == record_type)
                .cloned()
                .collect())
        }

        async fn delete_record(&self, record_id: &str) -> DnsResult<()> {
            self.records.lock().retain(|r| r.id != record_id);
            Ok(())
        }
    }

    #[test]
    fn test_challenge_record_fqdn() {
        assert_eq!(
            challenge_record_fqdn("example.com"),
            "_acme-challenge.example.com"
        );
        assert_eq!(
            challenge_record_fqdn("sub.example.com."),
            "_acme-challenge.sub.example.com"
        );
    }

    #[test]
    fn test_relative_record_name_zone_boundary() {
        assert_eq!(
            relative_record_name("_acme-challenge.example.test", "test").unwrap(),
            "_acme-challenge.example"
        );
        assert!(matches!(
            relative_record_name("_acme-challenge.example.test", "other.test"),
            Err(DnsProviderError::DomainMismatch { .. })
        ));
    }

    #[test]
    fn test_relative_record_name_edge_cases() {
        assert_eq!(
            relative_record_name("_acme-challenge.www.Example.COM.", "example.com.").unwrap(),
            "_acme-challenge.www"
        );
        assert!(matches!(
            relative_record_name("example.com", "example.com"),
            Err(DnsProviderError::EmptyRecordName { .. })
        ));
        // Suffix match must fall on a label boundary
        assert!(matches!(
            relative_record_name("_acme-challenge.badexample.com", "example.com"),
            Err(DnsProviderError::DomainMismatch { .. })
        ));
        assert!(matches!(
            relative_record_name("_acme-challenge.example.com", ""),
            Err(DnsProviderError::DomainMismatch { .. })
        ));
    }

    #[test]
    fn test_txt_value_matches() {
        assert!(txt_value_matches("\"abc\"", "abc"));
        assert!(txt_value_matches("abc", "abc"));
        assert!(!txt_value_matches("abcd", "abc"));
    }

    proptest! {
        #[test]
        fn prop_relative_name_round_trip(
            name in "[a-z0-9_-]{1,12}(\\.[a-z0-9-]{1,12}){0,3}",
            zone in "[a-z0-9-]{1,12}(\\.[a-z]{2,6}){0,2}",
        ) {
            let fqdn = format!("{}.{}", name, zone);
            prop_assert_eq!(relative_record_name(&fqdn, &zone).unwrap(), name);
        }

        #[test]
        fn prop_foreign_zone_rejected(
            name in "[a-z0-9_-]{1,12}",
            zone in "[a-z]{1,12}\\.com",
        ) {
            let fqdn = format!("{}.{}.org", name, zone);
            let rejected = matches!(
                relative_record_name(&fqdn, &zone),
                Err(DnsProviderError::DomainMismatch { .. })
            );
            prop_assert!(rejected);
        }
    }

    #[tokio::test]
    async fn test_provision_rejects_non_txt() {
        let provisioner = ZoneProvisioner::new(MemoryZone::new("example.com"));
        let cancel = CancellationToken::new();

        let err = provisioner
            .provision(&cancel, "A", "_acme-challenge.example.com", "v")
            .await
            .unwrap_err();
        assert!(matches!(err, DnsProviderError::UnsupportedRecordType(ref t) if t == "A"));
        assert!(provisioner.api().records.lock().is_empty());
    }

    #[tokio::test]
    async fn test_provision_domain_mismatch() {
        let provisioner = ZoneProvisioner::new(MemoryZone::new("other.test"));
        let cancel = CancellationToken::new();

        let err = provisioner
            .provision(&cancel, "TXT", "_acme-challenge.example.test", "v")
            .await
            .unwrap_err();
        assert!(matches!(err, DnsProviderError::DomainMismatch { .. }));
    }

    #[tokio::test]
    async fn test_provision_and_unprovision() {
        let provisioner = ZoneProvisioner::new(MemoryZone::new("test"));
        let cancel = CancellationToken::new();

        provisioner
            .provision(&cancel, "TXT", "_acme-challenge.example.test", "token-value")
            .await
            .unwrap();

        {
            let records = provisioner.api().records.lock();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].name, "_acme-challenge.example");
            assert_eq!(records[0].value, "token-value");
        }

        provisioner
            .unprovision(&cancel, "TXT", "_acme-challenge.example.test", "token-value")
            .await
            .unwrap();
        assert!(provisioner.api().records.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unprovision_only_matching_value() {
        let provisioner = ZoneProvisioner::new(MemoryZone::new("example.com"));
        let cancel = CancellationToken::new();
        let fqdn = "_acme-challenge.www.example.com";

        provisioner.provision(&cancel, "TXT", fqdn, "old").await.unwrap();
        provisioner.provision(&cancel, "TXT", fqdn, "new").await.unwrap();

        provisioner.unprovision(&cancel, "TXT", fqdn, "old").await.unwrap();

        let records = provisioner.api().records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, "new");
    }

    #[tokio::test]
    async fn test_unprovision_not_found() {
        let provisioner = ZoneProvisioner::new(MemoryZone::new("example.com"));
        let cancel = CancellationToken::new();

        let err = provisioner
            .unprovision(&cancel, "TXT", "_acme-challenge.www.example.com", "missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_provision_cancelled() {
        let provisioner = ZoneProvisioner::new(MemoryZone::new("example.com"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = provisioner
            .provision(&cancel, "TXT", "_acme-challenge.www.example.com", "v")
            .await
            .unwrap_err();
        assert!(matches!(err, DnsProviderError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_create_leaves_no_record() {
        let mut zone = MemoryZone::new("example.com");
        zone.create_delay = Duration::from_secs(2);
        let provisioner = std::sync::Arc::new(ZoneProvisioner::new(zone));
        let cancel = CancellationToken::new();

        let task = {
            let provisioner = provisioner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                provisioner
                    .provision(&cancel, "TXT", "_acme-challenge.www.example.com", "v")
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, DnsProviderError::Cancelled));
        assert!(provisioner.api().records.lock().is_empty());
    }
}
