//! Certificate manager
//!
//! Owns the live certificate for one domain and runs the DNS-01 issuance
//! sequence against the authority. Readers (TLS handshakes) only ever take
//! a short read lock on the live slot; a renewal holds a separate mutex for
//! its whole duration and swaps the slot once at the end.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use autocert_config::{Config, LETSENCRYPT_PRODUCTION};

use crate::client::{
    accept_tos, AcmeClient, Authorization, AuthorizationStatus, OfferedChallenge, TermsPredicate,
};
use crate::dns::{challenge_record_fqdn, DnsProviderError, Provisioner, TXT_RECORD};
use crate::error::{AcmeError, StorageError};
use crate::instant::InstantAcmeClient;
use crate::scheduler::{self, renewal_delay, RenewalHandle};
use crate::storage::{CachedCertificate, KeyMaterialStore};

/// Default renewal window (5 days before expiry)
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(5 * 24 * 3600);

/// Upper bound for removing a challenge record
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives every error that ends a renewal attempt
pub type ErrorCallback = Arc<dyn Fn(&AcmeError) + Send + Sync>;

/// Settings for a [`CertificateManager`]
///
/// Immutable once handed to the manager.
#[derive(Clone)]
pub struct ManagerConfig {
    /// ACME directory URL; empty means Let's Encrypt production
    pub directory_url: String,
    /// Terms of service decision; required
    pub accept_tos: Option<TermsPredicate>,
    /// Cache directory for keys and certificates
    pub cache_dir: PathBuf,
    /// Account contact email; required
    pub email: String,
    /// Domain the certificate is issued for
    pub domain: String,
    /// Renew this long before `notAfter`
    pub renew_before: Duration,
    /// Publishes the challenge records; required
    pub provisioner: Option<Arc<dyn Provisioner>>,
    /// Error reporting hook
    pub on_error: Option<ErrorCallback>,
}

impl ManagerConfig {
    /// Settings for `domain` with defaults for everything optional
    pub fn new(domain: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            directory_url: LETSENCRYPT_PRODUCTION.to_string(),
            accept_tos: None,
            cache_dir: PathBuf::from("certs"),
            email: email.into(),
            domain: domain.into(),
            renew_before: DEFAULT_RENEW_BEFORE,
            provisioner: None,
            on_error: None,
        }
    }

    /// Build from a loaded configuration file
    ///
    /// The terms predicate is [`accept_tos`] only when the file sets
    /// `accept-tos`; otherwise renewal fails its configuration check.
    pub fn from_config(config: &Config, provisioner: Arc<dyn Provisioner>) -> Self {
        let acme = &config.acme;
        let mut manager_config = Self::new(acme.domain.clone(), acme.email.clone())
            .with_directory_url(acme.directory_url())
            .with_cache_dir(acme.cache_dir.clone())
            .with_renew_before(Duration::from_secs(
                u64::from(acme.renew_before_days) * 24 * 3600,
            ))
            .with_provisioner(provisioner);

        if acme.accept_tos {
            manager_config = manager_config.with_terms(Arc::new(accept_tos));
        }
        manager_config
    }

    pub fn with_directory_url(mut self, url: impl Into<String>) -> Self {
        self.directory_url = url.into();
        self
    }

    pub fn with_terms(mut self, predicate: TermsPredicate) -> Self {
        self.accept_tos = Some(predicate);
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_renew_before(mut self, renew_before: Duration) -> Self {
        self.renew_before = renew_before;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// Directory URL with the production default applied
    pub fn effective_directory_url(&self) -> &str {
        if self.directory_url.trim().is_empty() {
            LETSENCRYPT_PRODUCTION
        } else {
            &self.directory_url
        }
    }

    /// Check required fields, returning the terms predicate and provisioner
    fn require(&self) -> Result<(&TermsPredicate, &Arc<dyn Provisioner>), AcmeError> {
        if self.email.trim().is_empty() {
            return Err(AcmeError::Configuration("account email is required".into()));
        }
        if self.domain.trim().is_empty() {
            return Err(AcmeError::Configuration("domain is required".into()));
        }
        let tos = self.accept_tos.as_ref().ok_or_else(|| {
            AcmeError::Configuration("terms of service predicate is required".into())
        })?;
        let provisioner = self
            .provisioner
            .as_ref()
            .ok_or_else(|| AcmeError::Configuration("DNS provisioner is required".into()))?;
        Ok((tos, provisioner))
    }
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("directory_url", &self.directory_url)
            .field("accept_tos", &self.accept_tos.is_some())
            .field("cache_dir", &self.cache_dir)
            .field("email", &self.email)
            .field("domain", &self.domain)
            .field("renew_before", &self.renew_before)
            .field("provisioner", &self.provisioner.as_ref().map(|p| p.name()))
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// The certificate currently served
#[derive(Clone)]
pub struct LiveCertificate {
    /// Chain and signing key, ready for rustls
    pub certified_key: Arc<CertifiedKey>,
    /// Leaf `notBefore`
    pub not_before: DateTime<Utc>,
    /// Leaf `notAfter`
    pub not_after: DateTime<Utc>,
}

impl LiveCertificate {
    fn new(cert: &CachedCertificate, key: &KeyPair) -> Result<Self, AcmeError> {
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

        let signing_key = provider.key_provider.load_private_key(key_der).map_err(|e| {
            AcmeError::CertificateParse(format!("Failed to load private key: {}", e))
        })?;

        Ok(Self {
            certified_key: Arc::new(CertifiedKey::new(cert.chain.clone(), signing_key)),
            not_before: cert.not_before,
            not_after: cert.not_after,
        })
    }
}

impl std::fmt::Debug for LiveCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCertificate")
            .field("chain_len", &self.certified_key.cert.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// Obtains, caches and renews the certificate for one domain
pub struct CertificateManager {
    config: ManagerConfig,
    client: Arc<dyn AcmeClient>,
    store: KeyMaterialStore,
    live: RwLock<Option<LiveCertificate>>,
    /// Held for the whole renewal sequence
    renewal_lock: Mutex<()>,
    running: AtomicBool,
}

impl CertificateManager {
    /// Create a manager talking to the configured directory
    pub fn new(config: ManagerConfig) -> Self {
        let store = KeyMaterialStore::new(config.cache_dir.clone());
        let client = InstantAcmeClient::new(config.effective_directory_url(), store.clone());
        Self::with_client(config, Arc::new(client))
    }

    /// Create a manager over a custom ACME client
    pub fn with_client(config: ManagerConfig, client: Arc<dyn AcmeClient>) -> Self {
        let store = KeyMaterialStore::new(config.cache_dir.clone());
        Self {
            config,
            client,
            store,
            live: RwLock::new(None),
            renewal_lock: Mutex::new(()),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn store(&self) -> &KeyMaterialStore {
        &self.store
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// The live certificate for a TLS handshake
    ///
    /// Never blocks on renewal. Fails only when no certificate has been
    /// obtained yet.
    pub fn get_certificate(&self) -> Result<Arc<CertifiedKey>, AcmeError> {
        self.live
            .read()
            .as_ref()
            .map(|live| Arc::clone(&live.certified_key))
            .ok_or(AcmeError::NoCertificate)
    }

    /// Snapshot of the live certificate
    pub fn live(&self) -> Option<LiveCertificate> {
        self.live.read().clone()
    }

    /// Time until the live certificate enters its renewal window
    ///
    /// `None` when no certificate is live.
    pub fn next_renewal_delay(&self) -> Option<Duration> {
        self.live
            .read()
            .as_ref()
            .map(|live| renewal_delay(live.not_after, self.config.renew_before, Utc::now()))
    }

    // =========================================================================
    // Run
    // =========================================================================

    /// Load or issue the certificate, then keep it renewed in the background
    ///
    /// The first pass runs before this returns and its error is returned
    /// directly. The background task stops when `cancel` fires or a renewal
    /// fails; it never retries on its own.
    pub async fn run(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<RenewalHandle, AcmeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AcmeError::AlreadyRunning);
        }

        if let Err(e) = self.load_or_renew(&cancel).await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        Ok(scheduler::spawn(Arc::clone(self), cancel))
    }

    pub(crate) fn finish_run(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Use the cached certificate when it is outside its renewal window,
    /// otherwise renew
    pub async fn load_or_renew(&self, cancel: &CancellationToken) -> Result<(), AcmeError> {
        match self.load_cached() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => {
                self.report(&e);
                return Err(e);
            }
        }
        self.renew(cancel).await
    }

    /// Returns whether a usable cached certificate went live
    fn load_cached(&self) -> Result<bool, AcmeError> {
        let domain = &self.config.domain;
        let cert_path = self.store.cert_path(domain);

        let cached = match self.store.load_certificate(&cert_path) {
            Ok(cached) => cached,
            Err(e) if e.is_not_found() => {
                debug!(domain = %domain, "No cached certificate");
                return Ok(false);
            }
            Err(StorageError::Malformed { path, reason }) => {
                warn!(
                    path = %path.display(),
                    reason = %reason,
                    "Cached certificate is malformed, issuing a new one"
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let delay = renewal_delay(cached.not_after, self.config.renew_before, Utc::now());
        if delay.is_zero() {
            info!(
                domain = %domain,
                not_after = %cached.not_after,
                "Cached certificate is within its renewal window"
            );
            return Ok(false);
        }

        let key = match self.store.load_or_create_key(&self.store.key_path(domain)) {
            Ok(key) => key,
            Err(StorageError::Malformed { path, reason }) => {
                warn!(
                    path = %path.display(),
                    reason = %reason,
                    "Domain key is malformed, ignoring cached certificate"
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if !key_matches(&cached, &key) {
            warn!(domain = %domain, "Cached certificate does not match the domain key");
            return Ok(false);
        }

        let live = LiveCertificate::new(&cached, &key)?;
        self.swap(live);

        info!(
            domain = %domain,
            not_after = %cached.not_after,
            renew_in_secs = delay.as_secs(),
            "Using cached certificate"
        );
        Ok(true)
    }

    // =========================================================================
    // Renew
    // =========================================================================

    /// Run the full issuance sequence and swap in the new certificate
    ///
    /// Concurrent calls are serialized. Every error, cancellation included,
    /// is passed to the error callback before it is returned.
    pub async fn renew(&self, cancel: &CancellationToken) -> Result<(), AcmeError> {
        let _guard = self.renewal_lock.lock().await;

        let start = Instant::now();
        match self.renew_locked(cancel).await {
            Ok(()) => {
                info!(
                    domain = %self.config.domain,
                    duration_ms = start.elapsed().as_millis(),
                    "Certificate renewed"
                );
                Ok(())
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    async fn renew_locked(&self, cancel: &CancellationToken) -> Result<(), AcmeError> {
        let (tos, provisioner) = self.config.require()?;
        let domain = self.config.domain.as_str();

        info!(domain = %domain, "Starting certificate renewal");

        match cancellable(cancel, self.client.register(&self.config.email, tos)).await {
            Ok(()) => info!(email = %self.config.email, "ACME account registered"),
            Err(AcmeError::AlreadyRegistered) => {
                debug!(email = %self.config.email, "ACME account already registered")
            }
            Err(e) => return Err(e),
        }

        let authorization = cancellable(cancel, self.client.authorize(domain)).await?;

        match authorization.status {
            AuthorizationStatus::Valid => {
                debug!(domain = %domain, "Authorization already valid, skipping challenge");
            }
            AuthorizationStatus::Pending => {
                self.solve_dns01(&authorization, provisioner, cancel).await?;
            }
            status => {
                return Err(AcmeError::ChallengeInvalid {
                    domain: domain.to_string(),
                    status,
                });
            }
        }

        let key = self.store.load_or_create_key(&self.store.key_path(domain))?;
        let csr = build_csr(domain, &key)?;

        let chain_pem = cancellable(cancel, self.client.create_cert(&csr)).await?;
        let cached = CachedCertificate::from_pem(&chain_pem).map_err(AcmeError::CertificateParse)?;
        let live = LiveCertificate::new(&cached, &key)?;

        self.store
            .save_certificate(&self.store.cert_path(domain), &chain_pem)?;
        self.swap(live);

        info!(
            domain = %domain,
            not_after = %cached.not_after,
            "New certificate is live"
        );
        Ok(())
    }

    /// Publish the challenge record, accept, wait, and always clean up
    async fn solve_dns01(
        &self,
        authorization: &Authorization,
        provisioner: &Arc<dyn Provisioner>,
        cancel: &CancellationToken,
    ) -> Result<(), AcmeError> {
        let domain = authorization.domain.as_str();
        let challenge = authorization
            .dns01()
            .ok_or_else(|| AcmeError::NoDns01Challenge(domain.to_string()))?;

        let value = cancellable(cancel, self.client.dns01_record_value(challenge)).await?;
        let fqdn = challenge_record_fqdn(domain);

        debug!(domain = %domain, record = %fqdn, "Provisioning challenge record");
        provisioner
            .provision(cancel, TXT_RECORD, &fqdn, &value)
            .await
            .map_err(provision_error)?;

        let cleanup = ChallengeCleanup::new(Arc::clone(provisioner), fqdn, value);
        let outcome = self.validate_challenge(authorization, challenge, cancel).await;
        cleanup.discharge().await;
        outcome
    }

    async fn validate_challenge(
        &self,
        authorization: &Authorization,
        challenge: &OfferedChallenge,
        cancel: &CancellationToken,
    ) -> Result<(), AcmeError> {
        cancellable(cancel, self.client.accept(challenge)).await?;

        let status =
            cancellable(cancel, self.client.wait_authorization(authorization)).await?;
        if status != AuthorizationStatus::Valid {
            return Err(AcmeError::ChallengeInvalid {
                domain: authorization.domain.clone(),
                status,
            });
        }

        info!(domain = %authorization.domain, "Domain authorization valid");
        Ok(())
    }

    fn swap(&self, live: LiveCertificate) {
        *self.live.write() = Some(live);
    }

    pub(crate) fn report(&self, err: &AcmeError) {
        if matches!(err, AcmeError::Cancelled) {
            info!(domain = %self.config.domain, "Certificate renewal cancelled");
        } else {
            error!(domain = %self.config.domain, error = %err, "Certificate renewal failed");
        }
        if let Some(ref callback) = self.config.on_error {
            callback(err);
        }
    }
}

impl ResolvesServerCert for CertificateManager {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.get_certificate().ok()
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("config", &self.config)
            .field("client", &self.client)
            .field("live", &*self.live.read())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

/// Removes a provisioned challenge record exactly once
///
/// Discharged explicitly after the authorization wait; if the renewal
/// future is dropped first, the removal is spawned onto the runtime.
struct ChallengeCleanup {
    provisioner: Arc<dyn Provisioner>,
    fqdn: String,
    value: String,
    discharged: bool,
}

impl ChallengeCleanup {
    fn new(provisioner: Arc<dyn Provisioner>, fqdn: String, value: String) -> Self {
        Self {
            provisioner,
            fqdn,
            value,
            discharged: false,
        }
    }

    async fn discharge(mut self) {
        self.discharged = true;
        unprovision_record(
            Arc::clone(&self.provisioner),
            std::mem::take(&mut self.fqdn),
            std::mem::take(&mut self.value),
        )
        .await;
    }
}

impl Drop for ChallengeCleanup {
    fn drop(&mut self) {
        if self.discharged {
            return;
        }

        let provisioner = Arc::clone(&self.provisioner);
        let fqdn = std::mem::take(&mut self.fqdn);
        let value = std::mem::take(&mut self.value);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(record = %fqdn, "Renewal dropped, removing challenge record in background");
                handle.spawn(unprovision_record(provisioner, fqdn, value));
            }
            Err(_) => {
                warn!(record = %fqdn, "No runtime available, challenge record left in place");
            }
        }
    }
}

/// Best-effort removal; failures are logged only
async fn unprovision_record(provisioner: Arc<dyn Provisioner>, fqdn: String, value: String) {
    // Runs even after the renewal was cancelled
    let cancel = CancellationToken::new();

    let result = tokio::time::timeout(
        CLEANUP_TIMEOUT,
        provisioner.unprovision(&cancel, TXT_RECORD, &fqdn, &value),
    )
    .await;

    match result {
        Ok(Ok(())) => debug!(record = %fqdn, "Challenge record removed"),
        Ok(Err(e)) if e.is_not_found() => {
            debug!(record = %fqdn, "Challenge record already absent")
        }
        Ok(Err(e)) => warn!(record = %fqdn, error = %e, "Failed to remove challenge record"),
        Err(_) => warn!(
            record = %fqdn,
            timeout_secs = CLEANUP_TIMEOUT.as_secs(),
            "Timed out removing challenge record"
        ),
    }
}

/// Await `fut` unless `cancel` fires first
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, AcmeError>
where
    F: Future<Output = Result<T, AcmeError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AcmeError::Cancelled),
        result = fut => result,
    }
}

fn provision_error(e: DnsProviderError) -> AcmeError {
    match e {
        DnsProviderError::Cancelled => AcmeError::Cancelled,
        e => AcmeError::Provision(e),
    }
}

/// DER-encoded CSR for `domain` signed with the domain key
fn build_csr(domain: &str, key: &KeyPair) -> Result<Vec<u8>, AcmeError> {
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| AcmeError::Issuance(format!("Failed to create CSR params: {}", e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(key)
        .map_err(|e| AcmeError::Issuance(format!("Failed to serialize CSR: {}", e)))?;
    Ok(csr.der().to_vec())
}

/// Whether the leaf certificate carries the public half of `key`
fn key_matches(cert: &CachedCertificate, key: &KeyPair) -> bool {
    let Some(leaf) = cert.chain.first() else {
        return false;
    };
    match x509_parser::parse_x509_certificate(leaf.as_ref()) {
        Ok((_, parsed)) => {
            parsed.public_key().subject_public_key.data.as_ref() == key.public_key_raw()
        }
        Err(_) => false,
    }
}
