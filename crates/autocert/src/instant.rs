//! [`AcmeClient`] over `instant-acme`
//!
//! Account credentials (P-256 account key plus account URL) are persisted by
//! the [`KeyMaterialStore`] so later registrations reuse the same account.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountBuilder, AccountCredentials, ChallengeType, HttpClient, Identifier,
    NewAccount, NewOrder, Order, OrderStatus,
};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::client::{
    AcmeClient, Authorization, AuthorizationStatus, ChallengeKind, OfferedChallenge,
    TermsPredicate,
};
use crate::error::AcmeError;
use crate::storage::KeyMaterialStore;

/// Timeout for an authorization to leave the pending state
const AUTHORIZATION_TIMEOUT: Duration = Duration::from_secs(120);
/// Timeout for order finalization and certificate download
const ISSUANCE_TIMEOUT: Duration = Duration::from_secs(60);
/// Delay between order/authorization polls
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The order currently being worked on
struct PendingOrder {
    domain: String,
    order: Order,
    /// DNS-01 record values keyed by challenge URL
    dns_values: HashMap<String, String>,
}

/// Builds the HTTP transport used for ACME requests
pub type HttpClientFactory = Arc<dyn Fn() -> Box<dyn HttpClient> + Send + Sync>;

/// ACME client backed by `instant-acme`
pub struct InstantAcmeClient {
    directory_url: String,
    store: KeyMaterialStore,
    http: reqwest::Client,
    acme_http: Option<HttpClientFactory>,
    account: RwLock<Option<Account>>,
    pending: Mutex<Option<PendingOrder>>,
}

impl InstantAcmeClient {
    /// Create a client for the given directory
    ///
    /// Account credentials are read from and written to `store`.
    pub fn new(directory_url: impl Into<String>, store: KeyMaterialStore) -> Self {
        crate::install_crypto_provider();

        Self {
            directory_url: directory_url.into(),
            store,
            http: reqwest::Client::new(),
            acme_http: None,
            account: RwLock::new(None),
            pending: Mutex::new(None),
        }
    }

    /// Use a custom transport for ACME requests (test PKIs, proxies)
    ///
    /// The default is `instant-acme`'s HTTPS-only client.
    pub fn with_http_client(mut self, factory: HttpClientFactory) -> Self {
        self.acme_http = Some(factory);
        self
    }

    /// Get the directory URL
    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    fn account_builder(&self) -> Result<AccountBuilder, AcmeError> {
        match &self.acme_http {
            Some(factory) => Ok(Account::builder_with_http(factory())),
            None => Account::builder().map_err(|e| AcmeError::Registration(e.to_string())),
        }
    }

    /// Fetch the terms-of-service URL advertised in the directory
    async fn terms_of_service(&self) -> Result<Option<String>, AcmeError> {
        #[derive(Deserialize)]
        struct Directory {
            #[serde(default)]
            meta: Option<DirectoryMeta>,
        }

        #[derive(Deserialize)]
        struct DirectoryMeta {
            #[serde(rename = "termsOfService")]
            terms_of_service: Option<String>,
        }

        let directory: Directory = self
            .http
            .get(&self.directory_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AcmeError::Registration(format!("Failed to fetch directory: {}", e)))?
            .json()
            .await
            .map_err(|e| AcmeError::Registration(format!("Invalid directory document: {}", e)))?;

        Ok(directory.meta.and_then(|m| m.terms_of_service))
    }

    async fn load_account(&self, json: &str) -> Result<Account, AcmeError> {
        self.check_stored_directory(json)?;

        let credentials: AccountCredentials = serde_json::from_str(json).map_err(|e| {
            AcmeError::Registration(format!("Failed to deserialize credentials: {}", e))
        })?;

        self.account_builder()?
            .from_credentials(credentials)
            .await
            .map_err(|e| AcmeError::Registration(e.to_string()))
    }

    /// Stored credentials carry their own directory and `instant-acme`
    /// talks to that one, so a mismatch would silently keep the old CA.
    fn check_stored_directory(&self, json: &str) -> Result<(), AcmeError> {
        let stored: serde_json::Value = serde_json::from_str(json).map_err(|e| {
            AcmeError::Registration(format!("Failed to deserialize credentials: {}", e))
        })?;

        // Credentials from old instant-acme versions carry URLs instead
        let Some(stored_url) = stored.get("directory").and_then(|d| d.as_str()) else {
            return Ok(());
        };

        if stored_url.trim_end_matches('/') != self.directory_url.trim_end_matches('/') {
            return Err(AcmeError::Configuration(format!(
                "stored ACME account in {} belongs to directory {} but {} is configured; \
                 use a separate cache directory per ACME directory",
                self.store.account_path().display(),
                stored_url,
                self.directory_url
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    async fn register(&self, email: &str, accept_tos: &TermsPredicate) -> Result<(), AcmeError> {
        if self.account.read().await.is_some() {
            return Err(AcmeError::AlreadyRegistered);
        }

        let mut account_slot = self.account.write().await;
        if account_slot.is_some() {
            return Err(AcmeError::AlreadyRegistered);
        }

        if let Some(json) = self.store.load_account_json()? {
            info!("Loading existing ACME account from storage");
            *account_slot = Some(self.load_account(&json).await?);
            return Err(AcmeError::AlreadyRegistered);
        }

        let terms_agreed = match self.terms_of_service().await? {
            Some(url) => {
                if !accept_tos(&url) {
                    return Err(AcmeError::TermsRejected { url });
                }
                debug!(terms = %url, "Terms of service accepted");
                true
            }
            None => false,
        };

        info!(email = %email, directory = %self.directory_url, "Creating new ACME account");

        let contact = format!("mailto:{}", email);
        let result = self
            .account_builder()?
            .create(
                &NewAccount {
                    contact: &[&contact],
                    terms_of_service_agreed: terms_agreed,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await;

        let (account, credentials) = match result {
            Ok(created) => created,
            Err(instant_acme::Error::Api(problem)) if problem.status == Some(409) => {
                return Err(AcmeError::AlreadyRegistered);
            }
            Err(e) => return Err(AcmeError::Registration(e.to_string())),
        };

        let json = serde_json::to_string_pretty(&credentials).map_err(|e| {
            AcmeError::Registration(format!("Failed to serialize credentials: {}", e))
        })?;
        self.store.save_account_json(&json)?;

        *account_slot = Some(account);
        info!("ACME account created");
        Ok(())
    }

    async fn authorize(&self, domain: &str) -> Result<Authorization, AcmeError> {
        let account_guard = self.account.read().await;
        let account = account_guard
            .as_ref()
            .ok_or_else(|| AcmeError::Configuration("ACME account not registered".to_string()))?;

        let authz_error = |message: String| AcmeError::Authorization {
            domain: domain.to_string(),
            message,
        };

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| authz_error(e.to_string()))?;

        let mut result = None;
        let mut dns_values = HashMap::new();

        {
            let mut authorizations = order.authorizations();
            while let Some(next) = authorizations.next().await {
                let mut authz = next.map_err(|e| authz_error(e.to_string()))?;

                let identifier = authz.identifier();
                let authz_domain = match &identifier.identifier {
                    Identifier::Dns(name) => name.clone(),
                    _ => continue,
                };
                if authz_domain != domain {
                    continue;
                }

                let status = map_authorization_status(&authz.status);
                let challenges: Vec<OfferedChallenge> = authz
                    .challenges
                    .iter()
                    .map(|c| OfferedChallenge {
                        kind: map_challenge_type(&c.r#type),
                        token: c.token.clone(),
                        url: c.url.clone(),
                    })
                    .collect();

                if let Some(challenge) = authz.challenge(ChallengeType::Dns01) {
                    dns_values.insert(
                        challenge.url.clone(),
                        challenge.key_authorization().dns_value(),
                    );
                }

                debug!(
                    domain = %domain,
                    status = ?status,
                    challenges = challenges.len(),
                    "Fetched authorization"
                );

                result = Some(Authorization {
                    domain: domain.to_string(),
                    status,
                    challenges,
                });
            }
        }

        let authorization =
            result.ok_or_else(|| authz_error("order contains no authorization".to_string()))?;

        *self.pending.lock().await = Some(PendingOrder {
            domain: domain.to_string(),
            order,
            dns_values,
        });

        Ok(authorization)
    }

    async fn dns01_record_value(&self, challenge: &OfferedChallenge) -> Result<String, AcmeError> {
        let pending = self.pending.lock().await;
        pending
            .as_ref()
            .and_then(|p| p.dns_values.get(&challenge.url).cloned())
            .ok_or_else(|| {
                AcmeError::Protocol(format!("No DNS-01 challenge pending for {}", challenge.url))
            })
    }

    async fn accept(&self, challenge: &OfferedChallenge) -> Result<(), AcmeError> {
        let mut pending = self.pending.lock().await;
        let pending = pending
            .as_mut()
            .ok_or_else(|| AcmeError::ChallengeAccept("no order in progress".to_string()))?;

        debug!(challenge_url = %challenge.url, "Setting challenge ready");

        let mut authorizations = pending.order.authorizations();
        while let Some(next) = authorizations.next().await {
            let mut authz = next.map_err(|e| AcmeError::ChallengeAccept(e.to_string()))?;

            let matching_type = authz
                .challenges
                .iter()
                .find(|c| c.url == challenge.url)
                .map(|c| c.r#type.clone());

            if let Some(challenge_type) = matching_type {
                if let Some(mut handle) = authz.challenge(challenge_type) {
                    handle
                        .set_ready()
                        .await
                        .map_err(|e| AcmeError::ChallengeAccept(e.to_string()))?;
                    return Ok(());
                }
            }
        }

        Err(AcmeError::ChallengeAccept(format!(
            "Challenge not found for URL: {}",
            challenge.url
        )))
    }

    async fn wait_authorization(
        &self,
        authorization: &Authorization,
    ) -> Result<AuthorizationStatus, AcmeError> {
        let deadline = tokio::time::Instant::now() + AUTHORIZATION_TIMEOUT;
        let mut pending = self.pending.lock().await;
        let pending = pending
            .as_mut()
            .ok_or_else(|| AcmeError::Protocol("no order in progress".to_string()))?;

        loop {
            let mut status = None;
            let mut authorizations = pending.order.authorizations();
            while let Some(next) = authorizations.next().await {
                let authz = next?;
                let identifier = authz.identifier();
                if let Identifier::Dns(name) = &identifier.identifier {
                    if *name == authorization.domain {
                        status = Some(map_authorization_status(&authz.status));
                    }
                }
            }

            match status {
                Some(AuthorizationStatus::Pending) => {
                    trace!(domain = %authorization.domain, "Authorization still pending");
                }
                Some(status) => return Ok(status),
                None => {
                    return Err(AcmeError::Protocol(format!(
                        "Authorization for '{}' disappeared from order",
                        authorization.domain
                    )));
                }
            }

            if tokio::time::Instant::now() > deadline {
                return Err(AcmeError::Timeout(format!(
                    "authorization for '{}' still pending",
                    authorization.domain
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn create_cert(&self, csr_der: &[u8]) -> Result<String, AcmeError> {
        let PendingOrder {
            domain, mut order, ..
        } = self
            .pending
            .lock()
            .await
            .take()
            .ok_or_else(|| AcmeError::Issuance("no order in progress".to_string()))?;

        let deadline = tokio::time::Instant::now() + ISSUANCE_TIMEOUT;

        // The order turns ready shortly after its last authorization is valid
        loop {
            let state = order.refresh().await?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Processing | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(AcmeError::Issuance("Order became invalid".to_string()));
                }
                _ => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout(
                            "order did not become ready".to_string(),
                        ));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        info!(domain = %domain, "Finalizing certificate order");
        order
            .finalize_csr(csr_der)
            .await
            .map_err(|e| AcmeError::Issuance(format!("Failed to finalize order: {}", e)))?;

        loop {
            let state = order.refresh().await?;
            match state.status {
                OrderStatus::Valid => {
                    let chain = order.certificate().await.map_err(|e| {
                        AcmeError::Issuance(format!("Failed to download certificate: {}", e))
                    })?;
                    return chain.ok_or_else(|| {
                        AcmeError::Issuance("No certificate in response".to_string())
                    });
                }
                OrderStatus::Invalid => {
                    warn!(domain = %domain, "Order became invalid after finalization");
                    return Err(AcmeError::Issuance("Order became invalid".to_string()));
                }
                _ => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout(
                            "Timed out waiting for certificate".to_string(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

fn map_authorization_status(status: &instant_acme::AuthorizationStatus) -> AuthorizationStatus {
    use instant_acme::AuthorizationStatus as Status;

    #[allow(unreachable_patterns)]
    match status {
        Status::Pending => AuthorizationStatus::Pending,
        Status::Valid => AuthorizationStatus::Valid,
        Status::Invalid => AuthorizationStatus::Invalid,
        Status::Deactivated => AuthorizationStatus::Deactivated,
        Status::Expired => AuthorizationStatus::Expired,
        Status::Revoked => AuthorizationStatus::Revoked,
        _ => AuthorizationStatus::Invalid,
    }
}

fn map_challenge_type(challenge_type: &ChallengeType) -> ChallengeKind {
    match challenge_type {
        ChallengeType::Dns01 => ChallengeKind::Dns01,
        ChallengeType::Http01 => ChallengeKind::Http01,
        ChallengeType::TlsAlpn01 => ChallengeKind::TlsAlpn01,
        other => ChallengeKind::Other(format!("{:?}", other)),
    }
}

impl std::fmt::Debug for InstantAcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeClient")
            .field("directory_url", &self.directory_url)
            .field("cache_dir", &self.store.cache_dir())
            .field(
                "has_account",
                &self
                    .account
                    .try_read()
                    .map(|a| a.is_some())
                    .unwrap_or(false),
            )
            .finish()
    }
}
