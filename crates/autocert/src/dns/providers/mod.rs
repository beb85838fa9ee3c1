//! DNS provider implementations
//!
//! Available providers:
//! - [`DigitalOceanApi`] - DigitalOcean DNS API
//! - [`WebhookApi`] - Generic webhook for custom providers

mod digitalocean;
mod webhook;

pub use digitalocean::{DigitalOceanApi, DIGITALOCEAN_API_URL};
pub use webhook::WebhookApi;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use autocert_config::{DnsProviderConfig, DnsProviderType};
use reqwest::{Response, StatusCode};
use tracing::info;

use super::credentials::{CredentialLoader, Credentials};
use super::propagation::{PropagationConfig, PropagationVerifier};
use super::provider::{DnsProviderError, DnsResult, Provisioner, ZoneProvisioner};

/// Create a provisioner from configuration
///
/// The provisioner verifies propagation before reporting success unless
/// propagation checking is disabled.
pub fn create_provisioner(config: &DnsProviderConfig) -> DnsResult<Arc<dyn Provisioner>> {
    let credentials = load_credentials(config)?;
    let timeout = Duration::from_secs(config.api_timeout_secs);

    let verifier = config
        .propagation
        .enabled
        .then(|| PropagationVerifier::new(PropagationConfig::from(&config.propagation)));

    info!(
        zone = %config.provider.zone(),
        propagation_check = verifier.is_some(),
        "Creating DNS provisioner"
    );

    match &config.provider {
        DnsProviderType::DigitalOcean { zone, api_url } => {
            let api = DigitalOceanApi::new(zone.clone(), credentials, api_url.clone(), timeout)?;
            Ok(attach_verifier(ZoneProvisioner::new(api), verifier))
        }
        DnsProviderType::Webhook {
            url,
            zone,
            auth_header,
        } => {
            let api = WebhookApi::new(
                url.clone(),
                zone.clone(),
                auth_header.clone(),
                Some(credentials),
                timeout,
            )?;
            Ok(attach_verifier(ZoneProvisioner::new(api), verifier))
        }
    }
}

fn attach_verifier<A>(
    provisioner: ZoneProvisioner<A>,
    verifier: Option<PropagationVerifier>,
) -> Arc<dyn Provisioner>
where
    A: super::provider::RecordApi + 'static,
{
    match verifier {
        Some(verifier) => Arc::new(provisioner.with_verifier(verifier)),
        None => Arc::new(provisioner),
    }
}

/// Load credentials from file or environment variable
fn load_credentials(config: &DnsProviderConfig) -> DnsResult<Credentials> {
    if let Some(ref path) = config.credentials_file {
        return CredentialLoader::load_from_file(Path::new(path));
    }

    if let Some(ref env_var) = config.credentials_env {
        return CredentialLoader::load_from_env(env_var);
    }

    Err(DnsProviderError::Credentials(
        "No credentials configured. Specify either 'credentials-file' or 'credentials-env'"
            .to_string(),
    ))
}

/// Map a transport error from a provider request
pub(crate) fn request_error(e: reqwest::Error, timeout: Duration) -> DnsProviderError {
    if e.is_timeout() {
        DnsProviderError::Timeout {
            elapsed_secs: timeout.as_secs(),
        }
    } else {
        DnsProviderError::ApiRequest(e.to_string())
    }
}

/// Map statuses shared by all provider APIs (auth failures, rate limiting)
pub(crate) fn check_common_status(response: &Response, provider: &str) -> DnsResult<()> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DnsProviderError::Authentication(
            format!("{} rejected the API credentials", provider),
        )),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            Err(DnsProviderError::RateLimited { retry_after_secs })
        }
        _ => Ok(()),
    }
}
