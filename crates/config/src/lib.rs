//! Autocert configuration
//!
//! Loads and validates the configuration for the DNS-01 certificate manager.
//! KDL is the primary format; JSON is accepted for generated configs.
//!
//! # Example
//!
//! ```kdl
//! acme {
//!     email "admin@example.com"
//!     domain "www.example.com"
//!     staging #true
//!     cache-dir "/var/lib/autocert"
//!     renew-before-days 5
//!     accept-tos #true
//! }
//!
//! dns-provider "digitalocean" {
//!     zone "example.com"
//!     credentials-file "/etc/autocert/secrets/do-token"
//!     api-timeout-secs 30
//!
//!     propagation {
//!         nameservers "ns1.digitalocean.com" "ns2.digitalocean.com" "ns3.digitalocean.com"
//!         timeout-secs 60
//!         check-interval-ms 100
//!         settle-delay-secs 10
//!     }
//! }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod kdl;

/// Let's Encrypt production directory URL
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

// ============================================================================
// Configuration Types
// ============================================================================

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// ACME account and certificate settings
    pub acme: AcmeConfig,
    /// DNS backend used to provision DNS-01 challenges
    pub dns_provider: DnsProviderConfig,
}

/// ACME account and certificate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// Account contact email
    pub email: String,
    /// Domain the certificate is issued for
    pub domain: String,
    /// Explicit ACME directory URL (overrides `staging`)
    #[serde(default)]
    pub directory_url: Option<String>,
    /// Use the Let's Encrypt staging directory
    #[serde(default)]
    pub staging: bool,
    /// Directory holding account credentials, keys and certificates
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Renew this many days before the certificate expires
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,
    /// Agree to the CA's terms of service during registration
    #[serde(default)]
    pub accept_tos: bool,
}

impl AcmeConfig {
    /// The directory URL to register against
    pub fn directory_url(&self) -> &str {
        match self.directory_url {
            Some(ref url) => url,
            None if self.staging => LETSENCRYPT_STAGING,
            None => LETSENCRYPT_PRODUCTION,
        }
    }
}

/// DNS provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsProviderConfig {
    /// Which backend to talk to
    pub provider: DnsProviderType,
    /// File containing the API credentials
    #[serde(default)]
    pub credentials_file: Option<String>,
    /// Environment variable containing the API credentials
    #[serde(default)]
    pub credentials_env: Option<String>,
    /// Timeout for a single provider API request
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    /// Propagation verification settings
    #[serde(default)]
    pub propagation: PropagationSettings,
}

/// Supported DNS backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DnsProviderType {
    /// DigitalOcean DNS API
    DigitalOcean {
        /// Managed zone (e.g. "example.com")
        zone: String,
        /// Override for the API base URL
        #[serde(default)]
        api_url: Option<String>,
    },
    /// Generic HTTP webhook
    Webhook {
        /// Base URL of the webhook API
        url: String,
        /// Managed zone (e.g. "example.com")
        zone: String,
        /// Custom authentication header name
        #[serde(default)]
        auth_header: Option<String>,
    },
}

impl DnsProviderType {
    /// Managed zone of this backend
    pub fn zone(&self) -> &str {
        match self {
            DnsProviderType::DigitalOcean { zone, .. } | DnsProviderType::Webhook { zone, .. } => {
                zone
            }
        }
    }
}

/// Propagation verification settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationSettings {
    /// Verify propagation before reporting the challenge as provisioned
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Authoritative nameservers, `host[:port]`
    #[serde(default)]
    pub nameservers: Vec<String>,
    /// Overall deadline for all nameservers to converge
    #[serde(default = "default_propagation_timeout_secs")]
    pub timeout_secs: u64,
    /// Delay between queries to a single nameserver
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Hold time after all nameservers converged
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            nameservers: Vec::new(),
            timeout_secs: default_propagation_timeout_secs(),
            check_interval_ms: default_check_interval_ms(),
            settle_delay_secs: default_settle_delay_secs(),
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

pub(crate) fn default_cache_dir() -> PathBuf {
    PathBuf::from("certs")
}

pub(crate) fn default_renew_before_days() -> u32 {
    5
}

pub(crate) fn default_api_timeout_secs() -> u64 {
    30
}

pub(crate) fn default_propagation_timeout_secs() -> u64 {
    60
}

pub(crate) fn default_check_interval_ms() -> u64 {
    100
}

pub(crate) fn default_settle_delay_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Validation
// ============================================================================

/// Configuration validation failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required field is empty
    #[error("'{0}' must not be empty")]
    Missing(&'static str),

    /// Propagation is enabled but there is nothing to query
    #[error("propagation checking is enabled but no nameservers are configured")]
    NoNameservers,

    /// Zero propagation timeout
    #[error("propagation timeout must be greater than zero")]
    ZeroPropagationTimeout,

    /// Neither credentials source is set
    #[error("either 'credentials-file' or 'credentials-env' must be set")]
    NoCredentials,
}

// ============================================================================
// Config Implementation
// ============================================================================

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("kdl");

        let mut config = match extension {
            "kdl" => Self::from_kdl(&content)?,
            "json" => Self::from_json(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config format: {}", extension)),
        };
        config.normalize();
        Ok(config)
    }

    /// Parse configuration from KDL format
    pub fn from_kdl(content: &str) -> Result<Self> {
        let doc: ::kdl::KdlDocument = content.parse().map_err(|e: ::kdl::KdlError| {
            use miette::Diagnostic;

            let mut error_msg = String::new();
            error_msg.push_str("KDL configuration parse error:\n\n");

            let mut found_details = false;
            if let Some(related) = e.related() {
                for diagnostic in related {
                    error_msg.push_str(&format!("  {}\n", diagnostic));
                    found_details = true;

                    if let Some(labels) = diagnostic.labels() {
                        for label in labels {
                            let (line, col) = kdl::offset_to_line_col(content, label.offset());
                            error_msg
                                .push_str(&format!("\n  --> at line {}, column {}\n", line, col));

                            if let Some(line_content) = content.lines().nth(line.saturating_sub(1))
                            {
                                error_msg.push_str(&format!("{:>4} | {}\n", line, line_content));
                                error_msg.push_str(&format!(
                                    "     | {}^",
                                    " ".repeat(col.saturating_sub(1))
                                ));
                                if let Some(label_msg) = label.label() {
                                    error_msg.push_str(&format!(" {}", label_msg));
                                }
                                error_msg.push('\n');
                            }
                        }
                    }

                    if let Some(help) = diagnostic.help() {
                        error_msg.push_str(&format!("\n  Help: {}\n", help));
                    }
                }
            }

            if !found_details {
                error_msg.push_str(&format!("  {}\n", e));
            }

            anyhow::anyhow!("{}", error_msg)
        })?;

        let mut config = kdl::parse_kdl_document(doc)?;
        config.normalize();
        Ok(config)
    }

    /// Parse configuration from JSON format
    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: Self =
            serde_json::from_str(content).context("Failed to parse JSON configuration")?;
        config.normalize();
        Ok(config)
    }

    /// Trim trailing dots from DNS names
    fn normalize(&mut self) {
        self.acme.domain = self.acme.domain.trim_end_matches('.').to_string();
        match &mut self.dns_provider.provider {
            DnsProviderType::DigitalOcean { zone, .. } | DnsProviderType::Webhook { zone, .. } => {
                *zone = zone.trim_end_matches('.').to_string();
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.acme.email.trim().is_empty() {
            return Err(ConfigError::Missing("email"));
        }
        if self.acme.domain.trim().is_empty() {
            return Err(ConfigError::Missing("domain"));
        }

        match &self.dns_provider.provider {
            DnsProviderType::DigitalOcean { zone, .. } => {
                if zone.is_empty() {
                    return Err(ConfigError::Missing("zone"));
                }
            }
            DnsProviderType::Webhook { url, zone, .. } => {
                if url.trim().is_empty() {
                    return Err(ConfigError::Missing("url"));
                }
                if zone.is_empty() {
                    return Err(ConfigError::Missing("zone"));
                }
            }
        }

        if self.dns_provider.credentials_file.is_none()
            && self.dns_provider.credentials_env.is_none()
        {
            return Err(ConfigError::NoCredentials);
        }

        let propagation = &self.dns_provider.propagation;
        if propagation.enabled {
            if propagation.nameservers.is_empty() {
                return Err(ConfigError::NoNameservers);
            }
            if propagation.timeout_secs == 0 {
                return Err(ConfigError::ZeroPropagationTimeout);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
acme {
    email "admin@example.com"
    domain "www.example.com."
    staging #true
    cache-dir "/var/lib/autocert"
    accept-tos #true
}

dns-provider "webhook" {
    url "https://dns.internal/api"
    zone "example.com"
    credentials-env "DNS_TOKEN"

    propagation {
        nameservers "ns1.example.com" "ns2.example.com:5353"
        timeout-secs 90
    }
}
"#;

    #[test]
    fn test_parse_kdl_sample() {
        let config = Config::from_kdl(SAMPLE).unwrap();

        assert_eq!(config.acme.email, "admin@example.com");
        assert_eq!(config.acme.domain, "www.example.com");
        assert!(config.acme.staging);
        assert!(config.acme.accept_tos);
        assert_eq!(config.acme.renew_before_days, 5);
        assert_eq!(config.acme.cache_dir, PathBuf::from("/var/lib/autocert"));
        assert_eq!(config.acme.directory_url(), LETSENCRYPT_STAGING);

        assert_eq!(
            config.dns_provider.provider,
            DnsProviderType::Webhook {
                url: "https://dns.internal/api".to_string(),
                zone: "example.com".to_string(),
                auth_header: None,
            }
        );
        assert_eq!(config.dns_provider.credentials_env.as_deref(), Some("DNS_TOKEN"));
        assert_eq!(config.dns_provider.api_timeout_secs, 30);

        let propagation = &config.dns_provider.propagation;
        assert!(propagation.enabled);
        assert_eq!(
            propagation.nameservers,
            vec!["ns1.example.com".to_string(), "ns2.example.com:5353".to_string()]
        );
        assert_eq!(propagation.timeout_secs, 90);
        assert_eq!(propagation.check_interval_ms, 100);
        assert_eq!(propagation.settle_delay_secs, 10);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_error_reports_location() {
        let err = Config::from_kdl("acme {\n    email \"unterminated\n}\n").unwrap_err();
        assert!(err.to_string().contains("KDL configuration parse error"));
    }

    #[test]
    fn test_directory_url_selection() {
        let mut config = Config::from_kdl(SAMPLE).unwrap();
        config.acme.staging = false;
        assert_eq!(config.acme.directory_url(), LETSENCRYPT_PRODUCTION);

        config.acme.directory_url = Some("https://acme.internal/directory".to_string());
        assert_eq!(config.acme.directory_url(), "https://acme.internal/directory");
    }

    #[test]
    fn test_validate_missing_fields() {
        let mut config = Config::from_kdl(SAMPLE).unwrap();
        config.acme.email.clear();
        assert_eq!(config.validate(), Err(ConfigError::Missing("email")));

        let mut config = Config::from_kdl(SAMPLE).unwrap();
        config.dns_provider.credentials_env = None;
        assert_eq!(config.validate(), Err(ConfigError::NoCredentials));

        let mut config = Config::from_kdl(SAMPLE).unwrap();
        config.dns_provider.propagation.nameservers.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoNameservers));

        config.dns_provider.propagation.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_config() {
        let json = r#"{
            "acme": { "email": "admin@example.com", "domain": "example.com" },
            "dns_provider": {
                "provider": { "type": "digitalocean", "zone": "example.com." },
                "credentials_file": "/etc/autocert/token",
                "propagation": { "nameservers": ["ns1.digitalocean.com"] }
            }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.acme.cache_dir, PathBuf::from("certs"));
        assert!(!config.acme.accept_tos);
        assert_eq!(config.dns_provider.provider.zone(), "example.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("autocert.yaml");
        std::fs::write(&path, "acme: {}").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Unsupported config format"));
    }
}
