//! Secure credential loading for DNS providers
//!
//! Supports loading an API token from:
//! - JSON files (`{"token": "..."}` or `{"api_token": "..."}`)
//! - Plain text files (single token)
//! - Environment variables

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use super::provider::DnsProviderError;

/// API token for a DNS provider
#[derive(Clone)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    /// Wrap a token
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// The token, for use as a bearer or header value
    pub fn as_bearer_token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Credential loader for DNS provider authentication
#[derive(Debug, Default)]
pub struct CredentialLoader;

impl CredentialLoader {
    /// Load credentials from a file
    ///
    /// Warns when the file is readable by group or others.
    pub fn load_from_file(path: &Path) -> Result<Credentials, DnsProviderError> {
        let read_error = |e: std::io::Error| {
            DnsProviderError::Credentials(format!(
                "Failed to read credentials file '{}': {}",
                path.display(),
                e
            ))
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let metadata = fs::metadata(path).map_err(read_error)?;
            let file_mode = metadata.permissions().mode() & 0o777;
            if file_mode & 0o077 != 0 {
                warn!(
                    path = %path.display(),
                    mode = format!("{:o}", file_mode),
                    "Credentials file has overly permissive permissions (should be 0600 or 0400)"
                );
            }
        }

        let content = fs::read_to_string(path).map_err(read_error)?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(DnsProviderError::Credentials(format!(
                "Credentials file '{}' is empty",
                path.display()
            )));
        }

        let credentials = Self::parse(trimmed)?;
        debug!(path = %path.display(), "Loaded DNS provider credentials");
        Ok(credentials)
    }

    /// Load credentials from an environment variable
    pub fn load_from_env(var_name: &str) -> Result<Credentials, DnsProviderError> {
        let value = std::env::var(var_name).map_err(|_| {
            DnsProviderError::Credentials(format!("Environment variable '{}' not set", var_name))
        })?;

        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DnsProviderError::Credentials(format!(
                "Environment variable '{}' is empty",
                var_name
            )));
        }
        Self::parse(trimmed)
    }

    /// JSON object or plain token
    fn parse(content: &str) -> Result<Credentials, DnsProviderError> {
        if !content.starts_with('{') {
            return Ok(Credentials::token(content));
        }

        #[derive(Deserialize)]
        struct TokenFormat {
            token: Option<String>,
            api_token: Option<String>,
        }

        let parsed: TokenFormat = serde_json::from_str(content).map_err(|e| {
            DnsProviderError::Credentials(format!("Invalid JSON credentials: {}", e))
        })?;

        parsed
            .token
            .or(parsed.api_token)
            .filter(|t| !t.is_empty())
            .map(Credentials::token)
            .ok_or_else(|| {
                DnsProviderError::Credentials(
                    "Invalid JSON credentials format. Expected {\"token\": \"...\"} or {\"api_token\": \"...\"}"
                        .to_string(),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plain_token_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        fs::write(&path, "  dop_v1_abc123\n").unwrap();

        let creds = CredentialLoader::load_from_file(&path).unwrap();
        assert_eq!(creds.as_bearer_token(), "dop_v1_abc123");
    }

    #[test]
    fn test_json_token_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("creds.json");

        fs::write(&path, r#"{"token": "t1"}"#).unwrap();
        assert_eq!(
            CredentialLoader::load_from_file(&path).unwrap().as_bearer_token(),
            "t1"
        );

        fs::write(&path, r#"{"api_token": "t2"}"#).unwrap();
        assert_eq!(
            CredentialLoader::load_from_file(&path).unwrap().as_bearer_token(),
            "t2"
        );

        fs::write(&path, r#"{"secret": "t3"}"#).unwrap();
        assert!(CredentialLoader::load_from_file(&path).is_err());
    }

    #[test]
    fn test_empty_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, "\n").unwrap();
        assert!(matches!(
            CredentialLoader::load_from_file(&path),
            Err(DnsProviderError::Credentials(_))
        ));

        assert!(CredentialLoader::load_from_file(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_env_credentials() {
        std::env::set_var("AUTOCERT_TEST_DNS_TOKEN", "env-token");
        let creds = CredentialLoader::load_from_env("AUTOCERT_TEST_DNS_TOKEN").unwrap();
        assert_eq!(creds.as_bearer_token(), "env-token");

        assert!(CredentialLoader::load_from_env("AUTOCERT_TEST_DNS_TOKEN_UNSET").is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds = Credentials::token("secret-value");
        assert!(!format!("{:?}", creds).contains("secret-value"));
    }
}
