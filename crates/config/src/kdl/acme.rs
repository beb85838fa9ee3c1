//! ACME block KDL parsing.

use anyhow::Result;
use std::path::PathBuf;
use tracing::trace;

use crate::{default_cache_dir, default_renew_before_days, AcmeConfig};

use super::helpers::{get_bool_entry, get_int_entry, get_string_entry};

/// Parse the `acme` configuration block
pub fn parse_acme_config(node: &kdl::KdlNode) -> Result<AcmeConfig> {
    trace!("Parsing acme configuration block");

    let email = get_string_entry(node, "email").ok_or_else(|| {
        anyhow::anyhow!("acme block requires an 'email' field, e.g., email \"admin@example.com\"")
    })?;
    let domain = get_string_entry(node, "domain").ok_or_else(|| {
        anyhow::anyhow!("acme block requires a 'domain' field, e.g., domain \"www.example.com\"")
    })?;

    let renew_before_days = match get_int_entry(node, "renew-before-days") {
        Some(days) if days < 0 || days > i128::from(u32::MAX) => {
            return Err(anyhow::anyhow!(
                "Invalid renew-before-days {}: must be a non-negative number of days",
                days
            ));
        }
        Some(days) => days as u32,
        None => default_renew_before_days(),
    };

    let config = AcmeConfig {
        email,
        domain,
        directory_url: get_string_entry(node, "directory-url"),
        staging: get_bool_entry(node, "staging").unwrap_or(false),
        cache_dir: get_string_entry(node, "cache-dir")
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_dir),
        renew_before_days,
        accept_tos: get_bool_entry(node, "accept-tos").unwrap_or(false),
    };

    trace!(
        domain = %config.domain,
        staging = config.staging,
        renew_before_days = config.renew_before_days,
        "Parsed acme configuration"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<AcmeConfig> {
        let doc: kdl::KdlDocument = input.parse().unwrap();
        parse_acme_config(doc.get("acme").unwrap())
    }

    #[test]
    fn test_defaults() {
        let config = parse(r#"acme { email "a@example.com"; domain "example.com"; }"#).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("certs"));
        assert_eq!(config.renew_before_days, 5);
        assert!(!config.staging);
        assert!(!config.accept_tos);
        assert!(config.directory_url.is_none());
    }

    #[test]
    fn test_missing_domain() {
        let err = parse(r#"acme { email "a@example.com"; }"#).unwrap_err();
        assert!(err.to_string().contains("'domain'"));
    }

    #[test]
    fn test_negative_renew_window() {
        let err = parse(
            r#"acme { email "a@example.com"; domain "example.com"; renew-before-days -1; }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("renew-before-days"));
    }
}
