//! DNS provider KDL parsing.

use anyhow::Result;
use tracing::trace;

use crate::{
    default_api_timeout_secs, default_check_interval_ms, default_propagation_timeout_secs,
    default_settle_delay_secs, DnsProviderConfig, DnsProviderType, PropagationSettings,
};

use super::helpers::{
    get_bool_entry, get_first_arg_string, get_int_entry, get_string_entry, get_string_list,
};

/// Parse the `dns-provider "<type>" { ... }` block
pub fn parse_dns_provider(node: &kdl::KdlNode) -> Result<DnsProviderConfig> {
    let provider_type = get_first_arg_string(node).ok_or_else(|| {
        anyhow::anyhow!(
            "dns-provider requires a type argument, e.g., dns-provider \"digitalocean\" {{ ... }}"
        )
    })?;

    trace!(provider = %provider_type, "Parsing dns-provider block");

    let zone = get_string_entry(node, "zone").ok_or_else(|| {
        anyhow::anyhow!(
            "dns-provider '{}' requires a 'zone' field, e.g., zone \"example.com\"",
            provider_type
        )
    })?;

    let provider = match provider_type.to_lowercase().as_str() {
        "digitalocean" => DnsProviderType::DigitalOcean {
            zone,
            api_url: get_string_entry(node, "api-url"),
        },
        "webhook" => {
            let url = get_string_entry(node, "url").ok_or_else(|| {
                anyhow::anyhow!(
                    "dns-provider 'webhook' requires a 'url' field, e.g., url \"https://dns.internal/api\""
                )
            })?;
            DnsProviderType::Webhook {
                url,
                zone,
                auth_header: get_string_entry(node, "auth-header"),
            }
        }
        other => {
            return Err(anyhow::anyhow!(
                "Unknown dns-provider type '{}'. Valid types: digitalocean, webhook",
                other
            ));
        }
    };

    let propagation = match node.children().and_then(|c| c.get("propagation")) {
        Some(child) => parse_propagation(child)?,
        None => PropagationSettings::default(),
    };

    let config = DnsProviderConfig {
        provider,
        credentials_file: get_string_entry(node, "credentials-file"),
        credentials_env: get_string_entry(node, "credentials-env"),
        api_timeout_secs: non_negative(node, "api-timeout-secs")?
            .unwrap_or_else(default_api_timeout_secs),
        propagation,
    };

    trace!(
        zone = %config.provider.zone(),
        nameservers = config.propagation.nameservers.len(),
        "Parsed dns-provider configuration"
    );

    Ok(config)
}

/// Parse the `propagation { ... }` block
pub fn parse_propagation(node: &kdl::KdlNode) -> Result<PropagationSettings> {
    Ok(PropagationSettings {
        enabled: get_bool_entry(node, "enabled").unwrap_or(true),
        nameservers: get_string_list(node, "nameservers"),
        timeout_secs: non_negative(node, "timeout-secs")?
            .unwrap_or_else(default_propagation_timeout_secs),
        check_interval_ms: non_negative(node, "check-interval-ms")?
            .unwrap_or_else(default_check_interval_ms),
        settle_delay_secs: non_negative(node, "settle-delay-secs")?
            .unwrap_or_else(default_settle_delay_secs),
    })
}

fn non_negative(node: &kdl::KdlNode, name: &str) -> Result<Option<u64>> {
    match get_int_entry(node, name) {
        Some(v) if v < 0 || v > i128::from(u64::MAX) => Err(anyhow::anyhow!(
            "Invalid {} {}: must be a non-negative integer",
            name,
            v
        )),
        Some(v) => Ok(Some(v as u64)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<DnsProviderConfig> {
        let doc: kdl::KdlDocument = input.parse().unwrap();
        parse_dns_provider(doc.get("dns-provider").unwrap())
    }

    #[test]
    fn test_digitalocean_provider() {
        let config = parse(
            r#"
dns-provider "digitalocean" {
    zone "example.com"
    credentials-file "/etc/autocert/do-token"
    api-timeout-secs 10
    propagation {
        nameservers "ns1.digitalocean.com" "ns2.digitalocean.com"
        settle-delay-secs 0
    }
}
"#,
        )
        .unwrap();

        assert_eq!(
            config.provider,
            DnsProviderType::DigitalOcean {
                zone: "example.com".to_string(),
                api_url: None
            }
        );
        assert_eq!(config.api_timeout_secs, 10);
        assert_eq!(config.propagation.nameservers.len(), 2);
        assert_eq!(config.propagation.settle_delay_secs, 0);
        assert_eq!(config.propagation.timeout_secs, 60);
    }

    #[test]
    fn test_propagation_defaults_when_absent() {
        let config = parse(r#"dns-provider "digitalocean" { zone "example.com"; }"#).unwrap();
        assert_eq!(config.propagation, PropagationSettings::default());
    }

    #[test]
    fn test_webhook_requires_url() {
        let err = parse(r#"dns-provider "webhook" { zone "example.com"; }"#).unwrap_err();
        assert!(err.to_string().contains("'url'"));
    }

    #[test]
    fn test_unknown_provider() {
        let err = parse(r#"dns-provider "route53" { zone "example.com"; }"#).unwrap_err();
        assert!(err.to_string().contains("Unknown dns-provider type"));
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let err = parse(
            r#"dns-provider "digitalocean" { zone "example.com"; propagation { timeout-secs -5; }; }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("timeout-secs"));
    }
}
