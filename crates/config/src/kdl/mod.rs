//! KDL configuration parsing.
//!
//! - `helpers`: Common parsing utility functions
//! - `acme`: ACME account and certificate block
//! - `provider`: DNS provider and propagation blocks

mod acme;
mod helpers;
mod provider;

pub use helpers::{
    get_bool_entry, get_first_arg_string, get_int_entry, get_string_entry, get_string_list,
    offset_to_line_col,
};

pub use acme::parse_acme_config;
pub use provider::{parse_dns_provider, parse_propagation};

use anyhow::Result;
use tracing::{debug, warn};

use crate::Config;

/// Convert a parsed KDL document to Config
pub fn parse_kdl_document(doc: kdl::KdlDocument) -> Result<Config> {
    let mut acme = None;
    let mut dns_provider = None;

    for node in doc.nodes() {
        match node.name().value() {
            "acme" => {
                acme = Some(parse_acme_config(node)?);
            }
            "dns-provider" => {
                dns_provider = Some(parse_dns_provider(node)?);
            }
            other => {
                warn!(node = %other, "Ignoring unknown top-level configuration node");
            }
        }
    }

    let acme = acme.ok_or_else(|| {
        anyhow::anyhow!(
            "Missing 'acme' block, e.g., acme {{ email \"admin@example.com\"; domain \"example.com\" }}"
        )
    })?;
    let dns_provider = dns_provider.ok_or_else(|| {
        anyhow::anyhow!(
            "Missing 'dns-provider' block, e.g., dns-provider \"digitalocean\" {{ zone \"example.com\" }}"
        )
    })?;

    debug!(
        domain = %acme.domain,
        zone = %dns_provider.provider.zone(),
        "Parsed KDL configuration"
    );

    Ok(Config { acme, dns_provider })
}
