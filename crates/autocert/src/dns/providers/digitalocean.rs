//! DigitalOcean DNS provider
//!
//! Uses the DigitalOcean v2 API to manage TXT records within one domain.
//!
//! API Documentation: https://docs.digitalocean.com/reference/api/api-reference/#tag/Domain-Records

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{check_common_status, request_error};
use crate::dns::credentials::Credentials;
use crate::dns::provider::{DnsProviderError, DnsResult, RecordApi, ZoneRecord};

/// DigitalOcean API base URL
pub const DIGITALOCEAN_API_URL: &str = "https://api.digitalocean.com";

/// Records requested per page when listing
const PAGE_SIZE: u32 = 200;

/// DigitalOcean DNS records API for one domain
#[derive(Debug)]
pub struct DigitalOceanApi {
    client: Client,
    base_url: String,
    zone: String,
    credentials: Credentials,
    timeout: Duration,
}

impl DigitalOceanApi {
    /// Create a new DigitalOcean records API
    ///
    /// # Arguments
    ///
    /// * `zone` - Domain managed in DigitalOcean (e.g. "example.com")
    /// * `credentials` - Personal access token
    /// * `base_url` - Override for the API base URL
    /// * `timeout` - Request timeout
    pub fn new(
        zone: String,
        credentials: Credentials,
        base_url: Option<String>,
        timeout: Duration,
    ) -> DnsResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            DnsProviderError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;

        let base_url = base_url
            .as_deref()
            .unwrap_or(DIGITALOCEAN_API_URL)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            base_url,
            zone: zone.trim_end_matches('.').to_string(),
            credentials,
            timeout,
        })
    }

    fn records_url(&self) -> String {
        format!("{}/v2/domains/{}/records", self.base_url, self.zone)
    }
}

#[async_trait]
impl RecordApi for DigitalOceanApi {
    fn name(&self) -> &'static str {
        "digitalocean"
    }

    fn zone(&self) -> &str {
        &self.zone
    }

    async fn create_record(
        &self,
        name: &str,
        record_type: &str,
        value: &str,
        ttl: u32,
    ) -> DnsResult<String> {
        debug!(zone = %self.zone, name = %name, "Creating record via DigitalOcean API");

        let request = CreateRecordRequest {
            record_type,
            name,
            data: value,
            ttl,
        };

        let response = self
            .client
            .post(self.records_url())
            .bearer_auth(self.credentials.as_bearer_token())
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        check_common_status(&response, "DigitalOcean")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DnsProviderError::RecordCreation {
                record_name: name.to_string(),
                message: format!("DigitalOcean returned HTTP {} - {}", status, body),
            });
        }

        let created: DomainRecordResponse =
            response
                .json()
                .await
                .map_err(|e| DnsProviderError::RecordCreation {
                    record_name: name.to_string(),
                    message: format!("Failed to parse DigitalOcean response: {}", e),
                })?;

        let record_id = created.domain_record.id.to_string();
        debug!(record_id = %record_id, "Record created via DigitalOcean API");
        Ok(record_id)
    }

    async fn list_records(&self, name: &str, record_type: &str) -> DnsResult<Vec<ZoneRecord>> {
        // The name filter expects the fully qualified name
        let fqdn = format!("{}.{}", name, self.zone);
        let per_page = PAGE_SIZE.to_string();

        let response = self
            .client
            .get(self.records_url())
            .bearer_auth(self.credentials.as_bearer_token())
            .query(&[
                ("type", record_type),
                ("name", fqdn.as_str()),
                ("per_page", per_page.as_str()),
            ])
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        check_common_status(&response, "DigitalOcean")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DnsProviderError::ApiRequest(format!(
                "DigitalOcean returned HTTP {} - {}",
                status, body
            )));
        }

        let listed: DomainRecordsResponse = response.json().await.map_err(|e| {
            DnsProviderError::ApiRequest(format!("Failed to parse DigitalOcean response: {}", e))
        })?;

        trace!(
            name = %name,
            count = listed.domain_records.len(),
            "Listed DigitalOcean records"
        );

        Ok(listed
            .domain_records
            .into_iter()
            .map(|r| ZoneRecord {
                id: r.id.to_string(),
                name: r.name,
                record_type: r.record_type,
                value: r.data,
            })
            .collect())
    }

    async fn delete_record(&self, record_id: &str) -> DnsResult<()> {
        debug!(zone = %self.zone, record_id = %record_id, "Deleting record via DigitalOcean API");

        let response = self
            .client
            .delete(format!("{}/{}", self.records_url(), record_id))
            .bearer_auth(self.credentials.as_bearer_token())
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(DnsProviderError::RecordNotFound {
                record_name: record_id.to_string(),
            });
        }

        check_common_status(&response, "DigitalOcean")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DnsProviderError::RecordDeletion {
                record_id: record_id.to_string(),
                message: format!("DigitalOcean returned HTTP {} - {}", status, body),
            });
        }

        Ok(())
    }
}

// DigitalOcean API types

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    data: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct DomainRecord {
    id: u64,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct DomainRecordResponse {
    domain_record: DomainRecord,
}

#[derive(Debug, Deserialize)]
struct DomainRecordsResponse {
    domain_records: Vec<DomainRecord>,
}
