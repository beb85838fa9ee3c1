//! Generic webhook DNS provider
//!
//! Allows integration with custom DNS management systems via HTTP webhooks.
//!
//! # Webhook API
//!
//! ## Create Record
//! ```text
//! POST {url}/records
//! Content-Type: application/json
//!
//! {
//!   "zone": "example.com",
//!   "name": "_acme-challenge.www",
//!   "type": "TXT",
//!   "value": "challenge-value",
//!   "ttl": 60
//! }
//!
//! Response:
//! {
//!   "record_id": "unique-id"
//! }
//! ```
//!
//! ## List Records
//! ```text
//! GET {url}/records?zone={zone}&name={name}&type=TXT
//!
//! Response:
//! {
//!   "records": [{ "id": "unique-id", "name": "...", "type": "TXT", "value": "..." }]
//! }
//! ```
//!
//! ## Delete Record
//! ```text
//! DELETE {url}/records/{record_id}?zone={zone}
//!
//! Response: 200 OK or 204 No Content, 404 if absent
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{check_common_status, request_error};
use crate::dns::credentials::Credentials;
use crate::dns::provider::{DnsProviderError, DnsResult, RecordApi, ZoneRecord};

/// Webhook records API for custom integrations
#[derive(Debug)]
pub struct WebhookApi {
    client: Client,
    base_url: String,
    zone: String,
    auth_header: Option<String>,
    credentials: Option<Credentials>,
    timeout: Duration,
}

impl WebhookApi {
    /// Create a new webhook records API
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL for the webhook API
    /// * `zone` - Managed zone (e.g. "example.com")
    /// * `auth_header` - Optional custom auth header name (e.g., "X-API-Key")
    /// * `credentials` - Optional credentials for authentication
    /// * `timeout` - Request timeout
    pub fn new(
        base_url: String,
        zone: String,
        auth_header: Option<String>,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> DnsResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            DnsProviderError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            zone: zone.trim_end_matches('.').to_string(),
            auth_header,
            credentials,
            timeout,
        })
    }

    /// Add authentication to a request
    fn add_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.auth_header, &self.credentials) {
            (Some(header), Some(creds)) => request.header(header.as_str(), creds.as_bearer_token()),
            (None, Some(creds)) => request.bearer_auth(creds.as_bearer_token()),
            _ => request,
        }
    }
}

#[async_trait]
impl RecordApi for WebhookApi {
    fn name(&self) -> &'static str {
        "webhook"
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
        debug!(
            zone = %self.zone,
            name = %name,
            url = %self.base_url,
            "Creating record via webhook"
        );

        let request = CreateRecordRequest {
            zone: &self.zone,
            name,
            record_type,
            value,
            ttl,
        };

        let response = self
            .add_auth(
                self.client
                    .post(format!("{}/records", self.base_url))
                    .json(&request),
            )
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        check_common_status(&response, "Webhook")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DnsProviderError::RecordCreation {
                record_name: name.to_string(),
                message: format!("Webhook returned HTTP {} - {}", status, body),
            });
        }

        let created: CreateRecordResponse =
            response
                .json()
                .await
                .map_err(|e| DnsProviderError::RecordCreation {
                    record_name: name.to_string(),
                    message: format!("Failed to parse webhook response: {}", e),
                })?;

        debug!(record_id = %created.record_id, "Record created via webhook");
        Ok(created.record_id)
    }

    async fn list_records(&self, name: &str, record_type: &str) -> DnsResult<Vec<ZoneRecord>> {
        let response = self
            .add_auth(
                self.client
                    .get(format!("{}/records", self.base_url))
                    .query(&[
                        ("zone", self.zone.as_str()),
                        ("name", name),
                        ("type", record_type),
                    ]),
            )
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        check_common_status(&response, "Webhook")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DnsProviderError::ApiRequest(format!(
                "Webhook returned HTTP {} - {}",
                status, body
            )));
        }

        let listed: ListRecordsResponse = response.json().await.map_err(|e| {
            DnsProviderError::ApiRequest(format!("Failed to parse webhook response: {}", e))
        })?;

        Ok(listed
            .records
            .into_iter()
            .map(|r| ZoneRecord {
                id: r.id,
                name: r.name,
                record_type: r.record_type,
                value: r.value,
            })
            .collect())
    }

    async fn delete_record(&self, record_id: &str) -> DnsResult<()> {
        debug!(zone = %self.zone, record_id = %record_id, "Deleting record via webhook");

        let response = self
            .add_auth(
                self.client
                    .delete(format!("{}/records/{}", self.base_url, record_id))
                    .query(&[("zone", self.zone.as_str())]),
            )
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(DnsProviderError::RecordNotFound {
                record_name: record_id.to_string(),
            });
        }

        check_common_status(&response, "Webhook")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DnsProviderError::RecordDeletion {
                record_id: record_id.to_string(),
                message: format!("Webhook returned HTTP {} - {}", status, body),
            });
        }

        debug!(record_id = %record_id, "Record deleted via webhook");
        Ok(())
    }
}

// Webhook API types

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    zone: &'a str,
    name: &'a str,
    #[serde(rename = "type")]
    record_type: &'a str,
    value: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    record_id: String,
}

#[derive(Debug, Deserialize)]
struct WebhookRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    #[serde(default)]
    records: Vec<WebhookRecord>,
}
