//! External IP reputation lookup.

use crate::config::ApiConfig;
use crate::error::LookupError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Classification data for a single address, produced by the external lookup
/// or reconstructed from the persistent cache. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReputationResult {
    pub address: String,
    pub country_code: String,
    pub country_name: String,
    pub city: String,
    pub isp: String,
    pub asn: String,
    pub is_proxy: bool,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub observed_at_ms: u64,
}

impl ReputationResult {
    /// Result recording a failed lookup. Never blocks a connection.
    pub fn failed(address: &str, reason: &str) -> Self {
        Self {
            address: address.to_string(),
            country_code: String::new(),
            country_name: String::new(),
            city: String::new(),
            isp: String::new(),
            asn: String::new(),
            is_proxy: false,
            success: false,
            failure_reason: Some(reason.to_string()),
            observed_at_ms: epoch_ms(),
        }
    }
}

/// The external reputation lookup collaborator.
#[async_trait]
pub trait ReputationLookup: Send + Sync {
    /// Query the reputation of an address. Transport and parse failures
    /// surface as [`LookupError`]; a well-formed "not successful" reply is a
    /// successful call with `success == false`.
    async fn lookup(&self, addr: Ipv4Addr) -> Result<ReputationResult, LookupError>;
}

/// Reputation API wire response.
#[derive(Debug, Deserialize)]
struct WireResponse {
    success: bool,

    #[serde(default)]
    proxy: bool,

    #[serde(rename = "countryCode", default)]
    country_code: String,

    #[serde(rename = "countryName", default)]
    country_name: String,

    #[serde(default)]
    city: String,

    #[serde(default)]
    isp: String,

    #[serde(default)]
    asn: String,

    #[serde(rename = "failureReason", default)]
    failure_reason: Option<String>,
}

/// HTTP client for the reputation API.
pub struct HttpReputationLookup {
    client: Client,
    endpoint: String,
    license: String,
}

impl HttpReputationLookup {
    pub fn new(config: &ApiConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            endpoint: config.endpoint.clone(),
            license: config.license.clone(),
        }
    }
}

#[async_trait]
impl ReputationLookup for HttpReputationLookup {
    async fn lookup(&self, addr: Ipv4Addr) -> Result<ReputationResult, LookupError> {
        let url = format!("{}?ip={}&license={}", self.endpoint, addr, self.license);

        debug!(ip = %addr, "Querying reputation API");

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LookupError::RateLimited);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LookupError::InvalidResponse(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let wire: WireResponse = response.json().await.map_err(|e| {
            LookupError::InvalidResponse(format!("Failed to parse response: {}", e))
        })?;

        debug!(
            ip = %addr,
            success = wire.success,
            proxy = wire.proxy,
            country = %wire.country_code,
            "Reputation lookup complete"
        );

        Ok(ReputationResult {
            address: addr.to_string(),
            country_code: wire.country_code,
            country_name: wire.country_name,
            city: wire.city,
            isp: wire.isp,
            asn: wire.asn,
            is_proxy: wire.proxy,
            success: wire.success,
            failure_reason: wire.failure_reason,
            observed_at_ms: epoch_ms(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_response_success() {
        let json = r#"{
            "success": true,
            "proxy": true,
            "countryCode": "US",
            "countryName": "United States",
            "city": "Dallas",
            "isp": "ExampleNet",
            "asn": "AS12345",
            "ip": "1.2.3.4",
            "method": "premium"
        }"#;

        let wire: WireResponse = serde_json::from_str(json).unwrap();
        assert!(wire.success);
        assert!(wire.proxy);
        assert_eq!(wire.country_code, "US");
        assert!(wire.failure_reason.is_none());
    }

    #[test]
    fn test_wire_response_failure() {
        let json = r#"{"success": false, "failureReason": "Invalid license"}"#;

        let wire: WireResponse = serde_json::from_str(json).unwrap();
        assert!(!wire.success);
        assert_eq!(wire.failure_reason.as_deref(), Some("Invalid license"));
    }

    #[test]
    fn test_failed_result_is_not_blocking_material() {
        let result = ReputationResult::failed("1.2.3.4", "timeout");
        assert!(!result.success);
        assert!(!result.is_proxy);
        assert_eq!(result.failure_reason.as_deref(), Some("timeout"));
    }
}
