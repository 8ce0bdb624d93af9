//! HTTP client for the deployment backend
//!
//! HTTP/2 is negotiated via ALPN when the server supports it. The total
//! per-request deadline is four hours to accommodate multi-gigabyte image
//! downloads on slow links.

use std::time::Duration;

use reqwest::{header, Certificate, Method, RequestBuilder, Response};
use serde::Deserialize;
use tracing::warn;

use crate::errors::AgentError;

/// Common prefix of every device API route.
pub const API_PREFIX: &str = "/api/devices/v1";

/// Covers the entire exchange, from connect to reading the body. Four hours
/// is enough to download a 2 GB image at ~1 mbps.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// TCP keepalive period.
const KEEPALIVE_TIME: Duration = Duration::from_secs(10);

/// TLS and server configuration for the API client
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Server base URL
    pub server_url: String,

    /// Optional extra root CA certificate file (PEM)
    pub server_cert: Option<String>,

    /// Skip TLS certificate verification
    pub skip_verify: bool,
}

/// HTTP client wrapper for backend communication
pub struct ApiClient {
    client: reqwest::Client,
    server_url: String,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(config: &ClientConfig) -> Result<Self, AgentError> {
        let mut builder = reqwest::Client::builder()
            .timeout(CLIENT_READ_TIMEOUT)
            .tcp_keepalive(KEEPALIVE_TIME);

        if let Some(cert_path) = &config.server_cert {
            let pem = std::fs::read(cert_path).map_err(|e| {
                AgentError::ConfigError(format!("cannot read server certificate {}: {}", cert_path, e))
            })?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| AgentError::ConfigError(format!("bad server certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if config.skip_verify {
            warn!("certificate verification skipped..");
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            client: builder.build()?,
            server_url: config.server_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the server base URL
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Build a device API URL: `{server}/api/devices/v1{path}`
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}{}", self.server_url, API_PREFIX, path)
    }

    /// Start a request carrying the device bearer token. An empty token
    /// leaves the Authorization header unset.
    pub fn request(&self, method: Method, url: &str, token: &str) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if !token.is_empty() {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

/// Extract the `{error, request_id}` pair every failed API response must
/// carry. Both fields must be present together.
pub async fn response_error_info(response: Response) -> String {
    let status = response.status();
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => return format!("status {} (unreadable body: {})", status, e),
    };
    format!("status {}: {}", status, parse_error_body(&body))
}

fn parse_error_body(body: &str) -> String {
    let parsed: ErrorBody = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => return format!("failed to unmarshal error from api request: {}", e),
    };
    match (parsed.error, parsed.request_id) {
        (Some(error), Some(request_id)) if !error.is_empty() && !request_id.is_empty() => {
            format!("{}: requestID: {}", error, request_id)
        }
        (Some(error), _) if !error.is_empty() => {
            format!("received an error: {} from the server, but no request id", error)
        }
        (_, Some(request_id)) if !request_id.is_empty() => {
            format!("received a request id ({}), but no error", request_id)
        }
        _ => "received no error, and no request-id".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url() {
        let client = ApiClient::new(&ClientConfig {
            server_url: "https://updates.example.com/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.api_url("/deployments/device/deployments/next"),
            "https://updates.example.com/api/devices/v1/deployments/device/deployments/next"
        );
    }

    #[test]
    fn test_error_body_contract() {
        assert_eq!(
            parse_error_body(r#"{"error":"boom","request_id":"abc"}"#),
            "boom: requestID: abc"
        );
        assert_eq!(
            parse_error_body(r#"{"error":"boom"}"#),
            "received an error: boom from the server, but no request id"
        );
        assert_eq!(
            parse_error_body(r#"{"request_id":"abc"}"#),
            "received a request id (abc), but no error"
        );
        assert_eq!(
            parse_error_body(r#"{}"#),
            "received no error, and no request-id"
        );
        assert!(parse_error_body("not json").starts_with("failed to unmarshal"));
    }
}
