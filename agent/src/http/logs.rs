//! Deployment log upload

use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::{header, Method, StatusCode};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::deploylog::LogMessage;
use crate::errors::AgentError;
use crate::http::client::{response_error_info, ApiClient};
use crate::utils::exponential_backoff_time;

#[derive(Debug, Serialize)]
struct LogData<'a> {
    messages: &'a [LogMessage],
}

impl ApiClient {
    /// Upload the collected deployment log, gzip-compressed. Success is
    /// HTTP 204.
    pub async fn upload_log(
        &self,
        token: &str,
        deployment_id: &str,
        messages: &[LogMessage],
        retry_cap: Duration,
    ) -> Result<(), AgentError> {
        let mut tried = 0u32;
        loop {
            match self.try_upload_log(token, deployment_id, messages).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let wait = exponential_backoff_time(tried, retry_cap)?;
                    warn!("failed to upload logs ({}), retrying in {:?}", e, wait);
                    tokio::time::sleep(wait).await;
                    tried += 1;
                }
            }
        }
    }

    async fn try_upload_log(
        &self,
        token: &str,
        deployment_id: &str,
        messages: &[LogMessage],
    ) -> Result<(), AgentError> {
        let url = self.api_url(&format!(
            "/deployments/device/deployments/{}/log",
            deployment_id
        ));
        debug!("uploading {} log messages to {}", messages.len(), url);

        let body = serde_json::to_vec(&LogData { messages })?;
        let compressed = {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body)?;
            encoder.finish()?
        };

        let response = self
            .request(Method::PUT, &url, token)
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::CONTENT_TYPE, "application/json")
            .body(compressed)
            .send()
            .await
            .map_err(|e| AgentError::NetworkError(format!("uploading logs failed: {}", e)))?;

        if response.status() != StatusCode::NO_CONTENT {
            let info = response_error_info(response).await;
            error!("got unexpected HTTP status when uploading log: {}", info);
            return Err(AgentError::NetworkError(format!(
                "uploading logs failed: {}",
                info
            )));
        }
        Ok(())
    }
}
