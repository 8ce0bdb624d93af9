//! Deployment API client

use futures_util::TryStreamExt;
use reqwest::{Method, StatusCode};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info};

use crate::errors::AgentError;
use crate::http::client::{response_error_info, ApiClient};
use crate::models::update::UpdateInfo;

/// Streaming artifact body
pub type UpdateReader = Box<dyn AsyncRead + Send + Unpin>;

impl ApiClient {
    /// Poll for the next deployment targeting this device.
    /// `204` means nothing to do; `200` carries an [`UpdateInfo`].
    pub async fn check_update(
        &self,
        token: &str,
        artifact_name: &str,
        device_type: &str,
    ) -> Result<Option<UpdateInfo>, AgentError> {
        let url = self.api_url("/deployments/device/deployments/next");
        debug!("checking for updates at {}", url);

        let response = self
            .request(Method::GET, &url, token)
            .query(&[
                ("artifact_name", artifact_name),
                ("device_type", device_type),
            ])
            .send()
            .await
            .map_err(|e| AgentError::NetworkError(format!("update check failed: {}", e)))?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                let update: UpdateInfo = response.json().await?;
                info!("update available: {} ({})", update.id, update.artifact_name());
                Ok(Some(update))
            }
            _ => {
                let info = response_error_info(response).await;
                error!("update check failed: {}", info);
                Err(AgentError::NetworkError(format!(
                    "update check failed: {}",
                    info
                )))
            }
        }
    }

    /// Fetch the artifact body as a streaming reader plus its declared size
    /// (0 when the server does not announce one).
    pub async fn fetch_update(
        &self,
        token: &str,
        uri: &str,
    ) -> Result<(UpdateReader, i64), AgentError> {
        debug!("fetching update from {}", uri);

        let response = self
            .request(Method::GET, uri, token)
            .send()
            .await
            .map_err(|e| AgentError::NetworkError(format!("update fetch failed: {}", e)))?;

        if !response.status().is_success() {
            let info = response_error_info(response).await;
            error!("update fetch failed: {}", info);
            return Err(AgentError::NetworkError(format!(
                "update fetch failed: {}",
                info
            )));
        }

        let size = response.content_length().map(|n| n as i64).unwrap_or(0);
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok((Box::new(StreamReader::new(Box::pin(stream))), size))
    }
}
