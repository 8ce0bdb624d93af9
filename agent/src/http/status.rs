//! Update status reporting

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::errors::AgentError;
use crate::http::client::{response_error_info, ApiClient};
use crate::utils::exponential_backoff_time;

/// Progress marker attached to a status event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    Started,
    Finished,
    Error,
    StateEntered,
    StateFinished,
}

/// Status event reported to the backend during an update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusData {
    #[serde(rename = "client_state")]
    pub state: String,

    #[serde(rename = "script_name", skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,

    #[serde(rename = "script_status")]
    pub status: UpdateStatus,
}

impl UpdateStatusData {
    pub fn state(state: impl Into<String>, status: UpdateStatus) -> Self {
        Self {
            state: state.into(),
            script_name: None,
            status,
        }
    }

    pub fn script(
        state: impl Into<String>,
        script_name: impl Into<String>,
        status: UpdateStatus,
    ) -> Self {
        Self {
            state: state.into(),
            script_name: Some(script_name.into()),
            status,
        }
    }
}

impl ApiClient {
    /// Report a status event for `deployment_id`, retrying transient
    /// failures with the stepped backoff until it gives up.
    pub async fn report_status(
        &self,
        token: &str,
        deployment_id: &str,
        data: &UpdateStatusData,
        retry_cap: Duration,
    ) -> Result<(), AgentError> {
        let mut tried = 0u32;
        loop {
            match self.try_report_status(token, deployment_id, data).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let wait = exponential_backoff_time(tried, retry_cap)?;
                    warn!(
                        "failed to report status ({}), retrying in {:?}",
                        e, wait
                    );
                    tokio::time::sleep(wait).await;
                    tried += 1;
                }
            }
        }
    }

    async fn try_report_status(
        &self,
        token: &str,
        deployment_id: &str,
        data: &UpdateStatusData,
    ) -> Result<(), AgentError> {
        let url = self.api_url(&format!(
            "/deployments/device/deployments/{}/status",
            deployment_id
        ));
        debug!("reporting status {:?} to {}", data.status, url);

        let response = self
            .request(Method::PATCH, &url, token)
            .json(data)
            .send()
            .await
            .map_err(|e| AgentError::NetworkError(format!("status submit failed: {}", e)))?;

        if response.status() != StatusCode::OK {
            let info = response_error_info(response).await;
            error!("got unexpected HTTP status when reporting status: {}", info);
            return Err(AgentError::NetworkError(format!(
                "status submit failed: {}",
                info
            )));
        }
        Ok(())
    }
}
