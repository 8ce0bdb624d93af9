//! Inventory submission

use reqwest::{Method, StatusCode};
use serde::Serialize;
use tracing::{debug, error};

use crate::errors::AgentError;
use crate::http::client::{response_error_info, ApiClient};

/// A single inventory attribute record
#[derive(Debug, Clone, Serialize)]
pub struct InventoryAttribute {
    pub name: String,
    pub value: String,
}

impl InventoryAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl ApiClient {
    /// Push the device attribute set to the backend.
    pub async fn submit_inventory(
        &self,
        token: &str,
        attributes: &[InventoryAttribute],
    ) -> Result<(), AgentError> {
        let url = self.api_url("/inventory/device/attributes");
        debug!("submitting {} inventory attributes", attributes.len());

        let response = self
            .request(Method::PATCH, &url, token)
            .json(attributes)
            .send()
            .await
            .map_err(|e| AgentError::NetworkError(format!("inventory submit failed: {}", e)))?;

        if response.status() != StatusCode::OK {
            let info = response_error_info(response).await;
            error!(
                "got unexpected HTTP status when submitting inventory: {}",
                info
            );
            return Err(AgentError::NetworkError(format!(
                "inventory submit failed: {}",
                info
            )));
        }
        Ok(())
    }
}
