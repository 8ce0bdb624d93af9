//! Deployment models

use serde::{Deserialize, Serialize};

/// A deployment descriptor received from the backend. Immutable within a
/// deployment attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// Unique deployment ID
    pub id: String,

    /// Artifact payload description
    pub artifact: Artifact,
}

/// Artifact metadata inside an update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Where to fetch the image from
    pub source: Source,

    /// Device types this artifact can be installed on
    #[serde(rename = "device_types_compatible", default)]
    pub compatible_devices: Vec<String>,

    /// Name of the artifact
    #[serde(rename = "artifact_name")]
    pub name: String,
}

/// Artifact source location
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Download URI for the image
    #[serde(default)]
    pub uri: String,

    /// Optional expiry timestamp for the URI
    #[serde(default)]
    pub expire: Option<String>,
}

impl UpdateInfo {
    /// Download URI of the artifact
    pub fn uri(&self) -> &str {
        &self.artifact.source.uri
    }

    /// Artifact name
    pub fn artifact_name(&self) -> &str {
        &self.artifact.name
    }

    /// Whether `device_type` is among the compatible device types
    pub fn compatible_with(&self, device_type: &str) -> bool {
        self.artifact
            .compatible_devices
            .iter()
            .any(|d| d == device_type)
    }
}
