//! Active/inactive rootfs partition discovery
//!
//! The active partition is whatever block device is mounted at `/`,
//! cross-checked against the bootloader environment. The inactive partition
//! is the other configured rootfs slice.

use std::sync::Arc;

use tokio::fs;
use tracing::debug;

use crate::bootenv::{BootEnv, BOOT_PART};
use crate::errors::AgentError;

/// A/B partition pair with cached discovery results.
pub struct Partitions {
    boot_env: Arc<dyn BootEnv>,
    rootfs_part_a: String,
    rootfs_part_b: String,
    active: Option<String>,
    inactive: Option<String>,
}

impl Partitions {
    pub fn new(boot_env: Arc<dyn BootEnv>, rootfs_part_a: String, rootfs_part_b: String) -> Self {
        Self {
            boot_env,
            rootfs_part_a,
            rootfs_part_b,
            active: None,
            inactive: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn preset(
        boot_env: Arc<dyn BootEnv>,
        rootfs_part_a: &str,
        rootfs_part_b: &str,
        active: &str,
    ) -> Self {
        Self {
            boot_env,
            rootfs_part_a: rootfs_part_a.to_string(),
            rootfs_part_b: rootfs_part_b.to_string(),
            active: Some(active.to_string()),
            inactive: None,
        }
    }

    pub fn rootfs_part_a(&self) -> &str {
        &self.rootfs_part_a
    }

    pub fn rootfs_part_b(&self) -> &str {
        &self.rootfs_part_b
    }

    /// The partition currently mounted at `/`.
    pub async fn get_active(&mut self) -> Result<String, AgentError> {
        if let Some(active) = &self.active {
            debug!("active partition: {}", active);
            return Ok(active.clone());
        }
        let active = self.discover_active().await?;
        debug!("detected active partition {}", active);
        self.active = Some(active.clone());
        Ok(active)
    }

    /// The configured partition that is not active.
    pub async fn get_inactive(&mut self) -> Result<String, AgentError> {
        if let Some(inactive) = &self.inactive {
            debug!("inactive partition: {}", inactive);
            return Ok(inactive.clone());
        }

        if self.rootfs_part_a.is_empty() || self.rootfs_part_b.is_empty() {
            return Err(AgentError::PartitionError(
                "rootfs_part_a and rootfs_part_b settings are not both set".to_string(),
            ));
        }
        if self.rootfs_part_a == self.rootfs_part_b {
            return Err(AgentError::PartitionError(
                "rootfs_part_a and rootfs_part_b cannot be set to the same value".to_string(),
            ));
        }

        let active = self.get_active().await?;
        let inactive = if active == self.rootfs_part_a {
            self.rootfs_part_b.clone()
        } else if active == self.rootfs_part_b {
            self.rootfs_part_a.clone()
        } else {
            return Err(AgentError::PartitionError(format!(
                "active root partition {} matches neither rootfs_part_a nor rootfs_part_b",
                active
            )));
        };

        debug!(
            "detected inactive partition {}, based on active partition {}",
            inactive, active
        );
        self.inactive = Some(inactive.clone());
        Ok(inactive)
    }

    async fn discover_active(&self) -> Result<String, AgentError> {
        let mounts = fs::read_to_string("/proc/mounts").await?;
        let candidate = root_candidate_from_mounts(&mounts);

        let root_dev = root_device_id().await?;

        // Fetch the boot partition number from the bootloader environment.
        let env = self.boot_env.read_env(&[BOOT_PART]).await?;
        let boot_part = env.get(BOOT_PART).cloned().unwrap_or_default();

        if let Some(candidate) = candidate {
            if is_root_device(&candidate, root_dev).await {
                return Ok(candidate);
            }
            // The mount table may name a symlink or mapper path whose rdev
            // does not match; accept it when the bootloader agrees.
            if boot_env_matches(&boot_part, &candidate) {
                return Ok(candidate);
            }
        }

        // Walk /dev for a node whose device id matches the root mount.
        let mut entries = fs::read_dir("/dev").await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().to_string_lossy().to_string();
            if is_root_device(&path, root_dev).await {
                if boot_env_matches(&boot_part, &path) {
                    return Ok(path);
                }
                return Err(AgentError::PartitionError(format!(
                    "mounted root {} does not match boot environment {}={}",
                    path, BOOT_PART, boot_part
                )));
            }
        }

        Err(AgentError::PartitionError(
            "cannot match active partition to any mounted device".to_string(),
        ))
    }
}

/// First device mounted at `/` in /proc/mounts format.
fn root_candidate_from_mounts(mounts: &str) -> Option<String> {
    for line in mounts.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 && fields[1] == "/" {
            return Some(fields[0].to_string());
        }
    }
    None
}

/// Device id of the filesystem mounted at `/`.
async fn root_device_id() -> Result<u64, AgentError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let meta = fs::metadata("/").await?;
        Ok(meta.dev())
    }
    #[cfg(not(unix))]
    {
        Err(AgentError::PartitionError(
            "partition discovery requires a unix host".to_string(),
        ))
    }
}

/// Whether `dev` is a block device whose rdev equals the root filesystem's
/// device id.
async fn is_root_device(dev: &str, root_dev: u64) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::fs::MetadataExt;
        match fs::metadata(dev).await {
            Ok(meta) => meta.file_type().is_block_device() && meta.rdev() == root_dev,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (dev, root_dev);
        false
    }
}

/// The bootloader environment agrees with a device path when the path ends
/// with the stored partition number.
fn boot_env_matches(boot_part: &str, device: &str) -> bool {
    !boot_part.is_empty() && device.ends_with(boot_part)
}

/// Decimal and uppercase-hex partition number of a device path. The number
/// is the longest trailing run of digits; paths without one are invalid.
pub fn partition_number(device: &str) -> Result<(String, String), AgentError> {
    let trimmed = device.trim_end_matches(|c: char| c.is_ascii_digit());
    let digits = &device[trimmed.len()..];
    if digits.is_empty() {
        return Err(AgentError::PartitionError(format!(
            "invalid partition path, no trailing number: {}",
            device
        )));
    }
    let number: u64 = digits.parse().map_err(|_| {
        AgentError::PartitionError(format!("invalid partition number in {}", device))
    })?;
    Ok((digits.to_string(), format!("{:X}", number)))
}
