//! Device operations: partition swapping, boot flags, image installation

pub mod partitions;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::process::Command;
use tracing::{debug, info};

use crate::bootenv::{
    boot_vars, BootEnv, BOOTCOUNT, BOOT_PART, BOOT_PART_HEX, UPGRADE_AVAILABLE,
};
use crate::errors::AgentError;
use crate::installer;
use partitions::{partition_number, Partitions};

/// Rootfs partition configuration
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    pub rootfs_part_a: String,
    pub rootfs_part_b: String,
    pub reboot_cmd: String,
}

/// A dual-rootfs device with a bootloader environment.
pub struct Device {
    boot_env: Arc<dyn BootEnv>,
    partitions: Partitions,
    reboot_cmd: String,
}

impl Device {
    pub fn new(boot_env: Arc<dyn BootEnv>, config: DeviceConfig) -> Self {
        let partitions = Partitions::new(
            boot_env.clone(),
            config.rootfs_part_a,
            config.rootfs_part_b,
        );
        Self {
            boot_env,
            partitions,
            reboot_cmd: config.reboot_cmd,
        }
    }

    #[cfg(test)]
    fn with_partitions(boot_env: Arc<dyn BootEnv>, partitions: Partitions) -> Self {
        Self {
            boot_env,
            partitions,
            reboot_cmd: "true".to_string(),
        }
    }

    /// Path of the partition not currently mounted at `/`.
    pub async fn get_inactive(&mut self) -> Result<String, AgentError> {
        self.partitions.get_inactive().await
    }

    /// Stream `image` into the inactive partition. The caller is expected to
    /// invoke [`Device::enable_updated_partition`] afterwards.
    pub async fn install_update<R>(&mut self, image: &mut R, size: i64) -> Result<(), AgentError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        debug!("trying to install update of size {}", size);
        let inactive = self.partitions.get_inactive().await?;
        installer::install_image(image, size, &inactive).await
    }

    /// Mark the freshly written partition as the next boot candidate with
    /// `upgrade_available=1` and a reset boot counter.
    pub async fn enable_updated_partition(&mut self) -> Result<(), AgentError> {
        let inactive = self.partitions.get_inactive().await?;
        let (number, number_hex) = partition_number(&inactive)?;

        info!(
            "enabling partition with new image as boot candidate: {}",
            inactive
        );
        self.boot_env
            .write_env(&boot_vars(&[
                (UPGRADE_AVAILABLE, "1"),
                (BOOT_PART, &number),
                (BOOT_PART_HEX, &number_hex),
                (BOOTCOUNT, "0"),
            ]))
            .await?;

        debug!("marking inactive partition as a boot candidate successful");
        Ok(())
    }

    /// Point the bootloader back at the other configured partition and drop
    /// any pending upgrade. Used to undo an enabled update.
    pub async fn swap_partitions(&mut self) -> Result<(), AgentError> {
        let env = self.boot_env.read_env(&[BOOT_PART]).await?;
        let current = env.get(BOOT_PART).cloned().unwrap_or_default();

        let (num_a, hex_a) = partition_number(self.partitions.rootfs_part_a())?;
        let (num_b, hex_b) = partition_number(self.partitions.rootfs_part_b())?;

        let (number, number_hex) = if current == num_a {
            (num_b, hex_b)
        } else if current == num_b {
            (num_a, hex_a)
        } else {
            return Err(AgentError::PartitionError(format!(
                "boot environment {}={} matches neither configured partition",
                BOOT_PART, current
            )));
        };

        info!("setting partition for rollback: {}", number);
        self.boot_env
            .write_env(&boot_vars(&[
                (BOOT_PART, &number),
                (BOOT_PART_HEX, &number_hex),
                (UPGRADE_AVAILABLE, "0"),
            ]))
            .await?;
        Ok(())
    }

    /// Commit a booted and verified update by clearing `upgrade_available`.
    pub async fn commit_update(&mut self) -> Result<(), AgentError> {
        if !self.has_update().await? {
            return Err(AgentError::PartitionError(
                "there is nothing to commit".to_string(),
            ));
        }
        info!("committing update");
        self.boot_env
            .write_env(&boot_vars(&[(UPGRADE_AVAILABLE, "0")]))
            .await
    }

    /// Whether an update is awaiting commit.
    pub async fn has_update(&self) -> Result<bool, AgentError> {
        let env = self.boot_env.read_env(&[UPGRADE_AVAILABLE]).await?;
        Ok(env.get(UPGRADE_AVAILABLE).map(String::as_str) == Some("1"))
    }

    /// Whether the device booted a still-uncommitted update on the first
    /// attempt: `upgrade_available == 1` and `bootcount == 0`.
    pub async fn has_unconfirmed_update(&self) -> Result<bool, AgentError> {
        let env = self
            .boot_env
            .read_env(&[UPGRADE_AVAILABLE, BOOTCOUNT])
            .await?;
        Ok(env.get(UPGRADE_AVAILABLE).map(String::as_str) == Some("1")
            && env.get(BOOTCOUNT).map(String::as_str) == Some("0"))
    }

    /// Ask the host to reboot. Does not return on success.
    pub async fn reboot(&self) -> Result<(), AgentError> {
        info!("rebooting device");
        let status = Command::new(&self.reboot_cmd).status().await?;
        if !status.success() {
            return Err(AgentError::IoError(std::io::Error::other(format!(
                "{} exited with {}",
                self.reboot_cmd, status
            ))));
        }

        // The reboot is underway; wait for the process to be torn down.
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}
