//! Bootloader environment I/O
//!
//! The bootloader chooses the next rootfs from a small persistent
//! environment. The agent reads and writes four variables:
//! `mender_boot_part`, `mender_boot_part_hex`, `upgrade_available` and
//! `bootcount`. Writes must be atomic from the bootloader's perspective:
//! all named variables take effect together or not at all.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::AgentError;

/// Boot partition variable (decimal partition number)
pub const BOOT_PART: &str = "mender_boot_part";
/// Boot partition variable, uppercase hexadecimal
pub const BOOT_PART_HEX: &str = "mender_boot_part_hex";
/// "1" while an update is awaiting commit
pub const UPGRADE_AVAILABLE: &str = "upgrade_available";
/// Failed boot attempts of the update candidate
pub const BOOTCOUNT: &str = "bootcount";

/// A set of bootloader environment variables
pub type BootVars = BTreeMap<String, String>;

/// Build a `BootVars` map from name/value pairs.
pub fn boot_vars(pairs: &[(&str, &str)]) -> BootVars {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Read/write access to the bootloader environment. No caching; every read
/// reflects the current on-device state.
#[async_trait]
pub trait BootEnv: Send + Sync {
    /// Read the named variables.
    async fn read_env(&self, names: &[&str]) -> Result<BootVars, AgentError>;

    /// Write all variables in one atomic step.
    async fn write_env(&self, vars: &BootVars) -> Result<(), AgentError>;
}

/// U-Boot environment access through the `fw_printenv`/`fw_setenv` tools.
pub struct UBootEnv {
    printenv_cmd: String,
    setenv_cmd: String,
}

impl UBootEnv {
    pub fn new() -> Self {
        Self {
            printenv_cmd: "fw_printenv".to_string(),
            setenv_cmd: "fw_setenv".to_string(),
        }
    }
}

impl Default for UBootEnv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BootEnv for UBootEnv {
    async fn read_env(&self, names: &[&str]) -> Result<BootVars, AgentError> {
        let output = Command::new(&self.printenv_cmd)
            .args(names)
            .output()
            .await
            .map_err(|e| AgentError::BootEnvError(format!("{}: {}", self.printenv_cmd, e)))?;

        if !output.status.success() {
            return Err(AgentError::BootEnvError(format!(
                "{} exited with {}: {}",
                self.printenv_cmd,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_printenv_output(&String::from_utf8_lossy(&output.stdout), names)
    }

    async fn write_env(&self, vars: &BootVars) -> Result<(), AgentError> {
        // One `fw_setenv --script` invocation updates the whole environment
        // block (with CRC) in a single write.
        let mut child = Command::new(&self.setenv_cmd)
            .arg("--script")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::BootEnvError(format!("{}: {}", self.setenv_cmd, e)))?;

        let mut script = String::new();
        for (name, value) in vars {
            script.push_str(name);
            script.push(' ');
            script.push_str(value);
            script.push('\n');
        }
        debug!("writing boot environment: {:?}", vars);

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| AgentError::BootEnvError(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AgentError::BootEnvError(e.to_string()))?;
        if !output.status.success() {
            return Err(AgentError::BootEnvError(format!(
                "{} exited with {}: {}",
                self.setenv_cmd,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

fn parse_printenv_output(stdout: &str, names: &[&str]) -> Result<BootVars, AgentError> {
    let mut vars = BootVars::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((name, value)) => {
                vars.insert(name.to_string(), value.to_string());
            }
            None => {
                return Err(AgentError::BootEnvError(format!(
                    "malformed fw_printenv line: {:?}",
                    line
                )));
            }
        }
    }

    for name in names {
        if !vars.contains_key(*name) {
            return Err(AgentError::BootEnvError(format!(
                "variable {} missing from bootloader environment",
                name
            )));
        }
    }
    Ok(vars)
}

/// In-memory boot environment used as a test double.
#[derive(Debug, Default)]
pub struct MemBootEnv {
    vars: std::sync::Mutex<BootVars>,
}

impl MemBootEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vars(vars: BootVars) -> Self {
        Self {
            vars: std::sync::Mutex::new(vars),
        }
    }
}

#[async_trait]
impl BootEnv for MemBootEnv {
    async fn read_env(&self, names: &[&str]) -> Result<BootVars, AgentError> {
        let vars = self.vars.lock().map_err(|_| {
            AgentError::BootEnvError("boot environment lock poisoned".to_string())
        })?;
        let mut out = BootVars::new();
        for name in names {
            match vars.get(*name) {
                Some(value) => {
                    out.insert(name.to_string(), value.clone());
                }
                None => {
                    return Err(AgentError::BootEnvError(format!(
                        "variable {} missing from bootloader environment",
                        name
                    )));
                }
            }
        }
        Ok(out)
    }

    async fn write_env(&self, new_vars: &BootVars) -> Result<(), AgentError> {
        let mut vars = self.vars.lock().map_err(|_| {
            AgentError::BootEnvError("boot environment lock poisoned".to_string())
        })?;
        for (name, value) in new_vars {
            vars.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}
