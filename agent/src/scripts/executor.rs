//! State-script executor
//!
//! Discovers hook scripts for a transition class and action, runs them in
//! lexicographic order in their own process group, enforces a wall-clock
//! timeout, and persists retry-later bookkeeping in the store.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, warn};

use crate::errors::AgentError;
use crate::storage::store::Store;

/// Exit code a script uses to request a later retry. Shells truncate exit
/// codes to 8 bits, so this arrives as status 254.
pub const EXIT_RETRY_LATER: i32 = -2;

/// Cap on captured script stderr.
pub const STDERR_CAP: usize = 10 * 1024;

/// Marker logged when a script's stderr exceeded the cap.
pub const STDERR_TRUNCATED_MARKER: &str = "Truncated to 10 KiB";

/// Store key prefix for retry-later records.
const SCRIPT_KEY_PREFIX: &str = "script:";

/// Narrow capability the state machine uses to run hook scripts.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Run every script of `state` (a transition-class name) and `action`
    /// (`Enter`, `Leave` or `Error`).
    async fn execute_all(
        &self,
        state: &str,
        action: &str,
        ignore_error: bool,
    ) -> Result<(), AgentError>;

    /// Verify the rootfs script directory's version file is supported.
    async fn check_rootfs_scripts_version(&self) -> Result<(), AgentError>;
}

/// Per-script persistent retry counter. Deleted on the first zero exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryLaterRecord {
    /// Transition class that owns the script
    pub state: String,
    /// When the script first asked to be retried
    pub first_exec_time: DateTime<Utc>,
    /// Accumulated wall-clock time across attempts, in milliseconds
    pub total_duration_ms: u64,
}

/// Script executor configuration
#[derive(Debug, Clone)]
pub struct ScriptsConfig {
    /// Scripts baked into the image (Idle, Sync, Download classes)
    pub rootfs_scripts_path: PathBuf,
    /// Scripts delivered with the update (Artifact* classes)
    pub artifact_scripts_path: PathBuf,
    /// Accepted `version` file values
    pub supported_versions: Vec<i32>,
    /// Wall-clock timeout per script
    pub timeout: Duration,
    /// Sleep between retry-later attempts
    pub retry_interval: Duration,
    /// Cumulative retry-later budget per script
    pub retry_total_time: Duration,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            rootfs_scripts_path: PathBuf::from("/etc/updagent/scripts"),
            artifact_scripts_path: PathBuf::from("/var/lib/updagent/scripts"),
            supported_versions: vec![2, 3],
            timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(60),
            retry_total_time: Duration::from_secs(180),
        }
    }
}

/// Production script executor.
pub struct Launcher {
    store: Arc<Store>,
    config: ScriptsConfig,
}

fn script_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z]+_(Enter|Leave|Error)_[0-9]{2}(_\S+)?$").unwrap()
    })
}

/// Whether `name` is a well-formed state-script file name.
pub fn is_valid_script_name(name: &str) -> bool {
    script_name_regex().is_match(name)
}

impl Launcher {
    pub fn new(store: Arc<Store>, config: ScriptsConfig) -> Self {
        Self { store, config }
    }

    fn scripts_dir(&self, state: &str) -> &Path {
        // Idle, Sync and Download hooks ship with the image; the artifact
        // classes come with the update payload.
        if matches!(state, "Idle" | "Sync" | "Download") {
            &self.config.rootfs_scripts_path
        } else {
            &self.config.artifact_scripts_path
        }
    }

    async fn get_scripts(
        &self,
        state: &str,
        action: &str,
    ) -> Result<Vec<PathBuf>, AgentError> {
        let dir = self.scripts_dir(state);

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            // No state scripts directory; just move on.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AgentError::ScriptError(format!(
                    "cannot read scripts directory {:?}: {}",
                    dir, e
                )))
            }
        };

        let mut names: Vec<String> = Vec::new();
        let mut version: Option<i32> = None;
        let state_prefix = format!("{}_", state);

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "version" {
                version = Some(read_version(&entry.path()).await?);
                continue;
            }
            if name.contains(&state_prefix) && name.contains(action) {
                if is_valid_script_name(&name) {
                    names.push(name);
                } else {
                    warn!("script format mismatch: '{}' will not be run", name);
                }
            }
        }

        if !names.is_empty() {
            match version {
                None => {
                    return Err(AgentError::ScriptError(format!(
                        "missing version file in {:?}",
                        dir
                    )))
                }
                Some(v) if !self.config.supported_versions.contains(&v) => {
                    return Err(AgentError::ScriptError(format!(
                        "unsupported scripts version: {} (supported: {:?})",
                        v, self.config.supported_versions
                    )))
                }
                Some(_) => {}
            }
        }

        // Lexicographic file-name order is the only ordering contract.
        names.sort();
        Ok(names.into_iter().map(|n| dir.join(n)).collect())
    }

    async fn handle_retry_later(
        &self,
        script_name: &str,
        state: &str,
        elapsed: Duration,
    ) -> AgentError {
        let key = format!("{}{}", SCRIPT_KEY_PREFIX, script_name);
        let elapsed_ms = elapsed.as_millis() as u64;

        let record = match self.store.get::<RetryLaterRecord>(&key).await {
            Ok(mut existing) => {
                existing.total_duration_ms += elapsed_ms;
                existing
            }
            Err(AgentError::NotFound(_)) => RetryLaterRecord {
                state: state.to_string(),
                first_exec_time: Utc::now(),
                total_duration_ms: elapsed_ms,
            },
            Err(e) => return e,
        };

        if let Err(e) = self.store.update(&key, &record).await {
            return e;
        }

        if Duration::from_millis(record.total_duration_ms) <= self.config.retry_total_time {
            AgentError::RetryLater
        } else {
            AgentError::ScriptRetryExceeded(script_name.to_string())
        }
    }

    async fn clear_retry_record(&self, script_name: &str) {
        let key = format!("{}{}", SCRIPT_KEY_PREFIX, script_name);
        match self.store.contains(&key).await {
            Ok(true) => {
                if let Err(e) = self.store.remove(&key).await {
                    error!("failed to remove {} from store: {}", key, e);
                }
            }
            Ok(false) => {}
            Err(e) => error!("failed to check {} in store: {}", key, e),
        }
    }
}

#[async_trait]
impl ScriptExecutor for Launcher {
    async fn execute_all(
        &self,
        state: &str,
        action: &str,
        ignore_error: bool,
    ) -> Result<(), AgentError> {
        debug!("executing scripts for [{}:{}]", state, action);

        let scripts = match self.get_scripts(state, action).await {
            Ok(scripts) => scripts,
            Err(e) => {
                if ignore_error {
                    error!(
                        "statescript: ignoring error while collecting [{}:{}] scripts: {}",
                        state, action, e
                    );
                    return Ok(());
                }
                return Err(e);
            }
        };

        let mut idx = 0;
        while idx < scripts.len() {
            let script = &scripts[idx];
            let name = script
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            if !is_executable(script).await {
                if ignore_error {
                    error!(
                        "statescript: ignoring script {:?} being not executable",
                        script
                    );
                    idx += 1;
                    continue;
                }
                return Err(AgentError::ScriptError(format!(
                    "script {:?} is not executable",
                    script
                )));
            }

            let started = Instant::now();
            let outcome = execute_script(script, self.config.timeout).await;
            log_stderr(&name, &outcome);

            if outcome.code != 0 {
                if outcome.code == EXIT_RETRY_LATER {
                    match self.handle_retry_later(&name, state, started.elapsed()).await {
                        AgentError::RetryLater => {
                            debug!(
                                "script '{}' asked to be retried, sleeping {:?}",
                                name, self.config.retry_interval
                            );
                            tokio::time::sleep(self.config.retry_interval).await;
                            // Re-run from the failed script onward.
                            continue;
                        }
                        e => {
                            if ignore_error {
                                error!("statescript: ignoring error from '{}': {}", name, e);
                                idx += 1;
                                continue;
                            }
                            return Err(e);
                        }
                    }
                }
                if ignore_error {
                    error!(
                        "statescript: ignoring error executing '{}': {}",
                        name, outcome.code
                    );
                } else {
                    return Err(AgentError::ScriptError(format!(
                        "error executing '{}': {}",
                        name, outcome.code
                    )));
                }
            } else {
                // Zero exit removes any retry-later bookkeeping.
                self.clear_retry_record(&name).await;
            }
            idx += 1;
        }
        Ok(())
    }

    async fn check_rootfs_scripts_version(&self) -> Result<(), AgentError> {
        let path = self.config.rootfs_scripts_path.join("version");
        let version = match tokio::fs::read_to_string(&path).await {
            // No scripts; no error.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(AgentError::ScriptError(format!(
                    "cannot read rootfs scripts version: {}",
                    e
                )))
            }
            Ok(contents) => parse_version(&contents, &path)?,
        };

        if self.config.supported_versions.contains(&version) {
            Ok(())
        } else {
            Err(AgentError::ScriptError(format!(
                "unsupported scripts version: {}",
                version
            )))
        }
    }
}

async fn read_version(path: &Path) -> Result<i32, AgentError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| AgentError::ScriptError(format!("cannot read version file: {}", e)))?;
    parse_version(&contents, path)
}

fn parse_version(contents: &str, path: &Path) -> Result<i32, AgentError> {
    contents.trim().parse::<i32>().map_err(|_| {
        AgentError::ScriptError(format!("malformed version file {:?}: {:?}", path, contents))
    })
}

async fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match tokio::fs::metadata(path).await {
            Ok(meta) => meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::fs::metadata(path).await.is_ok()
    }
}

/// Result of a single script run.
#[derive(Debug, Default)]
pub struct ScriptOutcome {
    /// Exit code; −1 for timeout or signal death, −2 for retry-later.
    pub code: i32,
    /// Captured stderr, at most [`STDERR_CAP`] bytes.
    pub stderr: Vec<u8>,
    /// Whether stderr exceeded the cap.
    pub truncated: bool,
}

/// Run one script in its own process group with a wall-clock timeout.
/// On expiry the whole group gets SIGKILL and the outcome code is −1.
pub async fn execute_script(path: &Path, timeout: Duration) -> ScriptOutcome {
    let mut cmd = std::process::Command::new(path);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    // The script and its children get their own PGID so a kill cannot reach
    // the agent itself.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = match tokio::process::Command::from(cmd).spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("failed to start script {:?}: {}", path, e);
            return ScriptOutcome {
                code: -1,
                ..Default::default()
            };
        }
    };

    let pid = child.id();
    let stderr_pipe = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut captured = Vec::new();
        let mut truncated = false;
        if let Some(mut pipe) = stderr_pipe {
            let mut buf = [0u8; 4096];
            // Keep draining past the cap so the child never blocks on a
            // full pipe.
            loop {
                match pipe.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let room = STDERR_CAP.saturating_sub(captured.len());
                        let take = room.min(n);
                        captured.extend_from_slice(&buf[..take]);
                        if take < n {
                            truncated = true;
                        }
                    }
                }
            }
        }
        (captured, truncated)
    });

    let code = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => ret_code(status),
        Ok(Err(e)) => {
            error!("failed waiting for script {:?}: {}", path, e);
            -1
        }
        Err(_) => {
            warn!("script {:?} timed out after {:?}, killing", path, timeout);
            kill_process_group(pid);
            let _ = child.wait().await;
            -1
        }
    };

    let (stderr, truncated) = stderr_task.await.unwrap_or_default();
    ScriptOutcome {
        code,
        stderr,
        truncated,
    }
}

fn ret_code(status: std::process::ExitStatus) -> i32 {
    match status.code() {
        // Shells truncate exit codes to 8 bits, so -2 arrives as 254.
        Some(code) if code == (EXIT_RETRY_LATER as u8) as i32 => EXIT_RETRY_LATER,
        Some(code) => code,
        None => -1,
    }
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // Negative PID addresses the whole process group.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

fn log_stderr(name: &str, outcome: &ScriptOutcome) {
    if outcome.stderr.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(&outcome.stderr);
    if outcome.truncated {
        error!("collected output (stderr) from '{}' ({}): {}", name, STDERR_TRUNCATED_MARKER, text);
    } else {
        error!("collected output (stderr) from '{}': {}", name, text);
    }
}
