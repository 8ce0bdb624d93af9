//! State machine scenario tests
//!
//! Drives the full update lifecycle against scripted doubles: a recording
//! script executor and a fake controller standing in for the device and the
//! backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use updagent::deploylog::{DeploymentLogManager, LogMessage};
use updagent::errors::AgentError;
use updagent::http::deployments::UpdateReader;
use updagent::http::status::{UpdateStatus, UpdateStatusData};
use updagent::models::update::{Artifact, Source, UpdateInfo};
use updagent::scripts::ScriptExecutor;
use updagent::state::data::{
    load_state_data, RebootStateData, StateData, StateId, TransitionStatus, STATE_DATA_VERSION,
};
use updagent::state::machine::{self, transition_state, State, StateContext};
use updagent::state::Controller;
use updagent::storage::store::Store;

#[derive(Default)]
struct RecordingExecutor {
    executed: Mutex<Vec<(String, String)>>,
    failures: Mutex<HashSet<(String, String)>>,
}

impl RecordingExecutor {
    fn fail_on(&self, state: &str, action: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert((state.to_string(), action.to_string()));
    }

    fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptExecutor for RecordingExecutor {
    async fn execute_all(
        &self,
        state: &str,
        action: &str,
        ignore_error: bool,
    ) -> Result<(), AgentError> {
        self.executed
            .lock()
            .unwrap()
            .push((state.to_string(), action.to_string()));
        let failing = self
            .failures
            .lock()
            .unwrap()
            .contains(&(state.to_string(), action.to_string()));
        if failing && !ignore_error {
            return Err(AgentError::ScriptError("error executing script".to_string()));
        }
        Ok(())
    }

    async fn check_rootfs_scripts_version(&self) -> Result<(), AgentError> {
        Ok(())
    }
}

struct FakeController {
    executor: Arc<RecordingExecutor>,
    updates: Mutex<Vec<UpdateInfo>>,
    calls: Mutex<Vec<String>>,
    /// upgrade_available in the fake boot environment
    pending: AtomicBool,
    /// whether the new image would boot
    boot_ok: bool,
    verify_ok: bool,
    stop_tx: watch::Sender<bool>,
}

impl FakeController {
    fn new(executor: Arc<RecordingExecutor>, stop_tx: watch::Sender<bool>) -> Self {
        Self {
            executor,
            updates: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            pending: AtomicBool::new(false),
            boot_ok: true,
            verify_ok: true,
            stop_tx,
        }
    }

    fn queue_update(&self, update: UpdateInfo) {
        self.updates.lock().unwrap().push(update);
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Controller for FakeController {
    fn script_executor(&self) -> Arc<dyn ScriptExecutor> {
        self.executor.clone()
    }

    fn update_poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }

    fn inventory_poll_interval(&self) -> Duration {
        Duration::from_secs(3600)
    }

    fn retry_poll_interval(&self) -> Duration {
        Duration::from_millis(5)
    }

    fn is_authorized(&self) -> bool {
        true
    }

    async fn authorize(&mut self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn check_update(&mut self) -> Result<Option<UpdateInfo>, AgentError> {
        self.record("check_update");
        Ok(self.updates.lock().unwrap().pop())
    }

    async fn fetch_update(
        &mut self,
        update: &UpdateInfo,
    ) -> Result<(UpdateReader, i64), AgentError> {
        self.record(format!("fetch:{}", update.id));
        let body = b"image-bytes".to_vec();
        let size = body.len() as i64;
        Ok((Box::new(std::io::Cursor::new(body)), size))
    }

    async fn install_update(
        &mut self,
        _image: UpdateReader,
        size: i64,
    ) -> Result<(), AgentError> {
        self.record(format!("install:{}", size));
        Ok(())
    }

    async fn enable_updated_partition(&mut self) -> Result<(), AgentError> {
        self.record("enable");
        self.pending.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn verify_update(&mut self, _update: &UpdateInfo) -> Result<(), AgentError> {
        self.record("verify");
        if self.verify_ok {
            Ok(())
        } else {
            Err(AgentError::VerificationError("artifact mismatch".to_string()))
        }
    }

    async fn commit_update(&mut self) -> Result<(), AgentError> {
        self.record("commit");
        if self.pending.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AgentError::PartitionError("there is nothing to commit".to_string()))
        }
    }

    async fn swap_partitions(&mut self) -> Result<(), AgentError> {
        self.record("swap");
        self.pending.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn has_unconfirmed_update(&self) -> Result<bool, AgentError> {
        Ok(self.pending.load(Ordering::SeqCst) && self.boot_ok)
    }

    async fn reboot(&mut self) -> Result<(), AgentError> {
        self.record("reboot");
        Ok(())
    }

    async fn submit_inventory(&mut self) -> Result<(), AgentError> {
        self.record("inventory");
        Ok(())
    }

    async fn report_update_status(
        &mut self,
        update: &UpdateInfo,
        status: UpdateStatusData,
    ) -> Result<(), AgentError> {
        self.record(format!("report:{}:{}:{:?}", update.id, status.state, status.status));
        // Terminal report: ask the daemon to stop once back at Idle.
        if status.status == UpdateStatus::StateFinished
            && (status.state == "success" || status.state == "failure")
        {
            let _ = self.stop_tx.send(true);
        }
        Ok(())
    }

    async fn upload_log(
        &mut self,
        update: &UpdateInfo,
        messages: &[LogMessage],
    ) -> Result<(), AgentError> {
        self.record(format!("upload_log:{}:{}", update.id, messages.len()));
        Ok(())
    }
}

fn sample_update() -> UpdateInfo {
    UpdateInfo {
        id: "d1".to_string(),
        artifact: Artifact {
            source: Source {
                uri: "https://backend/artifact/d1".to_string(),
                expire: None,
            },
            compatible_devices: vec!["qemu".to_string()],
            name: "release-2".to_string(),
        },
    }
}

async fn test_fixture() -> (tempfile::TempDir, Arc<Store>, StateContext, watch::Sender<bool>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("store")).await.unwrap());
    let (stop_tx, stop_rx) = watch::channel(false);
    let ctx = StateContext::new(
        store.clone(),
        DeploymentLogManager::new(dir.path().join("deploylogs")),
        stop_rx,
    );
    (dir, store, ctx, stop_tx)
}

fn hooks(executed: &[(String, String)]) -> Vec<(&str, &str)> {
    executed
        .iter()
        .map(|(s, a)| (s.as_str(), a.as_str()))
        .collect()
}

#[tokio::test]
async fn test_happy_path_full_deployment() {
    let (_dir, store, mut ctx, stop_tx) = test_fixture().await;
    let executor = Arc::new(RecordingExecutor::default());
    let mut ctrl = FakeController::new(executor.clone(), stop_tx);
    ctrl.queue_update(sample_update());

    tokio::time::timeout(Duration::from_secs(30), machine::run(&mut ctrl, &mut ctx))
        .await
        .expect("machine hung")
        .expect("machine failed");

    // Every class boundary ran exactly one Leave and one Enter.
    assert_eq!(
        hooks(&executor.executed()),
        vec![
            ("Idle", "Enter"),
            ("Idle", "Leave"),
            ("Sync", "Enter"),
            ("Sync", "Leave"),
            ("Download", "Enter"),
            ("Download", "Leave"),
            ("ArtifactInstall", "Enter"),
            ("ArtifactInstall", "Leave"),
            ("ArtifactReboot", "Enter"),
            ("ArtifactReboot", "Leave"),
            ("ArtifactCommit", "Enter"),
            ("Idle", "Enter"),
        ]
    );

    // Device side effects in order.
    let calls = ctrl.calls();
    let device_calls: Vec<&String> = calls
        .iter()
        .filter(|c| {
            c.starts_with("fetch")
                || c.starts_with("install")
                || *c == "enable"
                || *c == "reboot"
                || *c == "verify"
                || *c == "commit"
                || *c == "swap"
        })
        .collect();
    assert_eq!(
        device_calls,
        vec!["fetch:d1", "install:11", "enable", "reboot", "verify", "commit"]
    );

    // Final success reported, nothing rolled back, no logs uploaded.
    assert!(calls.iter().any(|c| c == "report:d1:success:StateFinished"));
    assert!(!calls.iter().any(|c| c.starts_with("upload_log")));
    assert!(!ctrl.pending.load(Ordering::SeqCst));

    // Back at Idle with no persisted cursor.
    assert!(!store.contains("state").await.unwrap());
}

#[tokio::test]
async fn test_leave_script_failure_rolls_back() {
    let (_dir, store, mut ctx, stop_tx) = test_fixture().await;
    let executor = Arc::new(RecordingExecutor::default());
    executor.fail_on("ArtifactReboot", "Leave");
    let mut ctrl = FakeController::new(executor.clone(), stop_tx);
    ctrl.queue_update(sample_update());

    tokio::time::timeout(Duration::from_secs(30), machine::run(&mut ctrl, &mut ctx))
        .await
        .expect("machine hung")
        .expect("machine failed");

    let calls = ctrl.calls();
    // The partition was enabled, then the failed Leave diverted to rollback.
    let enable_at = calls.iter().position(|c| c == "enable").unwrap();
    let swap_at = calls.iter().position(|c| c == "swap").unwrap();
    assert!(enable_at < swap_at);

    // Commit never ran; the failure was reported with the deployment log.
    assert!(!calls.iter().any(|c| c == "commit"));
    assert!(calls.iter().any(|c| c == "report:d1:failure:StateFinished"));
    assert!(calls.iter().any(|c| c.starts_with("upload_log:d1:")));

    // The failing class's Error scripts ran.
    assert!(executor
        .executed()
        .contains(&("ArtifactReboot".to_string(), "Error".to_string())));

    // Boot environment no longer advertises an upgrade; cursor cleared.
    assert!(!ctrl.pending.load(Ordering::SeqCst));
    assert!(!store.contains("state").await.unwrap());
}

#[tokio::test]
async fn test_failed_boot_rolls_back_without_reboot() {
    let (_dir, _store, mut ctx, stop_tx) = test_fixture().await;
    let executor = Arc::new(RecordingExecutor::default());
    let mut ctrl = FakeController::new(executor.clone(), stop_tx);
    // Simulate the bootloader falling back to the old image.
    ctrl.boot_ok = false;
    ctrl.queue_update(sample_update());

    tokio::time::timeout(Duration::from_secs(30), machine::run(&mut ctrl, &mut ctx))
        .await
        .expect("machine hung")
        .expect("machine failed");

    let calls = ctrl.calls();
    assert!(calls.iter().any(|c| c == "swap"));
    assert!(!calls.iter().any(|c| c == "verify"));
    assert!(calls.iter().any(|c| c == "report:d1:failure:StateFinished"));
    // Only the install reboot happened; the rollback needed none.
    assert_eq!(calls.iter().filter(|c| *c == "reboot").count(), 1);
}

#[tokio::test]
async fn test_leave_done_resume_skips_leave() {
    let (_dir, _store, mut ctx, stop_tx) = test_fixture().await;
    let executor = Arc::new(RecordingExecutor::default());
    let mut ctrl = FakeController::new(executor.clone(), stop_tx);

    // Resume the UpdateCheck -> UpdateFetch transition after Leave already
    // ran (persisted LeaveDone, then the device rebooted).
    let (_completed, next, cancelled) = transition_state(
        &mut ctrl,
        &mut ctx,
        &State::UpdateCheck,
        State::UpdateFetch(sample_update()),
        TransitionStatus::LeaveDone,
    )
    .await;

    assert!(!cancelled);
    assert_eq!(next.id(), StateId::UpdateStore);
    // Only Enter ran; the Sync Leave was skipped.
    assert_eq!(hooks(&executor.executed()), vec![("Download", "Enter")]);
}

#[tokio::test]
async fn test_fresh_transition_runs_leave_then_enter() {
    let (_dir, _store, mut ctx, stop_tx) = test_fixture().await;
    let executor = Arc::new(RecordingExecutor::default());
    let mut ctrl = FakeController::new(executor.clone(), stop_tx);

    let (_completed, next, _cancelled) = transition_state(
        &mut ctrl,
        &mut ctx,
        &State::UpdateCheck,
        State::UpdateFetch(sample_update()),
        TransitionStatus::NoStatus,
    )
    .await;

    assert_eq!(next.id(), StateId::UpdateStore);
    assert_eq!(
        hooks(&executor.executed()),
        vec![("Sync", "Leave"), ("Download", "Enter")]
    );
}

#[tokio::test]
async fn test_leave_done_persisted_before_enter() {
    let (_dir, store, mut ctx, stop_tx) = test_fixture().await;
    let executor = Arc::new(RecordingExecutor::default());
    executor.fail_on("Download", "Enter");
    let mut ctrl = FakeController::new(executor.clone(), stop_tx);

    let (_completed, next, _cancelled) = transition_state(
        &mut ctrl,
        &mut ctx,
        &State::UpdateCheck,
        State::UpdateFetch(sample_update()),
        TransitionStatus::NoStatus,
    )
    .await;

    // The Enter failure diverted the deployment.
    assert_eq!(next.id(), StateId::UpdateError);

    // A reboot at this instant must resume with Leave already done.
    let data = load_state_data(&store).await.unwrap();
    assert_eq!(data.from_state, StateId::UpdateCheck);
    assert_eq!(data.to_state, StateId::UpdateFetch);
    assert_eq!(data.transition_status, TransitionStatus::LeaveDone);
    assert_eq!(
        data.to_state_data.update_info.as_ref().map(|u| u.id.as_str()),
        Some("d1")
    );
}

#[tokio::test]
async fn test_recovery_mapping() {
    let (_dir, store, mut ctx, stop_tx) = test_fixture().await;
    let executor = Arc::new(RecordingExecutor::default());
    let mut ctrl = FakeController::new(executor.clone(), stop_tx);

    // Interrupted mid-store before the partition was enabled: re-fetch.
    let data = StateData {
        version: STATE_DATA_VERSION,
        from_state: StateId::UpdateFetch,
        to_state: StateId::UpdateStore,
        transition_status: TransitionStatus::NoStatus,
        from_state_data: RebootStateData {
            update_info: Some(sample_update()),
        },
        to_state_data: RebootStateData {
            update_info: Some(sample_update()),
        },
    };
    store.update("state", &data).await.unwrap();
    let (_from, resumed, status) = machine::load_current(&mut ctrl, &mut ctx).await.unwrap();
    assert_eq!(resumed.id(), StateId::UpdateFetch);
    assert_eq!(status, TransitionStatus::NoStatus);

    // Same cursor after the partition was enabled: treat as rebooted.
    ctrl.pending.store(true, Ordering::SeqCst);
    let (_from, resumed, _status) = machine::load_current(&mut ctrl, &mut ctx).await.unwrap();
    assert_eq!(resumed.id(), StateId::AfterReboot);

    // Interrupted around the reboot: resume at AfterReboot.
    let data = StateData {
        to_state: StateId::Reboot,
        from_state: StateId::UpdateInstall,
        ..data.clone()
    };
    store.update("state", &data).await.unwrap();
    let (_from, resumed, _status) = machine::load_current(&mut ctrl, &mut ctx).await.unwrap();
    assert_eq!(resumed.id(), StateId::AfterReboot);

    // Idle-phase cursor maps back to Idle.
    let data = StateData {
        to_state: StateId::CheckWait,
        from_state: StateId::Idle,
        from_state_data: RebootStateData::default(),
        to_state_data: RebootStateData::default(),
        ..data.clone()
    };
    store.update("state", &data).await.unwrap();
    let (_from, resumed, _status) = machine::load_current(&mut ctrl, &mut ctx).await.unwrap();
    assert_eq!(resumed.id(), StateId::Idle);

    // No cursor at all: fresh start.
    store.remove("state").await.unwrap();
    let (from, resumed, _status) = machine::load_current(&mut ctrl, &mut ctx).await.unwrap();
    assert_eq!(from.id(), StateId::Init);
    assert_eq!(resumed.id(), StateId::Idle);
}

#[tokio::test]
async fn test_corrupt_state_data_is_fatal() {
    let (_dir, store, mut ctx, stop_tx) = test_fixture().await;
    let executor = Arc::new(RecordingExecutor::default());
    let mut ctrl = FakeController::new(executor.clone(), stop_tx);

    store.update("state", &"garbage").await.unwrap();
    let err = machine::load_current(&mut ctrl, &mut ctx).await.unwrap_err();
    assert!(matches!(err, AgentError::FatalError(_)));
}

#[tokio::test]
async fn test_verification_failure_triggers_rollback_reboot() {
    let (_dir, _store, mut ctx, stop_tx) = test_fixture().await;
    let executor = Arc::new(RecordingExecutor::default());
    let mut ctrl = FakeController::new(executor.clone(), stop_tx);
    ctrl.verify_ok = false;
    ctrl.queue_update(sample_update());

    tokio::time::timeout(Duration::from_secs(30), machine::run(&mut ctrl, &mut ctx))
        .await
        .expect("machine hung")
        .expect("machine failed");

    let calls = ctrl.calls();
    assert!(calls.iter().any(|c| c == "verify"));
    assert!(calls.iter().any(|c| c == "swap"));
    // One reboot into the update, one back out.
    assert_eq!(calls.iter().filter(|c| *c == "reboot").count(), 2);
    assert!(calls.iter().any(|c| c == "report:d1:failure:StateFinished"));
}
