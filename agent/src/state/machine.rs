//! The update state machine
//!
//! The current state is a value carrying any in-flight deployment. A single
//! step runs the outgoing class's `Leave` hooks, persists `LeaveDone`, runs
//! the incoming class's `Enter` hooks, persists the new cursor, then executes
//! the state handler. The persisted cursor always identifies the next action
//! to retry or resume after a crash or reboot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::deploylog::DeploymentLogManager;
use crate::errors::AgentError;
use crate::http::status::{UpdateStatus, UpdateStatusData};
use crate::models::update::UpdateInfo;
use crate::state::controller::Controller;
use crate::state::data::{
    load_state_data, remove_state_data, save_state_data, RebootStateData, StateData, StateId,
    TransitionStatus, STATE_DATA_VERSION,
};
use crate::state::transition::TransitionClass;
use crate::storage::store::Store;

/// Shared context every state handler sees.
pub struct StateContext {
    pub store: Arc<Store>,
    pub deployment_log: DeploymentLogManager,
    pub last_inventory_update: Option<std::time::Instant>,
    stop_rx: watch::Receiver<bool>,
}

impl StateContext {
    pub fn new(
        store: Arc<Store>,
        deployment_log: DeploymentLogManager,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            deployment_log,
            last_inventory_update: None,
            stop_rx,
        }
    }

    /// Whether a stop was requested.
    pub fn stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Sleep for `duration`, returning false when interrupted by a stop
    /// request.
    pub async fn wait(&mut self, duration: Duration) -> bool {
        if self.stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stop_rx.wait_for(|stop| *stop) => false,
        }
    }
}

/// A state value, carrying whatever must survive into its handler.
#[derive(Debug, Clone)]
pub enum State {
    Init,
    Idle,
    Authorize,
    AuthorizeWait,
    InventoryUpdate,
    CheckWait,
    UpdateCheck,
    UpdateFetch(UpdateInfo),
    UpdateStore(UpdateInfo),
    UpdateInstall(UpdateInfo),
    Reboot(UpdateInfo),
    AfterReboot(UpdateInfo),
    UpdateVerify(UpdateInfo),
    UpdateCommit(UpdateInfo),
    UpdateStatusReport { update: UpdateInfo, success: bool },
    Rollback { update: UpdateInfo, do_reboot: bool },
    RollbackReboot(UpdateInfo),
    AfterRollbackReboot(UpdateInfo),
    UpdateError { update: UpdateInfo, cause: String },
    Error { cause: String, fatal: bool },
    Done,
}

impl State {
    pub fn id(&self) -> StateId {
        match self {
            State::Init => StateId::Init,
            State::Idle => StateId::Idle,
            State::Authorize => StateId::Authorize,
            State::AuthorizeWait => StateId::AuthorizeWait,
            State::InventoryUpdate => StateId::InventoryUpdate,
            State::CheckWait => StateId::CheckWait,
            State::UpdateCheck => StateId::UpdateCheck,
            State::UpdateFetch(_) => StateId::UpdateFetch,
            State::UpdateStore(_) => StateId::UpdateStore,
            State::UpdateInstall(_) => StateId::UpdateInstall,
            State::Reboot(_) => StateId::Reboot,
            State::AfterReboot(_) => StateId::AfterReboot,
            State::UpdateVerify(_) => StateId::UpdateVerify,
            State::UpdateCommit(_) => StateId::UpdateCommit,
            State::UpdateStatusReport { .. } => StateId::UpdateStatusReport,
            State::Rollback { .. } => StateId::Rollback,
            State::RollbackReboot(_) => StateId::RollbackReboot,
            State::AfterRollbackReboot(_) => StateId::AfterRollbackReboot,
            State::UpdateError { .. } => StateId::UpdateError,
            State::Error { .. } => StateId::Error,
            State::Done => StateId::Done,
        }
    }

    /// Script family of this state.
    pub fn transition(&self) -> TransitionClass {
        match self.id() {
            StateId::Init => TransitionClass::None,
            StateId::Idle => TransitionClass::Idle,
            StateId::Authorize | StateId::AuthorizeWait => TransitionClass::Sync,
            StateId::InventoryUpdate => TransitionClass::Sync,
            StateId::CheckWait => TransitionClass::Idle,
            StateId::UpdateCheck => TransitionClass::Sync,
            StateId::UpdateFetch | StateId::UpdateStore => TransitionClass::Download,
            StateId::UpdateInstall => TransitionClass::ArtifactInstall,
            StateId::Reboot | StateId::AfterReboot => TransitionClass::ArtifactReboot,
            StateId::UpdateVerify | StateId::UpdateCommit => TransitionClass::ArtifactCommit,
            StateId::UpdateStatusReport => TransitionClass::None,
            StateId::Rollback => TransitionClass::ArtifactRollback,
            StateId::RollbackReboot | StateId::AfterRollbackReboot => {
                TransitionClass::ArtifactRollbackReboot
            }
            StateId::UpdateError => TransitionClass::ArtifactFailure,
            StateId::Error => TransitionClass::Error,
            StateId::Done => TransitionClass::None,
        }
    }

    /// The deployment carried through this state, if any.
    pub fn update_info(&self) -> Option<&UpdateInfo> {
        match self {
            State::UpdateFetch(u)
            | State::UpdateStore(u)
            | State::UpdateInstall(u)
            | State::Reboot(u)
            | State::AfterReboot(u)
            | State::UpdateVerify(u)
            | State::UpdateCommit(u)
            | State::RollbackReboot(u)
            | State::AfterRollbackReboot(u) => Some(u),
            State::UpdateStatusReport { update, .. }
            | State::Rollback { update, .. }
            | State::UpdateError { update, .. } => Some(update),
            _ => None,
        }
    }

    /// Reconstruct a state value from its persisted id. Used for the
    /// `from` side of a resumed transition; flag-like payloads take their
    /// conservative defaults.
    pub fn from_id(id: StateId, update: Option<UpdateInfo>) -> State {
        let with_update = |f: fn(UpdateInfo) -> State| match update.clone() {
            Some(u) => f(u),
            None => State::Idle,
        };
        match id {
            StateId::Init => State::Init,
            StateId::Idle => State::Idle,
            StateId::Authorize => State::Authorize,
            StateId::AuthorizeWait => State::AuthorizeWait,
            StateId::InventoryUpdate => State::InventoryUpdate,
            StateId::CheckWait => State::CheckWait,
            StateId::UpdateCheck => State::UpdateCheck,
            StateId::UpdateFetch => with_update(State::UpdateFetch),
            StateId::UpdateStore => with_update(State::UpdateStore),
            StateId::UpdateInstall => with_update(State::UpdateInstall),
            StateId::Reboot => with_update(State::Reboot),
            StateId::AfterReboot => with_update(State::AfterReboot),
            StateId::UpdateVerify => with_update(State::UpdateVerify),
            StateId::UpdateCommit => with_update(State::UpdateCommit),
            StateId::UpdateStatusReport => match update {
                Some(update) => State::UpdateStatusReport {
                    update,
                    success: false,
                },
                None => State::Idle,
            },
            StateId::Rollback => match update {
                Some(update) => State::Rollback {
                    update,
                    do_reboot: false,
                },
                None => State::Idle,
            },
            StateId::RollbackReboot => with_update(State::RollbackReboot),
            StateId::AfterRollbackReboot => with_update(State::AfterRollbackReboot),
            StateId::UpdateError => match update {
                Some(update) => State::UpdateError {
                    update,
                    cause: "recovered".to_string(),
                },
                None => State::Idle,
            },
            StateId::Error => State::Error {
                cause: "recovered".to_string(),
                fatal: false,
            },
            StateId::Done => State::Done,
        }
    }
}

/// Determine where to go when a transition or handler fails.
fn failure_state(to: &State, cause: &AgentError) -> State {
    if cause.is_fatal() {
        return State::Error {
            cause: cause.to_string(),
            fatal: true,
        };
    }
    match to.update_info() {
        Some(update) => match to.id() {
            // Partition already enabled but the device has not rebooted.
            StateId::Reboot => State::Rollback {
                update: update.clone(),
                do_reboot: false,
            },
            // Running on the new image; rolling back needs a reboot.
            StateId::AfterReboot | StateId::UpdateVerify | StateId::UpdateCommit => {
                State::Rollback {
                    update: update.clone(),
                    do_reboot: true,
                }
            }
            // A failure while already failing is fatal.
            StateId::Rollback
            | StateId::RollbackReboot
            | StateId::AfterRollbackReboot
            | StateId::UpdateStatusReport
            | StateId::UpdateError => State::Error {
                cause: cause.to_string(),
                fatal: true,
            },
            _ => State::UpdateError {
                update: update.clone(),
                cause: cause.to_string(),
            },
        },
        None => State::Error {
            cause: cause.to_string(),
            fatal: false,
        },
    }
}

#[derive(Clone, Copy)]
enum HookAction {
    Enter,
    Leave,
}

impl HookAction {
    fn as_str(&self) -> &'static str {
        match self {
            HookAction::Enter => "Enter",
            HookAction::Leave => "Leave",
        }
    }
}

async fn report_state(
    ctrl: &mut dyn Controller,
    update: Option<&UpdateInfo>,
    id: StateId,
    status: UpdateStatus,
) {
    let Some(update) = update else {
        return;
    };
    let data = UpdateStatusData::state(id.name(), status);
    if let Err(e) = ctrl.report_update_status(update, data).await {
        warn!("failed to report {} for {}: {}", id, update.id, e);
    }
}

async fn report_script(
    ctrl: &mut dyn Controller,
    update: Option<&UpdateInfo>,
    id: StateId,
    script_name: &str,
    status: UpdateStatus,
) {
    let Some(update) = update else {
        return;
    };
    let data = UpdateStatusData::script(id.name(), script_name, status);
    if let Err(e) = ctrl.report_update_status(update, data).await {
        warn!("failed to report script status for {}: {}", update.id, e);
    }
}

async fn run_hook(
    ctrl: &mut dyn Controller,
    class: TransitionClass,
    action: HookAction,
    state_id: StateId,
    update: Option<&UpdateInfo>,
) -> Result<(), AgentError> {
    if class == TransitionClass::None {
        return Ok(());
    }
    let executor = ctrl.script_executor();
    let script_name = format!("{}_{}", class.name(), action.as_str());

    report_script(ctrl, update, state_id, &script_name, UpdateStatus::Started).await;
    let result = match action {
        HookAction::Enter => class.enter(executor.as_ref()).await,
        HookAction::Leave => class.leave(executor.as_ref()).await,
    };
    match &result {
        Ok(()) => {
            report_script(ctrl, update, state_id, &script_name, UpdateStatus::Finished).await
        }
        Err(e) => {
            error!("{} scripts failed: {}", script_name, e);
            report_script(ctrl, update, state_id, &script_name, UpdateStatus::Error).await
        }
    }
    result
}

async fn persist_transition(
    ctx: &StateContext,
    from: &State,
    to: &State,
    status: TransitionStatus,
) -> Result<(), AgentError> {
    let data = StateData {
        version: STATE_DATA_VERSION,
        from_state: from.id(),
        to_state: to.id(),
        transition_status: status,
        from_state_data: RebootStateData {
            update_info: from.update_info().cloned(),
        },
        to_state_data: RebootStateData {
            update_info: to.update_info().cloned(),
        },
    };
    save_state_data(&ctx.store, &data).await
}

/// Run one transition: hooks, persistence, then the `to` handler.
/// Returns the completed state, the next state, and a cancellation flag.
pub async fn transition_state(
    ctrl: &mut dyn Controller,
    ctx: &mut StateContext,
    from: &State,
    to: State,
    status: TransitionStatus,
) -> (State, State, bool) {
    let from_class = from.transition();
    let to_class = to.transition();

    debug!(
        "transition {} [{}] -> {} [{}]",
        from.id(),
        from_class.name(),
        to.id(),
        to_class.name()
    );

    if from_class.crosses_boundary(to_class) {
        report_state(ctrl, to.update_info(), to.id(), UpdateStatus::StateEntered).await;

        if status == TransitionStatus::NoStatus {
            if let Err(e) = run_hook(ctrl, from_class, HookAction::Leave, from.id(), to.update_info()).await
            {
                from_class.error(ctrl.script_executor().as_ref()).await;
                let next = failure_state(&to, &e);
                return (to, next, false);
            }
            // Record that Leave already ran before anything else happens, so
            // a reboot here does not repeat it.
            if let Err(e) = persist_transition(ctx, from, &to, TransitionStatus::LeaveDone).await {
                let next = State::Error {
                    cause: format!("failed to persist state data: {}", e),
                    fatal: true,
                };
                return (to, next, false);
            }
        }

        if let Err(e) = run_hook(ctrl, to_class, HookAction::Enter, to.id(), to.update_info()).await {
            to_class.error(ctrl.script_executor().as_ref()).await;
            let next = failure_state(&to, &e);
            return (to, next, false);
        }
    }

    let (next, cancelled) = handle(ctrl, ctx, &to).await;

    if !cancelled && to_class != next.transition() {
        report_state(ctrl, to.update_info(), to.id(), UpdateStatus::StateFinished).await;
    }

    match next.id() {
        StateId::Idle | StateId::Done => {
            if let Err(e) = remove_state_data(&ctx.store).await {
                warn!("failed to remove state data: {}", e);
            }
        }
        _ => {
            if let Err(e) = persist_transition(ctx, &to, &next, TransitionStatus::NoStatus).await {
                let next = State::Error {
                    cause: format!("failed to persist state data: {}", e),
                    fatal: true,
                };
                return (to, next, false);
            }
        }
    }

    (to, next, cancelled)
}

/// Execute the inner work of `state` and pick the successor.
async fn handle(
    ctrl: &mut dyn Controller,
    ctx: &mut StateContext,
    state: &State,
) -> (State, bool) {
    match state {
        State::Init => (State::Idle, false),

        State::Idle => {
            if let Err(e) = remove_state_data(&ctx.store).await {
                warn!("failed to remove state data: {}", e);
            }
            if ctx.stopped() {
                return (State::Done, false);
            }
            if ctrl.is_authorized() {
                (State::CheckWait, false)
            } else {
                (State::Authorize, false)
            }
        }

        State::Authorize => match ctrl.authorize().await {
            Ok(()) => (State::CheckWait, false),
            Err(e) => {
                warn!("authorization failed: {}", e);
                (State::AuthorizeWait, false)
            }
        },

        State::AuthorizeWait => {
            if ctx.wait(ctrl.retry_poll_interval()).await {
                (State::Authorize, false)
            } else {
                (State::AuthorizeWait, true)
            }
        }

        State::InventoryUpdate => {
            // Inventory trouble never blocks updates.
            if let Err(e) = ctrl.submit_inventory().await {
                warn!("failed to submit inventory: {}", e);
            } else {
                ctx.last_inventory_update = Some(std::time::Instant::now());
            }
            (State::UpdateCheck, false)
        }

        State::CheckWait => {
            if !ctx.wait(ctrl.update_poll_interval()).await {
                return (State::CheckWait, true);
            }
            let inventory_due = ctx
                .last_inventory_update
                .map(|at| at.elapsed() >= ctrl.inventory_poll_interval())
                .unwrap_or(true);
            if inventory_due {
                (State::InventoryUpdate, false)
            } else {
                (State::UpdateCheck, false)
            }
        }

        State::UpdateCheck => match ctrl.check_update().await {
            Ok(Some(update)) => (State::UpdateFetch(update), false),
            Ok(None) => (State::CheckWait, false),
            Err(e) => {
                warn!("update check failed: {}", e);
                (State::CheckWait, false)
            }
        },

        State::UpdateFetch(update) => {
            // Fetch and store share the Download class; the streaming work
            // happens in UpdateStore so the reader never crosses a persisted
            // boundary.
            (State::UpdateStore(update.clone()), false)
        }

        State::UpdateStore(update) => {
            if let Err(e) = ctx.deployment_log.enable(&update.id).await {
                warn!("failed to enable deployment log: {}", e);
            }
            ctx.deployment_log
                .log("info", format!("fetching artifact {}", update.artifact_name()))
                .await;

            let fetched = ctrl.fetch_update(update).await;
            let (image, size) = match fetched {
                Ok(fetched) => fetched,
                Err(e) => {
                    error!("failed to fetch update: {}", e);
                    return (failure_state(state, &e), false);
                }
            };

            ctx.deployment_log
                .log("info", "writing artifact to inactive partition")
                .await;
            match ctrl.install_update(image, size).await {
                Ok(()) => (State::UpdateInstall(update.clone()), false),
                Err(e) => {
                    error!("failed to store update: {}", e);
                    (failure_state(state, &e), false)
                }
            }
        }

        State::UpdateInstall(update) => match ctrl.enable_updated_partition().await {
            Ok(()) => (State::Reboot(update.clone()), false),
            Err(e) => {
                error!("failed to enable updated partition: {}", e);
                (failure_state(state, &e), false)
            }
        },

        State::Reboot(update) => {
            ctx.deployment_log
                .log("info", "rebooting into the new image")
                .await;
            match ctrl.reboot().await {
                // Only test doubles return from a successful reboot; on
                // hardware the persisted cursor resumes us at AfterReboot.
                Ok(()) => (State::AfterReboot(update.clone()), false),
                Err(e) => {
                    error!("reboot failed: {}", e);
                    (failure_state(state, &e), false)
                }
            }
        }

        State::AfterReboot(update) => match ctrl.has_unconfirmed_update().await {
            Ok(true) => (State::UpdateVerify(update.clone()), false),
            Ok(false) => {
                // The bootloader fell back to the old partition.
                warn!("new image did not boot, rolling back");
                (
                    State::Rollback {
                        update: update.clone(),
                        do_reboot: false,
                    },
                    false,
                )
            }
            Err(e) => (failure_state(state, &e), false),
        },

        State::UpdateVerify(update) => match ctrl.verify_update(update).await {
            Ok(()) => (State::UpdateCommit(update.clone()), false),
            Err(e) => {
                error!("update verification failed: {}", e);
                ctx.deployment_log
                    .log("error", format!("verification failed: {}", e))
                    .await;
                (
                    State::Rollback {
                        update: update.clone(),
                        do_reboot: true,
                    },
                    false,
                )
            }
        },

        State::UpdateCommit(update) => match ctrl.commit_update().await {
            Ok(()) => (
                State::UpdateStatusReport {
                    update: update.clone(),
                    success: true,
                },
                false,
            ),
            Err(e) => {
                error!("commit failed: {}", e);
                (
                    State::Rollback {
                        update: update.clone(),
                        do_reboot: true,
                    },
                    false,
                )
            }
        },

        State::Rollback { update, do_reboot } => {
            info!("rolling back deployment {}", update.id);
            ctx.deployment_log
                .log("error", "rolling back to the previous partition")
                .await;
            match ctrl.swap_partitions().await {
                Ok(()) => {
                    if *do_reboot {
                        (State::RollbackReboot(update.clone()), false)
                    } else {
                        (
                            State::UpdateStatusReport {
                                update: update.clone(),
                                success: false,
                            },
                            false,
                        )
                    }
                }
                Err(e) => (
                    State::Error {
                        cause: format!("rollback failed: {}", e),
                        fatal: true,
                    },
                    false,
                ),
            }
        }

        State::RollbackReboot(update) => match ctrl.reboot().await {
            Ok(()) => (State::AfterRollbackReboot(update.clone()), false),
            Err(e) => {
                error!("rollback reboot failed: {}", e);
                (
                    State::UpdateStatusReport {
                        update: update.clone(),
                        success: false,
                    },
                    false,
                )
            }
        },

        State::AfterRollbackReboot(update) => (
            State::UpdateStatusReport {
                update: update.clone(),
                success: false,
            },
            false,
        ),

        State::UpdateStatusReport { update, success } => {
            if !*success {
                match ctx.deployment_log.messages().await {
                    Ok(messages) if !messages.is_empty() => {
                        if let Err(e) = ctrl.upload_log(update, &messages).await {
                            error!("failed to upload deployment log: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!("failed to read deployment log: {}", e),
                }
            }

            let final_state = if *success { "success" } else { "failure" };
            let data = UpdateStatusData::state(final_state, UpdateStatus::StateFinished);
            if let Err(e) = ctrl.report_update_status(update, data).await {
                error!("failed to report final deployment status: {}", e);
            }

            ctx.deployment_log.release().await;
            (State::Idle, false)
        }

        State::UpdateError { update, cause } => {
            ctx.deployment_log
                .log("error", format!("deployment failed: {}", cause))
                .await;
            (
                State::UpdateStatusReport {
                    update: update.clone(),
                    success: false,
                },
                false,
            )
        }

        State::Error { cause, fatal } => {
            if *fatal {
                (
                    State::Error {
                        cause: cause.clone(),
                        fatal: true,
                    },
                    true,
                )
            } else {
                error!("recovering from error: {}", cause);
                (State::Idle, false)
            }
        }

        State::Done => (State::Done, true),
    }
}

/// Determine the pending transition at startup: fresh start or crash
/// recovery from the persisted cursor.
pub async fn load_current(
    ctrl: &mut dyn Controller,
    ctx: &mut StateContext,
) -> Result<(State, State, TransitionStatus), AgentError> {
    ctrl.script_executor()
        .check_rootfs_scripts_version()
        .await
        .map_err(|e| AgentError::FatalError(e.to_string()))?;

    let data = match load_state_data(&ctx.store).await {
        Ok(data) => data,
        Err(AgentError::NotFound(_)) => {
            return Ok((State::Init, State::Idle, TransitionStatus::NoStatus))
        }
        Err(e) => return Err(e),
    };

    let update = data
        .to_state_data
        .update_info
        .clone()
        .or_else(|| data.from_state_data.update_info.clone());

    let resumed = resume_state(ctrl, &data, update.clone()).await?;
    if let Some(update) = resumed.update_info() {
        if let Err(e) = ctx.deployment_log.enable(&update.id).await {
            warn!("failed to re-enable deployment log: {}", e);
        }
    }

    let from = State::from_id(data.from_state, data.from_state_data.update_info.clone());
    info!(
        "resuming at {} -> {} ({:?})",
        from.id(),
        resumed.id(),
        data.transition_status
    );
    Ok((from, resumed, data.transition_status))
}

async fn resume_state(
    ctrl: &mut dyn Controller,
    data: &StateData,
    update: Option<UpdateInfo>,
) -> Result<State, AgentError> {
    let state = match data.to_state {
        StateId::UpdateFetch | StateId::UpdateStore | StateId::UpdateInstall => match update {
            // The partition may already be enabled; re-downloading then
            // would overwrite whichever image we are running from.
            Some(update) => {
                if ctrl.has_unconfirmed_update().await? {
                    State::AfterReboot(update)
                } else {
                    State::UpdateFetch(update)
                }
            }
            None => State::Idle,
        },
        StateId::Reboot
        | StateId::AfterReboot
        | StateId::UpdateVerify
        | StateId::UpdateCommit => match update {
            Some(update) => State::AfterReboot(update),
            None => State::Idle,
        },
        StateId::Rollback | StateId::RollbackReboot | StateId::AfterRollbackReboot => {
            match update {
                Some(update) => State::Rollback {
                    update,
                    do_reboot: false,
                },
                None => State::Idle,
            }
        }
        StateId::UpdateStatusReport | StateId::UpdateError => match update {
            Some(update) => State::UpdateStatusReport {
                update,
                success: false,
            },
            None => State::Idle,
        },
        _ => State::Idle,
    };
    Ok(state)
}

/// Drive the machine until `Done`, cancellation, a stop request, or a fatal
/// error.
pub async fn run(
    ctrl: &mut dyn Controller,
    ctx: &mut StateContext,
) -> Result<(), AgentError> {
    let (mut from, mut to, mut status) = load_current(ctrl, ctx).await?;

    loop {
        let (completed, next, cancelled) = transition_state(ctrl, ctx, &from, to, status).await;
        status = TransitionStatus::NoStatus;
        info!("state: {}", next.id());

        if let State::Error { cause, fatal: true } = &next {
            return Err(AgentError::FatalError(cause.clone()));
        }
        if cancelled || next.id() == StateId::Done {
            return Ok(());
        }
        if ctx.stopped() {
            return Ok(());
        }

        from = completed;
        to = next;
    }
}
