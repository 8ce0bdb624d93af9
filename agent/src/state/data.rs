//! Persisted state-machine cursor

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::models::update::UpdateInfo;
use crate::storage::store::Store;

/// Current `StateData` schema version.
pub const STATE_DATA_VERSION: i32 = 1;

/// Store key holding the serialized [`StateData`].
pub const STATE_DATA_KEY: &str = "state";

/// Identifier of every state in the update lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateId {
    Init,
    Idle,
    Authorize,
    AuthorizeWait,
    InventoryUpdate,
    CheckWait,
    UpdateCheck,
    UpdateFetch,
    UpdateStore,
    UpdateInstall,
    Reboot,
    AfterReboot,
    UpdateVerify,
    UpdateCommit,
    UpdateStatusReport,
    Rollback,
    RollbackReboot,
    AfterRollbackReboot,
    Error,
    UpdateError,
    Done,
}

impl StateId {
    /// Stable name used in logs and status reports.
    pub fn name(&self) -> &'static str {
        match self {
            StateId::Init => "Init",
            StateId::Idle => "Idle",
            StateId::Authorize => "Authorize",
            StateId::AuthorizeWait => "AuthorizeWait",
            StateId::InventoryUpdate => "InventoryUpdate",
            StateId::CheckWait => "CheckWait",
            StateId::UpdateCheck => "UpdateCheck",
            StateId::UpdateFetch => "UpdateFetch",
            StateId::UpdateStore => "UpdateStore",
            StateId::UpdateInstall => "UpdateInstall",
            StateId::Reboot => "Reboot",
            StateId::AfterReboot => "AfterReboot",
            StateId::UpdateVerify => "UpdateVerify",
            StateId::UpdateCommit => "UpdateCommit",
            StateId::UpdateStatusReport => "UpdateStatusReport",
            StateId::Rollback => "Rollback",
            StateId::RollbackReboot => "RollbackReboot",
            StateId::AfterRollbackReboot => "AfterRollbackReboot",
            StateId::Error => "Error",
            StateId::UpdateError => "UpdateError",
            StateId::Done => "Done",
        }
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Records whether the outgoing state's `Leave` hook already ran when a
/// reboot interrupts a transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionStatus {
    #[default]
    NoStatus,
    LeaveDone,
}

/// Per-side payload that must survive a reboot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebootStateData {
    #[serde(default)]
    pub update_info: Option<UpdateInfo>,
}

/// The persisted cursor: written atomically before each observable step and
/// read back at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    pub version: i32,
    pub from_state: StateId,
    pub to_state: StateId,
    pub transition_status: TransitionStatus,
    #[serde(default)]
    pub from_state_data: RebootStateData,
    #[serde(default)]
    pub to_state_data: RebootStateData,
}

/// Load the persisted cursor. A missing key surfaces as `NotFound`;
/// anything unreadable or from a future schema is fatal.
pub async fn load_state_data(store: &Store) -> Result<StateData, AgentError> {
    let data = match store.get::<StateData>(STATE_DATA_KEY).await {
        Ok(data) => data,
        Err(AgentError::NotFound(key)) => return Err(AgentError::NotFound(key)),
        Err(e) => return Err(AgentError::FatalError(format!("corrupt state data: {}", e))),
    };
    if data.version != STATE_DATA_VERSION {
        return Err(AgentError::FatalError(format!(
            "unsupported state data version: {}",
            data.version
        )));
    }
    Ok(data)
}

/// Persist the cursor atomically.
pub async fn save_state_data(store: &Store, data: &StateData) -> Result<(), AgentError> {
    if data.version != STATE_DATA_VERSION {
        return Err(AgentError::FatalError(format!(
            "refusing to write state data version {}",
            data.version
        )));
    }
    store.update(STATE_DATA_KEY, data).await
}

/// Remove the cursor; the machine is back at `Idle`.
pub async fn remove_state_data(store: &Store) -> Result<(), AgentError> {
    store.remove(STATE_DATA_KEY).await
}
