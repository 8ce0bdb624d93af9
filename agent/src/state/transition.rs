//! Transition classes and hook invocation
//!
//! Every state belongs to a transition class; the class name locates the
//! state scripts (`<Class>_Enter_NN`, `<Class>_Leave_NN`, `<Class>_Error_NN`).
//! Adjacent states sharing a class cross no script boundary.

use tracing::error;

use crate::errors::AgentError;
use crate::scripts::ScriptExecutor;

/// Script family of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionClass {
    None,
    Idle,
    Sync,
    Download,
    ArtifactInstall,
    ArtifactReboot,
    ArtifactCommit,
    ArtifactRollback,
    ArtifactRollbackReboot,
    ArtifactFailure,
    Error,
}

impl TransitionClass {
    /// Script family name; empty for `None`.
    pub fn name(&self) -> &'static str {
        match self {
            TransitionClass::None => "",
            TransitionClass::Idle => "Idle",
            TransitionClass::Sync => "Sync",
            TransitionClass::Download => "Download",
            TransitionClass::ArtifactInstall => "ArtifactInstall",
            TransitionClass::ArtifactReboot => "ArtifactReboot",
            TransitionClass::ArtifactCommit => "ArtifactCommit",
            TransitionClass::ArtifactRollback => "ArtifactRollback",
            TransitionClass::ArtifactRollbackReboot => "ArtifactRollbackReboot",
            TransitionClass::ArtifactFailure => "ArtifactFailure",
            TransitionClass::Error => "Error",
        }
    }

    /// Idle hooks never abort the machine.
    fn ignore_error(&self) -> bool {
        matches!(self, TransitionClass::Idle)
    }

    /// Run this class's `Enter` scripts.
    pub async fn enter(&self, executor: &dyn ScriptExecutor) -> Result<(), AgentError> {
        self.run(executor, "Enter").await
    }

    /// Run this class's `Leave` scripts.
    pub async fn leave(&self, executor: &dyn ScriptExecutor) -> Result<(), AgentError> {
        self.run(executor, "Leave").await
    }

    /// Run this class's `Error` scripts. Failures are logged, never
    /// propagated.
    pub async fn error(&self, executor: &dyn ScriptExecutor) {
        if *self == TransitionClass::None {
            return;
        }
        if let Err(e) = executor.execute_all(self.name(), "Error", true).await {
            error!("error scripts for {} failed: {}", self.name(), e);
        }
    }

    async fn run(&self, executor: &dyn ScriptExecutor, action: &str) -> Result<(), AgentError> {
        if *self == TransitionClass::None {
            return Ok(());
        }
        executor
            .execute_all(self.name(), action, self.ignore_error())
            .await
    }

    /// Whether crossing from `self` into `target` runs any hooks. Internal
    /// hops inside one class and transitions into `None` are silent.
    pub fn crosses_boundary(&self, target: TransitionClass) -> bool {
        *self != target && target != TransitionClass::None
    }
}
