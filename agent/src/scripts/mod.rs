//! State-script discovery and execution

pub mod executor;

pub use executor::{Launcher, ScriptExecutor, ScriptsConfig};
