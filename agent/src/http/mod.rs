//! Backend HTTP API

pub mod client;
pub mod deployments;
pub mod inventory;
pub mod logs;
pub mod status;
