//! Update Agent Library
//!
//! Core modules for the A/B rootfs update agent.

pub mod app;
pub mod bootenv;
pub mod deploylog;
pub mod device;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod installer;
pub mod logs;
pub mod models;
pub mod scripts;
pub mod state;
pub mod storage;
pub mod utils;
