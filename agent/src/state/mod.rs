//! Update lifecycle state machine

pub mod controller;
pub mod data;
pub mod machine;
pub mod transition;

pub use controller::Controller;
pub use data::{StateData, StateId, TransitionStatus};
pub use machine::{State, StateContext};
pub use transition::TransitionClass;
