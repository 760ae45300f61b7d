//! Application-level orchestration.
//!
//! The controller owns the session machine on the interactive context. UI/CLI layers send it
//! commands and receive notices, keeping presentation separate from session logic.

mod controller;

pub(crate) use controller::{run_controller, UiCommand};
