//! Binary-side wiring: process context, command handlers, progress display.

pub(crate) mod command_dispatcher;
pub(crate) mod exit_handler;
pub(crate) mod progress_manager;
pub(crate) mod runtime;
