//! Application wiring for the CLI binary.

pub(crate) mod context;
pub(crate) mod progress_manager;
pub(crate) mod terminal;

pub(crate) use context::AppContext;
