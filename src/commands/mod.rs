//! CLI command handlers.

mod queue;
mod run;

pub use queue::{
    run_cancel_command, run_clear_command, run_list_command, run_pause_command,
    run_remove_command, run_resume_command, run_retry_command, run_submit_command,
};
pub use run::run_queue_command;
