//! CLI command implementations

mod provision;
mod tunnel;

pub use provision::{
    config_init, config_show, destroy_command, provision_command, resolve_mode, ModeSelection,
    Overrides,
};
pub use tunnel::{
    browser_command, logs_command, multiple_command, restart_command, start_command,
    status_command, stop_command, test_command,
};
