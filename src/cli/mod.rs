//! Command-line interface for qa-forge.
//!
//! Provides the `run` command for the generation pipeline and a `doctor`
//! command that checks configuration and model servers.

mod commands;

pub use commands::{
    check_config_sections, check_directories, check_inputs, check_model_servers, parse_cli, run,
    run_with_cli, Cli, Commands, DoctorCheck, DoctorReport, DoctorArgs, RunArgs,
};
