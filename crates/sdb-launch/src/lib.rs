//! Turns a host-supplied project handle into a debuggable Godot process.
//!
//! [`LaunchResolver`] maps a [`ProjectHandle`] to a [`LaunchTarget`]: the
//! executable, its arguments, and the `GODOT_MONO_DEBUGGER_AGENT` variable that
//! tells the Mono runtime where its debug agent should connect. The
//! [`process`] module then starts that target and forwards its output.

use sdb_wire::WireError;
use thiserror::Error;

pub mod process;
mod project;
mod resolver;

pub use process::{spawn_target, OutputLine, OutputStream, TargetProcess};
pub use project::{find_project_root, PathLocator, ProjectHandle, ProjectLocator, PROJECT_FILE};
pub use resolver::{LaunchResolver, LaunchTarget, AGENT_ENV_VAR};

pub use sdb_config::LaunchMode;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to resolve project: {0}")]
    ProjectResolution(String),

    #[error("no debug agent port configured for attach mode")]
    NoDebugAgentConfigured,

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Wire(#[from] WireError),
}

pub type Result<T, E = LaunchError> = std::result::Result<T, E>;
