use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sdb_config::{AgentConfig, DebuggerConfig, LaunchConfig, LaunchMode};

use crate::project::{find_project_root, ProjectHandle, ProjectLocator, PROJECT_FILE};
use crate::{LaunchError, Result};

/// Read by the Godot Mono runtime at startup to configure its debug agent.
pub const AGENT_ENV_VAR: &str = "GODOT_MONO_DEBUGGER_AGENT";

/// Everything needed to start (or reach) a debuggable game.
///
/// Built by [`LaunchResolver::resolve`] and not mutated afterwards, except to
/// swap in the port a launch-mode listener actually bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    executable_path: Option<PathBuf>,
    working_directory: PathBuf,
    arguments: Vec<String>,
    environment: Vec<(String, String)>,
    debug_agent_address: SocketAddr,
    mode: LaunchMode,
    suspend_on_start: bool,
}

impl LaunchTarget {
    /// `None` in attach mode, where the game is already running.
    pub fn executable_path(&self) -> Option<&Path> {
        self.executable_path.as_deref()
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn environment(&self) -> &[(String, String)] {
        &self.environment
    }

    pub fn debug_agent_address(&self) -> SocketAddr {
        self.debug_agent_address
    }

    pub fn mode(&self) -> LaunchMode {
        self.mode
    }

    pub fn suspend_on_start(&self) -> bool {
        self.suspend_on_start
    }

    /// The `--debugger-agent` option handed to the Mono runtime.
    ///
    /// The agent is always the connecting side (`server=n`): in launch mode we
    /// listen on `debug_agent_address` before the game starts.
    pub fn agent_option(&self) -> String {
        agent_option(self.debug_agent_address, self.suspend_on_start)
    }

    /// Rebind the target to the address a listener actually bound.
    pub fn with_agent_address(mut self, addr: SocketAddr) -> Self {
        self.debug_agent_address = addr;
        self.environment = build_environment(self.mode, addr, self.suspend_on_start);
        self
    }

    /// Human readable command line, for logs and error messages.
    pub fn display_command(&self) -> String {
        let mut out = self
            .executable_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<attach>".to_owned());
        for arg in &self.arguments {
            out.push(' ');
            if arg.contains(char::is_whitespace) {
                out.push_str(&format!("{arg:?}"));
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

fn agent_option(addr: SocketAddr, suspend: bool) -> String {
    format!(
        "--debugger-agent=transport=dt_socket,address={addr},server=n,suspend={}",
        if suspend { "y" } else { "n" }
    )
}

fn build_environment(mode: LaunchMode, addr: SocketAddr, suspend: bool) -> Vec<(String, String)> {
    match mode {
        LaunchMode::Launch => vec![(AGENT_ENV_VAR.to_owned(), agent_option(addr, suspend))],
        LaunchMode::Attach => Vec::new(),
    }
}

/// Resolves project handles into launch targets using the configured policy.
pub struct LaunchResolver {
    locator: Arc<dyn ProjectLocator>,
    launch: LaunchConfig,
    agent: AgentConfig,
}

impl std::fmt::Debug for LaunchResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchResolver")
            .field("launch", &self.launch)
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

impl LaunchResolver {
    pub fn new(locator: Arc<dyn ProjectLocator>, config: &DebuggerConfig) -> Self {
        Self {
            locator,
            launch: config.launch.clone(),
            agent: config.agent.clone(),
        }
    }

    pub fn mode(&self) -> LaunchMode {
        self.launch.mode
    }

    /// Locate the project and build its launch target.
    ///
    /// Nothing is spawned and no connection is attempted here, so a failure
    /// leaves no side effects behind.
    pub fn resolve(&self, handle: &ProjectHandle) -> Result<LaunchTarget> {
        let dir = self.locator.locate(handle).ok_or_else(|| {
            LaunchError::ProjectResolution(format!("no directory known for project `{handle}`"))
        })?;
        let root = find_project_root(&dir).ok_or_else(|| {
            LaunchError::ProjectResolution(format!(
                "no {PROJECT_FILE} found in {} or its parents",
                dir.display()
            ))
        })?;

        let addr = self
            .agent
            .socket_addr()
            .map_err(|err| LaunchError::ProjectResolution(err.to_string()))?;

        let executable_path = match self.launch.mode {
            LaunchMode::Launch => Some(self.godot_executable()?),
            LaunchMode::Attach => {
                if addr.port() == 0 {
                    return Err(LaunchError::NoDebugAgentConfigured);
                }
                None
            }
        };

        let mut arguments = vec!["--path".to_owned(), root.display().to_string()];
        arguments.extend(self.launch.extra_args.iter().cloned());

        let target = LaunchTarget {
            executable_path,
            environment: build_environment(self.launch.mode, addr, self.launch.suspend_on_start),
            working_directory: root,
            arguments,
            debug_agent_address: addr,
            mode: self.launch.mode,
            suspend_on_start: self.launch.suspend_on_start,
        };
        tracing::debug!(
            target: "sdb.launch",
            project = %handle,
            mode = ?target.mode,
            command = %target.display_command(),
            "resolved launch target"
        );
        Ok(target)
    }

    fn godot_executable(&self) -> Result<PathBuf> {
        let configured = self.launch.godot_executable.as_deref().ok_or_else(|| {
            LaunchError::ProjectResolution(
                "no Godot executable configured (set launch.godot_executable)".to_owned(),
            )
        })?;
        find_executable(configured).ok_or_else(|| {
            LaunchError::ProjectResolution(format!(
                "Godot executable {} is not runnable",
                configured.display()
            ))
        })
    }
}

/// Resolve a configured executable: paths are checked as given, bare names
/// are looked up on `PATH`.
fn find_executable(configured: &Path) -> Option<PathBuf> {
    if configured.components().count() > 1 || configured.is_absolute() {
        return is_runnable(configured).then(|| configured.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(configured))
        .find(|candidate| is_runnable(candidate))
}

fn is_runnable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
