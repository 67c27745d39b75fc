use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sdb_config::{DebuggerConfig, LaunchMode};
use sdb_launch::PathLocator;
use sdb_session::{
    Ack, BreakpointHandle, Debugger, Notification, ProjectHandle, SessionHandle, SourceLocation,
    TerminationReason,
};
use tokio::io::{AsyncBufReadExt, BufReader};

mod commands;
mod render;

use commands::Command;

/// Debug a Godot Mono game from the terminal.
///
/// Launches the game with the soft-debugger agent enabled (or attaches to one
/// that is already listening) and reads debugger commands from stdin.
#[derive(Debug, Parser)]
#[command(name = "godot-sdb", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// Overrides `.godot-sdb.toml` discovery in the project directory.
    #[arg(long, env = "GODOT_SDB_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Start a debug session and read commands from stdin.
    Launch(LaunchArgs),
    /// Print the effective configuration for a project as TOML.
    Config {
        #[arg(default_value = ".")]
        project: PathBuf,
    },
}

#[derive(Debug, Args)]
struct LaunchArgs {
    /// Project directory, or any path inside it.
    #[arg(default_value = ".")]
    project: PathBuf,

    /// Connect to an agent that is already listening instead of spawning the game.
    #[arg(long)]
    attach: bool,

    /// Debug agent port.
    #[arg(long)]
    port: Option<u16>,

    /// Godot executable to launch.
    #[arg(long, value_name = "PATH")]
    godot: Option<PathBuf>,

    /// Breakpoint to set before the game starts (FILE:LINE or TYPE::METHOD).
    #[arg(long = "break", short = 'b', value_name = "LOCATION")]
    breakpoints: Vec<SourceLocation>,

    /// Let the game run without waiting for the debugger.
    #[arg(long)]
    no_suspend: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::Config { project } => {
            let (config, _) = load_config(cli.config.as_deref(), &project)?;
            print!("{}", toml::to_string(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Launch(args) => {
            let (mut config, project_dir) = load_config(cli.config.as_deref(), &args.project)?;
            args.apply(&mut config);
            config.validate().context("invalid configuration")?;
            sdb_config::init_tracing(&config.logging);

            let reason = launch(config, &project_dir, args.breakpoints).await?;
            println!("{reason}");
            Ok(if ended_cleanly(&reason) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

impl LaunchArgs {
    fn apply(&self, config: &mut DebuggerConfig) {
        if self.attach {
            config.launch.mode = LaunchMode::Attach;
        }
        if let Some(port) = self.port {
            config.agent.port = port;
        }
        if let Some(godot) = &self.godot {
            config.launch.godot_executable = Some(godot.clone());
        }
        if self.no_suspend {
            config.launch.suspend_on_start = false;
        }
    }
}

/// Returns the config together with the project root it applies to.
fn load_config(explicit: Option<&Path>, project: &Path) -> anyhow::Result<(DebuggerConfig, PathBuf)> {
    let project_dir = sdb_launch::find_project_root(project).with_context(|| {
        format!("no project.godot found at or above {}", project.display())
    })?;
    let config = match explicit {
        Some(path) => DebuggerConfig::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => sdb_config::load_for_project(&project_dir)?.0,
    };
    Ok((config, project_dir))
}

async fn launch(
    config: DebuggerConfig,
    project_dir: &Path,
    initial_breakpoints: Vec<SourceLocation>,
) -> anyhow::Result<TerminationReason> {
    let sink = |notification: Notification| {
        if let Some(line) = render::notification(&notification) {
            println!("{line}");
        }
    };
    let debugger = Debugger::new(Arc::new(PathLocator), Arc::new(sink), config)
        .context("failed to start the notification thread")?;
    let session = debugger
        .start_debug_launch(&ProjectHandle::from(project_dir))
        .await?;

    let mut numbers = BTreeMap::new();
    for location in initial_breakpoints {
        let handle = session.set_breakpoint(location, None).await?;
        numbers.insert(handle.get(), handle);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let reason = loop {
        tokio::select! {
            reason = session.wait_terminated() => break reason,
            _ = tokio::signal::ctrl_c() => break session.detach().await,
            line = lines.next_line() => match line.context("failed to read stdin")? {
                // Closing stdin leaves the game running.
                None => break session.detach().await,
                Some(line) => {
                    if let Err(message) = run_command(&session, &line, &mut numbers).await {
                        eprintln!("error: {message}");
                    }
                }
            },
        }
    };
    Ok(reason)
}

async fn run_command(
    session: &SessionHandle,
    line: &str,
    numbers: &mut BTreeMap<u64, BreakpointHandle>,
) -> Result<(), String> {
    let Some(command) = commands::parse(line)? else {
        return Ok(());
    };
    match command {
        Command::Intent(intent) => match session.send(intent).await.map_err(|err| err.to_string())? {
            Ack::Value(value) => println!("{value}"),
            Ack::Sent | Ack::Ignored => {}
        },
        Command::Break(location) => {
            let handle = session
                .set_breakpoint(location.clone(), None)
                .await
                .map_err(|err| err.to_string())?;
            println!("breakpoint {handle} at {location}");
            numbers.insert(handle.get(), handle);
        }
        Command::Delete(number) => {
            let handle = lookup(numbers, number)?;
            session
                .remove_breakpoint(handle)
                .await
                .map_err(|err| err.to_string())?;
            numbers.remove(&number);
        }
        Command::Enable { number, enabled } => {
            let handle = lookup(numbers, number)?;
            session
                .set_breakpoint_enabled(handle, enabled)
                .await
                .map_err(|err| err.to_string())?;
        }
        Command::Info => {
            let snapshot = session.snapshot().await.map_err(|err| err.to_string())?;
            print!("{}", render::snapshot(&snapshot));
        }
        Command::Help => println!("{}", commands::HELP),
    }
    Ok(())
}

fn lookup(numbers: &BTreeMap<u64, BreakpointHandle>, number: u64) -> Result<BreakpointHandle, String> {
    numbers
        .get(&number)
        .copied()
        .ok_or_else(|| format!("no breakpoint #{number}"))
}

fn ended_cleanly(reason: &TerminationReason) -> bool {
    matches!(
        reason,
        TerminationReason::Detached
            | TerminationReason::Terminated
            | TerminationReason::TargetExited { exit_code: Some(0) }
    )
}
