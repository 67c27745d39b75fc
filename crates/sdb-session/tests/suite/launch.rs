use std::path::{Path, PathBuf};
use std::sync::Arc;

use sdb_config::{DebuggerConfig, LaunchMode};
use sdb_session::{
    Debugger, LaunchError, Notification, ProjectHandle, SessionState, SourceLocation,
    TerminationReason,
};
use tokio::sync::mpsc;

use super::support::{godot_project, TIMEOUT};

#[tokio::test]
async fn unknown_project_is_rejected_before_connecting() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
    let locator = Arc::new(|_: &ProjectHandle| None::<PathBuf>);
    let debugger = Debugger::new(locator, Arc::new(tx), DebuggerConfig::default()).unwrap();

    let err = debugger
        .start_debug_launch(&ProjectHandle::new("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::ProjectResolution(_)), "{err:?}");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn attach_without_port_is_not_configured() {
    let dir = tempfile::tempdir().unwrap();
    let project = godot_project(dir.path());
    let (tx, _rx) = mpsc::unbounded_channel::<Notification>();
    let mut config = DebuggerConfig::default();
    config.launch.mode = LaunchMode::Attach;
    config.agent.port = 0;
    let debugger = Debugger::new(
        Arc::new(sdb_launch::PathLocator),
        Arc::new(tx),
        config,
    )
    .unwrap();

    let err = debugger
        .start_debug_launch(&ProjectHandle::from(project.as_path()))
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::NoDebugAgentConfigured), "{err:?}");
}

#[cfg(unix)]
fn fake_godot(dir: &Path, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let exe = dir.join("godot-mono");
    std::fs::write(&exe, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
    exe
}

#[cfg(unix)]
fn launch_debugger(dir: &Path, script: &str) -> (Debugger, ProjectHandle, mpsc::UnboundedReceiver<Notification>) {
    let project = godot_project(dir);
    let (tx, rx) = mpsc::unbounded_channel();
    let mut config = DebuggerConfig::default();
    config.launch.godot_executable = Some(fake_godot(dir, script));
    config.agent.port = 0;
    let debugger = Debugger::new(Arc::new(sdb_launch::PathLocator), Arc::new(tx), config).unwrap();
    (debugger, ProjectHandle::from(project.as_path()), rx)
}

#[cfg(unix)]
async fn next(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    mut pred: impl FnMut(&Notification) -> bool,
) -> Notification {
    let wait = async {
        loop {
            let notification = rx.recv().await.expect("notification channel closed");
            if pred(&notification) {
                return notification;
            }
        }
    };
    tokio::time::timeout(TIMEOUT, wait).await.unwrap()
}

#[cfg(unix)]
#[tokio::test]
async fn launched_game_connects_back_and_hits_startup_breakpoint() {
    use sdb_session::OutputSource;
    use sdb_wire::mock::{MockAgent, MockAgentConfig};

    let dir = tempfile::tempdir().unwrap();
    let (debugger, project, mut rx) = launch_debugger(
        dir.path(),
        "echo \"$GODOT_MONO_DEBUGGER_AGENT\"\necho 'loading assemblies' >&2\nexec sleep 30",
    );
    let session = debugger.start_debug_launch(&project).await.unwrap();

    // Nothing has connected yet, so this breakpoint waits for setup.
    let handle = session
        .set_breakpoint(SourceLocation::line("Main.cs", 12), None)
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Connecting);

    let mut agent_option = None;
    let mut saw_stderr = false;
    while agent_option.is_none() || !saw_stderr {
        match next(&mut rx, |n| matches!(n, Notification::OutputLine { .. })).await {
            Notification::OutputLine {
                source: OutputSource::Stdout,
                line,
                ..
            } => agent_option = Some(line),
            Notification::OutputLine {
                source: OutputSource::Stderr,
                line,
                ..
            } => {
                assert_eq!(line, "loading assemblies");
                saw_stderr = true;
            }
            other => unreachable!("{other:?}"),
        }
    }
    let agent_option = agent_option.unwrap();
    assert!(agent_option.starts_with("--debugger-agent=transport=dt_socket,address=127.0.0.1:"));
    assert!(agent_option.ends_with(",server=n,suspend=y"));
    let addr = agent_option
        .split(',')
        .find_map(|part| part.strip_prefix("address="))
        .unwrap()
        .parse()
        .unwrap();

    let agent = MockAgent::connect_back(addr, MockAgentConfig::default());
    let hit = next(&mut rx, |n| matches!(n, Notification::BreakpointHit { .. })).await;
    assert!(matches!(hit, Notification::BreakpointHit { breakpoint, .. } if breakpoint == handle));

    // Sent once during setup; the startup resume waited for it.
    assert_eq!(agent.breakpoint_requests().len(), 1);
    assert_eq!(agent.resume_calls(), 1);

    assert_eq!(session.terminate().await, TerminationReason::Terminated);
    assert!(agent.wait_closed(TIMEOUT).await);
}

#[cfg(unix)]
#[tokio::test]
async fn game_exiting_before_connecting_ends_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (debugger, project, mut rx) = launch_debugger(dir.path(), "exit 7");
    let session = debugger.start_debug_launch(&project).await.unwrap();

    let reason = tokio::time::timeout(TIMEOUT, session.wait_terminated()).await.unwrap();
    assert_eq!(reason, TerminationReason::TargetExited { exit_code: Some(7) });
    next(&mut rx, |n| matches!(n, Notification::Terminated { .. })).await;
}
