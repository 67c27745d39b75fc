use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sdb_config::{DebuggerConfig, LaunchMode};
use sdb_session::{
    Debugger, Intent, Notification, ProjectHandle, SessionHandle, SessionState, SourceLocation,
    StopReason,
};
use sdb_wire::mock::MockAgent;
use sdb_wire::protocol::{CMD_SET_THREAD, CMD_SET_VM, CMD_THREAD_GET_NAME, CMD_VM_RESUME};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub debugger: Debugger,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub project: ProjectHandle,
    _dir: TempDir,
}

impl Harness {
    pub fn new(config: DebuggerConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let project = godot_project(dir.path());
        let (tx, notifications) = mpsc::unbounded_channel();
        let located = project.clone();
        let locator = Arc::new(move |_: &ProjectHandle| Some(located.clone()));
        let debugger = Debugger::new(locator, Arc::new(tx), config).unwrap();
        Self {
            debugger,
            notifications,
            project: ProjectHandle::new("game"),
            _dir: dir,
        }
    }

    pub async fn start(&self) -> SessionHandle {
        self.debugger.start_debug_launch(&self.project).await.unwrap()
    }

    /// Wait for the first notification matching `pred`, skipping the rest.
    pub async fn expect(&mut self, mut pred: impl FnMut(&Notification) -> bool) -> Notification {
        let wait = async {
            loop {
                let notification = self
                    .notifications
                    .recv()
                    .await
                    .expect("notification channel closed");
                if pred(&notification) {
                    return notification;
                }
            }
        };
        tokio::time::timeout(TIMEOUT, wait)
            .await
            .expect("timed out waiting for notification")
    }

    /// Collect whatever arrives within `window`.
    pub async fn drain_for(&mut self, window: Duration) -> Vec<Notification> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(notification)) =
            tokio::time::timeout_at(deadline, self.notifications.recv()).await
        {
            seen.push(notification);
        }
        seen
    }
}

pub fn godot_project(root: &Path) -> PathBuf {
    let project = root.join("game");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(project.join("project.godot"), "config_version=5\n").unwrap();
    project
}

pub fn attach_config(addr: SocketAddr) -> DebuggerConfig {
    let mut config = DebuggerConfig::default();
    config.launch.mode = LaunchMode::Attach;
    config.agent.host = addr.ip().to_string();
    config.agent.port = addr.port();
    config.agent.connect_timeout_ms = 5_000;
    config.agent.backoff_initial_ms = 10;
    config.agent.backoff_max_ms = 50;
    config
}

/// Attach to `agent` and wait until startup is over, so the target is running
/// with no breakpoints and no commands in flight.
pub async fn attach(agent: &MockAgent) -> (Harness, SessionHandle) {
    let mut harness = Harness::new(attach_config(agent.addr()));
    let session = harness.start().await;
    harness
        .expect(|n| matches!(n, Notification::StateChanged { state: SessionState::Running, .. }))
        .await;
    assert!(agent.wait_for_command(CMD_SET_VM, CMD_VM_RESUME, 1, TIMEOUT).await);
    // The last startup command: naming the threads reported by VM.ALL_THREADS.
    assert!(agent.wait_for_command(CMD_SET_THREAD, CMD_THREAD_GET_NAME, 1, TIMEOUT).await);
    session.snapshot().await.unwrap();
    (harness, session)
}

/// Set a line breakpoint on a running session and make the target hit it.
pub async fn stop_at_line(
    harness: &mut Harness,
    session: &SessionHandle,
    file: &str,
    line: u32,
) -> Notification {
    let handle = session
        .set_breakpoint(SourceLocation::line(file, line), None)
        .await
        .unwrap();
    harness
        .expect(|n| matches!(n, Notification::BreakpointResolved { breakpoint, .. } if *breakpoint == handle))
        .await;

    session.send(Intent::Pause).await.unwrap();
    harness
        .expect(|n| matches!(n, Notification::Stopped { reason: StopReason::Pause, .. }))
        .await;
    session.send(Intent::Continue).await.unwrap();
    harness
        .expect(|n| matches!(n, Notification::BreakpointHit { breakpoint, .. } if *breakpoint == handle))
        .await
}
