use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sdb_config::DebuggerConfig;
use sdb_launch::process::OutputCallback;
use sdb_launch::{spawn_target, LaunchError, LaunchMode, LaunchResolver, ProjectHandle, ProjectLocator};
use sdb_wire::{Backoff, Listener};

use crate::notify::{Notification, NotificationSink, Notifier, OutputSource};
use crate::session::{ConnectPlan, Session, SessionHandle};
use crate::state::SessionId;

/// Entry point for hosts: resolves projects, starts games and hands out
/// session handles.
///
/// Session ids are only unique within one `Debugger`.
pub struct Debugger {
    resolver: LaunchResolver,
    config: DebuggerConfig,
    notifier: Notifier,
    next_session: AtomicU64,
}

impl Debugger {
    /// Fails only if the notification thread cannot be started.
    pub fn new(
        locator: Arc<dyn ProjectLocator>,
        sink: Arc<dyn NotificationSink>,
        config: DebuggerConfig,
    ) -> std::io::Result<Self> {
        Ok(Self {
            resolver: LaunchResolver::new(locator, &config),
            notifier: Notifier::spawn(sink)?,
            config,
            next_session: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &DebuggerConfig {
        &self.config
    }

    /// Start debugging `project`.
    ///
    /// Returns once the target is resolved and, in launch mode, spawned. The
    /// connection and handshake happen on the session's own task; failures
    /// there end the session and are reported through the notification sink.
    /// Must be called from within a Tokio runtime.
    pub async fn start_debug_launch(&self, project: &ProjectHandle) -> Result<SessionHandle, LaunchError> {
        let target = self.resolver.resolve(project)?;
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let agent = self.config.agent.clone();

        let (target, plan, process) = match target.mode() {
            LaunchMode::Launch => {
                let listener = Listener::bind(target.debug_agent_address()).await?;
                let target = target.with_agent_address(listener.local_addr());

                let notifier = self.notifier.clone();
                let forward: OutputCallback = Arc::new(move |output| {
                    notifier.send(Notification::OutputLine {
                        session: id,
                        source: OutputSource::from(output.stream),
                        line: output.line,
                    });
                });
                let process = spawn_target(&target, forward)?;
                tracing::info!(
                    target: "sdb.launch",
                    session = %id,
                    pid = ?process.id(),
                    command = %target.display_command(),
                    "launched game"
                );
                (target, ConnectPlan::Listen(listener), Some(process))
            }
            LaunchMode::Attach => {
                let backoff = Backoff {
                    initial: agent.backoff_initial(),
                    max_delay: agent.backoff_max(),
                    max_attempts: agent.connect_attempts,
                };
                tracing::info!(
                    target: "sdb.launch",
                    session = %id,
                    addr = %target.debug_agent_address(),
                    "attaching to running game"
                );
                let plan = ConnectPlan::Attach {
                    addr: target.debug_agent_address(),
                    backoff,
                };
                (target, plan, None)
            }
        };

        Ok(Session::spawn(id, &target, plan, process, agent, self.notifier.clone()))
    }
}

impl std::fmt::Debug for Debugger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debugger")
            .field("mode", &self.resolver.mode())
            .field("agent", &self.config.agent)
            .finish_non_exhaustive()
    }
}
