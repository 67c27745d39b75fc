use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use sdb_launch::OutputStream;
use sdb_wire::ThreadId;
use tokio::sync::mpsc;

use crate::breakpoints::BreakpointHandle;
use crate::state::{SessionId, SessionState, StopReason, TerminationReason};
use crate::threads::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputSource {
    Stdout,
    Stderr,
    /// `Debugger.Log` messages relayed by the agent.
    Agent,
}

impl From<OutputStream> for OutputSource {
    fn from(stream: OutputStream) -> Self {
        match stream {
            OutputStream::Stdout => OutputSource::Stdout,
            OutputStream::Stderr => OutputSource::Stderr,
        }
    }
}

/// Progress reported to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    StateChanged {
        session: SessionId,
        state: SessionState,
    },
    Stopped {
        session: SessionId,
        thread: ThreadId,
        reason: StopReason,
        frame: Option<Frame>,
    },
    BreakpointHit {
        session: SessionId,
        breakpoint: BreakpointHandle,
        thread: ThreadId,
        frame: Option<Frame>,
    },
    BreakpointResolved {
        session: SessionId,
        breakpoint: BreakpointHandle,
        line: Option<u32>,
    },
    OutputLine {
        session: SessionId,
        source: OutputSource,
        line: String,
    },
    Terminated {
        session: SessionId,
        reason: TerminationReason,
    },
}

impl Notification {
    pub fn session(&self) -> SessionId {
        match self {
            Notification::StateChanged { session, .. }
            | Notification::Stopped { session, .. }
            | Notification::BreakpointHit { session, .. }
            | Notification::BreakpointResolved { session, .. }
            | Notification::OutputLine { session, .. }
            | Notification::Terminated { session, .. } => *session,
        }
    }
}

/// Receives session notifications on a dedicated thread. Implementations may
/// block; that only delays later notifications, never packet processing.
pub trait NotificationSink: Send + Sync + 'static {
    fn notify(&self, notification: Notification);
}

impl<F> NotificationSink for F
where
    F: Fn(Notification) + Send + Sync + 'static,
{
    fn notify(&self, notification: Notification) {
        self(notification)
    }
}

impl NotificationSink for mpsc::UnboundedSender<Notification> {
    fn notify(&self, notification: Notification) {
        let _ = self.send(notification);
    }
}

/// Queue in front of the host's sink. Cloned into every session.
#[derive(Clone)]
pub(crate) struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    /// Start the delivery thread. It exits once every `Notifier` clone is gone.
    pub fn spawn(sink: Arc<dyn NotificationSink>) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        std::thread::Builder::new()
            .name("sdb-notify".to_owned())
            .spawn(move || {
                while let Some(notification) = rx.blocking_recv() {
                    let session = notification.session();
                    if catch_unwind(AssertUnwindSafe(|| sink.notify(notification))).is_err() {
                        tracing::error!(
                            target: "sdb.session",
                            %session,
                            "notification sink panicked"
                        );
                    }
                }
            })?;
        Ok(Self { tx })
    }

    pub fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::debug!(target: "sdb.session", "notification thread is gone; dropping notification");
        }
    }
}
