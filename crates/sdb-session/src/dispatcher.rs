//! Host intents and the errors they can produce.

use sdb_wire::{
    protocol::{STEP_DEPTH_INTO, STEP_DEPTH_OUT, STEP_DEPTH_OVER},
    WireError,
};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::breakpoints::{BreakpointHandle, SourceLocation};
use crate::session::SessionSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Into,
    Over,
    Out,
}

impl StepKind {
    pub(crate) fn depth(self) -> i32 {
        match self {
            StepKind::Into => STEP_DEPTH_INTO,
            StepKind::Over => STEP_DEPTH_OVER,
            StepKind::Out => STEP_DEPTH_OUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Continue,
    Pause,
    Step(StepKind),
    /// Look up a local variable in the active frame.
    Evaluate { expression: String },
    /// Disconnect and leave the game running.
    Detach,
    /// Disconnect and stop the game.
    Terminate,
}

impl Intent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Intent::Continue => "continue",
            Intent::Pause => "pause",
            Intent::Step(_) => "step",
            Intent::Evaluate { .. } => "evaluate",
            Intent::Detach => "detach",
            Intent::Terminate => "terminate",
        }
    }
}

/// Answer to an accepted intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// Commands for the intent are on the wire.
    Sent,
    /// Nothing to do, e.g. continuing while already running.
    Ignored,
    /// Rendered value of an evaluated expression.
    Value(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("target is not suspended")]
    NotSuspended,

    #[error("no thread is known to step")]
    NoThread,

    #[error("session has terminated")]
    SessionTerminated,

    #[error("unknown breakpoint {0}")]
    UnknownBreakpoint(BreakpointHandle),

    #[error("evaluation failed: {0}")]
    EvaluationFailed(String),

    #[error("{command} failed: {source}")]
    Command {
        command: &'static str,
        #[source]
        source: WireError,
    },
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Work queued from a [`SessionHandle`](crate::SessionHandle) to the receive loop.
#[derive(Debug)]
pub(crate) enum Request {
    Intent {
        intent: Intent,
        reply: Reply<Ack>,
    },
    SetBreakpoint {
        location: SourceLocation,
        condition: Option<String>,
        reply: Reply<BreakpointHandle>,
    },
    RemoveBreakpoint {
        handle: BreakpointHandle,
        reply: Reply<()>,
    },
    SetBreakpointEnabled {
        handle: BreakpointHandle,
        enabled: bool,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
}

impl Request {
    /// Answer with [`SessionError::SessionTerminated`], whatever was asked.
    pub(crate) fn reject(self) {
        match self {
            Request::Intent { reply, .. } => {
                let _ = reply.send(Err(SessionError::SessionTerminated));
            }
            Request::SetBreakpoint { reply, .. } => {
                let _ = reply.send(Err(SessionError::SessionTerminated));
            }
            Request::RemoveBreakpoint { reply, .. }
            | Request::SetBreakpointEnabled { reply, .. } => {
                let _ = reply.send(Err(SessionError::SessionTerminated));
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(Err(SessionError::SessionTerminated));
            }
        }
    }
}
