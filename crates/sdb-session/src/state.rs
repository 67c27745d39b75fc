use std::fmt;

use sdb_wire::{ObjectId, WireError};

use crate::breakpoints::BreakpointHandle;

/// Identifies one debug run. Allocated by the [`Debugger`](crate::Debugger)
/// that started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Running,
    Suspended,
    Detaching,
    Terminated,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Terminated` is reachable from everywhere and leads nowhere.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Detaching, _) => false,
            (_, Detaching) => true,
            (Connecting, Handshaking)
            | (Handshaking, Running)
            | (Running, Suspended)
            | (Suspended, Running) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Terminated
    }

    /// Connected and past version negotiation.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Suspended)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Running => "running",
            SessionState::Suspended => "suspended",
            SessionState::Detaching => "detaching",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Why the target stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `breakpoint` is `None` when the agent reports a request this session no
    /// longer tracks.
    Breakpoint { breakpoint: Option<BreakpointHandle> },
    Step,
    Exception { exception: ObjectId },
    /// `System.Diagnostics.Debugger.Break()` in game code.
    UserBreak,
    Pause,
}

/// How a session ended. Reported exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Detached,
    Terminated,
    TargetExited { exit_code: Option<i32> },
    Disconnected,
    ProtocolError(String),
    HandshakeFailed(String),
    ConnectFailed(String),
    ConnectTimeout { attempts: u32 },
}

impl TerminationReason {
    /// Stable reason code for hosts.
    pub fn code(&self) -> &'static str {
        match self {
            TerminationReason::Detached => "detached",
            TerminationReason::Terminated => "terminated",
            TerminationReason::TargetExited { .. } => "target_exited",
            TerminationReason::Disconnected => "disconnected",
            TerminationReason::ProtocolError(_) => "protocol_error",
            TerminationReason::HandshakeFailed(_) => "handshake_failed",
            TerminationReason::ConnectFailed(_) => "connect_failed",
            TerminationReason::ConnectTimeout { .. } => "connect_timeout",
        }
    }
}

impl From<WireError> for TerminationReason {
    fn from(err: WireError) -> Self {
        match err {
            WireError::ConnectFailed { .. } => TerminationReason::ConnectFailed(err.to_string()),
            WireError::ConnectTimeout { attempts, .. } => {
                TerminationReason::ConnectTimeout { attempts }
            }
            WireError::HandshakeFailed(message) => TerminationReason::HandshakeFailed(message),
            WireError::ConnectionClosed => TerminationReason::Disconnected,
            WireError::MalformedPacket(_) | WireError::Io(_) | WireError::CommandFailed { .. } => {
                TerminationReason::ProtocolError(err.to_string())
            }
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::TargetExited {
                exit_code: Some(code),
            } => write!(f, "target exited with code {code}"),
            TerminationReason::ConnectTimeout { attempts } => {
                write!(f, "connect timed out after {attempts} attempt(s)")
            }
            TerminationReason::ProtocolError(message)
            | TerminationReason::HandshakeFailed(message)
            | TerminationReason::ConnectFailed(message) => {
                write!(f, "{}: {message}", self.code())
            }
            _ => f.write_str(self.code()),
        }
    }
}
