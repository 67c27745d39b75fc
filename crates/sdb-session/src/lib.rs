//! Debug session core for Godot Mono games.
//!
//! A host builds one [`Debugger`] with its collaborators (a
//! [`ProjectLocator`](sdb_launch::ProjectLocator), a [`NotificationSink`] and a
//! [`DebuggerConfig`](sdb_config::DebuggerConfig)) and calls
//! [`Debugger::start_debug_launch`]. That returns a [`SessionHandle`] as soon as
//! the target is spawned; connecting, the handshake and everything after it run
//! on the session's receive loop and are reported through the sink.
//!
//! All session state is owned by that loop. Handles talk to it through a
//! queue, so callers never touch session state directly.

mod breakpoints;
mod debugger;
mod dispatcher;
mod methods;
mod notify;
mod registry;
mod session;
mod state;
mod threads;

pub use breakpoints::{BindState, Breakpoint, BreakpointHandle, BreakpointSet, SourceLocation};
pub use debugger::Debugger;
pub use dispatcher::{Ack, Intent, SessionError, StepKind};
pub use notify::{Notification, NotificationSink, OutputSource};
pub use registry::SessionRegistry;
pub use session::{SessionHandle, SessionSnapshot};
pub use state::{SessionId, SessionState, StopReason, TerminationReason};
pub use threads::{ActiveFrame, Frame, ThreadInfo, ThreadTable};

pub use sdb_launch::{LaunchError, ProjectHandle, ProjectLocator};
pub use sdb_wire::{Location, ThreadId};
