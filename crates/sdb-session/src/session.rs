//! The per-session receive loop and the handle hosts use to talk to it.
//!
//! One task owns the connection, the pending-reply table, the child process
//! and every piece of session state. It reacts to four sources: decoded
//! packets, queued [`Request`]s, child exit and the detach deadline. Handlers
//! are synchronous; commands they issue go to an outbox that is flushed after
//! each step, so packets are handled strictly in wire order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::ExitStatus;

use futures_util::{SinkExt, StreamExt};
use sdb_config::AgentConfig;
use sdb_launch::process::DEFAULT_KILL_GRACE;
use sdb_launch::{LaunchMode, LaunchTarget, TargetProcess};
use sdb_wire::protocol::*;
use sdb_wire::{
    connect_with_backoff, parse_composite_event, AgentEvent, Backoff, Command, DebugInfo,
    FrameInfo, Listener, Location, LocalsInfo, MethodId, Packet, PacketSink, PacketStream,
    PendingTable, ProtocolVersion, ThreadId, Value, VersionInfo, WireError,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::Instrument;

use crate::breakpoints::{BindOutcome, BindTicket, Breakpoint, BreakpointHandle, BreakpointSet, SourceLocation};
use crate::dispatcher::{Ack, Intent, Reply, Request, SessionError, StepKind};
use crate::methods::MethodCache;
use crate::notify::{Notification, Notifier, OutputSource};
use crate::state::{SessionId, SessionState, StopReason, TerminationReason};
use crate::threads::{ActiveFrame, Frame, ThreadInfo, ThreadTable};

/// How the loop reaches the agent.
pub(crate) enum ConnectPlan {
    /// Launch mode: the game connects back to us.
    Listen(Listener),
    /// Attach mode: poll-connect to an agent that listens.
    Attach { addr: SocketAddr, backoff: Backoff },
}

/// Point-in-time copy of the session's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub threads: Vec<ThreadInfo>,
    pub active_frame: Option<ActiveFrame>,
    pub breakpoints: Vec<Breakpoint>,
}

/// Cheap, cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<SessionState>,
    outcome: watch::Receiver<Option<TerminationReason>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// `Some` once the session has terminated.
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.outcome.borrow().clone()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .map_err(|_| SessionError::SessionTerminated)?;
        rx.await.unwrap_or(Err(SessionError::SessionTerminated))
    }

    pub async fn send(&self, intent: Intent) -> Result<Ack, SessionError> {
        self.request(|reply| Request::Intent { intent, reply }).await
    }

    /// Add a breakpoint. Valid in any live state; before the session is
    /// running it stays pending and is sent once the agent is ready.
    pub async fn set_breakpoint(
        &self,
        location: SourceLocation,
        condition: Option<String>,
    ) -> Result<BreakpointHandle, SessionError> {
        self.request(|reply| Request::SetBreakpoint {
            location,
            condition,
            reply,
        })
        .await
    }

    pub async fn remove_breakpoint(&self, handle: BreakpointHandle) -> Result<(), SessionError> {
        self.request(|reply| Request::RemoveBreakpoint { handle, reply })
            .await
    }

    pub async fn set_breakpoint_enabled(
        &self,
        handle: BreakpointHandle,
        enabled: bool,
    ) -> Result<(), SessionError> {
        self.request(|reply| Request::SetBreakpointEnabled {
            handle,
            enabled,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| Request::Snapshot { reply }).await
    }

    /// Detach and wait for the session to end. Safe to call repeatedly or
    /// concurrently; every caller observes the same outcome.
    pub async fn detach(&self) -> TerminationReason {
        self.shutdown(Intent::Detach).await
    }

    /// Stop the game and wait for the session to end.
    pub async fn terminate(&self) -> TerminationReason {
        self.shutdown(Intent::Terminate).await
    }

    async fn shutdown(&self, intent: Intent) -> TerminationReason {
        match self.send(intent).await {
            Ok(_) | Err(SessionError::SessionTerminated) => {}
            Err(err) => {
                tracing::debug!(target: "sdb.session", session = %self.id, error = %err, "shutdown request failed");
            }
        }
        self.wait_terminated().await
    }

    pub async fn wait_terminated(&self) -> TerminationReason {
        let mut outcome = self.outcome.clone();
        let _ = outcome.wait_for(Option::is_some).await;
        let reason = outcome.borrow().clone();
        reason.unwrap_or(TerminationReason::Disconnected)
    }

    /// Wait until the published state satisfies `pred`. Intermediate states
    /// can be skipped; use notifications to observe every transition.
    pub async fn wait_for_state(&self, mut pred: impl FnMut(SessionState) -> bool) -> SessionState {
        let mut state = self.state.clone();
        let result = state.wait_for(|s| pred(*s) || s.is_terminal()).await.map(|s| *s);
        result.unwrap_or(SessionState::Terminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Detach,
    Terminate,
}

impl Shutdown {
    fn reason(self) -> TerminationReason {
        match self {
            Shutdown::Detach => TerminationReason::Detached,
            Shutdown::Terminate => TerminationReason::Terminated,
        }
    }
}

/// Who is waiting for a method lookup.
#[derive(Debug, Clone, Copy)]
enum Waiter {
    Stop(u64),
    Bind(u64),
}

#[derive(Debug)]
struct Evaluation {
    name: String,
    thread: ThreadId,
    frame: Frame,
    reply: Reply<Ack>,
}

/// What to do with the reply to a command.
#[derive(Debug)]
enum ReplyAction {
    Version,
    /// Only failures matter; logged under the command's name.
    Ignore(&'static str),
    InitialRequest(u8),
    AllThreads,
    ThreadName(ThreadId),
    Resume,
    Suspend,
    StepRequest,
    Frames { generation: u64 },
    MethodName { method: MethodId, waiter: Waiter },
    MethodDebugInfo { method: MethodId, waiter: Waiter },
    BindTypes { bind: u64 },
    BindMethods { bind: u64 },
    BindSet { bind: u64, location: Location, line: Option<u32> },
    EvalLocals(Evaluation),
    EvalValue(Evaluation),
    EvalString(Reply<Ack>),
    Shutdown,
}

/// A breakpoint being resolved: type lookup, then methods, then metadata.
#[derive(Debug)]
struct BindOp {
    ticket: BindTicket,
    outstanding: usize,
    methods: Vec<MethodId>,
}

/// A stop whose frames are still being fetched.
#[derive(Debug)]
struct PendingStop {
    generation: u64,
    thread: ThreadId,
    location: Option<Location>,
    reason: StopReason,
    frames: Vec<FrameInfo>,
    outstanding: usize,
}

pub(crate) struct Session {
    id: SessionId,
    state: SessionState,
    agent: AgentConfig,
    requests: mpsc::UnboundedReceiver<Request>,
    requests_open: bool,
    state_tx: watch::Sender<SessionState>,
    outcome_tx: watch::Sender<Option<TerminationReason>>,
    notifier: Notifier,
    process: Option<TargetProcess>,

    sink: Option<PacketSink>,
    outbox: Vec<Packet>,
    pending: PendingTable<ReplyAction>,

    breakpoints: BreakpointSet,
    binds: HashMap<u64, BindOp>,
    next_bind: u64,
    threads: ThreadTable,
    methods: MethodCache,
    active_frame: Option<ActiveFrame>,
    /// Thread of the current stop, known before its frames are.
    stopped_thread: Option<ThreadId>,
    stop: Option<PendingStop>,
    stop_generation: u64,
    step_request: Option<i32>,

    protocol: ProtocolVersion,
    setup_done: bool,
    startup_suspended: bool,
    startup_resumed: bool,
    /// A suspending `TYPE_LOAD` is waiting for retried breakpoints to be set.
    resume_after_binds: bool,
    exit_code: Option<i32>,
    shutdown: Option<Shutdown>,
    detach_deadline: Option<Instant>,
}

impl Session {
    /// Start the receive loop for `target` and return its handle.
    pub(crate) fn spawn(
        id: SessionId,
        target: &LaunchTarget,
        plan: ConnectPlan,
        process: Option<TargetProcess>,
        agent: AgentConfig,
        notifier: Notifier,
    ) -> SessionHandle {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        notifier.send(Notification::StateChanged {
            session: id,
            state: SessionState::Connecting,
        });

        let session = Session {
            id,
            state: SessionState::Connecting,
            agent,
            requests,
            requests_open: true,
            state_tx,
            outcome_tx,
            notifier,
            process,
            sink: None,
            outbox: Vec::new(),
            pending: PendingTable::new(),
            breakpoints: BreakpointSet::new(),
            binds: HashMap::new(),
            next_bind: 0,
            threads: ThreadTable::default(),
            methods: MethodCache::default(),
            active_frame: None,
            stopped_thread: None,
            stop: None,
            stop_generation: 0,
            step_request: None,
            protocol: ProtocolVersion::default(),
            setup_done: false,
            startup_suspended: target.mode() == LaunchMode::Launch && target.suspend_on_start(),
            startup_resumed: false,
            resume_after_binds: false,
            exit_code: None,
            shutdown: None,
            detach_deadline: None,
        };

        let span = tracing::info_span!(target: "sdb.session", "session", id = %id);
        tokio::spawn(session.run(plan).instrument(span));

        SessionHandle {
            id,
            requests: requests_tx,
            state: state_rx,
            outcome: outcome_rx,
        }
    }

    async fn run(mut self, plan: ConnectPlan) {
        let reason = match self.establish(plan).await {
            Ok(stream) => self.drive(stream).await,
            Err(reason) => reason,
        };
        self.finish(reason).await;
    }

    /// Connect, exchange banners and ask for the agent's version.
    async fn establish(&mut self, plan: ConnectPlan) -> Result<PacketStream, TerminationReason> {
        let timeout = self.agent.connect_timeout();
        let connect = async move {
            match plan {
                ConnectPlan::Listen(listener) => listener.accept(timeout).await,
                ConnectPlan::Attach { addr, backoff } => {
                    connect_with_backoff(addr, &backoff, timeout).await
                }
            }
        };
        tokio::pin!(connect);

        let mut conn = loop {
            tokio::select! {
                res = &mut connect => break res?,
                request = self.requests.recv(), if self.requests_open => {
                    if let Some(reason) = self.on_request(request) {
                        return Err(reason);
                    }
                }
                status = child_exit(&mut self.process) => return Err(self.on_child_exit(status)),
            }
        };

        tracing::debug!(target: "sdb.session", peer = %conn.peer_addr(), "connected to debug agent");
        self.set_state(SessionState::Handshaking);
        conn.handshake(timeout).await?;

        let (stream, sink) = conn.into_framed(self.agent.max_packet_bytes);
        self.sink = Some(sink);
        self.send_command(Command::version(), ReplyAction::Version);
        self.flush_outbox().await?;
        Ok(stream)
    }

    async fn drive(&mut self, mut stream: PacketStream) -> TerminationReason {
        loop {
            let deadline = self.detach_deadline;
            let ended = tokio::select! {
                packet = stream.next() => match packet {
                    Some(Ok(packet)) => self.on_packet(packet),
                    Some(Err(err)) => {
                        tracing::warn!(target: "sdb.session", error = %err, "connection failed");
                        Some(self.closed_reason(Some(err)))
                    }
                    None => Some(self.closed_reason(None)),
                },
                request = self.requests.recv(), if self.requests_open => self.on_request(request),
                status = child_exit(&mut self.process) => Some(self.on_child_exit(status)),
                () = deadline_elapsed(deadline) => {
                    tracing::warn!(target: "sdb.session", "agent did not acknowledge shutdown in time; closing");
                    Some(self.closed_reason(None))
                }
            };
            if let Some(reason) = ended {
                return reason;
            }
            if let Err(err) = self.flush_outbox().await {
                tracing::warn!(target: "sdb.session", error = %err, "failed to send to agent");
                return self.closed_reason(Some(err));
            }
        }
    }

    /// Tear down: close the connection, settle the game process and publish
    /// the outcome. Runs exactly once per session.
    async fn finish(mut self, reason: TerminationReason) {
        match &reason {
            TerminationReason::Detached | TerminationReason::Terminated => {
                tracing::info!(target: "sdb.session", reason = reason.code(), "session ended");
            }
            other => {
                tracing::warn!(target: "sdb.session", reason = other.code(), detail = %other, "session ended");
            }
        }

        self.sink = None;
        self.outbox.clear();
        self.detach_deadline = None;
        // Dropping outstanding replies fails any evaluations still waiting.
        self.pending.drain().for_each(drop);

        if let Some(mut process) = self.process.take() {
            if reason == TerminationReason::Detached {
                process.release();
            } else {
                match process.terminate(DEFAULT_KILL_GRACE).await {
                    Ok(status) => tracing::debug!(target: "sdb.session", %status, "game stopped"),
                    Err(err) => tracing::warn!(target: "sdb.session", error = %err, "failed to stop game"),
                }
            }
        }

        self.set_state(SessionState::Terminated);
        self.outcome_tx.send_replace(Some(reason.clone()));
        self.notifier.send(Notification::Terminated {
            session: self.id,
            reason,
        });

        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            request.reject();
        }
    }

    fn closed_reason(&self, err: Option<WireError>) -> TerminationReason {
        if let Some(shutdown) = self.shutdown {
            return shutdown.reason();
        }
        if self.exit_code.is_some() {
            return TerminationReason::TargetExited {
                exit_code: self.exit_code,
            };
        }
        err.map_or(TerminationReason::Disconnected, TerminationReason::from)
    }

    fn on_child_exit(&mut self, status: Option<ExitStatus>) -> TerminationReason {
        let exit_code = status.and_then(|status| status.code()).or(self.exit_code);
        tracing::info!(target: "sdb.session", exit_code = ?exit_code, "game exited");
        match self.shutdown {
            Some(shutdown) => shutdown.reason(),
            None => TerminationReason::TargetExited { exit_code },
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if next == self.state {
            return;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(target: "sdb.session", from = %self.state, to = %next, "ignoring invalid state transition");
            return;
        }
        tracing::debug!(target: "sdb.session", from = %self.state, to = %next, "state changed");
        self.state = next;
        self.state_tx.send_replace(next);
        self.notifier.send(Notification::StateChanged {
            session: self.id,
            state: next,
        });
    }

    fn send_command(&mut self, command: Command, action: ReplyAction) {
        if self.sink.is_none() {
            tracing::debug!(target: "sdb.session", command = command.name(), "not connected; dropping command");
            return;
        }
        let id = self.pending.insert(action);
        tracing::trace!(target: "sdb.session", id, command = command.name(), "send");
        self.outbox.push(command.into_packet(id));
    }

    fn send_ignored(&mut self, command: Command) {
        let name = command.name();
        self.send_command(command, ReplyAction::Ignore(name));
    }

    async fn flush_outbox(&mut self) -> Result<(), WireError> {
        let Some(sink) = self.sink.as_mut() else {
            self.outbox.clear();
            return Ok(());
        };
        if self.outbox.is_empty() {
            return Ok(());
        }
        for packet in self.outbox.drain(..) {
            sink.feed(packet).await?;
        }
        sink.flush().await
    }

    // Requests from handles.

    fn on_request(&mut self, request: Option<Request>) -> Option<TerminationReason> {
        let Some(request) = request else {
            self.requests_open = false;
            tracing::debug!(target: "sdb.session", "every session handle was dropped; detaching");
            return self.begin_shutdown(Shutdown::Detach);
        };

        match request {
            Request::Intent { intent, reply } => return self.on_intent(intent, reply),
            Request::SetBreakpoint {
                location,
                condition,
                reply,
            } => {
                let (handle, created) = self.breakpoints.upsert(location, condition);
                if created {
                    tracing::debug!(target: "sdb.session", breakpoint = %handle, "breakpoint added");
                    self.flush_breakpoints();
                }
                let _ = reply.send(Ok(handle));
            }
            Request::RemoveBreakpoint { handle, reply } => {
                let result = match self.breakpoints.remove(handle) {
                    Some(bp) => {
                        if let Some(request_id) = bp.resolved_token() {
                            self.clear_breakpoint_request(request_id);
                        }
                        Ok(())
                    }
                    None => Err(SessionError::UnknownBreakpoint(handle)),
                };
                let _ = reply.send(result);
            }
            Request::SetBreakpointEnabled {
                handle,
                enabled,
                reply,
            } => {
                let result = match self.breakpoints.set_enabled(handle, enabled) {
                    Some(token) => {
                        if let Some(request_id) = token {
                            self.clear_breakpoint_request(request_id);
                        }
                        if enabled {
                            self.flush_breakpoints();
                        }
                        Ok(())
                    }
                    None => Err(SessionError::UnknownBreakpoint(handle)),
                };
                let _ = reply.send(result);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(Ok(SessionSnapshot {
                    state: self.state,
                    threads: self.threads.iter().cloned().collect(),
                    active_frame: self.active_frame.clone(),
                    breakpoints: self.breakpoints.iter().cloned().collect(),
                }));
            }
        }
        None
    }

    fn on_intent(&mut self, intent: Intent, reply: Reply<Ack>) -> Option<TerminationReason> {
        tracing::debug!(target: "sdb.session", intent = intent.name(), state = %self.state, "intent");

        if self.state == SessionState::Detaching {
            let result = match intent {
                Intent::Detach | Intent::Terminate => Ok(Ack::Ignored),
                _ => Err(SessionError::SessionTerminated),
            };
            let _ = reply.send(result);
            return None;
        }

        match intent {
            Intent::Continue => {
                let _ = reply.send(Ok(self.resume()));
            }
            Intent::Pause => {
                let _ = reply.send(Ok(self.pause()));
            }
            Intent::Step(kind) => {
                let _ = reply.send(self.step(kind));
            }
            Intent::Evaluate { expression } => self.evaluate(&expression, reply),
            Intent::Detach => {
                let _ = reply.send(Ok(Ack::Sent));
                return self.begin_shutdown(Shutdown::Detach);
            }
            Intent::Terminate => {
                let _ = reply.send(Ok(Ack::Sent));
                return self.begin_shutdown(Shutdown::Terminate);
            }
        }
        None
    }

    fn resume(&mut self) -> Ack {
        if self.state != SessionState::Suspended {
            return Ack::Ignored;
        }
        self.send_command(Command::resume(), ReplyAction::Resume);
        self.mark_running();
        Ack::Sent
    }

    fn mark_running(&mut self) {
        self.threads.resume_all();
        self.active_frame = None;
        self.stopped_thread = None;
        self.stop = None;
        self.set_state(SessionState::Running);
    }

    fn pause(&mut self) -> Ack {
        if self.state != SessionState::Running {
            return Ack::Ignored;
        }
        self.send_command(Command::suspend(), ReplyAction::Suspend);
        Ack::Sent
    }

    fn step(&mut self, kind: StepKind) -> Result<Ack, SessionError> {
        if self.state != SessionState::Suspended {
            return Err(SessionError::NotSuspended);
        }
        // Frames may still be loading, or the stop may have none at all.
        let thread = self
            .active_frame
            .as_ref()
            .map(|active| active.thread)
            .or(self.stopped_thread)
            .or_else(|| self.threads.first());
        let Some(thread) = thread else {
            return Err(SessionError::NoThread);
        };
        let step = EventModifier::Step {
            thread,
            size: STEP_SIZE_LINE,
            depth: kind.depth(),
            filter: 0,
        };
        self.send_command(
            Command::event_request_set(EVENT_KIND_STEP, SUSPEND_POLICY_ALL, vec![step]),
            ReplyAction::StepRequest,
        );
        self.send_command(Command::resume(), ReplyAction::Resume);
        self.mark_running();
        Ok(Ack::Sent)
    }

    fn evaluate(&mut self, expression: &str, reply: Reply<Ack>) {
        if self.state != SessionState::Suspended {
            let _ = reply.send(Err(SessionError::NotSuspended));
            return;
        }
        let Some(active) = self.active_frame.clone() else {
            let _ = reply.send(Err(SessionError::EvaluationFailed(
                "no active frame".to_owned(),
            )));
            return;
        };
        let name = expression.trim();
        if !is_identifier(name) {
            let _ = reply.send(Err(SessionError::EvaluationFailed(format!(
                "unsupported expression `{name}`; only local variable names can be evaluated"
            ))));
            return;
        }

        let method = active.frame.location.method;
        let eval = Evaluation {
            name: name.to_owned(),
            thread: active.thread,
            frame: active.frame,
            reply,
        };
        if self.methods.locals(method).is_some() {
            self.evaluate_with_locals(eval);
        } else {
            self.send_command(Command::method_locals_info(method), ReplyAction::EvalLocals(eval));
        }
    }

    fn evaluate_with_locals(&mut self, eval: Evaluation) {
        let location = eval.frame.location;
        let index = self
            .methods
            .locals(location.method)
            .and_then(|locals| locals.find(&eval.name, location.il_offset))
            .map(|local| local.index);
        match index {
            Some(index) => {
                let command = Command::frame_values(eval.thread, eval.frame.id, &[index]);
                self.send_command(command, ReplyAction::EvalValue(eval));
            }
            None => {
                let message = format!("unknown variable `{}`", eval.name);
                let _ = eval.reply.send(Err(SessionError::EvaluationFailed(message)));
            }
        }
    }

    /// Start a graceful detach or terminate. Later calls are no-ops.
    fn begin_shutdown(&mut self, shutdown: Shutdown) -> Option<TerminationReason> {
        if self.shutdown.is_some() {
            return None;
        }
        self.shutdown = Some(shutdown);
        self.set_state(SessionState::Detaching);
        if self.sink.is_none() {
            return Some(shutdown.reason());
        }

        let command = match shutdown {
            Shutdown::Detach => Command::dispose(),
            Shutdown::Terminate => Command::exit(0),
        };
        self.send_command(command, ReplyAction::Shutdown);
        self.detach_deadline = Some(Instant::now() + self.agent.detach_timeout());
        None
    }

    // Breakpoint binding.

    /// Send every breakpoint that has not been sent yet. Does nothing until
    /// the session is running; the first entry into `Running` flushes.
    fn flush_breakpoints(&mut self) {
        if !self.state.is_live() {
            return;
        }
        for ticket in self.breakpoints.take_pending() {
            self.start_bind(ticket);
        }
    }

    fn retry_unbound(&mut self) {
        if !self.state.is_live() {
            return;
        }
        for ticket in self.breakpoints.take_unbound() {
            tracing::debug!(target: "sdb.session", breakpoint = %ticket.handle, "retrying breakpoint after type load");
            self.start_bind(ticket);
        }
    }

    fn start_bind(&mut self, ticket: BindTicket) {
        let command = match &ticket.location {
            SourceLocation::Line { file, .. } => Command::types_for_source_file(file, true),
            SourceLocation::Method { type_name, .. } => Command::types(type_name, false),
        };
        self.next_bind += 1;
        let bind = self.next_bind;
        self.binds.insert(
            bind,
            BindOp {
                ticket,
                outstanding: 1,
                methods: Vec::new(),
            },
        );
        self.send_command(command, ReplyAction::BindTypes { bind });
    }

    fn on_bind_types(&mut self, bind: u64, result: Result<Vec<i32>, String>) {
        let types = match result {
            Ok(types) if !types.is_empty() => types,
            Ok(_) => return self.bind_unbound(bind, "code not loaded yet"),
            Err(err) => return self.bind_unbound(bind, &err),
        };
        for type_id in &types {
            self.send_command(Command::type_methods(*type_id), ReplyAction::BindMethods { bind });
        }
        if let Some(op) = self.binds.get_mut(&bind) {
            op.outstanding += types.len();
        }
        self.bind_step_done(bind);
    }

    fn on_bind_methods(&mut self, bind: u64, methods: Vec<MethodId>) {
        let Some(location) = self.binds.get(&bind).map(|op| op.ticket.location.clone()) else {
            return;
        };
        let mut lookups = 0;
        for method in &methods {
            let (needs_name, needs_debug_info) = self.methods.missing_for(&location, *method);
            let waiter = Waiter::Bind(bind);
            if needs_name {
                self.send_command(Command::method_name(*method), ReplyAction::MethodName { method: *method, waiter });
                lookups += 1;
            }
            if needs_debug_info {
                self.send_command(
                    Command::method_debug_info(*method),
                    ReplyAction::MethodDebugInfo { method: *method, waiter },
                );
                lookups += 1;
            }
        }
        if let Some(op) = self.binds.get_mut(&bind) {
            op.methods.extend(methods);
            op.outstanding += lookups;
        }
        self.bind_step_done(bind);
    }

    fn bind_step_done(&mut self, bind: u64) {
        let Some(op) = self.binds.get_mut(&bind) else {
            return;
        };
        op.outstanding = op.outstanding.saturating_sub(1);
        if op.outstanding > 0 {
            return;
        }

        let resolved = self.methods.resolve(&op.ticket.location, &op.methods);
        match resolved {
            Some((location, line)) if self.breakpoints.is_current(&op.ticket) => {
                let modifiers = vec![EventModifier::LocationOnly { location }];
                self.send_command(
                    Command::event_request_set(EVENT_KIND_BREAKPOINT, SUSPEND_POLICY_ALL, modifiers),
                    ReplyAction::BindSet {
                        bind,
                        location,
                        line,
                    },
                );
            }
            Some(_) => {
                self.binds.remove(&bind);
                self.after_bind();
            }
            None => self.bind_unbound(bind, "no code at location"),
        }
    }

    fn on_bind_set(&mut self, bind: u64, location: Location, line: Option<u32>, result: Result<i32, String>) {
        let Some(op) = self.binds.remove(&bind) else {
            return;
        };
        match result {
            Ok(request_id) => match self.breakpoints.mark_bound(&op.ticket, request_id, location, line) {
                BindOutcome::Bound => {
                    tracing::info!(
                        target: "sdb.session",
                        breakpoint = %op.ticket.handle,
                        location = %op.ticket.location,
                        request_id,
                        "breakpoint bound"
                    );
                    self.notifier.send(Notification::BreakpointResolved {
                        session: self.id,
                        breakpoint: op.ticket.handle,
                        line,
                    });
                }
                BindOutcome::Stale => self.clear_breakpoint_request(request_id),
            },
            Err(err) => {
                tracing::warn!(target: "sdb.session", breakpoint = %op.ticket.handle, error = %err, "agent rejected breakpoint");
                self.breakpoints.mark_unbound(&op.ticket);
            }
        }
        self.after_bind();
    }

    fn bind_unbound(&mut self, bind: u64, why: &str) {
        if let Some(op) = self.binds.remove(&bind) {
            tracing::debug!(
                target: "sdb.session",
                breakpoint = %op.ticket.handle,
                location = %op.ticket.location,
                why,
                "breakpoint unbound"
            );
            self.breakpoints.mark_unbound(&op.ticket);
        }
        self.after_bind();
    }

    fn after_bind(&mut self) {
        if !self.binds.is_empty() {
            return;
        }
        self.maybe_finish_setup();
        // Owed even if the user paused meanwhile: the agent counts suspensions.
        if std::mem::take(&mut self.resume_after_binds) && self.state.is_live() {
            tracing::debug!(target: "sdb.session", "breakpoints for loaded type set; resuming");
            self.send_command(Command::resume(), ReplyAction::Resume);
        }
    }

    fn clear_breakpoint_request(&mut self, request_id: i32) {
        if self.state.is_live() {
            self.send_ignored(Command::event_request_clear(EVENT_KIND_BREAKPOINT, request_id));
        }
    }

    // Startup.

    fn on_version(&mut self, version: VersionInfo) -> Option<TerminationReason> {
        if !version.is_compatible() {
            return Some(TerminationReason::HandshakeFailed(format!(
                "agent `{}` speaks protocol {}.{}, expected {PROTOCOL_MAJOR}.x",
                version.vm_name, version.major, version.minor
            )));
        }
        self.protocol = ProtocolVersion::negotiate(version.version());
        tracing::info!(
            target: "sdb.session",
            vm = %version.vm_name,
            agent = %version.version(),
            protocol = %self.protocol,
            "debug agent ready"
        );
        self.send_ignored(Command::set_protocol_version(self.protocol.major, self.protocol.minor));
        self.set_state(SessionState::Running);
        self.register_initial_requests();
        self.send_command(Command::all_threads(), ReplyAction::AllThreads);
        self.flush_breakpoints();
        self.setup_done = true;
        self.maybe_finish_setup();
        None
    }

    fn register_initial_requests(&mut self) {
        let uncaught = EventModifier::ExceptionOnly {
            type_id: 0,
            caught: false,
            uncaught: true,
            subclasses: true,
        };
        let requests = [
            (EVENT_KIND_THREAD_START, SUSPEND_POLICY_NONE, Vec::new()),
            (EVENT_KIND_THREAD_DEATH, SUSPEND_POLICY_NONE, Vec::new()),
            // Suspends so that breakpoints in the new type are set before it runs.
            (EVENT_KIND_TYPE_LOAD, SUSPEND_POLICY_ALL, Vec::new()),
            (EVENT_KIND_USER_LOG, SUSPEND_POLICY_NONE, Vec::new()),
            (EVENT_KIND_USER_BREAK, SUSPEND_POLICY_ALL, Vec::new()),
            (EVENT_KIND_EXCEPTION, SUSPEND_POLICY_ALL, vec![uncaught]),
        ];
        for (kind, policy, modifiers) in requests {
            self.send_command(
                Command::event_request_set(kind, policy, modifiers),
                ReplyAction::InitialRequest(kind),
            );
        }
    }

    /// Resume a target that started suspended, once breakpoints sent during
    /// setup have all been answered.
    fn maybe_finish_setup(&mut self) {
        if !self.setup_done || !self.startup_suspended || self.startup_resumed {
            return;
        }
        if !self.binds.is_empty() || self.state != SessionState::Running {
            return;
        }
        self.startup_resumed = true;
        tracing::debug!(target: "sdb.session", "resuming target suspended at startup");
        self.send_command(Command::resume(), ReplyAction::Resume);
    }

    fn observe_thread(&mut self, thread: ThreadId) {
        if thread != 0 && self.threads.observe(thread) && self.state.is_live() {
            self.send_command(Command::thread_name(thread), ReplyAction::ThreadName(thread));
        }
    }

    // Inbound packets.

    fn on_packet(&mut self, packet: Packet) -> Option<TerminationReason> {
        match packet {
            Packet::Reply {
                id,
                error_code,
                payload,
            } => {
                let Some(action) = self.pending.complete(id) else {
                    tracing::warn!(target: "sdb.session", id, "discarding reply with no pending command");
                    return None;
                };
                self.on_reply(action, error_code, &payload)
            }
            Packet::Command {
                command_set: CMD_SET_EVENT,
                command: CMD_COMPOSITE,
                payload,
                ..
            } => self.on_events(&payload),
            Packet::Command {
                command_set,
                command,
                ..
            } => {
                tracing::warn!(
                    target: "sdb.session",
                    command = command_name(command_set, command),
                    "ignoring unexpected command from agent"
                );
                None
            }
        }
    }

    fn on_reply(&mut self, action: ReplyAction, error_code: u16, payload: &[u8]) -> Option<TerminationReason> {
        let failed = (error_code != ERROR_NONE).then_some(WireError::CommandFailed { error_code });

        match action {
            ReplyAction::Version => {
                if let Some(err) = failed {
                    return Some(TerminationReason::HandshakeFailed(format!("VM.VERSION: {err}")));
                }
                return match VersionInfo::parse(payload) {
                    Ok(version) => self.on_version(version),
                    Err(err) => Some(TerminationReason::HandshakeFailed(err.to_string())),
                };
            }
            ReplyAction::Ignore(command) => {
                if let Some(err) = failed {
                    tracing::warn!(target: "sdb.session", command, error = %err, "command failed");
                }
            }
            ReplyAction::InitialRequest(kind) => {
                if let Some(err) = failed {
                    tracing::warn!(target: "sdb.session", event_kind = kind, error = %err, "agent rejected event request");
                }
            }
            ReplyAction::AllThreads => match (failed, parse_id_list(payload)) {
                (None, Ok(ids)) => {
                    for id in ids {
                        self.threads.observe(id);
                        // Threads seen before the session went live have no name yet.
                        if self.threads.get(id).is_some_and(|thread| thread.name.is_none()) {
                            self.send_command(Command::thread_name(id), ReplyAction::ThreadName(id));
                        }
                    }
                }
                (Some(err), _) => warn_reply("VM.ALL_THREADS", &err),
                (None, Err(err)) => warn_reply("VM.ALL_THREADS", &err),
            },
            ReplyAction::ThreadName(thread) => {
                if let (None, Ok(name)) = (failed, parse_string(payload)) {
                    self.threads.set_name(thread, name);
                }
            }
            ReplyAction::Resume => {
                if let Some(err) = failed {
                    warn_reply("VM.RESUME", &err);
                }
            }
            ReplyAction::Suspend => match failed {
                Some(err) => warn_reply("VM.SUSPEND", &err),
                None => self.on_paused(),
            },
            ReplyAction::StepRequest => match (failed, parse_request_id(payload)) {
                (None, Ok(request_id)) => {
                    if self.state == SessionState::Running {
                        self.step_request = Some(request_id);
                    } else {
                        // The step already ended before its id arrived.
                        self.send_ignored(Command::event_request_clear(EVENT_KIND_STEP, request_id));
                    }
                }
                (Some(err), _) => warn_reply("EVENT_REQUEST.SET(step)", &err),
                (None, Err(err)) => warn_reply("EVENT_REQUEST.SET(step)", &err),
            },
            ReplyAction::Frames { generation } => {
                let frames = match failed {
                    Some(err) => Err(err),
                    None => FrameInfo::parse_list(payload),
                };
                self.on_frames(generation, frames);
            }
            ReplyAction::MethodName { method, waiter } => {
                if let (None, Ok(name)) = (failed, parse_string(payload)) {
                    self.methods.set_name(method, name);
                }
                self.lookup_done(waiter);
            }
            ReplyAction::MethodDebugInfo { method, waiter } => {
                match (failed, DebugInfo::parse(payload, self.protocol)) {
                    (None, Ok(info)) => self.methods.set_debug_info(method, info),
                    // Methods without symbols answer with ABSENT_INFORMATION.
                    (Some(err), _) => tracing::debug!(target: "sdb.session", method, error = %err, "no debug info"),
                    (None, Err(err)) => warn_reply("METHOD.GET_DEBUG_INFO", &err),
                }
                self.lookup_done(waiter);
            }
            ReplyAction::BindTypes { bind } => {
                let result = match failed {
                    Some(err) => Err(err.to_string()),
                    None => parse_id_list(payload).map_err(|err| err.to_string()),
                };
                self.on_bind_types(bind, result);
            }
            ReplyAction::BindMethods { bind } => {
                let methods = match (failed, parse_id_list(payload)) {
                    (None, Ok(methods)) => methods,
                    (Some(err), _) | (None, Err(err)) => {
                        warn_reply("TYPE.GET_METHODS", &err);
                        Vec::new()
                    }
                };
                self.on_bind_methods(bind, methods);
            }
            ReplyAction::BindSet {
                bind,
                location,
                line,
            } => {
                let result = match failed {
                    Some(err) => Err(err.to_string()),
                    None => parse_request_id(payload).map_err(|err| err.to_string()),
                };
                self.on_bind_set(bind, location, line, result);
            }
            ReplyAction::EvalLocals(eval) => {
                let method = eval.frame.location.method;
                match failed.map_or_else(|| LocalsInfo::parse(payload), Err) {
                    Ok(locals) => {
                        self.methods.set_locals(method, locals);
                        self.evaluate_with_locals(eval);
                    }
                    Err(err) => fail_evaluation(eval.reply, "METHOD.GET_LOCALS_INFO", err),
                }
            }
            ReplyAction::EvalValue(eval) => {
                let value = failed
                    .map_or_else(|| Value::parse_list(payload), Err)
                    .map(|values| values.into_iter().next());
                match value {
                    Ok(Some(Value::String(object))) => {
                        self.send_command(Command::string_value(object), ReplyAction::EvalString(eval.reply));
                    }
                    Ok(Some(value)) => {
                        let _ = eval.reply.send(Ok(Ack::Value(value.display())));
                    }
                    Ok(None) => {
                        let message = format!("agent returned no value for `{}`", eval.name);
                        let _ = eval.reply.send(Err(SessionError::EvaluationFailed(message)));
                    }
                    Err(err) => fail_evaluation(eval.reply, "STACK_FRAME.GET_VALUES", err),
                }
            }
            ReplyAction::EvalString(reply) => {
                match failed.map_or_else(|| parse_string(payload), Err) {
                    Ok(value) => {
                        let _ = reply.send(Ok(Ack::Value(format!("{value:?}"))));
                    }
                    Err(err) => fail_evaluation(reply, "STRING_REF.GET_VALUE", err),
                }
            }
            ReplyAction::Shutdown => {
                if let Some(err) = failed {
                    warn_reply("shutdown", &err);
                }
                return Some(self.closed_reason(None));
            }
        }
        None
    }

    fn on_events(&mut self, payload: &[u8]) -> Option<TerminationReason> {
        let composite = match parse_composite_event(payload) {
            Ok(composite) => composite,
            Err(err) => return Some(TerminationReason::from(err)),
        };
        let policy = composite.suspend_policy;

        let mut stopped = false;
        let mut type_loaded = false;
        for event in composite.events {
            tracing::trace!(target: "sdb.session", kind = event.kind(), thread = event.thread(), "event");
            match event {
                AgentEvent::VmStart { thread, .. } => {
                    self.observe_thread(thread);
                    if policy != SUSPEND_POLICY_NONE {
                        // Startup setup owns the resume for this one.
                        stopped = true;
                        self.startup_suspended = true;
                        self.maybe_finish_setup();
                    }
                }
                AgentEvent::VmDeath { exit_code, .. } => {
                    tracing::info!(target: "sdb.session", exit_code, "target VM is shutting down");
                    self.exit_code = Some(exit_code);
                    return Some(self.closed_reason(None));
                }
                AgentEvent::ThreadStart { thread, .. } => self.observe_thread(thread),
                AgentEvent::ThreadDeath { thread, .. } => {
                    self.threads.remove(thread);
                }
                AgentEvent::TypeLoad { .. } => {
                    self.retry_unbound();
                    type_loaded = true;
                }
                AgentEvent::Breakpoint {
                    request_id,
                    thread,
                    location,
                } => {
                    let breakpoint = self.breakpoints.by_request_id(request_id);
                    self.clear_step(None);
                    stopped |= self.begin_stop(
                        thread,
                        Some(location),
                        StopReason::Breakpoint { breakpoint },
                        policy,
                    );
                }
                AgentEvent::Step {
                    request_id,
                    thread,
                    location,
                } => {
                    self.clear_step(Some(request_id));
                    stopped |= self.begin_stop(thread, Some(location), StopReason::Step, policy);
                }
                AgentEvent::Exception {
                    thread, exception, ..
                } => {
                    self.clear_step(None);
                    stopped |= self.begin_stop(thread, None, StopReason::Exception { exception }, policy);
                }
                AgentEvent::UserBreak { thread, .. } => {
                    self.clear_step(None);
                    stopped |= self.begin_stop(thread, None, StopReason::UserBreak, policy);
                }
                AgentEvent::UserLog {
                    category, message, ..
                } => {
                    let line = if category.is_empty() {
                        message
                    } else {
                        format!("[{category}] {message}")
                    };
                    self.notifier.send(Notification::OutputLine {
                        session: self.id,
                        source: OutputSource::Agent,
                        line,
                    });
                }
                AgentEvent::Other { .. } => {}
            }
        }

        // Nothing here stops the session, so do not leave the VM frozen.
        if !stopped && policy != SUSPEND_POLICY_NONE && self.setup_done && self.state == SessionState::Running {
            if type_loaded && !self.binds.is_empty() {
                self.resume_after_binds = true;
            } else {
                self.send_command(Command::resume(), ReplyAction::Resume);
            }
        }
        None
    }

    fn clear_step(&mut self, event_request: Option<i32>) {
        if let Some(request_id) = self.step_request.take().or(event_request) {
            self.send_ignored(Command::event_request_clear(EVENT_KIND_STEP, request_id));
        }
    }

    // Stops.

    /// Record a stop and fetch the thread's frames. The session is suspended
    /// from here on; `Stopped` and the active frame follow once the frames
    /// are resolved to methods and lines.
    fn begin_stop(
        &mut self,
        thread: ThreadId,
        location: Option<Location>,
        reason: StopReason,
        policy: u8,
    ) -> bool {
        if !self.state.is_live() {
            tracing::debug!(target: "sdb.session", state = %self.state, "ignoring stop outside a live session");
            return false;
        }
        self.observe_thread(thread);
        if policy == SUSPEND_POLICY_ALL {
            self.threads.suspend_all();
        } else {
            self.threads.suspend(thread);
        }

        self.active_frame = None;
        self.stopped_thread = Some(thread);
        self.set_state(SessionState::Suspended);

        self.stop_generation += 1;
        let generation = self.stop_generation;
        self.stop = Some(PendingStop {
            generation,
            thread,
            location,
            reason,
            frames: Vec::new(),
            outstanding: 0,
        });
        self.send_command(Command::frame_info(thread, 0, -1), ReplyAction::Frames { generation });
        true
    }

    fn on_paused(&mut self) {
        if self.state != SessionState::Running || self.stop.is_some() {
            return;
        }
        match self.threads.first() {
            Some(thread) => {
                self.begin_stop(thread, None, StopReason::Pause, SUSPEND_POLICY_ALL);
            }
            None => {
                self.threads.suspend_all();
                self.set_state(SessionState::Suspended);
            }
        }
    }

    fn on_frames(&mut self, generation: u64, frames: sdb_wire::Result<Vec<FrameInfo>>) {
        let Some(mut stop) = self.stop.take() else {
            return;
        };
        if stop.generation != generation {
            self.stop = Some(stop);
            return;
        }

        let mut frames = frames.unwrap_or_else(|err| {
            warn_reply("THREAD.GET_FRAME_INFO", &err);
            Vec::new()
        });
        if frames.is_empty() {
            if let Some(location) = stop.location {
                frames.push(FrameInfo {
                    frame_id: 0,
                    method: location.method,
                    il_offset: location.il_offset,
                    flags: 0,
                });
            }
        }

        let mut methods: Vec<MethodId> = frames.iter().map(|frame| frame.method).collect();
        methods.sort_unstable();
        methods.dedup();
        let waiter = Waiter::Stop(generation);
        for method in methods {
            if self.methods.name(method).is_none() {
                self.send_command(Command::method_name(method), ReplyAction::MethodName { method, waiter });
                stop.outstanding += 1;
            }
            if self.methods.debug_info(method).is_none() {
                self.send_command(Command::method_debug_info(method), ReplyAction::MethodDebugInfo { method, waiter });
                stop.outstanding += 1;
            }
        }
        stop.frames = frames;
        let ready = stop.outstanding == 0;
        self.stop = Some(stop);
        if ready {
            self.complete_stop();
        }
    }

    fn lookup_done(&mut self, waiter: Waiter) {
        match waiter {
            Waiter::Bind(bind) => self.bind_step_done(bind),
            Waiter::Stop(generation) => {
                let Some(stop) = self.stop.as_mut().filter(|stop| stop.generation == generation) else {
                    return;
                };
                stop.outstanding = stop.outstanding.saturating_sub(1);
                if stop.outstanding == 0 {
                    self.complete_stop();
                }
            }
        }
    }

    fn complete_stop(&mut self) {
        let Some(stop) = self.stop.take() else {
            return;
        };
        if self.state != SessionState::Suspended {
            return;
        }

        let frames: Vec<Frame> = stop.frames.iter().map(|info| self.methods.frame(info)).collect();
        let top = frames.first().cloned();
        self.threads.set_call_stack(stop.thread, frames);
        self.active_frame = top.clone().map(|frame| ActiveFrame {
            thread: stop.thread,
            frame,
        });

        tracing::info!(
            target: "sdb.session",
            thread = stop.thread,
            reason = ?stop.reason,
            method = top.as_ref().and_then(|f| f.method_name.as_deref()),
            line = top.as_ref().and_then(|f| f.line),
            "target stopped"
        );

        let breakpoint = match &stop.reason {
            StopReason::Breakpoint { breakpoint } => *breakpoint,
            _ => None,
        };
        self.notifier.send(Notification::Stopped {
            session: self.id,
            thread: stop.thread,
            reason: stop.reason,
            frame: top.clone(),
        });
        if let Some(breakpoint) = breakpoint {
            self.notifier.send(Notification::BreakpointHit {
                session: self.id,
                breakpoint,
                thread: stop.thread,
                frame: top,
            });
        }
    }
}

fn warn_reply(command: &str, err: &WireError) {
    tracing::warn!(target: "sdb.session", command, error = %err, "unusable reply");
}

fn fail_evaluation(reply: Reply<Ack>, command: &'static str, err: WireError) {
    let result = match err {
        WireError::CommandFailed { .. } => Err(SessionError::Command {
            command,
            source: err,
        }),
        other => Err(SessionError::EvaluationFailed(other.to_string())),
    };
    let _ = reply.send(result);
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}

async fn child_exit(process: &mut Option<TargetProcess>) -> Option<ExitStatus> {
    match process {
        Some(process) => process.wait().await.ok(),
        None => std::future::pending().await,
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
