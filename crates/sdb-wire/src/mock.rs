use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};

use crate::{
    codec::{Packet, PacketCodec, PacketReader, HANDSHAKE},
    protocol::*,
    Result,
};

pub const MAIN_THREAD_ID: ThreadId = 1;
pub const MAIN_TYPE_ID: TypeId = 100;
pub const PROCESS_METHOD_ID: MethodId = 200;
pub const READY_METHOD_ID: MethodId = 201;
pub const NAME_STRING_ID: ObjectId = 500;

/// An in-process stand-in for the Mono debugger agent embedded in Godot.
///
/// It implements just enough of the agent to drive a session end to end:
/// version negotiation, event requests, type/method lookup, frames, locals and
/// a deterministic stop model where every `VM.RESUME` either completes an
/// active step or hits the first registered breakpoint.
pub struct MockAgent {
    addr: SocketAddr,
    shutdown: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
    state: Arc<State>,
}

#[derive(Clone, Debug)]
pub struct MockMethod {
    pub id: MethodId,
    pub name: String,
    pub code_size: i32,
    /// `(il_offset, line)` sequence points.
    pub lines: Vec<(i64, u32)>,
}

#[derive(Clone, Debug)]
pub struct MockLocal {
    pub name: String,
    pub type_id: TypeId,
    pub value: Value,
}

#[derive(Clone, Debug)]
pub struct MockAgentConfig {
    /// Banner the agent sends during the handshake.
    pub handshake_banner: Vec<u8>,
    pub vm_name: String,
    pub protocol_major: i32,
    pub protocol_minor: i32,
    /// Path reported by `METHOD.GET_DEBUG_INFO`, as the build machine saw it.
    pub source_file: String,
    pub type_name: String,
    /// When false, source lookups find nothing until [`MockAgent::load_type`].
    pub type_loaded: bool,
    pub methods: Vec<MockMethod>,
    pub threads: Vec<(ThreadId, String)>,
    /// Locals of every method, addressed by position.
    pub locals: Vec<MockLocal>,
    pub strings: Vec<(ObjectId, String)>,
    /// When false, `VM.DISPOSE` is swallowed and the connection stays open,
    /// which lets tests exercise the detach deadline.
    pub reply_to_dispose: bool,
    /// Maximum number of breakpoint events emitted after `VM.RESUME`.
    pub breakpoint_hits: usize,
    pub emit_vm_start: bool,
    /// `(command_set, command)` pairs that are recorded but never answered.
    pub unanswered: Vec<(u8, u8)>,
}

impl Default for MockAgentConfig {
    fn default() -> Self {
        Self {
            handshake_banner: HANDSHAKE.to_vec(),
            vm_name: "Mono 6.12.0 (Godot)".to_string(),
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: 60,
            source_file: "/home/dev/game/Main.cs".to_string(),
            type_name: "Main".to_string(),
            type_loaded: true,
            methods: vec![
                MockMethod {
                    id: PROCESS_METHOD_ID,
                    name: "_Process".to_string(),
                    code_size: 20,
                    lines: vec![(0, 10), (4, 11), (8, 12), (12, 13), (16, 14)],
                },
                MockMethod {
                    id: READY_METHOD_ID,
                    name: "_Ready".to_string(),
                    code_size: 18,
                    lines: vec![(0, 20), (6, 21), (12, 22)],
                },
            ],
            threads: vec![(MAIN_THREAD_ID, "Main Thread".to_string())],
            locals: vec![
                MockLocal {
                    name: "delta".to_string(),
                    type_id: 1,
                    value: Value::Double(0.016),
                },
                MockLocal {
                    name: "name".to_string(),
                    type_id: 2,
                    value: Value::String(NAME_STRING_ID),
                },
                MockLocal {
                    name: "count".to_string(),
                    type_id: 3,
                    value: Value::Int(3),
                },
            ],
            strings: vec![(NAME_STRING_ID, "player".to_string())],
            reply_to_dispose: true,
            breakpoint_hits: usize::MAX,
            emit_vm_start: true,
            unanswered: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub command_set: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl RecordedCommand {
    pub fn name(&self) -> &'static str {
        command_name(self.command_set, self.command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockEventRequest {
    pub event_kind: u8,
    pub suspend_policy: u8,
    pub request_id: i32,
    pub modifiers: Vec<EventModifier>,
}

impl MockEventRequest {
    pub fn location(&self) -> Option<Location> {
        self.modifiers.iter().find_map(|m| match m {
            EventModifier::LocationOnly { location } => Some(*location),
            _ => None,
        })
    }
}

#[derive(Debug)]
enum Control {
    Event {
        suspend_policy: u8,
        events: Vec<AgentEvent>,
    },
    Raw(Vec<u8>),
    LoadType,
    Disconnect,
}

enum Endpoint {
    Listen(TcpListener),
    ConnectBack(SocketAddr),
}

impl MockAgent {
    /// Listen on an ephemeral localhost port, as a target started with
    /// `server=y` would.
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockAgentConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockAgentConfig) -> std::io::Result<Self> {
        let listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = listener.local_addr()?;
        Ok(Self::start(addr, Endpoint::Listen(listener), config))
    }

    /// Connect to a debugger listening at `addr`, as a target started with
    /// `server=n` would. Connecting is retried for a few seconds so the
    /// debugger side may bind after this is called.
    pub fn connect_back(addr: SocketAddr, config: MockAgentConfig) -> Self {
        Self::start(addr, Endpoint::ConnectBack(addr), config)
    }

    fn start(addr: SocketAddr, endpoint: Endpoint, config: MockAgentConfig) -> Self {
        let shutdown = CancellationToken::new();
        let (control, control_rx) = mpsc::unbounded_channel();
        let state = Arc::new(State::new(config));

        let task_shutdown = shutdown.clone();
        let task_state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = run(endpoint, &task_state, control_rx, task_shutdown).await {
                tracing::debug!(target: "sdb.wire", error = %err, "mock agent connection ended");
            }
            task_state.closed.send_replace(true);
        });

        Self {
            addr,
            shutdown,
            control,
            state,
        }
    }

    /// The address the agent listens on, or connects back to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn emit_event(&self, suspend_policy: u8, events: Vec<AgentEvent>) {
        let _ = self.control.send(Control::Event {
            suspend_policy,
            events,
        });
    }

    /// Write bytes straight onto the socket, bypassing framing.
    pub fn emit_raw(&self, bytes: Vec<u8>) {
        let _ = self.control.send(Control::Raw(bytes));
    }

    /// Make the configured type visible to source lookups and emit `TYPE_LOAD`
    /// if the debugger asked for it.
    pub fn load_type(&self) {
        let _ = self.control.send(Control::LoadType);
    }

    pub fn disconnect(&self) {
        let _ = self.control.send(Control::Disconnect);
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        lock(&self.state.commands).clone()
    }

    pub fn command_count(&self, command_set: u8, command: u8) -> usize {
        lock(&self.state.commands)
            .iter()
            .filter(|c| c.command_set == command_set && c.command == command)
            .count()
    }

    /// Poll until at least `count` matching commands were received.
    pub async fn wait_for_command(
        &self,
        command_set: u8,
        command: u8,
        count: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.command_count(command_set, command) >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Every `EVENT_REQUEST.SET` received, in order, including cleared ones.
    pub fn event_requests(&self) -> Vec<MockEventRequest> {
        lock(&self.state.event_requests).clone()
    }

    pub fn breakpoint_requests(&self) -> Vec<MockEventRequest> {
        self.event_requests()
            .into_iter()
            .filter(|r| r.event_kind == EVENT_KIND_BREAKPOINT)
            .collect()
    }

    pub fn cleared_requests(&self) -> Vec<(u8, i32)> {
        lock(&self.state.cleared).clone()
    }

    pub fn protocol_version(&self) -> Option<(i32, i32)> {
        *lock(&self.state.protocol_version)
    }

    pub fn resume_calls(&self) -> u32 {
        self.state.resume_calls.load(Ordering::Relaxed)
    }

    pub fn suspend_calls(&self) -> u32 {
        self.state.suspend_calls.load(Ordering::Relaxed)
    }

    pub fn dispose_calls(&self) -> u32 {
        self.state.dispose_calls.load(Ordering::Relaxed)
    }

    /// Wait for the debugger connection to close. Returns `false` on timeout.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut rx = self.state.closed.subscribe();
        let closed = tokio::time::timeout(timeout, rx.wait_for(|closed| *closed))
            .await
            .is_ok();
        closed
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct State {
    config: MockAgentConfig,
    next_request_id: AtomicI32,
    next_packet_id: AtomicU32,
    resume_calls: AtomicU32,
    suspend_calls: AtomicU32,
    dispose_calls: AtomicU32,
    breakpoint_hits_remaining: AtomicUsize,
    type_loaded: AtomicBool,
    commands: Mutex<Vec<RecordedCommand>>,
    event_requests: Mutex<Vec<MockEventRequest>>,
    cleared: Mutex<Vec<(u8, i32)>>,
    protocol_version: Mutex<Option<(i32, i32)>>,
    current: Mutex<(ThreadId, Location)>,
    closed: watch::Sender<bool>,
}

/// A test that panicked while holding a lock must not wedge the agent for
/// the rest of the suite.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl State {
    fn new(config: MockAgentConfig) -> Self {
        let start = config
            .methods
            .first()
            .map(|m| Location {
                method: m.id,
                il_offset: m.lines.first().map_or(0, |(il, _)| *il),
            })
            .unwrap_or(Location {
                method: 0,
                il_offset: 0,
            });
        let thread = config.threads.first().map_or(MAIN_THREAD_ID, |(id, _)| *id);
        let (closed, _) = watch::channel(false);

        Self {
            next_request_id: AtomicI32::new(0),
            next_packet_id: AtomicU32::new(0),
            resume_calls: AtomicU32::new(0),
            suspend_calls: AtomicU32::new(0),
            dispose_calls: AtomicU32::new(0),
            breakpoint_hits_remaining: AtomicUsize::new(config.breakpoint_hits),
            type_loaded: AtomicBool::new(config.type_loaded),
            commands: Mutex::new(Vec::new()),
            event_requests: Mutex::new(Vec::new()),
            cleared: Mutex::new(Vec::new()),
            protocol_version: Mutex::new(None),
            current: Mutex::new((thread, start)),
            closed,
            config,
        }
    }

    fn alloc_request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn alloc_packet_id(&self) -> u32 {
        self.next_packet_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn take_breakpoint_hit(&self) -> bool {
        self.breakpoint_hits_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    fn active_requests(&self, kind: u8) -> Vec<MockEventRequest> {
        let cleared = lock(&self.cleared).clone();
        lock(&self.event_requests)
            .iter()
            .filter(|r| r.event_kind == kind && !cleared.contains(&(kind, r.request_id)))
            .cloned()
            .collect()
    }

    fn method(&self, id: MethodId) -> Option<&MockMethod> {
        self.config.methods.iter().find(|m| m.id == id)
    }

    fn source_matches(&self, file: &str) -> bool {
        let info = DebugInfo {
            code_size: 0,
            source_files: vec![self.config.source_file.clone()],
            lines: Vec::new(),
        };
        info.matches_file(file)
    }

    /// Layout for version-dependent replies. Like the real agent, a client
    /// that never sent `VM.SET_PROTOCOL_VERSION` gets the oldest layout.
    fn reply_version(&self) -> ProtocolVersion {
        let own = ProtocolVersion::new(self.config.protocol_major, self.config.protocol_minor);
        lock(&self.protocol_version)
            .map_or(ProtocolVersion::new(own.major, 0), |(major, minor)| {
                ProtocolVersion::new(major, minor)
            })
            .min(own)
    }

    fn frames(&self, thread: ThreadId) -> Vec<FrameInfo> {
        let (current_thread, location) = *lock(&self.current);
        if thread != current_thread {
            return Vec::new();
        }
        let mut frames = vec![FrameInfo {
            frame_id: 1,
            method: location.method,
            il_offset: location.il_offset,
            flags: 0,
        }];
        if let Some(caller) = self.config.methods.iter().find(|m| m.id != location.method) {
            frames.push(FrameInfo {
                frame_id: 2,
                method: caller.id,
                il_offset: caller.lines.first().map_or(0, |(il, _)| *il),
                flags: 0,
            });
        }
        frames
    }

    /// Next sequence point after the current location, or the current one at
    /// the end of the method.
    fn step_target(&self) -> Location {
        let (_, location) = *lock(&self.current);
        let next = self.method(location.method).and_then(|m| {
            m.lines
                .iter()
                .map(|(il, _)| *il)
                .filter(|il| *il > location.il_offset)
                .min()
        });
        Location {
            method: location.method,
            il_offset: next.unwrap_or(location.il_offset),
        }
    }

    fn move_to(&self, thread: ThreadId, location: Location) {
        *lock(&self.current) = (thread, location);
    }
}

#[derive(Default)]
struct Response {
    reply: Option<(u16, Vec<u8>)>,
    events: Vec<(u8, Vec<AgentEvent>)>,
    close: bool,
}

impl Response {
    fn ok(payload: Vec<u8>) -> Self {
        Self {
            reply: Some((ERROR_NONE, payload)),
            ..Self::default()
        }
    }

    fn error(code: u16) -> Self {
        Self {
            reply: Some((code, Vec::new())),
            ..Self::default()
        }
    }
}

async fn open(endpoint: Endpoint) -> std::io::Result<TcpStream> {
    match endpoint {
        Endpoint::Listen(listener) => Ok(listener.accept().await?.0),
        Endpoint::ConnectBack(addr) => {
            let mut attempts = 0;
            loop {
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(err) if attempts >= 200 => return Err(err),
                    Err(_) => {
                        attempts += 1;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                }
            }
        }
    }
}

async fn run(
    endpoint: Endpoint,
    state: &State,
    mut control: mpsc::UnboundedReceiver<Control>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut stream = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        res = open(endpoint) => res?,
    };

    stream.write_all(&state.config.handshake_banner).await?;
    let mut banner = [0u8; HANDSHAKE.len()];
    stream.read_exact(&mut banner).await?;
    if banner != *HANDSHAKE {
        return Ok(());
    }

    let (read, write) = stream.into_split();
    let mut packets = FramedRead::new(read, PacketCodec::default());
    let mut sink = FramedWrite::new(write, PacketCodec::default());

    if state.config.emit_vm_start {
        let (thread, _) = *lock(&state.current);
        let event = AgentEvent::VmStart {
            request_id: 0,
            thread,
            domain: 1,
        };
        send_events(&mut sink, state, SUSPEND_POLICY_ALL, vec![event]).await?;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            ctrl = control.recv() => match ctrl {
                None | Some(Control::Disconnect) => return Ok(()),
                Some(Control::Event { suspend_policy, events }) => {
                    send_events(&mut sink, state, suspend_policy, events).await?;
                }
                Some(Control::Raw(bytes)) => {
                    sink.flush().await?;
                    sink.get_mut().write_all(&bytes).await?;
                }
                Some(Control::LoadType) => {
                    state.type_loaded.store(true, Ordering::Relaxed);
                    let (thread, _) = *lock(&state.current);
                    for request in state.active_requests(EVENT_KIND_TYPE_LOAD) {
                        let event = AgentEvent::TypeLoad {
                            request_id: request.request_id,
                            thread,
                            type_id: MAIN_TYPE_ID,
                        };
                        send_events(&mut sink, state, request.suspend_policy, vec![event]).await?;
                    }
                }
            },
            packet = packets.next() => {
                let Some(packet) = packet else {
                    return Ok(());
                };
                // The mock only expects commands from the debugger.
                let Packet::Command { id, command_set, command, payload } = packet? else {
                    continue;
                };
                lock(&state.commands).push(RecordedCommand {
                    command_set,
                    command,
                    payload: payload.clone(),
                });

                if state.config.unanswered.contains(&(command_set, command)) {
                    continue;
                }
                let response = handle_command(state, command_set, command, &payload);
                if let Some((error_code, payload)) = response.reply {
                    sink.send(Packet::Reply { id, error_code, payload }).await?;
                }
                for (suspend_policy, events) in response.events {
                    send_events(&mut sink, state, suspend_policy, events).await?;
                }
                if response.close {
                    return Ok(());
                }
            }
        }
    }
}

async fn send_events(
    sink: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, PacketCodec>,
    state: &State,
    suspend_policy: u8,
    events: Vec<AgentEvent>,
) -> Result<()> {
    for event in &events {
        if let AgentEvent::Breakpoint {
            thread, location, ..
        }
        | AgentEvent::Step {
            thread, location, ..
        } = event
        {
            state.move_to(*thread, *location);
        }
    }
    let payload = encode_composite_event(suspend_policy, &events);
    sink.send(Packet::Command {
        id: state.alloc_packet_id(),
        command_set: CMD_SET_EVENT,
        command: CMD_COMPOSITE,
        payload,
    })
    .await
}

fn handle_command(state: &State, command_set: u8, command: u8, payload: &[u8]) -> Response {
    match try_handle_command(state, command_set, command, payload) {
        Ok(response) => response,
        Err(_) => Response::error(ERROR_INVALID_ARGUMENT),
    }
}

fn try_handle_command(
    state: &State,
    command_set: u8,
    command: u8,
    payload: &[u8],
) -> Result<Response> {
    let config = &state.config;
    let mut r = PacketReader::new(payload);

    let response = match (command_set, command) {
        (CMD_SET_VM, CMD_VM_VERSION) => Response::ok(
            VersionInfo {
                vm_name: config.vm_name.clone(),
                major: config.protocol_major,
                minor: config.protocol_minor,
            }
            .encode(),
        ),
        (CMD_SET_VM, CMD_VM_SET_PROTOCOL_VERSION) => {
            let major = r.read_i32()?;
            let minor = r.read_i32()?;
            *lock(&state.protocol_version) = Some((major, minor));
            Response::ok(Vec::new())
        }
        (CMD_SET_VM, CMD_VM_ALL_THREADS) => {
            let ids: Vec<_> = config.threads.iter().map(|(id, _)| *id).collect();
            Response::ok(encode_id_list(&ids))
        }
        (CMD_SET_VM, CMD_VM_SUSPEND) => {
            state.suspend_calls.fetch_add(1, Ordering::Relaxed);
            Response::ok(Vec::new())
        }
        (CMD_SET_VM, CMD_VM_RESUME) => {
            state.resume_calls.fetch_add(1, Ordering::Relaxed);
            let mut response = Response::ok(Vec::new());
            if let Some(step) = state.active_requests(EVENT_KIND_STEP).into_iter().next() {
                let thread = step
                    .modifiers
                    .iter()
                    .find_map(|m| match m {
                        EventModifier::Step { thread, .. } => Some(*thread),
                        _ => None,
                    })
                    .unwrap_or(MAIN_THREAD_ID);
                let event = AgentEvent::Step {
                    request_id: step.request_id,
                    thread,
                    location: state.step_target(),
                };
                response.events.push((step.suspend_policy, vec![event]));
            } else if let Some((request, location)) = state
                .active_requests(EVENT_KIND_BREAKPOINT)
                .into_iter()
                .find_map(|r| r.location().map(|loc| (r, loc)))
            {
                if state.take_breakpoint_hit() {
                    let (thread, _) = *lock(&state.current);
                    let event = AgentEvent::Breakpoint {
                        request_id: request.request_id,
                        thread,
                        location,
                    };
                    response.events.push((request.suspend_policy, vec![event]));
                }
            }
            response
        }
        (CMD_SET_VM, CMD_VM_EXIT) => {
            let exit_code = r.read_i32()?;
            Response {
                reply: Some((ERROR_NONE, Vec::new())),
                events: vec![(
                    SUSPEND_POLICY_NONE,
                    vec![AgentEvent::VmDeath {
                        request_id: 0,
                        exit_code,
                    }],
                )],
                close: true,
            }
        }
        (CMD_SET_VM, CMD_VM_DISPOSE) => {
            state.dispose_calls.fetch_add(1, Ordering::Relaxed);
            if config.reply_to_dispose {
                Response {
                    reply: Some((ERROR_NONE, Vec::new())),
                    events: Vec::new(),
                    close: true,
                }
            } else {
                Response::default()
            }
        }
        (CMD_SET_VM, CMD_VM_GET_TYPES_FOR_SOURCE_FILE) => {
            let file = r.read_string()?;
            let loaded = state.type_loaded.load(Ordering::Relaxed);
            let ids = if loaded && state.source_matches(&file) {
                vec![MAIN_TYPE_ID]
            } else {
                Vec::new()
            };
            Response::ok(encode_id_list(&ids))
        }
        (CMD_SET_VM, CMD_VM_GET_TYPES) => {
            let name = r.read_string()?;
            let ignore_case = r.read_bool()?;
            let matches = if ignore_case {
                name.eq_ignore_ascii_case(&config.type_name)
            } else {
                name == config.type_name
            };
            let ids = if matches && state.type_loaded.load(Ordering::Relaxed) {
                vec![MAIN_TYPE_ID]
            } else {
                Vec::new()
            };
            Response::ok(encode_id_list(&ids))
        }
        (CMD_SET_TYPE, CMD_TYPE_GET_METHODS) => {
            if r.read_id()? != MAIN_TYPE_ID {
                return Ok(Response::error(ERROR_INVALID_OBJECT));
            }
            let ids: Vec<_> = config.methods.iter().map(|m| m.id).collect();
            Response::ok(encode_id_list(&ids))
        }
        (CMD_SET_METHOD, CMD_METHOD_GET_NAME) => match state.method(r.read_id()?) {
            Some(method) => Response::ok(encode_string(&method.name)),
            None => Response::error(ERROR_INVALID_OBJECT),
        },
        (CMD_SET_METHOD, CMD_METHOD_GET_DEBUG_INFO) => match state.method(r.read_id()?) {
            Some(method) => Response::ok(
                DebugInfo {
                    code_size: method.code_size,
                    source_files: vec![config.source_file.clone()],
                    lines: method
                        .lines
                        .iter()
                        .map(|(il_offset, line)| LineEntry {
                            il_offset: *il_offset,
                            line: *line,
                            source: Some(0),
                        })
                        .collect(),
                }
                .encode(state.reply_version()),
            ),
            None => Response::error(ERROR_INVALID_OBJECT),
        },
        (CMD_SET_METHOD, CMD_METHOD_GET_LOCALS_INFO) => match state.method(r.read_id()?) {
            Some(method) => Response::ok(
                LocalsInfo {
                    locals: config
                        .locals
                        .iter()
                        .enumerate()
                        .map(|(index, local)| LocalVariable {
                            index: index as i32,
                            name: local.name.clone(),
                            type_id: local.type_id,
                            live_range: (0, method.code_size),
                        })
                        .collect(),
                }
                .encode(),
            ),
            None => Response::error(ERROR_INVALID_OBJECT),
        },
        (CMD_SET_THREAD, CMD_THREAD_GET_NAME) => {
            let thread = r.read_id()?;
            match config.threads.iter().find(|(id, _)| *id == thread) {
                Some((_, name)) => Response::ok(encode_string(name)),
                None => Response::error(ERROR_INVALID_OBJECT),
            }
        }
        (CMD_SET_THREAD, CMD_THREAD_GET_FRAME_INFO) => {
            let thread = r.read_id()?;
            Response::ok(FrameInfo::encode_list(&state.frames(thread)))
        }
        (CMD_SET_STACK_FRAME, CMD_STACK_FRAME_GET_VALUES) => {
            let _thread = r.read_id()?;
            let _frame = r.read_id()?;
            let count = r.read_count(4)?;
            let mut w = crate::codec::PacketWriter::new();
            for _ in 0..count {
                let pos = r.read_i32()?;
                let Some(local) = usize::try_from(pos).ok().and_then(|p| config.locals.get(p))
                else {
                    return Ok(Response::error(ERROR_INVALID_ARGUMENT));
                };
                local.value.write(&mut w);
            }
            Response::ok(w.into_vec())
        }
        (CMD_SET_STRING_REF, CMD_STRING_REF_GET_VALUE) => {
            let object = r.read_id()?;
            match config.strings.iter().find(|(id, _)| *id == object) {
                Some((_, value)) => Response::ok(encode_string(value)),
                None => Response::error(ERROR_INVALID_OBJECT),
            }
        }
        (CMD_SET_EVENT_REQUEST, CMD_EVENT_REQUEST_SET) => {
            let event_kind = r.read_u8()?;
            let suspend_policy = r.read_u8()?;
            let count = r.read_u8()?;
            let mut modifiers = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                modifiers.push(EventModifier::decode(&mut r)?);
            }
            let request_id = state.alloc_request_id();
            lock(&state.event_requests).push(MockEventRequest {
                event_kind,
                suspend_policy,
                request_id,
                modifiers,
            });
            let mut w = crate::codec::PacketWriter::new();
            w.write_i32(request_id);
            Response::ok(w.into_vec())
        }
        (CMD_SET_EVENT_REQUEST, CMD_EVENT_REQUEST_CLEAR) => {
            let kind = r.read_u8()?;
            let request_id = r.read_i32()?;
            lock(&state.cleared).push((kind, request_id));
            Response::ok(Vec::new())
        }
        _ => Response::error(ERROR_NOT_IMPLEMENTED),
    };
    Ok(response)
}
