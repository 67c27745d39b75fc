//! Typed commands, replies and events of the Mono soft-debugger protocol.
//!
//! Only the subset the session core drives is modelled. Reply layouts follow
//! what the agent sends for protocol version 2.x.

pub use crate::codec::{CMD_COMPOSITE, CMD_SET_EVENT};

use crate::codec::{Packet, PacketReader, PacketWriter};
use crate::{Result, WireError};

pub type ThreadId = i32;
pub type MethodId = i32;
pub type TypeId = i32;
pub type ObjectId = i32;
pub type FrameId = i32;

pub const PROTOCOL_MAJOR: i32 = 2;
pub const PROTOCOL_MINOR: i32 = 30;

/// A protocol version as exchanged in `VM.VERSION` and
/// `VM.SET_PROTOCOL_VERSION`. Several reply layouts grow fields with the
/// minor version, so parsers take the version both sides agreed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: i32,
    pub minor: i32,
}

impl ProtocolVersion {
    /// The newest version this crate understands.
    pub const SUPPORTED: Self = Self::new(PROTOCOL_MAJOR, PROTOCOL_MINOR);

    pub const fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    pub fn at_least(self, major: i32, minor: i32) -> bool {
        self >= Self::new(major, minor)
    }

    /// The layout in effect once we ask for [`Self::SUPPORTED`]: an older
    /// agent keeps speaking its own version.
    pub fn negotiate(agent: Self) -> Self {
        agent.min(Self::SUPPORTED)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::SUPPORTED
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub const CMD_SET_VM: u8 = 1;
pub const CMD_SET_OBJECT_REF: u8 = 9;
pub const CMD_SET_STRING_REF: u8 = 10;
pub const CMD_SET_THREAD: u8 = 11;
pub const CMD_SET_EVENT_REQUEST: u8 = 15;
pub const CMD_SET_STACK_FRAME: u8 = 16;
pub const CMD_SET_METHOD: u8 = 22;
pub const CMD_SET_TYPE: u8 = 23;

pub const CMD_VM_VERSION: u8 = 1;
pub const CMD_VM_ALL_THREADS: u8 = 2;
pub const CMD_VM_SUSPEND: u8 = 3;
pub const CMD_VM_RESUME: u8 = 4;
pub const CMD_VM_EXIT: u8 = 5;
pub const CMD_VM_DISPOSE: u8 = 6;
pub const CMD_VM_SET_PROTOCOL_VERSION: u8 = 8;
pub const CMD_VM_GET_TYPES_FOR_SOURCE_FILE: u8 = 11;
pub const CMD_VM_GET_TYPES: u8 = 12;

pub const CMD_THREAD_GET_FRAME_INFO: u8 = 1;
pub const CMD_THREAD_GET_NAME: u8 = 2;

pub const CMD_EVENT_REQUEST_SET: u8 = 1;
pub const CMD_EVENT_REQUEST_CLEAR: u8 = 2;

pub const CMD_STACK_FRAME_GET_VALUES: u8 = 1;

pub const CMD_METHOD_GET_NAME: u8 = 1;
pub const CMD_METHOD_GET_DEBUG_INFO: u8 = 3;
pub const CMD_METHOD_GET_LOCALS_INFO: u8 = 5;

pub const CMD_TYPE_GET_METHODS: u8 = 2;

pub const CMD_STRING_REF_GET_VALUE: u8 = 1;

pub const EVENT_KIND_VM_START: u8 = 0;
pub const EVENT_KIND_VM_DEATH: u8 = 1;
pub const EVENT_KIND_THREAD_START: u8 = 2;
pub const EVENT_KIND_THREAD_DEATH: u8 = 3;
pub const EVENT_KIND_APPDOMAIN_CREATE: u8 = 4;
pub const EVENT_KIND_APPDOMAIN_UNLOAD: u8 = 5;
pub const EVENT_KIND_METHOD_ENTRY: u8 = 6;
pub const EVENT_KIND_METHOD_EXIT: u8 = 7;
pub const EVENT_KIND_ASSEMBLY_LOAD: u8 = 8;
pub const EVENT_KIND_ASSEMBLY_UNLOAD: u8 = 9;
pub const EVENT_KIND_BREAKPOINT: u8 = 10;
pub const EVENT_KIND_STEP: u8 = 11;
pub const EVENT_KIND_TYPE_LOAD: u8 = 12;
pub const EVENT_KIND_EXCEPTION: u8 = 13;
pub const EVENT_KIND_KEEPALIVE: u8 = 14;
pub const EVENT_KIND_USER_BREAK: u8 = 15;
pub const EVENT_KIND_USER_LOG: u8 = 16;

pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

pub const MODIFIER_COUNT: u8 = 1;
pub const MODIFIER_THREAD_ONLY: u8 = 3;
pub const MODIFIER_LOCATION_ONLY: u8 = 7;
pub const MODIFIER_EXCEPTION_ONLY: u8 = 8;
pub const MODIFIER_STEP: u8 = 10;

pub const STEP_DEPTH_INTO: i32 = 0;
pub const STEP_DEPTH_OVER: i32 = 1;
pub const STEP_DEPTH_OUT: i32 = 2;

pub const STEP_SIZE_MIN: i32 = 0;
pub const STEP_SIZE_LINE: i32 = 1;

pub const ERROR_NONE: u16 = 0;
pub const ERROR_INVALID_OBJECT: u16 = 20;
pub const ERROR_INVALID_FIELDID: u16 = 25;
pub const ERROR_INVALID_FRAMEID: u16 = 30;
pub const ERROR_NOT_IMPLEMENTED: u16 = 100;
pub const ERROR_NOT_SUSPENDED: u16 = 101;
pub const ERROR_INVALID_ARGUMENT: u16 = 102;
pub const ERROR_UNLOADED: u16 = 103;
pub const ERROR_NO_INVOCATION: u16 = 104;
pub const ERROR_ABSENT_INFORMATION: u16 = 105;
pub const ERROR_NO_SEQ_POINT_AT_IL_OFFSET: u16 = 106;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub method: MethodId,
    pub il_offset: i64,
}

/// An outgoing command, not yet assigned a correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command_set: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(command_set: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            command_set,
            command,
            payload,
        }
    }

    fn build(command_set: u8, command: u8, f: impl FnOnce(&mut PacketWriter)) -> Self {
        let mut w = PacketWriter::new();
        f(&mut w);
        Self::new(command_set, command, w.into_vec())
    }

    pub fn into_packet(self, id: u32) -> Packet {
        Packet::Command {
            id,
            command_set: self.command_set,
            command: self.command,
            payload: self.payload,
        }
    }

    /// Short label used in logs, e.g. `VM.RESUME`.
    pub fn name(&self) -> &'static str {
        command_name(self.command_set, self.command)
    }

    pub fn version() -> Self {
        Self::new(CMD_SET_VM, CMD_VM_VERSION, Vec::new())
    }

    pub fn set_protocol_version(major: i32, minor: i32) -> Self {
        Self::build(CMD_SET_VM, CMD_VM_SET_PROTOCOL_VERSION, |w| {
            w.write_i32(major);
            w.write_i32(minor);
        })
    }

    pub fn all_threads() -> Self {
        Self::new(CMD_SET_VM, CMD_VM_ALL_THREADS, Vec::new())
    }

    pub fn suspend() -> Self {
        Self::new(CMD_SET_VM, CMD_VM_SUSPEND, Vec::new())
    }

    pub fn resume() -> Self {
        Self::new(CMD_SET_VM, CMD_VM_RESUME, Vec::new())
    }

    pub fn exit(exit_code: i32) -> Self {
        Self::build(CMD_SET_VM, CMD_VM_EXIT, |w| w.write_i32(exit_code))
    }

    pub fn dispose() -> Self {
        Self::new(CMD_SET_VM, CMD_VM_DISPOSE, Vec::new())
    }

    pub fn types_for_source_file(file: &str, ignore_case: bool) -> Self {
        Self::build(CMD_SET_VM, CMD_VM_GET_TYPES_FOR_SOURCE_FILE, |w| {
            w.write_string(file);
            w.write_bool(ignore_case);
        })
    }

    pub fn types(name: &str, ignore_case: bool) -> Self {
        Self::build(CMD_SET_VM, CMD_VM_GET_TYPES, |w| {
            w.write_string(name);
            w.write_bool(ignore_case);
        })
    }

    pub fn type_methods(type_id: TypeId) -> Self {
        Self::build(CMD_SET_TYPE, CMD_TYPE_GET_METHODS, |w| w.write_id(type_id))
    }

    pub fn method_name(method: MethodId) -> Self {
        Self::build(CMD_SET_METHOD, CMD_METHOD_GET_NAME, |w| w.write_id(method))
    }

    pub fn method_debug_info(method: MethodId) -> Self {
        Self::build(CMD_SET_METHOD, CMD_METHOD_GET_DEBUG_INFO, |w| w.write_id(method))
    }

    pub fn method_locals_info(method: MethodId) -> Self {
        Self::build(CMD_SET_METHOD, CMD_METHOD_GET_LOCALS_INFO, |w| w.write_id(method))
    }

    pub fn thread_name(thread: ThreadId) -> Self {
        Self::build(CMD_SET_THREAD, CMD_THREAD_GET_NAME, |w| w.write_id(thread))
    }

    /// `length == -1` asks for every frame from `start`.
    pub fn frame_info(thread: ThreadId, start: i32, length: i32) -> Self {
        Self::build(CMD_SET_THREAD, CMD_THREAD_GET_FRAME_INFO, |w| {
            w.write_id(thread);
            w.write_i32(start);
            w.write_i32(length);
        })
    }

    pub fn frame_values(thread: ThreadId, frame: FrameId, positions: &[i32]) -> Self {
        Self::build(CMD_SET_STACK_FRAME, CMD_STACK_FRAME_GET_VALUES, |w| {
            w.write_id(thread);
            w.write_id(frame);
            w.write_i32(positions.len() as i32);
            for pos in positions {
                w.write_i32(*pos);
            }
        })
    }

    pub fn string_value(object: ObjectId) -> Self {
        Self::build(CMD_SET_STRING_REF, CMD_STRING_REF_GET_VALUE, |w| w.write_id(object))
    }

    pub fn event_request_set(kind: u8, suspend_policy: u8, modifiers: Vec<EventModifier>) -> Self {
        Self::build(CMD_SET_EVENT_REQUEST, CMD_EVENT_REQUEST_SET, |w| {
            w.write_u8(kind);
            w.write_u8(suspend_policy);
            w.write_u8(modifiers.len() as u8);
            for modifier in modifiers {
                modifier.encode(w);
            }
        })
    }

    pub fn event_request_clear(kind: u8, request_id: i32) -> Self {
        Self::build(CMD_SET_EVENT_REQUEST, CMD_EVENT_REQUEST_CLEAR, |w| {
            w.write_u8(kind);
            w.write_i32(request_id);
        })
    }
}

pub fn command_name(command_set: u8, command: u8) -> &'static str {
    match (command_set, command) {
        (CMD_SET_VM, CMD_VM_VERSION) => "VM.VERSION",
        (CMD_SET_VM, CMD_VM_ALL_THREADS) => "VM.ALL_THREADS",
        (CMD_SET_VM, CMD_VM_SUSPEND) => "VM.SUSPEND",
        (CMD_SET_VM, CMD_VM_RESUME) => "VM.RESUME",
        (CMD_SET_VM, CMD_VM_EXIT) => "VM.EXIT",
        (CMD_SET_VM, CMD_VM_DISPOSE) => "VM.DISPOSE",
        (CMD_SET_VM, CMD_VM_SET_PROTOCOL_VERSION) => "VM.SET_PROTOCOL_VERSION",
        (CMD_SET_VM, CMD_VM_GET_TYPES_FOR_SOURCE_FILE) => "VM.GET_TYPES_FOR_SOURCE_FILE",
        (CMD_SET_VM, CMD_VM_GET_TYPES) => "VM.GET_TYPES",
        (CMD_SET_THREAD, CMD_THREAD_GET_FRAME_INFO) => "THREAD.GET_FRAME_INFO",
        (CMD_SET_THREAD, CMD_THREAD_GET_NAME) => "THREAD.GET_NAME",
        (CMD_SET_EVENT_REQUEST, CMD_EVENT_REQUEST_SET) => "EVENT_REQUEST.SET",
        (CMD_SET_EVENT_REQUEST, CMD_EVENT_REQUEST_CLEAR) => "EVENT_REQUEST.CLEAR",
        (CMD_SET_STACK_FRAME, CMD_STACK_FRAME_GET_VALUES) => "STACK_FRAME.GET_VALUES",
        (CMD_SET_METHOD, CMD_METHOD_GET_NAME) => "METHOD.GET_NAME",
        (CMD_SET_METHOD, CMD_METHOD_GET_DEBUG_INFO) => "METHOD.GET_DEBUG_INFO",
        (CMD_SET_METHOD, CMD_METHOD_GET_LOCALS_INFO) => "METHOD.GET_LOCALS_INFO",
        (CMD_SET_TYPE, CMD_TYPE_GET_METHODS) => "TYPE.GET_METHODS",
        (CMD_SET_STRING_REF, CMD_STRING_REF_GET_VALUE) => "STRING_REF.GET_VALUE",
        (CMD_SET_EVENT, CMD_COMPOSITE) => "EVENT.COMPOSITE",
        _ => "UNKNOWN",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventModifier {
    Count {
        count: i32,
    },
    ThreadOnly {
        thread: ThreadId,
    },
    LocationOnly {
        location: Location,
    },
    ExceptionOnly {
        /// `0` matches every exception type.
        type_id: TypeId,
        caught: bool,
        uncaught: bool,
        subclasses: bool,
    },
    Step {
        thread: ThreadId,
        size: i32,
        depth: i32,
        filter: i32,
    },
}

impl EventModifier {
    pub(crate) fn encode(self, w: &mut PacketWriter) {
        match self {
            EventModifier::Count { count } => {
                w.write_u8(MODIFIER_COUNT);
                w.write_i32(count);
            }
            EventModifier::ThreadOnly { thread } => {
                w.write_u8(MODIFIER_THREAD_ONLY);
                w.write_id(thread);
            }
            EventModifier::LocationOnly { location } => {
                w.write_u8(MODIFIER_LOCATION_ONLY);
                w.write_id(location.method);
                w.write_i64(location.il_offset);
            }
            EventModifier::ExceptionOnly {
                type_id,
                caught,
                uncaught,
                subclasses,
            } => {
                w.write_u8(MODIFIER_EXCEPTION_ONLY);
                w.write_id(type_id);
                w.write_bool(caught);
                w.write_bool(uncaught);
                w.write_bool(subclasses);
            }
            EventModifier::Step {
                thread,
                size,
                depth,
                filter,
            } => {
                w.write_u8(MODIFIER_STEP);
                w.write_id(thread);
                w.write_i32(size);
                w.write_i32(depth);
                w.write_i32(filter);
            }
        }
    }

    /// Inverse of [`EventModifier::encode`]; used by the mock agent.
    pub fn decode(r: &mut PacketReader<'_>) -> Result<Self> {
        let tag = r.read_u8()?;
        Ok(match tag {
            MODIFIER_COUNT => EventModifier::Count {
                count: r.read_i32()?,
            },
            MODIFIER_THREAD_ONLY => EventModifier::ThreadOnly {
                thread: r.read_id()?,
            },
            MODIFIER_LOCATION_ONLY => EventModifier::LocationOnly {
                location: Location {
                    method: r.read_id()?,
                    il_offset: r.read_i64()?,
                },
            },
            MODIFIER_EXCEPTION_ONLY => EventModifier::ExceptionOnly {
                type_id: r.read_id()?,
                caught: r.read_bool()?,
                uncaught: r.read_bool()?,
                subclasses: r.read_bool()?,
            },
            MODIFIER_STEP => EventModifier::Step {
                thread: r.read_id()?,
                size: r.read_i32()?,
                depth: r.read_i32()?,
                filter: r.read_i32()?,
            },
            other => {
                return Err(WireError::MalformedPacket(format!(
                    "unknown event modifier {other}"
                )))
            }
        })
    }
}

/// One event out of a composite event packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    VmStart {
        request_id: i32,
        thread: ThreadId,
        domain: ObjectId,
    },
    VmDeath {
        request_id: i32,
        exit_code: i32,
    },
    ThreadStart {
        request_id: i32,
        thread: ThreadId,
    },
    ThreadDeath {
        request_id: i32,
        thread: ThreadId,
    },
    TypeLoad {
        request_id: i32,
        thread: ThreadId,
        type_id: TypeId,
    },
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Step {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Exception {
        request_id: i32,
        thread: ThreadId,
        exception: ObjectId,
    },
    UserBreak {
        request_id: i32,
        thread: ThreadId,
    },
    UserLog {
        request_id: i32,
        thread: ThreadId,
        level: i32,
        category: String,
        message: String,
    },
    /// Domain, assembly and method entry/exit events. They carry a single
    /// subject id the session does not act on.
    Other {
        kind: u8,
        request_id: i32,
        thread: ThreadId,
        subject: i32,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> u8 {
        match self {
            AgentEvent::VmStart { .. } => EVENT_KIND_VM_START,
            AgentEvent::VmDeath { .. } => EVENT_KIND_VM_DEATH,
            AgentEvent::ThreadStart { .. } => EVENT_KIND_THREAD_START,
            AgentEvent::ThreadDeath { .. } => EVENT_KIND_THREAD_DEATH,
            AgentEvent::TypeLoad { .. } => EVENT_KIND_TYPE_LOAD,
            AgentEvent::Breakpoint { .. } => EVENT_KIND_BREAKPOINT,
            AgentEvent::Step { .. } => EVENT_KIND_STEP,
            AgentEvent::Exception { .. } => EVENT_KIND_EXCEPTION,
            AgentEvent::UserBreak { .. } => EVENT_KIND_USER_BREAK,
            AgentEvent::UserLog { .. } => EVENT_KIND_USER_LOG,
            AgentEvent::Other { kind, .. } => *kind,
        }
    }

    pub fn request_id(&self) -> i32 {
        match self {
            AgentEvent::VmStart { request_id, .. }
            | AgentEvent::VmDeath { request_id, .. }
            | AgentEvent::ThreadStart { request_id, .. }
            | AgentEvent::ThreadDeath { request_id, .. }
            | AgentEvent::TypeLoad { request_id, .. }
            | AgentEvent::Breakpoint { request_id, .. }
            | AgentEvent::Step { request_id, .. }
            | AgentEvent::Exception { request_id, .. }
            | AgentEvent::UserBreak { request_id, .. }
            | AgentEvent::UserLog { request_id, .. }
            | AgentEvent::Other { request_id, .. } => *request_id,
        }
    }

    pub fn thread(&self) -> ThreadId {
        match self {
            AgentEvent::VmDeath { .. } => 0,
            AgentEvent::VmStart { thread, .. }
            | AgentEvent::ThreadStart { thread, .. }
            | AgentEvent::ThreadDeath { thread, .. }
            | AgentEvent::TypeLoad { thread, .. }
            | AgentEvent::Breakpoint { thread, .. }
            | AgentEvent::Step { thread, .. }
            | AgentEvent::Exception { thread, .. }
            | AgentEvent::UserBreak { thread, .. }
            | AgentEvent::UserLog { thread, .. }
            | AgentEvent::Other { thread, .. } => *thread,
        }
    }

    fn encode(&self, w: &mut PacketWriter) {
        w.write_u8(self.kind());
        w.write_i32(self.request_id());
        w.write_id(self.thread());
        match self {
            AgentEvent::VmStart { domain, .. } => w.write_id(*domain),
            AgentEvent::VmDeath { exit_code, .. } => w.write_i32(*exit_code),
            AgentEvent::ThreadStart { .. }
            | AgentEvent::ThreadDeath { .. }
            | AgentEvent::UserBreak { .. } => {}
            AgentEvent::TypeLoad { type_id, .. } => w.write_id(*type_id),
            AgentEvent::Breakpoint { location, .. } | AgentEvent::Step { location, .. } => {
                w.write_id(location.method);
                w.write_i64(location.il_offset);
            }
            AgentEvent::Exception { exception, .. } => w.write_id(*exception),
            AgentEvent::UserLog {
                level,
                category,
                message,
                ..
            } => {
                w.write_i32(*level);
                w.write_string(category);
                w.write_string(message);
            }
            AgentEvent::Other { subject, .. } => w.write_id(*subject),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeEvent {
    pub suspend_policy: u8,
    pub events: Vec<AgentEvent>,
}

/// Decode the payload of an `EVENT.COMPOSITE` packet.
///
/// An unknown event kind ends decoding of this packet: its body length is not
/// known, so nothing after it can be located. Events decoded up to that point
/// are still returned.
pub fn parse_composite_event(payload: &[u8]) -> Result<CompositeEvent> {
    let mut r = PacketReader::new(payload);
    let suspend_policy = r.read_u8()?;
    let count = r.read_count(9)?;
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        let thread = r.read_id()?;
        let event = match kind {
            EVENT_KIND_VM_START => AgentEvent::VmStart {
                request_id,
                thread,
                domain: r.read_id()?,
            },
            EVENT_KIND_VM_DEATH => AgentEvent::VmDeath {
                request_id,
                exit_code: r.read_i32()?,
            },
            EVENT_KIND_THREAD_START => AgentEvent::ThreadStart { request_id, thread },
            EVENT_KIND_THREAD_DEATH => AgentEvent::ThreadDeath { request_id, thread },
            EVENT_KIND_TYPE_LOAD => AgentEvent::TypeLoad {
                request_id,
                thread,
                type_id: r.read_id()?,
            },
            EVENT_KIND_BREAKPOINT | EVENT_KIND_STEP => {
                let location = Location {
                    method: r.read_id()?,
                    il_offset: r.read_i64()?,
                };
                if kind == EVENT_KIND_BREAKPOINT {
                    AgentEvent::Breakpoint {
                        request_id,
                        thread,
                        location,
                    }
                } else {
                    AgentEvent::Step {
                        request_id,
                        thread,
                        location,
                    }
                }
            }
            EVENT_KIND_EXCEPTION => AgentEvent::Exception {
                request_id,
                thread,
                exception: r.read_id()?,
            },
            EVENT_KIND_USER_BREAK => AgentEvent::UserBreak { request_id, thread },
            EVENT_KIND_USER_LOG => AgentEvent::UserLog {
                request_id,
                thread,
                level: r.read_i32()?,
                category: r.read_string()?,
                message: r.read_string()?,
            },
            EVENT_KIND_APPDOMAIN_CREATE
            | EVENT_KIND_APPDOMAIN_UNLOAD
            | EVENT_KIND_METHOD_ENTRY
            | EVENT_KIND_METHOD_EXIT
            | EVENT_KIND_ASSEMBLY_LOAD
            | EVENT_KIND_ASSEMBLY_UNLOAD => AgentEvent::Other {
                kind,
                request_id,
                thread,
                subject: r.read_id()?,
            },
            other => {
                tracing::warn!(
                    target: "sdb.wire",
                    kind = other,
                    request_id,
                    "unknown event kind; ignoring remainder of composite packet"
                );
                break;
            }
        };
        events.push(event);
    }
    Ok(CompositeEvent {
        suspend_policy,
        events,
    })
}

pub fn encode_composite_event(suspend_policy: u8, events: &[AgentEvent]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(suspend_policy);
    w.write_u32(events.len() as u32);
    for event in events {
        event.encode(&mut w);
    }
    w.into_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub vm_name: String,
    pub major: i32,
    pub minor: i32,
}

impl VersionInfo {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(payload);
        Ok(Self {
            vm_name: r.read_string()?,
            major: r.read_i32()?,
            minor: r.read_i32()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_string(&self.vm_name);
        w.write_i32(self.major);
        w.write_i32(self.minor);
        w.into_vec()
    }

    pub fn version(&self) -> ProtocolVersion {
        ProtocolVersion::new(self.major, self.minor)
    }

    pub fn is_compatible(&self) -> bool {
        self.major == PROTOCOL_MAJOR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub method: MethodId,
    pub il_offset: i64,
    pub flags: u8,
}

impl FrameInfo {
    pub fn location(&self) -> Location {
        Location {
            method: self.method,
            il_offset: self.il_offset,
        }
    }

    pub fn parse_list(payload: &[u8]) -> Result<Vec<Self>> {
        let mut r = PacketReader::new(payload);
        let count = r.read_count(13)?;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(FrameInfo {
                frame_id: r.read_id()?,
                method: r.read_id()?,
                il_offset: i64::from(r.read_i32()?),
                flags: r.read_u8()?,
            });
        }
        Ok(frames)
    }

    pub fn encode_list(frames: &[FrameInfo]) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u32(frames.len() as u32);
        for frame in frames {
            w.write_id(frame.frame_id);
            w.write_id(frame.method);
            w.write_i32(frame.il_offset as i32);
            w.write_u8(frame.flags);
        }
        w.into_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    pub il_offset: i64,
    pub line: u32,
    /// Index into [`DebugInfo::source_files`]; `None` when the agent did not
    /// attribute the sequence point to a file.
    pub source: Option<usize>,
}

/// Sequence-point table of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    pub code_size: i32,
    /// Build-machine paths. More than one when `#line` directives or partial
    /// methods pull code from several files.
    pub source_files: Vec<String>,
    pub lines: Vec<LineEntry>,
}

impl DebugInfo {
    /// Parse a `METHOD.GET_DEBUG_INFO` reply.
    ///
    /// From 2.13 the reply lists every source file and tags each sequence
    /// point with a file index; 2.14 adds a 16-byte hash per file, 2.19 a
    /// column and 2.32 an end line and column.
    pub fn parse(payload: &[u8], version: ProtocolVersion) -> Result<Self> {
        let mut r = PacketReader::new(payload);
        let code_size = r.read_i32()?;

        let multi_file = version.at_least(2, 13);
        let source_files = if multi_file {
            let hash_len = if version.at_least(2, 14) { SOURCE_HASH_LEN } else { 0 };
            let count = r.read_count(4 + hash_len)?;
            let mut files = Vec::with_capacity(count);
            for _ in 0..count {
                files.push(r.read_string()?);
                r.skip(hash_len)?;
            }
            files
        } else {
            vec![r.read_string()?]
        };

        let mut entry_len = 8;
        if multi_file {
            entry_len += 4;
        }
        if version.at_least(2, 19) {
            entry_len += 4;
        }
        if version.at_least(2, 32) {
            entry_len += 8;
        }
        let known_len = if multi_file { 12 } else { 8 };
        let count = r.read_count(entry_len)?;
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            let il_offset = i64::from(r.read_i32()?);
            let line = r.read_i32()?;
            let source = if multi_file {
                usize::try_from(r.read_i32()?).ok()
            } else {
                Some(0)
            };
            // Columns are read past; breakpoints bind by line.
            r.skip(entry_len - known_len)?;

            // Hidden sequence points carry 0xfeefee or a negative line.
            if line > 0 && line != HIDDEN_LINE {
                lines.push(LineEntry {
                    il_offset,
                    line: line as u32,
                    source: source.filter(|index| *index < source_files.len()),
                });
            }
        }
        Ok(Self {
            code_size,
            source_files,
            lines,
        })
    }

    /// Encode in the layout an agent at `version` sends. Hashes are zeroed
    /// and columns reported as 0.
    pub fn encode(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_i32(self.code_size);
        let multi_file = version.at_least(2, 13);
        if multi_file {
            w.write_u32(self.source_files.len() as u32);
            for file in &self.source_files {
                w.write_string(file);
                if version.at_least(2, 14) {
                    for _ in 0..SOURCE_HASH_LEN {
                        w.write_u8(0);
                    }
                }
            }
        } else {
            w.write_string(self.source_files.first().map_or("", String::as_str));
        }
        w.write_u32(self.lines.len() as u32);
        for entry in &self.lines {
            w.write_i32(entry.il_offset as i32);
            w.write_i32(entry.line as i32);
            if multi_file {
                w.write_i32(entry.source.map_or(-1, |index| index as i32));
            }
            if version.at_least(2, 19) {
                w.write_i32(0);
            }
            if version.at_least(2, 32) {
                w.write_i32(entry.line as i32);
                w.write_i32(0);
            }
        }
        w.into_vec()
    }

    pub fn source_of(&self, entry: &LineEntry) -> Option<&str> {
        entry
            .source
            .and_then(|index| self.source_files.get(index))
            .map(String::as_str)
    }

    fn entries_in<'a>(&'a self, file: &'a str) -> impl Iterator<Item = &'a LineEntry> + 'a {
        self.lines.iter().filter(move |entry| {
            self.source_of(entry)
                .is_some_and(|source| same_file(source, file))
        })
    }

    /// First sequence point in `file` on `line`, or on the nearest following
    /// line that has one. Returns the IL offset and the line actually bound.
    pub fn il_offset_for_line(&self, file: &str, line: u32) -> Option<(i64, u32)> {
        self.entries_in(file)
            .filter(|entry| entry.line >= line)
            .min_by_key(|entry| (entry.line, entry.il_offset))
            .map(|entry| (entry.il_offset, entry.line))
    }

    /// The sequence point covering `il_offset`.
    pub fn entry_for_il_offset(&self, il_offset: i64) -> Option<&LineEntry> {
        self.lines
            .iter()
            .filter(|entry| entry.il_offset <= il_offset)
            .max_by_key(|entry| entry.il_offset)
    }

    pub fn line_for_il_offset(&self, il_offset: i64) -> Option<u32> {
        self.entry_for_il_offset(il_offset).map(|entry| entry.line)
    }

    /// Whether `line` of `file` falls inside the range this method spans there.
    pub fn contains_line(&self, file: &str, line: u32) -> bool {
        let mut lines = self.entries_in(file).map(|entry| entry.line);
        let Some(first) = lines.next() else {
            return false;
        };
        let (min, max) = lines.fold((first, first), |(lo, hi), l| (lo.min(l), hi.max(l)));
        (min..=max).contains(&line)
    }

    /// Whether any code of this method was compiled from `file`, compared by
    /// file name since the agent reports build-machine paths.
    pub fn matches_file(&self, file: &str) -> bool {
        self.source_files.iter().any(|source| same_file(source, file))
    }
}

const SOURCE_HASH_LEN: usize = 16;

fn same_file(a: &str, b: &str) -> bool {
    file_name(a).eq_ignore_ascii_case(file_name(b))
}

const HIDDEN_LINE: i32 = 0x00fe_efee;

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    /// Position passed to `STACK_FRAME.GET_VALUES`.
    pub index: i32,
    pub name: String,
    pub type_id: TypeId,
    pub live_range: (i32, i32),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalsInfo {
    pub locals: Vec<LocalVariable>,
}

impl LocalsInfo {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PacketReader::new(payload);
        let count = r.read_count(4)?;
        let mut type_ids = Vec::with_capacity(count);
        for _ in 0..count {
            type_ids.push(r.read_id()?);
        }
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(r.read_string()?);
        }
        let mut locals = Vec::with_capacity(count);
        for (index, (type_id, name)) in type_ids.into_iter().zip(names).enumerate() {
            let start = r.read_i32()?;
            let end = r.read_i32()?;
            locals.push(LocalVariable {
                index: index as i32,
                name,
                type_id,
                live_range: (start, end),
            });
        }
        Ok(Self { locals })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        w.write_u32(self.locals.len() as u32);
        for local in &self.locals {
            w.write_id(local.type_id);
        }
        for local in &self.locals {
            w.write_string(&local.name);
        }
        for local in &self.locals {
            w.write_i32(local.live_range.0);
            w.write_i32(local.live_range.1);
        }
        w.into_vec()
    }

    /// Look up a local by name, preferring one whose live range covers
    /// `il_offset` when several share the name.
    pub fn find(&self, name: &str, il_offset: i64) -> Option<&LocalVariable> {
        let mut candidates = self.locals.iter().filter(|local| local.name == name);
        let first = candidates.next()?;
        let live = |local: &LocalVariable| {
            i64::from(local.live_range.0) <= il_offset && il_offset < i64::from(local.live_range.1)
        };
        if live(first) {
            return Some(first);
        }
        Some(candidates.find(|local| live(*local)).unwrap_or(first))
    }
}

pub const VALUE_TAG_BOOLEAN: u8 = 0x02;
pub const VALUE_TAG_CHAR: u8 = 0x03;
pub const VALUE_TAG_I1: u8 = 0x04;
pub const VALUE_TAG_U1: u8 = 0x05;
pub const VALUE_TAG_I2: u8 = 0x06;
pub const VALUE_TAG_U2: u8 = 0x07;
pub const VALUE_TAG_I4: u8 = 0x08;
pub const VALUE_TAG_U4: u8 = 0x09;
pub const VALUE_TAG_I8: u8 = 0x0a;
pub const VALUE_TAG_U8: u8 = 0x0b;
pub const VALUE_TAG_R4: u8 = 0x0c;
pub const VALUE_TAG_R8: u8 = 0x0d;
pub const VALUE_TAG_STRING: u8 = 0x0e;
pub const VALUE_TAG_VALUETYPE: u8 = 0x11;
pub const VALUE_TAG_CLASS: u8 = 0x12;
pub const VALUE_TAG_ARRAY: u8 = 0x14;
pub const VALUE_TAG_GENERICINST: u8 = 0x15;
pub const VALUE_TAG_I: u8 = 0x18;
pub const VALUE_TAG_U: u8 = 0x19;
pub const VALUE_TAG_OBJECT: u8 = 0x1c;
pub const VALUE_TAG_SZARRAY: u8 = 0x1d;
pub const VALUE_TAG_NULL: u8 = 0xf0;
pub const VALUE_TAG_TYPE: u8 = 0xf1;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Char(char),
    /// Every integer type up to 32 bits.
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(ObjectId),
    Object { tag: u8, id: ObjectId },
    Type(TypeId),
}

impl Value {
    pub fn read(r: &mut PacketReader<'_>) -> Result<Self> {
        let tag = r.read_u8()?;
        Ok(match tag {
            VALUE_TAG_BOOLEAN => Value::Boolean(r.read_i32()? != 0),
            VALUE_TAG_CHAR => {
                let code = r.read_i32()?;
                Value::Char(char::from_u32(code as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
            }
            VALUE_TAG_I1..=VALUE_TAG_U4 => Value::Int(r.read_i32()?),
            VALUE_TAG_I8 | VALUE_TAG_U8 | VALUE_TAG_I | VALUE_TAG_U => Value::Long(r.read_i64()?),
            VALUE_TAG_R4 => Value::Float(f32::from_bits(r.read_i32()? as u32)),
            VALUE_TAG_R8 => Value::Double(f64::from_bits(r.read_i64()? as u64)),
            VALUE_TAG_STRING => Value::String(r.read_id()?),
            VALUE_TAG_CLASS
            | VALUE_TAG_ARRAY
            | VALUE_TAG_GENERICINST
            | VALUE_TAG_OBJECT
            | VALUE_TAG_SZARRAY => Value::Object {
                tag,
                id: r.read_id()?,
            },
            VALUE_TAG_NULL => Value::Null,
            VALUE_TAG_TYPE => Value::Type(r.read_id()?),
            VALUE_TAG_VALUETYPE => {
                return Err(WireError::MalformedPacket(
                    "struct values are not supported".to_string(),
                ))
            }
            other => {
                return Err(WireError::MalformedPacket(format!(
                    "unknown value tag {other:#04x}"
                )))
            }
        })
    }

    pub fn write(&self, w: &mut PacketWriter) {
        match self {
            Value::Null => w.write_u8(VALUE_TAG_NULL),
            Value::Boolean(v) => {
                w.write_u8(VALUE_TAG_BOOLEAN);
                w.write_i32(i32::from(*v));
            }
            Value::Char(c) => {
                w.write_u8(VALUE_TAG_CHAR);
                w.write_i32(*c as i32);
            }
            Value::Int(v) => {
                w.write_u8(VALUE_TAG_I4);
                w.write_i32(*v);
            }
            Value::Long(v) => {
                w.write_u8(VALUE_TAG_I8);
                w.write_i64(*v);
            }
            Value::Float(v) => {
                w.write_u8(VALUE_TAG_R4);
                w.write_i32(v.to_bits() as i32);
            }
            Value::Double(v) => {
                w.write_u8(VALUE_TAG_R8);
                w.write_i64(v.to_bits() as i64);
            }
            Value::String(id) => {
                w.write_u8(VALUE_TAG_STRING);
                w.write_id(*id);
            }
            Value::Object { tag, id } => {
                w.write_u8(*tag);
                w.write_id(*id);
            }
            Value::Type(id) => {
                w.write_u8(VALUE_TAG_TYPE);
                w.write_id(*id);
            }
        }
    }

    pub fn parse_list(payload: &[u8]) -> Result<Vec<Self>> {
        let mut r = PacketReader::new(payload);
        let mut values = Vec::new();
        while r.remaining() > 0 {
            values.push(Value::read(&mut r)?);
        }
        Ok(values)
    }

    /// Rendering for everything except strings, which need a
    /// `STRING_REF.GET_VALUE` round trip first.
    pub fn display(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Boolean(v) => v.to_string(),
            Value::Char(c) => format!("'{c}'"),
            Value::Int(v) => v.to_string(),
            Value::Long(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::String(id) => format!("string#{id}"),
            Value::Object { id, .. } => format!("object#{id}"),
            Value::Type(id) => format!("type#{id}"),
        }
    }
}

pub fn parse_id_list(payload: &[u8]) -> Result<Vec<i32>> {
    let mut r = PacketReader::new(payload);
    let count = r.read_count(4)?;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(r.read_id()?);
    }
    Ok(ids)
}

pub fn encode_id_list(ids: &[i32]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u32(ids.len() as u32);
    for id in ids {
        w.write_id(*id);
    }
    w.into_vec()
}

pub fn parse_string(payload: &[u8]) -> Result<String> {
    PacketReader::new(payload).read_string()
}

pub fn encode_string(s: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_string(s);
    w.into_vec()
}

pub fn parse_request_id(payload: &[u8]) -> Result<i32> {
    PacketReader::new(payload).read_i32()
}
