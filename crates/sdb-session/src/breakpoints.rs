use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use sdb_wire::Location;

/// Where the user asked to stop. Breakpoints are keyed by this value, so
/// setting the same location twice yields the same breakpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceLocation {
    Line { file: String, line: u32 },
    Method { type_name: String, method_name: String },
}

impl SourceLocation {
    pub fn line(file: impl Into<String>, line: u32) -> Self {
        SourceLocation::Line {
            file: file.into(),
            line,
        }
    }

    pub fn method(type_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        SourceLocation::Method {
            type_name: type_name.into(),
            method_name: method_name.into(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Line { file, line } => write!(f, "{file}:{line}"),
            SourceLocation::Method {
                type_name,
                method_name,
            } => write!(f, "{type_name}::{method_name}"),
        }
    }
}

/// Parses `path/to/File.cs:42` or `Namespace.Type::Method`.
impl FromStr for SourceLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((type_name, method_name)) = s.rsplit_once("::") {
            if !type_name.is_empty() && !method_name.is_empty() {
                return Ok(SourceLocation::method(type_name, method_name));
            }
        }
        if let Some((file, line)) = s.rsplit_once(':') {
            if let Ok(line) = line.parse::<u32>() {
                if !file.is_empty() && line > 0 {
                    return Ok(SourceLocation::line(file, line));
                }
            }
        }
        Err(format!(
            "invalid breakpoint location `{s}` (expected FILE:LINE or TYPE::METHOD)"
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointHandle(pub(crate) u64);

impl BreakpointHandle {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BreakpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindState {
    /// Not sent to the agent yet.
    Pending,
    /// Lookup or `EVENT_REQUEST.SET` in flight.
    Binding,
    /// The code is not loaded yet; retried on the next type load.
    Unbound,
    /// Acknowledged by the agent. `request_id` is the resolved address token.
    Bound {
        request_id: i32,
        location: Location,
        line: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub handle: BreakpointHandle,
    pub location: SourceLocation,
    pub enabled: bool,
    /// Kept for the host; the agent does not evaluate conditions.
    pub condition: Option<String>,
    pub state: BindState,
    generation: u64,
}

impl Breakpoint {
    pub fn resolved_token(&self) -> Option<i32> {
        match self.state {
            BindState::Bound { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.resolved_token().is_some()
    }
}

/// A bind attempt in flight. Replies for an older generation are stale: the
/// breakpoint was removed or toggled while the lookup ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BindTicket {
    pub handle: BreakpointHandle,
    pub generation: u64,
    pub location: SourceLocation,
}

/// Outcome of recording a bind reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindOutcome {
    Bound,
    /// The ticket is stale; the new agent request must be cleared again.
    Stale,
}

#[derive(Debug, Default)]
pub struct BreakpointSet {
    next_handle: u64,
    entries: BTreeMap<BreakpointHandle, Breakpoint>,
    by_location: HashMap<SourceLocation, BreakpointHandle>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, handle: BreakpointHandle) -> Option<&Breakpoint> {
        self.entries.get(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.entries.values()
    }

    pub fn find(&self, location: &SourceLocation) -> Option<&Breakpoint> {
        self.by_location
            .get(location)
            .and_then(|handle| self.entries.get(handle))
    }

    /// Add a breakpoint, or update the condition of the one already at
    /// `location`. Returns its handle and whether it was newly created.
    pub fn upsert(
        &mut self,
        location: SourceLocation,
        condition: Option<String>,
    ) -> (BreakpointHandle, bool) {
        if let Some(handle) = self.by_location.get(&location).copied() {
            if let Some(bp) = self.entries.get_mut(&handle) {
                bp.condition = condition;
            }
            return (handle, false);
        }

        self.next_handle += 1;
        let handle = BreakpointHandle(self.next_handle);
        self.by_location.insert(location.clone(), handle);
        self.entries.insert(
            handle,
            Breakpoint {
                handle,
                location,
                enabled: true,
                condition,
                state: BindState::Pending,
                generation: 0,
            },
        );
        (handle, true)
    }

    pub fn remove(&mut self, handle: BreakpointHandle) -> Option<Breakpoint> {
        let bp = self.entries.remove(&handle)?;
        self.by_location.remove(&bp.location);
        Some(bp)
    }

    /// Toggle a breakpoint. Disabling a bound breakpoint returns its agent
    /// request id, which the caller must clear.
    pub(crate) fn set_enabled(
        &mut self,
        handle: BreakpointHandle,
        enabled: bool,
    ) -> Option<Option<i32>> {
        let bp = self.entries.get_mut(&handle)?;
        if bp.enabled == enabled {
            return Some(None);
        }
        bp.enabled = enabled;
        bp.generation += 1;
        let token = bp.resolved_token();
        bp.state = BindState::Pending;
        Some(token)
    }

    /// Claim every enabled breakpoint that has never been sent. Each one is
    /// handed out at most once until its state changes again.
    pub(crate) fn take_pending(&mut self) -> Vec<BindTicket> {
        self.take_where(|state| *state == BindState::Pending)
    }

    /// Claim breakpoints whose code was missing at the last attempt.
    pub(crate) fn take_unbound(&mut self) -> Vec<BindTicket> {
        self.take_where(|state| *state == BindState::Unbound)
    }

    fn take_where(&mut self, pred: impl Fn(&BindState) -> bool) -> Vec<BindTicket> {
        self.entries
            .values_mut()
            .filter(|bp| bp.enabled && pred(&bp.state))
            .map(|bp| {
                bp.state = BindState::Binding;
                BindTicket {
                    handle: bp.handle,
                    generation: bp.generation,
                    location: bp.location.clone(),
                }
            })
            .collect()
    }

    pub(crate) fn is_current(&self, ticket: &BindTicket) -> bool {
        self.entries
            .get(&ticket.handle)
            .is_some_and(|bp| bp.generation == ticket.generation && bp.enabled)
    }

    pub(crate) fn mark_bound(
        &mut self,
        ticket: &BindTicket,
        request_id: i32,
        location: Location,
        line: Option<u32>,
    ) -> BindOutcome {
        if !self.is_current(ticket) {
            return BindOutcome::Stale;
        }
        if let Some(bp) = self.entries.get_mut(&ticket.handle) {
            bp.state = BindState::Bound {
                request_id,
                location,
                line,
            };
        }
        BindOutcome::Bound
    }

    pub(crate) fn mark_unbound(&mut self, ticket: &BindTicket) {
        if !self.is_current(ticket) {
            return;
        }
        if let Some(bp) = self.entries.get_mut(&ticket.handle) {
            bp.state = BindState::Unbound;
        }
    }

    pub fn by_request_id(&self, request_id: i32) -> Option<BreakpointHandle> {
        self.entries
            .values()
            .find(|bp| bp.resolved_token() == Some(request_id))
            .map(|bp| bp.handle)
    }
}
