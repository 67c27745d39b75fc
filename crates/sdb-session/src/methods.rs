use std::collections::HashMap;

use sdb_wire::{DebugInfo, FrameInfo, LocalsInfo, Location, MethodId};

use crate::breakpoints::SourceLocation;
use crate::threads::Frame;

#[derive(Debug, Default)]
struct MethodMeta {
    name: Option<String>,
    debug_info: Option<DebugInfo>,
    locals: Option<LocalsInfo>,
}

/// Per-connection cache of method metadata. Methods never change once
/// loaded, so entries are kept for the life of the session.
#[derive(Debug, Default)]
pub(crate) struct MethodCache {
    methods: HashMap<MethodId, MethodMeta>,
}

impl MethodCache {
    pub fn name(&self, method: MethodId) -> Option<&str> {
        self.methods.get(&method)?.name.as_deref()
    }

    pub fn debug_info(&self, method: MethodId) -> Option<&DebugInfo> {
        self.methods.get(&method)?.debug_info.as_ref()
    }

    pub fn locals(&self, method: MethodId) -> Option<&LocalsInfo> {
        self.methods.get(&method)?.locals.as_ref()
    }

    pub fn set_name(&mut self, method: MethodId, name: String) {
        self.methods.entry(method).or_default().name = Some(name);
    }

    pub fn set_debug_info(&mut self, method: MethodId, info: DebugInfo) {
        self.methods.entry(method).or_default().debug_info = Some(info);
    }

    pub fn set_locals(&mut self, method: MethodId, locals: LocalsInfo) {
        self.methods.entry(method).or_default().locals = Some(locals);
    }

    pub fn frame(&self, info: &FrameInfo) -> Frame {
        let mut frame = Frame::unresolved(info.frame_id, info.location());
        frame.method_name = self.name(info.method).map(str::to_owned);
        if let Some(debug) = self.debug_info(info.method) {
            let entry = debug.entry_for_il_offset(info.il_offset);
            frame.line = entry.map(|entry| entry.line);
            frame.source_file = entry
                .and_then(|entry| debug.source_of(entry))
                .or_else(|| debug.source_files.first().map(String::as_str))
                .map(str::to_owned);
        }
        frame
    }

    /// Lookups still missing before `location` can be resolved against
    /// `method`: `(needs_name, needs_debug_info)`.
    pub fn missing_for(&self, location: &SourceLocation, method: MethodId) -> (bool, bool) {
        let needs_name = matches!(location, SourceLocation::Method { .. })
            && self.name(method).is_none();
        (needs_name, self.debug_info(method).is_none())
    }

    /// Pick the code location for a breakpoint among the methods of its
    /// candidate types. Returns the location and the source line it maps to.
    ///
    /// A line breakpoint binds to the nearest sequence point at or after the
    /// requested line, inside a method whose line range covers it.
    pub fn resolve(
        &self,
        location: &SourceLocation,
        methods: &[MethodId],
    ) -> Option<(Location, Option<u32>)> {
        match location {
            SourceLocation::Line { file, line } => methods
                .iter()
                .filter_map(|method| {
                    let info = self.debug_info(*method)?;
                    if !info.contains_line(file, *line) {
                        return None;
                    }
                    let (il_offset, bound) = info.il_offset_for_line(file, *line)?;
                    Some((bound, il_offset, *method))
                })
                .min()
                .map(|(bound, il_offset, method)| {
                    (Location { method, il_offset }, Some(bound))
                }),
            SourceLocation::Method { method_name, .. } => {
                let method = *methods
                    .iter()
                    .find(|method| self.name(**method) == Some(method_name.as_str()))?;
                let debug = self.debug_info(method);
                let il_offset = debug
                    .and_then(|info| info.lines.iter().map(|entry| entry.il_offset).min())
                    .unwrap_or(0);
                let line = debug.and_then(|info| info.line_for_il_offset(il_offset));
                Some((Location { method, il_offset }, line))
            }
        }
    }
}
