use sdb_session::{BindState, Frame, Notification, OutputSource, SessionSnapshot, StopReason};

/// The terminal line for a notification, if it warrants one.
pub fn notification(notification: &Notification) -> Option<String> {
    let line = match notification {
        Notification::StateChanged { session, state } => format!("[{session}] {state}"),
        Notification::Stopped {
            session,
            thread,
            reason,
            frame,
        } => format!(
            "[{session}] stopped ({}) on thread {thread} at {}",
            stop_reason(reason),
            frame.as_ref().map_or_else(|| "<no frame>".to_owned(), frame_label)
        ),
        // `Stopped` already says which breakpoint.
        Notification::BreakpointHit { .. } => return None,
        Notification::BreakpointResolved {
            session,
            breakpoint,
            line,
        } => match line {
            Some(line) => format!("[{session}] breakpoint {breakpoint} bound at line {line}"),
            None => format!("[{session}] breakpoint {breakpoint} bound"),
        },
        Notification::OutputLine { source, line, .. } => {
            let tag = match source {
                OutputSource::Stdout => "out",
                OutputSource::Stderr => "err",
                OutputSource::Agent => "log",
            };
            format!("{tag}| {line}")
        }
        Notification::Terminated { session, reason } => format!("[{session}] session ended: {reason}"),
    };
    Some(line)
}

fn stop_reason(reason: &StopReason) -> String {
    match reason {
        StopReason::Breakpoint {
            breakpoint: Some(handle),
        } => format!("breakpoint {handle}"),
        StopReason::Breakpoint { breakpoint: None } => "breakpoint".to_owned(),
        StopReason::Step => "step".to_owned(),
        StopReason::Exception { exception } => format!("exception object#{exception}"),
        StopReason::UserBreak => "Debugger.Break".to_owned(),
        StopReason::Pause => "pause".to_owned(),
    }
}

/// `Method (File.cs:12)`, degrading to whatever the agent could tell us.
pub fn frame_label(frame: &Frame) -> String {
    let method = frame.method_name.as_deref().unwrap_or("<unknown>");
    // Paths come from the build machine and may use either separator.
    let file = frame
        .source_file
        .as_deref()
        .map(|path| path.rsplit(['/', '\\']).next().unwrap_or(path));
    match (file, frame.line) {
        (Some(file), Some(line)) => format!("{method} ({file}:{line})"),
        (Some(file), None) => format!("{method} ({file})"),
        _ => format!("{method} (il {:#x})", frame.location.il_offset),
    }
}

pub fn snapshot(snapshot: &SessionSnapshot) -> String {
    let mut out = format!("state: {}\n", snapshot.state);
    for thread in &snapshot.threads {
        let name = thread.name.as_deref().unwrap_or("<unnamed>");
        let marker = if thread.suspended { " (suspended)" } else { "" };
        out.push_str(&format!("thread {} {name}{marker}\n", thread.id));
        for (depth, frame) in thread.call_stack.iter().enumerate() {
            out.push_str(&format!("  #{depth} {}\n", frame_label(frame)));
        }
    }
    for bp in &snapshot.breakpoints {
        let state = match &bp.state {
            BindState::Pending => "pending".to_owned(),
            BindState::Binding => "binding".to_owned(),
            BindState::Unbound => "not loaded yet".to_owned(),
            BindState::Bound { line: Some(line), .. } => format!("bound at line {line}"),
            BindState::Bound { .. } => "bound".to_owned(),
        };
        let enabled = if bp.enabled { "" } else { ", disabled" };
        out.push_str(&format!("breakpoint {} {} ({state}{enabled})\n", bp.handle, bp.location));
    }
    out
}
