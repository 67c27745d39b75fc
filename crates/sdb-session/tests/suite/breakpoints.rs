use std::time::Duration;

use sdb_session::{
    BindState, BreakpointHandle, Notification, SessionError, SessionHandle, SourceLocation,
    StopReason,
};
use sdb_wire::mock::{MockAgent, MockAgentConfig, PROCESS_METHOD_ID, READY_METHOD_ID};
use sdb_wire::protocol::*;
use sdb_wire::Location;

use super::support::{attach, Harness, TIMEOUT};

async fn wait_for_bind_state(
    session: &SessionHandle,
    handle: BreakpointHandle,
    mut pred: impl FnMut(&BindState) -> bool,
) -> BindState {
    let poll = async {
        loop {
            let snapshot = session.snapshot().await.unwrap();
            let bp = snapshot
                .breakpoints
                .into_iter()
                .find(|bp| bp.handle == handle)
                .expect("breakpoint is tracked");
            if pred(&bp.state) {
                return bp.state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, poll).await.unwrap()
}

async fn resolved(harness: &mut Harness, handle: BreakpointHandle) -> Option<u32> {
    match harness
        .expect(|n| matches!(n, Notification::BreakpointResolved { breakpoint, .. } if *breakpoint == handle))
        .await
    {
        Notification::BreakpointResolved { line, .. } => line,
        other => unreachable!("{other:?}"),
    }
}

#[tokio::test]
async fn line_breakpoint_binds_to_sequence_point() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    let handle = session
        .set_breakpoint(SourceLocation::line("res://Main.cs", 12), None)
        .await
        .unwrap();
    assert_eq!(resolved(&mut harness, handle).await, Some(12));

    let requests = agent.breakpoint_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].suspend_policy, SUSPEND_POLICY_ALL);
    assert_eq!(
        requests[0].location(),
        Some(Location {
            method: PROCESS_METHOD_ID,
            il_offset: 8,
        })
    );

    let snapshot = session.snapshot().await.unwrap();
    let bp = &snapshot.breakpoints[0];
    assert!(bp.is_bound());
    assert_eq!(bp.resolved_token(), Some(requests[0].request_id));
}

#[tokio::test]
async fn acknowledged_breakpoints_are_not_resent() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    let first = session
        .set_breakpoint(SourceLocation::line("Main.cs", 11), None)
        .await
        .unwrap();
    resolved(&mut harness, first).await;

    let again = session
        .set_breakpoint(SourceLocation::line("Main.cs", 11), Some("delta > 1".into()))
        .await
        .unwrap();
    assert_eq!(again, first);

    let second = session
        .set_breakpoint(SourceLocation::line("Main.cs", 21), None)
        .await
        .unwrap();
    assert_ne!(second, first);
    assert_eq!(resolved(&mut harness, second).await, Some(21));

    let locations: Vec<_> = agent
        .breakpoint_requests()
        .iter()
        .filter_map(|r| r.location())
        .collect();
    assert_eq!(
        locations,
        [
            Location {
                method: PROCESS_METHOD_ID,
                il_offset: 4,
            },
            Location {
                method: READY_METHOD_ID,
                il_offset: 6,
            },
        ]
    );

    let snapshot = session.snapshot().await.unwrap();
    let first_bp = snapshot.breakpoints.iter().find(|bp| bp.handle == first).unwrap();
    assert_eq!(first_bp.condition.as_deref(), Some("delta > 1"));
}

#[tokio::test]
async fn method_breakpoint_binds_to_first_sequence_point() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    let location: SourceLocation = "Main::_Ready".parse().unwrap();
    let handle = session.set_breakpoint(location, None).await.unwrap();
    assert_eq!(resolved(&mut harness, handle).await, Some(20));

    let requests = agent.breakpoint_requests();
    assert_eq!(
        requests[0].location(),
        Some(Location {
            method: READY_METHOD_ID,
            il_offset: 0,
        })
    );
}

#[tokio::test]
async fn breakpoint_in_unloaded_code_binds_on_type_load() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        type_loaded: false,
        ..MockAgentConfig::default()
    })
    .await
    .unwrap();
    let (mut harness, session) = attach(&agent).await;

    let handle = session
        .set_breakpoint(SourceLocation::line("Main.cs", 13), None)
        .await
        .unwrap();
    wait_for_bind_state(&session, handle, |state| *state == BindState::Unbound).await;
    assert!(agent.breakpoint_requests().is_empty());

    agent.load_type();
    assert_eq!(resolved(&mut harness, handle).await, Some(13));
    let state = wait_for_bind_state(&session, handle, |state| matches!(state, BindState::Bound { .. })).await;
    assert!(matches!(
        state,
        BindState::Bound {
            location: Location { method: PROCESS_METHOD_ID, il_offset: 12 },
            ..
        }
    ));
}

#[tokio::test]
async fn type_load_holds_the_game_until_its_breakpoints_are_set() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        type_loaded: false,
        ..MockAgentConfig::default()
    })
    .await
    .unwrap();
    let (mut harness, session) = attach(&agent).await;

    let handle = session
        .set_breakpoint(SourceLocation::line("Main.cs", 13), None)
        .await
        .unwrap();
    wait_for_bind_state(&session, handle, |state| *state == BindState::Unbound).await;
    let resumes = agent.resume_calls();

    // The suspending TYPE_LOAD is the only thing that lets the game run on,
    // and the first resume after it must already hit the new breakpoint.
    agent.load_type();
    let hit = harness
        .expect(|n| matches!(n, Notification::Stopped { reason: StopReason::Breakpoint { .. }, .. }))
        .await;
    let Notification::Stopped {
        reason: StopReason::Breakpoint { breakpoint },
        frame: Some(frame),
        ..
    } = hit
    else {
        panic!("breakpoint stop without a frame: {hit:?}");
    };
    assert_eq!(breakpoint, Some(handle));
    assert_eq!(frame.line, Some(13));
    assert_eq!(agent.resume_calls(), resumes + 1);

    let commands = agent.commands();
    let set = commands
        .iter()
        .rposition(|c| (c.command_set, c.command) == (CMD_SET_EVENT_REQUEST, CMD_EVENT_REQUEST_SET))
        .unwrap();
    let resume = commands
        .iter()
        .rposition(|c| (c.command_set, c.command) == (CMD_SET_VM, CMD_VM_RESUME))
        .unwrap();
    assert!(set < resume, "resumed before the breakpoint was set");
}

#[tokio::test]
async fn line_without_code_stays_unbound() {
    let agent = MockAgent::spawn().await.unwrap();
    let (_harness, session) = attach(&agent).await;

    // Between the two methods.
    let handle = session
        .set_breakpoint(SourceLocation::line("Main.cs", 17), None)
        .await
        .unwrap();
    wait_for_bind_state(&session, handle, |state| *state == BindState::Unbound).await;
    assert!(agent.breakpoint_requests().is_empty());
}

#[tokio::test]
async fn removing_a_bound_breakpoint_clears_its_request() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    let handle = session
        .set_breakpoint(SourceLocation::line("Main.cs", 12), None)
        .await
        .unwrap();
    resolved(&mut harness, handle).await;
    let request_id = agent.breakpoint_requests()[0].request_id;

    session.remove_breakpoint(handle).await.unwrap();
    assert!(agent.wait_for_command(CMD_SET_EVENT_REQUEST, CMD_EVENT_REQUEST_CLEAR, 1, TIMEOUT).await);
    assert_eq!(agent.cleared_requests(), [(EVENT_KIND_BREAKPOINT, request_id)]);
    assert!(session.snapshot().await.unwrap().breakpoints.is_empty());

    let err = session.remove_breakpoint(handle).await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownBreakpoint(h) if h == handle));
}

#[tokio::test]
async fn disabling_clears_and_enabling_rebinds() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    let handle = session
        .set_breakpoint(SourceLocation::line("Main.cs", 12), None)
        .await
        .unwrap();
    resolved(&mut harness, handle).await;
    let first_request = agent.breakpoint_requests()[0].request_id;

    session.set_breakpoint_enabled(handle, false).await.unwrap();
    assert!(agent.wait_for_command(CMD_SET_EVENT_REQUEST, CMD_EVENT_REQUEST_CLEAR, 1, TIMEOUT).await);
    assert_eq!(agent.cleared_requests(), [(EVENT_KIND_BREAKPOINT, first_request)]);
    let snapshot = session.snapshot().await.unwrap();
    assert!(!snapshot.breakpoints[0].enabled);
    assert_eq!(snapshot.breakpoints[0].state, BindState::Pending);

    session.set_breakpoint_enabled(handle, true).await.unwrap();
    resolved(&mut harness, handle).await;
    let requests = agent.breakpoint_requests();
    assert_eq!(requests.len(), 2);
    assert_ne!(requests[1].request_id, first_request);

    session.remove_breakpoint(handle).await.unwrap();
    let err = session.set_breakpoint_enabled(handle, true).await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownBreakpoint(h) if h == handle));
}
