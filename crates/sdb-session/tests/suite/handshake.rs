use sdb_session::{Notification, SessionState, SourceLocation, TerminationReason};
use sdb_wire::mock::{MockAgent, MockAgentConfig, MAIN_THREAD_ID};
use sdb_wire::protocol::*;

use super::support::{attach, attach_config, Harness, TIMEOUT};

#[tokio::test]
async fn attach_negotiates_protocol_and_registers_event_requests() {
    let agent = MockAgent::spawn().await.unwrap();
    let (_harness, session) = attach(&agent).await;

    assert_eq!(agent.protocol_version(), Some((PROTOCOL_MAJOR, PROTOCOL_MINOR)));
    assert_eq!(session.state(), SessionState::Running);

    let requests: Vec<_> = agent
        .event_requests()
        .into_iter()
        .map(|r| (r.event_kind, r.suspend_policy))
        .collect();
    for expected in [
        (EVENT_KIND_THREAD_START, SUSPEND_POLICY_NONE),
        (EVENT_KIND_THREAD_DEATH, SUSPEND_POLICY_NONE),
        (EVENT_KIND_TYPE_LOAD, SUSPEND_POLICY_ALL),
        (EVENT_KIND_USER_LOG, SUSPEND_POLICY_NONE),
        (EVENT_KIND_USER_BREAK, SUSPEND_POLICY_ALL),
        (EVENT_KIND_EXCEPTION, SUSPEND_POLICY_ALL),
    ] {
        assert!(requests.contains(&expected), "missing {expected:?} in {requests:?}");
    }

    // The agent announced itself suspended; setup resumes it exactly once.
    assert_eq!(agent.resume_calls(), 1);

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Running);
    let main = snapshot
        .threads
        .iter()
        .find(|t| t.id == MAIN_THREAD_ID)
        .expect("main thread is tracked");
    assert!(!main.suspended);
    assert!(snapshot.active_frame.is_none());
}

#[tokio::test]
async fn older_agent_is_spoken_to_in_its_own_protocol_version() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        protocol_minor: 12,
        ..MockAgentConfig::default()
    })
    .await
    .unwrap();
    let (mut harness, session) = attach(&agent).await;
    assert_eq!(agent.protocol_version(), Some((PROTOCOL_MAJOR, 12)));

    // 2.12 debug info has one source file per method and no columns.
    let handle = session
        .set_breakpoint(SourceLocation::line("Main.cs", 12), None)
        .await
        .unwrap();
    let line = match harness
        .expect(|n| matches!(n, Notification::BreakpointResolved { breakpoint, .. } if *breakpoint == handle))
        .await
    {
        Notification::BreakpointResolved { line, .. } => line,
        other => unreachable!("{other:?}"),
    };
    assert_eq!(line, Some(12));
}

#[tokio::test]
async fn state_notifications_follow_the_lifecycle() {
    let agent = MockAgent::spawn().await.unwrap();
    let mut harness = Harness::new(attach_config(agent.addr()));
    let session = harness.start().await;

    let mut states = Vec::new();
    while states.last() != Some(&SessionState::Running) {
        if let Notification::StateChanged { state, session: id } = harness
            .expect(|n| matches!(n, Notification::StateChanged { .. }))
            .await
        {
            assert_eq!(id, session.id());
            states.push(state);
        }
    }
    assert_eq!(
        states,
        [SessionState::Connecting, SessionState::Handshaking, SessionState::Running]
    );
}

#[tokio::test]
async fn incompatible_agent_fails_the_handshake() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        protocol_major: PROTOCOL_MAJOR + 1,
        ..MockAgentConfig::default()
    })
    .await
    .unwrap();
    let mut harness = Harness::new(attach_config(agent.addr()));
    let session = harness.start().await;

    let reason = tokio::time::timeout(TIMEOUT, session.wait_terminated()).await.unwrap();
    assert_eq!(reason.code(), "handshake_failed");
    assert!(matches!(reason, TerminationReason::HandshakeFailed(_)));
    assert_eq!(agent.protocol_version(), None);
    assert_eq!(session.state(), SessionState::Terminated);

    let terminated = harness
        .expect(|n| matches!(n, Notification::Terminated { .. }))
        .await;
    assert_eq!(
        terminated,
        Notification::Terminated {
            session: session.id(),
            reason,
        }
    );
}

#[tokio::test]
async fn wrong_banner_fails_the_handshake() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        handshake_banner: b"JDWP-Handshake".to_vec(),
        ..MockAgentConfig::default()
    })
    .await
    .unwrap();
    let harness = Harness::new(attach_config(agent.addr()));
    let session = harness.start().await;

    let reason = tokio::time::timeout(TIMEOUT, session.wait_terminated()).await.unwrap();
    assert!(matches!(reason, TerminationReason::HandshakeFailed(_)), "{reason:?}");
    assert!(agent.commands().is_empty());
}
