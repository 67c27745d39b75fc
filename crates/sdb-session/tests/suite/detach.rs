use std::time::Duration;

use sdb_session::{Ack, Intent, Notification, SessionError, SessionState, TerminationReason};
use sdb_wire::mock::{MockAgent, MockAgentConfig};
use sdb_wire::protocol::*;

use super::support::{attach, attach_config, Harness, TIMEOUT};

#[tokio::test]
async fn detach_is_idempotent() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    let (first, second) = tokio::join!(session.detach(), session.detach());
    assert_eq!(first, TerminationReason::Detached);
    assert_eq!(second, TerminationReason::Detached);
    assert_eq!(session.detach().await, TerminationReason::Detached);

    assert_eq!(agent.dispose_calls(), 1);
    assert!(agent.wait_closed(TIMEOUT).await);
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(session.termination_reason(), Some(TerminationReason::Detached));

    harness
        .expect(|n| matches!(n, Notification::Terminated { .. }))
        .await;
    let late = harness.drain_for(Duration::from_millis(100)).await;
    assert!(
        !late.iter().any(|n| matches!(n, Notification::Terminated { .. })),
        "terminated reported twice: {late:?}"
    );
}

#[tokio::test]
async fn detach_goes_through_detaching() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    assert_eq!(session.send(Intent::Detach).await.unwrap(), Ack::Sent);
    harness
        .expect(|n| matches!(n, Notification::StateChanged { state: SessionState::Detaching, .. }))
        .await;
    harness
        .expect(|n| matches!(n, Notification::StateChanged { state: SessionState::Terminated, .. }))
        .await;
    assert_eq!(session.wait_terminated().await, TerminationReason::Detached);
}

#[tokio::test]
async fn unresponsive_agent_is_dropped_after_the_deadline() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        reply_to_dispose: false,
        ..MockAgentConfig::default()
    })
    .await
    .unwrap();
    let mut config = attach_config(agent.addr());
    config.agent.detach_timeout_ms = 100;
    let mut harness = Harness::new(config);
    let session = harness.start().await;
    harness
        .expect(|n| matches!(n, Notification::StateChanged { state: SessionState::Running, .. }))
        .await;

    let started = tokio::time::Instant::now();
    let reason = tokio::time::timeout(TIMEOUT, session.detach()).await.unwrap();
    assert_eq!(reason, TerminationReason::Detached);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(agent.dispose_calls(), 1);
    assert!(agent.wait_closed(TIMEOUT).await);
}

#[tokio::test]
async fn terminate_exits_the_vm() {
    let agent = MockAgent::spawn().await.unwrap();
    let (_harness, session) = attach(&agent).await;

    assert_eq!(session.terminate().await, TerminationReason::Terminated);
    assert_eq!(agent.command_count(CMD_SET_VM, CMD_VM_EXIT), 1);
    assert_eq!(agent.dispose_calls(), 0);
}

#[tokio::test]
async fn requests_after_termination_fail() {
    let agent = MockAgent::spawn().await.unwrap();
    let (_harness, session) = attach(&agent).await;
    session.detach().await;

    let err = session.send(Intent::Continue).await.unwrap_err();
    assert!(matches!(err, SessionError::SessionTerminated));
    let err = session.snapshot().await.unwrap_err();
    assert!(matches!(err, SessionError::SessionTerminated));
    let err = session
        .set_breakpoint(sdb_session::SourceLocation::line("Main.cs", 12), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::SessionTerminated));
}

#[tokio::test]
async fn dropping_every_handle_detaches() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;
    let id = session.id();
    drop(session);

    let terminated = harness
        .expect(|n| matches!(n, Notification::Terminated { .. }))
        .await;
    assert_eq!(
        terminated,
        Notification::Terminated {
            session: id,
            reason: TerminationReason::Detached,
        }
    );
    assert_eq!(agent.dispose_calls(), 1);
}

#[tokio::test]
async fn registry_detaches_every_tracked_session() {
    let agent = MockAgent::spawn().await.unwrap();
    let (harness, live) = attach(&agent).await;
    // The agent stopped listening after its first accept.
    let refused = harness.start().await;
    assert_ne!(live.id(), refused.id());
    let refused_reason = tokio::time::timeout(TIMEOUT, refused.wait_terminated())
        .await
        .unwrap();
    assert!(matches!(refused_reason, TerminationReason::ConnectTimeout { .. }), "{refused_reason:?}");

    let registry = sdb_session::SessionRegistry::new();
    registry.insert(live.clone());
    registry.insert(refused.clone());
    assert_eq!(registry.ids(), [live.id(), refused.id()]);
    assert_eq!(registry.prune_terminated(), [refused.id()]);
    assert_eq!(registry.len(), 1);

    registry.insert(refused.clone());
    let outcomes = registry.detach_all().await;
    assert_eq!(
        outcomes,
        [
            (live.id(), TerminationReason::Detached),
            (refused.id(), refused_reason),
        ]
    );
    assert!(registry.is_empty());
    assert_eq!(agent.dispose_calls(), 1);
}
