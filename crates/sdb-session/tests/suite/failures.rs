use std::net::{SocketAddr, TcpListener};

use sdb_session::{Ack, Intent, Notification, SessionState, TerminationReason};
use sdb_wire::codec::{encode_command, encode_reply};
use sdb_wire::mock::MockAgent;
use sdb_wire::protocol::*;
use sdb_wire::AgentEvent;

use super::support::{attach, attach_config, Harness, TIMEOUT};

fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn attach_gives_up_after_configured_attempts() {
    let mut config = attach_config(closed_port());
    config.agent.connect_attempts = 3;
    let mut harness = Harness::new(config);
    let session = harness.start().await;

    let reason = tokio::time::timeout(TIMEOUT, session.wait_terminated()).await.unwrap();
    assert_eq!(reason, TerminationReason::ConnectTimeout { attempts: 3 });
    assert_eq!(reason.code(), "connect_timeout");

    let states: Vec<_> = harness
        .drain_for(std::time::Duration::from_millis(50))
        .await
        .into_iter()
        .filter_map(|n| match n {
            Notification::StateChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(states, [SessionState::Connecting, SessionState::Terminated]);
}

#[tokio::test]
async fn oversized_frame_is_a_protocol_error() {
    let agent = MockAgent::spawn().await.unwrap();
    let (_harness, session) = attach(&agent).await;

    let mut header = u32::MAX.to_be_bytes().to_vec();
    header.extend_from_slice(&[0, 0, 0, 1, 0, CMD_SET_EVENT, CMD_COMPOSITE]);
    agent.emit_raw(header);

    let reason = tokio::time::timeout(TIMEOUT, session.wait_terminated()).await.unwrap();
    assert_eq!(reason.code(), "protocol_error", "{reason:?}");
    assert!(agent.wait_closed(TIMEOUT).await);
}

#[tokio::test]
async fn undecodable_event_is_a_protocol_error() {
    let agent = MockAgent::spawn().await.unwrap();
    let (_harness, session) = attach(&agent).await;

    // A composite event that stops after its suspend policy.
    agent.emit_raw(encode_command(9_000, CMD_SET_EVENT, CMD_COMPOSITE, &[SUSPEND_POLICY_NONE]));

    let reason = tokio::time::timeout(TIMEOUT, session.wait_terminated()).await.unwrap();
    assert!(matches!(reason, TerminationReason::ProtocolError(_)), "{reason:?}");
}

#[tokio::test]
async fn reply_to_no_pending_command_is_dropped() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;
    let before = agent.commands().len();

    agent.emit_raw(encode_reply(9_999, ERROR_NONE, &[]));
    // Same socket, so the stray reply has been read once this arrives.
    agent.emit_event(
        SUSPEND_POLICY_NONE,
        vec![AgentEvent::UserLog {
            request_id: 1,
            thread: 1,
            level: 0,
            category: String::new(),
            message: "after".into(),
        }],
    );
    harness
        .expect(|n| matches!(n, Notification::OutputLine { line, .. } if line == "after"))
        .await;
    assert_eq!(session.snapshot().await.unwrap().state, SessionState::Running);

    assert_eq!(session.send(Intent::Continue).await.unwrap(), Ack::Ignored);
    assert_eq!(session.state(), SessionState::Running);
    assert!(session.termination_reason().is_none());
    assert_eq!(agent.commands().len(), before);
}

#[tokio::test]
async fn vm_death_reports_exit_code() {
    let agent = MockAgent::spawn().await.unwrap();
    let (_harness, session) = attach(&agent).await;

    agent.emit_event(
        SUSPEND_POLICY_NONE,
        vec![AgentEvent::VmDeath {
            request_id: 0,
            exit_code: 3,
        }],
    );
    let reason = tokio::time::timeout(TIMEOUT, session.wait_terminated()).await.unwrap();
    assert_eq!(reason, TerminationReason::TargetExited { exit_code: Some(3) });
}

#[tokio::test]
async fn dropped_connection_is_disconnected() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    agent.disconnect();
    let reason = tokio::time::timeout(TIMEOUT, session.wait_terminated()).await.unwrap();
    assert_eq!(reason, TerminationReason::Disconnected);

    let terminated = harness
        .expect(|n| matches!(n, Notification::Terminated { .. }))
        .await;
    assert_eq!(terminated.session(), session.id());
}
