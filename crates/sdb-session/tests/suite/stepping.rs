use sdb_session::{Ack, Intent, Notification, SessionError, SessionState, StepKind, StopReason};
use std::time::Duration;

use sdb_wire::mock::{MockAgent, MockAgentConfig, MAIN_THREAD_ID, PROCESS_METHOD_ID};
use sdb_wire::protocol::*;
use sdb_wire::{AgentEvent, EventModifier, Location};

use super::support::{attach, stop_at_line, TIMEOUT};

#[tokio::test]
async fn breakpoint_hit_publishes_resolved_frames() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    let hit = stop_at_line(&mut harness, &session, "Main.cs", 12).await;
    let Notification::BreakpointHit { thread, frame, .. } = hit else {
        unreachable!()
    };
    assert_eq!(thread, MAIN_THREAD_ID);
    let frame = frame.expect("top frame");
    assert_eq!(frame.method_name.as_deref(), Some("_Process"));
    assert_eq!(frame.line, Some(12));
    assert_eq!(frame.source_file.as_deref(), Some("/home/dev/game/Main.cs"));

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.state, SessionState::Suspended);
    let active = snapshot.active_frame.expect("active frame while suspended");
    assert_eq!(active.thread, MAIN_THREAD_ID);
    assert_eq!(active.frame, frame);

    let main = snapshot.threads.iter().find(|t| t.id == MAIN_THREAD_ID).unwrap();
    assert!(main.suspended);
    assert_eq!(main.name.as_deref(), Some("Main Thread"));
    let lines: Vec<_> = main
        .call_stack
        .iter()
        .map(|f| (f.method_name.as_deref(), f.line))
        .collect();
    assert_eq!(lines, [(Some("_Process"), Some(12)), (Some("_Ready"), Some(20))]);
}

#[tokio::test]
async fn step_over_stops_on_next_line() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;
    stop_at_line(&mut harness, &session, "Main.cs", 12).await;

    assert_eq!(session.send(Intent::Step(StepKind::Over)).await.unwrap(), Ack::Sent);
    let stopped = harness
        .expect(|n| matches!(n, Notification::Stopped { reason: StopReason::Step, .. }))
        .await;
    let Notification::Stopped { frame: Some(frame), .. } = stopped else {
        panic!("step stop without a frame: {stopped:?}");
    };
    assert_eq!(frame.line, Some(13));
    assert_eq!(
        frame.location,
        Location {
            method: PROCESS_METHOD_ID,
            il_offset: 12,
        }
    );

    let step = agent
        .event_requests()
        .into_iter()
        .find(|r| r.event_kind == EVENT_KIND_STEP)
        .expect("step request");
    assert_eq!(
        step.modifiers,
        [EventModifier::Step {
            thread: MAIN_THREAD_ID,
            size: STEP_SIZE_LINE,
            depth: STEP_DEPTH_OVER,
            filter: 0,
        }]
    );
    // The finished step is cleared so the next resume runs freely.
    assert!(agent.wait_for_command(CMD_SET_EVENT_REQUEST, CMD_EVENT_REQUEST_CLEAR, 1, TIMEOUT).await);
    assert!(agent.cleared_requests().contains(&(EVENT_KIND_STEP, step.request_id)));
    assert_eq!(session.state(), SessionState::Suspended);
}

#[tokio::test]
async fn step_out_requests_outer_depth() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;
    stop_at_line(&mut harness, &session, "Main.cs", 11).await;

    session.send(Intent::Step(StepKind::Out)).await.unwrap();
    harness
        .expect(|n| matches!(n, Notification::Stopped { reason: StopReason::Step, .. }))
        .await;
    let step = agent
        .event_requests()
        .into_iter()
        .find(|r| r.event_kind == EVENT_KIND_STEP)
        .unwrap();
    assert!(matches!(
        step.modifiers[..],
        [EventModifier::Step { depth: STEP_DEPTH_OUT, .. }]
    ));
}

#[tokio::test]
async fn intents_that_need_a_stop_are_rejected_while_running() {
    let agent = MockAgent::spawn().await.unwrap();
    let (_harness, session) = attach(&agent).await;
    let before = agent.commands().len();

    let err = session.send(Intent::Step(StepKind::Into)).await.unwrap_err();
    assert!(matches!(err, SessionError::NotSuspended));
    let err = session
        .send(Intent::Evaluate {
            expression: "delta".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotSuspended));
    assert_eq!(session.send(Intent::Continue).await.unwrap(), Ack::Ignored);

    // A snapshot round trip orders us after anything the loop would have sent.
    session.snapshot().await.unwrap();
    assert_eq!(agent.commands().len(), before);
    assert_eq!(session.state(), SessionState::Running);
}

#[tokio::test]
async fn pause_and_continue() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    assert_eq!(session.send(Intent::Pause).await.unwrap(), Ack::Sent);
    let stopped = harness
        .expect(|n| matches!(n, Notification::Stopped { .. }))
        .await;
    assert!(matches!(
        stopped,
        Notification::Stopped {
            reason: StopReason::Pause,
            thread: MAIN_THREAD_ID,
            ..
        }
    ));
    assert_eq!(agent.suspend_calls(), 1);
    assert_eq!(session.send(Intent::Pause).await.unwrap(), Ack::Ignored);

    let resumes = agent.resume_calls();
    assert_eq!(session.send(Intent::Continue).await.unwrap(), Ack::Sent);
    harness
        .expect(|n| matches!(n, Notification::StateChanged { state: SessionState::Running, .. }))
        .await;
    assert!(agent.wait_for_command(CMD_SET_VM, CMD_VM_RESUME, resumes as usize + 1, TIMEOUT).await);
    assert!(session.snapshot().await.unwrap().active_frame.is_none());
}

#[tokio::test]
async fn user_break_stops_the_session() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    agent.emit_event(
        SUSPEND_POLICY_ALL,
        vec![sdb_wire::AgentEvent::UserBreak {
            request_id: 1,
            thread: MAIN_THREAD_ID,
        }],
    );
    harness
        .expect(|n| matches!(n, Notification::Stopped { reason: StopReason::UserBreak, .. }))
        .await;
    assert_eq!(session.state(), SessionState::Suspended);
}

#[tokio::test]
async fn user_log_becomes_output() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, _session) = attach(&agent).await;

    agent.emit_event(
        SUSPEND_POLICY_NONE,
        vec![sdb_wire::AgentEvent::UserLog {
            request_id: 1,
            thread: MAIN_THREAD_ID,
            level: 0,
            category: "gameplay".into(),
            message: "spawned 3 enemies".into(),
        }],
    );
    let output = harness
        .expect(|n| matches!(n, Notification::OutputLine { .. }))
        .await;
    assert!(matches!(
        output,
        Notification::OutputLine { source: sdb_session::OutputSource::Agent, ref line, .. }
            if line == "[gameplay] spawned 3 enemies"
    ));
}

#[tokio::test]
async fn stop_suspends_before_its_frames_arrive() {
    let agent = MockAgent::spawn_with_config(MockAgentConfig {
        unanswered: vec![(CMD_SET_THREAD, CMD_THREAD_GET_FRAME_INFO)],
        ..MockAgentConfig::default()
    })
    .await
    .unwrap();
    let (mut harness, session) = attach(&agent).await;

    agent.emit_event(
        SUSPEND_POLICY_ALL,
        vec![AgentEvent::UserBreak {
            request_id: 1,
            thread: MAIN_THREAD_ID,
        }],
    );
    let state = tokio::time::timeout(TIMEOUT, session.wait_for_state(|s| s == SessionState::Suspended))
        .await
        .unwrap();
    assert_eq!(state, SessionState::Suspended);
    assert!(agent.wait_for_command(CMD_SET_THREAD, CMD_THREAD_GET_FRAME_INFO, 1, TIMEOUT).await);

    let snapshot = session.snapshot().await.unwrap();
    assert!(snapshot.active_frame.is_none());
    assert!(snapshot.threads.iter().all(|t| t.suspended));
    let early = harness.drain_for(Duration::from_millis(50)).await;
    assert!(
        !early.iter().any(|n| matches!(n, Notification::Stopped { .. })),
        "{early:?}"
    );

    // The frames never come, but the user can still let the game go.
    let resumes = agent.resume_calls();
    assert_eq!(session.send(Intent::Continue).await.unwrap(), Ack::Sent);
    assert_eq!(session.state(), SessionState::Running);
    assert!(agent.wait_for_command(CMD_SET_VM, CMD_VM_RESUME, resumes as usize + 1, TIMEOUT).await);
}

#[tokio::test]
async fn step_without_a_frame_uses_the_stopped_thread() {
    const WORKER: ThreadId = 7;
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;

    // The agent has no frames for this thread.
    agent.emit_event(
        SUSPEND_POLICY_ALL,
        vec![AgentEvent::UserBreak {
            request_id: 1,
            thread: WORKER,
        }],
    );
    let stopped = harness
        .expect(|n| matches!(n, Notification::Stopped { reason: StopReason::UserBreak, .. }))
        .await;
    assert!(matches!(stopped, Notification::Stopped { thread: WORKER, frame: None, .. }));
    assert!(session.snapshot().await.unwrap().active_frame.is_none());

    assert_eq!(session.send(Intent::Step(StepKind::Over)).await.unwrap(), Ack::Sent);
    let stepped = harness
        .expect(|n| matches!(n, Notification::Stopped { reason: StopReason::Step, .. }))
        .await;
    assert!(matches!(stepped, Notification::Stopped { thread: WORKER, .. }));

    let step_threads: Vec<_> = agent
        .event_requests()
        .iter()
        .filter(|r| r.event_kind == EVENT_KIND_STEP)
        .flat_map(|r| r.modifiers.clone())
        .filter_map(|m| match m {
            EventModifier::Step { thread, .. } => Some(thread),
            _ => None,
        })
        .collect();
    assert_eq!(step_threads, [WORKER]);
}
