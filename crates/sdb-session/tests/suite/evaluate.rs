use sdb_session::{Ack, Intent, SessionError, SessionHandle};
use sdb_wire::mock::MockAgent;
use sdb_wire::protocol::*;

use super::support::{attach, stop_at_line};

async fn evaluate(session: &SessionHandle, expression: &str) -> Result<Ack, SessionError> {
    session
        .send(Intent::Evaluate {
            expression: expression.to_owned(),
        })
        .await
}

#[tokio::test]
async fn locals_of_the_active_frame() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;
    stop_at_line(&mut harness, &session, "Main.cs", 12).await;

    assert_eq!(evaluate(&session, "delta").await.unwrap(), Ack::Value("0.016".into()));
    assert_eq!(evaluate(&session, " count ").await.unwrap(), Ack::Value("3".into()));
    assert_eq!(
        evaluate(&session, "name").await.unwrap(),
        Ack::Value("\"player\"".into())
    );

    // Locals metadata is fetched once per method.
    assert_eq!(agent.command_count(CMD_SET_METHOD, CMD_METHOD_GET_LOCALS_INFO), 1);
    assert_eq!(agent.command_count(CMD_SET_STRING_REF, CMD_STRING_REF_GET_VALUE), 1);
}

#[tokio::test]
async fn unknown_names_and_expressions_fail() {
    let agent = MockAgent::spawn().await.unwrap();
    let (mut harness, session) = attach(&agent).await;
    stop_at_line(&mut harness, &session, "Main.cs", 12).await;

    let err = evaluate(&session, "health").await.unwrap_err();
    assert!(
        matches!(&err, SessionError::EvaluationFailed(message) if message.contains("health")),
        "{err:?}"
    );

    let before = agent.commands().len();
    let err = evaluate(&session, "delta * 2").await.unwrap_err();
    assert!(matches!(err, SessionError::EvaluationFailed(_)));
    assert_eq!(agent.commands().len(), before);
}
