use rexec_client::{CallStage, ClientError, ScriptCommand, ScriptExecutionState};
use rexec_tests::harness::agent::TestAgent;
use rexec_tests::harness::faults::{CallRecorder, HangAfterSend, StallBeforeSend};
use rexec_tests::harness::init_tracing;
use rexec_tests::harness::observer::RecordingObserver;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

#[tokio::test]
async fn cancel_before_start_reaches_agent_makes_no_remote_calls() {
    init_tracing();
    let agent = TestAgent::spawn().await.unwrap();
    let recorder = Arc::new(CallRecorder::default());
    let client = agent
        .client()
        .interceptor(recorder.clone())
        .interceptor(Arc::new(StallBeforeSend {
            operation: "StartScript",
        }))
        .build();

    let err = client
        .execute_script(
            ScriptCommand::new("echo never\n"),
            &cancel_after(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    match err {
        ClientError::OperationCancelled {
            stage, attempts, ..
        } => {
            assert_eq!(stage, CallStage::Connecting);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected connecting cancellation, got {other}"),
    }
    assert_eq!(recorder.count("CancelScript"), 0);
    assert_eq!(recorder.count("CompleteScript"), 0);
    assert_eq!(agent.workspace_count(), 0);
}

#[tokio::test]
async fn cancel_while_polling_cancels_then_completes_once() {
    let agent = TestAgent::spawn().await.unwrap();
    let recorder = Arc::new(CallRecorder::default());
    let observer = Arc::new(RecordingObserver::default());
    let client = agent
        .client()
        .interceptor(recorder.clone())
        .observer(observer.clone())
        .build();

    let err = client
        .execute_script(
            ScriptCommand::new("echo started\nexec sleep 30\n"),
            &cancel_after(Duration::from_millis(800)),
        )
        .await
        .unwrap_err();

    match err {
        ClientError::ScriptExecutionCancelled { logs, .. } => {
            assert_eq!(logs.first().map(|l| l.text.as_str()), Some("started"));
        }
        other => panic!("expected script cancellation, got {other}"),
    }
    assert!(recorder.count("CancelScript") >= 1);
    assert_eq!(recorder.count("CompleteScript"), 1);
    assert_eq!(recorder.calls().last(), Some(&"CompleteScript"));
    assert!(
        observer
            .states()
            .windows(2)
            .any(|w| w == [ScriptExecutionState::CancelRequested, ScriptExecutionState::Cancelling])
    );
    assert_eq!(observer.states().last(), Some(&ScriptExecutionState::Complete));
    assert_eq!(agent.workspace_count(), 0);
}

#[tokio::test]
async fn hung_complete_is_abandoned_after_cancellation() {
    let agent = TestAgent::spawn().await.unwrap();
    let client = agent
        .client()
        .interceptor(Arc::new(HangAfterSend {
            operation: "CompleteScript",
        }))
        .build();

    let started = Instant::now();
    let err = client
        .execute_script(
            ScriptCommand::new("exec sleep 30\n"),
            &cancel_after(Duration::from_millis(500)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::ScriptExecutionCancelled { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    // The agent never saw Complete, so the workspace is left for the cleaner.
    assert_eq!(agent.workspace_count(), 1);
}
