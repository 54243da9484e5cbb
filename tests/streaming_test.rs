//! Tests for streaming predicts over a shared session.

use std::time::Duration;

use tempfile::NamedTempFile;

use eva_core::engine::scripted::EOS;
use eva_core::engine::{
    FinishReason, PredictInput, ScriptedEngine, ScriptedLoader, Session, SessionConfig,
    SessionError, SessionStatus, SharedSession, StopResult,
};

fn shared(config: SessionConfig) -> (SharedSession<ScriptedLoader>, NamedTempFile) {
    let model = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
    let mut session = Session::new(ScriptedLoader::new(ScriptedEngine::default()), config).unwrap();
    session.load(model.path()).unwrap();
    (SharedSession::new(session), model)
}

fn unbounded() -> SessionConfig {
    SessionConfig {
        max_predict: -1,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_stream_collects_reply() {
    let (shared, _model) = shared(SessionConfig::default());
    shared
        .lock()
        .engine_mut()
        .unwrap()
        .script_pieces(&["Hello", " world"])
        .script_token(EOS);

    let completion = shared
        .predict_stream(PredictInput::user("hi"), 4)
        .collect()
        .await
        .unwrap();

    assert_eq!(completion.content, "Hello world");
    assert_eq!(completion.summary.finish_reason, FinishReason::Stop);
    assert_eq!(completion.summary.tokens_generated, 3);
    assert_eq!(shared.lock().status(), SessionStatus::Loaded);
}

#[tokio::test]
async fn test_stream_ends_with_final_message() {
    let (shared, _model) = shared(SessionConfig {
        max_predict: 2,
        ..Default::default()
    });

    let mut stream = shared.predict_stream(PredictInput::user("hi"), 1);
    let mut chunks = Vec::new();
    let mut last = None;
    while let Some(item) = stream.next().await {
        let output = item.unwrap();
        if output.is_final {
            last = Some(output);
        } else {
            chunks.push(output.chunk.unwrap().text);
        }
    }

    assert_eq!(chunks, vec!["x".to_string(), "x".to_string()]);
    let last = last.unwrap();
    assert!(last.chunk.is_none());
    assert_eq!(last.finish_reason(), Some(&FinishReason::MaxTokens));
}

#[tokio::test]
async fn test_second_predict_while_streaming_is_busy() {
    let (shared, _model) = shared(unbounded());

    let mut first = shared.predict_stream(PredictInput::user("hi"), 1);
    first.next().await.unwrap().unwrap();

    let mut second = shared.predict_stream(PredictInput::user("again"), 1);
    assert!(matches!(
        second.next().await,
        Some(Err(SessionError::Busy))
    ));

    first.stop();
    let completion = first.collect().await.unwrap();
    assert_eq!(completion.summary.finish_reason, FinishReason::Cancelled);
}

#[tokio::test]
async fn test_dropping_stream_cancels_generation() {
    let (shared, _model) = shared(unbounded());

    let mut stream = shared.predict_stream(PredictInput::user("hi"), 1);
    stream.next().await.unwrap().unwrap();
    drop(stream);

    let result = shared.stop_and_wait(Duration::from_secs(5)).await;
    assert_eq!(result, StopResult::Idle);

    let session = shared.lock();
    assert_eq!(session.status(), SessionStatus::Loaded);
    assert_eq!(session.cache_snapshot().len(), session.state().n_past);
}

#[tokio::test]
async fn test_stop_handle_outside_lock() {
    let (shared, _model) = shared(unbounded());
    let handle = shared.stop_handle();

    let mut stream = shared.predict_stream(PredictInput::user("hi"), 8);
    stream.next().await.unwrap().unwrap();
    handle.request();

    let completion = stream.collect().await.unwrap();
    assert_eq!(completion.summary.finish_reason, FinishReason::Cancelled);
    assert!(completion.content.chars().all(|c| c == 'x'));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_right_after_start_is_kept() {
    for _ in 0..20 {
        let (shared, _model) = shared(unbounded());

        let stream = shared.predict_stream(PredictInput::user("hi"), 4);
        stream.stop();

        let completion = tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .expect("stopped generation must end")
            .unwrap();
        assert_eq!(completion.summary.finish_reason, FinishReason::Cancelled);
        assert_eq!(shared.lock().status(), SessionStatus::Loaded);
    }
}

#[tokio::test]
async fn test_stream_reports_predict_error() {
    let session = Session::new(ScriptedLoader::default(), SessionConfig::default()).unwrap();
    let shared = SharedSession::new(session);

    let mut stream = shared.predict_stream(PredictInput::user("hi"), 1);
    assert!(matches!(
        stream.next().await,
        Some(Err(SessionError::NotLoaded))
    ));
    assert!(stream.next().await.is_none());
}
