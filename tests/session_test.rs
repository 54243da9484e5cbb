//! Integration tests for the session engine: ledger sync, reset paths,
//! eviction, slot retries, stop conditions and events.

use std::thread;
use std::time::Duration;

use tempfile::NamedTempFile;

use eva_core::engine::scripted::{Granularity, KvOp, BOS, EOS};
use eva_core::engine::{
    ApplyOutcome, ChatTemplateState, FinishReason, Persona, PredictInput, ScriptedEngine,
    ScriptedLoader, Session, SessionConfig, SessionError, SessionStatus, TemplateFragments,
    FALLBACK_SYSTEM_PROMPT,
};
use eva_core::memory::{TokenId, FILLER_TOKEN};
use eva_core::telemetry::{ResetPath, SessionEvent};

/// BOS + "You are a helpful assistant.\n", one token per character.
const SYSTEM_PREFIX: usize = 30;

/// "\nuser: " + "hi" + "\nassistant: "
const HI_TURN: usize = 21;

fn model_file() -> NamedTempFile {
    tempfile::Builder::new().suffix(".gguf").tempfile().unwrap()
}

fn loaded_with(
    engine: ScriptedEngine,
    config: SessionConfig,
) -> (Session<ScriptedLoader>, NamedTempFile) {
    let model = model_file();
    let mut session = Session::new(ScriptedLoader::new(engine), config).unwrap();
    session.load(model.path()).unwrap();
    (session, model)
}

fn loaded() -> (Session<ScriptedLoader>, NamedTempFile) {
    loaded_with(ScriptedEngine::default(), SessionConfig::default())
}

fn engine(session: &mut Session<ScriptedLoader>) -> &mut ScriptedEngine {
    session.engine_mut().unwrap()
}

fn assert_in_sync(session: &Session<ScriptedLoader>) {
    let state = session.state();
    let cache = session.cache_snapshot();
    assert_eq!(cache.len(), state.n_past, "ledger length must equal n_past");
    for (i, entry) in cache.iter().enumerate() {
        assert_eq!(entry.position, i + 1);
    }
    let ids: Vec<TokenId> = cache.iter().map(|e| e.token_id).collect();
    assert_eq!(session.engine().unwrap().kv_tokens(), ids.as_slice());
    assert!(state.system_prefix_len <= state.n_past);
}

fn transcript(session: &Session<ScriptedLoader>) -> String {
    session
        .cache_snapshot()
        .into_iter()
        .map(|e| e.text)
        .collect()
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// Load
// =============================================================================

#[test]
fn test_load_decodes_system_prefix() {
    let (session, _model) = loaded();
    let state = session.state();

    assert_eq!(session.status(), SessionStatus::Loaded);
    assert_eq!(state.n_past, SYSTEM_PREFIX);
    assert_eq!(state.system_prefix_len, SYSTEM_PREFIX);
    assert_eq!(transcript(&session), "<s>You are a helpful assistant.\n");
    assert_eq!(session.antiprompts(), ["\nuser: ".to_string()]);
    assert!(!session.system_prompt_truncated());
    assert_in_sync(&session);
}

#[test]
fn test_load_missing_model_fails() {
    let mut session =
        Session::new(ScriptedLoader::default(), SessionConfig::default()).unwrap();
    let result = session.load("/nonexistent/model.gguf");

    assert!(matches!(result, Err(SessionError::ModelNotFound(_))));
    assert_eq!(session.status(), SessionStatus::Unloaded);
    assert!(session.cache_snapshot().is_empty());
}

#[test]
fn test_predict_without_model_is_rejected() {
    let mut session =
        Session::new(ScriptedLoader::default(), SessionConfig::default()).unwrap();
    assert!(matches!(
        session.predict(PredictInput::user("hi")),
        Err(SessionError::NotLoaded)
    ));
    assert!(matches!(
        session.reset(&ChatTemplateState::default()),
        Err(SessionError::NotLoaded)
    ));
}

#[test]
fn test_invalid_input_leaves_cache_alone() {
    let (mut session, _model) = loaded();
    assert!(matches!(
        session.predict(PredictInput::user("")),
        Err(SessionError::InvalidInput(_))
    ));
    assert_eq!(session.state().n_past, SYSTEM_PREFIX);
    assert!(!session.state().is_generating);
}

#[test]
fn test_reload_starts_from_scratch() {
    let (mut session, model) = loaded();
    engine(&mut session).script_pieces(&["ok"]).script_token(EOS);
    session.predict(PredictInput::user("hi")).unwrap().complete().unwrap();
    assert!(session.state().n_past > SYSTEM_PREFIX);

    session.load(model.path()).unwrap();
    assert_eq!(session.state().n_past, SYSTEM_PREFIX);
    assert_in_sync(&session);
}

#[test]
fn test_unload_releases_model() {
    let (mut session, _model) = loaded();
    session.unload();

    assert_eq!(session.status(), SessionStatus::Unloaded);
    assert!(session.model_info().is_none());
    assert!(session.cache_snapshot().is_empty());
    assert_eq!(session.state().n_past, 0);
    assert!(matches!(
        session.predict(PredictInput::user("hi")),
        Err(SessionError::NotLoaded)
    ));
}

#[test]
fn test_oversized_system_prompt_uses_fallback() {
    let config = SessionConfig {
        n_ctx: 64,
        ..Default::default()
    };
    let template = ChatTemplateState {
        persona: Persona {
            instruction: "Please be helpful. ".repeat(10),
            ..Persona::default()
        },
        ..Default::default()
    };
    let model = model_file();
    let mut session = Session::new(ScriptedLoader::default(), config)
        .unwrap()
        .with_template(template);
    session.load(model.path()).unwrap();

    assert!(session.system_prompt_truncated());
    assert_eq!(
        session.state().system_prefix_len,
        1 + FALLBACK_SYSTEM_PROMPT.chars().count()
    );
    assert_in_sync(&session);
}

// =============================================================================
// Predict
// =============================================================================

#[test]
fn test_predict_streams_until_eos() {
    let (mut session, _model) = loaded();
    engine(&mut session)
        .script_pieces(&["Hello", " there"])
        .script_token(EOS);

    let completion = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .complete()
        .unwrap();

    assert_eq!(completion.content, "Hello there");
    assert!(completion.reasoning.is_empty());
    assert_eq!(completion.summary.finish_reason, FinishReason::Stop);
    assert_eq!(completion.summary.tokens_generated, 3);

    // the EOS token is dropped, both pieces are in the cache
    let state = session.state();
    assert_eq!(state.n_past, SYSTEM_PREFIX + HI_TURN + 2);
    assert!(state.pending_input_tokens.is_empty());
    assert!(!state.is_generating);
    assert!(transcript(&session).ends_with("\nuser: hi\nassistant: Hello there"));
    assert_in_sync(&session);
}

#[test]
fn test_max_tokens_keeps_last_token_pending() {
    let config = SessionConfig {
        max_predict: 3,
        ..Default::default()
    };
    let (mut session, _model) = loaded_with(ScriptedEngine::default(), config);

    let completion = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .complete()
        .unwrap();

    assert_eq!(completion.content, "xxx");
    assert_eq!(completion.summary.finish_reason, FinishReason::MaxTokens);
    let state = session.state();
    assert_eq!(state.pending_input_tokens.len(), 1);
    assert_eq!(state.n_past, SYSTEM_PREFIX + HI_TURN + 2);

    // the carried token is decoded ahead of the next turn
    engine(&mut session).script_token(EOS);
    session.predict(PredictInput::user("hi")).unwrap().complete().unwrap();
    assert_eq!(session.state().n_past, SYSTEM_PREFIX + 2 * HI_TURN + 3);
    assert!(transcript(&session).contains("xxx\nuser: hi"));
    assert_in_sync(&session);
}

#[test]
fn test_antiprompt_is_not_rendered() {
    let mut template = ChatTemplateState::default();
    template.extra_stop_words.push("###".into());
    let model = model_file();
    let mut session = Session::new(ScriptedLoader::default(), SessionConfig::default())
        .unwrap()
        .with_template(template);
    session.load(model.path()).unwrap();
    engine(&mut session).script_pieces(&["answer", "###"]);

    let completion = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .complete()
        .unwrap();

    assert_eq!(completion.content, "answer");
    assert_eq!(
        completion.summary.finish_reason,
        FinishReason::StopWord { index: 1 }
    );
}

#[test]
fn test_antiprompt_split_across_tokens_is_held_back() {
    let mut template = ChatTemplateState::default();
    template.extra_stop_words.push("###".into());
    let model = model_file();
    let mut session = Session::new(ScriptedLoader::default(), SessionConfig::default())
        .unwrap()
        .with_template(template);
    session.load(model.path()).unwrap();
    engine(&mut session).script_pieces(&["done #", "#", "#"]);

    let chunks: Vec<String> = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .map(|c| c.unwrap().text)
        .collect();

    assert_eq!(chunks.concat(), "done ");
}

#[test]
fn test_prefix_stop_skips_next_prefix() {
    let (mut session, _model) = loaded();
    engine(&mut session).script_pieces(&["ok", "\nUser: "]);

    let completion = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .complete()
        .unwrap();
    assert_eq!(completion.content, "ok");
    assert_eq!(
        completion.summary.finish_reason,
        FinishReason::StopWord { index: 0 }
    );

    engine(&mut session).script_token(EOS);
    session
        .predict(PredictInput::user("again"))
        .unwrap()
        .complete()
        .unwrap();

    let text = transcript(&session);
    assert!(text.contains("ok\nUser: again\nassistant: "));
    assert_eq!(text.matches("\nuser: ").count(), 1);
    assert_in_sync(&session);
}

#[test]
fn test_tool_turn_uses_tool_prefix() {
    let (mut session, _model) = loaded();
    engine(&mut session).script_token(EOS);
    session.predict(PredictInput::tool("42")).unwrap().complete().unwrap();
    assert!(transcript(&session).ends_with("\ntool: 42\nassistant: "));
}

#[test]
fn test_reasoning_block_is_tagged() {
    let (mut session, _model) = loaded();
    engine(&mut session)
        .script_pieces(&["<think>", "hmm", "</think>", "Answer"])
        .script_token(EOS);

    let completion = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .complete()
        .unwrap();

    assert_eq!(completion.reasoning, "<think>hmm</think>");
    assert_eq!(completion.content, "Answer");
    assert!(!session.state().think_mode);
}

#[test]
fn test_antiprompt_inside_reasoning_is_ignored() {
    let mut template = ChatTemplateState::default();
    template.extra_stop_words.push("###".into());
    let model = model_file();
    let mut session = Session::new(ScriptedLoader::default(), SessionConfig::default())
        .unwrap()
        .with_template(template);
    session.load(model.path()).unwrap();
    engine(&mut session)
        .script_pieces(&["<think>", "###", "\nuser: ", "</think>", "fine"])
        .script_token(EOS);

    let completion = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .complete()
        .unwrap();

    assert_eq!(completion.summary.finish_reason, FinishReason::Stop);
    assert_eq!(completion.reasoning, "<think>###\nuser: </think>");
    assert_eq!(completion.content, "fine");
}

#[test]
fn test_template_leak_stops_generation() {
    let (mut session, _model) = loaded();
    engine(&mut session).script_pieces(&["<|", "im_end|>", "more"]);

    let completion = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .complete()
        .unwrap();

    assert_eq!(completion.summary.finish_reason, FinishReason::TemplateLeak);
    assert_eq!(completion.content, "<|im_end|>");
}

#[test]
fn test_completion_mode_has_no_wrapping() {
    let (mut session, _model) = loaded();
    let outcome = session.reset(&ChatTemplateState::completion()).unwrap();
    assert_eq!(outcome.path, ResetPath::Full);
    assert_eq!(outcome.system_prefix_len, 1);
    assert!(session.antiprompts().is_empty());

    engine(&mut session).script_pieces(&[" upon", "<|x|>"]).script_token(EOS);
    let completion = session
        .predict(PredictInput::user("Once"))
        .unwrap()
        .complete()
        .unwrap();

    // leak detection is off without a chat frame
    assert_eq!(completion.content, " upon<|x|>");
    assert_eq!(transcript(&session), "<s>Once upon<|x|>");
    assert_in_sync(&session);
}

#[test]
fn test_completion_turns_share_one_bos() {
    let (mut session, _model) = loaded();
    session.reset(&ChatTemplateState::completion()).unwrap();

    engine(&mut session).script_pieces(&[" upon"]).script_token(EOS);
    session.predict(PredictInput::user("Once")).unwrap().complete().unwrap();
    engine(&mut session).script_pieces(&[" a time"]).script_token(EOS);
    session.predict(PredictInput::user(" there")).unwrap().complete().unwrap();

    let cache = session.cache_snapshot();
    let bos: Vec<usize> = cache
        .iter()
        .filter(|e| e.token_id == BOS)
        .map(|e| e.position)
        .collect();
    assert_eq!(bos, vec![1]);
    assert_eq!(session.state().system_prefix_len, 1);
    assert_eq!(transcript(&session), "<s>Once upon there a time");
    assert_in_sync(&session);
}

#[test]
fn test_switching_to_completion_mode_clears_cache() {
    let (mut session, _model) = loaded();
    let chat = ChatTemplateState::with_fragments(TemplateFragments {
        system_prompt: String::new(),
        input_prefix: "\nuser: ".into(),
        input_suffix: "\nassistant: ".into(),
        tool_prefix: "\ntool: ".into(),
    });
    let outcome = session.reset(&chat).unwrap();
    assert_eq!(outcome.system_prefix_len, 1);

    let outcome = session.reset(&ChatTemplateState::completion()).unwrap();
    assert_eq!(outcome.path, ResetPath::Full);
    let outcome = session.reset(&ChatTemplateState::completion()).unwrap();
    assert_eq!(outcome.path, ResetPath::Partial);
}

#[test]
fn test_split_utf8_is_reassembled() {
    let (mut session, _model) = loaded_with(
        ScriptedEngine::new(Granularity::Byte),
        SessionConfig::default(),
    );
    engine(&mut session)
        .script_bytes(&[&[0xE4], &[0xB8], &[0xAD], b"!"])
        .script_token(EOS);

    let chunks: Vec<String> = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .map(|c| c.unwrap().text)
        .collect();

    assert_eq!(chunks, vec!["中".to_string(), "!".to_string()]);
    assert_in_sync(&session);
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_stop_handle_cancels_unbounded_generation() {
    let config = SessionConfig {
        max_predict: -1,
        ..Default::default()
    };
    let (mut session, _model) = loaded_with(ScriptedEngine::default(), config);
    let handle = session.stop_handle();

    let mut generation = session.predict(PredictInput::user("hi")).unwrap();
    let mut received = 0;
    for chunk in generation.by_ref() {
        chunk.unwrap();
        received += 1;
        if received == 5 {
            handle.request();
        }
    }
    let summary = generation.summary().cloned().unwrap();
    drop(generation);

    assert_eq!(summary.finish_reason, FinishReason::Cancelled);
    assert_eq!(summary.tokens_generated, 5);
    assert_eq!(session.status(), SessionStatus::Loaded);
    assert_eq!(session.state().pending_input_tokens.len(), 1);
    assert_in_sync(&session);
}

#[test]
fn test_dropping_generation_cancels() {
    let (mut session, _model) = loaded();
    let mut events = session.subscribe();

    let mut generation = session.predict(PredictInput::user("hi")).unwrap();
    generation.next().unwrap().unwrap();
    drop(generation);

    assert_eq!(session.status(), SessionStatus::Loaded);
    let finished = drain(&mut events).into_iter().find_map(|e| match e {
        SessionEvent::GenerationFinished { reason, .. } => Some(reason),
        _ => None,
    });
    assert_eq!(finished, Some(FinishReason::Cancelled));

    // the session accepts the next turn
    engine(&mut session).script_token(EOS);
    session.predict(PredictInput::user("hi")).unwrap().complete().unwrap();
    assert_in_sync(&session);
}

#[test]
fn test_wait_idle_after_generation_ends() {
    let (mut session, _model) = loaded();
    let handle = session.stop_handle();
    engine(&mut session).script_token(EOS);
    session.predict(PredictInput::user("hi")).unwrap().complete().unwrap();

    let result = tokio_test::block_on(handle.wait_idle(Duration::from_millis(50)));
    assert_eq!(result, eva_core::engine::StopResult::Idle);
}

// =============================================================================
// Reset
// =============================================================================

#[test]
fn test_reset_with_same_prompt_keeps_prefix() {
    let (mut session, _model) = loaded();
    engine(&mut session).script_pieces(&["ok"]).script_token(EOS);
    session.predict(PredictInput::user("hi")).unwrap().complete().unwrap();
    let prefix: Vec<_> = session.cache_snapshot()[..SYSTEM_PREFIX].to_vec();

    let outcome = session.reset(&ChatTemplateState::default()).unwrap();

    assert_eq!(outcome.path, ResetPath::Partial);
    assert_eq!(session.state().n_past, SYSTEM_PREFIX);
    assert_eq!(session.cache_snapshot(), prefix);
    let ops = engine(&mut session).kv_ops();
    assert!(ops.contains(&KvOp::Remove {
        from: SYSTEM_PREFIX,
        to: None
    }));
    // only the clear from load
    assert_eq!(ops.iter().filter(|op| **op == KvOp::Clear).count(), 1);
    assert_in_sync(&session);
}

#[test]
fn test_reset_with_new_prompt_is_full() {
    let (mut session, _model) = loaded();
    engine(&mut session).script_pieces(&["ok"]).script_token(EOS);
    session.predict(PredictInput::user("hi")).unwrap().complete().unwrap();
    let clears_before = engine(&mut session)
        .kv_ops()
        .iter()
        .filter(|op| **op == KvOp::Clear)
        .count();

    let template = ChatTemplateState {
        persona: Persona {
            instruction: "Answer in French.".into(),
            ..Persona::default()
        },
        ..Default::default()
    };
    let outcome = session.reset(&template).unwrap();

    assert_eq!(outcome.path, ResetPath::Full);
    assert_eq!(outcome.system_prefix_len, 1 + "Answer in French.\n".len());
    assert_eq!(transcript(&session), "<s>Answer in French.\n");
    let clears_after = engine(&mut session)
        .kv_ops()
        .iter()
        .filter(|op| **op == KvOp::Clear)
        .count();
    assert_eq!(clears_after, clears_before + 1);
    assert_in_sync(&session);
}

#[test]
fn test_reset_resets_sampler() {
    let (mut session, _model) = loaded();
    let before = engine(&mut session).sampler_resets();
    session.reset(&ChatTemplateState::default()).unwrap();
    assert_eq!(engine(&mut session).sampler_resets(), before + 1);
}

// =============================================================================
// Settings
// =============================================================================

#[test]
fn test_sampling_change_resets_in_place() {
    let (mut session, _model) = loaded();
    engine(&mut session).script_pieces(&["ok"]).script_token(EOS);
    session.predict(PredictInput::user("hi")).unwrap().complete().unwrap();

    let mut config = session.config().clone();
    config.sampling.temperature = 0.1;
    config.max_predict = 2;
    let outcome = session.apply_config(config).unwrap();

    let ApplyOutcome::Reset(reset) = outcome.clone() else {
        panic!("expected a reset, got {outcome:?}");
    };
    assert_eq!(reset.path, ResetPath::Partial);
    assert_eq!(session.state().n_past, SYSTEM_PREFIX);
    assert_eq!(engine(&mut session).sampling().temperature, 0.1);

    // the new predict bound applies to the next generation
    let completion = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .complete()
        .unwrap();
    assert_eq!(completion.summary.finish_reason, FinishReason::MaxTokens);
    assert_eq!(completion.content, "xx");
    assert_in_sync(&session);
}

#[test]
fn test_context_change_reloads_model() {
    let (mut session, _model) = loaded();
    engine(&mut session).script_pieces(&["ok"]).script_token(EOS);
    session.predict(PredictInput::user("hi")).unwrap().complete().unwrap();

    let config = SessionConfig {
        n_ctx: 128,
        ..session.config().clone()
    };
    let outcome = session.apply_config(config).unwrap();

    let ApplyOutcome::Reloaded(info) = outcome.clone() else {
        panic!("expected a reload, got {outcome:?}");
    };
    assert_eq!(info.max_context, 128);
    assert_eq!(session.status(), SessionStatus::Loaded);
    assert_eq!(session.state().n_past, SYSTEM_PREFIX);
    assert_eq!(
        session.cache_fill_percent(),
        SYSTEM_PREFIX as f32 / 128.0 * 100.0
    );
    assert_in_sync(&session);
}

#[test]
fn test_lora_change_reloads_with_adapter() {
    let (mut session, _model) = loaded();
    let adapter = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();

    let config = SessionConfig {
        lora_path: Some(adapter.path().to_path_buf()),
        ..session.config().clone()
    };
    let outcome = session.apply_config(config).unwrap();
    assert!(matches!(outcome, ApplyOutcome::Reloaded(_)));
    assert_eq!(session.engine().unwrap().lora_path(), Some(adapter.path()));

    let missing = SessionConfig {
        lora_path: Some("/nonexistent/adapter.gguf".into()),
        ..session.config().clone()
    };
    assert!(matches!(
        session.apply_config(missing),
        Err(SessionError::Load(_))
    ));
    assert_eq!(session.status(), SessionStatus::Unloaded);
}

#[test]
fn test_same_config_is_unchanged() {
    let (mut session, _model) = loaded();
    let clears = engine(&mut session).kv_ops().len();
    let config = session.config().clone();

    assert_eq!(session.apply_config(config).unwrap(), ApplyOutcome::Unchanged);
    assert_eq!(engine(&mut session).kv_ops().len(), clears);
}

#[test]
fn test_config_without_model_is_stored() {
    let model = model_file();
    let mut session =
        Session::new(ScriptedLoader::default(), SessionConfig::default()).unwrap();
    let config = SessionConfig {
        n_ctx: 256,
        ..Default::default()
    };
    assert_eq!(session.apply_config(config).unwrap(), ApplyOutcome::Stored);

    let info = session.load(model.path()).unwrap();
    assert_eq!(info.max_context, 256);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (mut session, _model) = loaded();
    let config = SessionConfig {
        n_ctx: 8,
        ..Default::default()
    };
    assert!(matches!(
        session.apply_config(config),
        Err(SessionError::InvalidConfig(_))
    ));
    assert_eq!(session.config().n_ctx, 4096);
    assert_eq!(session.status(), SessionStatus::Loaded);
}

// =============================================================================
// Context window
// =============================================================================

#[test]
fn test_eviction_keeps_system_prefix() {
    let config = SessionConfig {
        n_ctx: 64,
        max_predict: 40,
        ..Default::default()
    };
    let (mut session, _model) = loaded_with(ScriptedEngine::default(), config);
    let prefix: Vec<_> = session.cache_snapshot();
    let mut events = session.subscribe();

    let completion = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .complete()
        .unwrap();

    assert_eq!(completion.summary.finish_reason, FinishReason::MaxTokens);
    let discarded: Vec<usize> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Truncated { discarded } => Some(discarded),
            _ => None,
        })
        .collect();
    assert!(!discarded.is_empty());
    assert!(discarded.iter().all(|&d| d == (62 - SYSTEM_PREFIX) / 2));

    let state = session.state();
    assert!(state.n_past < 64);
    assert_eq!(state.system_prefix_len, SYSTEM_PREFIX);
    assert_eq!(&session.cache_snapshot()[..SYSTEM_PREFIX], prefix.as_slice());
    assert_in_sync(&session);
}

#[test]
fn test_long_turn_is_clamped_to_window() {
    let config = SessionConfig {
        n_ctx: 64,
        ..Default::default()
    };
    let (mut session, _model) = loaded_with(ScriptedEngine::default(), config);
    let mut events = session.subscribe();
    engine(&mut session).script_token(EOS);

    session
        .predict(PredictInput::user("a".repeat(100)))
        .unwrap()
        .complete()
        .unwrap();

    // 7 + 100 + 12 queued, room for 64 - 4 - 30
    let skipped = drain(&mut events).into_iter().find_map(|e| match e {
        SessionEvent::InputTrimmed { skipped } => Some(skipped),
        _ => None,
    });
    assert_eq!(skipped, Some(119 - 30));
    assert_eq!(session.state().n_past, SYSTEM_PREFIX + 30);
    assert_in_sync(&session);
}

// =============================================================================
// Slot failures
// =============================================================================

#[test]
fn test_slot_failure_inserts_fillers() {
    let (mut session, _model) = loaded();
    let mut events = session.subscribe();
    engine(&mut session).fail_slots(2).script_token(EOS);

    session.predict(PredictInput::user("hi")).unwrap().complete().unwrap();

    let cache = session.cache_snapshot();
    assert!(cache[SYSTEM_PREFIX].is_filler());
    assert!(cache[SYSTEM_PREFIX + 1].is_filler());
    assert_eq!(cache[SYSTEM_PREFIX].token_id, FILLER_TOKEN);
    assert_eq!(session.state().n_past, SYSTEM_PREFIX + 2 + HI_TURN);

    let fillers: Vec<usize> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::FillerInserted { n_past } => Some(n_past),
            _ => None,
        })
        .collect();
    assert_eq!(fillers, vec![SYSTEM_PREFIX + 1, SYSTEM_PREFIX + 2]);
    assert_in_sync(&session);
}

#[test]
fn test_stop_interrupts_slot_retry() {
    let config = SessionConfig {
        n_ctx: 256,
        ..Default::default()
    };
    let (mut session, _model) = loaded_with(ScriptedEngine::default(), config);
    engine(&mut session).fail_slots(usize::MAX);
    let handle = session.stop_handle();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        handle.request();
    });
    let completion = session
        .predict(PredictInput::user("hi"))
        .unwrap()
        .complete()
        .unwrap();
    stopper.join().unwrap();

    assert_eq!(completion.summary.finish_reason, FinishReason::Cancelled);
    assert_eq!(completion.summary.tokens_generated, 0);
    let state = session.state();
    assert_eq!(session.cache_snapshot().len(), state.n_past);
    assert!(state.pending_input_tokens.is_empty());
}

// =============================================================================
// Events and introspection
// =============================================================================

#[test]
fn test_generation_emits_summary_and_snapshot() {
    let (mut session, _model) = loaded();
    let mut events = session.subscribe();
    engine(&mut session).script_pieces(&["ok"]).script_token(EOS);

    session.predict(PredictInput::user("hi")).unwrap().complete().unwrap();
    let events = drain(&mut events);

    let finished = events.iter().find_map(|e| match e {
        SessionEvent::GenerationFinished {
            tokens_generated,
            reason,
            ..
        } => Some((*tokens_generated, reason.clone())),
        _ => None,
    });
    assert_eq!(finished, Some((2, FinishReason::Stop)));

    let last_snapshot = events.iter().rev().find_map(|e| match e {
        SessionEvent::CacheSnapshot(entries) => Some(entries.clone()),
        _ => None,
    });
    assert_eq!(last_snapshot, Some(session.cache_snapshot()));

    let fill = events.iter().rev().find_map(|e| match e {
        SessionEvent::CacheFill { n_past, n_ctx, .. } => Some((*n_past, *n_ctx)),
        _ => None,
    });
    assert_eq!(fill, Some((session.state().n_past, 4096)));
}

#[test]
fn test_reset_emits_event() {
    let (mut session, _model) = loaded();
    let mut events = session.subscribe();
    session.reset(&ChatTemplateState::default()).unwrap();

    assert!(drain(&mut events).contains(&SessionEvent::ResetCompleted {
        path: ResetPath::Partial,
        system_prefix_len: SYSTEM_PREFIX,
        system_prompt_truncated: false,
    }));
}

#[test]
fn test_vocabulary_lists_pieces() {
    let (session, _model) = loaded();
    let vocab = session.vocabulary().unwrap();
    assert_eq!(vocab[2], (EOS, "</s>".to_string()));
    assert!(vocab.iter().any(|(_, text)| text == "x"));
}

#[test]
fn test_cache_json_lists_rows() {
    let (session, _model) = loaded();
    let json = session.cache_json().unwrap();
    let rows: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();

    assert_eq!(rows.len(), SYSTEM_PREFIX);
    assert_eq!(rows[0]["position"], 1);
    assert_eq!(rows[0]["token_id"], BOS);
    assert_eq!(rows[0]["text"], "<s>");
}

#[test]
fn test_cache_fill_percent() {
    let (session, _model) = loaded();
    let expected = SYSTEM_PREFIX as f32 / 4096.0 * 100.0;
    assert!((session.cache_fill_percent() - expected).abs() < 0.01);
}
