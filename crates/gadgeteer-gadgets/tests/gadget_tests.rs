//! Tests for gadgeteer-gadgets: parser, registry, and the executor

use gadgeteer_core::{Field, ParamSchema};
use gadgeteer_gadgets::*;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ===========================================================================
// Test gadgets
// ===========================================================================

struct EchoGadget;

#[async_trait::async_trait]
impl Gadget for EchoGadget {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given message back."
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::object(vec![Field::new("message", ParamSchema::String)])
    }

    fn examples(&self) -> Vec<GadgetExample> {
        vec![GadgetExample {
            description: "Echo a greeting".into(),
            parameters: json!({"message": "hi"}),
        }]
    }

    async fn execute(&self, params: Value, _ctx: &ExecutionContext) -> GadgetResult<GadgetOutput> {
        let message = params["message"].as_str().unwrap_or_default();
        Ok(GadgetOutput::text(format!("Echo: {}", message)))
    }
}

struct FailGadget;

#[async_trait::async_trait]
impl Gadget for FailGadget {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Always fails."
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::object(vec![])
    }

    async fn execute(&self, _params: Value, _ctx: &ExecutionContext) -> GadgetResult<GadgetOutput> {
        Err(GadgetError::failed("deliberate failure"))
    }
}

/// Sleeps for `ms`, recording start order; used for scheduling tests.
struct SlowGadget {
    order: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Gadget for SlowGadget {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleep then report."
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::object(vec![
            Field::new("label", ParamSchema::String),
            Field::new("ms", ParamSchema::optional(ParamSchema::Integer)),
        ])
    }

    fn timeout_ms(&self) -> Option<u64> {
        Some(5_000)
    }

    async fn execute(&self, params: Value, ctx: &ExecutionContext) -> GadgetResult<GadgetOutput> {
        let label = params["label"].as_str().unwrap_or_default().to_string();
        let ms = params["ms"].as_u64().unwrap_or(20);
        self.order.lock().unwrap().push(label.clone());
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            _ = ctx.signal().cancelled() => return Err(GadgetError::failed("interrupted")),
        }
        Ok(GadgetOutput::text(format!("done: {}", label)))
    }
}

struct HangGadget;

#[async_trait::async_trait]
impl Gadget for HangGadget {
    fn name(&self) -> &str {
        "hang"
    }

    fn description(&self) -> &str {
        "Never returns."
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::object(vec![])
    }

    fn timeout_ms(&self) -> Option<u64> {
        Some(30)
    }

    async fn execute(&self, _params: Value, _ctx: &ExecutionContext) -> GadgetResult<GadgetOutput> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

fn call(name: &str, id: &str, params: Value, deps: &[&str]) -> ParsedGadgetCall {
    ParsedGadgetCall {
        gadget_name: name.into(),
        invocation_id: id.into(),
        parameters_raw: String::new(),
        parameters: Some(params),
        parse_error: None,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
    }
}

fn test_registry(order: Arc<Mutex<Vec<String>>>) -> Arc<GadgetRegistry> {
    let mut registry = GadgetRegistry::new();
    registry.register(EchoGadget).unwrap();
    registry.register(FailGadget).unwrap();
    registry.register(SlowGadget { order }).unwrap();
    registry.register(HangGadget).unwrap();
    Arc::new(registry)
}

fn executor(mode: ExecutionMode, order: Arc<Mutex<Vec<String>>>) -> GadgetExecutor {
    GadgetExecutor::new(
        test_registry(order),
        ExecutorConfig {
            mode,
            ..Default::default()
        },
    )
}

// ===========================================================================
// StreamParser
// ===========================================================================

#[test]
fn parser_text_only_passes_through() {
    let mut parser = StreamParser::default();
    let mut text = String::new();
    for event in parser.feed("Hello, ").into_iter().chain(parser.feed("world!")) {
        match event {
            ParseEvent::Text(t) => text.push_str(&t),
            ParseEvent::Call(_) => panic!("unexpected call"),
        }
    }
    for event in parser.finalize() {
        if let ParseEvent::Text(t) = event {
            text.push_str(&t);
        }
    }
    assert_eq!(text, "Hello, world!");
}

#[test]
fn parser_extracts_call_with_text_around_it() {
    let mut parser = StreamParser::default();
    let stream = "before\n!!!GADGET_START:echo:gadget_9\n!!!ARG:message\nhi there\n!!!GADGET_END\nafter";
    let mut events = parser.feed(stream);
    events.extend(parser.finalize());

    let texts: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ParseEvent::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(texts.join(""), "before\nafter");

    let calls: Vec<&ParsedGadgetCall> = events
        .iter()
        .filter_map(|e| match e {
            ParseEvent::Call(c) => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].gadget_name, "echo");
    assert_eq!(calls[0].invocation_id, "gadget_9");
    assert_eq!(calls[0].parameters, Some(json!({"message": "hi there"})));
    assert!(calls[0].parse_error.is_none());
}

#[test]
fn parser_survives_byte_by_byte_chunking() {
    let stream = "intro\n!!!GADGET_START:echo\n!!!ARG:message\nsplit me\n!!!GADGET_END\noutro";
    let mut parser = StreamParser::default();
    let mut events = Vec::new();
    for ch in stream.chars() {
        events.extend(parser.feed(&ch.to_string()));
    }
    events.extend(parser.finalize());

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            ParseEvent::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "intro\noutro");

    let calls: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ParseEvent::Call(c) => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].parameters, Some(json!({"message": "split me"})));
}

#[test]
fn parser_allocates_ids_when_absent() {
    let mut parser = StreamParser::default();
    let mut events =
        parser.feed("!!!GADGET_START:echo\n!!!ARG:message\na\n!!!GADGET_END\n");
    events.extend(parser.feed("!!!GADGET_START:echo\n!!!ARG:message\nb\n!!!GADGET_END\n"));
    let ids: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            ParseEvent::Call(c) => Some(c.invocation_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    assert!(ids[0].starts_with("gadget_"));
}

#[test]
fn parser_parses_dependency_list() {
    let mut parser = StreamParser::default();
    let events = parser.feed("!!!GADGET_START:echo:b:a1,a2\n!!!ARG:message\nx\n!!!GADGET_END\n");
    let ParseEvent::Call(call) = &events[0] else {
        panic!("expected call");
    };
    assert_eq!(call.dependencies, vec!["a1", "a2"]);

    let mut parser = StreamParser::default();
    let events = parser.feed("!!!GADGET_START:echo:b:\n!!!ARG:message\nx\n!!!GADGET_END\n");
    let ParseEvent::Call(call) = &events[0] else {
        panic!("expected call");
    };
    assert!(call.dependencies.is_empty());
}

#[test]
fn parser_tolerates_missing_end_marker() {
    // Second block starts before the first was closed: implicit end.
    let mut parser = StreamParser::default();
    let events = parser.feed(
        "!!!GADGET_START:echo:one\n!!!ARG:message\nfirst\n!!!GADGET_START:echo:two\n!!!ARG:message\nsecond\n!!!GADGET_END\n",
    );
    let calls: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ParseEvent::Call(c) => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].invocation_id, "one");
    assert_eq!(calls[0].parameters, Some(json!({"message": "first"})));
    assert_eq!(calls[1].invocation_id, "two");
}

#[test]
fn parser_strips_markdown_fence() {
    let mut parser = StreamParser::default();
    let events = parser.feed(
        "!!!GADGET_START:echo:f1\n```toml\n!!!ARG:message\nfenced\n```\n!!!GADGET_END\n",
    );
    let ParseEvent::Call(call) = &events[0] else {
        panic!("expected call");
    };
    assert_eq!(call.parameters, Some(json!({"message": "fenced"})));
}

#[test]
fn parser_finalize_emits_partial_call() {
    let mut parser = StreamParser::default();
    let events = parser.feed("!!!GADGET_START:echo:p1\n!!!ARG:message\ncut off");
    assert!(events.is_empty());
    let events = parser.finalize();
    let ParseEvent::Call(call) = &events[0] else {
        panic!("expected call");
    };
    assert_eq!(call.invocation_id, "p1");
    assert_eq!(call.parameters, Some(json!({"message": "cut off"})));
}

#[test]
fn parser_flags_malformed_paths() {
    let mut parser = StreamParser::default();
    let events = parser.feed("!!!GADGET_START:echo:m1\n!!!ARG:a//b\nx\n!!!GADGET_END\n");
    let ParseEvent::Call(call) = &events[0] else {
        panic!("expected call");
    };
    assert!(call.parse_error.as_deref().unwrap().contains("incomplete path"));
    assert!(call.parameters.is_none());
}

#[test]
fn parser_infers_value_types() {
    let mut parser = StreamParser::default();
    let events = parser.feed(
        "!!!GADGET_START:echo:t1\n!!!ARG:flag\ntrue\n!!!ARG:count\n7\n!!!ARG:ratio\n0.5\n!!!ARG:name\nplain\n!!!GADGET_END\n",
    );
    let ParseEvent::Call(call) = &events[0] else {
        panic!("expected call");
    };
    assert_eq!(
        call.parameters,
        Some(json!({"flag": true, "count": 7, "ratio": 0.5, "name": "plain"}))
    );
}

#[test]
fn parser_repeated_paths_build_arrays() {
    let mut parser = StreamParser::default();
    let events = parser.feed(
        "!!!GADGET_START:echo:r1\n!!!ARG:item\na\n!!!ARG:item\nb\n!!!GADGET_END\n",
    );
    let ParseEvent::Call(call) = &events[0] else {
        panic!("expected call");
    };
    assert_eq!(call.parameters, Some(json!({"item": ["a", "b"]})));
}

#[test]
fn parse_serialize_roundtrip() {
    let original = call(
        "echo",
        "gadget_42",
        json!({"message": "round trip", "nested": {"n": 3}, "flags": [true, false]}),
        &["gadget_40", "gadget_41"],
    );
    let syntax = WireSyntax::default();
    let wire = original.serialize(&syntax);

    let mut parser = StreamParser::new(syntax.clone());
    let mut events = parser.feed(&wire);
    events.extend(parser.finalize());
    let ParseEvent::Call(reparsed) = &events[0] else {
        panic!("expected call");
    };
    assert_eq!(reparsed.gadget_name, original.gadget_name);
    assert_eq!(reparsed.invocation_id, original.invocation_id);
    assert_eq!(reparsed.dependencies, original.dependencies);
    assert_eq!(reparsed.parameters, original.parameters);
    assert!(reparsed.parse_error.is_none());
}

#[test]
fn parser_custom_prefixes() {
    let syntax = WireSyntax {
        start_prefix: "@@CALL:".into(),
        arg_prefix: "@@ARG:".into(),
        end_marker: "@@END".into(),
    };
    let mut parser = StreamParser::new(syntax);
    let events = parser.feed("@@CALL:echo:c1\n@@ARG:message\ncustom\n@@END\n");
    let ParseEvent::Call(call) = &events[0] else {
        panic!("expected call");
    };
    assert_eq!(call.parameters, Some(json!({"message": "custom"})));
}

// ===========================================================================
// GadgetRegistry
// ===========================================================================

#[test]
fn registry_lookup_miss_lists_names() {
    let registry = test_registry(Arc::new(Mutex::new(Vec::new())));
    let message = registry.unknown_gadget_message("nope");
    assert!(message.contains("echo"));
    assert!(message.contains("fail"));
    assert!(message.contains("slow"));
}

#[test]
fn registry_usage_text_includes_schema_and_examples() {
    let registry = test_registry(Arc::new(Mutex::new(Vec::new())));
    let usage = registry.usage_text("echo").unwrap();
    assert!(usage.contains("Gadget Usage: echo"));
    assert!(usage.contains("\"message\""));
    assert!(usage.contains("Echo a greeting"));
}

#[test]
fn registry_definitions_prompt_covers_every_gadget() {
    let registry = test_registry(Arc::new(Mutex::new(Vec::new())));
    let prompt = registry.definitions_prompt();
    for name in registry.list() {
        assert!(prompt.contains(&format!("Gadget Usage: {}", name)));
    }
}

#[test]
fn registry_rejects_bad_schema() {
    struct BadGadget;

    #[async_trait::async_trait]
    impl Gadget for BadGadget {
        fn name(&self) -> &str {
            "bad"
        }
        fn description(&self) -> &str {
            "broken schema"
        }
        fn schema(&self) -> ParamSchema {
            ParamSchema::Enum { variants: vec![] }
        }
        async fn execute(
            &self,
            _params: Value,
            _ctx: &ExecutionContext,
        ) -> GadgetResult<GadgetOutput> {
            Ok(GadgetOutput::default())
        }
    }

    let mut registry = GadgetRegistry::new();
    assert!(registry.register(BadGadget).is_err());
    assert!(!registry.contains("bad"));
}

// ===========================================================================
// GadgetExecutor
// ===========================================================================

#[tokio::test]
async fn executor_runs_single_call() {
    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())));
    let results = executor
        .run(
            vec![call("echo", "g1", json!({"message": "hi"}), &[])],
            CancellationToken::new(),
        )
        .await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result_text(), "Echo: hi");
    assert!(results[0].succeeded());
}

#[tokio::test]
async fn executor_results_follow_parsed_order() {
    // A is slow, C is fast: C completes first, but results stay [A, B, C].
    let order = Arc::new(Mutex::new(Vec::new()));
    let executor = executor(ExecutionMode::Parallel, order.clone());
    let results = executor
        .run(
            vec![
                call("slow", "a", json!({"label": "a", "ms": 80}), &[]),
                call("slow", "b", json!({"label": "b", "ms": 10}), &["a"]),
                call("slow", "c", json!({"label": "c", "ms": 5}), &[]),
            ],
            CancellationToken::new(),
        )
        .await;
    let ids: Vec<&str> = results.iter().map(|r| r.invocation_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert!(results.iter().all(|r| r.succeeded()));

    // B only started after A completed; C started alongside A.
    let starts = order.lock().unwrap().clone();
    let pos = |label: &str| starts.iter().position(|s| s == label).unwrap();
    assert!(pos("b") > pos("a"));
}

#[tokio::test]
async fn executor_skips_descendants_of_failed_dependency() {
    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())));
    let results = executor
        .run(
            vec![
                call("fail", "a", json!({}), &[]),
                call("echo", "b", json!({"message": "depends"}), &["a"]),
                call("echo", "c", json!({"message": "free"}), &[]),
            ],
            CancellationToken::new(),
        )
        .await;
    assert_eq!(results.len(), 3);
    assert!(results[0].outcome.is_error());
    match &results[1].outcome {
        GadgetOutcome::Skipped {
            reason: SkipReason::FailedDependency { dependency },
        } => assert_eq!(dependency, "a"),
        other => panic!("expected failed_dependency skip, got {:?}", other),
    }
    assert!(results[2].succeeded());
}

#[tokio::test]
async fn executor_unknown_dependency_skips() {
    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())));
    let results = executor
        .run(
            vec![call("echo", "b", json!({"message": "x"}), &["ghost"])],
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(
        &results[0].outcome,
        GadgetOutcome::Skipped {
            reason: SkipReason::FailedDependency { dependency }
        } if dependency == "ghost"
    ));
}

#[tokio::test]
async fn executor_dependencies_span_iterations() {
    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())));
    // Iteration 0 completes "a"; iteration 1 depends on it.
    let first = executor
        .run(
            vec![call("echo", "a", json!({"message": "one"}), &[])],
            CancellationToken::new(),
        )
        .await;
    assert!(first[0].succeeded());

    let second = executor
        .run(
            vec![call("echo", "b", json!({"message": "two"}), &["a"])],
            CancellationToken::new(),
        )
        .await;
    assert!(second[0].succeeded());
}

#[tokio::test]
async fn executor_enforces_max_gadgets() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let executor = GadgetExecutor::new(
        test_registry(order),
        ExecutorConfig {
            mode: ExecutionMode::Parallel,
            max_gadgets_per_response: Some(2),
            ..Default::default()
        },
    );
    let results = executor
        .run(
            vec![
                call("echo", "1", json!({"message": "a"}), &[]),
                call("echo", "2", json!({"message": "b"}), &[]),
                call("echo", "3", json!({"message": "c"}), &[]),
                call("echo", "4", json!({"message": "d"}), &[]),
            ],
            CancellationToken::new(),
        )
        .await;
    assert_eq!(results.len(), 4);
    assert!(results[0].succeeded());
    assert!(results[1].succeeded());
    for result in &results[2..] {
        assert!(matches!(
            result.outcome,
            GadgetOutcome::Skipped {
                reason: SkipReason::MaxGadgetsExceeded
            }
        ));
    }
}

#[tokio::test]
async fn executor_sequential_runs_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let executor = executor(ExecutionMode::Sequential, order.clone());
    let results = executor
        .run(
            vec![
                call("slow", "x", json!({"label": "x", "ms": 5}), &[]),
                call("fail", "y", json!({}), &[]),
                call("slow", "z", json!({"label": "z", "ms": 5}), &[]),
            ],
            CancellationToken::new(),
        )
        .await;
    // y failed but z is independent and still ran.
    assert!(results[0].succeeded());
    assert!(results[1].outcome.is_error());
    assert!(results[2].succeeded());
    assert_eq!(*order.lock().unwrap(), vec!["x", "z"]);
}

#[tokio::test]
async fn executor_unknown_gadget_is_error_result() {
    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())));
    let results = executor
        .run(
            vec![call("missing", "m1", json!({}), &[])],
            CancellationToken::new(),
        )
        .await;
    match &results[0].outcome {
        GadgetOutcome::Error { message, kind } => {
            assert_eq!(*kind, GadgetErrorKind::UnknownGadget);
            assert!(message.contains("echo"));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn executor_schema_violation_includes_usage() {
    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())));
    let results = executor
        .run(
            vec![call("echo", "s1", json!({"message": 42}), &[])],
            CancellationToken::new(),
        )
        .await;
    match &results[0].outcome {
        GadgetOutcome::Error { message, kind } => {
            assert_eq!(*kind, GadgetErrorKind::SchemaValidation);
            assert!(message.contains("message"));
            assert!(message.contains("Gadget Usage: echo"));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn executor_parse_error_gets_format_reference() {
    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())));
    let mut bad = call("echo", "p1", json!({}), &[]);
    bad.parameters = None;
    bad.parse_error = Some("empty ARG path".into());
    let results = executor.run(vec![bad], CancellationToken::new()).await;
    match &results[0].outcome {
        GadgetOutcome::Error { message, kind } => {
            assert_eq!(*kind, GadgetErrorKind::Parse);
            assert!(message.contains("Block Format Reference"));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn executor_times_out_hanging_gadget() {
    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())));
    let results = executor
        .run(vec![call("hang", "h1", json!({}), &[])], CancellationToken::new())
        .await;
    match &results[0].outcome {
        GadgetOutcome::Error { message, kind } => {
            assert_eq!(*kind, GadgetErrorKind::Timeout);
            assert!(message.contains("timed out"));
        }
        other => panic!("expected timeout error, got {:?}", other),
    }
}

#[tokio::test]
async fn executor_cancellation_skips_batch() {
    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let results = executor
        .run(
            vec![
                call("echo", "c1", json!({"message": "a"}), &[]),
                call("echo", "c2", json!({"message": "b"}), &[]),
            ],
            cancel,
        )
        .await;
    for result in &results {
        assert!(matches!(
            result.outcome,
            GadgetOutcome::Skipped {
                reason: SkipReason::Cancelled
            }
        ));
    }
}

#[tokio::test]
async fn executor_oversize_result_goes_to_store() {
    struct BigGadget;

    #[async_trait::async_trait]
    impl Gadget for BigGadget {
        fn name(&self) -> &str {
            "big"
        }
        fn description(&self) -> &str {
            "huge output"
        }
        fn schema(&self) -> ParamSchema {
            ParamSchema::object(vec![])
        }
        async fn execute(
            &self,
            _params: Value,
            _ctx: &ExecutionContext,
        ) -> GadgetResult<GadgetOutput> {
            Ok(GadgetOutput::text("y".repeat(10_000)))
        }
    }

    let mut registry = GadgetRegistry::new();
    registry.register(BigGadget).unwrap();
    let executor = GadgetExecutor::new(
        Arc::new(registry),
        ExecutorConfig {
            max_result_bytes: 100,
            ..Default::default()
        },
    );
    let results = executor
        .run(vec![call("big", "b1", json!({}), &[])], CancellationToken::new())
        .await;
    let text = results[0].result_text();
    assert!(text.contains("[truncated, 10000 total chars"));
    assert_eq!(executor.store().len(), 1);
}

#[tokio::test]
async fn executor_before_hook_can_skip() {
    struct DenyAll;

    #[async_trait::async_trait]
    impl ExecutorHooks for DenyAll {
        async fn before_gadget(&self, _call: &ParsedGadgetCall) -> BeforeGadgetAction {
            BeforeGadgetAction::deny()
        }
    }

    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())))
        .with_hooks(Arc::new(DenyAll));
    let results = executor
        .run(
            vec![call("echo", "d1", json!({"message": "x"}), &[])],
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(
        results[0].outcome,
        GadgetOutcome::Skipped {
            reason: SkipReason::Denied
        }
    ));
}

#[tokio::test]
async fn executor_after_hook_can_recover() {
    struct RecoverErrors;

    #[async_trait::async_trait]
    impl ExecutorHooks for RecoverErrors {
        async fn after_gadget(
            &self,
            _call: &ParsedGadgetCall,
            outcome: &GadgetOutcome,
        ) -> AfterGadgetAction {
            if outcome.is_error() {
                AfterGadgetAction::Recover {
                    fallback: GadgetOutcome::success("recovered"),
                }
            } else {
                AfterGadgetAction::Continue
            }
        }
    }

    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())))
        .with_hooks(Arc::new(RecoverErrors));
    let results = executor
        .run(vec![call("fail", "r1", json!({}), &[])], CancellationToken::new())
        .await;
    assert!(results[0].succeeded());
    assert_eq!(results[0].result_text(), "recovered");
}

#[tokio::test]
async fn executor_observers_fire_per_call() {
    struct Counter {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ExecutorHooks for Counter {
        fn on_gadget_start(&self, _call: &ParsedGadgetCall) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn on_gadget_finished(&self, _call: &ParsedGadgetCall, _result: &CompletedGadget) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    let counter = Arc::new(Counter {
        started: AtomicUsize::new(0),
        finished: AtomicUsize::new(0),
    });
    let executor = executor(ExecutionMode::Parallel, Arc::new(Mutex::new(Vec::new())))
        .with_hooks(counter.clone());
    executor
        .run(
            vec![
                call("echo", "o1", json!({"message": "a"}), &[]),
                call("echo", "o2", json!({"message": "b"}), &["o1"]),
            ],
            CancellationToken::new(),
        )
        .await;
    // Starts fire only for executed calls; finishes fire for every recorded
    // result, skips included.
    assert_eq!(counter.started.load(Ordering::SeqCst), 2);
    assert_eq!(counter.finished.load(Ordering::SeqCst), 2);
}

// ===========================================================================
// ExecutionContext
// ===========================================================================

#[tokio::test]
async fn context_accumulates_cost() {
    let ctx = ExecutionContext::new(CancellationToken::new(), "g1", 0);
    ctx.report_cost(0.25);
    ctx.report_cost(0.5);
    assert!((ctx.reported_cost() - 0.75).abs() < 1e-9);
}

#[tokio::test]
async fn cleanup_runs_on_timeout() {
    struct CleanupGadget {
        fired: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Gadget for CleanupGadget {
        fn name(&self) -> &str {
            "cleanup"
        }
        fn description(&self) -> &str {
            "registers a cleanup then hangs"
        }
        fn schema(&self) -> ParamSchema {
            ParamSchema::object(vec![])
        }
        fn timeout_ms(&self) -> Option<u64> {
            Some(20)
        }
        async fn execute(
            &self,
            _params: Value,
            ctx: &ExecutionContext,
        ) -> GadgetResult<GadgetOutput> {
            let fired = self.fired.clone();
            ctx.on_cleanup(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    let fired = Arc::new(AtomicUsize::new(0));
    let mut registry = GadgetRegistry::new();
    registry
        .register(CleanupGadget { fired: fired.clone() })
        .unwrap();
    let executor = GadgetExecutor::new(Arc::new(registry), ExecutorConfig::default());
    let results = executor
        .run(vec![call("cleanup", "cl1", json!({}), &[])], CancellationToken::new())
        .await;
    assert!(matches!(
        results[0].outcome,
        GadgetOutcome::Error {
            kind: GadgetErrorKind::Timeout,
            ..
        }
    ));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
