//! End-to-end DAG engine scenarios against in-memory repositories and
//! function-map adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use skein::{
    AgentErrorKind, CircuitBreakerConfig, EngineConfig, EventKind, ExecutionRepo,
    ExecutionStatus, MemoryEventBus, MemoryExecutionRepo, MemoryWorkflowRepo, NodeStatus,
    StaticAgentRuntime, StaticToolRegistry, ToolErrorKind, WorkflowEngine, WorkflowError,
};

struct Harness {
    engine: WorkflowEngine,
    executions: Arc<MemoryExecutionRepo>,
}

fn harness(config: EngineConfig, agents: StaticAgentRuntime, tools: StaticToolRegistry) -> Harness {
    skein::init_tracing();
    let executions = Arc::new(MemoryExecutionRepo::new());
    let engine = WorkflowEngine::new(
        config,
        Arc::new(MemoryWorkflowRepo::new()),
        executions.clone(),
        Arc::new(MemoryEventBus::new()),
        Arc::new(agents),
        Arc::new(tools),
    );
    Harness { engine, executions }
}

/// Tool returning `{out: in + 1}`.
fn incr_tool() -> StaticToolRegistry {
    StaticToolRegistry::new().register(
        "incr",
        Arc::new(|params: Value| {
            Box::pin(async move {
                let value = params["in"].as_i64().unwrap_or(0);
                Ok(json!({"out": value + 1}))
            })
        }),
    )
}

async fn node_statuses(h: &Harness, execution_id: uuid::Uuid) -> HashMap<String, NodeStatus> {
    let record = h
        .engine
        .execution_status(execution_id)
        .await
        .expect("execution status");
    record["nodes"]
        .as_object()
        .unwrap()
        .iter()
        .map(|(k, v)| {
            (
                k.clone(),
                serde_json::from_value(v["status"].clone()).unwrap(),
            )
        })
        .collect()
}

#[tokio::test]
async fn linear_three_node_dag() {
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), incr_tool());
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: linear
  type: dag
  nodes:
    - id: a
      type: tool
      config: { tool_id: incr }
      inputs: { in: "${input.val}" }
    - id: b
      type: tool
      config: { tool_id: incr }
      dependencies: [a]
      inputs: { in: "${nodes.a.output.out}" }
    - id: c
      type: tool
      config: { tool_id: incr }
      dependencies: [b]
      inputs: { in: "${nodes.b.output.out}" }
"#,
        )
        .await
        .unwrap();

    let execution_id = h.engine.execute(&workflow_id, json!({"val": 0})).await.unwrap();
    let status = h.engine.wait(execution_id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    let summary = h.engine.execution_status(execution_id).await.unwrap();
    assert_eq!(summary["output"]["c"]["out"], json!(3));

    // Node lifecycle events arrive in dependency order.
    let interesting: Vec<(String, Option<String>)> = h
        .executions
        .events_for(execution_id)
        .into_iter()
        .filter(|e| {
            matches!(
                e.event_type,
                EventKind::NodeStarted | EventKind::NodeCompleted | EventKind::ExecutionCompleted
            )
        })
        .map(|e| (e.event_type.as_str().to_string(), e.node_id))
        .collect();
    let expected: Vec<(String, Option<String>)> = vec![
        ("node.started".into(), Some("a".into())),
        ("node.completed".into(), Some("a".into())),
        ("node.started".into(), Some("b".into())),
        ("node.completed".into(), Some("b".into())),
        ("node.started".into(), Some("c".into())),
        ("node.completed".into(), Some("c".into())),
        ("execution.completed".into(), None),
    ];
    assert_eq!(interesting, expected);
}

#[tokio::test]
async fn parallel_fan_out_fan_in() {
    let tools = StaticToolRegistry::new()
        .register(
            "seed",
            Arc::new(|_| Box::pin(async { Ok(json!({"ok": true})) })),
        )
        .register(
            "mark",
            Arc::new(|params: Value| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    let key = params["key"].as_str().unwrap_or("k").to_string();
                    let mut out = serde_json::Map::new();
                    out.insert(key, json!(1));
                    Ok(Value::Object(out))
                })
            }),
        );
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), tools);
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: fanout
  type: dag
  nodes:
    - id: a
      type: tool
      config: { tool_id: seed }
    - id: b
      type: tool
      config: { tool_id: mark }
      dependencies: [a]
      inputs: { key: "k_b" }
    - id: c
      type: tool
      config: { tool_id: mark }
      dependencies: [a]
      inputs: { key: "k_c" }
    - id: d
      type: tool
      config: { tool_id: mark }
      dependencies: [a]
      inputs: { key: "k_d" }
    - id: e
      type: aggregation
      config:
        sources: [b, c, d]
        reducer: merge
"#,
        )
        .await
        .unwrap();

    let execution_id = h.engine.execute(&workflow_id, json!({})).await.unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Completed
    );

    let summary = h.engine.execution_status(execution_id).await.unwrap();
    let merged = &summary["output"]["e"];
    assert_eq!(merged["k_b"], json!(1));
    assert_eq!(merged["k_c"], json!(1));
    assert_eq!(merged["k_d"], json!(1));

    // The fan-out nodes ran concurrently: every start precedes every end.
    let record = h
        .executions
        .load_execution(execution_id)
        .await
        .unwrap()
        .unwrap();
    let windows: Vec<_> = record
        .node_execs
        .iter()
        .filter(|(key, _)| ["b", "c", "d"].contains(&key.as_str()))
        .map(|(_, n)| (n.start_ts.unwrap(), n.end_ts.unwrap()))
        .collect();
    assert_eq!(windows.len(), 3);
    let latest_start = windows.iter().map(|(s, _)| *s).max().unwrap();
    let earliest_end = windows.iter().map(|(_, e)| *e).min().unwrap();
    assert!(latest_start < earliest_end, "fan-out nodes did not overlap");
}

#[tokio::test]
async fn retry_then_succeed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let agents = StaticAgentRuntime::new().register(
        "flaky",
        Arc::new(move |_input: Value| {
            let counter = counter.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(WorkflowError::Agent {
                        kind: AgentErrorKind::Execution,
                        message: "transient".into(),
                    })
                } else {
                    Ok(json!({"done": true}))
                }
            })
        }),
    );
    let h = harness(EngineConfig::default(), agents, StaticToolRegistry::new());
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: retry
  type: dag
  nodes:
    - id: x
      type: agent
      config: { agent_id: flaky }
      retry:
        max_attempts: 3
        backoff: exponential
        base_delay_ms: 10
        max_delay_ms: 1000
"#,
        )
        .await
        .unwrap();

    let execution_id = h.engine.execute(&workflow_id, json!({})).await.unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Completed
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let record = h
        .executions
        .load_execution(execution_id)
        .await
        .unwrap()
        .unwrap();
    let (_, node) = record
        .node_execs
        .iter()
        .find(|(key, _)| key == "x")
        .unwrap();
    assert_eq!(node.status, NodeStatus::Success);
    assert_eq!(node.retry_count, 2);
    assert_eq!(node.attempt_history.len(), 3);

    // Exponential backoff: >= 10ms before attempt 2, >= 20ms before 3.
    let starts: Vec<_> = node.attempt_history.iter().map(|a| a.started_at).collect();
    assert!(starts[1] - starts[0] >= chrono::Duration::milliseconds(10));
    assert!(starts[2] - starts[1] >= chrono::Duration::milliseconds(20));

    let retrying = h
        .executions
        .events_for(execution_id)
        .into_iter()
        .filter(|e| e.event_type == EventKind::NodeRetrying)
        .count();
    assert_eq!(retrying, 2);
}

#[tokio::test]
async fn circuit_breaker_trips_and_probes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let tools = StaticToolRegistry::new().register(
        "k1",
        Arc::new(move |_params: Value| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(WorkflowError::Tool {
                    kind: ToolErrorKind::Execution,
                    message: "down".into(),
                })
            })
        }),
    );
    let config = EngineConfig {
        breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_millis(500),
        },
        ..EngineConfig::default()
    };
    let h = harness(config, StaticAgentRuntime::new(), tools);
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: breaker
  type: dag
  nodes:
    - id: call
      type: tool
      config: { tool_id: k1 }
"#,
        )
        .await
        .unwrap();

    let mut kinds = Vec::new();
    for _ in 0..10 {
        let execution_id = h.engine.execute(&workflow_id, json!({})).await.unwrap();
        assert_eq!(
            h.engine.wait(execution_id).await.unwrap(),
            ExecutionStatus::Failed
        );
        let summary = h.engine.execution_status(execution_id).await.unwrap();
        kinds.push(summary["error"]["kind"].as_str().unwrap().to_string());
    }
    // Five real failures, then rejections without touching the adapter.
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert!(kinds[..5].iter().all(|k| k == "tool_execution"));
    assert!(kinds[5..].iter().all(|k| k == "circuit_open"));

    // After the cooldown one probe reaches the adapter again.
    tokio::time::sleep(Duration::from_millis(550)).await;
    let execution_id = h.engine.execute(&workflow_id, json!({})).await.unwrap();
    h.engine.wait(execution_id).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn saga_compensation_runs_in_reverse() {
    let undone: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let tools = StaticToolRegistry::new()
        .register(
            "step",
            Arc::new(|params: Value| Box::pin(async move { Ok(json!({"did": params["tag"]})) })),
        )
        .register(
            "explode",
            Arc::new(|_| {
                Box::pin(async {
                    Err(WorkflowError::Tool {
                        kind: ToolErrorKind::Execution,
                        message: "unrecoverable".into(),
                    })
                })
            }),
        );
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), tools);

    let log = undone.clone();
    h.engine.compensation().register_handler(
        "undo",
        Arc::new(move |entry: skein::CompensationEntry| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(entry.node_id.clone());
                Ok(json!({}))
            })
        }),
    );

    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: saga
  type: dag
  error_handlers:
    - node_pattern: "^d$"
      policy:
        type: compensate
        strategy: sequential_reverse
  nodes:
    - id: a
      type: tool
      config: { tool_id: step }
      inputs: { tag: "a" }
      compensation: { action: undo }
    - id: b
      type: tool
      config: { tool_id: step }
      dependencies: [a]
      inputs: { tag: "b" }
      compensation: { action: undo }
    - id: c
      type: tool
      config: { tool_id: step }
      dependencies: [b]
      inputs: { tag: "c" }
      compensation: { action: undo }
    - id: d
      type: tool
      config: { tool_id: explode }
      dependencies: [c]
"#,
        )
        .await
        .unwrap();

    let execution_id = h.engine.execute(&workflow_id, json!({})).await.unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Failed
    );
    assert_eq!(*undone.lock().unwrap(), vec!["c", "b", "a"]);

    let events: Vec<_> = h
        .executions
        .events_for(execution_id)
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(events.contains(&EventKind::CompensationStarted));
    assert!(events.contains(&EventKind::CompensationCompleted));
    assert!(events.contains(&EventKind::ExecutionFailed));
}

#[tokio::test]
async fn switch_skips_untaken_branch() {
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), incr_tool());
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: routed
  type: dag
  nodes:
    - id: route
      type: control
      subtype: switch
      config:
        expression: "${input.route}"
        cases:
          - { equals: fast, target: b1 }
          - { equals: slow, target: b2 }
    - id: b1
      type: tool
      config: { tool_id: incr }
      inputs: { in: "${input.val}" }
    - id: b2
      type: tool
      config: { tool_id: incr }
      inputs: { in: "${input.val}" }
"#,
        )
        .await
        .unwrap();

    let execution_id = h
        .engine
        .execute(&workflow_id, json!({"route": "fast", "val": 1}))
        .await
        .unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Completed
    );
    let statuses = node_statuses(&h, execution_id).await;
    assert_eq!(statuses["b1"], NodeStatus::Success);
    assert_eq!(statuses["b2"], NodeStatus::Skipped);
}

#[tokio::test]
async fn switch_without_match_or_default_fails() {
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), incr_tool());
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: unmatched
  type: dag
  nodes:
    - id: route
      type: control
      subtype: switch
      config:
        expression: "${input.route}"
        cases:
          - { equals: fast, target: b1 }
    - id: b1
      type: tool
      config: { tool_id: incr }
"#,
        )
        .await
        .unwrap();

    let execution_id = h
        .engine
        .execute(&workflow_id, json!({"route": "nope"}))
        .await
        .unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Failed
    );
    let summary = h.engine.execution_status(execution_id).await.unwrap();
    assert_eq!(summary["error"]["kind"], json!("unmatched_branch"));
}

#[tokio::test]
async fn zero_timeout_fails_immediately() {
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), incr_tool());
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: deadline
  type: dag
  nodes:
    - id: a
      type: tool
      config: { tool_id: incr }
      timeout: 0
"#,
        )
        .await
        .unwrap();

    let execution_id = h.engine.execute(&workflow_id, json!({})).await.unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Failed
    );
    let summary = h.engine.execution_status(execution_id).await.unwrap();
    assert_eq!(summary["error"]["kind"], json!("timeout"));
}

#[tokio::test]
async fn single_node_workflow_completes() {
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), incr_tool());
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: single
  type: dag
  nodes:
    - id: only
      type: tool
      config: { tool_id: incr }
      inputs: { in: "${input.val}" }
"#,
        )
        .await
        .unwrap();
    let execution_id = h.engine.execute(&workflow_id, json!({"val": 41})).await.unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Completed
    );
    let summary = h.engine.execution_status(execution_id).await.unwrap();
    assert_eq!(summary["output"]["only"]["out"], json!(42));
}

#[tokio::test]
async fn cancel_terminates_inflight_node() {
    let tools = StaticToolRegistry::new().register(
        "sleepy",
        Arc::new(|_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!({}))
            })
        }),
    );
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), tools);
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: cancellable
  type: dag
  nodes:
    - id: a
      type: tool
      config: { tool_id: sleepy }
"#,
        )
        .await
        .unwrap();

    let execution_id = h.engine.execute(&workflow_id, json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.cancel(execution_id).unwrap();

    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Cancelled
    );
    let statuses = node_statuses(&h, execution_id).await;
    assert_eq!(statuses["a"], NodeStatus::Cancelled);
}

#[tokio::test]
async fn suspend_then_resume_completes() {
    let tools = StaticToolRegistry::new().register(
        "pause",
        Arc::new(|params: Value| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(json!({"tag": params["tag"]}))
            })
        }),
    );
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), tools);
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: suspendable
  type: dag
  nodes:
    - id: a
      type: tool
      config: { tool_id: pause }
      inputs: { tag: "a" }
    - id: b
      type: tool
      config: { tool_id: pause }
      dependencies: [a]
      inputs: { tag: "b" }
"#,
        )
        .await
        .unwrap();

    let execution_id = h.engine.execute(&workflow_id, json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.engine.suspend(execution_id).unwrap();

    // Running node drains, nothing new starts, execution parks.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let summary = h.engine.execution_status(execution_id).await.unwrap();
    assert_eq!(summary["status"], json!("suspended"));
    let statuses = node_statuses(&h, execution_id).await;
    assert_eq!(statuses["a"], NodeStatus::Success);
    assert!(!statuses.contains_key("b"));

    // Resume is idempotent.
    h.engine.resume(execution_id).unwrap();
    h.engine.resume(execution_id).unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Completed
    );

    let events: Vec<_> = h
        .executions
        .events_for(execution_id)
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(events.contains(&EventKind::ExecutionSuspended));
    assert!(events.contains(&EventKind::ExecutionResumed));
}

#[tokio::test]
async fn count_loop_produces_per_iteration_records() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let tools = StaticToolRegistry::new().register(
        "tick",
        Arc::new(move |params: Value| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"index": params["i"]}))
            })
        }),
    );
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), tools);
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: counted
  type: dag
  nodes:
    - id: step
      type: tool
      config: { tool_id: tick }
      inputs: { i: "${loop.index}" }
    - id: l
      type: control
      subtype: loop
      config:
        loop_kind: count
        iterations: 3
        body: [step]
"#,
        )
        .await
        .unwrap();

    let execution_id = h.engine.execute(&workflow_id, json!({})).await.unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Completed
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let summary = h.engine.execution_status(execution_id).await.unwrap();
    assert_eq!(summary["output"]["l"]["iterations"], json!(3));
    let nodes = summary["nodes"].as_object().unwrap();
    for key in ["step#0", "step#1", "step#2"] {
        assert_eq!(nodes[key]["status"], json!("success"), "missing {key}");
    }
}

#[tokio::test]
async fn for_each_loop_binds_items() {
    let seen: Arc<std::sync::Mutex<Vec<Value>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let tools = StaticToolRegistry::new().register(
        "collect",
        Arc::new(move |params: Value| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(params["item"].clone());
                Ok(json!({"ok": true}))
            })
        }),
    );
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), tools);
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: mapped
  type: dag
  nodes:
    - id: step
      type: tool
      config: { tool_id: collect }
      inputs: { item: "${loop.item}" }
    - id: each
      type: control
      subtype: loop
      config:
        loop_kind: for_each
        items: "${input.items}"
        body: [step]
"#,
        )
        .await
        .unwrap();

    let execution_id = h
        .engine
        .execute(&workflow_id, json!({"items": ["x", "y"]}))
        .await
        .unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Completed
    );
    assert_eq!(*seen.lock().unwrap(), vec![json!("x"), json!("y")]);
}

#[tokio::test]
async fn sub_workflow_returns_child_output() {
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), incr_tool());
    h.engine
        .create_workflow(
            r#"
workflow:
  name: child
  version: 1.0.0
  type: dag
  nodes:
    - id: inner
      type: tool
      config: { tool_id: incr }
      inputs: { in: "${input.seed}" }
"#,
        )
        .await
        .unwrap();
    let parent_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: parent
  type: dag
  nodes:
    - id: call_child
      type: sub_workflow
      config: { workflow: child, workflow_version: 1.0.0 }
      inputs: { seed: "${input.seed}" }
"#,
        )
        .await
        .unwrap();

    let execution_id = h.engine.execute(&parent_id, json!({"seed": 9})).await.unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Completed
    );
    let summary = h.engine.execution_status(execution_id).await.unwrap();
    assert_eq!(summary["output"]["call_child"]["inner"]["out"], json!(10));
}

#[tokio::test]
async fn skip_policy_recovers_locally() {
    let tools = StaticToolRegistry::new()
        .register(
            "boom",
            Arc::new(|_| {
                Box::pin(async {
                    Err(WorkflowError::Tool {
                        kind: ToolErrorKind::Execution,
                        message: "optional step failed".into(),
                    })
                })
            }),
        )
        .register(
            "incr",
            Arc::new(|params: Value| {
                Box::pin(async move {
                    Ok(json!({"out": params["in"].as_i64().unwrap_or(0) + 1}))
                })
            }),
        );
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), tools);
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: lenient
  type: dag
  error_handlers:
    - node_pattern: "^optional$"
      policy: { type: skip }
  nodes:
    - id: optional
      type: tool
      config: { tool_id: boom }
    - id: after
      type: tool
      config: { tool_id: incr }
      dependencies: [optional]
      inputs: { in: "${input.val}" }
"#,
        )
        .await
        .unwrap();

    let execution_id = h.engine.execute(&workflow_id, json!({"val": 1})).await.unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Completed
    );
    let statuses = node_statuses(&h, execution_id).await;
    assert_eq!(statuses["optional"], NodeStatus::Skipped);
    assert_eq!(statuses["after"], NodeStatus::Success);
}

#[tokio::test]
async fn fallback_default_output_recovers() {
    let tools = StaticToolRegistry::new().register(
        "boom",
        Arc::new(|_| {
            Box::pin(async {
                Err(WorkflowError::Tool {
                    kind: ToolErrorKind::Execution,
                    message: "nope".into(),
                })
            })
        }),
    );
    let h = harness(EngineConfig::default(), StaticAgentRuntime::new(), tools);
    let workflow_id = h
        .engine
        .create_workflow(
            r#"
workflow:
  name: degraded
  type: dag
  error_handlers:
    - node_pattern: ".*"
      policy:
        type: fallback
        default_output: { degraded: true }
  nodes:
    - id: a
      type: tool
      config: { tool_id: boom }
"#,
        )
        .await
        .unwrap();

    let execution_id = h.engine.execute(&workflow_id, json!({})).await.unwrap();
    assert_eq!(
        h.engine.wait(execution_id).await.unwrap(),
        ExecutionStatus::Completed
    );
    let summary = h.engine.execution_status(execution_id).await.unwrap();
    assert_eq!(summary["output"]["a"], json!({"degraded": true}));
}
