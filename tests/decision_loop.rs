//! End-to-end decision loop scenarios driven through the task registry,
//! with a scripted planner and scripted tools.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;

use graphpilot::config::AppConfig;
use graphpilot::errors::codes;
use graphpilot::events::{AgentEvent, EventBus, EventStream, DEFAULT_SUBSCRIBER_CAPACITY};
use graphpilot::executor::LoopConfig;
use graphpilot::models::{LogSeverity, NodeStatus, TaskStatus};
use graphpilot::planner::{MockPlanner, Planner};
use graphpilot::registry::{TaskOptions, TaskRegistry};
use graphpilot::tools::{ScriptedOutcome, ScriptedTool, ToolRegistry};

struct Harness {
    registry: Arc<TaskRegistry>,
    planner: Arc<MockPlanner>,
    tools: Arc<ToolRegistry>,
    _output_root: TempDir,
}

fn harness(loop_config: LoopConfig) -> Harness {
    let planner = Arc::new(MockPlanner::new());
    let tools = Arc::new(ToolRegistry::with_local_tools());
    let bus = Arc::new(EventBus::new());
    let output_root = TempDir::new().expect("temp dir");
    let config = AppConfig {
        output_root: output_root.path().to_path_buf(),
        ..AppConfig::default()
    };
    let registry = Arc::new(
        TaskRegistry::new(
            Arc::new(Planner::new(
                Arc::clone(&planner) as Arc<dyn graphpilot::planner::LlmPlanner>
            )),
            Arc::clone(&tools),
            bus,
            &config,
        )
        .with_loop_config(loop_config),
    );
    Harness {
        registry,
        planner,
        tools,
        _output_root: output_root,
    }
}

fn plan_node(id: &str, tool: &str, args: Value) -> Value {
    json!({
        "node_id": id,
        "execution_order_priority": 1,
        "action": {
            "tool_name": tool,
            "tool_args": args,
            "reasoning": format!("invoke {tool}"),
            "confidence_score": 0.9,
            "expected_outcome": "progress towards the goal"
        }
    })
}

fn with_parent(mut node: Value, parent: &str) -> Value {
    node["parent_id"] = json!(parent);
    node
}

fn with_on_failure(mut node: Value, policy: &str) -> Value {
    node["action"]["on_failure_action"] = json!(policy);
    node
}

fn with_timeout(mut node: Value, seconds: u64) -> Value {
    node["action"]["execution_timeout_seconds"] = json!(seconds);
    node
}

fn subscribe(harness: &Harness, task_id: &str) -> EventStream {
    harness
        .registry
        .bus()
        .subscribe(task_id, DEFAULT_SUBSCRIBER_CAPACITY)
}

fn start(harness: &Harness, task_id: &str, description: &str) {
    harness
        .registry
        .create(
            description,
            TaskOptions {
                task_id: Some(task_id.to_string()),
                ..TaskOptions::default()
            },
        )
        .expect("task creation");
}

/// Drain the stream until the terminal task update arrives.
async fn collect_until_terminal(stream: &mut EventStream) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), stream.recv())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        let terminal = matches!(
            &event,
            AgentEvent::TaskUpdate { task } if task.status.is_terminal()
        );
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn node_status_events<'a>(
    events: &'a [AgentEvent],
    node_id: &str,
    status: NodeStatus,
) -> Vec<&'a AgentEvent> {
    events
        .iter()
        .filter(|event| {
            matches!(
                event,
                AgentEvent::NodeUpdate { node }
                    if node.node_id == node_id && node.current_status == status
            )
        })
        .collect()
}

fn terminal_task_status(events: &[AgentEvent]) -> Option<TaskStatus> {
    events.iter().rev().find_map(|event| match event {
        AgentEvent::TaskUpdate { task } if task.status.is_terminal() => Some(task.status),
        _ => None,
    })
}

#[tokio::test]
async fn happy_path_navigation_and_screenshot() {
    let h = harness(LoopConfig::default());
    h.tools.register(Arc::new(ScriptedTool::new(
        "navigate_to",
        vec![ScriptedOutcome::ok("https://example.com")],
    )));
    h.tools.register(Arc::new(ScriptedTool::new(
        "take_screenshot",
        vec![ScriptedOutcome::ok("/tmp/shots/example_20240101_120000.png")],
    )));
    h.planner.push_plan(&[
        plan_node("n1", "navigate_to", json!({ "url": "https://example.com" })),
        with_parent(
            plan_node("n2", "take_screenshot", json!({ "task_topic": "example" })),
            "n1",
        ),
    ]);

    let mut stream = subscribe(&h, "s1");
    start(&h, "s1", "navigate to https://example.com and take a screenshot");
    let events = collect_until_terminal(&mut stream).await;

    assert_eq!(terminal_task_status(&events), Some(TaskStatus::Completed));
    let execution = h.registry.get("s1").expect("execution");
    assert_eq!(
        execution.nodes["n1"].current_status,
        NodeStatus::Success
    );
    assert_eq!(
        execution.nodes["n2"].current_status,
        NodeStatus::Success
    );
    assert!(execution.nodes["n2"]
        .resolved_output
        .as_deref()
        .expect("screenshot output")
        .ends_with(".png"));

    // Event contract: a running task update, RUNNING and SUCCESS per node.
    assert!(events.iter().any(|event| matches!(
        event,
        AgentEvent::TaskUpdate { task } if task.status == TaskStatus::Running
    )));
    for node_id in ["n1", "n2"] {
        assert_eq!(
            node_status_events(&events, node_id, NodeStatus::Running).len(),
            1,
            "{node_id} must enter RUNNING exactly once"
        );
        assert_eq!(
            node_status_events(&events, node_id, NodeStatus::Success).len(),
            1
        );
    }
}

#[tokio::test]
async fn planner_schema_violation_fails_the_task() {
    let h = harness(LoopConfig::default());
    let invalid = json!({
        "execution_plan": [
            { "node_id": "bad", "action": { "tool_name": "unknown_tool", "confidence_score": 1.2 } }
        ]
    });
    // Both the first call and the clarification retry return invalid output.
    h.planner.push_response(invalid.to_string());
    h.planner.push_response(invalid.to_string());

    let mut stream = subscribe(&h, "s2");
    start(&h, "s2", "do something impossible");
    let events = collect_until_terminal(&mut stream).await;

    assert_eq!(terminal_task_status(&events), Some(TaskStatus::Failed));
    let error_logs: Vec<_> = h
        .registry
        .logs("s2")
        .expect("logs")
        .into_iter()
        .filter(|entry| entry.severity == LogSeverity::Error)
        .collect();
    assert!(!error_logs.is_empty());
    assert!(error_logs
        .iter()
        .any(|entry| entry.message.contains("planning failed")));
}

#[tokio::test]
async fn correction_subplan_recovers_a_stale_extraction() {
    let h = harness(LoopConfig::default());
    h.tools.register(Arc::new(ScriptedTool::new(
        "extract_data",
        vec![
            ScriptedOutcome::failed(codes::E_STALE_DOM, "element list went stale"),
            ScriptedOutcome::ok("headline one\nheadline two"),
        ],
    )));
    h.planner.push_plan(&[with_on_failure(
        plan_node("extract", "extract_data", json!({ "attribute": "text" })),
        "RE_EVALUATE",
    )]);
    // Correction: settle the page, then extract again.
    h.planner.push_plan(&[
        plan_node("fix_wait", "wait", json!({ "seconds": 0 })),
        with_parent(
            plan_node("fix_extract", "extract_data", json!({ "attribute": "text" })),
            "fix_wait",
        ),
    ]);

    let mut stream = subscribe(&h, "s4");
    start(&h, "s4", "extract the headlines");
    let events = collect_until_terminal(&mut stream).await;

    assert_eq!(terminal_task_status(&events), Some(TaskStatus::Completed));
    let execution = h.registry.get("s4").expect("execution");
    assert_eq!(execution.nodes["extract"].current_status, NodeStatus::Failed);
    assert_eq!(
        execution.nodes["fix_wait"].parent_id.as_deref(),
        Some("extract")
    );
    assert_eq!(
        execution.nodes["fix_wait"].current_status,
        NodeStatus::Success
    );
    assert_eq!(
        execution.nodes["fix_extract"].current_status,
        NodeStatus::Success
    );
    assert_eq!(
        execution.nodes["fix_extract"].resolved_output.as_deref(),
        Some("headline one\nheadline two")
    );

    // The corrective nodes are dispatched in order.
    let wait_running = node_status_events(&events, "fix_wait", NodeStatus::Running);
    let extract_running = node_status_events(&events, "fix_extract", NodeStatus::Running);
    assert_eq!(wait_running.len(), 1);
    assert_eq!(extract_running.len(), 1);
}

#[tokio::test]
async fn exhausted_correction_budget_forces_abort() {
    let h = harness(LoopConfig {
        correction_budget: 1,
        ..LoopConfig::default()
    });
    h.tools.register(Arc::new(ScriptedTool::new(
        "extract_data",
        vec![ScriptedOutcome::failed(codes::E_STALE_DOM, "still stale")],
    )));
    h.planner.push_plan(&[with_on_failure(
        plan_node("extract", "extract_data", json!({})),
        "RE_EVALUATE",
    )]);
    // One correction round is allowed; it fails the same way.
    h.planner.push_plan(&[with_on_failure(
        plan_node("retry_extract", "extract_data", json!({})),
        "RE_EVALUATE",
    )]);

    let mut stream = subscribe(&h, "s4b");
    start(&h, "s4b", "extract the headlines");
    let events = collect_until_terminal(&mut stream).await;

    assert_eq!(terminal_task_status(&events), Some(TaskStatus::Failed));
    let logs = h.registry.logs("s4b").expect("logs");
    assert!(logs
        .iter()
        .any(|entry| entry.message.contains("correction budget")));
}

#[tokio::test]
async fn cancellation_stops_scheduling_mid_flight() {
    let h = harness(LoopConfig::default());
    let mut nodes = vec![plan_node("n1", "wait", json!({ "seconds": 0.2 }))];
    for index in 2..=5 {
        nodes.push(with_parent(
            plan_node(&format!("n{index}"), "wait", json!({ "seconds": 0.2 })),
            &format!("n{}", index - 1),
        ));
    }
    h.planner.push_plan(&nodes);

    let mut stream = subscribe(&h, "s5");
    start(&h, "s5", "wait around");

    // Stop the task as soon as n2 completes.
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), stream.recv())
            .await
            .expect("stream stalled")
            .expect("stream closed");
        let n2_done = matches!(
            &event,
            AgentEvent::NodeUpdate { node }
                if node.node_id == "n2" && node.current_status == NodeStatus::Success
        );
        events.push(event);
        if n2_done {
            assert!(h.registry.stop("s5"));
            break;
        }
    }
    events.extend(collect_until_terminal(&mut stream).await);

    assert_eq!(terminal_task_status(&events), Some(TaskStatus::Cancelled));
    // Nothing beyond the node in flight at cancellation ever runs.
    assert!(node_status_events(&events, "n4", NodeStatus::Running).is_empty());
    assert!(node_status_events(&events, "n5", NodeStatus::Running).is_empty());

    // Exactly one terminal task update is delivered.
    let terminal_updates = events
        .iter()
        .filter(|event| matches!(
            event,
            AgentEvent::TaskUpdate { task } if task.status.is_terminal()
        ))
        .count();
    assert_eq!(terminal_updates, 1);
}

#[tokio::test(start_paused = true)]
async fn wall_clock_bound_fails_hanging_tools() {
    let h = harness(LoopConfig::default());
    // Tools hang far beyond their own generous per-attempt timeout.
    h.tools.register(Arc::new(ScriptedTool::new(
        "extract_data",
        vec![ScriptedOutcome::ok("never seen").with_delay(Duration::from_secs(3600))],
    )));
    h.planner.push_plan(&[
        with_timeout(plan_node("n1", "extract_data", json!({})), 100),
        with_parent(
            with_timeout(plan_node("n2", "extract_data", json!({})), 100),
            "n1",
        ),
    ]);

    let mut stream = subscribe(&h, "s6");
    h.registry
        .create(
            "hang forever",
            TaskOptions {
                task_id: Some("s6".to_string()),
                max_execution_time_seconds: Some(5),
                ..TaskOptions::default()
            },
        )
        .expect("task creation");

    let started = tokio::time::Instant::now();
    let events = collect_until_terminal(&mut stream).await;
    let elapsed = started.elapsed();

    assert_eq!(terminal_task_status(&events), Some(TaskStatus::Failed));
    // Budget is max(30s floor, 5s x 2 nodes); +5s grace.
    assert!(elapsed <= Duration::from_secs(35), "took {elapsed:?}");

    let execution = h.registry.get("s6").expect("execution");
    for node_id in ["n1", "n2"] {
        let node = &execution.nodes[node_id];
        assert_eq!(node.current_status, NodeStatus::Failed, "{node_id}");
        assert!(node
            .failure_reason
            .as_deref()
            .unwrap_or_default()
            .contains(codes::E_WALL_CLOCK));
    }
    let logs = h.registry.logs("s6").expect("logs");
    assert!(logs.iter().any(|entry| {
        entry.severity == LogSeverity::Error && entry.message.contains("wall clock")
    }));
}

#[tokio::test]
async fn templates_flow_between_nodes() {
    let h = harness(LoopConfig::default());
    h.tools.register(Arc::new(ScriptedTool::new(
        "extract_data",
        vec![ScriptedOutcome::ok("first headline\nsecond headline")],
    )));
    h.planner.push_plan(&[
        plan_node("grab", "extract_data", json!({ "attribute": "text" })),
        with_parent(
            plan_node(
                "note",
                "open_notepad",
                json!({ "initial_content": "${grab.output}" }),
            ),
            "grab",
        ),
    ]);

    let mut stream = subscribe(&h, "tpl");
    start(&h, "tpl", "extract headlines into a note");
    let events = collect_until_terminal(&mut stream).await;

    assert_eq!(terminal_task_status(&events), Some(TaskStatus::Completed));
    let execution = h.registry.get("tpl").expect("execution");
    let note_path = execution.nodes["note"]
        .resolved_output
        .clone()
        .expect("note path");
    let written = std::fs::read_to_string(&note_path).expect("note file");
    assert_eq!(written, "first headline\nsecond headline");
}
