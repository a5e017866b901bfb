//! Decision loop: the lifecycle of one task.
//!
//! One loop instance runs per task on its own worker. The loop owns the
//! graph and dispatcher; the planner, event bus, and registry handle are
//! collaborators passed in. The phases mirror an explicit state machine:
//! initializing -> scheduling -> dispatching -> finalizing. The language
//! model only ever contributes plan fragments; transitions live here.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::errors::{codes, EngineError};
use crate::events::{AgentEvent, EventBus};
use crate::graph::{ExecutionGraph, MarkOutcome};
use crate::models::{
    ExecutionNode, LogSeverity, NodeStatus, OnFailure, TaskExecution, TaskGoal, TaskStatus,
    WebObservation,
};
use crate::planner::{FailedNodeRecord, Planner};
use crate::registry::TaskHandle;
use crate::tools::ToolContext;
use crate::visualizer;

/// Tunable loop limits.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Correction rounds allowed before a RE_EVALUATE failure is forced
    /// into ABORT.
    pub correction_budget: u32,
    /// Minimum wall-clock budget regardless of plan size.
    pub wall_clock_floor: Duration,
    /// Hard ceiling on scheduling iterations.
    pub safety_iteration_cap: u32,
    /// Whether to write an HTML graph snapshot after every transition.
    pub write_graph_snapshots: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            correction_budget: 3,
            wall_clock_floor: Duration::from_secs(30),
            safety_iteration_cap: 50,
            write_graph_snapshots: true,
        }
    }
}

pub struct DecisionLoop {
    goal: TaskGoal,
    graph: ExecutionGraph,
    dispatcher: Dispatcher,
    planner: Arc<Planner>,
    bus: Arc<EventBus>,
    handle: Arc<TaskHandle>,
    ctx: ToolContext,
    config: LoopConfig,
    failed_history: Vec<FailedNodeRecord>,
    correction_rounds: u32,
    step_counter: u32,
    latest_observation: Option<WebObservation>,
    last_error: Option<String>,
}

impl DecisionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        goal: TaskGoal,
        handle: Arc<TaskHandle>,
        planner: Arc<Planner>,
        dispatcher: Dispatcher,
        bus: Arc<EventBus>,
        ctx: ToolContext,
        config: LoopConfig,
    ) -> Self {
        Self {
            goal,
            graph: ExecutionGraph::new(),
            dispatcher,
            planner,
            bus,
            handle,
            ctx,
            config,
            failed_history: Vec::new(),
            correction_rounds: 0,
            step_counter: 0,
            latest_observation: None,
            last_error: None,
        }
    }

    /// Drive the task to a terminal status.
    pub async fn run(mut self) -> TaskStatus {
        if !self.handle.try_start() {
            warn!(task = %self.goal.task_id, "task is not idle, refusing to run");
            return self.handle.status();
        }
        self.emit_task();
        self.log(
            LogSeverity::Info,
            format!("task started: {}", self.goal.target_description),
            None,
        );

        // INITIALIZING: ask the planner for the initial plan.
        match self
            .planner
            .plan(&self.goal, self.latest_observation.as_ref(), "")
            .await
        {
            Ok(nodes) => self.populate(nodes, None),
            Err(err) => {
                self.last_error = Some(err.to_string());
                self.log(
                    LogSeverity::Error,
                    format!("initial planning failed: {err}"),
                    None,
                );
                return self.finalize(Some(TaskStatus::Failed)).await;
            }
        }

        if self.graph.is_empty() {
            self.last_error = Some("planner produced no executable nodes".to_string());
            self.log(LogSeverity::Error, "plan is empty after initialization", None);
            return self.finalize(Some(TaskStatus::Failed)).await;
        }

        self.write_graph_snapshot("initial").await;

        let wall_budget = self.wall_clock_budget();
        let deadline = Instant::now() + wall_budget;
        debug!(task = %self.goal.task_id, budget_s = wall_budget.as_secs(), "wall clock armed");

        let mut iterations = 0u32;
        loop {
            // Cancellation is observed between scheduling and dispatching.
            if self.handle.cancel.is_cancelled() {
                self.log(LogSeverity::Warning, "cancellation flag observed", None);
                return self.finalize(Some(TaskStatus::Cancelled)).await;
            }
            if Instant::now() >= deadline {
                self.fail_wall_clock(None);
                return self.finalize(Some(TaskStatus::Failed)).await;
            }
            iterations += 1;
            if iterations > self.config.safety_iteration_cap {
                self.last_error = Some(format!(
                    "safety iteration cap {} reached",
                    self.config.safety_iteration_cap
                ));
                self.log(
                    LogSeverity::Error,
                    "safety iteration cap reached, aborting",
                    None,
                );
                return self.finalize(Some(TaskStatus::Failed)).await;
            }

            // SCHEDULING
            let Some(node_id) = self.graph.next_runnable().map(|n| n.node_id.clone()) else {
                break;
            };
            self.mark_and_emit(&node_id, NodeStatus::Running, MarkOutcome::default());
            self.log(
                LogSeverity::Info,
                format!("dispatching node {node_id}"),
                Some(node_id.clone()),
            );

            // DISPATCHING, bounded by the remaining wall clock.
            let action = match self.graph.get(&node_id) {
                Some(node) => node.action.clone(),
                None => continue,
            };
            let outputs = self.graph.resolved_outputs();
            let dispatched = tokio::time::timeout_at(
                deadline,
                self.dispatcher
                    .dispatch(&action, &outputs, &self.ctx, &self.handle.cancel),
            )
            .await;

            let outcome = match dispatched {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.fail_wall_clock(Some(&node_id));
                    return self.finalize(Some(TaskStatus::Failed)).await;
                }
            };

            let should_finalize = self.apply_outcome(&node_id, &action.tool_name, outcome).await;
            self.write_graph_snapshot(&node_id).await;
            if should_finalize {
                return self.finalize(None).await;
            }
        }

        self.finalize(None).await
    }

    /// Insert planner output, anchoring parentless nodes under `anchor`
    /// (or the root once one exists).
    fn populate(&mut self, nodes: Vec<ExecutionNode>, anchor: Option<&str>) {
        for mut node in nodes {
            let fallback = anchor
                .map(str::to_string)
                .or_else(|| self.graph.root_node_id().map(str::to_string));
            match &node.parent_id {
                None => node.parent_id = fallback,
                Some(parent) if !self.graph_has(parent) => node.parent_id = fallback,
                _ => {}
            }
            let node_id = node.node_id.clone();
            match self.graph.add_node(node) {
                Ok(id) => self.emit_node(&id),
                Err(err) => {
                    self.log(
                        LogSeverity::Warning,
                        format!("dropping plan node {node_id}: {err}"),
                        Some(node_id.clone()),
                    );
                }
            }
        }
        self.sync_snapshot();
    }

    fn graph_has(&self, node_id: &str) -> bool {
        self.graph.get(node_id).is_some()
    }

    fn wall_clock_budget(&self) -> Duration {
        let per_step = self.goal.max_execution_time_seconds.max(1);
        let budget = per_step.saturating_mul(self.graph.len() as u64);
        Duration::from_secs(budget).max(self.config.wall_clock_floor)
    }

    /// Apply a dispatch outcome to the graph. Returns true when the loop
    /// must finalize immediately.
    async fn apply_outcome(
        &mut self,
        node_id: &str,
        tool_name: &str,
        outcome: DispatchOutcome,
    ) -> bool {
        self.latest_observation = Some(outcome.observation.clone());

        if outcome.feedback.is_success() {
            let output = resolved_output_projection(tool_name, &outcome);
            self.mark_and_emit(
                node_id,
                NodeStatus::Success,
                MarkOutcome::success(output, Some(outcome.observation.clone())),
            );
            self.log(
                LogSeverity::Success,
                format!("node {node_id} succeeded after {} attempt(s)", outcome.attempts),
                Some(node_id.to_string()),
            );
            if outcome.observation.current_url.starts_with("http") {
                self.bus.publish(
                    &self.goal.task_id,
                    AgentEvent::BrowserUrl {
                        url: outcome.observation.current_url.clone(),
                    },
                );
            }
            return false;
        }

        // Failure after the dispatcher exhausted whatever it was allowed.
        let reason = format!(
            "{} ({})",
            outcome.feedback.message, outcome.feedback.error_code
        );
        self.last_error = Some(reason.clone());
        let policy = self
            .graph
            .get(node_id)
            .map(|node| node.action.on_failure_action)
            .unwrap_or_default();

        self.mark_and_emit(
            node_id,
            NodeStatus::Failed,
            MarkOutcome::failed(reason.clone(), Some(outcome.observation.clone())),
        );
        self.log(
            LogSeverity::Error,
            format!("node {node_id} failed: {reason}"),
            Some(node_id.to_string()),
        );
        self.failed_history.push(FailedNodeRecord {
            node_id: node_id.to_string(),
            tool_name: tool_name.to_string(),
            error_message: outcome.feedback.message.clone(),
            reasoning: self
                .graph
                .get(node_id)
                .map(|node| node.action.reasoning.clone())
                .unwrap_or_default(),
        });

        let failed_root = self.graph.root_node_id() == Some(node_id);
        match policy {
            OnFailure::Abort => failed_root,
            OnFailure::Skip => false,
            OnFailure::RetryOnly => true,
            OnFailure::ReEvaluate => self.attempt_correction(node_id).await,
        }
    }

    /// RE_EVALUATE: ask the planner for a correction subplan and graft it
    /// under the failed node. Returns true when the loop must finalize.
    async fn attempt_correction(&mut self, failed_id: &str) -> bool {
        if self.correction_rounds >= self.config.correction_budget {
            let err = EngineError::CorrectionBudgetExceeded(self.correction_rounds);
            self.last_error = Some(err.to_string());
            self.log(
                LogSeverity::Error,
                format!("{err}; forcing abort of node {failed_id}"),
                Some(failed_id.to_string()),
            );
            match self.graph.prune(failed_id, &err.to_string()) {
                Ok(changed) => self.emit_changed(&changed),
                Err(err) => warn!(%err, "failed to prune after correction budget"),
            }
            return self.graph.root_node_id() == Some(failed_id);
        }
        self.correction_rounds += 1;

        let failed_node = match self.graph.get(failed_id) {
            Some(node) => node.clone(),
            None => return false,
        };
        self.log(
            LogSeverity::Info,
            format!(
                "requesting correction subplan for {failed_id} (round {}/{})",
                self.correction_rounds, self.config.correction_budget
            ),
            Some(failed_id.to_string()),
        );

        let correction = self
            .planner
            .correct(
                &self.goal,
                self.latest_observation.as_ref(),
                &failed_node,
                &self.failed_history,
                &self.memory_context(),
            )
            .await;

        match correction {
            Ok(nodes) => {
                // Unknown parents are re-anchored by the graph itself, so the
                // subplan goes in untouched and keeps its internal structure.
                match self.graph.inject_correction(failed_id, nodes) {
                    Ok(injected) => {
                        self.log(
                            LogSeverity::Info,
                            format!("injected {} correction node(s)", injected.len()),
                            Some(failed_id.to_string()),
                        );
                        self.emit_changed(&injected);
                        self.sync_snapshot();
                        false
                    }
                    Err(err) => {
                        self.last_error = Some(err.to_string());
                        self.log(
                            LogSeverity::Error,
                            format!("correction injection failed: {err}"),
                            Some(failed_id.to_string()),
                        );
                        true
                    }
                }
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                self.log(
                    LogSeverity::Error,
                    format!("correction planning failed: {err}"),
                    Some(failed_id.to_string()),
                );
                true
            }
        }
    }

    fn memory_context(&self) -> String {
        self.latest_observation
            .as_ref()
            .map(|observation| observation.memory_context.clone())
            .unwrap_or_default()
    }

    /// Wall clock expiry: the running node and every still-pending node
    /// fail with E_WALL_CLOCK so the trace shows why nothing ran.
    fn fail_wall_clock(&mut self, running: Option<&str>) {
        let err = EngineError::WallClockExceeded;
        self.last_error = Some(format!("{err} ({})", codes::E_WALL_CLOCK));
        self.log(
            LogSeverity::Error,
            format!("{err}; failing remaining nodes"),
            running.map(str::to_string),
        );

        if let Some(node_id) = running {
            self.mark_and_emit(
                node_id,
                NodeStatus::Failed,
                MarkOutcome::failed(codes::E_WALL_CLOCK, None),
            );
        }
        let pending: Vec<String> = self
            .graph
            .iter()
            .filter(|node| node.current_status == NodeStatus::Pending)
            .map(|node| node.node_id.clone())
            .collect();
        for node_id in pending {
            self.mark_and_emit(
                &node_id,
                NodeStatus::Failed,
                MarkOutcome::failed(codes::E_WALL_CLOCK, None),
            );
        }
    }

    /// FINALIZING: settle the terminal status, emit the last events, and
    /// release the browser session held by the tool layer.
    async fn finalize(mut self, forced: Option<TaskStatus>) -> TaskStatus {
        let status = forced.unwrap_or_else(|| self.terminal_status());
        self.sync_snapshot();
        self.handle.finish(status);

        match status {
            TaskStatus::Completed => {
                self.log(LogSeverity::Success, "task completed", None);
            }
            TaskStatus::Cancelled => {
                self.log(LogSeverity::Error, "task cancelled", None);
            }
            _ => {
                let detail = self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string());
                self.log(LogSeverity::Error, detail, None);
            }
        }

        self.write_graph_snapshot("final").await;
        self.emit_task();
        info!(task = %self.goal.task_id, ?status, "browser session released");
        status
    }

    /// Completed means the work produced something and every failure was
    /// recovered by a successful correction beneath it.
    fn terminal_status(&self) -> TaskStatus {
        let mut any_success = false;
        let mut unrecovered_failure = false;
        for node in self.graph.iter() {
            match node.current_status {
                NodeStatus::Success => any_success = true,
                NodeStatus::Failed => {
                    if !self.has_success_descendant(&node.node_id) {
                        unrecovered_failure = true;
                    }
                }
                _ => {}
            }
        }
        if any_success && !unrecovered_failure {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        }
    }

    fn has_success_descendant(&self, node_id: &str) -> bool {
        let mut queue: Vec<String> = self
            .graph
            .get(node_id)
            .map(|node| node.child_ids.clone())
            .unwrap_or_default();
        while let Some(id) = queue.pop() {
            if let Some(node) = self.graph.get(&id) {
                if node.current_status == NodeStatus::Success {
                    return true;
                }
                queue.extend(node.child_ids.iter().cloned());
            }
        }
        false
    }

    fn mark_and_emit(&mut self, node_id: &str, status: NodeStatus, outcome: MarkOutcome) {
        match self.graph.mark(node_id, status, outcome) {
            Ok(changed) => {
                self.emit_changed(&changed);
                self.sync_snapshot();
            }
            Err(err) => warn!(node = node_id, %err, "graph transition rejected"),
        }
    }

    fn emit_changed(&self, changed: &[String]) {
        for node_id in changed {
            self.emit_node(node_id);
        }
    }

    fn emit_node(&self, node_id: &str) {
        if let Some(node) = self.graph.get(node_id) {
            self.bus.publish(
                &self.goal.task_id,
                AgentEvent::NodeUpdate { node: node.clone() },
            );
        }
    }

    fn emit_task(&self) {
        self.bus.publish(
            &self.goal.task_id,
            AgentEvent::TaskUpdate {
                task: self.handle.snapshot(),
            },
        );
    }

    fn log(&self, severity: LogSeverity, message: impl Into<String>, node_id: Option<String>) {
        let entry = self.handle.push_log(severity, message.into(), node_id);
        self.bus.publish(&self.goal.task_id, AgentEvent::Log(entry));
    }

    fn sync_snapshot(&self) {
        let snapshot = self.graph.snapshot();
        self.handle.update(|execution| {
            execution.nodes = snapshot.nodes.clone();
            execution.root_node_id = snapshot.root_node_id.clone();
        });
    }

    async fn write_graph_snapshot(&mut self, label: &str) {
        if !self.config.write_graph_snapshots {
            return;
        }
        self.step_counter += 1;
        let path = self
            .ctx
            .artifacts
            .graph_snapshot_path(&self.goal.task_id, self.step_counter, label);
        let html = visualizer::render_html(
            &self.graph.snapshot(),
            &format!("{} / step {}", self.goal.task_id, self.step_counter),
            Utc::now(),
        );
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!(%err, "failed to prepare graph snapshot directory");
                return;
            }
        }
        if let Err(err) = tokio::fs::write(&path, html).await {
            warn!(%err, path = %path.display(), "failed to write graph snapshot");
        }
    }
}

/// Tool-specific projection of a successful dispatch into the node's
/// `resolved_output`: interaction tools surface the post-action URL,
/// everything else surfaces the feedback message (joined extraction items,
/// artifact paths, and so on).
fn resolved_output_projection(tool_name: &str, outcome: &DispatchOutcome) -> String {
    match tool_name {
        "navigate_to" | "click_element" | "click_nth" | "type_text" | "scroll" => {
            outcome.observation.current_url.clone()
        }
        _ => outcome.feedback.message.clone(),
    }
}

/// Console summary of a finished execution, one line per node.
pub fn summary_lines(execution: &TaskExecution) -> Vec<String> {
    let mut lines = Vec::with_capacity(execution.nodes.len() + 1);
    let mut successes = 0usize;
    for node in execution.nodes.values() {
        let mut parts = vec![
            format!("[{:?}] {}", node.current_status, node.node_id),
            format!("tool: {}", node.action.tool_name),
        ];
        if let Some(output) = &node.resolved_output {
            parts.push(format!("output: {}", truncate(output, 80)));
        }
        if let Some(reason) = &node.failure_reason {
            parts.push(format!("error: {}", truncate(reason, 80)));
        }
        if node.current_status == NodeStatus::Success {
            successes += 1;
        }
        lines.push(parts.join(" | "));
    }
    lines.push(format!(
        "total nodes: {} | succeeded: {} | status: {:?}",
        execution.nodes.len(),
        successes,
        execution.status
    ));
    lines
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DecisionAction;

    #[test]
    fn projection_uses_url_for_interaction_tools() {
        let feedback = crate::models::ActionFeedback::success("clicked");
        let observation = WebObservation::local("https://example.com/page", feedback.clone(), "");
        let outcome = DispatchOutcome {
            feedback,
            observation: observation.clone(),
            observations: vec![observation],
            attempts: 1,
        };
        assert_eq!(
            resolved_output_projection("click_element", &outcome),
            "https://example.com/page"
        );
        assert_eq!(resolved_output_projection("extract_data", &outcome), "clicked");
    }

    #[test]
    fn summary_counts_successes() {
        let goal = TaskGoal::new("t", "demo").with_allowed_actions(["wait"]);
        let mut execution = TaskExecution::idle(goal);
        let mut node = ExecutionNode::new("n1", DecisionAction::new("wait"));
        node.current_status = NodeStatus::Success;
        node.resolved_output = Some("done".into());
        execution.nodes.insert("n1".into(), node);
        let lines = summary_lines(&execution);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("output: done"));
        assert!(lines[1].contains("succeeded: 1"));
    }
}
