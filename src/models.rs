//! Decision models: the declarative shapes exchanged between the planner,
//! the execution graph, and the dispatcher.
//!
//! All models are plain values with structural equality. The subset the
//! language model is asked to produce ([`ExecutionNode`] and everything it
//! embeds) additionally derives a JSON schema that the planner emits as an
//! output constraint.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::{schema::RootSchema, schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::EngineError;

/// Axis-aligned bounding box of a page element, in CSS pixels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

/// Snapshot of an actionable page element, produced by the tool layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KeyElement {
    pub element_id: String,
    pub tag_name: String,
    pub xpath: String,
    pub inner_text: String,
    #[serde(default)]
    pub is_visible: bool,
    #[serde(default)]
    pub is_clickable: bool,
    #[serde(default)]
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose_hint: Option<String>,
}

/// Outcome token of the most recent action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackStatus {
    Success,
    Failed,
    Timeout,
    Partial,
}

/// Detailed feedback describing the outcome of the last action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionFeedback {
    pub status: FeedbackStatus,
    pub error_code: String,
    pub message: String,
}

impl ActionFeedback {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: FeedbackStatus::Success,
            error_code: "0".to_string(),
            message: message.into(),
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: FeedbackStatus::Failed,
            error_code: code.into(),
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: FeedbackStatus::Timeout,
            error_code: crate::errors::codes::E_TIMEOUT.to_string(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == FeedbackStatus::Success
    }

    /// Whether the dispatcher may retry this outcome with backoff.
    pub fn is_transient(&self) -> bool {
        match self.status {
            FeedbackStatus::Timeout => true,
            FeedbackStatus::Failed => crate::errors::codes::is_transient(&self.error_code),
            _ => false,
        }
    }
}

/// Structured observation of the browser environment after an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WebObservation {
    /// ISO-8601 capture timestamp.
    pub observation_timestamp_utc: String,
    pub current_url: String,
    pub http_status_code: u16,
    pub page_load_time_ms: u64,
    #[serde(default)]
    pub is_authenticated: bool,
    #[serde(default)]
    pub key_elements: Vec<KeyElement>,
    #[serde(default)]
    pub screenshot_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_feedback: Option<ActionFeedback>,
    #[serde(default)]
    pub memory_context: String,
    #[serde(default = "default_browser_health")]
    pub browser_health_status: String,
}

fn default_browser_health() -> String {
    "healthy".to_string()
}

impl WebObservation {
    /// Observation for tools that never touch the browser (local:// scheme).
    pub fn local(
        url: impl Into<String>,
        feedback: ActionFeedback,
        memory_context: impl Into<String>,
    ) -> Self {
        let status = if feedback.is_success() { 200 } else { 500 };
        Self {
            observation_timestamp_utc: Utc::now().to_rfc3339(),
            current_url: url.into(),
            http_status_code: status,
            page_load_time_ms: 0,
            is_authenticated: false,
            key_elements: Vec::new(),
            screenshot_available: false,
            last_action_feedback: Some(feedback),
            memory_context: memory_context.into(),
            browser_health_status: default_browser_health(),
        }
    }

    /// Short one-line summary used in planner prompts.
    pub fn summary(&self) -> String {
        let feedback = self
            .last_action_feedback
            .as_ref()
            .map(|fb| format!("{:?} {}", fb.status, fb.message))
            .unwrap_or_else(|| "no feedback".to_string());
        format!(
            "url={} http={} elements={} last_action={}",
            self.current_url,
            self.http_status_code,
            self.key_elements.len(),
            feedback
        )
    }
}

/// Strategy applied when an action fails after exhausting its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnFailure {
    /// Ask the planner for a correction subplan grafted under the failed node.
    #[default]
    ReEvaluate,
    /// Prune every descendant and give up on the branch.
    Abort,
    /// Mark descendants skipped and continue with siblings.
    Skip,
    /// Retries happen inside the dispatcher; a final failure ends the task.
    RetryOnly,
}

/// A single tool invocation directive produced by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DecisionAction {
    /// Name of the tool to invoke; must appear in `TaskGoal.allowed_actions`.
    pub tool_name: String,
    /// String-keyed argument bag; expected keys depend on the tool.
    #[serde(default)]
    pub tool_args: Map<String, Value>,
    /// Total invocation attempts the dispatcher may spend (1..=5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Hard per-attempt ceiling, in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub execution_timeout_seconds: u64,
    /// Optional condition the tool layer waits for after the action,
    /// e.g. "networkidle" or "selector:#content_left".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_condition_after: Option<String>,
    /// Model-provided explanation for choosing this action.
    #[serde(default)]
    pub reasoning: String,
    /// Model confidence in [0, 1].
    #[serde(default = "default_confidence")]
    pub confidence_score: f64,
    /// What the model expects the environment to look like afterwards.
    #[serde(default)]
    pub expected_outcome: String,
    #[serde(default)]
    pub on_failure_action: OnFailure,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_timeout_seconds() -> u64 {
    10
}

fn default_confidence() -> f64 {
    1.0
}

impl DecisionAction {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_args: Map::new(),
            max_attempts: default_max_attempts(),
            execution_timeout_seconds: default_timeout_seconds(),
            wait_for_condition_after: None,
            reasoning: String::new(),
            confidence_score: default_confidence(),
            expected_outcome: String::new(),
            on_failure_action: OnFailure::default(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.tool_args.insert(key.to_string(), value.into());
        self
    }

    /// Validate the action against its owning goal.
    pub fn validate(&self, goal: &TaskGoal) -> Result<(), EngineError> {
        if self.tool_name.trim().is_empty() {
            return Err(EngineError::validation("tool_name", "must not be empty"));
        }
        if !goal.allowed_actions.iter().any(|t| t == &self.tool_name) {
            return Err(EngineError::validation(
                "tool_name",
                format!("'{}' is not in the allowed tool list", self.tool_name),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(EngineError::validation(
                "confidence_score",
                format!("{} is outside [0, 1]", self.confidence_score),
            ));
        }
        if self.execution_timeout_seconds == 0 {
            return Err(EngineError::validation(
                "execution_timeout_seconds",
                "must be positive",
            ));
        }
        if self.max_attempts == 0 || self.max_attempts > 5 {
            return Err(EngineError::validation(
                "max_attempts",
                format!("{} is outside 1..=5", self.max_attempts),
            ));
        }
        Ok(())
    }
}

/// Runtime status of a node in the execution graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Pruned,
    Skipped,
}

impl NodeStatus {
    /// Terminal statuses never transition again (except prune cascades).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failed | NodeStatus::Pruned | NodeStatus::Skipped
        )
    }
}

/// A vertex of the Dynamic Execution Graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionNode {
    pub node_id: String,
    /// None marks the root node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Maintained by the graph; planner-provided values are discarded.
    #[serde(default)]
    pub child_ids: Vec<String>,
    /// Lower values run earlier among siblings.
    #[serde(default = "default_priority")]
    pub execution_order_priority: i32,
    pub action: DecisionAction,
    #[serde(default)]
    pub current_status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Boolean-ish expression; `${node_id.field}` references gate scheduling.
    #[serde(default = "default_precondition")]
    pub required_precondition: String,
    #[serde(default = "default_cost_units")]
    pub expected_cost_units: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_observation: Option<WebObservation>,
    /// String projection of what the node produced; set only on SUCCESS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_output: Option<String>,
}

fn default_priority() -> i32 {
    1
}

fn default_precondition() -> String {
    "true".to_string()
}

fn default_cost_units() -> u32 {
    1
}

impl ExecutionNode {
    pub fn new(node_id: impl Into<String>, action: DecisionAction) -> Self {
        Self {
            node_id: node_id.into(),
            parent_id: None,
            child_ids: Vec::new(),
            execution_order_priority: default_priority(),
            action,
            current_status: NodeStatus::Pending,
            failure_reason: None,
            required_precondition: default_precondition(),
            expected_cost_units: default_cost_units(),
            last_observation: None,
            resolved_output: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.execution_order_priority = priority;
        self
    }

    /// Validate the node shape against the goal it will execute under.
    pub fn validate(&self, goal: &TaskGoal) -> Result<(), EngineError> {
        if self.node_id.trim().is_empty() {
            return Err(EngineError::validation("node_id", "must not be empty"));
        }
        self.action.validate(goal).map_err(|err| match err {
            EngineError::Validation { field, reason } => EngineError::Validation {
                field: format!("action.{field}"),
                reason,
            },
            other => other,
        })
    }
}

/// JSON schema for the plan node, emitted to the language model as an
/// output constraint.
pub fn node_schema() -> RootSchema {
    schema_for!(ExecutionNode)
}

/// Immutable description of one submitted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGoal {
    /// Globally unique opaque identifier.
    pub task_id: String,
    /// Natural-language description of what to achieve.
    pub target_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_deadline_utc: Option<DateTime<Utc>>,
    /// Per-step time budget in seconds.
    #[serde(default = "default_step_budget")]
    pub max_execution_time_seconds: u64,
    /// Credentials or parameters the task needs.
    #[serde(default)]
    pub required_data: BTreeMap<String, String>,
    #[serde(default = "default_persona")]
    pub current_agent_persona: String,
    #[serde(default = "default_environment")]
    pub execution_environment: String,
    /// Tool names the planner may use; non-empty, no duplicates.
    pub allowed_actions: Vec<String>,
    /// Business priority, 1 highest .. 10 lowest.
    #[serde(default = "default_priority_level")]
    pub priority_level: u8,
}

fn default_step_budget() -> u64 {
    60
}

fn default_persona() -> String {
    "standard_user".to_string()
}

fn default_environment() -> String {
    "desktop_chrome".to_string()
}

fn default_priority_level() -> u8 {
    5
}

impl TaskGoal {
    pub fn new(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            target_description: description.into(),
            task_deadline_utc: None,
            max_execution_time_seconds: default_step_budget(),
            required_data: BTreeMap::new(),
            current_agent_persona: default_persona(),
            execution_environment: default_environment(),
            allowed_actions: Vec::new(),
            priority_level: default_priority_level(),
        }
    }

    pub fn with_allowed_actions<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_actions = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.task_id.trim().is_empty() {
            return Err(EngineError::validation("task_id", "must not be empty"));
        }
        if self.allowed_actions.is_empty() {
            return Err(EngineError::validation(
                "allowed_actions",
                "must not be empty",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for tool in &self.allowed_actions {
            if !seen.insert(tool.as_str()) {
                return Err(EngineError::validation(
                    "allowed_actions",
                    format!("duplicate tool '{tool}'"),
                ));
            }
        }
        if self.max_execution_time_seconds == 0 {
            return Err(EngineError::validation(
                "max_execution_time_seconds",
                "must be positive",
            ));
        }
        if !(1..=10).contains(&self.priority_level) {
            return Err(EngineError::validation(
                "priority_level",
                format!("{} is outside 1..=10", self.priority_level),
            ));
        }
        Ok(())
    }
}

/// Lifecycle status of a task execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Aggregate snapshot of one task: goal, graph, and lifecycle markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub goal: TaskGoal,
    pub nodes: BTreeMap<String, ExecutionNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_node_id: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskExecution {
    pub fn idle(goal: TaskGoal) -> Self {
        Self {
            task_id: goal.task_id.clone(),
            goal,
            nodes: BTreeMap::new(),
            root_node_id: None,
            status: TaskStatus::Idle,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Severity of a trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
    Success,
}

/// Ordered trace record for the execution audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: String,
    pub severity: LogSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl LogEntry {
    pub fn new(id: u64, severity: LogSeverity, message: impl Into<String>) -> Self {
        Self {
            id,
            timestamp: Utc::now().to_rfc3339(),
            severity,
            message: message.into(),
            node_id: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn goal() -> TaskGoal {
        TaskGoal::new("task-1", "demo").with_allowed_actions(["navigate_to", "extract_data"])
    }

    #[test]
    fn action_rejects_unknown_tool() {
        let action = DecisionAction::new("unknown_tool");
        let err = action.validate(&goal()).unwrap_err();
        assert!(matches!(err, EngineError::Validation { field, .. } if field == "tool_name"));
    }

    #[test]
    fn action_rejects_out_of_range_confidence() {
        let mut action = DecisionAction::new("navigate_to");
        action.confidence_score = 1.2;
        let err = action.validate(&goal()).unwrap_err();
        assert!(matches!(err, EngineError::Validation { field, .. } if field == "confidence_score"));
    }

    #[test]
    fn action_rejects_zero_timeout_and_bad_attempts() {
        let mut action = DecisionAction::new("navigate_to");
        action.execution_timeout_seconds = 0;
        assert!(action.validate(&goal()).is_err());

        let mut action = DecisionAction::new("navigate_to");
        action.max_attempts = 6;
        assert!(action.validate(&goal()).is_err());
    }

    #[test]
    fn goal_rejects_duplicate_tools() {
        let goal = TaskGoal::new("t", "d").with_allowed_actions(["wait", "wait"]);
        assert!(goal.validate().is_err());
    }

    #[test]
    fn node_validation_prefixes_action_fields() {
        let node = ExecutionNode::new("n1", DecisionAction::new("bogus"));
        let err = node.validate(&goal()).unwrap_err();
        assert!(
            matches!(err, EngineError::Validation { ref field, .. } if field == "action.tool_name")
        );
    }

    #[test]
    fn statuses_use_wire_casing() {
        assert_eq!(
            serde_json::to_value(NodeStatus::Pending).unwrap(),
            json!("PENDING")
        );
        assert_eq!(
            serde_json::to_value(OnFailure::ReEvaluate).unwrap(),
            json!("RE_EVALUATE")
        );
        assert_eq!(
            serde_json::to_value(TaskStatus::Completed).unwrap(),
            json!("completed")
        );
        assert_eq!(
            serde_json::to_value(FeedbackStatus::Success).unwrap(),
            json!("SUCCESS")
        );
    }

    #[test]
    fn node_deserializes_with_defaults() {
        let node: ExecutionNode = serde_json::from_value(json!({
            "node_id": "n1",
            "action": { "tool_name": "navigate_to", "tool_args": { "url": "https://example.com" } }
        }))
        .unwrap();
        assert_eq!(node.current_status, NodeStatus::Pending);
        assert_eq!(node.execution_order_priority, 1);
        assert_eq!(node.action.max_attempts, 1);
        assert_eq!(node.action.on_failure_action, OnFailure::ReEvaluate);
        assert_eq!(node.required_precondition, "true");
    }

    #[test]
    fn schema_exposes_plan_fields() {
        let schema = serde_json::to_value(node_schema()).unwrap();
        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .expect("schema properties");
        for key in ["node_id", "parent_id", "action", "execution_order_priority"] {
            assert!(properties.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn task_execution_round_trips() {
        let mut execution = TaskExecution::idle(goal());
        execution.status = TaskStatus::Running;
        execution.started_at = Some(Utc::now());
        execution.nodes.insert(
            "n1".into(),
            ExecutionNode::new(
                "n1",
                DecisionAction::new("navigate_to").with_arg("url", "https://example.com"),
            ),
        );
        execution.root_node_id = Some("n1".into());

        let encoded = serde_json::to_string(&execution).unwrap();
        let decoded: TaskExecution = serde_json::from_str(&encoded).unwrap();
        assert_eq!(execution, decoded);
    }
}
