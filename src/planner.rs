//! Planner: turns a goal plus the latest observation into a validated list
//! of execution nodes by prompting the language model with the node schema.
//!
//! The model never drives control flow. It only produces plan fragments;
//! the decision loop decides what happens with them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{EngineError, PlannerError};
use crate::models::{node_schema, ExecutionNode, TaskGoal, WebObservation};
use crate::tools::param_guide;

const DEFAULT_CALL_BUDGET: Duration = Duration::from_secs(60);

/// Prompt pair sent to the language model.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanRequest {
    pub system: String,
    pub user: String,
}

/// Capability that, given a prompt, returns the model's raw text response.
#[async_trait]
pub trait LlmPlanner: Send + Sync {
    async fn generate(&self, request: &PlanRequest) -> Result<String, PlannerError>;
}

/// Record of a failed node threaded into correction prompts so the model
/// does not regenerate the same mistake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedNodeRecord {
    pub node_id: String,
    pub tool_name: String,
    pub error_message: String,
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct PlanEnvelope {
    execution_plan: Vec<Value>,
}

pub struct Planner {
    provider: Arc<dyn LlmPlanner>,
    call_budget: Duration,
}

impl Planner {
    pub fn new(provider: Arc<dyn LlmPlanner>) -> Self {
        Self {
            provider,
            call_budget: DEFAULT_CALL_BUDGET,
        }
    }

    pub fn with_call_budget(mut self, budget: Duration) -> Self {
        self.call_budget = budget;
        self
    }

    /// Produce the initial plan for a goal.
    pub async fn plan(
        &self,
        goal: &TaskGoal,
        observation: Option<&WebObservation>,
        memory_context: &str,
    ) -> Result<Vec<ExecutionNode>, PlannerError> {
        let request = PlanRequest {
            system: system_prompt(goal),
            user: plan_user_prompt(goal, observation, memory_context),
        };
        self.generate_validated(goal, request).await
    }

    /// Produce a correction subplan for a failed node.
    pub async fn correct(
        &self,
        goal: &TaskGoal,
        observation: Option<&WebObservation>,
        failed_node: &ExecutionNode,
        history: &[FailedNodeRecord],
        memory_context: &str,
    ) -> Result<Vec<ExecutionNode>, PlannerError> {
        let request = PlanRequest {
            system: system_prompt(goal),
            user: correction_user_prompt(goal, observation, failed_node, history, memory_context),
        };
        self.generate_validated(goal, request).await
    }

    /// One call, and on validation failure one retry with a clarification
    /// appended. A second failure surfaces as a planner error.
    async fn generate_validated(
        &self,
        goal: &TaskGoal,
        request: PlanRequest,
    ) -> Result<Vec<ExecutionNode>, PlannerError> {
        let response = self.call(&request).await?;
        match parse_and_validate(&response, goal) {
            Ok(nodes) => Ok(nodes),
            Err(PlannerError::Validation { path, reason }) => {
                warn!(%path, %reason, "plan failed validation, retrying once");
                let retry = PlanRequest {
                    system: request.system.clone(),
                    user: format!(
                        "{}\n\nThe previous response failed validation at {path}: {reason}. \
                         Return a corrected JSON object with the same contract.",
                        request.user
                    ),
                };
                let response = self.call(&retry).await?;
                parse_and_validate(&response, goal)
            }
            Err(other) => Err(other),
        }
    }

    async fn call(&self, request: &PlanRequest) -> Result<String, PlannerError> {
        debug!(budget_s = self.call_budget.as_secs(), "invoking llm planner");
        tokio::time::timeout(self.call_budget, self.provider.generate(request))
            .await
            .map_err(|_| PlannerError::Timeout(self.call_budget))?
    }
}

fn system_prompt(goal: &TaskGoal) -> String {
    let guide = param_guide(&goal.allowed_actions)
        .into_iter()
        .map(|(name, line)| format!("- {name}: {line}"))
        .collect::<Vec<_>>()
        .join("\n");
    let schema = serde_json::to_string_pretty(&node_schema())
        .unwrap_or_else(|_| "{}".to_string());

    format!(
        "You are a web automation planner acting as persona '{persona}' in \
         environment '{environment}'.\n\
         Decompose the user's goal into a plan of tool invocations.\n\n\
         Allowed tools:\n{guide}\n\n\
         Every plan node must conform to this JSON schema:\n{schema}\n\n\
         Respond with a single JSON object of the form \
         {{\"execution_plan\": [node, node, ...]}} and nothing else. \
         Use `parent_id` to express dependencies and \
         `${{node_id.output}}` templates to reference earlier results.",
        persona = goal.current_agent_persona,
        environment = goal.execution_environment,
    )
}

fn plan_user_prompt(
    goal: &TaskGoal,
    observation: Option<&WebObservation>,
    memory_context: &str,
) -> String {
    let mut prompt = format!("GOAL: {}\n", goal.target_description);
    if !goal.required_data.is_empty() {
        let pairs = goal
            .required_data
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        prompt.push_str(&format!("REQUIRED DATA: {pairs}\n"));
    }
    push_context(&mut prompt, observation, memory_context);
    prompt
}

fn correction_user_prompt(
    goal: &TaskGoal,
    observation: Option<&WebObservation>,
    failed_node: &ExecutionNode,
    history: &[FailedNodeRecord],
    memory_context: &str,
) -> String {
    let feedback = failed_node
        .last_observation
        .as_ref()
        .and_then(|obs| obs.last_action_feedback.as_ref())
        .map(|fb| format!("{} ({})", fb.message, fb.error_code))
        .or_else(|| failed_node.failure_reason.clone())
        .unwrap_or_else(|| "unknown error".to_string());

    let mut prompt = format!(
        "ORIGINAL GOAL: {}\n\
         CONTEXT: The step '{}' (node {}) FAILED.\n\
         ERROR: {}\n\
         TASK: Generate a short corrective plan (1-3 steps) that fixes the \
         error and still achieves the original goal.\n",
        goal.target_description, failed_node.action.tool_name, failed_node.node_id, feedback
    );

    if !history.is_empty() {
        prompt.push_str("PREVIOUSLY FAILED STEPS (do not repeat these):\n");
        for record in history {
            prompt.push_str(&format!(
                "- {} via {}: {}\n",
                record.node_id, record.tool_name, record.error_message
            ));
        }
    }
    push_context(&mut prompt, observation, memory_context);
    prompt
}

fn push_context(prompt: &mut String, observation: Option<&WebObservation>, memory: &str) {
    if let Some(observation) = observation {
        prompt.push_str(&format!("OBSERVATION: {}\n", observation.summary()));
    }
    if !memory.trim().is_empty() {
        prompt.push_str(&format!("MEMORY: {memory}\n"));
    }
}

/// Parse the model response and validate every node against the goal.
fn parse_and_validate(response: &str, goal: &TaskGoal) -> Result<Vec<ExecutionNode>, PlannerError> {
    let payload = extract_json(response)
        .ok_or_else(|| PlannerError::validation("$", "response contains no JSON object"))?;
    let envelope: PlanEnvelope = serde_json::from_str(payload)
        .map_err(|err| PlannerError::validation("execution_plan", err.to_string()))?;

    if envelope.execution_plan.is_empty() {
        return Err(PlannerError::EmptyPlan);
    }

    let mut nodes = Vec::with_capacity(envelope.execution_plan.len());
    for (index, value) in envelope.execution_plan.into_iter().enumerate() {
        let path = format!("execution_plan[{index}]");
        let node: ExecutionNode = serde_json::from_value(value)
            .map_err(|err| PlannerError::validation(&path, err.to_string()))?;
        node.validate(goal).map_err(|err| match err {
            EngineError::Validation { field, reason } => {
                PlannerError::validation(format!("{path}.{field}"), reason)
            }
            other => PlannerError::validation(&path, other.to_string()),
        })?;
        nodes.push(node);
    }
    Ok(nodes)
}

/// Locate the JSON object in a response that may carry prose or code fences.
fn extract_json(response: &str) -> Option<&str> {
    let trimmed = response.trim();
    let body = if let Some(stripped) = trimmed.strip_prefix("```json") {
        stripped.strip_suffix("```").unwrap_or(stripped)
    } else if let Some(stripped) = trimmed.strip_prefix("```") {
        stripped.strip_suffix("```").unwrap_or(stripped)
    } else {
        trimmed
    };
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (start <= end).then(|| &body[start..=end])
}

/// Scripted provider used by the test suite and offline development.
/// Responses play back in order; an exhausted queue is a transport error.
#[derive(Default)]
pub struct MockPlanner {
    responses: Mutex<VecDeque<Result<String, PlannerError>>>,
}

impl MockPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses
            .lock()
            .expect("mock planner lock poisoned")
            .push_back(Ok(response.into()));
    }

    pub fn push_error(&self, error: PlannerError) {
        self.responses
            .lock()
            .expect("mock planner lock poisoned")
            .push_back(Err(error));
    }

    /// Convenience wrapper encoding a plan as the wire envelope.
    pub fn push_plan(&self, nodes: &[Value]) {
        let envelope = serde_json::json!({ "execution_plan": nodes });
        self.push_response(envelope.to_string());
    }
}

#[async_trait]
impl LlmPlanner for MockPlanner {
    async fn generate(&self, _request: &PlanRequest) -> Result<String, PlannerError> {
        self.responses
            .lock()
            .expect("mock planner lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(PlannerError::Transport("mock planner exhausted".into())))
    }
}
