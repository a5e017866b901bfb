//! Tool dispatcher: the single synchronous call path between the decision
//! loop and the tool layer.
//!
//! The dispatcher resolves `${node_id.field}` argument templates, enforces
//! per-attempt timeouts, and retries transient failures with exponential
//! backoff. It is stateless between calls; everything it needs arrives
//! through the action, the shared outputs, and the tool context.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{codes, EngineError};
use crate::models::{ActionFeedback, DecisionAction, WebObservation};
use crate::tools::{ToolContext, ToolRegistry};

const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_CAP_MS: u64 = 4_000;

/// A `${node_id.field}` reference found inside a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    pub node_id: String,
    pub field: String,
}

/// Extract every `${...}` reference from a template string.
pub fn template_refs(input: &str) -> Vec<TemplateRef> {
    let mut refs = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else { break };
        let body = &after[..end];
        if !body.is_empty() {
            let (node_id, field) = match body.split_once('.') {
                Some((node, field)) => (node, field),
                None => (body, "output"),
            };
            refs.push(TemplateRef {
                node_id: node_id.to_string(),
                field: field.to_string(),
            });
        }
        rest = &after[end + 1..];
    }
    refs
}

/// Substitute `${node_id.field}` references with captured outputs.
///
/// Every referenced node must be a SUCCESS node present in `outputs`; the
/// first unresolved reference aborts resolution with its path.
pub fn resolve_str(input: &str, outputs: &HashMap<String, String>) -> Result<String, String> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            return Ok(result);
        };
        let body = &after[..end];
        let node_id = body.split_once('.').map(|(node, _)| node).unwrap_or(body);
        match outputs.get(node_id) {
            Some(output) => result.push_str(output),
            None => return Err(body.to_string()),
        }
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}

/// Resolve templates inside every string-valued argument of an action.
pub fn resolve_action_args(
    action: &DecisionAction,
    outputs: &HashMap<String, String>,
) -> Result<Map<String, Value>, EngineError> {
    let mut resolved = Map::with_capacity(action.tool_args.len());
    for (key, value) in &action.tool_args {
        let value = match value {
            Value::String(text) => Value::String(
                resolve_str(text, outputs)
                    .map_err(|path| EngineError::UnresolvedRef { path })?,
            ),
            other => other.clone(),
        };
        resolved.insert(key.clone(), value);
    }
    Ok(resolved)
}

/// Result of one dispatch: final feedback plus every observation captured
/// along the way (one per attempt).
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub feedback: ActionFeedback,
    pub observation: WebObservation,
    pub observations: Vec<WebObservation>,
    pub attempts: u32,
}

impl DispatchOutcome {
    fn rejected(feedback: ActionFeedback, memory: &str) -> Self {
        let observation = WebObservation::local("local://dispatcher", feedback.clone(), memory);
        Self {
            feedback,
            observation: observation.clone(),
            observations: vec![observation],
            attempts: 0,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Invoke the action's tool, retrying transient failures with backoff.
    ///
    /// Permanent rejections (unresolved references, bad arguments, unknown
    /// tools) return immediately without consuming an attempt.
    pub async fn dispatch(
        &self,
        action: &DecisionAction,
        outputs: &HashMap<String, String>,
        ctx: &ToolContext,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let args = match resolve_action_args(action, outputs) {
            Ok(args) => args,
            Err(err) => {
                return DispatchOutcome::rejected(
                    ActionFeedback::failed(codes::E_UNRESOLVED_REF, err.to_string()),
                    "argument template resolution failed",
                );
            }
        };

        if let Err(err) = self.registry.validate_args(&action.tool_name, &args) {
            return DispatchOutcome::rejected(
                ActionFeedback::failed(err.code(), err.to_string()),
                "argument validation failed",
            );
        }

        let Some(tool) = self.registry.get(&action.tool_name) else {
            return DispatchOutcome::rejected(
                ActionFeedback::failed(
                    codes::E_TOOL_UNKNOWN,
                    format!("tool '{}' is not registered", action.tool_name),
                ),
                "tool lookup failed",
            );
        };

        let timeout = Duration::from_secs(action.execution_timeout_seconds);
        let max_attempts = action.max_attempts.clamp(1, 5);
        let mut observations = Vec::new();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let (observation, feedback) = self
                .attempt(tool.as_ref(), action, &args, ctx, timeout)
                .await;
            observations.push(observation.clone());

            let retryable = feedback.is_transient() && attempts < max_attempts;
            if feedback.is_success() || !retryable {
                if !feedback.is_success() {
                    warn!(
                        tool = %action.tool_name,
                        attempts,
                        code = %feedback.error_code,
                        "tool dispatch failed"
                    );
                }
                return DispatchOutcome {
                    feedback,
                    observation,
                    observations,
                    attempts,
                };
            }

            if cancel.is_cancelled() {
                debug!(tool = %action.tool_name, "cancellation observed between retries");
                return DispatchOutcome {
                    feedback,
                    observation,
                    observations,
                    attempts,
                };
            }

            let backoff = backoff_delay(attempts);
            debug!(
                tool = %action.tool_name,
                attempt = attempts,
                backoff_ms = backoff.as_millis() as u64,
                "retrying transient tool failure"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// One timed attempt: the tool call plus any post-condition wait share
    /// the action's timeout budget.
    async fn attempt(
        &self,
        tool: &dyn crate::tools::Tool,
        action: &DecisionAction,
        args: &Map<String, Value>,
        ctx: &ToolContext,
        timeout: Duration,
    ) -> (WebObservation, ActionFeedback) {
        let wait_after = action.wait_for_condition_after.clone();
        let registry = Arc::clone(&self.registry);

        let invocation = async {
            let (observation, feedback) = tool.invoke(args, ctx).await;
            if !feedback.is_success() {
                return (observation, feedback);
            }
            let Some(condition) = wait_after else {
                return (observation, feedback);
            };
            let Some(waiter) = registry.get("wait_for") else {
                // No waiter available; the action itself already succeeded.
                return (observation, feedback);
            };
            let mut wait_args = Map::new();
            wait_args.insert("condition".to_string(), Value::String(condition));
            let (wait_observation, wait_feedback) = waiter.invoke(&wait_args, ctx).await;
            if wait_feedback.is_success() {
                (observation, feedback)
            } else {
                (wait_observation, wait_feedback)
            }
        };

        match tokio::time::timeout(timeout, invocation).await {
            Ok(pair) => pair,
            Err(_) => {
                let feedback = ActionFeedback::timeout(format!(
                    "tool '{}' did not return within {}s",
                    action.tool_name,
                    timeout.as_secs()
                ));
                (
                    WebObservation::local(
                        "local://dispatcher",
                        feedback.clone(),
                        "tool execution timed out",
                    ),
                    feedback,
                )
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << exp);
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeedbackStatus;
    use crate::tools::{ScriptedOutcome, ScriptedTool};

    fn ctx() -> ToolContext {
        ToolContext::for_tests("task-1")
    }

    fn action(tool: &str) -> DecisionAction {
        DecisionAction::new(tool)
    }

    #[test]
    fn template_refs_are_extracted() {
        let refs = template_refs("${n1.output} and ${n2.url}");
        assert_eq!(
            refs,
            vec![
                TemplateRef {
                    node_id: "n1".into(),
                    field: "output".into()
                },
                TemplateRef {
                    node_id: "n2".into(),
                    field: "url".into()
                },
            ]
        );
        assert!(template_refs("true").is_empty());
    }

    #[test]
    fn resolve_substitutes_and_reports_misses() {
        let mut outputs = HashMap::new();
        outputs.insert("n1".to_string(), "https://example.com".to_string());
        assert_eq!(
            resolve_str("go to ${n1.output} now", &outputs).unwrap(),
            "go to https://example.com now"
        );
        assert_eq!(
            resolve_str("${ghost.output}", &outputs).unwrap_err(),
            "ghost.output"
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(250));
        assert_eq!(backoff_delay(2), Duration::from_millis(500));
        assert_eq!(backoff_delay(3), Duration::from_millis(1000));
        assert_eq!(backoff_delay(5), Duration::from_millis(4000));
        assert_eq!(backoff_delay(30), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn unresolved_reference_is_rejected_without_attempts() {
        let registry = Arc::new(ToolRegistry::new());
        let dispatcher = Dispatcher::new(registry);
        let action = action("navigate_to").with_arg("url", "${missing.output}");
        let outcome = dispatcher
            .dispatch(&action, &HashMap::new(), &ctx(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.feedback.error_code, codes::E_UNRESOLVED_REF);
        assert_eq!(outcome.feedback.status, FeedbackStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let registry = Arc::new(ToolRegistry::new());
        let dispatcher = Dispatcher::new(registry);
        let outcome = dispatcher
            .dispatch(
                &action("teleport"),
                &HashMap::new(),
                &ctx(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.feedback.error_code, codes::E_TOOL_UNKNOWN);
    }

    #[tokio::test]
    async fn missing_required_argument_is_rejected() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(ScriptedTool::always_ok("navigate_to")));
        let dispatcher = Dispatcher::new(registry);
        let outcome = dispatcher
            .dispatch(
                &action("navigate_to"),
                &HashMap::new(),
                &ctx(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.feedback.error_code, codes::E_BAD_ARG);
        assert_eq!(outcome.attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_bounded_backoff() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(ScriptedTool::new(
            "click_element",
            vec![
                ScriptedOutcome::failed(codes::E_NET, "connection reset"),
                ScriptedOutcome::failed(codes::E_NET, "connection reset"),
                ScriptedOutcome::ok("https://example.com/clicked"),
            ],
        )));
        let dispatcher = Dispatcher::new(registry);

        let mut action = action("click_element").with_arg("xpath", "//a[1]");
        action.max_attempts = 3;

        let started = tokio::time::Instant::now();
        let outcome = dispatcher
            .dispatch(&action, &HashMap::new(), &ctx(), &CancellationToken::new())
            .await;
        let elapsed = started.elapsed();

        assert!(outcome.feedback.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.observations.len(), 3);
        assert!(elapsed >= Duration::from_millis(750), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1000), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn permanent_failures_do_not_retry() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(ScriptedTool::new(
            "click_element",
            vec![ScriptedOutcome::failed(codes::E_BAD_ARG, "no such element")],
        )));
        let dispatcher = Dispatcher::new(registry);

        let mut action = action("click_element").with_arg("xpath", "//a[1]");
        action.max_attempts = 5;
        let outcome = dispatcher
            .dispatch(&action, &HashMap::new(), &ctx(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.feedback.error_code, codes::E_BAD_ARG);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_tool_times_out() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(ScriptedTool::new(
            "wait",
            vec![ScriptedOutcome::ok("done").with_delay(Duration::from_secs(120))],
        )));
        let dispatcher = Dispatcher::new(registry);

        let mut action = action("wait").with_arg("seconds", 1);
        action.execution_timeout_seconds = 2;
        let outcome = dispatcher
            .dispatch(&action, &HashMap::new(), &ctx(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.feedback.status, FeedbackStatus::Timeout);
        assert_eq!(outcome.feedback.error_code, codes::E_TIMEOUT);
    }
}
