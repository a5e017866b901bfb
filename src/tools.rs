//! Tool interface consumed by the dispatcher.
//!
//! A tool is identified by name and exposes a single `invoke` entry point
//! returning an observation plus feedback. Browser tools are registered by
//! the embedding layer; the core ships the local tools it owns (`wait`,
//! `open_notepad`) together with the argument contracts for the full
//! recognized tool set, so every argument bag is validated before dispatch.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{codes, EngineError};
use crate::models::{ActionFeedback, WebObservation};
use crate::paths::ArtifactPaths;

/// Context handed to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub task_id: String,
    /// Human task description, used for artifact file naming.
    pub task_topic: String,
    pub artifacts: ArtifactPaths,
    pub headless: bool,
}

impl ToolContext {
    pub fn new(
        task_id: impl Into<String>,
        task_topic: impl Into<String>,
        artifacts: ArtifactPaths,
        headless: bool,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_topic: task_topic.into(),
            artifacts,
            headless,
        }
    }

    /// Context rooted in the system temp directory, for test suites.
    pub fn for_tests(task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        Self {
            task_topic: task_id.clone(),
            task_id,
            artifacts: ArtifactPaths::new(std::env::temp_dir().join("graphpilot-tests")),
            headless: true,
        }
    }
}

/// A named capability the dispatcher can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        args: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> (WebObservation, ActionFeedback);
}

/// Expected JSON kind of a tool argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Str,
    Bool,
    Int,
    Num,
}

impl ArgKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            ArgKind::Str => value.is_string(),
            ArgKind::Bool => value.is_boolean(),
            ArgKind::Int => value.is_i64() || value.is_u64(),
            ArgKind::Num => value.is_number(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            ArgKind::Str => "string",
            ArgKind::Bool => "boolean",
            ArgKind::Int => "integer",
            ArgKind::Num => "number",
        }
    }
}

/// Declarative argument contract entry.
#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
    pub one_of: Option<&'static [&'static str]>,
}

const fn required(name: &'static str, kind: ArgKind) -> ArgSpec {
    ArgSpec {
        name,
        kind,
        required: true,
        one_of: None,
    }
}

const fn optional(name: &'static str, kind: ArgKind) -> ArgSpec {
    ArgSpec {
        name,
        kind,
        required: false,
        one_of: None,
    }
}

const fn choice(
    name: &'static str,
    required: bool,
    one_of: &'static [&'static str],
) -> ArgSpec {
    ArgSpec {
        name,
        kind: ArgKind::Str,
        required,
        one_of: Some(one_of),
    }
}

/// Recognized tool names, their argument contracts, and the one-line
/// parameter guide the planner embeds in its prompt.
pub const TOOL_CONTRACTS: &[(&str, &[ArgSpec], &str)] = &[
    (
        "navigate_to",
        &[required("url", ArgKind::Str)],
        "url: full URL string to open",
    ),
    (
        "click_element",
        &[required("xpath", ArgKind::Str)],
        "xpath: XPath of the element to click",
    ),
    (
        "click_nth",
        &[
            required("selector", ArgKind::Str),
            required("index", ArgKind::Int),
        ],
        "selector: CSS selector; index: 0-based match index to click",
    ),
    (
        "type_text",
        &[
            required("xpath", ArgKind::Str),
            required("text", ArgKind::Str),
            optional("press_enter", ArgKind::Bool),
        ],
        "xpath: target input; text: content to type; press_enter: submit afterwards",
    ),
    (
        "scroll",
        &[
            choice("direction", true, &["up", "down", "top", "bottom"]),
            optional("amount", ArgKind::Int),
        ],
        "direction: up|down|top|bottom; amount: pixels for up/down",
    ),
    (
        "wait",
        &[required("seconds", ArgKind::Num)],
        "seconds: how long to pause",
    ),
    (
        "wait_for",
        &[required("condition", ArgKind::Str)],
        "condition: e.g. 'networkidle' or 'selector:#content_left'",
    ),
    (
        "extract_data",
        &[
            optional("selector", ArgKind::Str),
            choice("attribute", false, &["text", "href", "value"]),
            optional("limit", ArgKind::Int),
        ],
        "selector: CSS scope; attribute: text|href|value; limit: max items",
    ),
    (
        "get_element_attribute",
        &[
            required("xpath", ArgKind::Str),
            required("attribute", ArgKind::Str),
        ],
        "xpath: target element; attribute: attribute name to read",
    ),
    (
        "take_screenshot",
        &[
            required("task_topic", ArgKind::Str),
            optional("full_page", ArgKind::Bool),
        ],
        "task_topic: filename topic; full_page: capture beyond the viewport",
    ),
    (
        "find_link_by_text",
        &[
            required("keyword", ArgKind::Str),
            optional("limit", ArgKind::Int),
        ],
        "keyword: link text to search; limit: max links returned",
    ),
    (
        "open_notepad",
        &[
            optional("file_path", ArgKind::Str),
            required("initial_content", ArgKind::Str),
        ],
        "file_path: optional target path; initial_content: text to write",
    ),
];

fn contract_for(tool_name: &str) -> Option<&'static [ArgSpec]> {
    TOOL_CONTRACTS
        .iter()
        .find(|(name, _, _)| *name == tool_name)
        .map(|(_, specs, _)| *specs)
}

/// One-line parameter guide per tool, restricted to an allow-list.
pub fn param_guide(allowed: &[String]) -> Vec<(&'static str, &'static str)> {
    TOOL_CONTRACTS
        .iter()
        .filter(|(name, _, _)| allowed.iter().any(|tool| tool == name))
        .map(|(name, _, guide)| (*name, *guide))
        .collect()
}

/// Default allow-list handed to tasks created without an explicit one.
pub fn default_allowed_actions() -> Vec<String> {
    TOOL_CONTRACTS
        .iter()
        .map(|(name, _, _)| name.to_string())
        .collect()
}

/// Registry of invocable tools with argument validation at dispatch time.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the local tools the core owns.
    pub fn with_local_tools() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(WaitTool));
        registry.register(Arc::new(NotepadTool));
        registry
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        debug!(tool = tool.name(), "registering tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Validate an argument bag against the tool's declared contract.
    ///
    /// Tools outside the recognized set must at least be registered; their
    /// argument bags pass through unchecked.
    pub fn validate_args(
        &self,
        tool_name: &str,
        args: &Map<String, Value>,
    ) -> Result<(), EngineError> {
        let Some(specs) = contract_for(tool_name) else {
            if self.tools.contains_key(tool_name) {
                return Ok(());
            }
            return Err(EngineError::ToolUnknown(tool_name.to_string()));
        };

        for spec in specs {
            match args.get(spec.name) {
                None if spec.required => {
                    return Err(EngineError::ToolArgument {
                        path: format!("{tool_name}.{}", spec.name),
                        reason: "required argument is missing".to_string(),
                    });
                }
                None => {}
                Some(value) => {
                    if !spec.kind.matches(value) {
                        return Err(EngineError::ToolArgument {
                            path: format!("{tool_name}.{}", spec.name),
                            reason: format!("expected a {}", spec.kind.label()),
                        });
                    }
                    if let (Some(choices), Some(text)) = (spec.one_of, value.as_str()) {
                        if !choices.contains(&text) {
                            return Err(EngineError::ToolArgument {
                                path: format!("{tool_name}.{}", spec.name),
                                reason: format!("'{text}' is not one of {choices:?}"),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Pause execution for a number of seconds. Runs under the dispatcher's
/// per-attempt timeout like any other tool.
pub struct WaitTool;

#[async_trait]
impl Tool for WaitTool {
    fn name(&self) -> &str {
        "wait"
    }

    async fn invoke(
        &self,
        args: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> (WebObservation, ActionFeedback) {
        let seconds = args.get("seconds").and_then(Value::as_f64).unwrap_or(0.0);
        tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
        let feedback = ActionFeedback::success(format!("waited {seconds}s"));
        (
            WebObservation::local("local://wait", feedback.clone(), "local wait"),
            feedback,
        )
    }
}

/// Write a note file and report its absolute path.
pub struct NotepadTool;

#[async_trait]
impl Tool for NotepadTool {
    fn name(&self) -> &str {
        "open_notepad"
    }

    async fn invoke(
        &self,
        args: &Map<String, Value>,
        ctx: &ToolContext,
    ) -> (WebObservation, ActionFeedback) {
        let content = args
            .get("initial_content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let path = match args.get("file_path").and_then(Value::as_str) {
            Some(path) if !path.trim().is_empty() => std::path::PathBuf::from(path),
            _ => ctx.artifacts.notes_path(&ctx.task_topic),
        };

        let feedback = match write_note(&path, content).await {
            Ok(absolute) => ActionFeedback::success(absolute.display().to_string()),
            Err(err) => ActionFeedback::failed(
                "NOTEPAD_LAUNCH_ERROR",
                format!("failed to write note {}: {err}", path.display()),
            ),
        };
        (
            WebObservation::local("local://notepad", feedback.clone(), "local notepad"),
            feedback,
        )
    }
}

async fn write_note(
    path: &std::path::Path,
    content: &str,
) -> std::io::Result<std::path::PathBuf> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(absolute)
}

/// Scripted outcome used by [`ScriptedTool`].
#[derive(Debug, Clone)]
pub struct ScriptedOutcome {
    pub feedback: ActionFeedback,
    pub current_url: Option<String>,
    pub delay: Option<Duration>,
}

impl ScriptedOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        let message = message.into();
        let current_url = message.starts_with("http").then(|| message.clone());
        Self {
            feedback: ActionFeedback::success(message),
            current_url,
            delay: None,
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            feedback: ActionFeedback::failed(code, message),
            current_url: None,
            delay: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.current_url = Some(url.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Deterministic tool used in tests and offline development: plays back a
/// queue of outcomes, repeating the last one once exhausted.
pub struct ScriptedTool {
    name: String,
    outcomes: Mutex<VecDeque<ScriptedOutcome>>,
    last: Mutex<Option<ScriptedOutcome>>,
}

impl ScriptedTool {
    pub fn new(name: impl Into<String>, outcomes: Vec<ScriptedOutcome>) -> Self {
        Self {
            name: name.into(),
            outcomes: Mutex::new(outcomes.into()),
            last: Mutex::new(None),
        }
    }

    pub fn always_ok(name: impl Into<String>) -> Self {
        let name = name.into();
        let message = format!("{name} ok");
        Self::new(name, vec![ScriptedOutcome::ok(message)])
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        _args: &Map<String, Value>,
        _ctx: &ToolContext,
    ) -> (WebObservation, ActionFeedback) {
        let outcome = {
            let mut queue = self.outcomes.lock().expect("scripted tool lock poisoned");
            let mut last = self.last.lock().expect("scripted tool lock poisoned");
            match queue.pop_front() {
                Some(outcome) => {
                    *last = Some(outcome.clone());
                    outcome
                }
                None => last.clone().unwrap_or_else(|| {
                    ScriptedOutcome::failed("E_NET", "scripted tool exhausted")
                }),
            }
        };

        if let Some(delay) = outcome.delay {
            tokio::time::sleep(delay).await;
        }

        let mut observation = WebObservation::local(
            outcome
                .current_url
                .clone()
                .unwrap_or_else(|| "local://scripted".to_string()),
            outcome.feedback.clone(),
            format!("scripted invocation of {}", self.name),
        );
        observation.http_status_code = if outcome.feedback.is_success() { 200 } else { 500 };
        (observation, outcome.feedback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn unknown_tool_fails_validation() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.validate_args("teleport", &Map::new()),
            Err(EngineError::ToolUnknown(_))
        ));
    }

    #[test]
    fn required_args_are_enforced() {
        let registry = ToolRegistry::new();
        assert!(registry.validate_args("navigate_to", &Map::new()).is_err());
        assert!(registry
            .validate_args("navigate_to", &args(&[("url", json!("https://example.com"))]))
            .is_ok());
    }

    #[test]
    fn argument_kinds_are_enforced() {
        let registry = ToolRegistry::new();
        let err = registry
            .validate_args(
                "click_nth",
                &args(&[("selector", json!("a")), ("index", json!("first"))]),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolArgument { path, .. } if path == "click_nth.index"));
    }

    #[test]
    fn enumerated_values_are_enforced() {
        let registry = ToolRegistry::new();
        assert!(registry
            .validate_args("scroll", &args(&[("direction", json!("sideways"))]))
            .is_err());
        assert!(registry
            .validate_args("scroll", &args(&[("direction", json!("down"))]))
            .is_ok());
    }

    #[test]
    fn custom_registered_tools_pass_through() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(ScriptedTool::always_ok("custom_probe")));
        assert!(registry.validate_args("custom_probe", &Map::new()).is_ok());
    }

    #[test]
    fn guide_respects_allow_list() {
        let allowed = vec!["navigate_to".to_string(), "wait".to_string()];
        let guide = param_guide(&allowed);
        assert_eq!(guide.len(), 2);
        assert!(guide.iter().any(|(name, _)| *name == "navigate_to"));
    }

    #[tokio::test]
    async fn notepad_writes_content_and_returns_path() {
        let ctx = ToolContext::for_tests("notepad-test");
        let tool = NotepadTool;
        let (observation, feedback) = tool
            .invoke(
                &args(&[("initial_content", json!("line one\nline two"))]),
                &ctx,
            )
            .await;
        assert!(feedback.is_success(), "{}", feedback.message);
        assert!(feedback.message.ends_with(".txt"));
        assert_eq!(observation.current_url, "local://notepad");
        let written = std::fs::read_to_string(&feedback.message).unwrap();
        assert_eq!(written, "line one\nline two");
    }

    #[tokio::test]
    async fn scripted_tool_replays_and_repeats() {
        let tool = ScriptedTool::new(
            "probe",
            vec![
                ScriptedOutcome::failed("E_NET", "flaky"),
                ScriptedOutcome::ok("https://example.com"),
            ],
        );
        let ctx = ToolContext::for_tests("scripted");
        let (_, first) = tool.invoke(&Map::new(), &ctx).await;
        assert!(!first.is_success());
        let (observation, second) = tool.invoke(&Map::new(), &ctx).await;
        assert!(second.is_success());
        assert_eq!(observation.current_url, "https://example.com");
        let (_, third) = tool.invoke(&Map::new(), &ctx).await;
        assert!(third.is_success(), "last outcome repeats");
    }
}
