//! Task registry: process-local mapping of task ids to live executions.
//!
//! Creation spawns a decision loop worker; readers get deep-copied
//! snapshots; `stop` flips the cooperative cancellation flag. Each entry
//! has a single mutator (its loop) and status changes go through
//! compare-and-set.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::dispatch::Dispatcher;
use crate::errors::EngineError;
use crate::events::EventBus;
use crate::executor::{DecisionLoop, LoopConfig};
use crate::models::{LogEntry, LogSeverity, NodeStatus, TaskExecution, TaskGoal, TaskStatus};
use crate::paths::ArtifactPaths;
use crate::planner::Planner;
use crate::tools::{default_allowed_actions, ToolContext, ToolRegistry};

/// Shared state for one live task: the execution snapshot the loop keeps
/// current, the append-only log store, and the cancellation flag.
pub struct TaskHandle {
    execution: Mutex<TaskExecution>,
    logs: Mutex<Vec<LogEntry>>,
    log_seq: AtomicU64,
    pub cancel: CancellationToken,
}

impl TaskHandle {
    pub fn new(goal: TaskGoal) -> Arc<Self> {
        Arc::new(Self {
            execution: Mutex::new(TaskExecution::idle(goal)),
            logs: Mutex::new(Vec::new()),
            log_seq: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    pub fn snapshot(&self) -> TaskExecution {
        self.execution.lock().expect("task handle poisoned").clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.execution.lock().expect("task handle poisoned").status
    }

    pub fn update(&self, mutate: impl FnOnce(&mut TaskExecution)) {
        let mut execution = self.execution.lock().expect("task handle poisoned");
        mutate(&mut execution);
    }

    /// Compare-and-set idle -> running, stamping the start time.
    pub fn try_start(&self) -> bool {
        let mut execution = self.execution.lock().expect("task handle poisoned");
        if execution.status != TaskStatus::Idle {
            return false;
        }
        execution.status = TaskStatus::Running;
        execution.started_at = Some(Utc::now());
        true
    }

    /// Settle a terminal status exactly once.
    pub fn finish(&self, status: TaskStatus) {
        let mut execution = self.execution.lock().expect("task handle poisoned");
        if execution.status.is_terminal() {
            return;
        }
        execution.status = status;
        execution.finished_at = Some(Utc::now());
    }

    /// Append to the log store and return the entry for publication.
    pub fn push_log(
        &self,
        severity: LogSeverity,
        message: String,
        node_id: Option<String>,
    ) -> LogEntry {
        let id = self.log_seq.fetch_add(1, Ordering::SeqCst);
        let mut entry = LogEntry::new(id, severity, message);
        entry.node_id = node_id;
        self.logs
            .lock()
            .expect("task handle poisoned")
            .push(entry.clone());
        entry
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().expect("task handle poisoned").clone()
    }
}

/// Options accepted at task submission.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Caller-supplied identifier; generated when absent.
    pub task_id: Option<String>,
    pub headless: Option<bool>,
    pub allowed_actions: Option<Vec<String>>,
    pub max_execution_time_seconds: Option<u64>,
    pub priority_level: Option<u8>,
}

/// DevTools endpoint info exposed over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct CdpUrlInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub struct TaskRegistry {
    tasks: DashMap<String, Arc<TaskHandle>>,
    bus: Arc<EventBus>,
    planner: Arc<Planner>,
    tools: Arc<ToolRegistry>,
    artifacts: ArtifactPaths,
    default_headless: bool,
    cdp_url: Option<String>,
    loop_config: LoopConfig,
}

impl TaskRegistry {
    pub fn new(
        planner: Arc<Planner>,
        tools: Arc<ToolRegistry>,
        bus: Arc<EventBus>,
        config: &AppConfig,
    ) -> Self {
        Self {
            tasks: DashMap::new(),
            bus,
            planner,
            tools,
            artifacts: ArtifactPaths::new(config.output_root.clone()),
            default_headless: config.default_headless,
            cdp_url: config.cdp_url.clone(),
            loop_config: LoopConfig::default(),
        }
    }

    pub fn with_loop_config(mut self, loop_config: LoopConfig) -> Self {
        self.loop_config = loop_config;
        self
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Register a task and spawn its decision loop worker.
    pub fn create(
        &self,
        description: &str,
        options: TaskOptions,
    ) -> Result<TaskExecution, EngineError> {
        let task_id = options
            .task_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.tasks.contains_key(&task_id) {
            return Err(EngineError::validation(
                "task_id",
                format!("task '{task_id}' already exists"),
            ));
        }

        let mut goal = TaskGoal::new(task_id.clone(), description);
        goal.allowed_actions = options
            .allowed_actions
            .unwrap_or_else(default_allowed_actions);
        if let Some(step_budget) = options.max_execution_time_seconds {
            goal.max_execution_time_seconds = step_budget;
        }
        if let Some(priority) = options.priority_level {
            goal.priority_level = priority;
        }
        goal.validate()?;

        let handle = TaskHandle::new(goal.clone());
        self.tasks.insert(task_id.clone(), Arc::clone(&handle));

        let ctx = ToolContext::new(
            task_id.clone(),
            goal.target_description.clone(),
            self.artifacts.clone(),
            options.headless.unwrap_or(self.default_headless),
        );
        let decision_loop = DecisionLoop::new(
            goal,
            Arc::clone(&handle),
            Arc::clone(&self.planner),
            Dispatcher::new(Arc::clone(&self.tools)),
            Arc::clone(&self.bus),
            ctx,
            self.loop_config.clone(),
        );

        info!(task = %task_id, "spawning decision loop");
        tokio::spawn(decision_loop.run());

        Ok(handle.snapshot())
    }

    pub fn get(&self, task_id: &str) -> Option<TaskExecution> {
        self.tasks.get(task_id).map(|handle| handle.snapshot())
    }

    pub fn logs(&self, task_id: &str) -> Option<Vec<LogEntry>> {
        self.tasks.get(task_id).map(|handle| handle.logs())
    }

    /// All known executions, newest start first; never-started tasks sort
    /// last in creation order.
    pub fn list(&self) -> Vec<TaskExecution> {
        let mut executions: Vec<TaskExecution> = self
            .tasks
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        executions
    }

    /// Flip the cooperative cancellation flag. Returns false for unknown
    /// tasks or tasks that already reached a terminal status.
    pub fn stop(&self, task_id: &str) -> bool {
        let Some(handle) = self.tasks.get(task_id) else {
            return false;
        };
        if handle.status().is_terminal() {
            return false;
        }
        handle.cancel.cancel();
        true
    }

    /// Latest screenshot artifact produced by the task, if any.
    pub fn screenshot_path(&self, task_id: &str) -> Option<PathBuf> {
        let execution = self.get(task_id)?;
        execution
            .nodes
            .values()
            .filter(|node| {
                node.current_status == NodeStatus::Success
                    && node.action.tool_name == "take_screenshot"
            })
            .filter_map(|node| node.resolved_output.as_ref())
            .map(PathBuf::from)
            .next_back()
    }

    pub fn cdp_status(&self, task_id: &str) -> Option<CdpUrlInfo> {
        let execution = self.get(task_id)?;
        let info = match execution.status {
            TaskStatus::Idle => CdpUrlInfo {
                url: None,
                status: "waiting",
                message: Some("task has not started yet".to_string()),
            },
            TaskStatus::Running => match &self.cdp_url {
                Some(url) => CdpUrlInfo {
                    url: Some(url.clone()),
                    status: "ready",
                    message: None,
                },
                None => CdpUrlInfo {
                    url: None,
                    status: "waiting",
                    message: Some("browser session has no DevTools endpoint".to_string()),
                },
            },
            _ => CdpUrlInfo {
                url: None,
                status: "completed",
                message: None,
            },
        };
        Some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::MockPlanner;

    fn registry() -> TaskRegistry {
        let planner = Arc::new(Planner::new(Arc::new(MockPlanner::new())));
        let tools = Arc::new(ToolRegistry::with_local_tools());
        let bus = Arc::new(EventBus::new());
        let config = AppConfig {
            output_root: std::env::temp_dir().join("graphpilot-registry-tests"),
            ..AppConfig::default()
        };
        TaskRegistry::new(planner, tools, bus, &config)
    }

    #[tokio::test]
    async fn duplicate_task_ids_are_rejected() {
        let registry = registry();
        let options = TaskOptions {
            task_id: Some("fixed".to_string()),
            ..TaskOptions::default()
        };
        registry.create("demo", options.clone()).unwrap();
        assert!(registry.create("demo", options).is_err());
    }

    #[tokio::test]
    async fn stop_is_rejected_for_unknown_tasks() {
        let registry = registry();
        assert!(!registry.stop("ghost"));
    }

    #[tokio::test]
    async fn list_returns_known_tasks() {
        let registry = registry();
        registry
            .create(
                "demo",
                TaskOptions {
                    task_id: Some("t1".to_string()),
                    ..TaskOptions::default()
                },
            )
            .unwrap();
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_id, "t1");
        assert!(registry.get("t1").is_some());
    }
}
