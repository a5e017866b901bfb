//! graphpilot: a goal-directed web automation engine built around a
//! Dynamic Execution Graph.
//!
//! A submitted goal is decomposed by a language model into a graph of tool
//! invocations; a per-task decision loop schedules nodes, dispatches tools,
//! observes outcomes, and either prunes failed branches or grafts
//! correction subplans. External observers watch the graph evolve through
//! the event bus.

pub mod config;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod executor;
pub mod graph;
pub mod llm;
pub mod models;
pub mod paths;
pub mod planner;
pub mod registry;
pub mod server;
pub mod tools;
pub mod visualizer;

pub use config::AppConfig;
pub use errors::{EngineError, GraphError, PlannerError};
pub use events::{AgentEvent, EventBus};
pub use executor::{DecisionLoop, LoopConfig};
pub use graph::{ExecutionGraph, GraphSnapshot};
pub use models::{
    ActionFeedback, DecisionAction, ExecutionNode, NodeStatus, OnFailure, TaskExecution, TaskGoal,
    TaskStatus, WebObservation,
};
pub use planner::{LlmPlanner, MockPlanner, Planner};
pub use registry::{TaskHandle, TaskOptions, TaskRegistry};
pub use tools::{Tool, ToolContext, ToolRegistry};
