//! Error types shared across the engine.
//!
//! Errors travel as tagged values between layers; nothing is thrown across
//! a component boundary. Each engine error carries a stable code string that
//! also appears in `ActionFeedback.error_code` on the wire.

use std::time::Duration;

use thiserror::Error;

use crate::models::NodeStatus;

/// Stable error codes surfaced in feedback and logs.
pub mod codes {
    pub const E_NET: &str = "E_NET";
    pub const E_STALE_DOM: &str = "E_STALE_DOM";
    pub const E_TIMEOUT: &str = "E_TIMEOUT";
    pub const E_BAD_ARG: &str = "E_BAD_ARG";
    pub const E_UNRESOLVED_REF: &str = "E_UNRESOLVED_REF";
    pub const E_TOOL_UNKNOWN: &str = "E_TOOL_UNKNOWN";
    pub const E_WALL_CLOCK: &str = "E_WALL_CLOCK";
    pub const E_CANCELLED: &str = "E_CANCELLED";
    pub const E_CORRECTION_BUDGET: &str = "E_CORRECTION_BUDGET";

    /// Codes the dispatcher may retry with backoff.
    pub const TRANSIENT: &[&str] = &[E_NET, E_STALE_DOM, E_TIMEOUT];

    pub fn is_transient(code: &str) -> bool {
        TRANSIENT.contains(&code)
    }
}

/// Unified engine error covering the dispatcher and loop failure kinds.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("validation failed at {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("bad tool argument at {path}: {reason}")]
    ToolArgument { path: String, reason: String },

    #[error("unresolved output reference {path}")]
    UnresolvedRef { path: String },

    #[error("transient tool failure ({code}): {message}")]
    TransientTool { code: String, message: String },

    #[error("unknown tool '{0}'")]
    ToolUnknown(String),

    #[error("correction budget exhausted after {0} round(s)")]
    CorrectionBudgetExceeded(u32),

    #[error("wall clock budget exceeded")]
    WallClockExceeded,

    #[error("task cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Stable code string for feedback and log records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "E_VALIDATION",
            Self::ToolArgument { .. } => codes::E_BAD_ARG,
            Self::UnresolvedRef { .. } => codes::E_UNRESOLVED_REF,
            Self::TransientTool { .. } => codes::E_NET,
            Self::ToolUnknown(_) => codes::E_TOOL_UNKNOWN,
            Self::CorrectionBudgetExceeded(_) => codes::E_CORRECTION_BUDGET,
            Self::WallClockExceeded => codes::E_WALL_CLOCK,
            Self::Cancelled => codes::E_CANCELLED,
        }
    }
}

/// Errors raised while planning with the language model.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlannerError {
    #[error("llm transport failed: {0}")]
    Transport(String),

    #[error("llm call exceeded the {0:?} budget")]
    Timeout(Duration),

    #[error("plan response failed validation at {path}: {reason}")]
    Validation { path: String, reason: String },

    #[error("llm returned an empty plan")]
    EmptyPlan,
}

impl PlannerError {
    pub fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by graph mutations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    #[error("parent node '{0}' not found")]
    ParentMissing(String),

    #[error("graph already has a root node")]
    RootExists,

    #[error("node '{0}' not found")]
    UnknownNode(String),

    #[error("illegal status transition for '{node}': {from:?} -> {to:?}")]
    IllegalTransition {
        node: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("correction anchor '{node}' must be FAILED or SUCCESS, is {status:?}")]
    BadAnchor { node: String, status: NodeStatus },
}
