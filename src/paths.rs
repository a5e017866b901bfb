//! Filesystem layout for task artifacts.
//!
//! Every artifact lands under one output root:
//! - `temp/notes/<slug>_<YYYYMMDD_HHMMSS>.txt` for text outputs,
//! - `temp/screenshots/<slug>_<YYYYMMDD_HHMMSS>.png` for captures,
//! - `logs/graphs/<task_id>_<step>_<node_id>.html` for graph snapshots.

use std::path::{Path, PathBuf};

use chrono::Local;

const SLUG_MAX_LEN: usize = 64;

/// Filesystem-safe derivative of a human string: characters outside
/// `[A-Za-z0-9_-]` become `_`, runs of `_` collapse, and the result is
/// truncated at 64 characters.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(SLUG_MAX_LEN));
    let mut last_was_underscore = false;
    for ch in input.trim().chars() {
        let mapped = if ch.is_ascii_alphanumeric() || ch == '-' {
            Some(ch)
        } else if ch == '_' || ch.is_whitespace() {
            Some('_')
        } else {
            None
        };
        if let Some(ch) = mapped {
            if ch == '_' {
                if last_was_underscore {
                    continue;
                }
                last_was_underscore = true;
            } else {
                last_was_underscore = false;
            }
            out.push(ch);
            if out.len() >= SLUG_MAX_LEN {
                break;
            }
        }
    }
    let trimmed = out.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed
    }
}

fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Path builder for one output root.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    root: PathBuf,
}

impl ArtifactPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn notes_path(&self, topic: &str) -> PathBuf {
        self.root
            .join("temp")
            .join("notes")
            .join(format!("{}_{}.txt", slug(topic), timestamp()))
    }

    pub fn screenshot_path(&self, topic: &str) -> PathBuf {
        self.root
            .join("temp")
            .join("screenshots")
            .join(format!("{}_{}.png", slug(topic), timestamp()))
    }

    pub fn graph_snapshot_path(&self, task_id: &str, step: u32, node_id: &str) -> PathBuf {
        self.root.join("logs").join("graphs").join(format!(
            "{}_{:02}_{}.html",
            slug(task_id),
            step,
            slug(node_id)
        ))
    }
}
