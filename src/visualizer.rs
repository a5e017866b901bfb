//! Graph visualizer: renders a snapshot as a Mermaid flowchart embedded in
//! a standalone HTML page.
//!
//! Rendering is a pure function of the snapshot (plus the caller-provided
//! timestamp), so audits can regenerate identical output from stored state.

use chrono::{DateTime, Utc};

use crate::graph::GraphSnapshot;
use crate::models::NodeStatus;

const HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8" />
    <title>Execution Graph: {title}</title>
    <script src="https://cdn.jsdelivr.net/npm/mermaid@10/dist/mermaid.min.js"></script>
    <style>
        body { font-family: sans-serif; padding: 20px; }
        h1 { border-bottom: 2px solid #ccc; padding-bottom: 10px; }
        .mermaid { width: 100%; height: auto; border: 1px solid #ddd; padding: 10px; box-sizing: border-box; }
        .node.success rect { fill: #90EE90; stroke: #3C3; stroke-width: 2px; }
        .node.running rect { fill: yellow; stroke: #FF0; stroke-width: 2px; }
        .node.failed rect { fill: #FA8072; stroke: #F00; stroke-width: 2px; }
        .node.pending rect { fill: lightblue; stroke: #39F; stroke-width: 2px; }
        .node.pruned rect { fill: grey; stroke: #666; stroke-width: 2px; }
        .node.skipped rect { fill: #ddd; stroke: #999; stroke-width: 2px; }
        .edgeLabel { background-color: white; padding: 0 5px; border-radius: 3px; }
    </style>
</head>
<body>
    <h1>Execution Graph Snapshot: {title}</h1>
    <p>Timestamp: {timestamp}</p>
    <pre class="mermaid">
{mermaid}
    </pre>
    <script>
        mermaid.initialize({ startOnLoad: true, theme: 'default' });
    </script>
</body>
</html>
"#;

fn status_class(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Pending => "pending",
        NodeStatus::Running => "running",
        NodeStatus::Success => "success",
        NodeStatus::Failed => "failed",
        NodeStatus::Pruned => "pruned",
        NodeStatus::Skipped => "skipped",
    }
}

/// Mermaid identifiers only tolerate word characters.
fn mermaid_id(raw: &str) -> String {
    let mut id: String = raw
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '_' { ch } else { '_' })
        .collect();
    if id.chars().next().map(|ch| ch.is_ascii_digit()).unwrap_or(true) {
        id.insert(0, 'n');
    }
    id
}

fn escape_label(raw: &str) -> String {
    raw.replace('"', "'").replace(['\n', '\r'], " ")
}

/// Render the snapshot as Mermaid `graph TD` source.
pub fn render_mermaid(snapshot: &GraphSnapshot) -> String {
    let mut source = String::from("graph TD\n");
    let mut classes = Vec::new();

    // BTreeMap iteration keeps node declarations deterministic.
    for (node_id, node) in &snapshot.nodes {
        let id = mermaid_id(node_id);
        let label = escape_label(&format!(
            "ID: {}<br/>P: {}<br/>Tool: {}<br/>Status: {:?}",
            node_id,
            node.execution_order_priority,
            node.action.tool_name,
            node.current_status
        ));
        source.push_str(&format!("    {id}[\"{label}\"]\n"));
        classes.push(format!(
            "    class {id} {};",
            status_class(node.current_status)
        ));
    }

    for (node_id, node) in &snapshot.nodes {
        if let Some(parent_id) = &node.parent_id {
            if snapshot.nodes.contains_key(parent_id) {
                source.push_str(&format!(
                    "    {} -->|P{}| {}\n",
                    mermaid_id(parent_id),
                    node.execution_order_priority,
                    mermaid_id(node_id)
                ));
            }
        }
    }

    source.push('\n');
    source.push_str(&classes.join("\n"));
    source
}

/// Render a standalone HTML page for the snapshot.
pub fn render_html(snapshot: &GraphSnapshot, title: &str, rendered_at: DateTime<Utc>) -> String {
    HTML_TEMPLATE
        .replace("{title}", &escape_label(title))
        .replace("{timestamp}", &rendered_at.to_rfc3339())
        .replace("{mermaid}", render_mermaid(snapshot).trim_end())
}
