//! DOT rendering of a finished tree.

use std::fmt::Write as _;
use std::path::Path;

use halfempty_engine::TaskStatus;
use halfempty_engine::report::TreeSnapshot;
use halfempty_engine::tree::Branch;

/// Render a tree snapshot as a DOT digraph. Node colors follow the
/// candidate status; placeholders are dashed.
#[must_use]
pub fn render(snapshot: &TreeSnapshot) -> String {
    let mut out = String::from(
        "digraph halfempty {\n  node [shape=box, style=filled, fontname=\"monospace\"];\n",
    );

    for node in &snapshot.nodes {
        let (label, color, extra) = match node.status {
            Some(status) => (
                format!(
                    "#{} {}\\n{} bytes, {} ms",
                    node.id,
                    status,
                    node.size,
                    node.elapsed.as_millis()
                ),
                fill_color(status),
                "",
            ),
            None => (format!("#{}", node.id), "white", ", style=\"filled,dashed\""),
        };
        let _ = writeln!(
            out,
            "  n{} [label=\"{label}\", fillcolor=\"{color}\"{extra}];",
            node.id
        );
    }

    for node in &snapshot.nodes {
        if let Some(parent) = node.parent {
            let style = match node.branch {
                Some(Branch::Success) => "solid",
                _ => "dashed",
            };
            let _ = writeln!(out, "  n{parent} -> n{} [style={style}];", node.id);
        }
    }

    out.push_str("}\n");
    out
}

/// Write the DOT rendering to a file.
///
/// # Errors
///
/// Propagates the underlying filesystem error.
pub fn write(path: &Path, snapshot: &TreeSnapshot) -> std::io::Result<()> {
    std::fs::write(path, render(snapshot))
}

fn fill_color(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Success => "palegreen",
        TaskStatus::Failure => "lightcoral",
        TaskStatus::Pending => "khaki",
        TaskStatus::Discarded => "lightgray",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halfempty_engine::report::NodeSnapshot;
    use std::time::Duration;

    #[test]
    fn renders_nodes_and_edges() {
        let snapshot = TreeSnapshot {
            nodes: vec![
                NodeSnapshot {
                    id: 0,
                    parent: None,
                    branch: None,
                    status: Some(TaskStatus::Success),
                    size: 10,
                    elapsed: Duration::ZERO,
                    depth: 0,
                },
                NodeSnapshot {
                    id: 1,
                    parent: Some(0),
                    branch: Some(Branch::Success),
                    status: Some(TaskStatus::Failure),
                    size: 5,
                    elapsed: Duration::from_millis(12),
                    depth: 1,
                },
                NodeSnapshot {
                    id: 2,
                    parent: Some(0),
                    branch: Some(Branch::Failure),
                    status: None,
                    size: 0,
                    elapsed: Duration::ZERO,
                    depth: 1,
                },
            ],
        };

        let dot = render(&snapshot);
        assert!(dot.starts_with("digraph halfempty {"));
        assert!(dot.contains("n0 -> n1"));
        assert!(dot.contains("n0 -> n2"));
        assert!(dot.contains("palegreen"));
        assert!(dot.contains("lightcoral"));
        assert!(dot.ends_with("}\n"));
    }
}
