//! Metric line rendering.

use crate::types::{Labels, RelationItem, RelationKind};

/// Escape a label value for the text exposition format.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// `name{k="v",...} 1`, labels in key order.
pub fn metric_line(name: &str, labels: &Labels) -> String {
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect();
    format!("{name}{{{}}} 1", rendered.join(","))
}

/// Edge metric name: both kinds sorted, joined with `_with_`.
pub fn edge_name(a: &RelationKind, b: &RelationKind) -> String {
    let (first, second) = if a.name() <= b.name() {
        (a.name(), b.name())
    } else {
        (b.name(), a.name())
    };
    format!("{first}_with_{second}_relation")
}

pub fn edge_line(a: &RelationItem, b: &RelationItem) -> String {
    let mut labels = a.labels.clone();
    labels.extend(b.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    metric_line(&edge_name(&a.kind, &b.kind), &labels)
}

pub fn info_line(node: &RelationItem, expands: &Labels) -> String {
    let mut labels = node.labels.clone();
    labels.extend(expands.iter().map(|(k, v)| (k.clone(), v.clone())));
    metric_line(&format!("{}_info_relation", node.kind.name()), &labels)
}
