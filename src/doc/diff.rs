//! Scene diff: the roadmap report between `current` and `future`.
//!
//! DESIGN
//! ======
//! Every node id in either scene is classified:
//! - only in future: added
//! - only in current: removed
//! - in both with a different comparison field: modified
//! - otherwise unchanged, and omitted
//!
//! Items are collected in future order (added, modified) followed by
//! current order (removed), then grouped by category in first-seen order.
//! Inside a group items sort by kind (added, modified, removed) then id.
//! The report never fails: missing data falls back to defaults.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::entity::Node;

/// Which data keys drive the report, and their fallbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffOptions {
    /// Data key compared between the two sides of a node.
    pub compare_field: String,
    /// Value assumed when the compare field is absent or empty.
    pub compare_default: String,
    pub category_field: String,
    pub fallback_category: String,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            compare_field: "provider".into(),
            compare_default: "other".into(),
            category_field: "category".into(),
            fallback_category: "General".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadmapItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_type: Option<String>,
    pub category: String,
    /// Transition text, present on modified items only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryGroup {
    pub category: String,
    pub items: Vec<RoadmapItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoadmapReport {
    pub groups: Vec<CategoryGroup>,
}

impl RoadmapReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total number of items across groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.items.len()).sum()
    }

    #[must_use]
    pub fn group(&self, category: &str) -> Option<&CategoryGroup> {
        self.groups.iter().find(|g| g.category == category)
    }
}

/// Compare two node sets and build the grouped report.
#[must_use]
pub fn diff_scenes(current: &[Node], future: &[Node], options: &DiffOptions) -> RoadmapReport {
    let current_by_id: HashMap<&str, &Node> = current.iter().map(|n| (n.id.as_str(), n)).collect();
    let future_by_id: HashMap<&str, &Node> = future.iter().map(|n| (n.id.as_str(), n)).collect();

    let mut items = Vec::new();
    for node in future {
        match current_by_id.get(node.id.as_str()) {
            None => items.push(item(node, ChangeKind::Added, None, options)),
            Some(before) => {
                let from = compare_value(before, options);
                let to = compare_value(node, options);
                if from != to {
                    let details = transition(from, to, &options.compare_default);
                    items.push(item(node, ChangeKind::Modified, Some(details), options));
                }
            }
        }
    }
    for node in current {
        if !future_by_id.contains_key(node.id.as_str()) {
            items.push(item(node, ChangeKind::Removed, None, options));
        }
    }

    let mut groups: Vec<CategoryGroup> = Vec::new();
    for entry in items {
        match groups.iter_mut().find(|g| g.category == entry.category) {
            Some(group) => group.items.push(entry),
            None => groups.push(CategoryGroup { category: entry.category.clone(), items: vec![entry] }),
        }
    }
    for group in &mut groups {
        group.items.sort_by(|a, b| (a.kind, &a.id).cmp(&(b.kind, &b.id)));
    }

    RoadmapReport { groups }
}

// =============================================================================
// HELPERS
// =============================================================================

fn item(node: &Node, kind: ChangeKind, details: Option<String>, options: &DiffOptions) -> RoadmapItem {
    RoadmapItem {
        id: node.id.clone(),
        kind,
        label: node.label().to_string(),
        icon_type: node.data_str("iconType").map(str::to_string),
        category: node
            .data_str(&options.category_field)
            .unwrap_or(&options.fallback_category)
            .to_string(),
        details,
    }
}

fn compare_value<'a>(node: &'a Node, options: &'a DiffOptions) -> &'a str {
    node.data_str(&options.compare_field)
        .unwrap_or(&options.compare_default)
}

fn transition(from: &str, to: &str, default: &str) -> String {
    if from == default {
        format!("Switched to {to}")
    } else if to == default {
        format!("Switched from {from}")
    } else {
        format!("Switched from {from} to {to}")
    }
}

#[cfg(test)]
#[path = "diff_test.rs"]
mod tests;
