//! Filter evaluation and subtree pruning.
//!
//! Repeated `filter=` parameters form a disjunction; the comma-joined
//! terms inside one parameter form a conjunction evaluated against a
//! single candidate entity chain. Pruning is recursive: a collection
//! member survives only if it (or a descendant reachable through the
//! filtered path) satisfies the expression, and counts rendered later
//! reflect the post-filter cardinality.

use crate::query::tree::{NodeKind, TreeNode};
use crate::query::{FilterExpr, FilterOp, FilterTerm};
use crate::value::PropValue;

/// Apply a disjunction of filter expressions to a subtree. `None` means
/// the whole subtree was eliminated.
pub fn apply_filters<'m>(node: TreeNode<'m>, filters: &[FilterExpr]) -> Option<TreeNode<'m>> {
    if filters.is_empty() {
        return Some(node);
    }
    let mut merged: Option<TreeNode<'m>> = None;
    for expr in filters {
        if let Some(pruned) = prune(node.clone(), &expr.terms) {
            merged = Some(match merged {
                None => pruned,
                Some(acc) => merge(acc, pruned),
            });
        }
    }
    merged
}

fn prune<'m>(mut node: TreeNode<'m>, terms: &[FilterTerm]) -> Option<TreeNode<'m>> {
    let mut local: Vec<&FilterTerm> = Vec::new();
    let mut per_child: Vec<(String, Vec<FilterTerm>)> = Vec::new();
    for term in terms {
        match term.path.first() {
            Some(head) if is_child_name(&node, head) => {
                let stripped = FilterTerm {
                    path: term.path[1..].to_vec(),
                    op: term.op.clone(),
                    value: term.value.clone(),
                };
                match per_child.iter_mut().find(|(name, _)| name == head) {
                    Some((_, list)) => list.push(stripped),
                    None => per_child.push((head.clone(), vec![stripped])),
                }
            }
            _ => local.push(term),
        }
    }
    for term in local {
        if !eval_term(&node, term) {
            return None;
        }
    }
    for (child_name, subterms) in per_child {
        if child_name == "meta" {
            let meta = node.meta.take()?;
            let pruned = prune(*meta, &subterms)?;
            node.meta = Some(Box::new(pruned));
            continue;
        }
        let Some(slot) = node
            .collections
            .iter_mut()
            .find(|(name, _)| *name == child_name)
        else {
            return None;
        };
        let members = std::mem::take(&mut slot.1);
        let kept: Vec<TreeNode<'m>> = members
            .into_iter()
            .filter_map(|member| prune(member, &subterms))
            .collect();
        if kept.is_empty() {
            return None;
        }
        slot.1 = kept;
    }
    Some(node)
}

fn is_child_name(node: &TreeNode<'_>, name: &str) -> bool {
    if name == "meta" && node.meta.is_some() {
        return true;
    }
    node.collections.iter().any(|(n, _)| n == name)
}

fn merge<'m>(mut a: TreeNode<'m>, b: TreeNode<'m>) -> TreeNode<'m> {
    for (name, b_members) in b.collections {
        let Some(slot) = a.collections.iter_mut().find(|(n, _)| *n == name) else {
            continue;
        };
        for b_member in b_members {
            match slot.1.iter_mut().position(|m| m.id == b_member.id) {
                Some(idx) => {
                    let existing = std::mem::replace(&mut slot.1[idx], placeholder());
                    slot.1[idx] = merge(existing, b_member);
                }
                None => slot.1.push(b_member),
            }
        }
        // Restore the canonical id ordering disturbed by appends.
        slot.1.sort_by(|x, y| x.id.cmp(&y.id));
    }
    a
}

fn placeholder<'m>() -> TreeNode<'m> {
    TreeNode {
        id: String::new(),
        display_path: String::new(),
        entity: crate::entity::Entity {
            path: String::new(),
            sid: String::new(),
            kind: crate::path::EntityKind::Registry,
            props: Default::default(),
        },
        kind: NodeKind::Registry,
        collections: Vec::new(),
        meta: None,
        default_vid: None,
        xref: None,
    }
}

/// Evaluate one attribute test against a node.
fn eval_term(node: &TreeNode<'_>, term: &FilterTerm) -> bool {
    let attr_path = term.path.join(".");
    let actual = node_attr_value(node, &attr_path);
    match term.op {
        FilterOp::Present => actual.is_some(),
        FilterOp::Absent => actual.is_none(),
        FilterOp::Eq => match actual.and_then(scalar_string) {
            Some(text) => wildcard_match(&text, &term.value),
            None => false,
        },
        FilterOp::Ne => match actual.and_then(scalar_string) {
            Some(text) => !wildcard_match(&text, &term.value),
            None => false,
        },
    }
}

/// Resolve an attribute value on a node, honoring the resource level's
/// default-version read-through.
pub(crate) fn node_attr_value(node: &TreeNode<'_>, attr_path: &str) -> Option<serde_json::Value> {
    if attr_path == "xid" {
        return Some(serde_json::Value::String(format!("/{}", node.display_path)));
    }
    if let NodeKind::Resource { .. } = node.kind {
        if let Some(default_vid) = &node.default_vid {
            if let Some(default) = node.child("versions", default_vid) {
                if let Some(found) = default.entity.get_attr(attr_path) {
                    return Some(found);
                }
            }
        }
        return node.entity.get_attr(attr_path);
    }
    if attr_path == "isdefault" {
        // Stored only when true; absent means false.
        return Some(serde_json::Value::Bool(
            node.entity.bool("isdefault").unwrap_or(false),
        ));
    }
    node.entity.get_attr(attr_path)
}

/// Sortable/filterable scalar view of a JSON value.
pub(crate) fn scalar_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Typed view of a node attribute for sorting.
pub(crate) fn node_attr_prop(node: &TreeNode<'_>, attr_path: &str) -> Option<PropValue> {
    node_attr_value(node, attr_path).and_then(|v| PropValue::infer(&v))
}

/// Case-insensitive wildcard comparison; `*` matches any run of
/// characters.
pub(crate) fn wildcard_match(text: &str, pattern: &str) -> bool {
    let text = text.to_lowercase();
    let pattern = pattern.to_lowercase();
    if !pattern.contains('*') {
        return text == pattern;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0usize;
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text.starts_with(part) {
                return false;
            }
            pos = part.len();
        } else if i == last {
            let rest = &text[pos..];
            return rest.len() >= part.len() && rest.ends_with(part);
        } else {
            match text[pos..].find(part) {
                Some(idx) => pos += idx + part.len(),
                None => return false,
            }
        }
    }
    true
}
