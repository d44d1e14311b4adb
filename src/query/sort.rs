//! Typed collection sorting.
//!
//! One sort key per request, type-aware comparison, absent values first
//! (the type's minimum), ties broken by the entity's own id
//! case-insensitively. Descending order is the exact reverse of the
//! ascending order.

use std::cmp::Ordering;

use crate::query::filter::node_attr_prop;
use crate::query::tree::TreeNode;
use crate::query::SortSpec;
use crate::value::compare_ci;

/// Sort collection members in place.
pub fn sort_nodes(nodes: &mut [TreeNode<'_>], spec: &SortSpec) {
    nodes.sort_by(|a, b| {
        let ka = node_attr_prop(a, &spec.attr);
        let kb = node_attr_prop(b, &spec.attr);
        let ord = match (&ka, &kb) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(va), Some(vb)) => va.compare(vb),
        };
        match ord {
            Ordering::Equal => compare_ci(&a.id, &b.id),
            other => other,
        }
    });
    if spec.descending {
        nodes.reverse();
    }
}
