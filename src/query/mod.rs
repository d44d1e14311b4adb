//! Read-side query/projection engine: selective subtree inlining,
//! multi-predicate filtering, typed sorting, and doc/export rendering.
//!
//! The engine operates read-only over a materialized entity subtree. The
//! HTTP layer parses the wire query string; the structured forms here are
//! the collaboration boundary.
#![forbid(unsafe_code)]

mod filter;
mod serialize;
mod sort;
mod tree;

pub use filter::apply_filters;
pub use serialize::{render_collection, render_node, RenderCtx};
pub use sort::sort_nodes;
pub use tree::{materialize_group, materialize_registry, materialize_resource, NodeKind, TreeNode};

use crate::error::{RegistryError, Result};

/// Which subtrees to materialize inline instead of as URL summaries.
#[derive(Clone, Debug, Default)]
pub struct InlineSet {
    /// `inline=*`: everything in the entity tree, recursively.
    pub all: bool,
    /// Explicit dot-paths, relative to the request target.
    pub paths: Vec<Vec<String>>,
}

impl InlineSet {
    /// Nothing inlined.
    pub fn none() -> InlineSet {
        InlineSet::default()
    }

    /// Everything inlined.
    pub fn everything() -> InlineSet {
        InlineSet {
            all: true,
            paths: Vec::new(),
        }
    }

    /// Parse a comma-separated inline list (`*`, `files.versions`, ...).
    pub fn parse(raw: &str) -> InlineSet {
        let mut set = InlineSet::none();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part == "*" {
                set.all = true;
            } else {
                set.paths
                    .push(part.split('.').map(str::to_string).collect());
            }
        }
        set
    }

    /// Is the subtree at relative path `rel` selected for inlining?
    ///
    /// Selecting a nested path inlines its ancestors too.
    pub fn selected(&self, rel: &[String]) -> bool {
        if rel.is_empty() {
            return true;
        }
        if self.all {
            return true;
        }
        self.paths
            .iter()
            .any(|p| p.len() >= rel.len() && p[..rel.len()] == *rel)
    }

    /// Was `name` named explicitly as a top-level inline path?
    /// (`*` does not cover the registry's capabilities/model/modelsource
    /// documents.)
    pub fn explicitly(&self, name: &str) -> bool {
        self.paths.iter().any(|p| p.len() == 1 && p[0] == name)
    }

    /// Are there any selections at all?
    pub fn is_empty(&self) -> bool {
        !self.all && self.paths.is_empty()
    }
}

/// One filter comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterOp {
    /// `path=value`, wildcard `*` allowed in the value.
    Eq,
    /// `path!=value`.
    Ne,
    /// Bare `path`: the attribute must be present.
    Present,
    /// `path=null`: the attribute must be absent.
    Absent,
}

/// One term of a filter expression: a dot-path ending in an attribute
/// test. Leading segments that name collections navigate the hierarchy;
/// the remainder addresses an attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterTerm {
    /// All dot-separated segments of the left-hand side.
    pub path: Vec<String>,
    /// Comparison operator.
    pub op: FilterOp,
    /// Right-hand side for Eq/Ne.
    pub value: String,
}

/// One filter expression: a conjunction of terms evaluated against a
/// single candidate entity chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterExpr {
    /// AND-ed terms.
    pub terms: Vec<FilterTerm>,
}

impl FilterExpr {
    /// Parse one `filter=` parameter value: comma-joined terms.
    pub fn parse(raw: &str) -> Result<FilterExpr> {
        let mut terms = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            terms.push(parse_term(part)?);
        }
        if terms.is_empty() {
            return Err(RegistryError::bad_request(format!(
                "empty filter expression: '{raw}'"
            )));
        }
        Ok(FilterExpr { terms })
    }
}

fn parse_term(part: &str) -> Result<FilterTerm> {
    let (lhs, op, value) = if let Some(idx) = part.find("!=") {
        (&part[..idx], FilterOp::Ne, part[idx + 2..].to_string())
    } else if let Some(idx) = part.find('=') {
        let value = part[idx + 1..].to_string();
        if value == "null" {
            (&part[..idx], FilterOp::Absent, String::new())
        } else {
            (&part[..idx], FilterOp::Eq, value)
        }
    } else {
        (part, FilterOp::Present, String::new())
    };
    if lhs.is_empty() {
        return Err(RegistryError::bad_request(format!(
            "malformed filter term: '{part}'"
        )));
    }
    Ok(FilterTerm {
        path: lhs.split('.').map(str::to_string).collect(),
        op,
        value,
    })
}

/// Sort specification: attribute path plus direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortSpec {
    /// Attribute path relative to each collection entry.
    pub attr: String,
    /// `=desc` reverses the order.
    pub descending: bool,
}

impl SortSpec {
    /// Parse `attr[=asc|desc]`.
    pub fn parse(raw: &str) -> Result<SortSpec> {
        let (attr, dir) = match raw.split_once('=') {
            Some((a, d)) => (a, d),
            None => (raw, "asc"),
        };
        if attr.is_empty() {
            return Err(RegistryError::bad_request("empty sort attribute"));
        }
        let descending = match dir {
            "asc" => false,
            "desc" => true,
            other => {
                return Err(RegistryError::bad_request(format!(
                    "sort direction must be 'asc' or 'desc', got '{other}'"
                )))
            }
        };
        Ok(SortSpec {
            attr: attr.to_string(),
            descending,
        })
    }
}

/// Structured read-side options, one per request.
#[derive(Clone, Debug, Default)]
pub struct ReadOptions {
    /// Inline selections.
    pub inline: InlineSet,
    /// Disjunction of filter expressions.
    pub filters: Vec<FilterExpr>,
    /// Sort specification (collection reads only).
    pub sort: Option<SortSpec>,
    /// Doc mode: rewrite in-subtree URLs to `#/...` fragments.
    pub doc: bool,
    /// Render document content as base64 regardless of its type.
    pub binary: bool,
    /// Absolute URL prefix for non-relative URLs.
    pub base_url: String,
}
