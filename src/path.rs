//! Entity paths, external ids, and attribute paths.
//!
//! Entities live at slash-separated paths below the registry root (the root
//! itself is the empty path). An entity's `xid` is its path with a leading
//! slash. Attribute paths address into nested attribute values
//! (`"deprecated.effective"`, `"strs[0]"`) and double as the flattened
//! property-row names in the store.
#![forbid(unsafe_code)]

use std::fmt;

use crate::error::{RegistryError, Result};

/// Discriminates the level an entity occupies in the containment tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    /// The root singleton.
    Registry,
    /// A group instance.
    Group,
    /// A resource instance.
    Resource,
    /// A resource's meta singleton.
    Meta,
    /// A version of a resource.
    Version,
}

impl EntityKind {
    /// Storage discriminant.
    pub fn as_i64(self) -> i64 {
        match self {
            EntityKind::Registry => 0,
            EntityKind::Group => 1,
            EntityKind::Resource => 2,
            EntityKind::Meta => 3,
            EntityKind::Version => 4,
        }
    }

    /// Decode a storage discriminant.
    pub fn from_i64(v: i64) -> Result<Self> {
        Ok(match v {
            0 => EntityKind::Registry,
            1 => EntityKind::Group,
            2 => EntityKind::Resource,
            3 => EntityKind::Meta,
            4 => EntityKind::Version,
            other => {
                return Err(RegistryError::Storage(format!(
                    "unknown entity kind discriminant {other}"
                )))
            }
        })
    }
}

/// Build a group instance path.
pub fn group_path(gplural: &str, gid: &str) -> String {
    format!("{gplural}/{gid}")
}

/// Build a resource instance path.
pub fn resource_path(gplural: &str, gid: &str, rplural: &str, rid: &str) -> String {
    format!("{gplural}/{gid}/{rplural}/{rid}")
}

/// Build a resource's meta path.
pub fn meta_path(resource: &str) -> String {
    format!("{resource}/meta")
}

/// Build a resource's versions collection path.
pub fn versions_path(resource: &str) -> String {
    format!("{resource}/versions")
}

/// Build a version instance path.
pub fn version_path(resource: &str, vid: &str) -> String {
    format!("{resource}/versions/{vid}")
}

/// External id for a path: the path with a leading slash (`/` for the root).
pub fn xid_of(path: &str) -> String {
    format!("/{path}")
}

/// Validate an entity id (group, resource, or version id).
///
/// Ids start with an alphanumeric or underscore and continue with the same
/// plus `-`, `.`, `~`, `@`; at most 128 characters.
pub fn validate_id(id: &str) -> Result<()> {
    let mut chars = id.chars();
    let ok_first = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric() || c == '_')
        .unwrap_or(false);
    let ok_rest = id
        .chars()
        .skip(1)
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '~' | '@'));
    if !ok_first || !ok_rest || id.len() > 128 {
        return Err(RegistryError::bad_request(format!("invalid id: '{id}'")));
    }
    Ok(())
}

/// Validate an attribute or map-key name as it appears in one path segment.
///
/// Dots and brackets are path syntax, so they are excluded here; everything
/// else mirrors the id charset.
pub fn validate_attr_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '~' | '@'));
    if !ok {
        return Err(RegistryError::bad_request(format!(
            "invalid attribute name: '{name}'"
        )));
    }
    Ok(())
}

/// One step of an attribute path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrSeg {
    /// Object member or map entry.
    Key(String),
    /// Array element.
    Index(usize),
}

/// A parsed attribute path, e.g. `labels.env` or `strs[0]`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AttrPath {
    segs: Vec<AttrSeg>,
}

impl AttrPath {
    /// Parse a dotted/indexed attribute path.
    pub fn parse(text: &str) -> Result<AttrPath> {
        let mut segs = Vec::new();
        for part in text.split('.') {
            if part.is_empty() {
                return Err(RegistryError::bad_request(format!(
                    "malformed attribute path: '{text}'"
                )));
            }
            let mut rest = part;
            // Leading key, then zero or more [i] suffixes.
            if let Some(open) = rest.find('[') {
                let (key, indexes) = rest.split_at(open);
                if !key.is_empty() {
                    segs.push(AttrSeg::Key(key.to_string()));
                }
                rest = indexes;
                while let Some(stripped) = rest.strip_prefix('[') {
                    let close = stripped.find(']').ok_or_else(|| {
                        RegistryError::bad_request(format!("malformed attribute path: '{text}'"))
                    })?;
                    let idx: usize = stripped[..close].parse().map_err(|_| {
                        RegistryError::bad_request(format!("malformed attribute path: '{text}'"))
                    })?;
                    segs.push(AttrSeg::Index(idx));
                    rest = &stripped[close + 1..];
                }
                if !rest.is_empty() {
                    return Err(RegistryError::bad_request(format!(
                        "malformed attribute path: '{text}'"
                    )));
                }
            } else {
                segs.push(AttrSeg::Key(rest.to_string()));
            }
        }
        if segs.is_empty() {
            return Err(RegistryError::bad_request(format!(
                "malformed attribute path: '{text}'"
            )));
        }
        Ok(AttrPath { segs })
    }

    /// The path's segments.
    pub fn segments(&self) -> &[AttrSeg] {
        &self.segs
    }

    /// First segment's key, if the path starts with one.
    pub fn root_key(&self) -> Option<&str> {
        match self.segs.first() {
            Some(AttrSeg::Key(k)) => Some(k.as_str()),
            _ => None,
        }
    }

    /// Append a key segment.
    pub fn push_key(&mut self, key: &str) {
        self.segs.push(AttrSeg::Key(key.to_string()));
    }

    /// Append an index segment.
    pub fn push_index(&mut self, idx: usize) {
        self.segs.push(AttrSeg::Index(idx));
    }
}

impl fmt::Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in &self.segs {
            match seg {
                AttrSeg::Key(k) => {
                    if !first {
                        write!(f, ".")?;
                    }
                    write!(f, "{k}")?;
                }
                AttrSeg::Index(i) => write!(f, "[{i}]")?,
            }
            first = false;
        }
        Ok(())
    }
}

/// Does flattened property name `name` lie at or under attribute path
/// `prefix` (rendered flat)?
pub fn flat_name_matches(name: &str, prefix: &str) -> bool {
    name == prefix
        || name
            .strip_prefix(prefix)
            .map(|rest| rest.starts_with('.') || rest.starts_with('['))
            .unwrap_or(false)
}
