//! Entity layer: typed, path-addressed wrappers over the property store.
//!
//! An [`Entity`] is the in-memory materialization of one store row-set:
//! its path, surrogate id, level, and flattened property map (private
//! `#`-prefixed bookkeeping included). Mutations write through to the
//! store and the in-memory copy in one step; [`Entity::refresh`] re-reads
//! the store, discarding staleness after concurrent external writes.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::error::{RegistryError, Result};
use crate::path::{flat_name_matches, xid_of, AttrPath, AttrSeg, EntityKind};
use crate::store::Tx;
use crate::value::PropValue;

/// One materialized entity.
#[derive(Clone, Debug)]
pub struct Entity {
    /// Slash-separated path from the registry root (`""` for the root).
    pub path: String,
    /// Surrogate id in the store.
    pub sid: String,
    /// Level in the containment tree.
    pub kind: EntityKind,
    /// Flattened property map, name → typed value.
    pub props: BTreeMap<String, PropValue>,
}

impl Entity {
    /// Load the entity at `path`, if it exists.
    pub fn find(tx: &Tx<'_>, path: &str, kind: EntityKind) -> Result<Option<Entity>> {
        let Some(sid) = tx.entity_sid(path)? else {
            return Ok(None);
        };
        Ok(Some(Entity {
            path: path.to_string(),
            sid,
            kind,
            props: tx.load_props(path)?,
        }))
    }

    /// Load the entity at `path` or fail with `not_found`.
    pub fn require(tx: &Tx<'_>, path: &str, kind: EntityKind) -> Result<Entity> {
        Entity::find(tx, path, kind)?.ok_or_else(|| RegistryError::not_found(xid_of(path)))
    }

    /// Register (or re-open) the entity at `path`.
    pub fn create(tx: &Tx<'_>, path: &str, kind: EntityKind) -> Result<Entity> {
        let sid = tx.register(path, kind)?;
        Ok(Entity {
            path: path.to_string(),
            sid,
            kind,
            props: tx.load_props(path)?,
        })
    }

    /// Re-read every property from the store.
    pub fn refresh(&mut self, tx: &Tx<'_>) -> Result<()> {
        self.props = tx.load_props(&self.path)?;
        Ok(())
    }

    /// External id: the path with a leading slash.
    pub fn xid(&self) -> String {
        xid_of(&self.path)
    }

    /// Exact-leaf read.
    pub fn leaf(&self, flat: &str) -> Option<&PropValue> {
        self.props.get(flat)
    }

    /// String view of an exact leaf.
    pub fn string(&self, flat: &str) -> Option<&str> {
        match self.props.get(flat) {
            Some(PropValue::String(s)) | Some(PropValue::Timestamp(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Unsigned-integer view of an exact leaf.
    pub fn uint(&self, flat: &str) -> Option<u64> {
        match self.props.get(flat) {
            Some(PropValue::UInt(u)) => Some(*u),
            Some(PropValue::Int(i)) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    /// Boolean view of an exact leaf.
    pub fn bool(&self, flat: &str) -> Option<bool> {
        match self.props.get(flat) {
            Some(PropValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Current epoch; 0 for an entity that has never been stamped.
    pub fn epoch(&self) -> u64 {
        self.uint("epoch").unwrap_or(0)
    }

    /// Reconstruct the (possibly nested) attribute value rooted at
    /// `attr_path`, e.g. `"labels"`, `"obj.epoch"`, or `"strs[0]"`.
    pub fn get_attr(&self, attr_path: &str) -> Option<serde_json::Value> {
        let flat = attr_path;
        let mut matches: Vec<(&str, &PropValue)> = self
            .props
            .iter()
            .filter(|(name, _)| flat_name_matches(name, flat))
            .map(|(name, value)| (name.as_str(), value))
            .collect();
        if matches.is_empty() {
            return None;
        }
        if matches.len() == 1 && matches[0].0 == flat {
            return Some(matches[0].1.to_json());
        }
        // Nested: strip the prefix and unflatten the remainder.
        let rebased: Vec<(String, PropValue)> = matches
            .drain(..)
            .map(|(name, value)| {
                let rest = name[flat.len()..].trim_start_matches('.').to_string();
                (rest, value.clone())
            })
            .collect();
        Some(unflatten(rebased.iter().map(|(n, v)| (n.as_str(), v))))
    }

    /// Write one leaf, replacing anything stored at or under its path.
    pub fn set_save(&mut self, tx: &Tx<'_>, flat: &str, value: PropValue) -> Result<()> {
        tx.delete_props_under(&self.path, flat)?;
        tx.set(&self.path, flat, &value)?;
        self.props.retain(|name, _| !flat_name_matches(name, flat));
        self.props.insert(flat.to_string(), value);
        Ok(())
    }

    /// Replace the attribute subtree rooted at `flat` with the given
    /// flattened leaves.
    pub fn set_tree_save(
        &mut self,
        tx: &Tx<'_>,
        flat: &str,
        leaves: Vec<(String, PropValue)>,
    ) -> Result<()> {
        tx.delete_props_under(&self.path, flat)?;
        self.props.retain(|name, _| !flat_name_matches(name, flat));
        for (name, value) in leaves {
            tx.set(&self.path, &name, &value)?;
            self.props.insert(name, value);
        }
        Ok(())
    }

    /// Delete the attribute subtree rooted at `flat`.
    pub fn delete_save(&mut self, tx: &Tx<'_>, flat: &str) -> Result<()> {
        tx.delete_props_under(&self.path, flat)?;
        self.props.retain(|name, _| !flat_name_matches(name, flat));
        Ok(())
    }

    /// Root names of every public (non-`#`) attribute currently stored.
    pub fn public_roots(&self) -> Vec<String> {
        let mut roots = Vec::new();
        for name in self.props.keys() {
            if name.starts_with('#') {
                continue;
            }
            let root = root_of(name);
            if roots.last().map(|r| r == &root).unwrap_or(false) {
                continue;
            }
            roots.push(root);
        }
        roots
    }

    /// Nested JSON of all public properties (no defined ordering; the
    /// serializer imposes one).
    pub fn materialize(&self) -> serde_json::Value {
        unflatten(
            self.props
                .iter()
                .filter(|(name, _)| !name.starts_with('#'))
                .map(|(name, value)| (name.as_str(), value)),
        )
    }
}

fn root_of(flat: &str) -> String {
    let end = flat
        .find(['.', '['])
        .unwrap_or(flat.len());
    flat[..end].to_string()
}

enum Node {
    Leaf(PropValue),
    Obj(BTreeMap<String, Node>),
    Arr(BTreeMap<usize, Node>),
}

/// Rebuild nested JSON from flattened `(name, value)` leaves.
pub fn unflatten<'a>(leaves: impl Iterator<Item = (&'a str, &'a PropValue)>) -> serde_json::Value {
    let mut root = Node::Obj(BTreeMap::new());
    for (name, value) in leaves {
        if name.is_empty() {
            // The caller rebased onto a leaf itself.
            return value.to_json();
        }
        let Ok(path) = AttrPath::parse(name) else {
            continue;
        };
        insert(&mut root, path.segments(), value);
    }
    render(&root)
}

fn insert(node: &mut Node, segs: &[AttrSeg], value: &PropValue) {
    let Some((head, rest)) = segs.split_first() else {
        *node = Node::Leaf(value.clone());
        return;
    };
    match head {
        AttrSeg::Key(key) => {
            if !matches!(node, Node::Obj(_)) {
                *node = Node::Obj(BTreeMap::new());
            }
            if let Node::Obj(map) = node {
                let child = map
                    .entry(key.clone())
                    .or_insert_with(|| Node::Obj(BTreeMap::new()));
                insert(child, rest, value);
            }
        }
        AttrSeg::Index(idx) => {
            if !matches!(node, Node::Arr(_)) {
                *node = Node::Arr(BTreeMap::new());
            }
            if let Node::Arr(map) = node {
                let child = map
                    .entry(*idx)
                    .or_insert_with(|| Node::Obj(BTreeMap::new()));
                insert(child, rest, value);
            }
        }
    }
}

fn render(node: &Node) -> serde_json::Value {
    match node {
        Node::Leaf(value) => value.to_json(),
        Node::Obj(map) => {
            let mut out = serde_json::Map::new();
            for (key, child) in map {
                out.insert(key.clone(), render(child));
            }
            serde_json::Value::Object(out)
        }
        Node::Arr(map) => serde_json::Value::Array(map.values().map(render).collect()),
    }
}
