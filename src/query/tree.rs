//! Subtree materialization for reads.
//!
//! A read request first materializes the addressed subtree into
//! [`TreeNode`]s — resolving xref read-through as it goes — and then hands
//! the tree to the filter/sort/serialize passes. Mirrored versions carry a
//! `display_path` rooted at the mirroring resource, so URLs always stay in
//! the caller's address space.

use tracing::trace;

use crate::entity::Entity;
use crate::error::Result;
use crate::model::{GroupModel, RegistryModel, ResourceModel};
use crate::path::{meta_path, EntityKind};
use crate::store::Tx;
use crate::value::PropValue;
use crate::xref::target_path_of;

/// Level-specific node data.
#[derive(Clone, Debug)]
pub enum NodeKind<'m> {
    /// The registry root.
    Registry,
    /// A group instance.
    Group {
        /// Its group type.
        gmodel: &'m GroupModel,
    },
    /// A resource instance.
    Resource {
        /// Containing group type.
        gmodel: &'m GroupModel,
        /// Its resource type.
        rmodel: &'m ResourceModel,
    },
    /// A resource's meta singleton.
    Meta {
        /// The resource type.
        rmodel: &'m ResourceModel,
    },
    /// One version.
    Version {
        /// The resource type (the mirroring side's type for read-through).
        rmodel: &'m ResourceModel,
    },
}

/// One materialized node.
#[derive(Clone, Debug)]
pub struct TreeNode<'m> {
    /// Entity id at this level (`""` for the registry root).
    pub id: String,
    /// Path used for URLs; differs from `entity.path` for mirrored
    /// versions.
    pub display_path: String,
    /// The materialized entity (props may be adjusted for read-through).
    pub entity: Entity,
    /// Level-specific data.
    pub kind: NodeKind<'m>,
    /// Child collections, name → ordered members.
    pub collections: Vec<(String, Vec<TreeNode<'m>>)>,
    /// Meta singleton (resources only).
    pub meta: Option<Box<TreeNode<'m>>>,
    /// Effective default versionid (resources only).
    pub default_vid: Option<String>,
    /// Stored xref value (resources only, while mirroring).
    pub xref: Option<String>,
}

impl<'m> TreeNode<'m> {
    /// Find a child in a named collection.
    pub fn child(&self, collection: &str, id: &str) -> Option<&TreeNode<'m>> {
        self.collections
            .iter()
            .find(|(name, _)| name == collection)
            .and_then(|(_, members)| members.iter().find(|m| m.id == id))
    }

    /// Members of a named collection.
    pub fn collection(&self, name: &str) -> Option<&Vec<TreeNode<'m>>> {
        self.collections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, members)| members)
    }
}

/// Materialize the whole registry subtree.
pub fn materialize_registry<'m>(tx: &Tx<'_>, model: &'m RegistryModel) -> Result<TreeNode<'m>> {
    let entity = Entity::require(tx, "", EntityKind::Registry)?;
    let mut collections = Vec::new();
    for (plural, gmodel) in &model.groups {
        let mut members = Vec::new();
        for gpath in tx.children(&format!("{plural}/"), EntityKind::Group)? {
            members.push(materialize_group(tx, model, gmodel, &gpath)?);
        }
        collections.push((plural.clone(), members));
    }
    Ok(TreeNode {
        id: String::new(),
        display_path: String::new(),
        entity,
        kind: NodeKind::Registry,
        collections,
        meta: None,
        default_vid: None,
        xref: None,
    })
}

/// Materialize one group and its resource collections.
pub fn materialize_group<'m>(
    tx: &Tx<'_>,
    model: &'m RegistryModel,
    gmodel: &'m GroupModel,
    gpath: &str,
) -> Result<TreeNode<'m>> {
    let entity = Entity::require(tx, gpath, EntityKind::Group)?;
    let gid = gpath.rsplit('/').next().unwrap_or_default().to_string();
    let mut collections = Vec::new();
    for (rplural, rmodel) in &gmodel.resources {
        let mut members = Vec::new();
        for rpath in tx.children(&format!("{gpath}/{rplural}/"), EntityKind::Resource)? {
            members.push(materialize_resource(tx, model, gmodel, rmodel, &rpath)?);
        }
        collections.push((rplural.clone(), members));
    }
    Ok(TreeNode {
        id: gid,
        display_path: gpath.to_string(),
        entity,
        kind: NodeKind::Group { gmodel },
        collections,
        meta: None,
        default_vid: None,
        xref: None,
    })
}

/// Materialize one resource: meta, versions, and — when mirroring — the
/// target's version data re-rooted under this resource's paths.
pub fn materialize_resource<'m>(
    tx: &Tx<'_>,
    model: &'m RegistryModel,
    gmodel: &'m GroupModel,
    rmodel: &'m ResourceModel,
    rpath: &str,
) -> Result<TreeNode<'m>> {
    let entity = Entity::require(tx, rpath, EntityKind::Resource)?;
    let rid = rpath.rsplit('/').next().unwrap_or_default().to_string();
    let mut meta_entity = Entity::require(tx, &meta_path(rpath), EntityKind::Meta)?;
    let xref = meta_entity.string("xref").map(str::to_string);

    let mut versions = Vec::new();
    let mut default_vid = meta_entity.string("defaultversionid").map(str::to_string);

    if let Some(target_path) = target_path_of(&meta_entity) {
        default_vid = None;
        if let Some(target_meta) = Entity::find(tx, &meta_path(&target_path), EntityKind::Meta)? {
            // One hop only: a target that itself mirrors serves nothing.
            if target_meta.leaf("xref").is_none() {
                let target_rmodel = resource_model_for_path(model, &target_path);
                for vpath in
                    tx.children(&format!("{target_path}/versions/"), EntityKind::Version)?
                {
                    let vid = vpath.rsplit('/').next().unwrap_or_default().to_string();
                    let mut ventity = Entity::require(tx, &vpath, EntityKind::Version)?;
                    if let Some(target_rmodel) = target_rmodel {
                        rebrand_version(&mut ventity, target_rmodel, rmodel, &rid);
                    }
                    versions.push(TreeNode {
                        id: vid.clone(),
                        display_path: format!("{rpath}/versions/{vid}"),
                        entity: ventity,
                        kind: NodeKind::Version { rmodel },
                        collections: Vec::new(),
                        meta: None,
                        default_vid: None,
                        xref: None,
                    });
                }
                // The default-version pointer reads through to the target.
                default_vid = target_meta.string("defaultversionid").map(str::to_string);
                copy_prop(&target_meta, &mut meta_entity, "defaultversionid");
                copy_prop(&target_meta, &mut meta_entity, "defaultversionsticky");
            } else {
                trace!(path = rpath, "xref target is itself mirroring; serving no versions");
            }
        }
    } else {
        for vpath in tx.children(&format!("{rpath}/versions/"), EntityKind::Version)? {
            let vid = vpath.rsplit('/').next().unwrap_or_default().to_string();
            versions.push(TreeNode {
                id: vid.clone(),
                display_path: vpath.clone(),
                entity: Entity::require(tx, &vpath, EntityKind::Version)?,
                kind: NodeKind::Version { rmodel },
                collections: Vec::new(),
                meta: None,
                default_vid: None,
                xref: None,
            });
        }
    }

    let meta_node = TreeNode {
        id: "meta".to_string(),
        display_path: meta_path(rpath),
        entity: meta_entity,
        kind: NodeKind::Meta { rmodel },
        collections: Vec::new(),
        meta: None,
        default_vid: None,
        xref: None,
    };

    Ok(TreeNode {
        id: rid,
        display_path: rpath.to_string(),
        entity,
        kind: NodeKind::Resource { gmodel, rmodel },
        collections: vec![("versions".to_string(), versions)],
        meta: Some(Box::new(meta_node)),
        default_vid,
        xref,
    })
}

fn resource_model_for_path<'m>(
    model: &'m RegistryModel,
    rpath: &str,
) -> Option<&'m ResourceModel> {
    let segments: Vec<&str> = rpath.split('/').collect();
    if segments.len() < 4 {
        return None;
    }
    model.resource(segments[0], segments[2])
}

/// A mirrored version is served under the mirroring resource's type: its
/// type-specific attribute names are rewritten from the target's singular
/// to the source's.
fn rebrand_version(entity: &mut Entity, from: &ResourceModel, to: &ResourceModel, rid: &str) {
    if from.singular == to.singular {
        entity
            .props
            .insert(to.id_attr(), PropValue::String(rid.to_string()));
        return;
    }
    let renames = [
        (from.id_attr(), to.id_attr()),
        (format!("{}url", from.singular), format!("{}url", to.singular)),
        (
            format!("{}proxyurl", from.singular),
            format!("{}proxyurl", to.singular),
        ),
    ];
    for (old, new) in renames {
        if let Some(value) = entity.props.remove(&old) {
            entity.props.insert(new, value);
        }
    }
    entity
        .props
        .insert(to.id_attr(), PropValue::String(rid.to_string()));
}

fn copy_prop(from: &Entity, to: &mut Entity, name: &str) {
    match from.leaf(name) {
        Some(value) => {
            to.props.insert(name.to_string(), value.clone());
        }
        None => {
            to.props.remove(name);
        }
    }
}
