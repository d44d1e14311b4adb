//! Xref resolver: lets one resource transparently mirror another's
//! versions while parking enough hidden state to reverse the operation
//! exactly.
//!
//! State machine per resource: OWNING (no `xref`; versions stored under
//! the resource itself) and MIRRORING (`xref` set; version data read
//! through to the target). Transitions park/restore the private
//! `#createdat` / `#epoch` / `#nextversionid` properties.
#![forbid(unsafe_code)]

use tracing::debug;

use crate::commit::{
    apply_default_directive, upsert_version, DefaultDirective, ResourceCtx, WriteOp,
};
use crate::entity::Entity;
use crate::error::{RegistryError, Result};
use crate::model::{GroupModel, RegistryModel};
use crate::path::resource_path;
use crate::value::PropValue;

/// A validated xref target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XrefTarget {
    /// Target group type (plural).
    pub gplural: String,
    /// Target group id.
    pub gid: String,
    /// Target resource type (plural).
    pub rplural: String,
    /// Target resource id.
    pub rid: String,
}

impl XrefTarget {
    /// Entity path of the target resource.
    pub fn path(&self) -> String {
        resource_path(&self.gplural, &self.gid, &self.rplural, &self.rid)
    }
}

/// Meta attributes that remain meaningful while a resource mirrors another.
/// Anything else in a meta body alongside `xref` is an
/// `extra_xref_attribute`.
const XREF_COMPATIBLE_ATTRS: &[&str] = &[
    "xref",
    "epoch",
    "self",
    "xid",
    "createdat",
    "readonly",
    "compatibility",
    "compatibilityauthority",
    "deprecated",
];

/// Validate an xref value's path shape and type compatibility.
pub fn parse_target(
    model: &RegistryModel,
    source_group: &GroupModel,
    source_rplural: &str,
    xref: &str,
) -> Result<XrefTarget> {
    let malformed = |reason: &str| RegistryError::MalformedXref {
        xref: xref.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = xref
        .strip_prefix('/')
        .ok_or_else(|| malformed("must start with '/'"))?;
    let segments: Vec<&str> = trimmed.split('/').collect();
    let [gplural, gid, rplural, rid] = segments.as_slice() else {
        return Err(malformed("expected exactly four path segments"));
    };
    if gplural.is_empty() || gid.is_empty() || rplural.is_empty() || rid.is_empty() {
        return Err(malformed("path segments must not be empty"));
    }
    if model.group(gplural).is_none() {
        return Err(malformed(&format!("unknown group type \"{gplural}\"")));
    }
    if model.resource(gplural, rplural).is_none() {
        return Err(malformed(&format!(
            "unknown resource type \"{gplural}/{rplural}\""
        )));
    }
    if !source_group.may_xref(source_rplural, gplural, rplural) {
        return Err(malformed(&format!(
            "resource type \"{rplural}\" is not importable into \"{}\"",
            source_group.plural
        )));
    }
    Ok(XrefTarget {
        gplural: gplural.to_string(),
        gid: gid.to_string(),
        rplural: rplural.to_string(),
        rid: rid.to_string(),
    })
}

/// Reject meta body attributes that only make sense for owned versions.
pub fn check_extra_attrs(
    ctx: &ResourceCtx<'_>,
    body: &serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    let id_attr = ctx.rmodel.id_attr();
    for key in body.keys() {
        let allowed = key == &id_attr || XREF_COMPATIBLE_ATTRS.contains(&key.as_str());
        if !allowed {
            return Err(RegistryError::ExtraXrefAttribute {
                attr: key.clone(),
                xid: crate::path::xid_of(&ctx.path),
            });
        }
    }
    Ok(())
}

/// The stored xref target path of a mirroring meta, if any.
pub fn target_path_of(meta: &Entity) -> Option<String> {
    meta.string("xref")
        .map(|x| x.trim_start_matches('/').to_string())
}

/// OWNING → MIRRORING (or MIRRORING → MIRRORING retarget).
///
/// Parks the pre-xref identity exactly once — a retarget keeps the parked
/// state from the original owning period — then drops the owned versions
/// and the owned-version meta attributes.
pub fn set_xref(
    op: &WriteOp<'_>,
    ctx: &ResourceCtx<'_>,
    meta: &mut Entity,
    target: &XrefTarget,
) -> Result<()> {
    let already_mirroring = meta.leaf("xref").is_some();
    if !already_mirroring {
        if let Some(createdat) = meta.string("createdat").map(str::to_string) {
            meta.set_save(op.tx, "#createdat", PropValue::Timestamp(createdat))?;
        }
        meta.set_save(op.tx, "#epoch", PropValue::UInt(meta.epoch()))?;
        // #nextversionid stays in place: the counter survives the cycle.
    }
    op.tx.remove_tree(&format!("{}/versions", ctx.path))?;
    meta.delete_save(op.tx, "defaultversionid")?;
    meta.delete_save(op.tx, "defaultversionsticky")?;
    meta.set_save(op.tx, "xref", PropValue::String(format!("/{}", target.path())))?;
    op.bump(meta)?;
    debug!(path = %ctx.path, target = %target.path(), "resource now mirroring");
    Ok(())
}

/// MIRRORING → OWNING.
///
/// With no replacement versions the parked identity restores verbatim:
/// `createdat` returns to its pre-xref value, `modifiedat` advances, and
/// the epoch becomes `max(parked, mirroring) + 1`. Replacement versions
/// supplied in the same request are created instead of the default
/// placeholder version.
pub fn clear_xref(
    op: &WriteOp<'_>,
    ctx: &ResourceCtx<'_>,
    meta: &mut Entity,
    replacement_versions: Option<&serde_json::Map<String, serde_json::Value>>,
    directive: &DefaultDirective,
) -> Result<bool> {
    if meta.leaf("xref").is_none() {
        return Ok(false);
    }
    meta.delete_save(op.tx, "xref")?;

    let parked_epoch = meta.uint("#epoch").unwrap_or(0);
    let mirroring_epoch = meta.epoch();
    if let Some(parked) = meta.string("#createdat").map(str::to_string) {
        meta.set_save(op.tx, "createdat", PropValue::Timestamp(parked))?;
    }
    op.restamp(meta, parked_epoch.max(mirroring_epoch) + 1)?;
    meta.delete_save(op.tx, "#createdat")?;
    meta.delete_save(op.tx, "#epoch")?;

    match replacement_versions {
        Some(versions) if !versions.is_empty() => {
            for (vid, vbody) in versions {
                upsert_version(op, ctx, meta, Some(vid), vbody, false)?;
            }
        }
        _ => {
            // The versions were dropped when mirroring began; owning again
            // means owning at least one version.
            upsert_version(op, ctx, meta, None, &serde_json::Value::Null, false)?;
        }
    }
    apply_default_directive(op, ctx, meta, directive)?;
    debug!(path = %ctx.path, "resource owning its versions again");
    Ok(true)
}
