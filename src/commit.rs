//! Version & concurrency controller.
//!
//! Everything that mutates an entity funnels through a [`WriteOp`]: one
//! per write request, carrying the request timestamp and the set of
//! entities already stamped, so that within a single transaction each
//! touched entity's epoch moves by exactly 1 and ancestors (group,
//! registry) are bumped exactly once.
#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::BTreeSet;

use tracing::debug;

use crate::entity::Entity;
use crate::error::{RegistryError, Result};
use crate::model::{flatten_value, Attribute, GroupModel, ResourceModel};
use crate::path::{group_path, meta_path, validate_id, version_path, xid_of, EntityKind};
use crate::store::Tx;
use crate::value::{compare_ci, now_timestamp, PropValue};

use std::collections::BTreeMap;

/// What the request asked to happen to the default-version pointer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DefaultDirective {
    /// Leave the pointer discipline as it is.
    Unchanged,
    /// Pin the default to this versionid (sticky).
    Pin(String),
    /// Clear the pin; the default floats to the newest version.
    Unpin,
}

/// Per-request mutation context.
pub struct WriteOp<'a> {
    /// The ambient write transaction.
    pub tx: &'a Tx<'a>,
    /// Request timestamp shared by every entity this request touches.
    pub now: String,
    stamped: RefCell<BTreeSet<String>>,
}

impl<'a> WriteOp<'a> {
    /// Start a mutation context on an open write transaction.
    pub fn new(tx: &'a Tx<'a>) -> Result<WriteOp<'a>> {
        Ok(WriteOp {
            tx,
            now: now_timestamp()?,
            stamped: RefCell::new(BTreeSet::new()),
        })
    }

    /// Enforce the optimistic-concurrency token: a supplied epoch must
    /// equal the stored one.
    pub fn check_epoch(&self, entity: &Entity, supplied: Option<u64>) -> Result<()> {
        let Some(supplied) = supplied else {
            return Ok(());
        };
        let current = entity.epoch();
        if supplied != current {
            return Err(RegistryError::MismatchedEpoch {
                xid: entity.xid(),
                supplied,
                current,
            });
        }
        Ok(())
    }

    /// First stamp for a newly created entity: epoch 1, both timestamps
    /// set to the request time.
    pub fn stamp_created(&self, entity: &mut Entity) -> Result<()> {
        entity.set_save(self.tx, "epoch", PropValue::UInt(1))?;
        if entity.leaf("createdat").is_none() {
            entity.set_save(self.tx, "createdat", PropValue::Timestamp(self.now.clone()))?;
        }
        entity.set_save(self.tx, "modifiedat", PropValue::Timestamp(self.now.clone()))?;
        self.stamped.borrow_mut().insert(entity.path.clone());
        Ok(())
    }

    /// Bump an entity after mutating it: epoch +1, `modifiedat` = now.
    /// Idempotent within one request.
    pub fn bump(&self, entity: &mut Entity) -> Result<()> {
        if !self.stamped.borrow_mut().insert(entity.path.clone()) {
            return Ok(());
        }
        let next = entity.epoch() + 1;
        entity.set_save(self.tx, "epoch", PropValue::UInt(next))?;
        entity.set_save(self.tx, "modifiedat", PropValue::Timestamp(self.now.clone()))?;
        debug!(path = %entity.path, epoch = next, "entity bumped");
        Ok(())
    }

    /// Force an entity's epoch to an explicit value (xref restoration),
    /// counting as this request's stamp.
    pub fn restamp(&self, entity: &mut Entity, epoch: u64) -> Result<()> {
        entity.set_save(self.tx, "epoch", PropValue::UInt(epoch))?;
        entity.set_save(self.tx, "modifiedat", PropValue::Timestamp(self.now.clone()))?;
        self.stamped.borrow_mut().insert(entity.path.clone());
        Ok(())
    }

    /// A descendant of `leaf_path` mutated: bump the containing group and
    /// the registry root, each at most once per request.
    pub fn bump_ancestors(&self, leaf_path: &str) -> Result<()> {
        let segments: Vec<&str> = leaf_path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() >= 2 {
            let gpath = group_path(segments[0], segments[1]);
            if gpath != leaf_path {
                if let Some(mut group) = Entity::find(self.tx, &gpath, EntityKind::Group)? {
                    self.bump(&mut group)?;
                }
            }
        }
        if !leaf_path.is_empty() {
            let mut root = Entity::require(self.tx, "", EntityKind::Registry)?;
            self.bump(&mut root)?;
        }
        Ok(())
    }
}

/// Resolve `epoch` out of a body object (it is checked, never stored
/// verbatim).
pub fn take_epoch(body: &mut serde_json::Map<String, serde_json::Value>) -> Result<Option<u64>> {
    match body.remove("epoch") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| RegistryError::bad_request(format!("\"epoch\" must be a uinteger: {value}"))),
    }
}

/// Validate an id echoed in a body against the path-derived id and drop it.
pub fn take_id(
    body: &mut serde_json::Map<String, serde_json::Value>,
    attr: &str,
    expected: &str,
) -> Result<()> {
    match body.remove(attr) {
        None | Some(serde_json::Value::Null) => Ok(()),
        Some(serde_json::Value::String(supplied)) if supplied == expected => Ok(()),
        Some(supplied) => Err(RegistryError::MismatchedId {
            attr: attr.to_string(),
            expected: expected.to_string(),
            supplied: supplied.as_str().map(str::to_string).unwrap_or_else(|| supplied.to_string()),
        }),
    }
}

/// Apply the attribute portion of a body to an entity.
///
/// `handled` names keys the caller consumed elsewhere (ids, epoch,
/// collections, content forms). With `patch == false` the mutable
/// attribute set is replaced: stored public attributes absent from the
/// body are deleted.
pub fn apply_attrs(
    op: &WriteOp<'_>,
    entity: &mut Entity,
    spec: &BTreeMap<String, Attribute>,
    body: &serde_json::Map<String, serde_json::Value>,
    patch: bool,
    handled: &[&str],
) -> Result<()> {
    let is_system = |name: &str| {
        matches!(name, "epoch" | "createdat" | "modifiedat")
            || handled.contains(&name)
            || spec.get(name).map(|a| a.readonly || a.immutable).unwrap_or(false)
    };
    if !patch {
        let stored = entity.public_roots();
        for root in stored {
            if is_system(&root) {
                continue;
            }
            if !body.contains_key(&root) {
                entity.delete_save(op.tx, &root)?;
            }
        }
    }
    for (key, value) in body {
        if handled.contains(&key.as_str()) || key == "epoch" {
            continue;
        }
        let attr = spec
            .get(key)
            .or_else(|| spec.get("*"))
            .ok_or_else(|| {
                RegistryError::bad_request(format!("unknown attribute \"{key}\""))
            })?;
        if attr.readonly {
            // Echoes of server-computed attributes are tolerated, not stored.
            continue;
        }
        if attr.immutable && entity.leaf(key).is_some() {
            let unchanged = entity
                .get_attr(key)
                .map(|current| &current == value)
                .unwrap_or(false);
            if !unchanged {
                return Err(RegistryError::bad_request(format!(
                    "attribute \"{key}\" is immutable"
                )));
            }
            continue;
        }
        if value.is_null() {
            entity.delete_save(op.tx, key)?;
            continue;
        }
        if key == "createdat" || key == "modifiedat" {
            // Client-supplied timestamps are validated, then `modifiedat`
            // is overwritten by the bump anyway.
            let mut leaves = Vec::new();
            flatten_value(attr, key, value, &mut leaves)?;
            entity.set_tree_save(op.tx, key, leaves)?;
            continue;
        }
        let mut leaves = Vec::new();
        flatten_value(attr, key, value, &mut leaves)?;
        entity.set_tree_save(op.tx, key, leaves)?;
    }
    Ok(())
}

/// Everything needed to operate on one resource's version set.
pub struct ResourceCtx<'m> {
    /// Group model the resource was resolved under.
    pub gmodel: &'m GroupModel,
    /// Resource model.
    pub rmodel: &'m ResourceModel,
    /// Resource entity path (`dirs/d1/files/f1`).
    pub path: String,
    /// Path-derived resource id.
    pub rid: String,
}

impl ResourceCtx<'_> {
    /// The resource's meta path.
    pub fn meta_path(&self) -> String {
        meta_path(&self.path)
    }

    /// Path of one version.
    pub fn version_path(&self, vid: &str) -> String {
        version_path(&self.path, vid)
    }

    /// Prefix under which version entities live.
    pub fn versions_prefix(&self) -> String {
        format!("{}/versions/", self.path)
    }
}

/// Create the resource shell (id row + meta singleton) if it is missing.
/// Returns the meta entity.
pub fn ensure_resource(op: &WriteOp<'_>, ctx: &ResourceCtx<'_>) -> Result<Entity> {
    let mpath = ctx.meta_path();
    if let Some(meta) = Entity::find(op.tx, &mpath, EntityKind::Meta)? {
        return Ok(meta);
    }
    let mut res = Entity::create(op.tx, &ctx.path, EntityKind::Resource)?;
    res.set_save(
        op.tx,
        &ctx.rmodel.id_attr(),
        PropValue::String(ctx.rid.clone()),
    )?;
    let mut meta = Entity::create(op.tx, &mpath, EntityKind::Meta)?;
    meta.set_save(
        op.tx,
        &ctx.rmodel.id_attr(),
        PropValue::String(ctx.rid.clone()),
    )?;
    meta.set_save(op.tx, "readonly", PropValue::Bool(false))?;
    meta.set_save(op.tx, "compatibility", PropValue::String("none".into()))?;
    meta.set_save(op.tx, "#nextversionid", PropValue::UInt(1))?;
    op.stamp_created(&mut meta)?;
    debug!(path = %ctx.path, "resource created");
    Ok(meta)
}

/// Reject mutation when the resource's meta marks it readonly.
pub fn check_not_readonly(ctx: &ResourceCtx<'_>, meta: &Entity) -> Result<()> {
    if meta.bool("readonly").unwrap_or(false) {
        return Err(RegistryError::Readonly {
            xid: xid_of(&ctx.path),
        });
    }
    Ok(())
}

/// All versionids of a resource, path-ordered.
pub fn version_ids(tx: &Tx<'_>, ctx: &ResourceCtx<'_>) -> Result<Vec<String>> {
    let prefix = ctx.versions_prefix();
    Ok(tx
        .children(&prefix, EntityKind::Version)?
        .into_iter()
        .filter_map(|p| p.rsplit('/').next().map(str::to_string))
        .collect())
}

/// Dispense the next server-generated versionid: the next unused integer
/// string, tracked by the meta's `#nextversionid` counter (which survives
/// deletions and xref cycles).
pub fn next_version_id(op: &WriteOp<'_>, ctx: &ResourceCtx<'_>, meta: &mut Entity) -> Result<String> {
    let mut counter = meta.uint("#nextversionid").unwrap_or(1);
    loop {
        let candidate = counter.to_string();
        counter += 1;
        if !op.tx.exists(&ctx.version_path(&candidate))? {
            meta.set_save(op.tx, "#nextversionid", PropValue::UInt(counter))?;
            return Ok(candidate);
        }
    }
}

/// The "newest" version: latest `createdat`, versionid as the tiebreak
/// (numeric-aware so "10" sorts after "9").
pub fn newest_version(tx: &Tx<'_>, ctx: &ResourceCtx<'_>) -> Result<Option<Entity>> {
    let mut newest: Option<Entity> = None;
    for vid in version_ids(tx, ctx)? {
        let candidate = Entity::require(tx, &ctx.version_path(&vid), EntityKind::Version)?;
        let replace = match &newest {
            None => true,
            Some(current) => {
                let ca = current.string("createdat").unwrap_or("");
                let cb = candidate.string("createdat").unwrap_or("");
                match ca.cmp(cb) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Greater => false,
                    std::cmp::Ordering::Equal => {
                        version_id_order(
                            current.string("versionid").unwrap_or(""),
                            candidate.string("versionid").unwrap_or(""),
                        ) == std::cmp::Ordering::Less
                    }
                }
            }
        };
        if replace {
            newest = Some(candidate);
        }
    }
    Ok(newest)
}

/// Numeric-aware versionid ordering: integer strings compare numerically,
/// everything else case-insensitively.
pub fn version_id_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(na), Ok(nb)) => na.cmp(&nb),
        _ => compare_ci(a, b),
    }
}

/// Recompute and store the default-version pointer.
///
/// Sticky pins survive as long as the pinned version exists; otherwise the
/// default floats to the newest version.
pub fn select_default(op: &WriteOp<'_>, ctx: &ResourceCtx<'_>, meta: &mut Entity) -> Result<()> {
    let sticky = meta.bool("defaultversionsticky").unwrap_or(false);
    let pinned = meta.string("defaultversionid").map(str::to_string);
    let target = if sticky {
        match pinned {
            Some(vid) if op.tx.exists(&ctx.version_path(&vid))? => Some(vid),
            _ => {
                meta.delete_save(op.tx, "defaultversionsticky")?;
                newest_version(op.tx, ctx)?.and_then(|v| v.string("versionid").map(str::to_string))
            }
        }
    } else {
        newest_version(op.tx, ctx)?.and_then(|v| v.string("versionid").map(str::to_string))
    };
    let previous = meta.string("defaultversionid").map(str::to_string);
    match &target {
        Some(vid) => {
            if previous.as_deref() != Some(vid.as_str()) {
                meta.set_save(op.tx, "defaultversionid", PropValue::String(vid.clone()))?;
                op.bump(meta)?;
            }
            for other in version_ids(op.tx, ctx)? {
                let vpath = ctx.version_path(&other);
                let mut version = Entity::require(op.tx, &vpath, EntityKind::Version)?;
                let is_default = other == *vid;
                let was_default = version.bool("isdefault").unwrap_or(false);
                if is_default && !was_default {
                    version.set_save(op.tx, "isdefault", PropValue::Bool(true))?;
                } else if !is_default && was_default {
                    version.delete_save(op.tx, "isdefault")?;
                }
            }
        }
        None => {
            if previous.is_some() {
                meta.delete_save(op.tx, "defaultversionid")?;
                op.bump(meta)?;
            }
        }
    }
    Ok(())
}

/// Apply a pin/unpin directive, validating the pinned id exists.
pub fn apply_default_directive(
    op: &WriteOp<'_>,
    ctx: &ResourceCtx<'_>,
    meta: &mut Entity,
    directive: &DefaultDirective,
) -> Result<()> {
    match directive {
        DefaultDirective::Unchanged => {}
        DefaultDirective::Pin(vid) => {
            if !ctx.rmodel.setdefaultversionsticky {
                return Err(RegistryError::bad_request(format!(
                    "resource type \"{}\" does not allow sticky default versions",
                    ctx.rmodel.plural
                )));
            }
            if !op.tx.exists(&ctx.version_path(vid))? {
                return Err(RegistryError::UnknownId {
                    xid: xid_of(&ctx.path),
                    versionid: vid.clone(),
                });
            }
            meta.set_save(op.tx, "defaultversionsticky", PropValue::Bool(true))?;
            meta.set_save(op.tx, "defaultversionid", PropValue::String(vid.clone()))?;
            op.bump(meta)?;
        }
        DefaultDirective::Unpin => {
            if meta.bool("defaultversionsticky").unwrap_or(false) {
                meta.delete_save(op.tx, "defaultversionsticky")?;
                op.bump(meta)?;
            }
        }
    }
    select_default(op, ctx, meta)
}

/// Create or update one version from a body.
///
/// `vid`: `None` asks for a server-generated id. Returns the version
/// entity.
pub fn upsert_version(
    op: &WriteOp<'_>,
    ctx: &ResourceCtx<'_>,
    meta: &mut Entity,
    vid: Option<&str>,
    body: &serde_json::Value,
    patch: bool,
) -> Result<Entity> {
    let mut body = match body {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            return Err(RegistryError::bad_request(format!(
                "version body must be an object: {other}"
            )))
        }
    };
    let supplied_epoch = take_epoch(&mut body)?;
    take_id(&mut body, &ctx.rmodel.id_attr(), &ctx.rid)?;

    let mut client_chose_id = vid.is_some();
    let vid = match vid {
        Some(v) => {
            validate_id(v)?;
            v.to_string()
        }
        None => match body.get("versionid").and_then(|v| v.as_str()) {
            Some(v) => {
                client_chose_id = true;
                validate_id(v)?;
                v.to_string()
            }
            None => next_version_id(op, ctx, meta)?,
        },
    };
    take_id(&mut body, "versionid", &vid)?;

    let vpath = ctx.version_path(&vid);
    let existing = Entity::find(op.tx, &vpath, EntityKind::Version)?;
    if existing.is_none() && client_chose_id && !ctx.rmodel.setversionid {
        return Err(RegistryError::bad_request(format!(
            "resource type \"{}\" does not allow client-chosen versionids",
            ctx.rmodel.plural
        )));
    }
    let spec = crate::model::version_spec_attrs(&ctx.rmodel.singular);
    let spec: BTreeMap<String, Attribute> = spec
        .into_iter()
        .chain(ctx.rmodel.attributes.clone())
        .collect();
    let content_handled = content_attr_names(ctx.rmodel);
    let id_attr = ctx.rmodel.id_attr();
    let mut handled: Vec<&str> = vec!["versionid", "ancestor", "isdefault", id_attr.as_str()];
    for name in &content_handled {
        handled.push(name.as_str());
    }

    let mut version = match existing {
        Some(mut version) => {
            op.check_epoch(&version, supplied_epoch)?;
            apply_attrs(op, &mut version, &spec, &body, patch, &handled)?;
            apply_ancestor(op, ctx, &mut version, body.get("ancestor"))?;
            apply_content(op, ctx, &mut version, &body)?;
            op.bump(&mut version)?;
            version
        }
        None => {
            let mut version = Entity::create(op.tx, &vpath, EntityKind::Version)?;
            version.set_save(op.tx, &id_attr, PropValue::String(ctx.rid.clone()))?;
            version.set_save(op.tx, "versionid", PropValue::String(vid.clone()))?;
            apply_attrs(op, &mut version, &spec, &body, patch, &handled)?;
            let fallback_ancestor = meta
                .string("defaultversionid")
                .map(str::to_string)
                .unwrap_or_else(|| vid.clone());
            match body.get("ancestor") {
                Some(a) => apply_ancestor(op, ctx, &mut version, Some(a))?,
                None => version.set_save(op.tx, "ancestor", PropValue::String(fallback_ancestor))?,
            }
            apply_content(op, ctx, &mut version, &body)?;
            op.stamp_created(&mut version)?;
            version
        }
    };

    select_default(op, ctx, meta)?;
    prune_versions(op, ctx, meta)?;
    version.refresh(op.tx)?;
    Ok(version)
}

fn apply_ancestor(
    op: &WriteOp<'_>,
    ctx: &ResourceCtx<'_>,
    version: &mut Entity,
    supplied: Option<&serde_json::Value>,
) -> Result<()> {
    let Some(supplied) = supplied else {
        return Ok(());
    };
    let vid = version.string("versionid").unwrap_or("").to_string();
    match supplied {
        serde_json::Value::Null => {
            version.set_save(op.tx, "ancestor", PropValue::String(vid))?;
        }
        serde_json::Value::String(ancestor) => {
            if *ancestor != vid && !op.tx.exists(&ctx.version_path(ancestor))? {
                return Err(RegistryError::UnknownId {
                    xid: xid_of(&ctx.path),
                    versionid: ancestor.clone(),
                });
            }
            version.set_save(op.tx, "ancestor", PropValue::String(ancestor.clone()))?;
        }
        other => {
            return Err(RegistryError::bad_request(format!(
                "\"ancestor\" must be a string: {other}"
            )))
        }
    }
    Ok(())
}

/// Names of the mutually exclusive content forms for a resource type.
pub fn content_attr_names(rmodel: &ResourceModel) -> Vec<String> {
    vec![
        rmodel.singular.clone(),
        format!("{}base64", rmodel.singular),
        format!("{}url", rmodel.singular),
        format!("{}proxyurl", rmodel.singular),
    ]
}

fn apply_content(
    op: &WriteOp<'_>,
    ctx: &ResourceCtx<'_>,
    version: &mut Entity,
    body: &serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    use base64::Engine as _;
    let engine = base64::engine::general_purpose::STANDARD;
    if !ctx.rmodel.hasdocument {
        for name in content_attr_names(ctx.rmodel) {
            if body.contains_key(&name) {
                return Err(RegistryError::bad_request(format!(
                    "resource type \"{}\" has no document; \"{name}\" is not allowed",
                    ctx.rmodel.plural
                )));
            }
        }
        return Ok(());
    }
    let names = content_attr_names(ctx.rmodel);
    let supplied: Vec<&String> = names
        .iter()
        .filter(|n| body.get(n.as_str()).map(|v| !v.is_null()).unwrap_or(false))
        .collect();
    if supplied.len() > 1 {
        return Err(RegistryError::bad_request(format!(
            "only one of {names:?} may be supplied"
        )));
    }
    let clears_all = |version: &mut Entity, op: &WriteOp<'_>| -> Result<()> {
        version.delete_save(op.tx, "#contentbase64")?;
        for name in &names[2..] {
            version.delete_save(op.tx, name)?;
        }
        Ok(())
    };
    let explicit_null = names
        .iter()
        .any(|n| matches!(body.get(n.as_str()), Some(serde_json::Value::Null)));
    match supplied.first() {
        None => {
            // PUT without a content form leaves stored content alone; an
            // explicit null clears it.
            if explicit_null {
                clears_all(version, op)?;
            }
        }
        Some(name) => {
            let value = &body[name.as_str()];
            let singular = &ctx.rmodel.singular;
            clears_all(version, op)?;
            if *name == singular {
                let bytes = match value {
                    serde_json::Value::String(s) => s.clone().into_bytes(),
                    other => {
                        if version.string("contenttype").is_none() && !body.contains_key("contenttype")
                        {
                            version.set_save(
                                op.tx,
                                "contenttype",
                                PropValue::String("application/json".into()),
                            )?;
                        }
                        serde_json::to_string(other)
                            .map_err(|e| RegistryError::Storage(e.to_string()))?
                            .into_bytes()
                    }
                };
                version.set_save(
                    op.tx,
                    "#contentbase64",
                    PropValue::String(engine.encode(bytes)),
                )?;
            } else if *name == &format!("{singular}base64") {
                let encoded = value.as_str().ok_or_else(|| {
                    RegistryError::bad_request(format!("\"{name}\" must be a base64 string"))
                })?;
                engine.decode(encoded).map_err(|_| {
                    RegistryError::bad_request(format!("\"{name}\" is not valid base64"))
                })?;
                version.set_save(op.tx, "#contentbase64", PropValue::String(encoded.to_string()))?;
            } else {
                // fileurl / fileproxyurl: stored public, content cleared.
                let url = value.as_str().ok_or_else(|| {
                    RegistryError::bad_request(format!("\"{name}\" must be a url string"))
                })?;
                version.set_save(op.tx, name, PropValue::String(url.to_string()))?;
            }
        }
    }
    Ok(())
}

/// Enforce the model's `maxversions` cap by pruning the oldest non-default
/// versions.
fn prune_versions(op: &WriteOp<'_>, ctx: &ResourceCtx<'_>, meta: &mut Entity) -> Result<()> {
    let cap = ctx.rmodel.maxversions;
    if cap == 0 {
        return Ok(());
    }
    loop {
        let ids = version_ids(op.tx, ctx)?;
        if ids.len() as u64 <= cap {
            return Ok(());
        }
        let default = meta.string("defaultversionid").map(str::to_string);
        let mut oldest: Option<Entity> = None;
        for vid in &ids {
            if Some(vid.as_str()) == default.as_deref() {
                continue;
            }
            let candidate = Entity::require(op.tx, &ctx.version_path(vid), EntityKind::Version)?;
            let replace = match &oldest {
                None => true,
                Some(current) => {
                    let ca = current.string("createdat").unwrap_or("");
                    let cb = candidate.string("createdat").unwrap_or("");
                    match cb.cmp(ca) {
                        std::cmp::Ordering::Less => true,
                        std::cmp::Ordering::Greater => false,
                        std::cmp::Ordering::Equal => {
                            version_id_order(
                                candidate.string("versionid").unwrap_or(""),
                                current.string("versionid").unwrap_or(""),
                            ) == std::cmp::Ordering::Less
                        }
                    }
                }
            };
            if replace {
                oldest = Some(candidate);
            }
        }
        let Some(oldest) = oldest else {
            return Ok(());
        };
        debug!(path = %oldest.path, "pruning version beyond maxversions");
        op.tx.remove_tree(&oldest.path)?;
    }
}

/// Delete one version. Returns `true` when the whole resource was deleted
/// because its last version went away.
pub fn delete_version(
    op: &WriteOp<'_>,
    ctx: &ResourceCtx<'_>,
    meta: &mut Entity,
    vid: &str,
    supplied_epoch: Option<u64>,
) -> Result<bool> {
    let vpath = ctx.version_path(vid);
    let version = Entity::require(op.tx, &vpath, EntityKind::Version)?;
    op.check_epoch(&version, supplied_epoch)?;
    let own_ancestor = version.string("ancestor").unwrap_or(vid).to_string();
    op.tx.remove_tree(&vpath)?;

    // Re-parent children of the deleted version.
    for other in version_ids(op.tx, ctx)? {
        let opath = ctx.version_path(&other);
        let mut sibling = Entity::require(op.tx, &opath, EntityKind::Version)?;
        if sibling.string("ancestor") == Some(vid) {
            let new_ancestor = if own_ancestor == vid { other.clone() } else { own_ancestor.clone() };
            sibling.set_save(op.tx, "ancestor", PropValue::String(new_ancestor))?;
        }
    }

    if version_ids(op.tx, ctx)?.is_empty() {
        op.tx.remove_tree(&ctx.path)?;
        op.bump_ancestors(&ctx.path)?;
        return Ok(true);
    }
    if meta.string("defaultversionid") == Some(vid) {
        // A pin to a deleted version clears to floating.
        meta.delete_save(op.tx, "defaultversionsticky")?;
    }
    select_default(op, ctx, meta)?;
    op.bump_ancestors(&ctx.path)?;
    Ok(false)
}
