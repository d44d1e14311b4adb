//! Ordered JSON rendering of materialized subtrees.
//!
//! Attribute ordering is defined, not alphabetical: ids first, identity
//! URLs, core attributes, customs sorted by name, then collection
//! url/count/contents triples. `meta` precedes `versions` by default but
//! is re-emitted after an inlined `versions` map, because
//! `defaultversionurl` can only be rendered document-relative once the
//! default version's presence among the emitted versions is known.

use base64::Engine as _;
use serde_json::{Map, Value};

use crate::query::tree::{NodeKind, TreeNode};
use crate::query::ReadOptions;

/// Context shared across one render pass.
pub struct RenderCtx<'a> {
    /// Request options.
    pub opts: &'a ReadOptions,
    /// Display path of the render root (relativity base for `#/`).
    pub root_path: String,
    /// The active capabilities document (registry renders only).
    pub capabilities: Option<Value>,
    /// The derived model document.
    pub model_doc: Option<Value>,
    /// The authored model source.
    pub modelsource: Option<Value>,
}

impl RenderCtx<'_> {
    fn absolute(&self, path: &str) -> String {
        if path.is_empty() {
            self.opts.base_url.clone()
        } else {
            format!("{}/{path}", self.opts.base_url)
        }
    }

    fn in_root(&self, path: &str) -> bool {
        self.root_path.is_empty()
            || path == self.root_path
            || path.starts_with(&format!("{}/", self.root_path))
    }

    /// Render a URL for `path`. `rendered` says whether the node the URL
    /// addresses is part of the emitted document; only then may doc mode
    /// use a `#/` fragment.
    fn url(&self, path: &str, rendered: bool) -> String {
        if self.opts.doc && rendered && self.in_root(path) {
            let rel = if path == self.root_path {
                ""
            } else if self.root_path.is_empty() {
                path
            } else {
                &path[self.root_path.len() + 1..]
            };
            return format!("#/{rel}");
        }
        self.absolute(path)
    }
}

/// Render one node.
pub fn render_node(node: &TreeNode<'_>, ctx: &RenderCtx<'_>, rel: &[String]) -> Value {
    match &node.kind {
        NodeKind::Registry => render_registry(node, ctx, rel),
        NodeKind::Group { .. } => render_group(node, ctx, rel),
        NodeKind::Resource { .. } => render_resource(node, ctx, rel),
        NodeKind::Meta { .. } => render_meta(node, ctx, None),
        NodeKind::Version { .. } => render_version(node, ctx, rel),
    }
}

/// Render a collection as an id-keyed map, preserving member order.
pub fn render_collection(
    members: &[TreeNode<'_>],
    ctx: &RenderCtx<'_>,
    rel: &[String],
) -> Value {
    let mut out = Map::new();
    for member in members {
        out.insert(member.id.clone(), render_node(member, ctx, rel));
    }
    Value::Object(out)
}

const COMMON_TAIL: &[&str] = &[
    "name",
    "description",
    "documentation",
    "labels",
    "createdat",
    "modifiedat",
];

fn push_attr(out: &mut Map<String, Value>, node: &TreeNode<'_>, name: &str) {
    if let Some(value) = node.entity.get_attr(name) {
        out.insert(name.to_string(), value);
    }
}

fn push_custom_attrs(
    out: &mut Map<String, Value>,
    node: &TreeNode<'_>,
    known: &[String],
    skip: &[String],
) {
    for root in node.entity.public_roots() {
        if known.contains(&root) || skip.contains(&root) || out.contains_key(&root) {
            continue;
        }
        if let Some(value) = node.entity.get_attr(&root) {
            out.insert(root, value);
        }
    }
}

fn identity(out: &mut Map<String, Value>, node: &TreeNode<'_>, ctx: &RenderCtx<'_>) {
    out.insert(
        "self".to_string(),
        Value::String(ctx.url(&node.display_path, true)),
    );
    out.insert(
        "xid".to_string(),
        Value::String(format!("/{}", node.display_path)),
    );
}

fn render_registry(node: &TreeNode<'_>, ctx: &RenderCtx<'_>, rel: &[String]) -> Value {
    let mut out = Map::new();
    push_attr(&mut out, node, "specversion");
    push_attr(&mut out, node, "registryid");
    identity(&mut out, node, ctx);
    push_attr(&mut out, node, "epoch");
    for name in COMMON_TAIL {
        push_attr(&mut out, node, name);
    }
    let mut known: Vec<String> = ["specversion", "registryid", "self", "xid", "epoch"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    known.extend(COMMON_TAIL.iter().map(|s| s.to_string()));
    push_custom_attrs(&mut out, node, &known, &[]);

    let inline = &ctx.opts.inline;
    if inline.explicitly("capabilities") {
        if let Some(caps) = &ctx.capabilities {
            out.insert("capabilities".to_string(), caps.clone());
        }
    }
    if inline.explicitly("model") {
        if let Some(model) = &ctx.model_doc {
            out.insert("model".to_string(), model.clone());
        }
    }
    if inline.explicitly("modelsource") {
        if let Some(source) = &ctx.modelsource {
            out.insert("modelsource".to_string(), source.clone());
        }
    }

    for (plural, members) in &node.collections {
        let mut crel = rel.to_vec();
        crel.push(plural.clone());
        let inlined = inline.selected(&crel);
        let coll_path = join_path(&node.display_path, plural);
        out.insert(
            format!("{plural}url"),
            Value::String(ctx.url(&coll_path, inlined)),
        );
        out.insert(format!("{plural}count"), Value::from(members.len() as u64));
        if inlined {
            out.insert(plural.clone(), render_collection(members, ctx, &crel));
        }
    }
    Value::Object(out)
}

fn render_group(node: &TreeNode<'_>, ctx: &RenderCtx<'_>, rel: &[String]) -> Value {
    let NodeKind::Group { gmodel } = &node.kind else {
        return Value::Null;
    };
    let mut out = Map::new();
    let id_attr = gmodel.id_attr();
    push_attr(&mut out, node, &id_attr);
    identity(&mut out, node, ctx);
    push_attr(&mut out, node, "epoch");
    for name in COMMON_TAIL {
        push_attr(&mut out, node, name);
    }
    let mut known: Vec<String> = vec![id_attr, "self".into(), "xid".into(), "epoch".into()];
    known.extend(COMMON_TAIL.iter().map(|s| s.to_string()));
    push_custom_attrs(&mut out, node, &known, &[]);

    for (plural, members) in &node.collections {
        let mut crel = rel.to_vec();
        crel.push(plural.clone());
        let inlined = ctx.opts.inline.selected(&crel);
        let coll_path = join_path(&node.display_path, plural);
        out.insert(
            format!("{plural}url"),
            Value::String(ctx.url(&coll_path, inlined)),
        );
        out.insert(format!("{plural}count"), Value::from(members.len() as u64));
        if inlined {
            out.insert(plural.clone(), render_collection(members, ctx, &crel));
        }
    }
    Value::Object(out)
}

fn render_resource(node: &TreeNode<'_>, ctx: &RenderCtx<'_>, rel: &[String]) -> Value {
    let NodeKind::Resource { rmodel, .. } = &node.kind else {
        return Value::Null;
    };
    let mut out = Map::new();
    let id_attr = rmodel.id_attr();
    let versions = node.collection("versions").cloned().unwrap_or_default();
    let default = node
        .default_vid
        .as_ref()
        .and_then(|vid| versions.iter().find(|v| v.id == *vid));

    match default {
        Some(default) => {
            // The resource view is its default version, addressed at the
            // resource's own path.
            let mut projected = default.clone();
            projected.display_path = node.display_path.clone();
            out = match render_version(&projected, ctx, rel) {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            if let Some(id) = node.entity.get_attr(&id_attr) {
                out.insert(id_attr.clone(), id);
            }
        }
        None => {
            push_attr(&mut out, node, &id_attr);
            identity(&mut out, node, ctx);
        }
    }

    let mut vrel = rel.to_vec();
    vrel.push("versions".to_string());
    let versions_inlined = ctx.opts.inline.selected(&vrel);
    let mut mrel = rel.to_vec();
    mrel.push("meta".to_string());
    let meta_inlined = ctx.opts.inline.selected(&mrel);

    let meta_block = |out: &mut Map<String, Value>| {
        let meta_path = join_path(&node.display_path, "meta");
        out.insert(
            "metaurl".to_string(),
            Value::String(ctx.url(&meta_path, meta_inlined)),
        );
        if meta_inlined {
            if let Some(meta) = &node.meta {
                let default_rendered = versions_inlined
                    && node
                        .default_vid
                        .as_ref()
                        .map(|vid| versions.iter().any(|v| v.id == *vid))
                        .unwrap_or(false);
                out.insert(
                    "meta".to_string(),
                    render_meta(meta, ctx, Some(default_rendered)),
                );
            }
        }
    };
    let versions_block = |out: &mut Map<String, Value>| {
        let versions_path = join_path(&node.display_path, "versions");
        out.insert(
            "versionsurl".to_string(),
            Value::String(ctx.url(&versions_path, versions_inlined)),
        );
        out.insert("versionscount".to_string(), Value::from(versions.len() as u64));
        if versions_inlined {
            out.insert(
                "versions".to_string(),
                render_collection(&versions, ctx, &vrel),
            );
        }
    };

    if versions_inlined {
        versions_block(&mut out);
        meta_block(&mut out);
    } else {
        meta_block(&mut out);
        versions_block(&mut out);
    }
    Value::Object(out)
}

fn render_meta(
    node: &TreeNode<'_>,
    ctx: &RenderCtx<'_>,
    default_rendered: Option<bool>,
) -> Value {
    let NodeKind::Meta { rmodel } = &node.kind else {
        return Value::Null;
    };
    let mut out = Map::new();
    let id_attr = rmodel.id_attr();
    push_attr(&mut out, node, &id_attr);
    identity(&mut out, node, ctx);
    push_attr(&mut out, node, "xref");
    push_attr(&mut out, node, "epoch");
    push_attr(&mut out, node, "createdat");
    push_attr(&mut out, node, "modifiedat");
    push_attr(&mut out, node, "readonly");
    push_attr(&mut out, node, "compatibility");
    push_attr(&mut out, node, "compatibilityauthority");
    push_attr(&mut out, node, "deprecated");
    if let Some(default_vid) = node.entity.string("defaultversionid") {
        out.insert(
            "defaultversionid".to_string(),
            Value::String(default_vid.to_string()),
        );
        // The meta path is ".../meta"; the resource path is its parent.
        let resource_path = node
            .display_path
            .strip_suffix("/meta")
            .unwrap_or(&node.display_path);
        let vpath = format!("{resource_path}/versions/{default_vid}");
        out.insert(
            "defaultversionurl".to_string(),
            Value::String(ctx.url(&vpath, default_rendered.unwrap_or(false))),
        );
    }
    push_attr(&mut out, node, "defaultversionsticky");
    Value::Object(out)
}

fn render_version(node: &TreeNode<'_>, ctx: &RenderCtx<'_>, rel: &[String]) -> Value {
    let NodeKind::Version { rmodel } = &node.kind else {
        return Value::Null;
    };
    let mut out = Map::new();
    let id_attr = rmodel.id_attr();
    push_attr(&mut out, node, &id_attr);
    push_attr(&mut out, node, "versionid");
    identity(&mut out, node, ctx);
    push_attr(&mut out, node, "epoch");
    out.insert(
        "isdefault".to_string(),
        Value::Bool(node.entity.bool("isdefault").unwrap_or(false)),
    );
    push_attr(&mut out, node, "ancestor");
    for name in COMMON_TAIL {
        push_attr(&mut out, node, name);
    }
    push_attr(&mut out, node, "contenttype");

    let content_names: Vec<String> = vec![
        rmodel.singular.clone(),
        format!("{}base64", rmodel.singular),
        format!("{}url", rmodel.singular),
        format!("{}proxyurl", rmodel.singular),
    ];
    let mut known: Vec<String> = vec![
        id_attr,
        "versionid".into(),
        "self".into(),
        "xid".into(),
        "epoch".into(),
        "isdefault".into(),
        "ancestor".into(),
        "contenttype".into(),
    ];
    known.extend(COMMON_TAIL.iter().map(|s| s.to_string()));
    push_custom_attrs(&mut out, node, &known, &content_names);

    if rmodel.hasdocument {
        let singular = &rmodel.singular;
        if let Some(url) = node.entity.string(&format!("{singular}url")) {
            out.insert(format!("{singular}url"), Value::String(url.to_string()));
        } else if let Some(proxyurl) = node.entity.string(&format!("{singular}proxyurl")) {
            out.insert(
                format!("{singular}proxyurl"),
                Value::String(proxyurl.to_string()),
            );
        } else if let Some(encoded) = node.entity.string("#contentbase64") {
            // Content paths follow the rendering position: `files.file` for
            // the resource view, `files.versions.file` through the
            // collection.
            let mut crel = rel.to_vec();
            crel.push(singular.clone());
            if ctx.opts.inline.selected(&crel) {
                render_content(&mut out, singular, encoded, node, ctx);
            }
        }
    }
    Value::Object(out)
}

fn render_content(
    out: &mut Map<String, Value>,
    singular: &str,
    encoded: &str,
    node: &TreeNode<'_>,
    ctx: &RenderCtx<'_>,
) {
    let engine = base64::engine::general_purpose::STANDARD;
    if ctx.opts.binary {
        out.insert(format!("{singular}base64"), Value::String(encoded.to_string()));
        return;
    }
    let Ok(bytes) = engine.decode(encoded) else {
        out.insert(format!("{singular}base64"), Value::String(encoded.to_string()));
        return;
    };
    let contenttype = node.entity.string("contenttype").unwrap_or("");
    if contenttype.contains("json") {
        if let Ok(parsed) = serde_json::from_slice::<Value>(&bytes) {
            out.insert(singular.to_string(), parsed);
            return;
        }
    }
    match String::from_utf8(bytes) {
        Ok(text) => {
            out.insert(singular.to_string(), Value::String(text));
        }
        Err(_) => {
            out.insert(format!("{singular}base64"), Value::String(encoded.to_string()));
        }
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}
