//! Structured request surface: the collaboration boundary between the
//! HTTP layer and the registry core.
//!
//! The HTTP layer parses the wire request (method, path, query string,
//! body) into an [`ApiRequest`]; everything that makes the registry a
//! registry — path resolution, epoch discipline, xref handling,
//! projection — happens below this line, inside one store transaction per
//! request.
#![forbid(unsafe_code)]

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::capabilities::Capabilities;
use crate::commit::{
    apply_attrs, apply_default_directive, delete_version, ensure_resource, take_epoch, take_id,
    upsert_version, check_not_readonly, DefaultDirective, ResourceCtx, WriteOp,
};
use crate::entity::Entity;
use crate::error::{RegistryError, Result};
use crate::model::{
    group_spec_attrs, meta_spec_attrs, registry_spec_attrs, Attribute, GroupModel, RegistryModel,
    ResourceModel,
};
use crate::path::{group_path, resource_path, validate_id, xid_of, EntityKind};
use crate::query::{
    apply_filters, materialize_group, materialize_registry, materialize_resource, render_collection,
    render_node, sort_nodes, FilterExpr, InlineSet, ReadOptions, RenderCtx, SortSpec, TreeNode,
};
use crate::store::{Store, Tx};
use crate::value::PropValue;

use std::collections::BTreeMap;
use std::path::Path;

/// Request method, as far as the core cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// Read.
    Get,
    /// Create or replace.
    Put,
    /// Merge-update.
    Patch,
    /// Create within a collection (or a new version of a resource).
    Post,
    /// Remove.
    Delete,
}

/// Structured query parameters, already parsed by the HTTP layer.
#[derive(Clone, Debug, Default)]
pub struct QueryParams {
    /// `?inline=...` (`Some(InlineSet)` when present; bare means `*`).
    pub inline: Option<InlineSet>,
    /// Repeated `?filter=` expressions (disjunction).
    pub filters: Vec<FilterExpr>,
    /// `?sort=attr[=asc|desc]`.
    pub sort: Option<SortSpec>,
    /// `?doc`.
    pub doc: bool,
    /// `?export` (registry root only).
    pub export: bool,
    /// `?binary`.
    pub binary: bool,
    /// `?setdefaultversionid=vid` (or `null` to unpin).
    pub setdefaultversionid: Option<String>,
    /// `?epoch=N` (conditional DELETE).
    pub epoch: Option<u64>,
}

impl QueryParams {
    /// Build from decoded key/value pairs, the way the HTTP layer hands
    /// them over.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<QueryParams> {
        let mut params = QueryParams::default();
        for (key, value) in pairs {
            match key.as_str() {
                "inline" => {
                    let set = if value.is_empty() {
                        InlineSet::everything()
                    } else {
                        InlineSet::parse(value)
                    };
                    params.inline = Some(match params.inline.take() {
                        None => set,
                        Some(mut prior) => {
                            prior.all |= set.all;
                            prior.paths.extend(set.paths);
                            prior
                        }
                    });
                }
                "filter" => params.filters.push(FilterExpr::parse(value)?),
                "sort" => params.sort = Some(SortSpec::parse(value)?),
                "doc" => params.doc = true,
                "export" => params.export = true,
                "binary" => params.binary = true,
                "setdefaultversionid" => params.setdefaultversionid = Some(value.clone()),
                "epoch" => {
                    params.epoch = Some(value.parse().map_err(|_| {
                        RegistryError::bad_request(format!("\"epoch\" must be a uinteger: {value}"))
                    })?)
                }
                other => {
                    return Err(RegistryError::bad_request(format!(
                        "unknown query parameter: '{other}'"
                    )))
                }
            }
        }
        Ok(params)
    }
}

/// One structured request.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    /// Method.
    pub method: Method,
    /// Registry-relative path, no leading slash (`""` for the root).
    pub path: String,
    /// Parsed query parameters.
    pub params: QueryParams,
    /// Parsed JSON body, if any.
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Convenience constructor.
    pub fn new(method: Method, path: &str) -> ApiRequest {
        ApiRequest {
            method,
            path: path.trim_matches('/').to_string(),
            params: QueryParams::default(),
            body: None,
        }
    }

    /// Attach a body.
    pub fn with_body(mut self, body: Value) -> ApiRequest {
        self.body = Some(body);
        self
    }

    /// Attach parameters.
    pub fn with_params(mut self, params: QueryParams) -> ApiRequest {
        self.params = params;
        self
    }
}

/// One structured response.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    /// HTTP-ish status code.
    pub status: u16,
    /// JSON body, if any.
    pub body: Option<Value>,
}

impl ApiResponse {
    fn ok(body: Value) -> ApiResponse {
        ApiResponse {
            status: 200,
            body: Some(body),
        }
    }

    fn no_content() -> ApiResponse {
        ApiResponse {
            status: 204,
            body: None,
        }
    }
}

/// The registry service: a property store plus the base URL it serves
/// under.
pub struct Registry {
    store: Store,
    base_url: String,
}

const SPEC_VERSION: &str = "1.0";

struct State {
    capabilities: Capabilities,
    model: RegistryModel,
    modelsource: Value,
}

/// Where a request path landed.
enum TargetKind<'m> {
    Root,
    Capabilities,
    Model,
    ModelSource,
    GroupColl(&'m GroupModel),
    Group(&'m GroupModel, String),
    ResourceColl(&'m GroupModel, &'m ResourceModel, String),
    Resource(&'m GroupModel, &'m ResourceModel, String, String),
    Meta(&'m GroupModel, &'m ResourceModel, String, String),
    VersionColl(&'m GroupModel, &'m ResourceModel, String, String),
    Version(&'m GroupModel, &'m ResourceModel, String, String, String),
}

impl Registry {
    /// Open (creating and bootstrapping if needed) a registry at `path`.
    pub fn open(path: &Path, registryid: &str) -> Result<Registry> {
        let store = Store::open(path)?;
        let registry = Registry {
            store,
            base_url: "http://localhost:8080".to_string(),
        };
        registry.bootstrap(registryid)?;
        Ok(registry)
    }

    /// In-memory registry (tests, ephemeral use).
    pub fn in_memory(registryid: &str) -> Result<Registry> {
        let store = Store::open_in_memory()?;
        let registry = Registry {
            store,
            base_url: "http://localhost:8080".to_string(),
        };
        registry.bootstrap(registryid)?;
        Ok(registry)
    }

    /// Override the absolute URL prefix used in responses.
    pub fn with_base_url(mut self, base_url: &str) -> Registry {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn bootstrap(&self, registryid: &str) -> Result<()> {
        validate_id(registryid)?;
        self.store.with_write(|tx| {
            if tx.exists("")? {
                return Ok(());
            }
            let op = WriteOp::new(tx)?;
            let mut root = Entity::create(tx, "", EntityKind::Registry)?;
            root.set_save(tx, "registryid", PropValue::String(registryid.to_string()))?;
            root.set_save(tx, "specversion", PropValue::String(SPEC_VERSION.to_string()))?;
            root.set_save(
                tx,
                "#capabilities",
                PropValue::String(Capabilities::default().to_json().to_string()),
            )?;
            root.set_save(tx, "#modelsource", PropValue::String("{}".to_string()))?;
            op.stamp_created(&mut root)?;
            info!(registryid, "registry bootstrapped");
            Ok(())
        })
    }

    fn load_state(tx: &Tx<'_>) -> Result<State> {
        let root = Entity::require(tx, "", EntityKind::Registry)?;
        let caps_json: Value = root
            .string("#capabilities")
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| RegistryError::Storage(format!("corrupt capabilities: {e}")))?
            .unwrap_or_else(|| json!({}));
        let modelsource: Value = root
            .string("#modelsource")
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| RegistryError::Storage(format!("corrupt modelsource: {e}")))?
            .unwrap_or_else(|| json!({}));
        Ok(State {
            capabilities: Capabilities::from_json(&caps_json)?,
            model: RegistryModel::from_source(&modelsource)?,
            modelsource,
        })
    }

    /// Handle a request, rendering any error as a structured response.
    pub fn process(&self, req: ApiRequest) -> ApiResponse {
        match self.handle(&req) {
            Ok(resp) => resp,
            Err(err) => {
                debug!(error = %err, kind = err.kind(), "request failed");
                ApiResponse {
                    status: err.status(),
                    body: Some(json!({
                        "type": format!("https://veridex.dev/errors#{}", err.kind()),
                        "title": err.to_string(),
                        "status": err.status(),
                    })),
                }
            }
        }
    }

    /// Handle a request or fail with a structured error.
    pub fn handle(&self, req: &ApiRequest) -> Result<ApiResponse> {
        match req.method {
            Method::Get => self.store.with_read(|tx| self.handle_read(tx, req)),
            _ => self.store.with_write(|tx| self.handle_write(tx, req)),
        }
    }

    fn resolve<'m>(&self, model: &'m RegistryModel, path: &str) -> Result<TargetKind<'m>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [] => Ok(TargetKind::Root),
            ["capabilities"] => Ok(TargetKind::Capabilities),
            ["model"] => Ok(TargetKind::Model),
            ["modelsource"] => Ok(TargetKind::ModelSource),
            [gp, rest @ ..] => {
                let gmodel = model
                    .group(gp)
                    .ok_or_else(|| RegistryError::not_found(format!("/{gp}")))?;
                match rest {
                    [] => Ok(TargetKind::GroupColl(gmodel)),
                    [gid, rest @ ..] => {
                        let gid = gid.to_string();
                        match rest {
                            [] => Ok(TargetKind::Group(gmodel, gid)),
                            [rp, rest @ ..] => {
                                let rmodel = gmodel.resources.get(*rp).ok_or_else(|| {
                                    RegistryError::not_found(format!("/{gp}/{gid}/{rp}"))
                                })?;
                                match rest {
                                    [] => Ok(TargetKind::ResourceColl(gmodel, rmodel, gid)),
                                    [rid, rest @ ..] => {
                                        let rid = rid.to_string();
                                        match rest {
                                            [] => Ok(TargetKind::Resource(gmodel, rmodel, gid, rid)),
                                            ["meta"] => {
                                                Ok(TargetKind::Meta(gmodel, rmodel, gid, rid))
                                            }
                                            ["versions"] => {
                                                Ok(TargetKind::VersionColl(gmodel, rmodel, gid, rid))
                                            }
                                            ["versions", vid] => Ok(TargetKind::Version(
                                                gmodel,
                                                rmodel,
                                                gid,
                                                rid,
                                                vid.to_string(),
                                            )),
                                            _ => Err(RegistryError::not_found(format!("/{path}"))),
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn read_options(
        &self,
        state: &State,
        req: &ApiRequest,
        collection_target: bool,
        filterable_target: bool,
    ) -> Result<ReadOptions> {
        let params = &req.params;
        let caps = &state.capabilities;
        let mut opts = ReadOptions {
            base_url: self.base_url.clone(),
            ..ReadOptions::default()
        };
        if params.export {
            if !caps.flag_enabled("export") || !caps.api_enabled("/export") {
                return Err(RegistryError::bad_request("export is disabled"));
            }
            if !req.path.is_empty() {
                return Err(RegistryError::bad_request(
                    "export is only available at the registry root",
                ));
            }
            opts.doc = true;
            if params.inline.is_none() {
                opts.inline = InlineSet::everything();
            }
        }
        if params.doc {
            if !caps.flag_enabled("doc") {
                return Err(RegistryError::bad_request("doc is disabled"));
            }
            opts.doc = true;
        }
        if let Some(inline) = &params.inline {
            if !caps.flag_enabled("inline") {
                return Err(RegistryError::bad_request("inline is disabled"));
            }
            opts.inline = inline.clone();
        }
        if !params.filters.is_empty() {
            if !caps.flag_enabled("filter") {
                return Err(RegistryError::bad_request("filtering is disabled"));
            }
            if !filterable_target {
                return Err(RegistryError::bad_request(
                    "can't filter a non-collection entity",
                ));
            }
            opts.filters = params.filters.clone();
        }
        if let Some(sort) = &params.sort {
            if !caps.flag_enabled("sort") {
                return Err(RegistryError::bad_request("sorting is disabled"));
            }
            if !collection_target {
                return Err(RegistryError::bad_request(
                    "Can't sort on a non-collection results",
                ));
            }
            opts.sort = Some(sort.clone());
        }
        if params.binary && !caps.flag_enabled("binary") {
            return Err(RegistryError::bad_request("binary is disabled"));
        }
        opts.binary = params.binary;
        Ok(opts)
    }

    fn render_ctx<'a>(
        &self,
        opts: &'a ReadOptions,
        state: &State,
        root_path: &str,
    ) -> RenderCtx<'a> {
        RenderCtx {
            opts,
            root_path: root_path.to_string(),
            capabilities: Some(state.capabilities.to_json()),
            model_doc: Some(state.model.to_json()),
            modelsource: Some(state.modelsource.clone()),
        }
    }

    fn handle_read(&self, tx: &Tx<'_>, req: &ApiRequest) -> Result<ApiResponse> {
        let state = Self::load_state(tx)?;
        let target = self.resolve(&state.model, &req.path)?;
        match target {
            TargetKind::Root => {
                let opts = self.read_options(&state, req, false, true)?;
                validate_inline_paths(&state.model, InlineLevel::Registry, &opts.inline)?;
                let tree = materialize_registry(tx, &state.model)?;
                let tree = apply_filters(tree, &opts.filters)
                    .ok_or_else(|| RegistryError::not_found("/"))?;
                let ctx = self.render_ctx(&opts, &state, "");
                Ok(ApiResponse::ok(render_node(&tree, &ctx, &[])))
            }
            TargetKind::Capabilities => {
                require_api(&state, "/capabilities")?;
                Ok(ApiResponse::ok(state.capabilities.to_json()))
            }
            TargetKind::Model => {
                require_api(&state, "/model")?;
                Ok(ApiResponse::ok(state.model.to_json()))
            }
            TargetKind::ModelSource => {
                require_api(&state, "/modelsource")?;
                Ok(ApiResponse::ok(state.modelsource.clone()))
            }
            TargetKind::GroupColl(gmodel) => {
                let opts = self.read_options(&state, req, true, true)?;
                validate_inline_paths(&state.model, InlineLevel::Group(gmodel), &opts.inline)?;
                let mut members = Vec::new();
                for gpath in tx.children(&format!("{}/", gmodel.plural), EntityKind::Group)? {
                    let node = materialize_group(tx, &state.model, gmodel, &gpath)?;
                    if let Some(kept) = apply_filters(node, &opts.filters) {
                        members.push(kept);
                    }
                }
                if let Some(sort) = &opts.sort {
                    sort_nodes(&mut members, sort);
                }
                let ctx = self.render_ctx(&opts, &state, &gmodel.plural);
                Ok(ApiResponse::ok(render_collection(&members, &ctx, &[])))
            }
            TargetKind::Group(gmodel, gid) => {
                let opts = self.read_options(&state, req, false, true)?;
                validate_inline_paths(&state.model, InlineLevel::Group(gmodel), &opts.inline)?;
                let gpath = group_path(&gmodel.plural, &gid);
                if !tx.exists(&gpath)? {
                    return Err(RegistryError::not_found(xid_of(&gpath)));
                }
                let node = materialize_group(tx, &state.model, gmodel, &gpath)?;
                let node = apply_filters(node, &opts.filters)
                    .ok_or_else(|| RegistryError::not_found(xid_of(&gpath)))?;
                let ctx = self.render_ctx(&opts, &state, &gpath);
                Ok(ApiResponse::ok(render_node(&node, &ctx, &[])))
            }
            TargetKind::ResourceColl(gmodel, rmodel, gid) => {
                let opts = self.read_options(&state, req, true, true)?;
                validate_inline_paths(&state.model, InlineLevel::Resource(rmodel), &opts.inline)?;
                let gpath = group_path(&gmodel.plural, &gid);
                if !tx.exists(&gpath)? {
                    return Err(RegistryError::not_found(xid_of(&gpath)));
                }
                let mut members = Vec::new();
                for rpath in
                    tx.children(&format!("{gpath}/{}/", rmodel.plural), EntityKind::Resource)?
                {
                    let node = materialize_resource(tx, &state.model, gmodel, rmodel, &rpath)?;
                    if let Some(kept) = apply_filters(node, &opts.filters) {
                        members.push(kept);
                    }
                }
                if let Some(sort) = &opts.sort {
                    sort_nodes(&mut members, sort);
                }
                let coll_path = format!("{gpath}/{}", rmodel.plural);
                let ctx = self.render_ctx(&opts, &state, &coll_path);
                Ok(ApiResponse::ok(render_collection(&members, &ctx, &[])))
            }
            TargetKind::Resource(gmodel, rmodel, gid, rid) => {
                let opts = self.read_options(&state, req, false, true)?;
                validate_inline_paths(&state.model, InlineLevel::Resource(rmodel), &opts.inline)?;
                let rpath = resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid);
                if !tx.exists(&rpath)? {
                    return Err(RegistryError::not_found(xid_of(&rpath)));
                }
                let node = materialize_resource(tx, &state.model, gmodel, rmodel, &rpath)?;
                let node = apply_filters(node, &opts.filters)
                    .ok_or_else(|| RegistryError::not_found(xid_of(&rpath)))?;
                let ctx = self.render_ctx(&opts, &state, &rpath);
                Ok(ApiResponse::ok(render_node(&node, &ctx, &[])))
            }
            TargetKind::Meta(gmodel, rmodel, gid, rid) => {
                let opts = self.read_options(&state, req, false, false)?;
                if !opts.inline.paths.is_empty() {
                    return Err(RegistryError::bad_request(
                        "nothing can be inlined below a meta",
                    ));
                }
                let rpath = resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid);
                if !tx.exists(&rpath)? {
                    return Err(RegistryError::not_found(xid_of(&rpath)));
                }
                let node = materialize_resource(tx, &state.model, gmodel, rmodel, &rpath)?;
                let meta = node
                    .meta
                    .as_deref()
                    .ok_or_else(|| RegistryError::not_found(xid_of(&rpath)))?;
                let ctx = self.render_ctx(&opts, &state, &meta.display_path);
                Ok(ApiResponse::ok(render_node(meta, &ctx, &[])))
            }
            TargetKind::VersionColl(gmodel, rmodel, gid, rid) => {
                let opts = self.read_options(&state, req, true, true)?;
                validate_inline_paths(&state.model, InlineLevel::Versions(rmodel), &opts.inline)?;
                let rpath = resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid);
                if !tx.exists(&rpath)? {
                    return Err(RegistryError::not_found(xid_of(&rpath)));
                }
                let node = materialize_resource(tx, &state.model, gmodel, rmodel, &rpath)?;
                let mut members: Vec<TreeNode<'_>> = Vec::new();
                for member in node.collection("versions").cloned().unwrap_or_default() {
                    if let Some(kept) = apply_filters(member, &opts.filters) {
                        members.push(kept);
                    }
                }
                if let Some(sort) = &opts.sort {
                    sort_nodes(&mut members, sort);
                }
                let coll_path = format!("{rpath}/versions");
                let ctx = self.render_ctx(&opts, &state, &coll_path);
                Ok(ApiResponse::ok(render_collection(&members, &ctx, &[])))
            }
            TargetKind::Version(gmodel, rmodel, gid, rid, vid) => {
                let opts = self.read_options(&state, req, false, false)?;
                validate_inline_paths(&state.model, InlineLevel::Versions(rmodel), &opts.inline)?;
                let rpath = resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid);
                if !tx.exists(&rpath)? {
                    return Err(RegistryError::not_found(xid_of(&rpath)));
                }
                let node = materialize_resource(tx, &state.model, gmodel, rmodel, &rpath)?;
                let version = node.child("versions", &vid).ok_or_else(|| {
                    RegistryError::not_found(format!("{}/versions/{vid}", xid_of(&rpath)))
                })?;
                let ctx = self.render_ctx(&opts, &state, &version.display_path);
                Ok(ApiResponse::ok(render_node(version, &ctx, &[])))
            }
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn handle_write(&self, tx: &Tx<'_>, req: &ApiRequest) -> Result<ApiResponse> {
        let state = Self::load_state(tx)?;
        if req.params.epoch.is_some() && !state.capabilities.flag_enabled("epoch") {
            return Err(RegistryError::bad_request("the epoch parameter is disabled"));
        }
        if req.params.setdefaultversionid.is_some()
            && !state.capabilities.flag_enabled("setdefaultversionid")
        {
            return Err(RegistryError::bad_request("setdefaultversionid is disabled"));
        }
        let op = WriteOp::new(tx)?;
        // resolve borrows the model; clone keeps the borrow local to this
        // frame while write helpers re-look-up what they need.
        let model = state.model.clone();
        let target = self.resolve(&model, &req.path)?;
        match (req.method, target) {
            (Method::Put | Method::Patch, TargetKind::Root) => {
                require_mutable(&state, "entities")?;
                let patch = req.method == Method::Patch;
                let mut body = body_object(req)?;
                let mut root = Entity::require(tx, "", EntityKind::Registry)?;
                let supplied = take_epoch(&mut body)?;
                op.check_epoch(&root, supplied)?;
                take_id(&mut body, "registryid", root.string("registryid").unwrap_or(""))?;
                if let Some(caps_body) = body.remove("capabilities") {
                    require_mutable(&state, "capabilities")?;
                    let caps = Capabilities::from_json(&caps_body)?;
                    root.set_save(tx, "#capabilities", PropValue::String(caps.to_json().to_string()))?;
                }
                body.remove("model");
                if let Some(source) = body.remove("modelsource") {
                    require_mutable(&state, "model")?;
                    self.swap_model(&op, &mut root, &model, &source)?;
                }
                let group_keys: Vec<String> = model.groups.keys().cloned().collect();
                let mut handled: Vec<&str> = vec!["specversion", "registryid"];
                for key in &group_keys {
                    handled.push(key.as_str());
                }
                let spec = merge_specs(registry_spec_attrs(&group_keys), &model.attributes);
                apply_attrs(&op, &mut root, &spec, &body, patch, &handled)?;
                for plural in &group_keys {
                    if let Some(members) = body.get(plural.as_str()) {
                        let gmodel = model.group(plural).expect("declared group type");
                        let members = members.as_object().ok_or_else(|| {
                            RegistryError::bad_request(format!("\"{plural}\" must be a map"))
                        })?;
                        for (gid, gbody) in members {
                            self.upsert_group(&op, &model, gmodel, gid, gbody, false)?;
                        }
                    }
                }
                op.bump(&mut root)?;
                self.store_read_back(tx, "", 200)
            }
            (Method::Put | Method::Patch, TargetKind::Capabilities) => {
                require_api(&state, "/capabilities")?;
                require_mutable(&state, "capabilities")?;
                let body = req
                    .body
                    .clone()
                    .ok_or_else(|| RegistryError::bad_request("a capabilities body is required"))?;
                let effective = if req.method == Method::Patch {
                    merge_objects(state.capabilities.to_json(), body)
                } else {
                    body
                };
                let caps = Capabilities::from_json(&effective)?;
                let mut root = Entity::require(tx, "", EntityKind::Registry)?;
                root.set_save(tx, "#capabilities", PropValue::String(caps.to_json().to_string()))?;
                op.bump(&mut root)?;
                Ok(ApiResponse::ok(caps.to_json()))
            }
            (Method::Put, TargetKind::ModelSource) => {
                require_api(&state, "/modelsource")?;
                require_mutable(&state, "model")?;
                let source = req
                    .body
                    .clone()
                    .ok_or_else(|| RegistryError::bad_request("a model body is required"))?;
                let mut root = Entity::require(tx, "", EntityKind::Registry)?;
                self.swap_model(&op, &mut root, &model, &source)?;
                op.bump(&mut root)?;
                Ok(ApiResponse::ok(source))
            }
            (Method::Post, TargetKind::GroupColl(gmodel)) => {
                require_mutable(&state, "entities")?;
                let body = body_object(req)?;
                let mut out = Map::new();
                for (gid, gbody) in &body {
                    self.upsert_group(&op, &model, gmodel, gid, gbody, false)?;
                    out.insert(gid.clone(), Value::Null);
                }
                let state = Self::load_state(tx)?;
                let opts = ReadOptions {
                    base_url: self.base_url.clone(),
                    ..Default::default()
                };
                let ctx = self.render_ctx(&opts, &state, "");
                for (gid, slot) in out.iter_mut() {
                    let gpath = group_path(&gmodel.plural, gid);
                    let node = materialize_group(tx, &model, gmodel, &gpath)?;
                    *slot = render_node(&node, &ctx, &[]);
                }
                Ok(ApiResponse::ok(Value::Object(out)))
            }
            (Method::Put | Method::Patch, TargetKind::Group(gmodel, gid)) => {
                require_mutable(&state, "entities")?;
                let body = req.body.clone().unwrap_or_else(|| json!({}));
                let created =
                    self.upsert_group(&op, &model, gmodel, &gid, &body, req.method == Method::Patch)?;
                let gpath = group_path(&gmodel.plural, &gid);
                self.store_read_back(tx, &gpath, if created { 201 } else { 200 })
            }
            (Method::Delete, TargetKind::Group(gmodel, gid)) => {
                require_mutable(&state, "entities")?;
                let gpath = group_path(&gmodel.plural, &gid);
                let group = Entity::require(tx, &gpath, EntityKind::Group)?;
                op.check_epoch(&group, req.params.epoch)?;
                tx.remove_tree(&gpath)?;
                op.bump_ancestors(&gpath)?;
                Ok(ApiResponse::no_content())
            }
            (Method::Delete, TargetKind::GroupColl(gmodel)) => {
                require_mutable(&state, "entities")?;
                self.delete_collection(
                    &op,
                    req,
                    &format!("{}/", gmodel.plural),
                    EntityKind::Group,
                )?;
                Ok(ApiResponse::no_content())
            }
            (Method::Post, TargetKind::ResourceColl(gmodel, rmodel, gid)) => {
                require_mutable(&state, "entities")?;
                self.ensure_group(&op, &model, gmodel, &gid)?;
                let body = body_object(req)?;
                let mut ids = Vec::new();
                for (rid, rbody) in &body {
                    self.upsert_resource(
                        &op,
                        &model,
                        gmodel,
                        rmodel,
                        &gid,
                        rid,
                        rbody,
                        false,
                        Method::Put,
                        &DefaultDirective::Unchanged,
                    )?;
                    ids.push(rid.clone());
                }
                let mut out = Map::new();
                let state = Self::load_state(tx)?;
                let opts = ReadOptions {
                    base_url: self.base_url.clone(),
                    ..Default::default()
                };
                let ctx = self.render_ctx(&opts, &state, "");
                for rid in ids {
                    let rpath = resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid);
                    let node = materialize_resource(tx, &model, gmodel, rmodel, &rpath)?;
                    out.insert(rid, render_node(&node, &ctx, &[]));
                }
                Ok(ApiResponse::ok(Value::Object(out)))
            }
            (Method::Put | Method::Patch | Method::Post, TargetKind::Resource(gmodel, rmodel, gid, rid)) => {
                require_mutable(&state, "entities")?;
                self.ensure_group(&op, &model, gmodel, &gid)?;
                let body = req.body.clone().unwrap_or_else(|| json!({}));
                let directive = directive_from_params(req)?;
                let created = self.upsert_resource(
                    &op,
                    &model,
                    gmodel,
                    rmodel,
                    &gid,
                    &rid,
                    &body,
                    req.method == Method::Patch,
                    req.method,
                    &directive,
                )?;
                let rpath = resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid);
                self.store_read_back(tx, &rpath, if created { 201 } else { 200 })
            }
            (Method::Delete, TargetKind::Resource(gmodel, rmodel, gid, rid)) => {
                require_mutable(&state, "entities")?;
                let rpath = resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid);
                if !tx.exists(&rpath)? {
                    return Err(RegistryError::not_found(xid_of(&rpath)));
                }
                let ctx = ResourceCtx {
                    gmodel,
                    rmodel,
                    path: rpath.clone(),
                    rid: rid.clone(),
                };
                let meta = Entity::require(tx, &ctx.meta_path(), EntityKind::Meta)?;
                check_not_readonly(&ctx, &meta)?;
                if let Some(supplied) = req.params.epoch {
                    let node = materialize_resource(tx, &model, gmodel, rmodel, &rpath)?;
                    let current = node
                        .default_vid
                        .as_ref()
                        .and_then(|vid| node.child("versions", vid))
                        .map(|v| v.entity.epoch())
                        .unwrap_or(meta.epoch());
                    if supplied != current {
                        return Err(RegistryError::MismatchedEpoch {
                            xid: xid_of(&rpath),
                            supplied,
                            current,
                        });
                    }
                }
                tx.remove_tree(&rpath)?;
                op.bump_ancestors(&rpath)?;
                Ok(ApiResponse::no_content())
            }
            (Method::Delete, TargetKind::ResourceColl(gmodel, rmodel, gid)) => {
                require_mutable(&state, "entities")?;
                let gpath = group_path(&gmodel.plural, &gid);
                if !tx.exists(&gpath)? {
                    return Err(RegistryError::not_found(xid_of(&gpath)));
                }
                self.delete_collection(
                    &op,
                    req,
                    &format!("{gpath}/{}/", rmodel.plural),
                    EntityKind::Resource,
                )?;
                Ok(ApiResponse::no_content())
            }
            (Method::Put | Method::Patch, TargetKind::Meta(gmodel, rmodel, gid, rid)) => {
                require_mutable(&state, "entities")?;
                self.ensure_group(&op, &model, gmodel, &gid)?;
                let body = body_object(req)?;
                self.update_meta(
                    &op,
                    &model,
                    gmodel,
                    rmodel,
                    &gid,
                    &rid,
                    body,
                    req.method == Method::Patch,
                    None,
                )?;
                let rpath = resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid);
                let state = Self::load_state(tx)?;
                let opts = ReadOptions {
                    base_url: self.base_url.clone(),
                    ..Default::default()
                };
                let node = materialize_resource(tx, &model, gmodel, rmodel, &rpath)?;
                let meta = node
                    .meta
                    .as_deref()
                    .ok_or_else(|| RegistryError::not_found(xid_of(&rpath)))?;
                let ctx = self.render_ctx(&opts, &state, &meta.display_path);
                Ok(ApiResponse::ok(render_node(meta, &ctx, &[])))
            }
            (Method::Post, TargetKind::VersionColl(gmodel, rmodel, gid, rid)) => {
                require_mutable(&state, "entities")?;
                self.ensure_group(&op, &model, gmodel, &gid)?;
                let ctx = ResourceCtx {
                    gmodel,
                    rmodel,
                    path: resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid),
                    rid: rid.clone(),
                };
                let mut meta = ensure_resource(&op, &ctx)?;
                check_not_readonly(&ctx, &meta)?;
                require_owning(&ctx, &meta)?;
                let body = body_object(req)?;
                let mut ids = Vec::new();
                for (vid, vbody) in &body {
                    let version = upsert_version(&op, &ctx, &mut meta, Some(vid), vbody, false)?;
                    ids.push(version.path.clone());
                }
                let directive = directive_from_params(req)?;
                apply_default_directive(&op, &ctx, &mut meta, &directive)?;
                op.bump_ancestors(&ctx.path)?;
                let node = materialize_resource(tx, &model, gmodel, rmodel, &ctx.path)?;
                let state = Self::load_state(tx)?;
                let opts = ReadOptions {
                    base_url: self.base_url.clone(),
                    ..Default::default()
                };
                let rctx = self.render_ctx(&opts, &state, "");
                let mut out = Map::new();
                for vpath in ids {
                    let vid = vpath.rsplit('/').next().unwrap_or_default();
                    if let Some(version) = node.child("versions", vid) {
                        out.insert(vid.to_string(), render_node(version, &rctx, &[]));
                    }
                }
                Ok(ApiResponse::ok(Value::Object(out)))
            }
            (Method::Put | Method::Patch, TargetKind::Version(gmodel, rmodel, gid, rid, vid)) => {
                require_mutable(&state, "entities")?;
                self.ensure_group(&op, &model, gmodel, &gid)?;
                let ctx = ResourceCtx {
                    gmodel,
                    rmodel,
                    path: resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid),
                    rid: rid.clone(),
                };
                let mut meta = ensure_resource(&op, &ctx)?;
                check_not_readonly(&ctx, &meta)?;
                require_owning(&ctx, &meta)?;
                let existed = tx.exists(&ctx.version_path(&vid))?;
                let body = req.body.clone().unwrap_or_else(|| json!({}));
                upsert_version(
                    &op,
                    &ctx,
                    &mut meta,
                    Some(&vid),
                    &body,
                    req.method == Method::Patch,
                )?;
                let directive = directive_from_params(req)?;
                apply_default_directive(&op, &ctx, &mut meta, &directive)?;
                op.bump_ancestors(&ctx.path)?;
                let vpath = ctx.version_path(&vid);
                self.store_read_back(tx, &vpath, if existed { 200 } else { 201 })
            }
            (Method::Delete, TargetKind::Version(gmodel, rmodel, gid, rid, vid)) => {
                require_mutable(&state, "entities")?;
                let ctx = ResourceCtx {
                    gmodel,
                    rmodel,
                    path: resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid),
                    rid: rid.clone(),
                };
                let mut meta = Entity::require(tx, &ctx.meta_path(), EntityKind::Meta)?;
                check_not_readonly(&ctx, &meta)?;
                require_owning(&ctx, &meta)?;
                delete_version(&op, &ctx, &mut meta, &vid, req.params.epoch)?;
                Ok(ApiResponse::no_content())
            }
            (Method::Delete, TargetKind::VersionColl(gmodel, rmodel, gid, rid)) => {
                require_mutable(&state, "entities")?;
                let ctx = ResourceCtx {
                    gmodel,
                    rmodel,
                    path: resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid),
                    rid: rid.clone(),
                };
                let mut meta = Entity::require(tx, &ctx.meta_path(), EntityKind::Meta)?;
                check_not_readonly(&ctx, &meta)?;
                require_owning(&ctx, &meta)?;
                match &req.body {
                    None => {
                        let ids = crate::commit::version_ids(tx, &ctx)?;
                        for vid in ids {
                            if tx.exists(&ctx.version_path(&vid))? {
                                delete_version(&op, &ctx, &mut meta, &vid, None)?;
                            }
                        }
                    }
                    Some(body) => {
                        let body = body.as_object().ok_or_else(|| {
                            RegistryError::bad_request("a DELETE body must be a map of ids")
                        })?;
                        for (vid, entry) in body {
                            let supplied = entry
                                .as_object()
                                .and_then(|e| e.get("epoch"))
                                .and_then(Value::as_u64);
                            if tx.exists(&ctx.version_path(vid))? {
                                delete_version(&op, &ctx, &mut meta, vid, supplied)?;
                            } else {
                                return Err(RegistryError::not_found(format!(
                                    "{}/versions/{vid}",
                                    xid_of(&ctx.path)
                                )));
                            }
                        }
                    }
                }
                Ok(ApiResponse::no_content())
            }
            (Method::Delete, TargetKind::Root) => Err(RegistryError::bad_request(
                "the registry root cannot be deleted",
            )),
            _ => Err(RegistryError::bad_request(format!(
                "method not supported for '/{}'",
                req.path
            ))),
        }
    }

    fn swap_model(
        &self,
        op: &WriteOp<'_>,
        root: &mut Entity,
        old_model: &RegistryModel,
        source: &Value,
    ) -> Result<()> {
        let new_model = RegistryModel::from_source(source)?;
        // Entities of group/resource types that vanished from the model go
        // with it.
        for (plural, old_group) in &old_model.groups {
            match new_model.group(plural) {
                None => {
                    for gpath in op.tx.children(&format!("{plural}/"), EntityKind::Group)? {
                        op.tx.remove_tree(&gpath)?;
                    }
                }
                Some(new_group) => {
                    for rplural in old_group.resources.keys() {
                        if !new_group.resources.contains_key(rplural) {
                            for gpath in
                                op.tx.children(&format!("{plural}/"), EntityKind::Group)?
                            {
                                for rpath in op.tx.children(
                                    &format!("{gpath}/{rplural}/"),
                                    EntityKind::Resource,
                                )? {
                                    op.tx.remove_tree(&rpath)?;
                                }
                            }
                        }
                    }
                }
            }
        }
        root.set_save(
            op.tx,
            "#modelsource",
            PropValue::String(source.to_string()),
        )?;
        info!("model source replaced");
        Ok(())
    }

    fn ensure_group(
        &self,
        op: &WriteOp<'_>,
        model: &RegistryModel,
        gmodel: &GroupModel,
        gid: &str,
    ) -> Result<()> {
        let gpath = group_path(&gmodel.plural, gid);
        if op.tx.exists(&gpath)? {
            return Ok(());
        }
        self.upsert_group(op, model, gmodel, gid, &json!({}), false)?;
        Ok(())
    }

    fn upsert_group(
        &self,
        op: &WriteOp<'_>,
        model: &RegistryModel,
        gmodel: &GroupModel,
        gid: &str,
        body: &Value,
        patch: bool,
    ) -> Result<bool> {
        let mut body = match body {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(RegistryError::bad_request(format!(
                    "group body must be an object: {other}"
                )))
            }
        };
        let gpath = group_path(&gmodel.plural, gid);
        let supplied = take_epoch(&mut body)?;
        take_id(&mut body, &gmodel.id_attr(), gid)?;
        let resource_keys: Vec<String> = gmodel.resources.keys().cloned().collect();
        let mut handled: Vec<&str> = Vec::new();
        for key in &resource_keys {
            handled.push(key.as_str());
        }
        let spec = merge_specs(
            group_spec_attrs(&gmodel.singular, &resource_keys),
            &gmodel.attributes,
        );
        let (mut group, created) = match Entity::find(op.tx, &gpath, EntityKind::Group)? {
            Some(group) => {
                op.check_epoch(&group, supplied)?;
                (group, false)
            }
            None => {
                validate_id(gid)?;
                let mut group = Entity::create(op.tx, &gpath, EntityKind::Group)?;
                group.set_save(op.tx, &gmodel.id_attr(), PropValue::String(gid.to_string()))?;
                (group, true)
            }
        };
        apply_attrs(op, &mut group, &spec, &body, patch, &handled)?;
        for rplural in &resource_keys {
            if let Some(members) = body.get(rplural.as_str()) {
                let rmodel = gmodel.resources.get(rplural).expect("declared resource type");
                let members = members.as_object().ok_or_else(|| {
                    RegistryError::bad_request(format!("\"{rplural}\" must be a map"))
                })?;
                for (rid, rbody) in members {
                    self.upsert_resource(
                        op,
                        model,
                        gmodel,
                        rmodel,
                        gid,
                        rid,
                        rbody,
                        false,
                        Method::Put,
                        &DefaultDirective::Unchanged,
                    )?;
                }
            }
        }
        if created {
            op.stamp_created(&mut group)?;
        } else {
            op.bump(&mut group)?;
        }
        op.bump_ancestors(&gpath)?;
        Ok(created)
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert_resource(
        &self,
        op: &WriteOp<'_>,
        model: &RegistryModel,
        gmodel: &GroupModel,
        rmodel: &ResourceModel,
        gid: &str,
        rid: &str,
        body: &Value,
        patch: bool,
        method: Method,
        directive: &DefaultDirective,
    ) -> Result<bool> {
        let mut body = match body {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(RegistryError::bad_request(format!(
                    "resource body must be an object: {other}"
                )))
            }
        };
        validate_id(rid)?;
        let rpath = resource_path(&gmodel.plural, gid, &rmodel.plural, rid);
        let ctx = ResourceCtx {
            gmodel,
            rmodel,
            path: rpath.clone(),
            rid: rid.to_string(),
        };
        let created = !op.tx.exists(&rpath)?;
        let mut meta = ensure_resource(op, &ctx)?;
        check_not_readonly(&ctx, &meta)?;

        let meta_block = body.remove("meta");
        let mut versions_block = body.remove("versions");
        body.remove("metaurl");
        body.remove("versionsurl");
        body.remove("versionscount");

        let mut versions_consumed = false;
        if let Some(meta_block) = meta_block {
            let meta_body = meta_block.as_object().cloned().ok_or_else(|| {
                RegistryError::bad_request("\"meta\" must be an object")
            })?;
            let replacement = versions_block
                .as_ref()
                .and_then(Value::as_object)
                .cloned();
            let consumed = self.update_meta(
                op,
                model,
                gmodel,
                rmodel,
                gid,
                rid,
                meta_body,
                patch,
                replacement.as_ref(),
            )?;
            if consumed {
                versions_block = None;
                versions_consumed = true;
            }
            meta.refresh(op.tx)?;
        }

        if meta.leaf("xref").is_some() {
            // A mirroring resource rejects version mutations; operating on
            // the target is the client's job.
            if !body.is_empty() || versions_block.is_some() {
                return Err(RegistryError::bad_request(format!(
                    "'{}' mirrors another resource; version content cannot be changed here",
                    xid_of(&rpath)
                )));
            }
            op.bump_ancestors(&rpath)?;
            return Ok(created);
        }

        if let Some(versions_block) = versions_block {
            let members = versions_block.as_object().ok_or_else(|| {
                RegistryError::bad_request("\"versions\" must be a map")
            })?;
            for (vid, vbody) in members {
                upsert_version(op, &ctx, &mut meta, Some(vid), vbody, false)?;
            }
            if !body.is_empty() {
                // Resource-level attributes and an explicit versions map in
                // one request are ambiguous about which version they
                // address.
                return Err(RegistryError::bad_request(
                    "resource attributes and \"versions\" cannot be combined",
                ));
            }
        } else if versions_consumed {
            if !body.is_empty() {
                return Err(RegistryError::bad_request(
                    "resource attributes and \"versions\" cannot be combined",
                ));
            }
        } else {
            // Resource-level sugar: address the default version.
            let target_vid = match method {
                Method::Post => None,
                _ => meta.string("defaultversionid").map(str::to_string),
            };
            upsert_version(
                op,
                &ctx,
                &mut meta,
                target_vid.as_deref(),
                &Value::Object(body),
                patch,
            )?;
        }
        apply_default_directive(op, &ctx, &mut meta, directive)?;
        op.bump_ancestors(&rpath)?;
        Ok(created)
    }

    #[allow(clippy::too_many_arguments)]
    fn update_meta(
        &self,
        op: &WriteOp<'_>,
        model: &RegistryModel,
        gmodel: &GroupModel,
        rmodel: &ResourceModel,
        gid: &str,
        rid: &str,
        mut body: Map<String, Value>,
        patch: bool,
        replacement_versions: Option<&Map<String, Value>>,
    ) -> Result<bool> {
        let ctx = ResourceCtx {
            gmodel,
            rmodel,
            path: resource_path(&gmodel.plural, gid, &rmodel.plural, rid),
            rid: rid.to_string(),
        };
        validate_id(rid)?;
        let mut meta = ensure_resource(op, &ctx)?;
        let supplied = take_epoch(&mut body)?;
        op.check_epoch(&meta, supplied)?;
        take_id(&mut body, &rmodel.id_attr(), rid)?;
        body.remove("defaultversionurl");
        validate_meta_enums(&body)?;

        let spec = meta_spec_attrs(&rmodel.singular);
        let handled = [
            "xref",
            "defaultversionid",
            "defaultversionsticky",
            "modifiedat",
            "createdat",
        ];

        let mut consumed = false;
        match body.get("xref").cloned() {
            Some(Value::String(xref)) => {
                crate::xref::check_extra_attrs(&ctx, &body)?;
                let target =
                    crate::xref::parse_target(model, gmodel, &rmodel.plural, &xref)?;
                apply_attrs(op, &mut meta, &spec, &body, patch, &handled)?;
                crate::xref::set_xref(op, &ctx, &mut meta, &target)?;
            }
            Some(Value::Null) => {
                let directive = meta_directive(&body, patch, &meta)?;
                body.remove("xref");
                apply_attrs(op, &mut meta, &spec, &body, patch, &handled)?;
                consumed =
                    crate::xref::clear_xref(op, &ctx, &mut meta, replacement_versions, &directive)?;
                if !consumed {
                    // Clearing an already-owning meta is a plain update.
                    apply_default_directive(op, &ctx, &mut meta, &directive)?;
                }
                op.bump(&mut meta)?;
            }
            Some(other) => {
                return Err(RegistryError::MalformedXref {
                    xref: other.to_string(),
                    reason: "must be a string or null".to_string(),
                })
            }
            None => {
                if meta.leaf("xref").is_some() {
                    crate::xref::check_extra_attrs(&ctx, &body)?;
                    if !patch {
                        // Replacing the meta without restating the xref
                        // clears it.
                        let directive = meta_directive(&body, patch, &meta)?;
                        apply_attrs(op, &mut meta, &spec, &body, patch, &handled)?;
                        consumed = crate::xref::clear_xref(
                            op,
                            &ctx,
                            &mut meta,
                            replacement_versions,
                            &directive,
                        )?;
                        op.bump(&mut meta)?;
                    } else {
                        apply_attrs(op, &mut meta, &spec, &body, patch, &handled)?;
                        op.bump(&mut meta)?;
                    }
                } else {
                    let directive = meta_directive(&body, patch, &meta)?;
                    apply_attrs(op, &mut meta, &spec, &body, patch, &handled)?;
                    apply_default_directive(op, &ctx, &mut meta, &directive)?;
                    op.bump(&mut meta)?;
                }
            }
        }
        // A replace that omitted the spec-defaulted attributes restores
        // them rather than leaving holes.
        if meta.leaf("readonly").is_none() {
            meta.set_save(op.tx, "readonly", PropValue::Bool(false))?;
        }
        if meta.leaf("compatibility").is_none() {
            meta.set_save(op.tx, "compatibility", PropValue::String("none".into()))?;
        }
        op.bump_ancestors(&ctx.path)?;
        Ok(consumed)
    }

    fn delete_collection(
        &self,
        op: &WriteOp<'_>,
        req: &ApiRequest,
        prefix: &str,
        kind: EntityKind,
    ) -> Result<()> {
        match &req.body {
            None => {
                for path in op.tx.children(prefix, kind)? {
                    op.tx.remove_tree(&path)?;
                    op.bump_ancestors(&path)?;
                }
            }
            Some(body) => {
                let body = body.as_object().ok_or_else(|| {
                    RegistryError::bad_request("a DELETE body must be a map of ids")
                })?;
                for (id, entry) in body {
                    let path = format!("{prefix}{id}");
                    let entity = Entity::find(op.tx, &path, kind)?
                        .ok_or_else(|| RegistryError::not_found(xid_of(&path)))?;
                    let supplied = entry
                        .as_object()
                        .and_then(|e| e.get("epoch"))
                        .and_then(Value::as_u64);
                    op.check_epoch(&entity, supplied)?;
                    op.tx.remove_tree(&path)?;
                    op.bump_ancestors(&path)?;
                }
            }
        }
        Ok(())
    }

    /// Render the freshly written entity the way a follow-up GET would.
    fn store_read_back(&self, tx: &Tx<'_>, path: &str, status: u16) -> Result<ApiResponse> {
        let state = Self::load_state(tx)?;
        let opts = ReadOptions {
            base_url: self.base_url.clone(),
            ..Default::default()
        };
        let target = self.resolve(&state.model, path)?;
        let body = match target {
            TargetKind::Root => {
                let tree = materialize_registry(tx, &state.model)?;
                let ctx = self.render_ctx(&opts, &state, "");
                render_node(&tree, &ctx, &[])
            }
            TargetKind::Group(gmodel, gid) => {
                let gpath = group_path(&gmodel.plural, &gid);
                let node = materialize_group(tx, &state.model, gmodel, &gpath)?;
                let ctx = self.render_ctx(&opts, &state, &gpath);
                render_node(&node, &ctx, &[])
            }
            TargetKind::Resource(gmodel, rmodel, gid, rid) => {
                let rpath = resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid);
                let node = materialize_resource(tx, &state.model, gmodel, rmodel, &rpath)?;
                let ctx = self.render_ctx(&opts, &state, &rpath);
                render_node(&node, &ctx, &[])
            }
            TargetKind::Version(gmodel, rmodel, gid, rid, vid) => {
                let rpath = resource_path(&gmodel.plural, &gid, &rmodel.plural, &rid);
                let node = materialize_resource(tx, &state.model, gmodel, rmodel, &rpath)?;
                let version = node.child("versions", &vid).ok_or_else(|| {
                    RegistryError::not_found(format!("{}/versions/{vid}", xid_of(&rpath)))
                })?;
                let ctx = self.render_ctx(&opts, &state, &version.display_path);
                render_node(version, &ctx, &[])
            }
            _ => Value::Null,
        };
        Ok(ApiResponse {
            status,
            body: Some(body),
        })
    }
}

/// `compatibility` and `compatibilityauthority` are recorded, never
/// enforced, but the recorded values are still enum-checked.
fn validate_meta_enums(body: &Map<String, Value>) -> Result<()> {
    const COMPATIBILITY: &[&str] = &[
        "none",
        "backward",
        "backward_transitive",
        "forward",
        "forward_transitive",
        "full",
        "full_transitive",
    ];
    const AUTHORITY: &[&str] = &["external", "server"];
    if let Some(Value::String(value)) = body.get("compatibility") {
        if !COMPATIBILITY.contains(&value.as_str()) {
            return Err(RegistryError::bad_request(format!(
                "unknown \"compatibility\" value: \"{value}\""
            )));
        }
    }
    if let Some(Value::String(value)) = body.get("compatibilityauthority") {
        if !AUTHORITY.contains(&value.as_str()) {
            return Err(RegistryError::bad_request(format!(
                "unknown \"compatibilityauthority\" value: \"{value}\""
            )));
        }
    }
    Ok(())
}

fn merge_specs(
    mut base: BTreeMap<String, Attribute>,
    custom: &BTreeMap<String, Attribute>,
) -> BTreeMap<String, Attribute> {
    for (name, attr) in custom {
        base.insert(name.clone(), attr.clone());
    }
    base
}

fn require_api(state: &State, api: &str) -> Result<()> {
    if state.capabilities.api_enabled(api) {
        Ok(())
    } else {
        Err(RegistryError::not_found(api))
    }
}

fn require_mutable(state: &State, what: &str) -> Result<()> {
    if state.capabilities.is_mutable(what) {
        Ok(())
    } else {
        Err(RegistryError::bad_request(format!(
            "\"{what}\" is not mutable on this registry"
        )))
    }
}

fn require_owning(ctx: &ResourceCtx<'_>, meta: &Entity) -> Result<()> {
    if meta.leaf("xref").is_some() {
        return Err(RegistryError::bad_request(format!(
            "'{}' mirrors another resource; operate on the xref target instead",
            xid_of(&ctx.path)
        )));
    }
    Ok(())
}

fn body_object(req: &ApiRequest) -> Result<Map<String, Value>> {
    match &req.body {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(other) => Err(RegistryError::bad_request(format!(
            "request body must be a JSON object: {other}"
        ))),
    }
}

fn directive_from_params(req: &ApiRequest) -> Result<DefaultDirective> {
    match req.params.setdefaultversionid.as_deref() {
        None => Ok(DefaultDirective::Unchanged),
        Some("null") => Ok(DefaultDirective::Unpin),
        Some("") => Err(RegistryError::bad_request(
            "setdefaultversionid requires a versionid",
        )),
        Some(vid) => Ok(DefaultDirective::Pin(vid.to_string())),
    }
}

/// Derive the pin/unpin directive from a meta body.
fn meta_directive(
    body: &Map<String, Value>,
    patch: bool,
    meta: &Entity,
) -> Result<DefaultDirective> {
    let sticky = body.get("defaultversionsticky");
    let id = body.get("defaultversionid");
    let sticky_flag = match sticky {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::Null) => Some(false),
        None => None,
        Some(other) => {
            return Err(RegistryError::bad_request(format!(
                "\"defaultversionsticky\" must be a boolean: {other}"
            )))
        }
    };
    let id_value = match id {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => {
            return Err(RegistryError::bad_request(format!(
                "\"defaultversionid\" must be a string: {other}"
            )))
        }
    };
    match sticky_flag {
        Some(true) => {
            let vid = id_value
                .or_else(|| meta.string("defaultversionid").map(str::to_string))
                .ok_or_else(|| {
                    RegistryError::bad_request(
                        "\"defaultversionsticky\" requires a \"defaultversionid\"",
                    )
                })?;
            Ok(DefaultDirective::Pin(vid))
        }
        Some(false) => Ok(DefaultDirective::Unpin),
        None => {
            if patch {
                // A bare defaultversionid in a PATCH pins it.
                match id_value {
                    Some(vid) => Ok(DefaultDirective::Pin(vid)),
                    None => Ok(DefaultDirective::Unchanged),
                }
            } else {
                // PUT replaces: omitting the pin clears it.
                match id_value {
                    Some(vid) => Ok(DefaultDirective::Pin(vid)),
                    None => Ok(DefaultDirective::Unpin),
                }
            }
        }
    }
}

fn merge_objects(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                if value.is_null() {
                    base.remove(&key);
                } else {
                    base.insert(key, value);
                }
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

/// Which level inline paths are resolved against.
enum InlineLevel<'m> {
    Registry,
    Group(&'m GroupModel),
    Resource(&'m ResourceModel),
    Versions(&'m ResourceModel),
}

fn validate_inline_paths(
    model: &RegistryModel,
    level: InlineLevel<'_>,
    inline: &InlineSet,
) -> Result<()> {
    for path in &inline.paths {
        let ok = match &level {
            InlineLevel::Registry => validate_registry_inline(model, path),
            InlineLevel::Group(gmodel) => validate_group_inline(gmodel, path),
            InlineLevel::Resource(rmodel) => validate_resource_inline(rmodel, path),
            InlineLevel::Versions(rmodel) => {
                path.len() == 1 && path[0] == rmodel.singular
            }
        };
        if !ok {
            return Err(RegistryError::bad_request(format!(
                "invalid inline path: '{}'",
                path.join(".")
            )));
        }
    }
    Ok(())
}

fn validate_registry_inline(model: &RegistryModel, path: &[String]) -> bool {
    if path.len() == 1 && matches!(path[0].as_str(), "capabilities" | "model" | "modelsource") {
        return true;
    }
    let Some(gmodel) = model.group(&path[0]) else {
        return false;
    };
    path.len() == 1 || validate_group_inline(gmodel, &path[1..])
}

fn validate_group_inline(gmodel: &GroupModel, path: &[String]) -> bool {
    let Some(rmodel) = gmodel.resources.get(&path[0]) else {
        return false;
    };
    path.len() == 1 || validate_resource_inline(rmodel, &path[1..])
}

fn validate_resource_inline(rmodel: &ResourceModel, path: &[String]) -> bool {
    match path[0].as_str() {
        "meta" => path.len() == 1,
        "versions" => path.len() == 1 || (path.len() == 2 && path[1] == rmodel.singular),
        name => path.len() == 1 && name == rmodel.singular,
    }
}
