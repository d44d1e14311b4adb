//! Registry model: the read-only type/shape oracle the core validates
//! writes against.
//!
//! The authored `modelsource` document declares group types, resource types,
//! and custom attributes; the derived model merges those with the
//! spec-defined attributes every level always carries. The core consumes
//! the model when resolving paths, validating bodies, and serializing
//! entities — it never mutates it outside an explicit `modelsource` swap.
#![forbid(unsafe_code)]

mod attrs;

pub use attrs::{
    group_spec_attrs, meta_spec_attrs, registry_spec_attrs, version_spec_attrs, Attribute,
};

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{RegistryError, Result};
use crate::path::{validate_attr_name, validate_id};
use crate::value::{normalize_timestamp, PropValue};

/// Declared attribute types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrType {
    /// Any JSON value; type inferred at write time.
    Any,
    /// Homogeneous array of `item`.
    Array,
    /// Boolean.
    Boolean,
    /// 64-bit decimal.
    Decimal,
    /// Signed integer.
    Integer,
    /// String-keyed map of `item`.
    Map,
    /// Object with declared members.
    Object,
    /// String.
    String,
    /// RFC 3339 timestamp.
    Timestamp,
    /// Unsigned integer.
    UInteger,
    /// URL-valued string.
    Url,
    /// Registry external-id-valued string.
    Xid,
}

impl AttrType {
    /// Parse a declared type name.
    pub fn parse(name: &str) -> Result<AttrType> {
        Ok(match name {
            "any" => AttrType::Any,
            "array" => AttrType::Array,
            "boolean" => AttrType::Boolean,
            "decimal" => AttrType::Decimal,
            "integer" => AttrType::Integer,
            "map" => AttrType::Map,
            "object" => AttrType::Object,
            "string" => AttrType::String,
            "timestamp" => AttrType::Timestamp,
            "uinteger" => AttrType::UInteger,
            "url" => AttrType::Url,
            "xid" => AttrType::Xid,
            other => {
                return Err(RegistryError::bad_request(format!(
                    "unknown attribute type: '{other}'"
                )))
            }
        })
    }

    /// Declared name of this type.
    pub fn name(self) -> &'static str {
        match self {
            AttrType::Any => "any",
            AttrType::Array => "array",
            AttrType::Boolean => "boolean",
            AttrType::Decimal => "decimal",
            AttrType::Integer => "integer",
            AttrType::Map => "map",
            AttrType::Object => "object",
            AttrType::String => "string",
            AttrType::Timestamp => "timestamp",
            AttrType::UInteger => "uinteger",
            AttrType::Url => "url",
            AttrType::Xid => "xid",
        }
    }
}

/// A resource type declaration.
#[derive(Clone, Debug)]
pub struct ResourceModel {
    /// Collection name (`files`).
    pub plural: String,
    /// Instance/singular name (`file`), also the content attribute name.
    pub singular: String,
    /// Whether versions carry a document payload.
    pub hasdocument: bool,
    /// Retained version cap; 0 means unlimited.
    pub maxversions: u64,
    /// Whether clients may choose versionids.
    pub setversionid: bool,
    /// Whether clients may pin the default version.
    pub setdefaultversionsticky: bool,
    /// Custom version-level attributes.
    pub attributes: BTreeMap<String, Attribute>,
}

impl ResourceModel {
    /// Name of the id attribute for instances of this type.
    pub fn id_attr(&self) -> String {
        format!("{}id", self.singular)
    }
}

/// A group type declaration.
#[derive(Clone, Debug)]
pub struct GroupModel {
    /// Collection name (`dirs`).
    pub plural: String,
    /// Instance name (`dir`).
    pub singular: String,
    /// Custom group-level attributes.
    pub attributes: BTreeMap<String, Attribute>,
    /// Cross-type xref targets this group's resources may mirror,
    /// as `(group plural, resource plural)` pairs.
    pub ximportresources: Vec<(String, String)>,
    /// Resource types under this group type.
    pub resources: BTreeMap<String, ResourceModel>,
}

impl GroupModel {
    /// Name of the id attribute for instances of this type.
    pub fn id_attr(&self) -> String {
        format!("{}id", self.singular)
    }

    /// May a resource of `source` type under this group mirror a target of
    /// `(target_gplural, target_rplural)` type?
    pub fn may_xref(&self, source_rplural: &str, target_gplural: &str, target_rplural: &str) -> bool {
        if target_rplural == source_rplural && self.resources.contains_key(target_rplural) {
            return true;
        }
        self.ximportresources
            .iter()
            .any(|(g, r)| g == target_gplural && r == target_rplural)
    }
}

/// The derived registry model.
#[derive(Clone, Debug, Default)]
pub struct RegistryModel {
    /// Group types by plural name.
    pub groups: BTreeMap<String, GroupModel>,
    /// Custom registry-level attributes.
    pub attributes: BTreeMap<String, Attribute>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModel {
    #[serde(default)]
    groups: BTreeMap<String, RawGroup>,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGroup {
    #[serde(default)]
    plural: Option<String>,
    singular: String,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    ximportresources: Vec<String>,
    #[serde(default)]
    resources: BTreeMap<String, RawResource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    #[serde(default)]
    plural: Option<String>,
    singular: String,
    #[serde(default = "default_true")]
    hasdocument: bool,
    #[serde(default)]
    maxversions: u64,
    #[serde(default = "default_true")]
    setversionid: bool,
    #[serde(default = "default_true")]
    setdefaultversionsticky: bool,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl RegistryModel {
    /// Parse and validate an authored `modelsource` document.
    pub fn from_source(source: &serde_json::Value) -> Result<RegistryModel> {
        let raw: RawModel = serde_json::from_value(source.clone())
            .map_err(|e| RegistryError::bad_request(format!("invalid model: {e}")))?;
        let mut groups = BTreeMap::new();
        for (plural, raw_group) in raw.groups {
            validate_id(&plural)?;
            validate_id(&raw_group.singular)?;
            if let Some(declared) = &raw_group.plural {
                if declared != &plural {
                    return Err(RegistryError::bad_request(format!(
                        "group \"plural\" '{declared}' must match its key '{plural}'"
                    )));
                }
            }
            let mut resources = BTreeMap::new();
            for (rplural, raw_res) in raw_group.resources {
                validate_id(&rplural)?;
                validate_id(&raw_res.singular)?;
                if let Some(declared) = &raw_res.plural {
                    if declared != &rplural {
                        return Err(RegistryError::bad_request(format!(
                            "resource \"plural\" '{declared}' must match its key '{rplural}'"
                        )));
                    }
                }
                resources.insert(
                    rplural.clone(),
                    ResourceModel {
                        plural: rplural,
                        singular: raw_res.singular,
                        hasdocument: raw_res.hasdocument,
                        maxversions: raw_res.maxversions,
                        setversionid: raw_res.setversionid,
                        setdefaultversionsticky: raw_res.setdefaultversionsticky,
                        attributes: Attribute::parse_map(&raw_res.attributes)?,
                    },
                );
            }
            let mut ximports = Vec::new();
            for entry in &raw_group.ximportresources {
                let trimmed = entry.strip_prefix('/').ok_or_else(|| {
                    RegistryError::bad_request(format!(
                        "ximportresources entry '{entry}' must start with '/'"
                    ))
                })?;
                let mut parts = trimmed.split('/');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(g), Some(r), None) if !g.is_empty() && !r.is_empty() => {
                        ximports.push((g.to_string(), r.to_string()));
                    }
                    _ => {
                        return Err(RegistryError::bad_request(format!(
                            "ximportresources entry '{entry}' must be of the form /GROUPS/RESOURCES"
                        )))
                    }
                }
            }
            groups.insert(
                plural.clone(),
                GroupModel {
                    plural,
                    singular: raw_group.singular,
                    attributes: Attribute::parse_map(&raw_group.attributes)?,
                    ximportresources: ximports,
                    resources,
                },
            );
        }
        // ximportresources targets must exist once the whole model is known.
        for group in groups.values() {
            for (g, r) in &group.ximportresources {
                let ok = groups
                    .get(g)
                    .map(|target| target.resources.contains_key(r))
                    .unwrap_or(false);
                if !ok {
                    return Err(RegistryError::bad_request(format!(
                        "ximportresources target '/{g}/{r}' is not declared in the model"
                    )));
                }
            }
        }
        Ok(RegistryModel {
            groups,
            attributes: Attribute::parse_map(&raw.attributes)?,
        })
    }

    /// Look up a group type by plural name.
    pub fn group(&self, plural: &str) -> Option<&GroupModel> {
        self.groups.get(plural)
    }

    /// Look up a resource type.
    pub fn resource(&self, gplural: &str, rplural: &str) -> Option<&ResourceModel> {
        self.groups.get(gplural).and_then(|g| g.resources.get(rplural))
    }

    /// Render the derived model document: authored declarations merged with
    /// the spec-defined attributes each level always carries.
    pub fn to_json(&self) -> serde_json::Value {
        let mut root = serde_json::Map::new();
        root.insert(
            "attributes".into(),
            attrs_json(&registry_spec_attrs(&self.groups_keys()), &self.attributes),
        );
        let mut groups = serde_json::Map::new();
        for (plural, group) in &self.groups {
            let mut gdoc = serde_json::Map::new();
            gdoc.insert("plural".into(), serde_json::Value::String(plural.clone()));
            gdoc.insert(
                "singular".into(),
                serde_json::Value::String(group.singular.clone()),
            );
            if !group.ximportresources.is_empty() {
                gdoc.insert(
                    "ximportresources".into(),
                    serde_json::Value::Array(
                        group
                            .ximportresources
                            .iter()
                            .map(|(g, r)| serde_json::Value::String(format!("/{g}/{r}")))
                            .collect(),
                    ),
                );
            }
            gdoc.insert(
                "attributes".into(),
                attrs_json(
                    &group_spec_attrs(&group.singular, &group.resources_keys()),
                    &group.attributes,
                ),
            );
            let mut resources = serde_json::Map::new();
            for (rplural, res) in &group.resources {
                let mut rdoc = serde_json::Map::new();
                rdoc.insert("plural".into(), serde_json::Value::String(rplural.clone()));
                rdoc.insert(
                    "singular".into(),
                    serde_json::Value::String(res.singular.clone()),
                );
                rdoc.insert("hasdocument".into(), serde_json::Value::Bool(res.hasdocument));
                rdoc.insert("maxversions".into(), serde_json::Value::from(res.maxversions));
                rdoc.insert("setversionid".into(), serde_json::Value::Bool(res.setversionid));
                rdoc.insert(
                    "setdefaultversionsticky".into(),
                    serde_json::Value::Bool(res.setdefaultversionsticky),
                );
                rdoc.insert(
                    "attributes".into(),
                    attrs_json(&version_spec_attrs(&res.singular), &res.attributes),
                );
                rdoc.insert(
                    "metaattributes".into(),
                    attrs_json(&meta_spec_attrs(&res.singular), &BTreeMap::new()),
                );
                resources.insert(rplural.clone(), serde_json::Value::Object(rdoc));
            }
            gdoc.insert("resources".into(), serde_json::Value::Object(resources));
            groups.insert(plural.clone(), serde_json::Value::Object(gdoc));
        }
        root.insert("groups".into(), serde_json::Value::Object(groups));
        serde_json::Value::Object(root)
    }

    fn groups_keys(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }
}

impl GroupModel {
    fn resources_keys(&self) -> Vec<String> {
        self.resources.keys().cloned().collect()
    }
}

fn attrs_json(
    spec: &BTreeMap<String, Attribute>,
    custom: &BTreeMap<String, Attribute>,
) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for (name, attr) in spec.iter().chain(custom.iter()) {
        out.insert(name.clone(), attr.to_json());
    }
    serde_json::Value::Object(out)
}

/// Validate `value` against `attr` and append the flattened typed leaves to
/// `out`, rooted at the flattened path `flat`.
pub fn flatten_value(
    attr: &Attribute,
    flat: &str,
    value: &serde_json::Value,
    out: &mut Vec<(String, PropValue)>,
) -> Result<()> {
    let type_err = |want: &str| {
        RegistryError::bad_request(format!(
            "attribute \"{flat}\" must be a {want}, got: {value}"
        ))
    };
    match attr.typ {
        AttrType::String | AttrType::Url | AttrType::Xid => match value {
            serde_json::Value::String(s) => {
                if attr.typ == AttrType::Xid && !s.starts_with('/') {
                    return Err(RegistryError::bad_request(format!(
                        "attribute \"{flat}\" must be an xid starting with '/': {s}"
                    )));
                }
                out.push((flat.to_string(), PropValue::String(s.clone())));
                Ok(())
            }
            _ => Err(type_err("string")),
        },
        AttrType::Boolean => match value {
            serde_json::Value::Bool(b) => {
                out.push((flat.to_string(), PropValue::Bool(*b)));
                Ok(())
            }
            _ => Err(type_err("boolean")),
        },
        AttrType::Integer => match value.as_i64() {
            Some(i) => {
                out.push((flat.to_string(), PropValue::Int(i)));
                Ok(())
            }
            None => Err(type_err("integer")),
        },
        AttrType::UInteger => match value.as_u64() {
            Some(u) => {
                out.push((flat.to_string(), PropValue::UInt(u)));
                Ok(())
            }
            None => Err(type_err("uinteger")),
        },
        AttrType::Decimal => match value.as_f64() {
            Some(d) => {
                out.push((flat.to_string(), PropValue::Decimal(d)));
                Ok(())
            }
            None => Err(type_err("decimal")),
        },
        AttrType::Timestamp => match value {
            serde_json::Value::String(s) => {
                out.push((flat.to_string(), PropValue::Timestamp(normalize_timestamp(s)?)));
                Ok(())
            }
            _ => Err(type_err("timestamp")),
        },
        AttrType::Any => {
            flatten_any(flat, value, out);
            Ok(())
        }
        AttrType::Map => match value {
            serde_json::Value::Object(entries) => {
                if entries.is_empty() {
                    out.push((flat.to_string(), PropValue::EmptyMap));
                    return Ok(());
                }
                let item = attr.item_attr();
                for (key, entry) in entries {
                    validate_attr_name(key)?;
                    flatten_value(&item, &format!("{flat}.{key}"), entry, out)?;
                }
                Ok(())
            }
            _ => Err(type_err("map")),
        },
        AttrType::Array => match value {
            serde_json::Value::Array(items) => {
                if items.is_empty() {
                    out.push((flat.to_string(), PropValue::EmptyArray));
                    return Ok(());
                }
                let item = attr.item_attr();
                for (i, entry) in items.iter().enumerate() {
                    flatten_value(&item, &format!("{flat}[{i}]"), entry, out)?;
                }
                Ok(())
            }
            _ => Err(type_err("array")),
        },
        AttrType::Object => match value {
            serde_json::Value::Object(members) => {
                if members.is_empty() {
                    out.push((flat.to_string(), PropValue::EmptyObject));
                    return Ok(());
                }
                for (key, entry) in members {
                    let member = attr.member(key).ok_or_else(|| {
                        RegistryError::bad_request(format!(
                            "unknown attribute \"{flat}.{key}\""
                        ))
                    })?;
                    flatten_value(&member, &format!("{flat}.{key}"), entry, out)?;
                }
                Ok(())
            }
            _ => Err(type_err("object")),
        },
    }
}

/// Flatten an untyped (`any`) value by inference.
fn flatten_any(flat: &str, value: &serde_json::Value, out: &mut Vec<(String, PropValue)>) {
    match value {
        serde_json::Value::Object(members) => {
            if members.is_empty() {
                out.push((flat.to_string(), PropValue::EmptyObject));
            } else {
                for (key, entry) in members {
                    flatten_any(&format!("{flat}.{key}"), entry, out);
                }
            }
        }
        serde_json::Value::Array(items) => {
            if items.is_empty() {
                out.push((flat.to_string(), PropValue::EmptyArray));
            } else {
                for (i, entry) in items.iter().enumerate() {
                    flatten_any(&format!("{flat}[{i}]"), entry, out);
                }
            }
        }
        other => {
            if let Some(v) = PropValue::infer(other) {
                out.push((flat.to_string(), v));
            }
        }
    }
}
