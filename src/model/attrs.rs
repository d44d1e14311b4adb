//! Attribute declarations: the shape oracle for every entity level.
//!
//! Spec-defined attributes are built here in code; authored custom
//! attributes are parsed from the `modelsource` document and merged in by
//! the model layer.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{RegistryError, Result};
use crate::model::AttrType;
use crate::path::validate_attr_name;

/// One declared attribute.
#[derive(Clone, Debug)]
pub struct Attribute {
    /// Attribute name (`name`, `labels`, ...). Empty for item specs.
    pub name: String,
    /// Declared type.
    pub typ: AttrType,
    /// Set once at creation, never changed afterwards.
    pub immutable: bool,
    /// Computed by the server; clients must not supply it.
    pub readonly: bool,
    /// Element spec for map/array attributes.
    item: Option<Box<Attribute>>,
    /// Member specs for object attributes; `"*"` matches any member.
    attributes: BTreeMap<String, Attribute>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAttr {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    typ: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    immutable: bool,
    #[serde(default)]
    clientrequired: bool,
    #[serde(default)]
    serverrequired: bool,
    #[serde(default)]
    item: Option<Box<RawAttr>>,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
}

impl Attribute {
    /// New attribute of the given type, mutable and client-writable.
    pub fn new(name: &str, typ: AttrType) -> Attribute {
        Attribute {
            name: name.to_string(),
            typ,
            immutable: false,
            readonly: false,
            item: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Mark as immutable.
    pub fn immutable(mut self) -> Attribute {
        self.immutable = true;
        self
    }

    /// Mark as server-computed.
    pub fn readonly(mut self) -> Attribute {
        self.readonly = true;
        self
    }

    /// Attach the element spec (map/array).
    pub fn with_item(mut self, item: Attribute) -> Attribute {
        self.item = Some(Box::new(item));
        self
    }

    /// Attach object member specs.
    pub fn with_attrs(mut self, members: Vec<Attribute>) -> Attribute {
        for member in members {
            self.attributes.insert(member.name.clone(), member);
        }
        self
    }

    /// Element spec for map/array values; `any` when unspecified.
    pub fn item_attr(&self) -> Attribute {
        self.item
            .as_deref()
            .cloned()
            .unwrap_or_else(|| Attribute::new("", AttrType::Any))
    }

    /// Member spec for object values, honoring a `"*"` wildcard member.
    pub fn member(&self, key: &str) -> Option<Attribute> {
        self.attributes
            .get(key)
            .or_else(|| self.attributes.get("*"))
            .cloned()
    }

    /// Parse a map of authored attribute declarations.
    pub fn parse_map(
        raw: &BTreeMap<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, Attribute>> {
        let mut out = BTreeMap::new();
        for (name, decl) in raw {
            if name != "*" {
                validate_attr_name(name)?;
            }
            out.insert(name.clone(), Self::parse_one(name, decl)?);
        }
        Ok(out)
    }

    fn parse_one(name: &str, decl: &serde_json::Value) -> Result<Attribute> {
        let raw: RawAttr = serde_json::from_value(decl.clone()).map_err(|e| {
            RegistryError::bad_request(format!("invalid attribute \"{name}\": {e}"))
        })?;
        Self::from_raw(name, raw)
    }

    fn from_raw(name: &str, raw: RawAttr) -> Result<Attribute> {
        if let Some(declared) = &raw.name {
            if declared != name && name != "*" {
                return Err(RegistryError::bad_request(format!(
                    "attribute \"name\" '{declared}' must match its key '{name}'"
                )));
            }
        }
        // clientrequired/serverrequired and description are recorded in the
        // authored source; the core only needs the shape.
        let _ = (raw.description, raw.clientrequired, raw.serverrequired);
        let mut attr = Attribute::new(name, AttrType::parse(&raw.typ)?);
        if raw.immutable {
            attr = attr.immutable();
        }
        if let Some(item) = raw.item {
            attr = attr.with_item(Self::from_raw("", *item)?);
        }
        if !raw.attributes.is_empty() {
            attr.attributes = Self::parse_map(&raw.attributes)?;
        }
        Ok(attr)
    }

    /// Render this declaration for the derived model document.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        if !self.name.is_empty() {
            out.insert("name".into(), serde_json::Value::String(self.name.clone()));
        }
        out.insert(
            "type".into(),
            serde_json::Value::String(self.typ.name().to_string()),
        );
        if self.immutable {
            out.insert("immutable".into(), serde_json::Value::Bool(true));
        }
        if self.readonly {
            out.insert("readonly".into(), serde_json::Value::Bool(true));
        }
        if let Some(item) = &self.item {
            out.insert("item".into(), item.to_json());
        }
        if !self.attributes.is_empty() {
            let mut members = serde_json::Map::new();
            for (key, member) in &self.attributes {
                members.insert(key.clone(), member.to_json());
            }
            out.insert("attributes".into(), serde_json::Value::Object(members));
        }
        serde_json::Value::Object(out)
    }
}

fn string_attr(name: &str) -> Attribute {
    Attribute::new(name, AttrType::String)
}

fn common_attrs() -> Vec<Attribute> {
    vec![
        Attribute::new("epoch", AttrType::UInteger),
        string_attr("name"),
        string_attr("description"),
        Attribute::new("documentation", AttrType::Url),
        Attribute::new("labels", AttrType::Map).with_item(Attribute::new("", AttrType::String)),
        Attribute::new("createdat", AttrType::Timestamp),
        Attribute::new("modifiedat", AttrType::Timestamp),
    ]
}

fn identity_attrs(id_attr: &str) -> Vec<Attribute> {
    vec![
        string_attr(id_attr).immutable(),
        Attribute::new("self", AttrType::Url).readonly(),
        Attribute::new("xid", AttrType::Xid).readonly(),
    ]
}

fn collection_attrs(plurals: &[String]) -> Vec<Attribute> {
    let mut out = Vec::new();
    for plural in plurals {
        out.push(Attribute::new(&format!("{plural}url"), AttrType::Url).readonly());
        out.push(Attribute::new(&format!("{plural}count"), AttrType::UInteger).readonly());
    }
    out
}

fn into_map(attrs: Vec<Attribute>) -> BTreeMap<String, Attribute> {
    attrs
        .into_iter()
        .map(|a| (a.name.clone(), a))
        .collect()
}

/// Spec-defined registry-level attributes.
pub fn registry_spec_attrs(group_plurals: &[String]) -> BTreeMap<String, Attribute> {
    let mut attrs = vec![string_attr("specversion").readonly()];
    attrs.extend(identity_attrs("registryid"));
    attrs.extend(common_attrs());
    attrs.extend(collection_attrs(group_plurals));
    into_map(attrs)
}

/// Spec-defined group-level attributes.
pub fn group_spec_attrs(singular: &str, resource_plurals: &[String]) -> BTreeMap<String, Attribute> {
    let mut attrs = identity_attrs(&format!("{singular}id"));
    attrs.extend(common_attrs());
    attrs.extend(collection_attrs(resource_plurals));
    into_map(attrs)
}

/// Spec-defined version-level attributes (also the resource-level view).
pub fn version_spec_attrs(singular: &str) -> BTreeMap<String, Attribute> {
    let mut attrs = identity_attrs(&format!("{singular}id"));
    attrs.push(string_attr("versionid").immutable());
    attrs.push(Attribute::new("isdefault", AttrType::Boolean).readonly());
    attrs.push(string_attr("ancestor"));
    attrs.extend(common_attrs());
    attrs.push(string_attr("contenttype"));
    attrs.push(Attribute::new(singular, AttrType::Any));
    attrs.push(string_attr(&format!("{singular}base64")));
    attrs.push(Attribute::new(&format!("{singular}url"), AttrType::Url));
    attrs.push(Attribute::new(&format!("{singular}proxyurl"), AttrType::Url));
    into_map(attrs)
}

/// Spec-defined meta-level attributes.
pub fn meta_spec_attrs(singular: &str) -> BTreeMap<String, Attribute> {
    let mut attrs = identity_attrs(&format!("{singular}id"));
    attrs.push(Attribute::new("epoch", AttrType::UInteger));
    attrs.push(Attribute::new("createdat", AttrType::Timestamp));
    attrs.push(Attribute::new("modifiedat", AttrType::Timestamp));
    attrs.push(Attribute::new("readonly", AttrType::Boolean));
    attrs.push(string_attr("compatibility"));
    attrs.push(string_attr("compatibilityauthority"));
    attrs.push(
        Attribute::new("deprecated", AttrType::Object).with_attrs(vec![
            Attribute::new("effective", AttrType::Timestamp),
            Attribute::new("removal", AttrType::Timestamp),
            Attribute::new("alternative", AttrType::Url),
            Attribute::new("docs", AttrType::Url),
        ]),
    );
    attrs.push(string_attr("defaultversionid"));
    attrs.push(Attribute::new("defaultversionurl", AttrType::Url).readonly());
    attrs.push(Attribute::new("defaultversionsticky", AttrType::Boolean));
    attrs.push(Attribute::new("xref", AttrType::Xid));
    into_map(attrs)
}
