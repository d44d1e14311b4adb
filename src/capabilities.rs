//! Capabilities document: the boolean policy oracle consulted before
//! honoring optional surfaces (query flags, mutability, extra endpoints).
#![forbid(unsafe_code)]

use serde::Deserialize;

use crate::error::{RegistryError, Result};

/// Extra API endpoints that can be toggled.
pub const KNOWN_APIS: &[&str] = &["/capabilities", "/export", "/model", "/modelsource"];
/// Query flags the projection engine honors.
pub const KNOWN_FLAGS: &[&str] = &[
    "binary",
    "doc",
    "epoch",
    "export",
    "filter",
    "inline",
    "setdefaultversionid",
    "sort",
    "specversion",
];
/// Things a client may mutate.
pub const KNOWN_MUTABLE: &[&str] = &["capabilities", "entities", "model"];
/// Supported schema formats.
pub const KNOWN_SCHEMAS: &[&str] = &["registry-json/1.0"];
/// Supported spec versions.
pub const KNOWN_SPECVERSIONS: &[&str] = &["1.0"];

/// The active capabilities document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Enabled optional endpoints.
    pub apis: Vec<String>,
    /// Enabled query flags.
    pub flags: Vec<String>,
    /// Mutable subsystems.
    pub mutable: Vec<String>,
    /// Whether collection pagination is offered.
    pub pagination: bool,
    /// Supported schema formats.
    pub schemas: Vec<String>,
    /// Whether `self` URLs may be shortened.
    pub shortself: bool,
    /// Accepted `specversion` values.
    pub specversions: Vec<String>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            apis: to_vec(KNOWN_APIS),
            flags: to_vec(KNOWN_FLAGS),
            mutable: to_vec(KNOWN_MUTABLE),
            pagination: false,
            schemas: to_vec(KNOWN_SCHEMAS),
            shortself: false,
            specversions: to_vec(KNOWN_SPECVERSIONS),
        }
    }
}

fn to_vec(known: &[&str]) -> Vec<String> {
    known.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCapabilities {
    #[serde(default)]
    apis: Option<Vec<String>>,
    #[serde(default)]
    flags: Option<Vec<String>>,
    #[serde(default)]
    mutable: Option<Vec<String>>,
    #[serde(default)]
    pagination: Option<bool>,
    #[serde(default)]
    schemas: Option<Vec<String>>,
    #[serde(default)]
    shortself: Option<bool>,
    #[serde(default)]
    specversions: Option<Vec<String>>,
}

impl Capabilities {
    /// Parse and validate a capabilities document. Omitted lists keep their
    /// defaults; a `"*"` entry expands to the full known set and must be
    /// the only value in its list.
    pub fn from_json(value: &serde_json::Value) -> Result<Capabilities> {
        let raw: RawCapabilities = serde_json::from_value(value.clone())
            .map_err(|e| RegistryError::bad_request(format!("invalid capabilities: {e}")))?;
        let defaults = Capabilities::default();
        Ok(Capabilities {
            apis: expand_list("apis", raw.apis, KNOWN_APIS, defaults.apis)?,
            flags: expand_list("flags", raw.flags, KNOWN_FLAGS, defaults.flags)?,
            mutable: expand_list("mutable", raw.mutable, KNOWN_MUTABLE, defaults.mutable)?,
            pagination: raw.pagination.unwrap_or(defaults.pagination),
            schemas: expand_list("schemas", raw.schemas, KNOWN_SCHEMAS, defaults.schemas)?,
            shortself: raw.shortself.unwrap_or(defaults.shortself),
            specversions: expand_list(
                "specversions",
                raw.specversions,
                KNOWN_SPECVERSIONS,
                defaults.specversions,
            )?,
        })
    }

    /// Render the document.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        out.insert("apis".into(), strings(&self.apis));
        out.insert("flags".into(), strings(&self.flags));
        out.insert("mutable".into(), strings(&self.mutable));
        out.insert("pagination".into(), serde_json::Value::Bool(self.pagination));
        out.insert("schemas".into(), strings(&self.schemas));
        out.insert("shortself".into(), serde_json::Value::Bool(self.shortself));
        out.insert("specversions".into(), strings(&self.specversions));
        serde_json::Value::Object(out)
    }

    /// Is a query flag enabled?
    pub fn flag_enabled(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Is an optional endpoint enabled?
    pub fn api_enabled(&self, api: &str) -> bool {
        self.apis.iter().any(|a| a == api)
    }

    /// May the client mutate the named subsystem?
    pub fn is_mutable(&self, what: &str) -> bool {
        self.mutable.iter().any(|m| m == what)
    }
}

fn strings(values: &[String]) -> serde_json::Value {
    serde_json::Value::Array(
        values
            .iter()
            .map(|v| serde_json::Value::String(v.clone()))
            .collect(),
    )
}

fn expand_list(
    name: &str,
    supplied: Option<Vec<String>>,
    known: &[&str],
    default: Vec<String>,
) -> Result<Vec<String>> {
    let Some(values) = supplied else {
        return Ok(default);
    };
    if values.iter().any(|v| v == "*") {
        if values.len() != 1 {
            return Err(RegistryError::bad_request(format!(
                "\"*\" must be the only value specified for \"{name}\""
            )));
        }
        return Ok(to_vec(known));
    }
    for value in &values {
        if !known.contains(&value.as_str()) {
            return Err(RegistryError::bad_request(format!(
                "unknown \"{name}\" value: \"{value}\""
            )));
        }
    }
    Ok(values)
}
