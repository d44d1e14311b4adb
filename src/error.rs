//! Structured error taxonomy shared by every registry subsystem.
#![forbid(unsafe_code)]

use thiserror::Error;
use tracing::error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors surfaced by the registry core.
///
/// Every variant carries the subject/arguments a caller needs to build a
/// machine-readable response. All of them abort the surrounding request
/// transaction; partial mutation is never observable.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Supplied optimistic-concurrency token does not match the stored one.
    #[error("epoch {supplied} does not match the current epoch {current} for '{xid}'")]
    MismatchedEpoch {
        /// Entity the conditional write addressed.
        xid: String,
        /// Epoch supplied by the caller.
        supplied: u64,
        /// Epoch currently stored.
        current: u64,
    },
    /// An id in a request body disagrees with the path-derived id.
    #[error("the \"{attr}\" attribute must be set to '{expected}', not '{supplied}'")]
    MismatchedId {
        /// Name of the id attribute (`fileid`, `versionid`, ...).
        attr: String,
        /// Id derived from the request path.
        expected: String,
        /// Id supplied in the body.
        supplied: String,
    },
    /// An `xref` value failed path-shape or type-compatibility validation.
    #[error("'{xref}' must be of the form /GROUPS/gID/RESOURCES/rID: {reason}")]
    MalformedXref {
        /// The offending xref value.
        xref: String,
        /// What exactly was wrong with it.
        reason: String,
    },
    /// A body attribute is invalid while `xref` is (being) set.
    #[error("extra attribute \"{attr}\" not allowed when \"xref\" is set on '{xid}'")]
    ExtraXrefAttribute {
        /// The offending attribute name.
        attr: String,
        /// Resource whose meta is mirroring.
        xid: String,
    },
    /// A referenced versionid does not exist in the target set.
    #[error("version \"{versionid}\" not found for '{xid}'")]
    UnknownId {
        /// Resource whose versions were searched.
        xid: String,
        /// The missing versionid.
        versionid: String,
    },
    /// Path resolves to no entity, or a filter eliminated the whole subtree.
    #[error("'{xid}' not found")]
    NotFound {
        /// The xid that failed to resolve.
        xid: String,
    },
    /// Structurally disallowed operation or malformed input.
    #[error("{0}")]
    BadRequest(String),
    /// Mutation attempted against a resource whose meta is `readonly`.
    #[error("'{xid}' is readonly")]
    Readonly {
        /// The readonly resource.
        xid: String,
    },
    /// Underlying storage failure (including retry-exhausted lock conflicts).
    #[error("storage error: {0}")]
    Storage(String),
}

impl RegistryError {
    /// Stable machine-readable kind, used as the error-type fragment in
    /// serialized responses.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::MismatchedEpoch { .. } => "mismatched_epoch",
            RegistryError::MismatchedId { .. } => "mismatched_id",
            RegistryError::MalformedXref { .. } => "malformed_xref",
            RegistryError::ExtraXrefAttribute { .. } => "extra_xref_attribute",
            RegistryError::UnknownId { .. } => "unknown_id",
            RegistryError::NotFound { .. } => "not_found",
            RegistryError::BadRequest(_) => "bad_request",
            RegistryError::Readonly { .. } => "readonly",
            RegistryError::Storage(_) => "storage_error",
        }
    }

    /// HTTP status the HTTP layer should map this error to.
    pub fn status(&self) -> u16 {
        match self {
            RegistryError::NotFound { .. } => 404,
            RegistryError::Storage(_) => 500,
            _ => 400,
        }
    }

    /// Convenience constructor for [`RegistryError::BadRequest`].
    pub fn bad_request(msg: impl Into<String>) -> Self {
        RegistryError::BadRequest(msg.into())
    }

    /// Convenience constructor for [`RegistryError::NotFound`].
    pub fn not_found(xid: impl Into<String>) -> Self {
        RegistryError::NotFound { xid: xid.into() }
    }
}

impl From<rusqlite::Error> for RegistryError {
    fn from(err: rusqlite::Error) -> Self {
        error!(error = %err, "storage layer failure");
        RegistryError::Storage(err.to_string())
    }
}

impl From<time::error::Format> for RegistryError {
    fn from(err: time::error::Format) -> Self {
        RegistryError::Storage(format!("timestamp formatting failed: {err}"))
    }
}
