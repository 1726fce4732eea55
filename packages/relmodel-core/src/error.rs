use thiserror::Error;

use crate::link_spec::Arity;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("duplicate class: {0}")]
    DuplicateClass(String),
    #[error("invalid link spec: {0}")]
    InvalidLinkSpec(String),
    #[error("identity conflict: {0} is already registered")]
    IdentityConflict(String),
    #[error("unknown reference: {0}")]
    UnknownReference(String),
    #[error("unknown class: {0}")]
    UnknownClass(String),
    #[error("unknown field {field} on class {class}")]
    UnknownField { class: String, field: String },
    #[error("field {field} is already declared on class {class}")]
    DuplicateField { class: String, field: String },
    #[error("role {role} has arity {actual:?}, operation requires {expected:?}")]
    ArityMismatch {
        role: String,
        expected: Arity,
        actual: Arity,
    },
    #[error("role {role} targets {expected}, got an instance of {actual}")]
    TargetMismatch {
        role: String,
        expected: String,
        actual: String,
    },
    #[error("malformed id: {0}")]
    MalformedId(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
