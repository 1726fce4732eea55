use serde::{Deserialize, Serialize};

/// What the receive path does with an id it has never been introduced to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReferencePolicy {
    /// Fail with `Error::UnknownReference`.
    #[default]
    Reject,
    /// Treat the reference as an implicit `init` and materialize a bare mirror.
    Materialize,
}

/// Registry settings. Deserializable so hosts can keep it next to their own config.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub unknown_references: UnknownReferencePolicy,
}
