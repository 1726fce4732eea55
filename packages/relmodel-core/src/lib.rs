#![forbid(unsafe_code)]
//! Relational object model with reciprocal links, change events and filtered replication.
//! A [`Registry`] holds a schema of classes, attributes and links plus the instances built
//! from it; every role write keeps its reciprocal in step and emits [`Event`]s, which
//! replication sessions forward to other registries as seen by a particular viewer.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod instance;
pub mod link_spec;
pub mod registry;
mod relations;
pub mod replication;
pub mod schema;
pub mod visibility;

pub use config::{RegistryConfig, UnknownReferencePolicy};
pub use error::{Error, Result};
pub use events::{Event, EventKind, FieldValue, SubscriptionId, Topic};
pub use ids::{IdSequence, InstanceId};
pub use instance::{Instance, RoleValue};
pub use link_spec::{Arity, Endpoint, LinkSpec, RoleDesc};
pub use registry::Registry;
pub use replication::{ReplicationMessage, ReplicationSink};
pub use schema::{ClassDef, Extension, FieldDef, Schema, SchemaExport};
pub use visibility::{ViewerOptions, Visibility};
