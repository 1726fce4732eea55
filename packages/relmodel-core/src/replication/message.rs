use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::events::FieldValue;
use crate::ids::InstanceId;

/// One unit of the replication stream. On the wire every message is a JSON array whose
/// first element names the kind, with instances replaced by their id strings.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplicationMessage {
    /// Exported schema text.
    Schema(String),
    /// Snapshot text: `{"<id>": {field: value}}`.
    Snapshot(String),
    Init {
        class: String,
        id: InstanceId,
    },
    Change {
        field: String,
        new: Value,
        old: Value,
        id: InstanceId,
    },
    AddTo {
        role: String,
        item: InstanceId,
        index: usize,
        id: InstanceId,
    },
    RemoveFrom {
        role: String,
        item: InstanceId,
        index: usize,
        id: InstanceId,
    },
}

impl ReplicationMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationMessage::Schema(_) => "schema",
            ReplicationMessage::Snapshot(_) => "snapshot",
            ReplicationMessage::Init { .. } => "init",
            ReplicationMessage::Change { .. } => "change",
            ReplicationMessage::AddTo { .. } => "addto",
            ReplicationMessage::RemoveFrom { .. } => "removefrom",
        }
    }

    pub fn to_tuple(&self) -> Value {
        let tag = Value::from(self.kind());
        match self {
            ReplicationMessage::Schema(text) | ReplicationMessage::Snapshot(text) => {
                Value::Array(vec![tag, Value::from(text.as_str())])
            }
            ReplicationMessage::Init { class, id } => {
                Value::Array(vec![tag, Value::from(class.as_str()), id_value(id)])
            }
            ReplicationMessage::Change { field, new, old, id } => Value::Array(vec![
                tag,
                Value::from(field.as_str()),
                new.clone(),
                old.clone(),
                id_value(id),
            ]),
            ReplicationMessage::AddTo {
                role,
                item,
                index,
                id,
            }
            | ReplicationMessage::RemoveFrom {
                role,
                item,
                index,
                id,
            } => Value::Array(vec![
                tag,
                Value::from(role.as_str()),
                id_value(item),
                Value::from(*index),
                id_value(id),
            ]),
        }
    }

    pub fn from_tuple(value: &Value) -> Result<Self> {
        let Some(items) = value.as_array() else {
            return Err(Error::InvalidPayload(format!("expected a tuple, got {value}")));
        };
        let message = match items.as_slice() {
            [Value::String(tag), Value::String(text)] if tag == "schema" => {
                ReplicationMessage::Schema(text.clone())
            }
            [Value::String(tag), Value::String(text)] if tag == "snapshot" => {
                ReplicationMessage::Snapshot(text.clone())
            }
            [Value::String(tag), Value::String(class), id] if tag == "init" => {
                ReplicationMessage::Init {
                    class: class.clone(),
                    id: parse_id(id)?,
                }
            }
            [Value::String(tag), Value::String(field), new, old, id] if tag == "change" => {
                ReplicationMessage::Change {
                    field: field.clone(),
                    new: new.clone(),
                    old: old.clone(),
                    id: parse_id(id)?,
                }
            }
            [Value::String(tag), Value::String(role), item, index, id] if tag == "addto" => {
                ReplicationMessage::AddTo {
                    role: role.clone(),
                    item: parse_id(item)?,
                    index: parse_index(index)?,
                    id: parse_id(id)?,
                }
            }
            [Value::String(tag), Value::String(role), item, index, id] if tag == "removefrom" => {
                ReplicationMessage::RemoveFrom {
                    role: role.clone(),
                    item: parse_id(item)?,
                    index: parse_index(index)?,
                    id: parse_id(id)?,
                }
            }
            _ => return Err(Error::InvalidPayload(format!("unrecognized message {value}"))),
        };
        Ok(message)
    }

    pub fn to_json(&self) -> String {
        self.to_tuple().to_string()
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_tuple(&value)
    }
}

impl Serialize for ReplicationMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_tuple().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ReplicationMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_tuple(&value).map_err(D::Error::custom)
    }
}

fn id_value(id: &InstanceId) -> Value {
    Value::String(id.to_string())
}

fn parse_id(value: &Value) -> Result<InstanceId> {
    value
        .as_str()
        .ok_or_else(|| Error::MalformedId(value.to_string()))?
        .parse()
}

fn parse_index(value: &Value) -> Result<usize> {
    value
        .as_u64()
        .and_then(|index| usize::try_from(index).ok())
        .ok_or_else(|| Error::InvalidPayload(format!("invalid index {value}")))
}

/// Wire form of an event value: ids as strings, sequences as arrays, unset as null.
pub(crate) fn wire_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Scalar(value) => value.clone().unwrap_or(Value::Null),
        FieldValue::Ref(target) => target.as_ref().map_or(Value::Null, id_value),
        FieldValue::Refs(targets) => Value::Array(targets.iter().map(id_value).collect()),
    }
}
