use std::collections::HashSet;

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::config::UnknownReferencePolicy;
use crate::error::{Error, Result};
use crate::ids::InstanceId;
use crate::link_spec::Arity;
use crate::registry::Registry;
use crate::schema::FieldDef;

use super::message::ReplicationMessage;

fn wire_id(value: &Value) -> Result<InstanceId> {
    value
        .as_str()
        .ok_or_else(|| Error::MalformedId(value.to_string()))?
        .parse()
}

/// Ids carried by a role value. An empty list clears a single role.
fn wire_refs(
    id: &InstanceId,
    field: &str,
    arity: Arity,
    value: &Value,
) -> Result<Vec<InstanceId>> {
    match (arity, value) {
        (Arity::One, Value::Null) => Ok(Vec::new()),
        (Arity::One, value) => Ok(vec![wire_id(value)?]),
        (Arity::Many, Value::Array(items)) => items.iter().map(wire_id).collect(),
        (Arity::Many, other) => Err(Error::InvalidPayload(format!(
            "{id}.{field} expects a list of ids, got {other}"
        ))),
    }
}

impl Registry {
    /// Apply one replicated message to this mirror.
    pub fn receive(&mut self, message: ReplicationMessage) -> Result<()> {
        let kind = message.kind();
        let result = self.apply_message(message);
        if let Err(err) = &result {
            warn!("rejected replicated {kind}: {err}");
        }
        result
    }

    /// Parse a wire tuple and apply it.
    pub fn receive_tuple(&mut self, raw: &str) -> Result<()> {
        self.receive(ReplicationMessage::from_json(raw)?)
    }

    fn apply_message(&mut self, message: ReplicationMessage) -> Result<()> {
        match message {
            ReplicationMessage::Schema(text) => self.import_schema(&text),
            ReplicationMessage::Snapshot(text) => self.import_snapshot(&text),
            ReplicationMessage::Init { class, id } => {
                if class != id.class() {
                    return Err(Error::InvalidPayload(format!(
                        "init of {id} announced as class {class}"
                    )));
                }
                self.register_with_explicit_id(id)
            }
            ReplicationMessage::Change { field, new, id, .. } => {
                self.resolve_remote(&id)?;
                self.apply_wire_field(&id, &field, new)
            }
            ReplicationMessage::AddTo {
                role,
                item,
                index,
                id,
            } => {
                self.resolve_remote(&id)?;
                self.resolve_remote(&item)?;
                self.insert_at(&id, &role, &item, index)
            }
            ReplicationMessage::RemoveFrom { role, item, id, .. } => {
                self.resolve_remote(&id)?;
                if !self.contains(&item) {
                    return Ok(());
                }
                self.remove(&id, &role, &item)
            }
        }
    }

    /// Materialize a snapshot payload. Every instance is created first, in id order,
    /// so fields can reference instances that appear later in the payload. The whole
    /// payload is checked before anything is registered; a rejected snapshot leaves the
    /// registry untouched.
    pub fn import_snapshot(&mut self, payload: &str) -> Result<()> {
        let snapshot: Map<String, Value> = serde_json::from_str(payload)?;
        let mut entries = snapshot
            .into_iter()
            .map(|(raw, fields)| match fields {
                Value::Object(fields) => Ok((raw.parse::<InstanceId>()?, fields)),
                other => Err(Error::InvalidPayload(format!(
                    "snapshot entry {raw} is not an object: {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        debug!("importing snapshot of {} instance(s)", entries.len());
        self.check_snapshot(&entries)?;

        for (id, _) in &entries {
            self.register_with_explicit_id(id.clone())?;
        }
        for (id, fields) in entries {
            for (field, value) in fields {
                self.apply_wire_field(&id, &field, value)?;
            }
        }
        Ok(())
    }

    fn check_snapshot(&self, entries: &[(InstanceId, Map<String, Value>)]) -> Result<()> {
        let incoming: HashSet<&InstanceId> = entries.iter().map(|(id, _)| id).collect();
        for (id, fields) in entries {
            self.check_explicit_id(id)?;
            for (field, value) in fields {
                let role = match self.schema().require_field(id.class(), field)? {
                    FieldDef::Attribute(_) => continue,
                    FieldDef::Role(role) => role,
                };
                for target in wire_refs(id, field, role.arity, value)? {
                    let known = incoming.contains(&target) || self.contains(&target);
                    if !known {
                        if self.config().unknown_references == UnknownReferencePolicy::Reject {
                            return Err(Error::UnknownReference(target.to_string()));
                        }
                        self.check_explicit_id(&target)?;
                    }
                    if !self.schema().is_a(target.class(), &role.target) {
                        return Err(Error::TargetMismatch {
                            role: role.name.clone(),
                            expected: role.target.clone(),
                            actual: target.class().to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Make sure `id` exists locally, materializing it when the policy allows.
    fn resolve_remote(&mut self, id: &InstanceId) -> Result<()> {
        if self.contains(id) {
            return Ok(());
        }
        match self.config().unknown_references {
            UnknownReferencePolicy::Reject => Err(Error::UnknownReference(id.to_string())),
            UnknownReferencePolicy::Materialize => {
                debug!("materializing unannounced {id}");
                self.register_with_explicit_id(id.clone())
            }
        }
    }

    fn apply_wire_field(&mut self, id: &InstanceId, field: &str, value: Value) -> Result<()> {
        self.get(id)?;
        let arity = match self.schema().require_field(id.class(), field)? {
            FieldDef::Attribute(_) => None,
            FieldDef::Role(role) => Some(role.arity),
        };
        let Some(arity) = arity else {
            return self.set_attribute(id, field, value);
        };
        let targets = wire_refs(id, field, arity, &value)?;
        for target in &targets {
            self.resolve_remote(target)?;
        }
        match arity {
            Arity::One => self.set_one(id, field, targets.first()),
            Arity::Many => self.replace_all(id, field, &targets),
        }
    }
}
