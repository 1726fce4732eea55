//! Reciprocal relationship maintenance.
//!
//! Every write to a role also rewrites the paired role on the other side, detaching
//! previous partners where arity demands it. Slot writes for one operation all happen
//! before its events are dispatched.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::events::{Event, FieldValue};
use crate::ids::InstanceId;
use crate::instance::RoleValue;
use crate::link_spec::Arity;
use crate::registry::Registry;
use crate::schema::{FieldDef, RoleDef};

/// Events of one operation, bucketed so they dispatch as: detachments of previous
/// partners, then the originating field, then reciprocal updates.
#[derive(Default)]
struct Effects {
    detached: Vec<Event>,
    origin: Vec<Event>,
    reciprocal: Vec<Event>,
}

impl Effects {
    fn into_events(self) -> Vec<Event> {
        let mut events = self.detached;
        events.extend(self.origin);
        events.extend(self.reciprocal);
        events
    }
}

impl Registry {
    fn role_of(&self, id: &InstanceId, name: &str, arity: Arity) -> Result<RoleDef> {
        let instance = self.get(id)?;
        match self.schema().require_field(instance.class(), name)? {
            FieldDef::Role(role) if role.arity == arity => Ok(role.clone()),
            FieldDef::Role(role) => Err(Error::ArityMismatch {
                role: name.to_string(),
                expected: arity,
                actual: role.arity,
            }),
            FieldDef::Attribute(_) => Err(Error::UnknownField {
                class: instance.class().to_string(),
                field: name.to_string(),
            }),
        }
    }

    fn check_attribute(&self, id: &InstanceId, name: &str) -> Result<()> {
        let instance = self.get(id)?;
        match self.schema().require_field(instance.class(), name)? {
            FieldDef::Attribute(_) => Ok(()),
            FieldDef::Role(_) => Err(Error::UnknownField {
                class: instance.class().to_string(),
                field: name.to_string(),
            }),
        }
    }

    fn check_target(&self, role: &RoleDef, target: &InstanceId) -> Result<()> {
        let instance = self.get(target)?;
        if self.schema().is_a(instance.class(), &role.target) {
            Ok(())
        } else {
            Err(Error::TargetMismatch {
                role: role.name.clone(),
                expected: role.target.clone(),
                actual: instance.class().to_string(),
            })
        }
    }

    fn reciprocal_of(&self, role: &RoleDef) -> Result<RoleDef> {
        self.schema().reciprocal(role).cloned()
    }

    /// Current attribute value; `None` while unset.
    pub fn attribute(&self, id: &InstanceId, name: &str) -> Result<Option<&Value>> {
        self.check_attribute(id, name)?;
        Ok(self.get(id)?.attribute(name))
    }

    pub fn one(&self, id: &InstanceId, role: &str) -> Result<Option<&InstanceId>> {
        self.role_of(id, role, Arity::One)?;
        Ok(match self.get(id)?.role(role) {
            Some(RoleValue::One(target)) => target.as_ref(),
            _ => None,
        })
    }

    pub fn many(&self, id: &InstanceId, role: &str) -> Result<&[InstanceId]> {
        self.role_of(id, role, Arity::Many)?;
        Ok(match self.get(id)?.role(role) {
            Some(RoleValue::Many(targets)) => targets,
            _ => &[],
        })
    }

    /// Set an attribute. `Value::Null` unsets it.
    pub fn set_attribute(
        &mut self,
        id: &InstanceId,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let value = match value.into() {
            Value::Null => None,
            value => Some(value),
        };
        self.write_attribute(id, name, value)
    }

    pub fn unset_attribute(&mut self, id: &InstanceId, name: &str) -> Result<()> {
        self.write_attribute(id, name, None)
    }

    fn write_attribute(&mut self, id: &InstanceId, name: &str, value: Option<Value>) -> Result<()> {
        self.check_attribute(id, name)?;
        let old = self.instance_mut(id)?.put_attribute(name, value.clone());
        self.emit(vec![Event::Change {
            instance: id.clone(),
            field: name.to_string(),
            new: FieldValue::Scalar(value),
            old: FieldValue::Scalar(old),
        }]);
        Ok(())
    }

    /// Point a single role at `target`, or clear it with `None`.
    pub fn set_one(
        &mut self,
        id: &InstanceId,
        role: &str,
        target: Option<&InstanceId>,
    ) -> Result<()> {
        let role = self.role_of(id, role, Arity::One)?;
        if let Some(target) = target {
            self.check_target(&role, target)?;
        }
        let old = self.one(id, &role.name)?.cloned();
        if old.as_ref() == target {
            return Ok(());
        }
        let reciprocal = self.reciprocal_of(&role)?;
        let mut fx = Effects::default();
        if let Some(old) = &old {
            self.drop_member(old, &reciprocal, id, &mut fx.detached)?;
        }
        self.put_one(id, &role, target.cloned(), &mut fx.origin)?;
        if let Some(target) = target {
            self.link_back(id, &role, &reciprocal, target, &mut fx)?;
        }
        self.emit(fx.into_events());
        Ok(())
    }

    pub fn append(&mut self, id: &InstanceId, role: &str, item: &InstanceId) -> Result<()> {
        self.insert_member(id, role, item, None)
    }

    pub fn prepend(&mut self, id: &InstanceId, role: &str, item: &InstanceId) -> Result<()> {
        self.insert_member(id, role, item, Some(0))
    }

    /// Insert `item` at `index`, clamped to the sequence length. Inserting an existing
    /// member is a no-op.
    pub fn insert_at(
        &mut self,
        id: &InstanceId,
        role: &str,
        item: &InstanceId,
        index: usize,
    ) -> Result<()> {
        self.insert_member(id, role, item, Some(index))
    }

    fn insert_member(
        &mut self,
        id: &InstanceId,
        role: &str,
        item: &InstanceId,
        index: Option<usize>,
    ) -> Result<()> {
        let role = self.role_of(id, role, Arity::Many)?;
        self.check_target(&role, item)?;
        if self.many(id, &role.name)?.contains(item) {
            return Ok(());
        }
        let reciprocal = self.reciprocal_of(&role)?;
        let mut fx = Effects::default();
        self.add_member(id, &role, item, index, &mut fx.origin)?;
        self.link_back(id, &role, &reciprocal, item, &mut fx)?;
        self.emit(fx.into_events());
        Ok(())
    }

    /// Remove `item` from a many role. Removing a non-member is a no-op.
    pub fn remove(&mut self, id: &InstanceId, role: &str, item: &InstanceId) -> Result<()> {
        let role = self.role_of(id, role, Arity::Many)?;
        self.get(item)?;
        if !self.many(id, &role.name)?.contains(item) {
            return Ok(());
        }
        let reciprocal = self.reciprocal_of(&role)?;
        let mut fx = Effects::default();
        self.drop_member(id, &role, item, &mut fx.origin)?;
        self.drop_member(item, &reciprocal, id, &mut fx.reciprocal)?;
        self.emit(fx.into_events());
        Ok(())
    }

    /// Replace a many role wholesale. Duplicates in `items` keep their first position.
    pub fn replace_all(&mut self, id: &InstanceId, role: &str, items: &[InstanceId]) -> Result<()> {
        let role = self.role_of(id, role, Arity::Many)?;
        let mut desired: Vec<InstanceId> = Vec::with_capacity(items.len());
        for item in items {
            self.check_target(&role, item)?;
            if !desired.contains(item) {
                desired.push(item.clone());
            }
        }
        let current = self.many(id, &role.name)?.to_vec();
        if desired == current {
            return Ok(());
        }
        let reciprocal = self.reciprocal_of(&role)?;
        let mut fx = Effects::default();
        for dropped in current.iter().filter(|item| !desired.contains(item)) {
            self.drop_member(id, &role, dropped, &mut fx.origin)?;
            self.drop_member(dropped, &reciprocal, id, &mut fx.reciprocal)?;
        }
        for added in desired.iter().filter(|item| !current.contains(item)) {
            self.add_member(id, &role, added, None, &mut fx.origin)?;
            self.link_back(id, &role, &reciprocal, added, &mut fx)?;
        }
        *self.instance_mut(id)?.role_mut(&role.name, Arity::Many) =
            RoleValue::Many(desired.clone());
        fx.origin.push(Event::Change {
            instance: id.clone(),
            field: role.name.clone(),
            new: FieldValue::Refs(desired),
            old: FieldValue::Refs(current),
        });
        self.emit(fx.into_events());
        Ok(())
    }

    /// Make `target`'s reciprocal slot reference `owner`. A single reciprocal slot that
    /// already held someone else gets that previous owner detached first.
    fn link_back(
        &mut self,
        owner: &InstanceId,
        role: &RoleDef,
        reciprocal: &RoleDef,
        target: &InstanceId,
        fx: &mut Effects,
    ) -> Result<()> {
        match reciprocal.arity {
            Arity::One => {
                let previous = match self.get(target)?.role(&reciprocal.name) {
                    Some(RoleValue::One(previous)) => previous.clone(),
                    _ => None,
                };
                if previous.as_ref() == Some(owner) {
                    return Ok(());
                }
                if let Some(previous) = previous {
                    self.drop_member(&previous, role, target, &mut fx.detached)?;
                }
                self.put_one(target, reciprocal, Some(owner.clone()), &mut fx.reciprocal)?;
            }
            Arity::Many => {
                self.add_member(target, reciprocal, owner, None, &mut fx.reciprocal)?;
            }
        }
        Ok(())
    }

    /// Write a single slot, recording a `change` when the value actually moves.
    fn put_one(
        &mut self,
        holder: &InstanceId,
        role: &RoleDef,
        value: Option<InstanceId>,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let slot = self.instance_mut(holder)?.role_mut(&role.name, Arity::One);
        let RoleValue::One(current) = slot else {
            return Err(shape_error(holder, role));
        };
        if *current == value {
            return Ok(());
        }
        let old = std::mem::replace(current, value.clone());
        events.push(Event::Change {
            instance: holder.clone(),
            field: role.name.clone(),
            new: FieldValue::Ref(value),
            old: FieldValue::Ref(old),
        });
        Ok(())
    }

    fn add_member(
        &mut self,
        holder: &InstanceId,
        role: &RoleDef,
        member: &InstanceId,
        index: Option<usize>,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let slot = self.instance_mut(holder)?.role_mut(&role.name, Arity::Many);
        let RoleValue::Many(members) = slot else {
            return Err(shape_error(holder, role));
        };
        if members.contains(member) {
            return Ok(());
        }
        let index = index.map_or(members.len(), |index| index.min(members.len()));
        members.insert(index, member.clone());
        events.push(Event::AddTo {
            instance: holder.clone(),
            role: role.name.clone(),
            item: member.clone(),
            index,
        });
        Ok(())
    }

    /// Remove `member` from `holder`'s slot, whichever arity it has.
    fn drop_member(
        &mut self,
        holder: &InstanceId,
        role: &RoleDef,
        member: &InstanceId,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let slot = self.instance_mut(holder)?.role_mut(&role.name, role.arity);
        match slot {
            RoleValue::One(current) if current.as_ref() == Some(member) => {
                *current = None;
                events.push(Event::Change {
                    instance: holder.clone(),
                    field: role.name.clone(),
                    new: FieldValue::Ref(None),
                    old: FieldValue::Ref(Some(member.clone())),
                });
            }
            RoleValue::Many(members) => {
                if let Some(index) = members.iter().position(|m| m == member) {
                    members.remove(index);
                    events.push(Event::RemoveFrom {
                        instance: holder.clone(),
                        role: role.name.clone(),
                        item: member.clone(),
                        index,
                    });
                }
            }
            RoleValue::One(_) => {}
        }
        Ok(())
    }
}

fn shape_error(holder: &InstanceId, role: &RoleDef) -> Error {
    Error::InconsistentState(format!(
        "{holder}.{} does not hold a {:?} slot",
        role.name, role.arity
    ))
}
