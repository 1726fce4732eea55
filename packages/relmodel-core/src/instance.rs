use std::collections::BTreeMap;

use serde_json::Value;

use crate::ids::InstanceId;
use crate::link_spec::Arity;

/// Current value of a role slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RoleValue {
    One(Option<InstanceId>),
    Many(Vec<InstanceId>),
}

impl RoleValue {
    pub fn empty(arity: Arity) -> Self {
        match arity {
            Arity::One => RoleValue::One(None),
            Arity::Many => RoleValue::Many(Vec::new()),
        }
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        match self {
            RoleValue::One(target) => target.as_ref() == Some(id),
            RoleValue::Many(targets) => targets.contains(id),
        }
    }

    /// Every referenced instance, in order.
    pub fn targets(&self) -> &[InstanceId] {
        match self {
            RoleValue::One(Some(target)) => std::slice::from_ref(target),
            RoleValue::One(None) => &[],
            RoleValue::Many(targets) => targets,
        }
    }
}

/// One object of the graph. Instances live in the registry arena; roles hold ids of
/// other instances rather than owning them.
#[derive(Clone, Debug)]
pub struct Instance {
    id: InstanceId,
    attributes: BTreeMap<String, Value>,
    roles: BTreeMap<String, RoleValue>,
}

impl Instance {
    pub(crate) fn new(id: InstanceId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
            roles: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn class(&self) -> &str {
        self.id.class()
    }

    /// Attribute value, `None` while unset.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Raw role slot. Slots are created on first write, so an untouched role reads `None`.
    pub fn role(&self, name: &str) -> Option<&RoleValue> {
        self.roles.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn roles(&self) -> impl Iterator<Item = (&str, &RoleValue)> {
        self.roles.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn put_attribute(&mut self, name: &str, value: Option<Value>) -> Option<Value> {
        match value {
            Some(value) => self.attributes.insert(name.to_string(), value),
            None => self.attributes.remove(name),
        }
    }

    pub(crate) fn role_mut(&mut self, name: &str, arity: Arity) -> &mut RoleValue {
        self.roles
            .entry(name.to_string())
            .or_insert_with(|| RoleValue::empty(arity))
    }
}
