use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::debug;
use serde_json::{Map, Value};

use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::events::{self, Event, EventBus, SubscriptionId, Topic};
use crate::ids::{IdSequence, InstanceId};
use crate::instance::{Instance, RoleValue};
use crate::link_spec::{Arity, Endpoint, LinkSpec};
use crate::schema::{ClassDef, Extension, FieldDef, Schema, SchemaExport};
use crate::visibility::{ViewerOptions, Visibility};

/// Schema, instance arena and event bus for one object graph.
///
/// Registries are independent of each other; instances never cross between them except
/// as ids on the replication wire.
pub struct Registry {
    config: RegistryConfig,
    schema: Schema,
    instances: HashMap<InstanceId, Instance>,
    order: Vec<InstanceId>,
    ids: IdSequence,
    bus: EventBus,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            config,
            schema: Schema::new(),
            instances: HashMap::new(),
            order: Vec::new(),
            ids: IdSequence::default(),
            bus: EventBus::default(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn declare_class(&mut self, name: &str, visibility: impl Into<Visibility>) -> Result<()> {
        self.schema.declare_class(name, visibility.into()).map(|_| ())
    }

    /// The class named `name`, declared with `visibility` if it does not exist yet.
    pub fn get_or_declare_class(
        &mut self,
        name: &str,
        visibility: impl Into<Visibility>,
    ) -> Result<&ClassDef> {
        self.schema.get_or_declare_class(name, visibility.into())
    }

    pub fn inherit(
        &mut self,
        superclass: &str,
        name: &str,
        visibility: impl Into<Visibility>,
    ) -> Result<()> {
        self.schema
            .inherit(superclass, name, visibility.into())
            .map(|_| ())
    }

    pub fn declare_attribute(
        &mut self,
        class: &str,
        name: &str,
        type_tag: &str,
        visibility: impl Into<Visibility>,
    ) -> Result<()> {
        self.schema
            .declare_attribute(class, name, type_tag, visibility.into())
    }

    pub fn declare_link(
        &mut self,
        from: impl Into<Endpoint>,
        to: impl Into<Endpoint>,
        shorthand: Option<&str>,
        visibility: impl Into<Visibility>,
    ) -> Result<LinkSpec> {
        self.schema
            .declare_link(from.into(), to.into(), shorthand, visibility.into())
            .cloned()
    }

    pub fn declare_extension(&mut self, class: &str, extension: Extension) -> Result<()> {
        self.schema.declare_extension(class, extension)
    }

    /// Schema payload as seen by `viewer`.
    pub fn export_schema(&self, viewer: &ViewerOptions) -> Result<String> {
        Ok(serde_json::to_string(&self.schema.export(viewer))?)
    }

    pub fn import_schema(&mut self, payload: &str) -> Result<()> {
        let export: SchemaExport = serde_json::from_str(payload)?;
        self.schema.import(export)
    }

    /// Construct an instance of `class` with the next id and announce it with `init`.
    pub fn create(&mut self, class: &str) -> Result<InstanceId> {
        self.schema.require_class(class)?;
        let id = InstanceId::new(class, self.ids.tick()?);
        self.insert(id.clone())?;
        Ok(id)
    }

    /// Materialize an instance whose id was assigned by a remote peer.
    pub fn register_with_explicit_id(&mut self, id: InstanceId) -> Result<()> {
        self.check_explicit_id(&id)?;
        self.ids.observe(id.seq());
        self.insert(id)
    }

    /// Whether `id` could be registered as is: known class, free slot, sequence in range.
    pub(crate) fn check_explicit_id(&self, id: &InstanceId) -> Result<()> {
        self.schema.require_class(id.class())?;
        if id.seq() > IdSequence::MAX {
            return Err(Error::MalformedId(id.to_string()));
        }
        if self.instances.contains_key(id) {
            return Err(Error::IdentityConflict(id.to_string()));
        }
        Ok(())
    }

    fn insert(&mut self, id: InstanceId) -> Result<()> {
        if self.instances.contains_key(&id) {
            return Err(Error::IdentityConflict(id.to_string()));
        }
        debug!("registering {id}");
        self.instances.insert(id.clone(), Instance::new(id.clone()));
        self.order.push(id.clone());
        self.emit(vec![Event::Init { instance: id }]);
        Ok(())
    }

    pub fn get(&self, id: &InstanceId) -> Result<&Instance> {
        self.instances
            .get(id)
            .ok_or_else(|| Error::UnknownReference(id.to_string()))
    }

    pub fn get_or_null(&self, id: &InstanceId) -> Option<&Instance> {
        self.instances.get(id)
    }

    /// Look an instance up by its wire form, e.g. `"Game@0"`.
    pub fn find(&self, raw: &str) -> Option<&Instance> {
        raw.parse::<InstanceId>()
            .ok()
            .and_then(|id| self.instances.get(&id))
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.contains_key(id)
    }

    pub(crate) fn instance_mut(&mut self, id: &InstanceId) -> Result<&mut Instance> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| Error::UnknownReference(id.to_string()))
    }

    /// Instances in registration order.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.order.iter().filter_map(|id| self.instances.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Plain JSON copy of an instance: set attributes verbatim, single roles as the
    /// target id, many roles as id lists.
    pub fn clone_instance(&self, id: &InstanceId) -> Result<Map<String, Value>> {
        self.plain(id, |_, _| true, |_| true)
    }

    /// Shared by `clone_instance` and the replication snapshot: `keep_field` decides
    /// which fields appear, `keep_ref` which referenced instances survive in roles.
    pub(crate) fn plain(
        &self,
        id: &InstanceId,
        keep_field: impl Fn(&Instance, FieldDef<'_>) -> bool,
        keep_ref: impl Fn(&InstanceId) -> bool,
    ) -> Result<Map<String, Value>> {
        let instance = self.get(id)?;
        let mut out = Map::new();
        for field in self.schema.fields_of(instance.class()) {
            if !keep_field(instance, field) {
                continue;
            }
            match field {
                FieldDef::Attribute(def) => {
                    if let Some(value) = instance.attribute(&def.name) {
                        out.insert(def.name.clone(), value.clone());
                    }
                }
                FieldDef::Role(def) => match instance.role(&def.name) {
                    Some(RoleValue::One(Some(target))) if keep_ref(target) => {
                        out.insert(def.name.clone(), Value::String(target.to_string()));
                    }
                    Some(RoleValue::Many(targets)) => {
                        let ids = targets
                            .iter()
                            .filter(|target| keep_ref(target))
                            .map(|target| Value::String(target.to_string()))
                            .collect();
                        out.insert(def.name.clone(), Value::Array(ids));
                    }
                    None if def.arity == Arity::Many => {
                        out.insert(def.name.clone(), Value::Array(Vec::new()));
                    }
                    _ => {}
                },
            }
        }
        Ok(out)
    }

    /// Validate the graph: every role reference resolves, its reciprocal points back,
    /// and no sequence holds an instance twice. Intended for tests and debugging.
    pub fn validate_invariants(&self) -> Result<()> {
        for instance in self.instances() {
            for (name, value) in instance.roles() {
                let role = self.schema.role(instance.class(), name).ok_or_else(|| {
                    Error::InconsistentState(format!(
                        "{} holds undeclared role {name}",
                        instance.id()
                    ))
                })?;
                let shape_matches = matches!(
                    (role.arity, value),
                    (Arity::One, RoleValue::One(_)) | (Arity::Many, RoleValue::Many(_))
                );
                if !shape_matches {
                    return Err(Error::InconsistentState(format!(
                        "{}.{name} has the wrong arity",
                        instance.id()
                    )));
                }
                let reciprocal = self.schema.reciprocal(role)?;
                let mut seen = HashSet::new();
                for target in value.targets() {
                    if !seen.insert(target) {
                        return Err(Error::InconsistentState(format!(
                            "{}.{name} holds {target} twice",
                            instance.id()
                        )));
                    }
                    let other = self.instances.get(target).ok_or_else(|| {
                        Error::InconsistentState(format!(
                            "{}.{name} points at unknown {target}",
                            instance.id()
                        ))
                    })?;
                    if !self.schema.is_a(other.class(), &role.target) {
                        return Err(Error::InconsistentState(format!(
                            "{}.{name} holds {target}, expected a {}",
                            instance.id(),
                            role.target
                        )));
                    }
                    let back = other
                        .role(&reciprocal.name)
                        .is_some_and(|back| back.contains(instance.id()));
                    if !back {
                        return Err(Error::InconsistentState(format!(
                            "{}.{name} -> {target} but {target}.{} does not point back",
                            instance.id(),
                            reciprocal.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Subscribe to registry-wide events.
    pub fn subscribe(
        &mut self,
        topic: Topic,
        listener: impl FnMut(&Event, &Registry) + 'static,
    ) -> SubscriptionId {
        self.bus
            .subscribe(topic, None, Rc::new(RefCell::new(listener)))
    }

    /// Subscribe to events happening on one instance.
    pub fn subscribe_instance(
        &mut self,
        id: &InstanceId,
        topic: Topic,
        listener: impl FnMut(&Event, &Registry) + 'static,
    ) -> Result<SubscriptionId> {
        self.get(id)?;
        Ok(self
            .bus
            .subscribe(topic, Some(id.clone()), Rc::new(RefCell::new(listener))))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub(crate) fn emit(&self, events: Vec<Event>) {
        events::dispatch(self, events);
    }

    /// Data value merged onto the instance's class by an extension.
    pub fn extension_value(&self, id: &InstanceId, key: &str) -> Result<Option<&Value>> {
        let instance = self.get(id)?;
        Ok(self.schema.extension_value(instance.class(), key))
    }

    /// Run a callable extension entry against the instance. `None` when no class in the
    /// chain declares `key` as a method.
    pub fn call_extension(&self, id: &InstanceId, key: &str) -> Result<Option<Value>> {
        let instance = self.get(id)?;
        let method = self
            .schema
            .extension_method(instance.class(), key)
            .map(Rc::clone);
        Ok(method.map(|method| method(self, instance)))
    }
}
