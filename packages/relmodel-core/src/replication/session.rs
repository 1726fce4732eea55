use std::collections::HashSet;

use log::{debug, trace, warn};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::events::{Event, FieldValue, SubscriptionId, Topic};
use crate::ids::InstanceId;
use crate::instance::{Instance, RoleValue};
use crate::link_spec::Arity;
use crate::registry::Registry;
use crate::schema::FieldDef;
use crate::visibility::ViewerOptions;

use super::message::{wire_value, ReplicationMessage};
use super::ReplicationSink;

/// Visibility decisions for one viewer. An element is visible when its rule passes both
/// the structural check (no instance, which is what decides schema export) and the
/// per-instance check.
struct Filter<'a> {
    registry: &'a Registry,
    viewer: &'a ViewerOptions,
}

impl<'a> Filter<'a> {
    fn class_exported(&self, class: &str) -> bool {
        self.registry.schema().class_visible(class, self.viewer, None)
    }

    fn instance_visible(&self, id: &InstanceId) -> bool {
        let Some(instance) = self.registry.get_or_null(id) else {
            return false;
        };
        self.registry.schema().class(instance.class()).is_some_and(|def| {
            def.visibility.allows(self.viewer, None)
                && def.visibility.allows(self.viewer, Some(instance))
        })
    }

    fn field_visible(&self, instance: &Instance, field: FieldDef<'_>) -> bool {
        let rule = match field {
            FieldDef::Attribute(def) => {
                if !self.class_exported(&def.class) {
                    return false;
                }
                &def.visibility
            }
            FieldDef::Role(def) => {
                let link = self.registry.schema().link(def.link);
                if !self.class_exported(&link.spec.from.class)
                    || !self.class_exported(&link.spec.to.class)
                {
                    return false;
                }
                &link.visibility
            }
        };
        rule.allows(self.viewer, None) && rule.allows(self.viewer, Some(instance))
    }

    /// Snapshot text for `ids`, keeping only references accepted by `keep_ref`.
    fn snapshot(
        &self,
        ids: &[InstanceId],
        keep_ref: impl Fn(&InstanceId) -> bool,
    ) -> Result<String> {
        let mut payload = Map::new();
        for id in ids {
            let fields = self.registry.plain(
                id,
                |instance, field| self.field_visible(instance, field),
                &keep_ref,
            )?;
            payload.insert(id.to_string(), Value::Object(fields));
        }
        Ok(Value::Object(payload).to_string())
    }
}

/// A live replication stream to one viewer.
pub(crate) struct Session<S> {
    viewer: ViewerOptions,
    introduced: HashSet<InstanceId>,
    sink: S,
}

impl<S: ReplicationSink> Session<S> {
    pub(crate) fn new(viewer: ViewerOptions, sink: S) -> Self {
        Self {
            viewer,
            introduced: HashSet::new(),
            sink,
        }
    }

    /// Deliver the schema and the full visible snapshot.
    pub(crate) fn start(&mut self, registry: &Registry) -> Result<()> {
        let filter = Filter {
            registry,
            viewer: &self.viewer,
        };
        let schema = registry.export_schema(&self.viewer)?;
        let visible: Vec<InstanceId> = registry
            .instances()
            .map(Instance::id)
            .filter(|id| filter.instance_visible(id))
            .cloned()
            .collect();
        let snapshot = filter.snapshot(&visible, |id| filter.instance_visible(id))?;
        debug!(
            "replicating {} of {} instance(s) to viewer {}",
            visible.len(),
            registry.len(),
            self.viewer
        );
        self.introduced.extend(visible);
        self.sink.deliver(ReplicationMessage::Schema(schema));
        self.sink.deliver(ReplicationMessage::Snapshot(snapshot));
        Ok(())
    }

    pub(crate) fn forward(&mut self, event: &Event, registry: &Registry) {
        let mut translation = Translation {
            filter: Filter {
                registry,
                viewer: &self.viewer,
            },
            introduced: &mut self.introduced,
            out: Vec::new(),
        };
        if let Err(err) = translation.translate(event) {
            warn!(
                "dropping {} on {} for viewer {}: {err}",
                event.kind(),
                event.instance(),
                self.viewer
            );
        }
        let messages = translation.out;
        for message in messages {
            self.sink.deliver(message);
        }
    }
}

/// Turns one source event into the messages one viewer should see.
struct Translation<'a> {
    filter: Filter<'a>,
    introduced: &'a mut HashSet<InstanceId>,
    out: Vec<ReplicationMessage>,
}

impl Translation<'_> {
    /// Make sure the viewer knows `id`, sending a single-instance snapshot when it does
    /// not yet. `false` when the instance is not visible at all.
    fn introduce(&mut self, id: &InstanceId) -> Result<bool> {
        if self.introduced.contains(id) {
            return Ok(true);
        }
        if !self.filter.instance_visible(id) {
            return Ok(false);
        }
        self.introduced.insert(id.clone());
        let introduced = &*self.introduced;
        let snapshot = self
            .filter
            .snapshot(std::slice::from_ref(id), |other| introduced.contains(other))?;
        trace!("introducing {id} late");
        self.out.push(ReplicationMessage::Snapshot(snapshot));
        self.realign(id)?;
        Ok(true)
    }

    /// The mirror appends a late instance to every sequence that holds it. Send the
    /// sequences where it does not belong last in their real order.
    fn realign(&mut self, id: &InstanceId) -> Result<()> {
        let registry = self.filter.registry;
        let Some(instance) = registry.get_or_null(id) else {
            return Ok(());
        };
        for field in registry.schema().fields_of(instance.class()) {
            let FieldDef::Role(role) = field else {
                continue;
            };
            let reciprocal = registry.schema().reciprocal(role)?;
            if reciprocal.arity != Arity::Many || !self.filter.field_visible(instance, field) {
                continue;
            }
            let targets = instance.role(&role.name).map_or(&[][..], RoleValue::targets);
            for target in targets.iter().filter(|t| self.introduced.contains(*t)) {
                let Some(holder) = registry.get_or_null(target) else {
                    continue;
                };
                if !self.filter.field_visible(holder, FieldDef::Role(reciprocal)) {
                    continue;
                }
                let members: Vec<InstanceId> = holder
                    .role(&reciprocal.name)
                    .map_or(&[][..], RoleValue::targets)
                    .iter()
                    .filter(|member| self.introduced.contains(*member))
                    .cloned()
                    .collect();
                if members.last() == Some(id) {
                    continue;
                }
                let appended: Vec<InstanceId> = members
                    .iter()
                    .filter(|member| *member != id)
                    .chain(std::iter::once(id))
                    .cloned()
                    .collect();
                self.out.push(ReplicationMessage::Change {
                    field: reciprocal.name.clone(),
                    new: wire_value(&FieldValue::Refs(members)),
                    old: wire_value(&FieldValue::Refs(appended)),
                    id: target.clone(),
                });
            }
        }
        Ok(())
    }

    /// The part of a new role value the viewer may see, introducing targets on the way.
    fn visible_refs(&mut self, value: &FieldValue) -> Result<FieldValue> {
        Ok(match value {
            FieldValue::Ref(Some(target)) if self.introduce(target)? => value.clone(),
            FieldValue::Ref(_) => FieldValue::Ref(None),
            FieldValue::Refs(targets) => {
                let mut kept = Vec::with_capacity(targets.len());
                for target in targets {
                    if self.introduce(target)? {
                        kept.push(target.clone());
                    }
                }
                FieldValue::Refs(kept)
            }
            FieldValue::Scalar(_) => value.clone(),
        })
    }

    /// The part of an old role value the viewer already holds.
    fn known_refs(&self, value: &FieldValue) -> FieldValue {
        match value {
            FieldValue::Ref(Some(target)) if self.introduced.contains(target) => value.clone(),
            FieldValue::Ref(_) => FieldValue::Ref(None),
            FieldValue::Refs(targets) => FieldValue::Refs(
                targets
                    .iter()
                    .filter(|target| self.introduced.contains(*target))
                    .cloned()
                    .collect(),
            ),
            FieldValue::Scalar(_) => value.clone(),
        }
    }

    /// Position of `item` among the members of `role` the viewer holds.
    fn rebase(&self, instance: &Instance, role: &str, item: &InstanceId, index: usize) -> usize {
        let members = instance.role(role).map_or(&[][..], RoleValue::targets);
        match members.iter().position(|member| member == item) {
            Some(at) => members[..at]
                .iter()
                .filter(|member| self.introduced.contains(*member))
                .count(),
            None => members[..index.min(members.len())]
                .iter()
                .filter(|member| self.introduced.contains(*member))
                .count(),
        }
    }

    /// Resolve the event's instance and field, if the viewer may see both.
    fn visible_field<'r>(
        &self,
        registry: &'r Registry,
        id: &InstanceId,
        field: &str,
    ) -> Option<(&'r Instance, FieldDef<'r>)> {
        let instance = registry.get_or_null(id)?;
        let def = registry.schema().field(instance.class(), field)?;
        (self.filter.instance_visible(id) && self.filter.field_visible(instance, def))
            .then_some((instance, def))
    }

    fn translate(&mut self, event: &Event) -> Result<()> {
        let registry = self.filter.registry;
        match event {
            Event::Init { instance } => {
                if self.introduced.contains(instance) || !self.filter.instance_visible(instance) {
                    trace!("init of {instance} filtered");
                    return Ok(());
                }
                self.introduced.insert(instance.clone());
                self.out.push(ReplicationMessage::Init {
                    class: instance.class().to_string(),
                    id: instance.clone(),
                });
            }
            Event::Change {
                instance,
                field,
                new,
                old,
            } => {
                let Some((_, def)) = self.visible_field(registry, instance, field) else {
                    trace!("change of {instance}.{field} filtered");
                    return Ok(());
                };
                if !self.introduced.contains(instance) {
                    // the snapshot already carries the new value
                    self.introduce(instance)?;
                    return Ok(());
                }
                let (new, old) = match def {
                    FieldDef::Attribute(_) => (new.clone(), old.clone()),
                    FieldDef::Role(_) => (self.visible_refs(new)?, self.known_refs(old)),
                };
                if matches!(new, FieldValue::Ref(_)) && new == old {
                    trace!("change of {instance}.{field} invisible to viewer");
                    return Ok(());
                }
                self.out.push(ReplicationMessage::Change {
                    field: field.clone(),
                    new: wire_value(&new),
                    old: wire_value(&old),
                    id: instance.clone(),
                });
            }
            Event::AddTo {
                instance,
                role,
                item,
                index,
            } => {
                let Some((holder, _)) = self.visible_field(registry, instance, role) else {
                    trace!("addto on {instance}.{role} filtered");
                    return Ok(());
                };
                if !self.introduce(item)? {
                    trace!("addto of invisible {item} filtered");
                    return Ok(());
                }
                if !self.introduced.contains(instance) {
                    self.introduce(instance)?;
                    return Ok(());
                }
                let index = self.rebase(holder, role, item, *index);
                self.out.push(ReplicationMessage::AddTo {
                    role: role.clone(),
                    item: item.clone(),
                    index,
                    id: instance.clone(),
                });
            }
            Event::RemoveFrom {
                instance,
                role,
                item,
                index,
            } => {
                if !self.introduced.contains(instance) || !self.introduced.contains(item) {
                    return Ok(());
                }
                let Some((holder, _)) = self.visible_field(registry, instance, role) else {
                    trace!("removefrom on {instance}.{role} filtered");
                    return Ok(());
                };
                let index = self.rebase(holder, role, item, *index);
                self.out.push(ReplicationMessage::RemoveFrom {
                    role: role.clone(),
                    item: item.clone(),
                    index,
                    id: instance.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Registry {
    /// Start streaming this registry to `sink` as seen by `viewer`.
    ///
    /// The schema and a snapshot of every visible instance are delivered before this
    /// returns; afterwards each visible event is forwarded as it happens. Pass the
    /// returned id to `unsubscribe` to end the stream. Classes and links declared after
    /// this call are not pushed to the viewer.
    pub fn begin_replication<S>(&mut self, sink: S, viewer: ViewerOptions) -> Result<SubscriptionId>
    where
        S: ReplicationSink + 'static,
    {
        let mut session = Session::new(viewer, sink);
        session.start(self)?;
        Ok(self.subscribe(Topic::All, move |event, registry| {
            session.forward(event, registry)
        }))
    }
}
