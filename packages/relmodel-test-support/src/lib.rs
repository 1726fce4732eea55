//! Fixtures shared by the relmodel test suites and benchmarks.

use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use relmodel_core::{
    Event, EventKind, Registry, RegistryConfig, ReplicationMessage, Result, SubscriptionId, Topic,
    ViewerOptions,
};
use serde_json::{Map, Value};

/// `Game 1-* Player`, `Game 1-1 Map`, and a boolean `Game.running`.
pub fn game_registry() -> Registry {
    let mut registry = Registry::new();
    declare_game_schema(&mut registry).expect("game schema");
    registry
}

pub fn declare_game_schema(registry: &mut Registry) -> Result<()> {
    registry.declare_class("Game", true)?;
    registry.declare_class("Player", true)?;
    registry.declare_class("Map", true)?;
    registry.declare_link("Game", "Player", Some("1-*"), true)?;
    registry.declare_link("Game", "Map", Some("1-1"), true)?;
    registry.declare_attribute("Game", "running", "Boolean", true)?;
    Ok(())
}

/// Every instance as its plain JSON copy, keyed by id.
pub fn plain_graph(registry: &Registry) -> BTreeMap<String, Map<String, Value>> {
    registry
        .instances()
        .map(|instance| {
            let plain = registry.clone_instance(instance.id()).expect("clone");
            (instance.id().to_string(), plain)
        })
        .collect()
}

/// Records every event a registry emits.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Rc<RefCell<Vec<Event>>>,
}

impl EventLog {
    pub fn attach(registry: &mut Registry) -> Self {
        Self::attach_to(registry, Topic::All)
    }

    pub fn attach_to(registry: &mut Registry, topic: Topic) -> Self {
        let log = Self::default();
        let events = Rc::clone(&log.events);
        registry.subscribe(topic, move |event, _| events.borrow_mut().push(event.clone()));
        log
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.borrow().iter().map(Event::kind).collect()
    }

    /// `"<kind> <key> <instance>"` per event, e.g. `"addto players Game@0"`.
    pub fn describe(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .map(|event| format!("{} {} {}", event.kind(), event.primary_key(), event.instance()))
            .collect()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

/// A second registry fed by a replication stream. Messages travel through their JSON
/// tuple form, the same way they would cross a process boundary.
#[derive(Clone)]
pub struct Mirror {
    registry: Rc<RefCell<Registry>>,
    messages: Rc<RefCell<Vec<ReplicationMessage>>>,
    errors: Rc<RefCell<Vec<String>>>,
}

impl Default for Mirror {
    fn default() -> Self {
        Self::new()
    }
}

impl Mirror {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry::with_config(config))),
            messages: Rc::new(RefCell::new(Vec::new())),
            errors: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Start replicating `source` into a fresh mirror for `viewer`.
    pub fn attach(source: &mut Registry, viewer: ViewerOptions) -> Result<Self> {
        let mirror = Self::new();
        mirror.follow(source, viewer)?;
        Ok(mirror)
    }

    pub fn follow(&self, source: &mut Registry, viewer: ViewerOptions) -> Result<SubscriptionId> {
        source.begin_replication(self.sink(), viewer)
    }

    pub fn sink(&self) -> impl FnMut(ReplicationMessage) + 'static {
        let registry = Rc::clone(&self.registry);
        let messages = Rc::clone(&self.messages);
        let errors = Rc::clone(&self.errors);
        move |message: ReplicationMessage| {
            let wire = message.to_json();
            messages.borrow_mut().push(message);
            if let Err(err) = registry.borrow_mut().receive_tuple(&wire) {
                errors.borrow_mut().push(format!("{wire}: {err}"));
            }
        }
    }

    pub fn registry(&self) -> Ref<'_, Registry> {
        self.registry.borrow()
    }

    pub fn with_registry<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> T {
        f(&mut self.registry.borrow_mut())
    }

    pub fn messages(&self) -> Vec<ReplicationMessage> {
        self.messages.borrow().clone()
    }

    /// Wire tuples delivered so far, as JSON text.
    pub fn wire(&self) -> Vec<String> {
        self.messages
            .borrow()
            .iter()
            .map(ReplicationMessage::to_json)
            .collect()
    }

    pub fn clear_messages(&self) {
        self.messages.borrow_mut().clear();
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.borrow().clone()
    }

    pub fn graph(&self) -> BTreeMap<String, Map<String, Value>> {
        plain_graph(&self.registry())
    }
}

/// Panic unless the mirror holds exactly the source graph and received it without errors.
pub fn assert_mirror_matches(source: &Registry, mirror: &Mirror) {
    assert_eq!(mirror.errors(), Vec::<String>::new(), "mirror rejected messages");
    assert_eq!(mirror.graph(), plain_graph(source));
    mirror.registry().validate_invariants().expect("mirror invariants");
}
