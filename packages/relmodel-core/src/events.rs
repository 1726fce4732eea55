//! Change notifications.
//!
//! Every mutation produces [`Event`]s. Subscribers pick events by [`Topic`], either
//! registry-wide or for a single instance. `Topic::All` is the aggregated channel the
//! replication sessions tap into.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use log::trace;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::ids::InstanceId;
use crate::registry::Registry;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    Init,
    Change,
    AddTo,
    RemoveFrom,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Init => "init",
            EventKind::Change => "change",
            EventKind::AddTo => "addto",
            EventKind::RemoveFrom => "removefrom",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "init" => Ok(EventKind::Init),
            "change" => Ok(EventKind::Change),
            "addto" => Ok(EventKind::AddTo),
            "removefrom" => Ok(EventKind::RemoveFrom),
            other => Err(Error::InvalidPayload(format!("unknown event kind '{other}'"))),
        }
    }
}

/// New or old value carried by a `change` event.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Scalar(Option<Value>),
    Ref(Option<InstanceId>),
    Refs(Vec<InstanceId>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Init {
        instance: InstanceId,
    },
    Change {
        instance: InstanceId,
        field: String,
        new: FieldValue,
        old: FieldValue,
    },
    AddTo {
        instance: InstanceId,
        role: String,
        item: InstanceId,
        index: usize,
    },
    RemoveFrom {
        instance: InstanceId,
        role: String,
        item: InstanceId,
        index: usize,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Init { .. } => EventKind::Init,
            Event::Change { .. } => EventKind::Change,
            Event::AddTo { .. } => EventKind::AddTo,
            Event::RemoveFrom { .. } => EventKind::RemoveFrom,
        }
    }

    /// Class name for `init`, field or role name for everything else.
    pub fn primary_key(&self) -> &str {
        match self {
            Event::Init { instance } => instance.class(),
            Event::Change { field, .. } => field,
            Event::AddTo { role, .. } | Event::RemoveFrom { role, .. } => role,
        }
    }

    /// The instance the event happened on.
    pub fn instance(&self) -> &InstanceId {
        match self {
            Event::Init { instance }
            | Event::Change { instance, .. }
            | Event::AddTo { instance, .. }
            | Event::RemoveFrom { instance, .. } => instance,
        }
    }
}

/// Which events a subscription receives.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Topic {
    All,
    Kind(EventKind),
    /// Events of one kind whose primary key matches, e.g. `change:running`.
    Keyed(EventKind, String),
}

impl Topic {
    pub fn keyed(kind: EventKind, key: impl Into<String>) -> Self {
        Topic::Keyed(kind, key.into())
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Topic::All => true,
            Topic::Kind(kind) => event.kind() == *kind,
            Topic::Keyed(kind, key) => event.kind() == *kind && event.primary_key() == key,
        }
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "all" {
            return Ok(Topic::All);
        }
        match s.split_once(':') {
            Some((kind, key)) if !key.is_empty() => {
                Ok(Topic::Keyed(kind.parse()?, key.to_string()))
            }
            Some(_) => Err(Error::InvalidPayload(format!("empty topic key in '{s}'"))),
            None => Ok(Topic::Kind(s.parse()?)),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SubscriptionId(u64);

pub(crate) type Listener = Rc<RefCell<dyn FnMut(&Event, &Registry)>>;

struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    instance: Option<InstanceId>,
    listener: Listener,
}

#[derive(Default)]
pub(crate) struct EventBus {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

impl EventBus {
    pub(crate) fn subscribe(
        &mut self,
        topic: Topic,
        instance: Option<InstanceId>,
        listener: Listener,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscriptions.push(Subscription {
            id,
            topic,
            instance,
            listener,
        });
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|sub| sub.id != id);
        before != self.subscriptions.len()
    }

    /// Listeners interested in `event`, in subscription order. Cloned out so the caller
    /// can hand the registry to them while they run.
    pub(crate) fn listeners_for(&self, event: &Event) -> Vec<Listener> {
        self.subscriptions
            .iter()
            .filter(|sub| sub.topic.matches(event))
            .filter(|sub| sub.instance.as_ref().map_or(true, |id| id == event.instance()))
            .map(|sub| Rc::clone(&sub.listener))
            .collect()
    }
}

/// Deliver `events` in order. Each event reaches every matching listener before the
/// next event is looked at.
pub(crate) fn dispatch(registry: &Registry, events: Vec<Event>) {
    for event in events {
        let listeners = registry.bus().listeners_for(&event);
        trace!(
            "{} {} on {} -> {} listener(s)",
            event.kind(),
            event.primary_key(),
            event.instance(),
            listeners.len()
        );
        for listener in listeners {
            match listener.try_borrow_mut() {
                Ok(mut listener) => (&mut *listener)(&event, registry),
                Err(_) => trace!("skipping re-entrant listener for {}", event.kind()),
            }
        }
    }
}
