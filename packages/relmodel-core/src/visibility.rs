use std::fmt;
use std::rc::Rc;

use crate::instance::Instance;

/// Options describing the viewer a replication session serves (e.g. `{"id": 2}`).
pub type ViewerOptions = serde_json::Value;

type Predicate = Rc<dyn Fn(&ViewerOptions, Option<&Instance>) -> bool>;

/// Who may observe a class, attribute or link.
///
/// Predicates must be pure: they run during export, snapshotting, and for every live
/// event of every session. A `None` instance asks for a structural decision, made
/// before any concrete instance is in scope.
#[derive(Clone, Default)]
pub enum Visibility {
    #[default]
    Always,
    Never,
    Predicate(Predicate),
}

impl Visibility {
    pub fn predicate(rule: impl Fn(&ViewerOptions, Option<&Instance>) -> bool + 'static) -> Self {
        Visibility::Predicate(Rc::new(rule))
    }

    pub fn allows(&self, viewer: &ViewerOptions, instance: Option<&Instance>) -> bool {
        match self {
            Visibility::Always => true,
            Visibility::Never => false,
            Visibility::Predicate(rule) => rule(viewer, instance),
        }
    }
}

impl From<bool> for Visibility {
    fn from(visible: bool) -> Self {
        if visible {
            Visibility::Always
        } else {
            Visibility::Never
        }
    }
}

impl fmt::Debug for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Always => f.write_str("Always"),
            Visibility::Never => f.write_str("Never"),
            Visibility::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}
