//! Class, attribute, link and extension definitions, plus the schema wire format.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::link_spec::{self, Arity, Endpoint, LinkSpec, RoleDesc};
use crate::registry::Registry;
use crate::visibility::{ViewerOptions, Visibility};

/// Callable extension entry. Stays local; never part of the exported schema.
pub type Method = Rc<dyn Fn(&Registry, &Instance) -> Value>;

#[derive(Clone, Debug)]
pub struct ClassDef {
    pub name: String,
    pub visibility: Visibility,
    pub superclass: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AttributeDef {
    pub class: String,
    pub name: String,
    /// Advisory only; values are never checked against it.
    pub type_tag: String,
    pub visibility: Visibility,
}

/// One half of a link, owned by `class`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleDef {
    pub class: String,
    pub name: String,
    pub arity: Arity,
    pub target: String,
    /// Name of the paired role, declared on `target`.
    pub reciprocal: String,
    pub link: usize,
}

#[derive(Clone, Debug)]
pub struct LinkDef {
    pub spec: LinkSpec,
    pub visibility: Visibility,
}

/// Values and callables merged onto a class.
#[derive(Clone, Default)]
pub struct Extension {
    values: Map<String, Value>,
    methods: BTreeMap<String, Method>,
}

impl Extension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn method(
        mut self,
        key: impl Into<String>,
        method: impl Fn(&Registry, &Instance) -> Value + 'static,
    ) -> Self {
        self.methods.insert(key.into(), Rc::new(method));
        self
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

impl From<Map<String, Value>> for Extension {
    fn from(values: Map<String, Value>) -> Self {
        Self {
            values,
            methods: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("values", &self.values)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A field declared on a class: either a scalar attribute or a role.
#[derive(Clone, Copy, Debug)]
pub enum FieldDef<'a> {
    Attribute(&'a AttributeDef),
    Role(&'a RoleDef),
}

impl FieldDef<'_> {
    pub fn name(&self) -> &str {
        match self {
            FieldDef::Attribute(def) => &def.name,
            FieldDef::Role(def) => &def.name,
        }
    }
}

/// Endpoint as it travels in an exported schema. Compacted to a bare class name when
/// arity and name are the defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireEndpoint {
    Class(String),
    Role {
        class: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arity: Option<Arity>,
    },
}

impl From<&RoleDesc> for WireEndpoint {
    fn from(desc: &RoleDesc) -> Self {
        if desc.arity == Arity::One && desc.has_default_name() {
            WireEndpoint::Class(desc.class.clone())
        } else {
            WireEndpoint::Role {
                class: desc.class.clone(),
                name: Some(desc.name.clone()),
                arity: Some(desc.arity),
            }
        }
    }
}

impl From<WireEndpoint> for Endpoint {
    fn from(wire: WireEndpoint) -> Self {
        match wire {
            WireEndpoint::Class(class) => Endpoint::new(class),
            WireEndpoint::Role { class, name, arity } => Endpoint { class, name, arity },
        }
    }
}

/// A link entry: an endpoint pair, or a pair plus a shorthand string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkEntry {
    Pair(WireEndpoint, WireEndpoint),
    WithShorthand(WireEndpoint, WireEndpoint, String),
}

/// The exported schema, one list per definition kind, in declaration order.
///
/// `inherits` pairs each subclass with its superclass; it is left out of the payload
/// when no class has one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaExport {
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<(String, String, String)>,
    #[serde(default)]
    pub links: Vec<LinkEntry>,
    #[serde(default)]
    pub extensions: Vec<(String, Map<String, Value>)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherits: Vec<(String, String)>,
}

#[derive(Default)]
pub struct Schema {
    classes: Vec<ClassDef>,
    class_index: HashMap<String, usize>,
    attributes: Vec<AttributeDef>,
    attribute_index: HashMap<(String, String), usize>,
    links: Vec<LinkDef>,
    roles: HashMap<(String, String), RoleDef>,
    extensions: Vec<(String, Extension)>,
}

fn key(class: &str, name: &str) -> (String, String) {
    (class.to_string(), name.to_string())
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_class(&mut self, name: &str, visibility: Visibility) -> Result<&ClassDef> {
        self.insert_class(name, visibility, None)
    }

    pub fn get_or_declare_class(
        &mut self,
        name: &str,
        visibility: Visibility,
    ) -> Result<&ClassDef> {
        if let Some(&idx) = self.class_index.get(name) {
            return Ok(&self.classes[idx]);
        }
        self.insert_class(name, visibility, None)
    }

    /// Declare `name` as a subclass of `superclass`. Field and extension lookups on the
    /// subclass fall through to the superclass chain.
    pub fn inherit(
        &mut self,
        superclass: &str,
        name: &str,
        visibility: Visibility,
    ) -> Result<&ClassDef> {
        self.require_class(superclass)?;
        self.insert_class(name, visibility, Some(superclass.to_string()))
    }

    fn insert_class(
        &mut self,
        name: &str,
        visibility: Visibility,
        superclass: Option<String>,
    ) -> Result<&ClassDef> {
        if name.is_empty() || name.contains('@') {
            return Err(Error::InvalidPayload(format!("invalid class name '{name}'")));
        }
        if self.class_index.contains_key(name) {
            return Err(Error::DuplicateClass(name.to_string()));
        }
        debug!("declaring class {name}");
        self.class_index.insert(name.to_string(), self.classes.len());
        self.classes.push(ClassDef {
            name: name.to_string(),
            visibility,
            superclass,
        });
        Ok(&self.classes[self.classes.len() - 1])
    }

    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.class_index.get(name).map(|&idx| &self.classes[idx])
    }

    pub fn require_class(&self, name: &str) -> Result<&ClassDef> {
        self.class(name)
            .ok_or_else(|| Error::UnknownClass(name.to_string()))
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.iter()
    }

    /// `class` followed by its superclasses, nearest first.
    pub fn lineage<'a>(&'a self, class: &'a str) -> Vec<&'a str> {
        let mut chain = Vec::new();
        let mut current = Some(class);
        while let Some(name) = current {
            if chain.contains(&name) {
                break;
            }
            chain.push(name);
            current = self.class(name).and_then(|def| def.superclass.as_deref());
        }
        chain
    }

    pub fn is_a(&self, class: &str, ancestor: &str) -> bool {
        self.lineage(class).contains(&ancestor)
    }

    pub fn declare_attribute(
        &mut self,
        class: &str,
        name: &str,
        type_tag: &str,
        visibility: Visibility,
    ) -> Result<()> {
        self.require_class(class)?;
        if self.field(class, name).is_some() {
            return Err(Error::DuplicateField {
                class: class.to_string(),
                field: name.to_string(),
            });
        }
        debug!("declaring attribute {class}.{name}: {type_tag}");
        self.attribute_index
            .insert(key(class, name), self.attributes.len());
        self.attributes.push(AttributeDef {
            class: class.to_string(),
            name: name.to_string(),
            type_tag: type_tag.to_string(),
            visibility,
        });
        Ok(())
    }

    pub fn declare_link(
        &mut self,
        from: Endpoint,
        to: Endpoint,
        shorthand: Option<&str>,
        visibility: Visibility,
    ) -> Result<&LinkSpec> {
        let spec = link_spec::resolve(from, to, shorthand)?;
        self.insert_link(spec, visibility)
    }

    fn insert_link(&mut self, spec: LinkSpec, visibility: Visibility) -> Result<&LinkSpec> {
        self.require_class(&spec.from.class)?;
        self.require_class(&spec.to.class)?;
        // role on `to` named after `from`, and the converse
        for (owner, name) in [
            (&spec.to.class, &spec.from.name),
            (&spec.from.class, &spec.to.name),
        ] {
            if self.field(owner, name).is_some() {
                return Err(Error::DuplicateField {
                    class: owner.clone(),
                    field: name.clone(),
                });
            }
        }

        let link = self.links.len();
        let on_to = RoleDef {
            class: spec.to.class.clone(),
            name: spec.from.name.clone(),
            arity: spec.from.arity,
            target: spec.from.class.clone(),
            reciprocal: spec.to.name.clone(),
            link,
        };
        let on_from = RoleDef {
            class: spec.from.class.clone(),
            name: spec.to.name.clone(),
            arity: spec.to.arity,
            target: spec.to.class.clone(),
            reciprocal: spec.from.name.clone(),
            link,
        };
        debug!(
            "declaring link {}.{} <-> {}.{}",
            on_from.class, on_from.name, on_to.class, on_to.name
        );
        self.roles.insert(key(&on_to.class, &on_to.name), on_to);
        self.roles.insert(key(&on_from.class, &on_from.name), on_from);
        self.links.push(LinkDef { spec, visibility });
        Ok(&self.links[link].spec)
    }

    pub fn declare_extension(&mut self, class: &str, extension: Extension) -> Result<()> {
        self.require_class(class)?;
        debug!("extending {class} with {:?}", extension);
        self.extensions.push((class.to_string(), extension));
        Ok(())
    }

    pub fn attribute(&self, class: &str, name: &str) -> Option<&AttributeDef> {
        self.lineage(class).into_iter().find_map(|owner| {
            self.attribute_index
                .get(&key(owner, name))
                .map(|&idx| &self.attributes[idx])
        })
    }

    pub fn role(&self, class: &str, name: &str) -> Option<&RoleDef> {
        self.lineage(class)
            .into_iter()
            .find_map(|owner| self.roles.get(&key(owner, name)))
    }

    pub fn field(&self, class: &str, name: &str) -> Option<FieldDef<'_>> {
        self.attribute(class, name)
            .map(FieldDef::Attribute)
            .or_else(|| self.role(class, name).map(FieldDef::Role))
    }

    pub fn require_field(&self, class: &str, name: &str) -> Result<FieldDef<'_>> {
        self.field(class, name).ok_or_else(|| Error::UnknownField {
            class: class.to_string(),
            field: name.to_string(),
        })
    }

    /// The role paired with `role`, declared on its target class.
    pub fn reciprocal(&self, role: &RoleDef) -> Result<&RoleDef> {
        self.roles
            .get(&key(&role.target, &role.reciprocal))
            .ok_or_else(|| {
                Error::InconsistentState(format!(
                    "{}.{} has no reciprocal {}.{}",
                    role.class, role.name, role.target, role.reciprocal
                ))
            })
    }

    pub fn link(&self, idx: usize) -> &LinkDef {
        &self.links[idx]
    }

    /// Every field applicable to `class`: attributes first, then roles, each in
    /// declaration order, superclass fields included.
    pub fn fields_of(&self, class: &str) -> Vec<FieldDef<'_>> {
        let lineage = self.lineage(class);
        let mut fields: Vec<FieldDef<'_>> = self
            .attributes
            .iter()
            .filter(|def| lineage.contains(&def.class.as_str()))
            .map(FieldDef::Attribute)
            .collect();
        for link in &self.links {
            let spec = &link.spec;
            for (owner, name) in [
                (&spec.from.class, &spec.to.name),
                (&spec.to.class, &spec.from.name),
            ] {
                if lineage.contains(&owner.as_str()) {
                    if let Some(role) = self.roles.get(&key(owner, name)) {
                        fields.push(FieldDef::Role(role));
                    }
                }
            }
        }
        fields
    }

    /// Most recently declared data value for `key`, searching up the class chain.
    pub fn extension_value(&self, class: &str, key: &str) -> Option<&Value> {
        self.lineage(class).into_iter().find_map(|owner| {
            self.extensions
                .iter()
                .rev()
                .filter(|(name, _)| name == owner)
                .find_map(|(_, ext)| ext.values.get(key))
        })
    }

    pub fn extension_method(&self, class: &str, key: &str) -> Option<&Method> {
        self.lineage(class).into_iter().find_map(|owner| {
            self.extensions
                .iter()
                .rev()
                .filter(|(name, _)| name == owner)
                .find_map(|(_, ext)| ext.methods.get(key))
        })
    }

    pub fn class_visible(
        &self,
        class: &str,
        viewer: &ViewerOptions,
        instance: Option<&Instance>,
    ) -> bool {
        self.class(class)
            .is_some_and(|def| def.visibility.allows(viewer, instance))
    }

    /// Schema as seen by `viewer`, filtered with structural (instance-less) decisions.
    pub fn export(&self, viewer: &ViewerOptions) -> SchemaExport {
        let visible = |class: &str| self.class_visible(class, viewer, None);
        SchemaExport {
            classes: self
                .classes
                .iter()
                .filter(|def| def.visibility.allows(viewer, None))
                .map(|def| def.name.clone())
                .collect(),
            attributes: self
                .attributes
                .iter()
                .filter(|def| visible(&def.class) && def.visibility.allows(viewer, None))
                .map(|def| (def.class.clone(), def.name.clone(), def.type_tag.clone()))
                .collect(),
            links: self
                .links
                .iter()
                .filter(|link| {
                    visible(&link.spec.from.class)
                        && visible(&link.spec.to.class)
                        && link.visibility.allows(viewer, None)
                })
                .map(|link| {
                    LinkEntry::Pair((&link.spec.from).into(), (&link.spec.to).into())
                })
                .collect(),
            extensions: self
                .extensions
                .iter()
                .filter(|(class, _)| visible(class))
                .map(|(class, ext)| (class.clone(), ext.values.clone()))
                .collect(),
            inherits: self
                .classes
                .iter()
                .filter(|def| def.visibility.allows(viewer, None))
                .filter_map(|def| {
                    let mut ancestors = self.lineage(&def.name).into_iter().skip(1);
                    let parent = ancestors.find(|class| visible(class))?;
                    Some((def.name.clone(), parent.to_string()))
                })
                .collect(),
        }
    }

    /// Materialize an exported schema. Existing classes are reused and identical
    /// attributes and links are skipped, so importing twice is harmless.
    pub fn import(&mut self, export: SchemaExport) -> Result<()> {
        let parents: HashMap<&str, &str> = export
            .inherits
            .iter()
            .map(|(class, parent)| (class.as_str(), parent.as_str()))
            .collect();
        for class in &export.classes {
            let parent = parents.get(class.as_str()).copied();
            if let Some(existing) = self.class(class) {
                if existing.superclass.as_deref() != parent {
                    return Err(Error::InvalidPayload(format!(
                        "class {class} extends {:?} here, {parent:?} remotely",
                        existing.superclass
                    )));
                }
                continue;
            }
            match parent {
                Some(parent) => self.inherit(parent, class, Visibility::Always)?,
                None => self.declare_class(class, Visibility::Always)?,
            };
        }
        for (class, name, type_tag) in export.attributes {
            if let Some(existing) = self.attribute(&class, &name) {
                if existing.class == class && existing.type_tag == type_tag {
                    continue;
                }
            }
            self.declare_attribute(&class, &name, &type_tag, Visibility::Always)?;
        }
        for entry in export.links {
            let (from, to, shorthand) = match entry {
                LinkEntry::Pair(from, to) => (from, to, None),
                LinkEntry::WithShorthand(from, to, shorthand) => (from, to, Some(shorthand)),
            };
            let spec = link_spec::resolve(from.into(), to.into(), shorthand.as_deref())?;
            let existing = self
                .role(&spec.from.class, &spec.to.name)
                .map(|role| &self.links[role.link].spec);
            if existing == Some(&spec) {
                continue;
            }
            self.insert_link(spec, Visibility::Always)?;
        }
        for (class, values) in export.extensions {
            let known = self
                .extensions
                .iter()
                .any(|(owner, ext)| *owner == class && ext.values == values);
            if known {
                continue;
            }
            self.declare_extension(&class, Extension::from(values))?;
        }
        Ok(())
    }
}
