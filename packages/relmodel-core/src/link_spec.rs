//! Parsing of link declarations.
//!
//! A link joins two endpoints. Each endpoint descriptor `{class: X, name: n, arity: a}`
//! describes how the *opposite* class refers to `X`: the opposite class receives a role
//! named `n`, holding `a` references to `X`. `link(Game, Player, "1-*")` therefore
//! produces `Player.game` (one) and `Game.players` (many).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How many targets a role holds.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Arity {
    #[default]
    #[serde(rename = "1")]
    One,
    #[serde(rename = "*")]
    Many,
}

impl Arity {
    fn parse(raw: &str, shorthand: &str) -> Result<Self> {
        match raw {
            "1" => Ok(Arity::One),
            "*" => Ok(Arity::Many),
            other => Err(Error::InvalidLinkSpec(format!(
                "{shorthand}: arity must be '1' or '*', got '{other}'"
            ))),
        }
    }
}

/// A possibly incomplete endpoint as supplied by the caller.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Endpoint {
    pub class: String,
    pub name: Option<String>,
    pub arity: Option<Arity>,
}

impl Endpoint {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            name: None,
            arity: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_arity(mut self, arity: Arity) -> Self {
        self.arity = Some(arity);
        self
    }

    pub fn one(self) -> Self {
        self.with_arity(Arity::One)
    }

    pub fn many(self) -> Self {
        self.with_arity(Arity::Many)
    }
}

impl From<&str> for Endpoint {
    fn from(class: &str) -> Self {
        Endpoint::new(class)
    }
}

impl From<String> for Endpoint {
    fn from(class: String) -> Self {
        Endpoint::new(class)
    }
}

/// A fully resolved endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RoleDesc {
    pub class: String,
    pub name: String,
    pub arity: Arity,
}

impl RoleDesc {
    /// Whether `name` is what the parser would have picked on its own.
    pub fn has_default_name(&self) -> bool {
        self.name == default_role_name(&self.class, self.arity)
    }
}

/// Both resolved endpoints of one link.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct LinkSpec {
    pub from: RoleDesc,
    pub to: RoleDesc,
}

impl LinkSpec {
    pub fn is_self_link(&self) -> bool {
        self.from.class == self.to.class
    }
}

#[derive(Debug, Default, PartialEq)]
struct Side {
    arity: Option<Arity>,
    name: Option<String>,
}

/// Default role name for references to `class`: the lower-cased class name, pluralized
/// with `s` for `many` roles.
pub fn default_role_name(class: &str, arity: Arity) -> String {
    let mut name = class.to_lowercase();
    if arity == Arity::Many {
        name.push('s');
    }
    name
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c == '-' || c == ':' || c.is_whitespace())
}

fn parse_side(raw: &str, shorthand: &str) -> Result<Side> {
    let (arity, name) = match raw.split_once(':') {
        Some((arity, name)) => (arity, Some(name)),
        None => (raw, None),
    };
    let arity = Arity::parse(arity, shorthand)?;
    if let Some(name) = name {
        if !valid_name(name) {
            return Err(Error::InvalidLinkSpec(format!(
                "{shorthand}: invalid role name '{name}'"
            )));
        }
    }
    Ok(Side {
        arity: Some(arity),
        name: name.map(str::to_string),
    })
}

fn parse_shorthand(shorthand: &str) -> Result<(Side, Side)> {
    let mut parts = shorthand.split('-');
    let (Some(left), Some(right), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::InvalidLinkSpec(format!(
            "{shorthand}: expected '<side>-<side>'"
        )));
    };
    Ok((parse_side(left, shorthand)?, parse_side(right, shorthand)?))
}

fn complete(endpoint: Endpoint, side: Side) -> Result<RoleDesc> {
    if endpoint.class.is_empty() {
        return Err(Error::InvalidLinkSpec("endpoint without class".into()));
    }
    let arity = endpoint.arity.or(side.arity).unwrap_or_default();
    let name = match endpoint.name.or(side.name) {
        Some(name) if valid_name(&name) => name,
        Some(name) => {
            return Err(Error::InvalidLinkSpec(format!("invalid role name '{name}'")));
        }
        None => default_role_name(&endpoint.class, arity),
    };
    Ok(RoleDesc {
        class: endpoint.class,
        name,
        arity,
    })
}

/// Resolve two endpoints and an optional shorthand into a complete link.
///
/// Values given explicitly on an endpoint take precedence; the shorthand only fills gaps.
pub fn resolve(from: Endpoint, to: Endpoint, shorthand: Option<&str>) -> Result<LinkSpec> {
    let (left, right) = match shorthand {
        Some(raw) => parse_shorthand(raw)?,
        None => (Side::default(), Side::default()),
    };
    let spec = LinkSpec {
        from: complete(from, left)?,
        to: complete(to, right)?,
    };
    if spec.is_self_link() && spec.from.name == spec.to.name {
        return Err(Error::InvalidLinkSpec(format!(
            "self-link on {} needs two distinct role names, got '{}' twice",
            spec.from.class, spec.from.name
        )));
    }
    Ok(spec)
}
