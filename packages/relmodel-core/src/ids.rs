use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Identifier of an instance, rendered as `<ClassName>@<N>`.
///
/// `N` comes from a single counter per registry, shared by every class, so ordering by
/// sequence number reproduces construction order.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct InstanceId {
    class: String,
    seq: u64,
}

impl InstanceId {
    pub fn new(class: impl Into<String>, seq: u64) -> Self {
        Self {
            class: class.into(),
            seq,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.class, self.seq)
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (class, seq) = s
            .rsplit_once('@')
            .ok_or_else(|| Error::MalformedId(s.to_string()))?;
        if class.is_empty() {
            return Err(Error::MalformedId(s.to_string()));
        }
        let seq = seq
            .parse::<u64>()
            .map_err(|_| Error::MalformedId(s.to_string()))?;
        Ok(Self::new(class, seq))
    }
}

impl Ord for InstanceId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.seq, &self.class).cmp(&(other.seq, &other.class))
    }
}

impl PartialOrd for InstanceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Monotonic id counter. Works like a Lamport clock: local constructions `tick`,
/// ids dictated by a remote peer are `observe`d so the next local tick never reuses them.
#[derive(Clone, Debug, Default)]
pub struct IdSequence {
    next: u64,
}

impl IdSequence {
    /// Largest sequence number a registry hands out or accepts.
    pub const MAX: u64 = u64::MAX - 1;

    pub fn tick(&mut self) -> Result<u64> {
        let seq = self.next;
        if seq > Self::MAX {
            return Err(Error::InconsistentState("instance id space exhausted".into()));
        }
        self.next = seq + 1;
        Ok(seq)
    }

    pub fn observe(&mut self, external: u64) {
        self.next = self.next.max(external.saturating_add(1));
    }
}
