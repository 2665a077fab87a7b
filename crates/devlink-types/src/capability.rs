//! Capability tables: the explicit property/method surface of an object.
//!
//! Every device class is a thin list of names. Instead of resolving names by
//! reflection at call time, an adapter builds a [`CapabilityTable`] once at
//! construction and dispatches through it. Any name is valid input; names
//! absent from the table resolve to `None`, which the dispatcher reports as
//! "property does not exist".

use crate::value::ValueKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Prefix turning a settable property name into its command name.
pub const SET_PREFIX: &str = "Set";

/// What a name in the table refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Capability {
    /// A callable method.
    Method {
        /// Arguments and result travel as base64 binary.
        #[serde(default)]
        binary: bool,
    },
    /// A readable property, optionally writable through `Set<name>`.
    Property {
        #[serde(default)]
        kind: ValueKind,
        #[serde(default)]
        settable: bool,
        #[serde(default)]
        binary: bool,
    },
}

impl Capability {
    pub fn is_binary(&self) -> bool {
        match self {
            Capability::Method { binary } => *binary,
            Capability::Property { binary, .. } => *binary,
        }
    }
}

/// A resolved operation against a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Call the method `name`.
    Invoke { name: String, binary: bool },
    /// Read the property `name`.
    Read { name: String, binary: bool },
    /// Write the property `name` (from a `Set<name>` command).
    Write { name: String, binary: bool },
}

/// Callable/settable names and declared events of one object type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityTable {
    #[serde(default)]
    entries: HashMap<String, Capability>,
    #[serde(default)]
    events: BTreeSet<String>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, name: &str) -> Self {
        self.entries
            .insert(name.to_string(), Capability::Method { binary: false });
        self
    }

    pub fn binary_method(mut self, name: &str) -> Self {
        self.entries
            .insert(name.to_string(), Capability::Method { binary: true });
        self
    }

    /// A read-only property.
    pub fn property(mut self, name: &str, kind: ValueKind) -> Self {
        self.entries.insert(
            name.to_string(),
            Capability::Property {
                kind,
                settable: false,
                binary: kind == ValueKind::Bytes,
            },
        );
        self
    }

    /// A property writable through `Set<name>`.
    pub fn settable(mut self, name: &str, kind: ValueKind) -> Self {
        self.entries.insert(
            name.to_string(),
            Capability::Property {
                kind,
                settable: true,
                binary: kind == ValueKind::Bytes,
            },
        );
        self
    }

    pub fn event(mut self, name: &str) -> Self {
        self.events.insert(name.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.entries.get(name)
    }

    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.iter().map(String::as_str)
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.contains(name)
    }

    pub fn callable(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|(name, cap)| match cap {
            Capability::Method { .. } => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn settable_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|(name, cap)| match cap {
            Capability::Property { settable: true, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Resolve a Command name: a method, or `Set<prop>` for a settable property.
    pub fn resolve_command(&self, name: &str) -> Option<Operation> {
        if let Some(Capability::Method { binary }) = self.entries.get(name) {
            return Some(Operation::Invoke {
                name: name.to_string(),
                binary: *binary,
            });
        }
        let prop = name.strip_prefix(SET_PREFIX)?;
        match self.entries.get(prop) {
            Some(Capability::Property {
                settable: true,
                binary,
                ..
            }) => Some(Operation::Write {
                name: prop.to_string(),
                binary: *binary,
            }),
            _ => None,
        }
    }

    /// Resolve a Query name: a property read, or a method whose result is
    /// the reply.
    pub fn resolve_query(&self, name: &str) -> Option<Operation> {
        match self.entries.get(name)? {
            Capability::Property { binary, .. } => Some(Operation::Read {
                name: name.to_string(),
                binary: *binary,
            }),
            Capability::Method { binary } => Some(Operation::Invoke {
                name: name.to_string(),
                binary: *binary,
            }),
        }
    }
}

/// How a proxy caches a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Query once, then serve from the local cache.
    FetchOnceThenCache,
    /// Query the peer on every access.
    #[default]
    AlwaysFetchLive,
}

/// Caller-side declaration of one property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySpec {
    pub name: String,
    #[serde(default)]
    pub kind: ValueKind,
    #[serde(default)]
    pub policy: CachePolicy,
}

impl PropertySpec {
    pub fn cached(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            policy: CachePolicy::FetchOnceThenCache,
        }
    }

    pub fn live(name: &str, kind: ValueKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            policy: CachePolicy::AlwaysFetchLive,
        }
    }
}
