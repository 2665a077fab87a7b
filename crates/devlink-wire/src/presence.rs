//! Presence manifest: which optional sub-objects physically exist.

use devlink_types::config::PresenceConfig;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Answers whether object `id` of `type_name` is fitted on this unit.
pub trait PresenceManifest: Send + Sync + 'static {
    fn exists(&self, type_name: &str, id: u32) -> bool;
}

/// Every object is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPresent;

impl PresenceManifest for AllPresent {
    fn exists(&self, _type_name: &str, _id: u32) -> bool {
        true
    }
}

/// A fixed manifest. Types it does not mention are not optional and are
/// always present; listed types are present only for the listed ids.
#[derive(Debug, Clone, Default)]
pub struct StaticManifest {
    units: HashMap<String, HashSet<u32>>,
}

impl StaticManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, type_name: &str, ids: impl IntoIterator<Item = u32>) -> Self {
        self.units
            .entry(type_name.to_string())
            .or_default()
            .extend(ids);
        self
    }
}

impl PresenceManifest for StaticManifest {
    fn exists(&self, type_name: &str, id: u32) -> bool {
        match self.units.get(type_name) {
            Some(ids) => ids.contains(&id),
            None => true,
        }
    }
}

/// Build the manifest described by the `[presence]` config section.
pub fn manifest_from_config(config: &PresenceConfig) -> Arc<dyn PresenceManifest> {
    if !config.enforce {
        return Arc::new(AllPresent);
    }
    let manifest = config
        .units
        .iter()
        .fold(StaticManifest::new(), |m, (type_name, ids)| {
            m.with(type_name, ids.iter().copied())
        });
    Arc::new(manifest)
}

/// Numeric id of an alias: its trailing decimal digits (`"Relay12"` -> 12).
pub fn alias_id(alias: &str) -> Option<u32> {
    let digits = alias.len() - alias.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    alias[alias.len() - digits..].parse().ok()
}
