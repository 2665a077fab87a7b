//! Peer registry, the server-side object directory.
//!
//! The [`Registry`] maps each alias to its type and its [`WrappedAdapter`],
//! and runs the per-alias lifecycle driven by Init envelopes:
//!
//! ```text
//! Unregistered -> Constructing -> Ready -> (Reconstructing -> Ready)*
//!              \-> Absent   (presence manifest says the unit is not fitted)
//! ```
//!
//! An alias is unique across all types. Adapters live until process exit.

use crate::adapter::{ResourceFactory, WrappedAdapter};
use crate::link::Link;
use crate::message::{Channel, ErrorCode};
use crate::presence::{alias_id, AllPresent, PresenceManifest};

use devlink_types::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Shared, lockable adapter.
pub type AdapterHandle = Arc<Mutex<WrappedAdapter>>;

/// Lifecycle state of a registered alias. Unregistered aliases have no slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// First construction in progress.
    Constructing,
    /// Resource bound and serving calls.
    Ready,
    /// Old resource destroyed, new one being built.
    Reconstructing,
    /// Init acknowledged, but the unit is not fitted; never constructed.
    Absent,
}

/// What an Init did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// A new adapter was built.
    Constructed,
    /// Same construction args as the live adapter; nothing rebuilt.
    Unchanged,
    /// Construction args changed; the resource was rebuilt in place.
    Reconstructed,
    /// The presence manifest gates this alias; acknowledged, not built.
    Gated,
}

/// Errors from registry operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("alias '{alias}' is already registered as {existing}")]
    AliasConflict { alias: String, existing: String },
    #[error("no factory for type '{0}'")]
    UnknownType(String),
    #[error("construction failed: {0}")]
    Construction(String),
    #[error("object '{0}' is being constructed")]
    Busy(String),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::AliasConflict { .. } => ErrorCode::AliasConflict,
            RegistryError::UnknownType(_) => ErrorCode::UnknownType,
            RegistryError::Construction(_) | RegistryError::Busy(_) => {
                ErrorCode::ConstructionFailed
            }
        }
    }
}

#[derive(Clone)]
struct Slot {
    type_name: String,
    state: SlotState,
    adapter: Option<AdapterHandle>,
}

/// A registered alias, as listed by [`Registry::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub alias: String,
    pub type_name: String,
    pub state: SlotState,
}

/// Thread-safe directory of adapters and the factories that build them.
#[derive(Clone)]
pub struct Registry {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
    factories: Arc<RwLock<HashMap<String, Arc<dyn ResourceFactory>>>>,
    presence: Arc<dyn PresenceManifest>,
}

impl Registry {
    /// Create an empty registry where every object is present.
    pub fn new() -> Self {
        Self::with_presence(Arc::new(AllPresent))
    }

    pub fn with_presence(presence: Arc<dyn PresenceManifest>) -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            factories: Arc::new(RwLock::new(HashMap::new())),
            presence,
        }
    }

    /// Make `factory.type_name()` constructible by Init.
    pub fn add_factory(&self, factory: Arc<dyn ResourceFactory>) {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        factories.insert(factory.type_name().to_string(), factory);
    }

    pub fn factory(&self, type_name: &str) -> Option<Arc<dyn ResourceFactory>> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.get(type_name).cloned()
    }

    /// Register a pre-built adapter (startup-time construction).
    pub fn register(
        &self,
        type_name: &str,
        alias: &str,
        adapter: WrappedAdapter,
    ) -> Result<AdapterHandle, RegistryError> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slots.get(alias) {
            return Err(RegistryError::AliasConflict {
                alias: alias.to_string(),
                existing: existing.type_name.clone(),
            });
        }
        let handle = Arc::new(Mutex::new(adapter));
        slots.insert(
            alias.to_string(),
            Slot {
                type_name: type_name.to_string(),
                state: SlotState::Ready,
                adapter: Some(handle.clone()),
            },
        );
        info!(alias, type_name, "Adapter registered");
        Ok(handle)
    }

    /// Reverse lookup: which type owns `alias`.
    pub fn type_of(&self, alias: &str) -> Option<String> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(alias).map(|s| s.type_name.clone())
    }

    /// Lifecycle state of `alias`; `None` means Unregistered.
    pub fn state(&self, alias: &str) -> Option<SlotState> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(alias).map(|s| s.state)
    }

    /// The adapter registered as `(type_name, alias)`.
    pub fn adapter(&self, type_name: &str, alias: &str) -> Option<AdapterHandle> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .get(alias)
            .filter(|s| s.type_name == type_name)
            .and_then(|s| s.adapter.clone())
    }

    /// Find a sibling adapter by alias alone, e.g. a serial port locating
    /// the device attached to it.
    pub fn sibling(&self, alias: &str) -> Option<AdapterHandle> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.get(alias).and_then(|s| s.adapter.clone())
    }

    /// The adapter for `alias` if it is Ready to serve calls.
    pub fn ready(&self, alias: &str) -> Option<AdapterHandle> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .get(alias)
            .filter(|s| s.state == SlotState::Ready)
            .and_then(|s| s.adapter.clone())
    }

    /// Snapshot of every registered alias.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<_> = slots
            .iter()
            .map(|(alias, slot)| RegistryEntry {
                alias: alias.clone(),
                type_name: slot.type_name.clone(),
                state: slot.state,
            })
            .collect();
        entries.sort_by(|a, b| a.alias.cmp(&b.alias));
        entries
    }

    /// Number of Ready adapters.
    pub fn ready_count(&self) -> usize {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .values()
            .filter(|s| s.state == SlotState::Ready)
            .count()
    }

    fn set_state(&self, alias: &str, state: SlotState) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(alias) {
            slot.state = state;
        }
    }

    fn remove(&self, alias: &str) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.remove(alias);
    }

    /// Process an Init for `alias`. Events of the resulting adapter are
    /// routed to `(link, channel)`.
    pub async fn init(
        &self,
        alias: &str,
        type_name: &str,
        args: Vec<Value>,
        link: Arc<dyn Link>,
        channel: Channel,
    ) -> Result<InitOutcome, RegistryError> {
        let existing = {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            slots.get(alias).cloned()
        };

        match existing {
            Some(slot) if slot.type_name != type_name => Err(RegistryError::AliasConflict {
                alias: alias.to_string(),
                existing: slot.type_name,
            }),
            Some(slot) => match (slot.state, slot.adapter) {
                (SlotState::Absent, _) => Ok(InitOutcome::Gated),
                (SlotState::Ready, Some(handle)) => {
                    self.refresh(alias, handle, args, link, channel).await
                }
                _ => Err(RegistryError::Busy(alias.to_string())),
            },
            None => self.construct(alias, type_name, args, link, channel).await,
        }
    }

    async fn construct(
        &self,
        alias: &str,
        type_name: &str,
        args: Vec<Value>,
        link: Arc<dyn Link>,
        channel: Channel,
    ) -> Result<InitOutcome, RegistryError> {
        let factory = self
            .factory(type_name)
            .ok_or_else(|| RegistryError::UnknownType(type_name.to_string()))?;

        let fitted = alias_id(alias)
            .map(|id| self.presence.exists(type_name, id))
            .unwrap_or(true);

        {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            if slots.contains_key(alias) {
                return Err(RegistryError::Busy(alias.to_string()));
            }
            slots.insert(
                alias.to_string(),
                Slot {
                    type_name: type_name.to_string(),
                    state: if fitted {
                        SlotState::Constructing
                    } else {
                        SlotState::Absent
                    },
                    adapter: None,
                },
            );
        }

        if !fitted {
            info!(alias, type_name, "Not in presence manifest; acknowledged without construction");
            return Ok(InitOutcome::Gated);
        }

        match WrappedAdapter::construct(factory, alias, args).await {
            Ok(adapter) => {
                adapter.route().set(link, channel);
                let handle = Arc::new(Mutex::new(adapter));
                let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
                if let Some(slot) = slots.get_mut(alias) {
                    slot.state = SlotState::Ready;
                    slot.adapter = Some(handle);
                }
                Ok(InitOutcome::Constructed)
            }
            Err(e) => {
                self.remove(alias);
                warn!(alias, type_name, error = %e, "Construction failed");
                Err(RegistryError::Construction(e.to_string()))
            }
        }
    }

    /// Init on a Ready alias: rebuild only when the construction args differ.
    async fn refresh(
        &self,
        alias: &str,
        handle: AdapterHandle,
        args: Vec<Value>,
        link: Arc<dyn Link>,
        channel: Channel,
    ) -> Result<InitOutcome, RegistryError> {
        let mut adapter = handle.lock().await;
        if adapter.construction_args() == args.as_slice() {
            adapter.route().set(link, channel);
            return Ok(InitOutcome::Unchanged);
        }

        self.set_state(alias, SlotState::Reconstructing);
        match adapter.reconstruct(args).await {
            Ok(()) => {
                adapter.route().set(link, channel);
                self.set_state(alias, SlotState::Ready);
                Ok(InitOutcome::Reconstructed)
            }
            Err(e) => {
                drop(adapter);
                self.remove(alias);
                warn!(alias, error = %e, "Reconstruction failed; alias unregistered");
                Err(RegistryError::Construction(e.to_string()))
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
