//! Parameter registry
//!
//! Maps parameter names to typed slots, in registration order, and mirrors
//! every value into a [`PersistentStore`].
//!
//! # Persistence Rules
//!
//! - On registration the persisted value wins over the caller's initial value,
//!   provided it has the declared type. Otherwise the initial value is written.
//! - Every change goes to the store first; the in-memory value is replaced only
//!   after the store accepted it. A failed change leaves both copies untouched.
//!
//! # Typed Access
//!
//! The registry owns the values. [`ParameterRegistry::register`] hands back a
//! [`ParamHandle<T>`], which reads the slot as `T` for as long as the slot still
//! holds a `T`.

use super::storage::{PersistentStore, StoreError, MAX_PARAMS, PARAM_NAME_LEN};
use super::value::{ParamFlags, ParamKind, ParamValue, Parameter};
use crate::communication::protocol::WireValue;
use crate::{log_info, log_warn};
use core::fmt;
use core::marker::PhantomData;
use heapless::{String, Vec};

/// Registration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistryError {
    /// Parameter name is empty
    EmptyName,
    /// Parameter name exceeds [`PARAM_NAME_LEN`]
    NameTooLong,
    /// Initial string value exceeds its capacity
    ValueTooLong,
    /// [`MAX_PARAMS`] parameters already registered
    Full,
    /// Initial value could not be persisted
    Persistence(StoreError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::EmptyName => write!(f, "parameter name is empty"),
            RegistryError::NameTooLong => write!(f, "parameter name too long"),
            RegistryError::ValueTooLong => write!(f, "parameter value too long"),
            RegistryError::Full => write!(f, "parameter registry full"),
            RegistryError::Persistence(e) => write!(f, "persistence failed: {}", e),
        }
    }
}

/// Reasons a single value change is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ApplyError {
    /// No parameter with this name
    UnknownParameter,
    /// Value cannot be represented as the parameter's type
    TypeMismatch { expected: ParamKind },
    /// Parameter is registered READ_ONLY
    ReadOnly,
    /// Store rejected the new value
    Persistence(StoreError),
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyError::UnknownParameter => write!(f, "unknown parameter"),
            ApplyError::TypeMismatch { expected } => write!(f, "type mismatch, expected {}", expected),
            ApplyError::ReadOnly => write!(f, "parameter is read-only"),
            ApplyError::Persistence(e) => write!(f, "persistence failed: {}", e),
        }
    }
}

/// One registered parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSlot {
    name: String<PARAM_NAME_LEN>,
    value: ParamValue,
    flags: ParamFlags,
}

impl ParameterSlot {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type; fixed for the lifetime of the slot
    pub fn kind(&self) -> ParamKind {
        self.value.kind()
    }

    pub fn value(&self) -> &ParamValue {
        &self.value
    }

    pub fn flags(&self) -> ParamFlags {
        self.flags
    }

    pub fn is_hidden(&self) -> bool {
        self.flags.contains(ParamFlags::HIDDEN)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(ParamFlags::READ_ONLY)
    }
}

/// Typed, capability-checked reference to a registered parameter
pub struct ParamHandle<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ParamHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ParamHandle<T> {}

impl<T> fmt::Debug for ParamHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamHandle").field("index", &self.index).finish()
    }
}

/// Insertion-ordered parameter registry backed by a persistent store
pub struct ParameterRegistry<S: PersistentStore> {
    slots: Vec<ParameterSlot, MAX_PARAMS>,
    store: S,
}

impl<S: PersistentStore> ParameterRegistry<S> {
    /// Create an empty registry over `store`
    pub fn new(store: S) -> Self {
        Self {
            slots: Vec::new(),
            store,
        }
    }

    /// Register a parameter with no flags
    ///
    /// See [`ParameterRegistry::register_with_flags`].
    pub fn register<T: Parameter>(
        &mut self,
        name: &str,
        initial: T,
    ) -> Result<ParamHandle<T>, RegistryError> {
        self.register_with_flags(name, initial, ParamFlags::empty())
    }

    /// Register (or re-register) a parameter
    ///
    /// If the store holds a value of type `T` under `name`, that value becomes
    /// the current value. Otherwise `initial` is persisted and used. A second
    /// registration under the same name replaces the slot in place, keeping its
    /// position in the catalogue.
    ///
    /// # Errors
    ///
    /// - `EmptyName` / `NameTooLong` for invalid names
    /// - `Full` when [`MAX_PARAMS`] distinct names are registered
    /// - `Persistence` when `initial` had to be written and the store refused it
    pub fn register_with_flags<T: Parameter>(
        &mut self,
        name: &str,
        initial: T,
        flags: ParamFlags,
    ) -> Result<ParamHandle<T>, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let key = String::try_from(name).map_err(|_| RegistryError::NameTooLong)?;

        let existing = self.position(name);
        if existing.is_none() && self.slots.is_full() {
            return Err(RegistryError::Full);
        }

        let value = match self.store.load(name) {
            Some(stored) if stored.kind() == T::KIND => stored,
            stale => {
                if let Some(stored) = stale {
                    log_warn!(
                        "Parameter {}: stored {} does not match declared {}, resetting",
                        name,
                        stored.kind(),
                        T::KIND
                    );
                }
                let initial = initial.into_value();
                match self.store.save(name, &initial) {
                    Err(StoreError::Full) => {
                        // Keys left behind by renamed or removed parameters
                        self.prune_store_except(name)
                            .map_err(RegistryError::Persistence)?;
                        self.store
                            .save(name, &initial)
                            .map_err(RegistryError::Persistence)?;
                    }
                    result => result.map_err(RegistryError::Persistence)?,
                }
                initial
            }
        };

        let slot = ParameterSlot {
            name: key,
            value,
            flags,
        };

        let index = match existing {
            Some(index) => {
                self.slots[index] = slot;
                index
            }
            None => {
                self.slots.push(slot).map_err(|_| RegistryError::Full)?;
                self.slots.len() - 1
            }
        };

        Ok(ParamHandle {
            index,
            _marker: PhantomData,
        })
    }

    /// Drop stored values whose names are not registered
    ///
    /// Call once every parameter is registered. Returns how many were dropped.
    pub fn prune_store(&mut self) -> Result<usize, StoreError> {
        self.prune_store_except("")
    }

    fn prune_store_except(&mut self, name: &str) -> Result<usize, StoreError> {
        let slots = &self.slots;
        let removed = self
            .store
            .retain(&|key| key == name || slots.iter().any(|slot| slot.name == key))?;
        if removed > 0 {
            log_info!("Pruned {} unregistered keys from the store", removed);
        }
        Ok(removed)
    }

    /// Look up a slot by name
    pub fn lookup(&self, name: &str) -> Option<&ParameterSlot> {
        self.slots.iter().find(|slot| slot.name == name)
    }

    /// Current value of `name`
    pub fn value(&self, name: &str) -> Option<&ParamValue> {
        self.lookup(name).map(ParameterSlot::value)
    }

    /// Read a parameter through its handle
    ///
    /// Returns `None` if the slot was re-registered with a different type.
    pub fn get<T: Parameter>(&self, handle: &ParamHandle<T>) -> Option<T> {
        self.slots
            .get(handle.index)
            .and_then(|slot| T::from_value(&slot.value))
    }

    /// Change a parameter locally (write-through), bypassing READ_ONLY
    pub fn set<T: Parameter>(&mut self, handle: &ParamHandle<T>, value: T) -> Result<(), ApplyError> {
        let slot = self
            .slots
            .get(handle.index)
            .ok_or(ApplyError::UnknownParameter)?;
        if slot.kind() != T::KIND {
            return Err(ApplyError::TypeMismatch { expected: slot.kind() });
        }

        self.commit(handle.index, value.into_value())
    }

    /// Apply a remote wire value to `name`
    ///
    /// Converts `raw` to the parameter's type, persists it, then updates the
    /// in-memory value. On any error both copies are left unchanged.
    pub fn apply_typed(&mut self, name: &str, raw: &WireValue) -> Result<(), ApplyError> {
        let index = self.position(name).ok_or(ApplyError::UnknownParameter)?;
        let slot = &self.slots[index];
        if slot.is_read_only() {
            return Err(ApplyError::ReadOnly);
        }

        let expected = slot.kind();
        let value = raw
            .coerce(expected)
            .ok_or(ApplyError::TypeMismatch { expected })?;

        self.commit(index, value)
    }

    /// Put a previously read value back into memory without touching the store
    ///
    /// Returns false if `name` is unknown or `snapshot` has another type.
    pub fn restore(&mut self, name: &str, snapshot: ParamValue) -> bool {
        match self.position(name) {
            Some(index) if self.slots[index].kind() == snapshot.kind() => {
                self.slots[index].value = snapshot;
                true
            }
            _ => false,
        }
    }

    /// Iterate slots in registration order
    pub fn iter(&self) -> impl Iterator<Item = &ParameterSlot> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Release the store (e.g. to build a fresh registry after a simulated reboot)
    pub fn into_store(self) -> S {
        self.store
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|slot| slot.name == name)
    }

    fn commit(&mut self, index: usize, value: ParamValue) -> Result<(), ApplyError> {
        let slot = &mut self.slots[index];
        self.store
            .save(&slot.name, &value)
            .map_err(ApplyError::Persistence)?;
        slot.value = value;
        Ok(())
    }
}
