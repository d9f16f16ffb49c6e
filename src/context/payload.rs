//! Type-indexed payload storage.
//!
//! Each pipeline context exclusively owns one `PayloadStore`: a mapping from
//! a type identity to at most one instance of that type. Lookup is total
//! (absence is `None`, never an error) and get-or-add is atomic per store.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type AnyPayload = Arc<dyn Any + Send + Sync>;

/// Container of arbitrary typed values attached to a single unit of work.
///
/// The exclusive section is held across factory invocation, so concurrent
/// `get_or_add_payload` callers for the same type observe exactly one
/// construction and the same returned instance.
#[derive(Default)]
pub struct PayloadStore {
    slots: Mutex<HashMap<TypeId, AnyPayload>>,
}

impl PayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking factory must not wedge the store: recover the guard and
    // leave the slot absent.
    fn slots(&self) -> MutexGuard<'_, HashMap<TypeId, AnyPayload>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pure lookup, no side effects.
    pub fn has_payload<T: Any + Send + Sync>(&self) -> bool {
        self.has_payload_type(TypeId::of::<T>())
    }

    pub fn has_payload_type(&self, payload_type: TypeId) -> bool {
        self.slots().contains_key(&payload_type)
    }

    /// Retrieve a payload by type. Absence is `None`; a present slot always
    /// holds the keyed type, so this never fails for any other reason.
    pub fn try_get_payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.slots()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|payload| payload.downcast::<T>().ok())
    }

    /// Return the existing payload or construct it with `factory`.
    ///
    /// The factory runs at most once per store per type.
    pub fn get_or_add_payload<T, F>(&self, factory: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut slots = self.slots();
        if let Some(existing) = slots
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|payload| payload.downcast::<T>().ok())
        {
            return existing;
        }

        let created = Arc::new(factory());
        slots.insert(TypeId::of::<T>(), created.clone());
        created
    }

    /// Fallible variant of [`get_or_add_payload`](Self::get_or_add_payload).
    ///
    /// A factory error propagates to the caller and the slot stays absent;
    /// no partial insert.
    pub fn try_get_or_add_payload<T, E, F>(&self, factory: F) -> Result<Arc<T>, E>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, E>,
    {
        let mut slots = self.slots();
        if let Some(existing) = slots
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|payload| payload.downcast::<T>().ok())
        {
            return Ok(existing);
        }

        let created = Arc::new(factory()?);
        slots.insert(TypeId::of::<T>(), created.clone());
        Ok(created)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}
