//! Per-accessor cache of unlocked values
//!
//! Unsealed documents, file descriptors and unlocked allocations are kept
//! here for the lifetime of the accessor so repeated requests skip the
//! decrypt. Entries are keyed by entity id or by token path and are typed:
//! asking for a value as the wrong type is an error, not a miss.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Id(Uuid),
    Token(String),
}

impl From<Uuid> for ContextKey {
    fn from(id: Uuid) -> Self {
        ContextKey::Id(id)
    }
}

impl From<&str> for ContextKey {
    fn from(token: &str) -> Self {
        ContextKey::Token(token.to_string())
    }
}

impl From<String> for ContextKey {
    fn from(token: String) -> Self {
        ContextKey::Token(token)
    }
}

struct Entry {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

#[derive(Default)]
pub struct AccessorContext {
    entries: Mutex<HashMap<ContextKey, Entry>>,
}

impl fmt::Debug for AccessorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_map()
            .entries(entries.iter().map(|(key, entry)| (key, entry.type_name)))
            .finish()
    }
}

impl AccessorContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `value` under `key`, replacing whatever was there.
    pub fn retain<V>(&self, key: impl Into<ContextKey>, value: V)
    where
        V: Any + Send + Sync,
    {
        let entry = Entry {
            value: Box::new(value),
            type_name: type_name::<V>(),
        };
        self.entries.lock().insert(key.into(), entry);
    }

    /// Fetch a clone of the cached value.
    ///
    /// Returns `Ok(None)` on a miss and [`Error::TypeConflict`] when the key
    /// holds a value of another type.
    pub fn retrieve<V>(&self, key: impl Into<ContextKey>) -> Result<Option<V>>
    where
        V: Any + Clone,
    {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(&key.into()) else {
            return Ok(None);
        };
        match entry.value.downcast_ref::<V>() {
            Some(value) => Ok(Some(value.clone())),
            None => Err(Error::TypeConflict {
                expected: type_name::<V>(),
                actual: entry.type_name,
            }),
        }
    }

    pub fn remove(&self, key: impl Into<ContextKey>) -> bool {
        self.entries.lock().remove(&key.into()).is_some()
    }

    pub fn contains(&self, key: impl Into<ContextKey>) -> bool {
        self.entries.lock().contains_key(&key.into())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
