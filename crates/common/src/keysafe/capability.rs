use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use super::UnlockCapability;

/// Capabilities unlocked in one session, keyed by KeySafe id.
#[derive(Debug, Default)]
pub struct CapabilityTable {
    unlocked: Mutex<HashMap<Uuid, UnlockCapability>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, keysafe: Uuid, capability: UnlockCapability) {
        self.unlocked.lock().insert(keysafe, capability);
    }

    pub fn get(&self, keysafe: Uuid) -> Option<UnlockCapability> {
        self.unlocked.lock().get(&keysafe).cloned()
    }

    pub fn remove(&self, keysafe: Uuid) -> bool {
        self.unlocked.lock().remove(&keysafe).is_some()
    }

    pub fn contains(&self, keysafe: Uuid) -> bool {
        self.unlocked.lock().contains_key(&keysafe)
    }
}
