// Keyed cache of heavy model objects (ONNX sessions bound to device memory).
// Entries are created lazily on first use and live for the rest of the
// process; nothing is ever evicted.
//
// The map lock only covers looking up or inserting a key's slot. The slot
// has its own lock, which the first caller holds while the factory runs, so
// concurrent callers for the same key wait for that single construction and
// callers for other keys are not blocked by it.

use crate::error::{InferenceError, lock_mutex};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Instant;
use tracing::{debug, info, warn};

type Slot<V> = Arc<Mutex<Option<Arc<V>>>>;

pub struct ModelCache<K, V> {
    name: &'static str,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> ModelCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the handle stored for `key`, building it with `factory` if
    /// this is the first request for the key. The factory runs at most once
    /// per key at a time; if it fails, the slot stays empty and the next
    /// caller tries again.
    pub fn get_or_create<F>(&self, key: &K, factory: F) -> Result<Arc<V>, InferenceError>
    where
        F: FnOnce() -> Result<V, InferenceError>,
    {
        let slot = {
            let mut slots = lock_mutex(&self.slots, self.name)?;
            slots.entry(key.clone()).or_default().clone()
        };

        // A factory that panicked poisons the slot but never fills it, so the
        // slot is still empty and safe to reuse.
        let mut entry = match slot.lock() {
            Ok(entry) => entry,
            Err(poisoned) => {
                warn!("{}: recovering {:?} after a panicked load", self.name, key);
                slot.clear_poison();
                poisoned.into_inner()
            }
        };
        if let Some(handle) = entry.as_ref() {
            debug!("{}: cache hit for {:?}", self.name, key);
            return Ok(handle.clone());
        }

        info!("{}: loading {:?}", self.name, key);
        let started = Instant::now();
        let handle = match factory() {
            Ok(value) => Arc::new(value),
            Err(e) => {
                warn!("{}: failed to load {:?}: {}", self.name, key, e);
                return Err(e);
            }
        };
        info!(
            "{}: loaded {:?} in {:.2}s",
            self.name,
            key,
            started.elapsed().as_secs_f64()
        );

        *entry = Some(handle.clone());
        Ok(handle)
    }

    /// Returns the handle for `key` if it has already been built.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let slot = self.slots.lock().ok()?.get(key)?.clone();
        let entry = slot.try_lock().ok()?;
        entry.as_ref().cloned()
    }

    /// Keys whose handle is built. Slots still under construction are skipped.
    pub fn loaded_keys(&self) -> Vec<K> {
        let Ok(slots) = self.slots.lock() else {
            return Vec::new();
        };

        slots
            .iter()
            .filter(|(_, slot)| match slot.try_lock() {
                Ok(entry) => entry.is_some(),
                Err(TryLockError::Poisoned(_)) | Err(TryLockError::WouldBlock) => false,
            })
            .map(|(key, _)| key.clone())
            .collect()
    }
}
