//! Write-buffered map over one persisted document.
//!
//! Reads hydrate lazily from the backing document on first access. Writes
//! mutate the in-memory map, record the touched keys, and wake a background
//! flusher, which persists them once the map has been dirty for the debounce
//! interval. `flush_now` forces durability. Dropping the map stops the flusher
//! and performs a final flush, so buffered writes survive every orderly
//! shutdown path.
//!
//! A flush never writes the whole snapshot. Under the document lock it
//! re-reads the file and applies only the keys this map touched, so several
//! handles or processes sharing one document keep each other's writes.

use crate::core::error::RegistryError;
use crate::core::persist::{Mutation, Persistence};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct MapState<V> {
    loaded: bool,
    map: BTreeMap<String, V>,
    // `None` marks a removal.
    pending: BTreeMap<String, Option<V>>,
    // A `clear` since the last flush; applied before `pending`.
    cleared: bool,
    dirty_since: Option<Instant>,
    shutdown: bool,
}

impl<V: Clone> MapState<V> {
    fn apply_pending(&self, doc: &mut BTreeMap<String, V>) {
        if self.cleared {
            doc.clear();
        }
        for (k, op) in &self.pending {
            match op {
                Some(v) => {
                    doc.insert(k.clone(), v.clone());
                }
                None => {
                    doc.remove(k);
                }
            }
        }
    }
}

struct Shared<V> {
    name: String,
    persist: Persistence,
    debounce: Duration,
    state: Mutex<MapState<V>>,
    wake: Condvar,
    // Serializes snapshot+write so an older snapshot never lands after a newer one.
    write_gate: Mutex<()>,
}

pub struct PersistMap<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    shared: Arc<Shared<V>>,
    flusher: Option<JoinHandle<()>>,
}

impl<V> Shared<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    fn state(&self) -> Result<MutexGuard<'_, MapState<V>>, RegistryError> {
        self.state
            .lock()
            .map_err(|_| RegistryError::Poisoned(format!("persist map '{}'", self.name)))
    }

    fn ensure_loaded(&self, st: &mut MapState<V>) -> Result<(), RegistryError> {
        if st.loaded {
            return Ok(());
        }
        st.map = self
            .persist
            .read_json::<BTreeMap<String, V>>(&self.name)?
            .unwrap_or_default();
        st.loaded = true;
        Ok(())
    }

    fn flush(&self) -> Result<(), RegistryError> {
        let _gate = self
            .write_gate
            .lock()
            .map_err(|_| RegistryError::Poisoned(format!("persist map '{}' gate", self.name)))?;
        let batch = {
            let mut st = self.state()?;
            if st.dirty_since.is_none() {
                return Ok(());
            }
            st.dirty_since = None;
            MapState {
                loaded: true,
                map: BTreeMap::new(),
                pending: std::mem::take(&mut st.pending),
                cleared: std::mem::replace(&mut st.cleared, false),
                dirty_since: None,
                shutdown: false,
            }
        };

        let merged = self
            .persist
            .update_json(&self.name, |doc: &mut BTreeMap<String, V>| {
                batch.apply_pending(doc);
                Ok(Mutation::Write(doc.clone()))
            });

        let mut st = self.state()?;
        match merged {
            Ok(mut doc) => {
                // Writes made while this batch was on its way stay pending.
                st.apply_pending(&mut doc);
                st.map = doc;
                st.loaded = true;
                Ok(())
            }
            Err(e) => {
                if !st.cleared {
                    let newer = std::mem::take(&mut st.pending);
                    st.pending = batch.pending;
                    st.pending.extend(newer);
                    st.cleared = batch.cleared;
                }
                st.dirty_since.get_or_insert_with(Instant::now);
                Err(e)
            }
        }
    }

    fn run_flusher(self: Arc<Self>) {
        loop {
            let Ok(mut st) = self.state() else { return };
            loop {
                if st.shutdown {
                    return;
                }
                match st.dirty_since {
                    None => {
                        st = match self.wake.wait(st) {
                            Ok(g) => g,
                            Err(_) => return,
                        };
                    }
                    Some(since) => {
                        let elapsed = since.elapsed();
                        if elapsed >= self.debounce {
                            break;
                        }
                        st = match self.wake.wait_timeout(st, self.debounce - elapsed) {
                            Ok((g, _)) => g,
                            Err(_) => return,
                        };
                    }
                }
            }
            drop(st);
            if let Err(e) = self.flush() {
                tracing::warn!(document = %self.name, error = %e, "debounced flush failed; will retry");
                std::thread::sleep(self.debounce.max(Duration::from_millis(10)));
            }
        }
    }
}

impl<V> PersistMap<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(persist: Persistence, name: &str, debounce: Duration) -> Self {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            persist,
            debounce,
            state: Mutex::new(MapState {
                loaded: false,
                map: BTreeMap::new(),
                pending: BTreeMap::new(),
                cleared: false,
                dirty_since: None,
                shutdown: false,
            }),
            wake: Condvar::new(),
            write_gate: Mutex::new(()),
        });
        let worker = Arc::clone(&shared);
        let flusher = std::thread::Builder::new()
            .name(format!("persist-map-{}", name))
            .spawn(move || worker.run_flusher())
            .map_err(|e| tracing::error!(document = name, error = %e, "could not start flusher; writes flush on drop or flush_now"))
            .ok();
        Self { shared, flusher }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn get(&self, key: &str) -> Result<Option<V>, RegistryError> {
        let mut st = self.shared.state()?;
        self.shared.ensure_loaded(&mut st)?;
        Ok(st.map.get(key).cloned())
    }

    pub fn insert(&self, key: &str, value: V) -> Result<(), RegistryError> {
        self.mutate(|st| {
            st.map.insert(key.to_string(), value.clone());
            st.pending.insert(key.to_string(), Some(value));
        })
    }

    pub fn remove(&self, key: &str) -> Result<Option<V>, RegistryError> {
        let mut removed = None;
        self.mutate(|st| {
            removed = st.map.remove(key);
            st.pending.insert(key.to_string(), None);
        })?;
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), RegistryError> {
        self.mutate(|st| {
            st.map.clear();
            st.pending.clear();
            st.cleared = true;
        })
    }

    /// Values ordered by key.
    pub fn values(&self) -> Result<Vec<V>, RegistryError> {
        let mut st = self.shared.state()?;
        self.shared.ensure_loaded(&mut st)?;
        Ok(st.map.values().cloned().collect())
    }

    pub fn len(&self) -> Result<usize, RegistryError> {
        let mut st = self.shared.state()?;
        self.shared.ensure_loaded(&mut st)?;
        Ok(st.map.len())
    }

    pub fn is_empty(&self) -> Result<bool, RegistryError> {
        Ok(self.len()? == 0)
    }

    pub fn is_dirty(&self) -> Result<bool, RegistryError> {
        Ok(self.shared.state()?.dirty_since.is_some())
    }

    pub fn flush_now(&self) -> Result<(), RegistryError> {
        self.shared.flush()
    }

    fn mutate<F>(&self, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut MapState<V>),
    {
        let mut st = self.shared.state()?;
        self.shared.ensure_loaded(&mut st)?;
        f(&mut *st);
        st.dirty_since.get_or_insert_with(Instant::now);
        drop(st);
        self.shared.wake.notify_all();
        Ok(())
    }
}

impl<V> Drop for PersistMap<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    fn drop(&mut self) {
        if let Ok(mut st) = self.shared.state.lock() {
            st.shutdown = true;
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        if let Err(e) = self.shared.flush() {
            tracing::error!(document = %self.shared.name, error = %e, "final flush on shutdown failed");
        }
    }
}
