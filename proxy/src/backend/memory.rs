//! In-process backend tier.
//!
//! A mutex-guarded hash map honoring the same handler contract as a real
//! memcached connection. Used by the integration tests and available for
//! single-process deployments.

use protocol_memcache::text::StoreVerb;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use super::{
    BackendError, Connect, DeleteOutcome, GetOutcome, Handler, StoreOutcome, TouchOutcome,
};

#[derive(Debug, Clone)]
struct Entry {
    flags: u32,
    exptime: u32,
    value: Vec<u8>,
}

type Store = Arc<Mutex<HashMap<Vec<u8>, Entry>>>;

/// An in-process tier; every handler connected from the same backend shares
/// one keyspace.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    store: Store,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read of a stored item, bypassing the handler contract.
    pub fn item(&self, key: &[u8]) -> Option<(u32, Vec<u8>)> {
        let store = self.store.lock().unwrap();
        store.get(key).map(|e| (e.flags, e.value.clone()))
    }

    /// Direct read of a stored item's expiration.
    pub fn exptime(&self, key: &[u8]) -> Option<u32> {
        let store = self.store.lock().unwrap();
        store.get(key).map(|e| e.exptime)
    }

    /// Direct write, bypassing the handler contract. For fault injection.
    pub fn insert_raw(&self, key: &[u8], flags: u32, value: Vec<u8>) {
        let mut store = self.store.lock().unwrap();
        store.insert(
            key.to_vec(),
            Entry {
                flags,
                exptime: 0,
                value,
            },
        );
    }

    /// Direct removal, bypassing the handler contract. For fault injection.
    pub fn remove(&self, key: &[u8]) {
        let mut store = self.store.lock().unwrap();
        store.remove(key);
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.store.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Connect for MemoryBackend {
    type Handler = MemoryHandler;

    async fn connect(&self) -> io::Result<Self::Handler> {
        Ok(MemoryHandler {
            store: self.store.clone(),
        })
    }
}

/// Handler over a [`MemoryBackend`] keyspace.
#[derive(Debug, Clone)]
pub struct MemoryHandler {
    store: Store,
}

impl Handler for MemoryHandler {
    async fn store(
        &mut self,
        verb: StoreVerb,
        key: &[u8],
        flags: u32,
        exptime: u32,
        value: &[u8],
    ) -> Result<StoreOutcome, BackendError> {
        let mut store = self.store.lock().unwrap();
        let exists = store.contains_key(key);
        match verb {
            StoreVerb::Add if exists => return Ok(StoreOutcome::NotStored),
            StoreVerb::Replace if !exists => return Ok(StoreOutcome::NotStored),
            _ => {}
        }
        store.insert(
            key.to_vec(),
            Entry {
                flags,
                exptime,
                value: value.to_vec(),
            },
        );
        Ok(StoreOutcome::Stored)
    }

    async fn get(&mut self, key: &[u8]) -> Result<GetOutcome, BackendError> {
        let store = self.store.lock().unwrap();
        match store.get(key) {
            Some(entry) => Ok(GetOutcome::Hit {
                flags: entry.flags,
                value: entry.value.clone(),
            }),
            None => Ok(GetOutcome::Miss),
        }
    }

    async fn delete(&mut self, key: &[u8]) -> Result<DeleteOutcome, BackendError> {
        let mut store = self.store.lock().unwrap();
        match store.remove(key) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn touch(&mut self, key: &[u8], exptime: u32) -> Result<TouchOutcome, BackendError> {
        let mut store = self.store.lock().unwrap();
        match store.get_mut(key) {
            Some(entry) => {
                entry.exptime = exptime;
                Ok(TouchOutcome::Touched)
            }
            None => Ok(TouchOutcome::NotFound),
        }
    }

    async fn gat(&mut self, key: &[u8], exptime: u32) -> Result<GetOutcome, BackendError> {
        let mut store = self.store.lock().unwrap();
        match store.get_mut(key) {
            Some(entry) => {
                entry.exptime = exptime;
                Ok(GetOutcome::Hit {
                    flags: entry.flags,
                    value: entry.value.clone(),
                })
            }
            None => Ok(GetOutcome::Miss),
        }
    }
}
