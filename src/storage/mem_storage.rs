/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A volatile, in-memory implementation of [`Storage`].
//!
//! This is the storage every test in this crate rides on, and a reasonable backend for swarms
//! that accept losing state on restart (a fresh replica re-syncs from its peers through the
//! snapshot hooks).

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{DbKey, DbValue};

use super::{Storage, StorageResult};

type Namespaces = BTreeMap<String, BTreeMap<DbKey, DbValue>>;

/// An in-memory implementation of [`Storage`].
#[derive(Default)]
pub struct MemStorage {
    namespaces: RwLock<Namespaces>,
    snapshot: Mutex<Option<Vec<u8>>>,
}

impl MemStorage {
    /// Create a new, empty `MemStorage`.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn create(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult {
        let mut namespaces = self.namespaces.write().unwrap();
        let records = namespaces.entry(namespace.to_string()).or_default();
        if records.contains_key(key) {
            return StorageResult::Exists;
        }
        records.insert(key.to_string(), value.to_vec());
        StorageResult::Ok
    }

    fn update(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult {
        let mut namespaces = self.namespaces.write().unwrap();
        match namespaces.get_mut(namespace).and_then(|records| records.get_mut(key)) {
            Some(record) => {
                *record = value.to_vec();
                StorageResult::Ok
            }
            None => StorageResult::NotFound,
        }
    }

    fn remove(&self, namespace: &str, key: &str) -> StorageResult {
        let mut namespaces = self.namespaces.write().unwrap();
        match namespaces.get_mut(namespace).and_then(|records| records.remove(key)) {
            Some(_) => StorageResult::Ok,
            None => StorageResult::NotFound,
        }
    }

    fn remove_namespace(&self, namespace: &str) -> StorageResult {
        let mut namespaces = self.namespaces.write().unwrap();
        match namespaces.remove(namespace) {
            Some(_) => StorageResult::Ok,
            None => StorageResult::NotFound,
        }
    }

    fn has(&self, namespace: &str, key: &str) -> bool {
        let namespaces = self.namespaces.read().unwrap();
        namespaces
            .get(namespace)
            .map(|records| records.contains_key(key))
            .unwrap_or(false)
    }

    fn read(&self, namespace: &str, key: &str) -> Option<DbValue> {
        let namespaces = self.namespaces.read().unwrap();
        namespaces.get(namespace).and_then(|records| records.get(key).cloned())
    }

    fn get_keys(&self, namespace: &str) -> Vec<DbKey> {
        let namespaces = self.namespaces.read().unwrap();
        namespaces
            .get(namespace)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn get_size(&self, namespace: &str) -> (u64, u64) {
        let namespaces = self.namespaces.read().unwrap();
        match namespaces.get(namespace) {
            Some(records) => {
                let bytes = records
                    .iter()
                    .map(|(key, value)| (key.len() + value.len()) as u64)
                    .sum();
                (records.len() as u64, bytes)
            }
            None => (0, 0),
        }
    }

    fn get_key_size(&self, namespace: &str, key: &str) -> Option<u64> {
        let namespaces = self.namespaces.read().unwrap();
        namespaces
            .get(namespace)
            .and_then(|records| records.get(key))
            .map(|value| (key.len() + value.len()) as u64)
    }

    fn create_snapshot(&self) -> bool {
        let namespaces = self.namespaces.read().unwrap();
        match namespaces.try_to_vec() {
            Ok(bytes) => {
                *self.snapshot.lock().unwrap() = Some(bytes);
                true
            }
            Err(_) => false,
        }
    }

    fn get_snapshot(&self) -> Option<Vec<u8>> {
        self.snapshot.lock().unwrap().clone()
    }

    fn load_snapshot(&self, snapshot: &[u8]) -> bool {
        match Namespaces::deserialize(&mut &*snapshot) {
            Ok(namespaces) => {
                *self.namespaces.write().unwrap() = namespaces;
                true
            }
            Err(_) => false,
        }
    }
}
