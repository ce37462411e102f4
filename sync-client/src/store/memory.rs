//! In-memory local store.
//!
//! Allows failing the next write and counting writes for verification.

use super::{LocalStore, StoreOp};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-memory local store.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    data: BTreeMap<String, Vec<u8>>,
    fail_next_write: Option<String>,
    writes: u64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cause the next write (`put`, `delete` or transaction) to fail.
    pub fn fail_next_write(&self, error: &str) {
        self.lock().fail_next_write = Some(error.to_string());
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    /// All keys, in order.
    pub fn keys(&self) -> Vec<String> {
        self.lock().data.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryStoreInner {
    fn check_write(&mut self) -> Result<(), StoreError> {
        if let Some(error) = self.fail_next_write.take() {
            return Err(StoreError::WriteFailed(error));
        }
        self.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check_write()?;
        inner.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.check_write()?;
        inner.data.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn run_in_transaction(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        // Fail before touching anything: all or nothing.
        inner.check_write()?;
        for op in ops {
            match op {
                StoreOp::Put { key, value } => {
                    inner.data.insert(key, value);
                }
                StoreOp::Delete { key } => {
                    inner.data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
