//! In-memory object store.
//!
//! Used by tests and dry runs. Counts every call per operation and can be
//! told to fail specific operations, which is how storage outages are
//! simulated.

use super::{validate_key, ObjectStore, StorageResult};
use crate::models::{Metadata, StorageError};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Object store operation, for counters and fault rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Put,
    Get,
    Copy,
    Delete,
    Exists,
    GetSize,
    List,
    Metadata,
}

/// Failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Timeout,
    Throttled,
    Unavailable,
    AccessDenied,
    NotFound,
}

impl FaultKind {
    fn to_error(self, key: &str) -> StorageError {
        let key = key.to_string();
        match self {
            Self::Timeout => StorageError::Timeout(key),
            Self::Throttled => StorageError::Throttled(key),
            Self::Unavailable => StorageError::Unavailable(key),
            Self::AccessDenied => StorageError::AccessDenied(key),
            Self::NotFound => StorageError::NotFound(key),
        }
    }
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    key_contains: String,
    kind: FaultKind,
    /// `None` fails forever
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    metadata: Metadata,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    faults: Vec<Fault>,
    counters: HashMap<StoreOp, usize>,
}

/// Object store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: Mutex<State>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every `op` whose key contains `key_contains` (the destination key
    /// for copies).
    pub fn fail(&self, op: StoreOp, key_contains: &str, kind: FaultKind) {
        self.push_fault(op, key_contains, kind, None);
    }

    /// Fail the next `times` matching calls, then recover.
    pub fn fail_times(&self, op: StoreOp, key_contains: &str, kind: FaultKind, times: usize) {
        self.push_fault(op, key_contains, kind, Some(times));
    }

    fn push_fault(
        &self,
        op: StoreOp,
        key_contains: &str,
        kind: FaultKind,
        remaining: Option<usize>,
    ) {
        self.lock().faults.push(Fault {
            op,
            key_contains: key_contains.to_string(),
            kind,
            remaining,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Calls made for `op`, failed ones included.
    pub fn op_count(&self, op: StoreOp) -> usize {
        self.lock().counters.get(&op).copied().unwrap_or(0)
    }

    /// Calls that mutate the store.
    pub fn write_count(&self) -> usize {
        [StoreOp::Put, StoreOp::Copy, StoreOp::Delete]
            .into_iter()
            .map(|op| self.op_count(op))
            .sum()
    }

    /// Every key currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Count the call and apply a matching fault, if any.
    fn enter(state: &mut State, op: StoreOp, key: &str) -> StorageResult<()> {
        *state.counters.entry(op).or_insert(0) += 1;

        let matched = state
            .faults
            .iter_mut()
            .find(|f| f.op == op && key.contains(&f.key_contains) && f.remaining != Some(0));
        if let Some(fault) = matched {
            if let Some(remaining) = fault.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(fault.kind.to_error(key));
        }
        Ok(())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, local_path: &Path, key: &str, metadata: &Metadata) -> StorageResult<()> {
        let data = fs::read(local_path).map_err(|e| StorageError::io(key, e))?;
        self.put_bytes(key, &data, metadata)
    }

    fn put_bytes(&self, key: &str, data: &[u8], metadata: &Metadata) -> StorageResult<()> {
        validate_key(key)?;
        let mut state = self.lock();
        Self::enter(&mut state, StoreOp::Put, key)?;
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let mut state = self.lock();
        Self::enter(&mut state, StoreOp::Get, key)?;
        state
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()> {
        validate_key(dest_key)?;
        let mut state = self.lock();
        Self::enter(&mut state, StoreOp::Copy, dest_key)?;
        let object = state
            .objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(source_key.to_string()))?;
        state.objects.insert(dest_key.to_string(), object);
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let mut state = self.lock();
        Self::enter(&mut state, StoreOp::Delete, key)?;
        state.objects.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        let mut state = self.lock();
        Self::enter(&mut state, StoreOp::Exists, key)?;
        Ok(state.objects.contains_key(key))
    }

    fn get_size(&self, key: &str) -> StorageResult<u64> {
        let mut state = self.lock();
        Self::enter(&mut state, StoreOp::GetSize, key)?;
        state
            .objects
            .get(key)
            .map(|o| o.data.len() as u64)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut state = self.lock();
        Self::enter(&mut state, StoreOp::List, prefix)?;
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn metadata(&self, key: &str) -> StorageResult<Metadata> {
        let mut state = self.lock();
        Self::enter(&mut state, StoreOp::Metadata, key)?;
        state
            .objects
            .get(key)
            .map(|o| o.metadata.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}
