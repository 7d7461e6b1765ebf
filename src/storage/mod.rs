//! Object store abstraction.
//!
//! Provides:
//! - `ObjectStore`: key-addressed put/get/copy/delete/list contract
//! - `MemoryObjectStore`: in-process store with fault injection
//! - `LocalObjectStore`: directory-backed store with atomic writes

mod local;
mod memory;

pub use local::*;
pub use memory::*;

use crate::models::{Metadata, StorageError};
use std::path::Path;

/// Result type for object store calls.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Key-addressed object store.
///
/// `copy` must be atomic per object: readers see either the old target or
/// the complete new one. `delete` of a missing key succeeds.
pub trait ObjectStore: Send + Sync {
    /// Upload a local file to `key`.
    fn put(&self, local_path: &Path, key: &str, metadata: &Metadata) -> StorageResult<()>;

    /// Write bytes to `key`.
    fn put_bytes(&self, key: &str, data: &[u8], metadata: &Metadata) -> StorageResult<()>;

    fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Copy `source_key` to `dest_key`, metadata included.
    fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()>;

    fn delete(&self, key: &str) -> StorageResult<()>;

    fn exists(&self, key: &str) -> StorageResult<bool>;

    fn get_size(&self, key: &str) -> StorageResult<u64>;

    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    fn metadata(&self, key: &str) -> StorageResult<Metadata>;
}

impl<S: ObjectStore + ?Sized> ObjectStore for std::sync::Arc<S> {
    fn put(&self, local_path: &Path, key: &str, metadata: &Metadata) -> StorageResult<()> {
        (**self).put(local_path, key, metadata)
    }

    fn put_bytes(&self, key: &str, data: &[u8], metadata: &Metadata) -> StorageResult<()> {
        (**self).put_bytes(key, data, metadata)
    }

    fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        (**self).get(key)
    }

    fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()> {
        (**self).copy(source_key, dest_key)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        (**self).delete(key)
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        (**self).exists(key)
    }

    fn get_size(&self, key: &str) -> StorageResult<u64> {
        (**self).get_size(key)
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        (**self).list(prefix)
    }

    fn metadata(&self, key: &str) -> StorageResult<Metadata> {
        (**self).metadata(key)
    }
}

/// Reject keys that could escape a namespace or collide with store internals.
pub fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.ends_with('/')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        Err(StorageError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("dev/landing/wdi/WDICSV.parquet").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("dir/").is_err());
    }
}
