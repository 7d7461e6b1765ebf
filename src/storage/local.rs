//! Directory-backed object store.
//!
//! Layout:
//! - `<root>/<key>`: object bytes
//! - `<root>/.meta/<key>.json`: object metadata
//!
//! Writes go to a temp file next to the target and are renamed into place,
//! so a reader never observes a half-written object.

use super::{validate_key, ObjectStore, StorageResult};
use crate::models::{Metadata, StorageError};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const META_DIR: &str = ".meta";
const TEMP_MARKER: &str = ".tmp-";

/// Object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Open a store at `root`, creating the directory.
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StorageError::io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        if key == META_DIR || key.starts_with(&format!("{META_DIR}/")) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    /// Write `data` to `path` via temp file and rename.
    fn write_atomic(
        path: &Path,
        key: &str,
        write: impl FnOnce(&mut File) -> io::Result<()>,
    ) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(key, e))?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_name = format!("{file_name}{TEMP_MARKER}{}", uuid::Uuid::new_v4());
        let temp_path = path.with_file_name(temp_name);

        let result = File::create(&temp_path)
            .and_then(|mut file| {
                write(&mut file)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&temp_path, path));

        if let Err(e) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(StorageError::io(key, e));
        }
        Ok(())
    }

    fn write_metadata(&self, key: &str, metadata: &Metadata) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| StorageError::io(key, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        Self::write_atomic(&self.meta_path(key), key, |f| f.write_all(&json))
    }

    fn not_found_or_io(key: &str, e: io::Error) -> StorageError {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::io(key, e)
        }
    }
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, local_path: &Path, key: &str, metadata: &Metadata) -> StorageResult<()> {
        let path = self.object_path(key)?;
        let source = File::open(local_path).map_err(|e| StorageError::io(key, e))?;

        Self::write_atomic(&path, key, |file| {
            let mut reader = BufReader::new(source);
            let mut writer = BufWriter::new(file);
            io::copy(&mut reader, &mut writer)?;
            writer.flush()
        })?;
        self.write_metadata(key, metadata)?;

        debug!(key, source = %local_path.display(), "Stored object");
        Ok(())
    }

    fn put_bytes(&self, key: &str, data: &[u8], metadata: &Metadata) -> StorageResult<()> {
        let path = self.object_path(key)?;
        Self::write_atomic(&path, key, |f| f.write_all(data))?;
        self.write_metadata(key, metadata)
    }

    fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.object_path(key)?;
        fs::read(path).map_err(|e| Self::not_found_or_io(key, e))
    }

    fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()> {
        let source = self.object_path(source_key)?;
        let dest = self.object_path(dest_key)?;

        let reader = File::open(&source).map_err(|e| Self::not_found_or_io(source_key, e))?;
        let metadata = self.metadata(source_key)?;
        Self::write_atomic(&dest, dest_key, |file| {
            let mut reader = BufReader::new(reader);
            let mut writer = BufWriter::new(file);
            io::copy(&mut reader, &mut writer)?;
            writer.flush()
        })?;

        self.write_metadata(dest_key, &metadata)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.object_path(key)?;
        for target in [path, self.meta_path(key)] {
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(key, e)),
            }
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.object_path(key)?.is_file())
    }

    fn get_size(&self, key: &str) -> StorageResult<u64> {
        let path = self.object_path(key)?;
        fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| Self::not_found_or_io(key, e))
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let root = self.root.to_string_lossy();
        let pattern = format!("{}/**/*", glob::Pattern::escape(&root));
        let entries = glob::glob(&pattern).map_err(|e| {
            StorageError::io(prefix, io::Error::new(io::ErrorKind::InvalidInput, e))
        })?;

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StorageError::io(prefix, e.into_error()))?;
            if !path.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(META_DIR) || key.contains(TEMP_MARKER) {
                continue;
            }
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn metadata(&self, key: &str) -> StorageResult<Metadata> {
        if !self.exists(key)? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        match fs::read(self.meta_path(key)) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                StorageError::io(key, io::Error::new(io::ErrorKind::InvalidData, e))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Metadata::new()),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }
}
