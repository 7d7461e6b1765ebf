//! Checks run against staged objects before commit.

use super::StagedOperation;
use crate::models::{PipelineError, Result};
use crate::storage::ObjectStore;

/// Inspects one staged object; an error aborts the transaction.
pub type Validator = Box<dyn Fn(&dyn ObjectStore, &StagedOperation) -> Result<()> + Send + Sync>;

/// Reject zero-byte objects.
pub fn non_empty() -> Validator {
    Box::new(|store: &dyn ObjectStore, op: &StagedOperation| {
        let size = store.get_size(&op.staging_key)?;
        if size == 0 {
            return Err(PipelineError::validation(&op.target_key, "object is empty"));
        }
        Ok(())
    })
}

/// Reject objects larger than `limit` bytes.
pub fn max_size(limit: u64) -> Validator {
    Box::new(move |store: &dyn ObjectStore, op: &StagedOperation| {
        let size = store.get_size(&op.staging_key)?;
        if size > limit {
            return Err(PipelineError::validation(
                &op.target_key,
                format!("object is {size} bytes, limit is {limit}"),
            ));
        }
        Ok(())
    })
}

/// Require a metadata entry on every staged object.
pub fn has_metadata(field: &str) -> Validator {
    let field = field.to_string();
    Box::new(move |_: &dyn ObjectStore, op: &StagedOperation| {
        if op.metadata.contains_key(&field) {
            Ok(())
        } else {
            Err(PipelineError::validation(
                &op.target_key,
                format!("missing metadata '{field}'"),
            ))
        }
    })
}
