//! Atomic multi-object writes on top of an object store.
//!
//! Provides:
//! - `TransactionManager`: opens transactions, sweeps orphaned staging
//! - `Transaction`: stage, validate, commit or roll back
//! - `validators`: stock checks for staged objects

mod manager;
mod operation;
pub mod validators;

pub use manager::*;
pub use operation::*;
pub use validators::Validator;
