//! Core models for pipeguard.
//!
//! - `config`: TOML-backed configuration with documented defaults
//! - `error`: the error taxonomy shared by every component

mod config;
mod error;

pub use config::*;
pub use error::*;

/// Free-form string metadata attached to checkpoints and stored objects.
pub type Metadata = std::collections::BTreeMap<String, String>;
