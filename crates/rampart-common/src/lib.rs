//! ---
//! rampart_section: "01-core-functionality"
//! rampart_subsection: "module"
//! rampart_type: "source"
//! rampart_scope: "code"
//! rampart_description: "Shared primitives and utilities for the resilience runtime."
//! rampart_version: "v0.0.0-prealpha"
//! rampart_owner: "tbd"
//! ---
//! Core shared primitives for the rampart workspace.
//! This crate exposes configuration loading, logging bootstrap, and
//! time conversion utilities consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{load_toml_with_source, LoadedConfig, LoggingConfig};
pub use logging::{init_tracing, LogFormat};
