//! # Configuration Modules
//!
//! Layered hub settings: defaults, JSON file, environment and flags.

/// Flag/env/file resolution into a validated `HubConfig`.
pub mod config_hub;
