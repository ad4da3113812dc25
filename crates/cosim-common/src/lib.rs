//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Shared primitives and utilities for the simulation manager."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
//! Shared primitives for the co-simulation workspace.
//! This crate exposes configuration loading and tracing setup consumed by the
//! simulation manager and its RPC layer.

pub mod config;
pub mod logging;

pub use config::{LoadedConfig, LoggingConfig, SimConfigEntry, SimManagerConfig};
pub use logging::{init_tracing, LogFormat};
