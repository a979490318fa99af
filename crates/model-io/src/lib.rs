//! Ready-made pieces for talking to DashScope through `model-io`.
//!
//! The crate bundles the HTTP tools used by the agent demo, the patient
//! record extraction setup and environment configuration. The `model-io`
//! binary wires them together.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

pub mod config;
pub mod patient;
pub mod tools;

pub use config::{ConfigError, Settings};

/// Re-exports of [`model_io_core`] crate.
pub mod core {
    pub use model_io_core::*;
}
