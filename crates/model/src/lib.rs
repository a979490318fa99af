//! An abstraction layer for hosted LLM services.
//!
//! This crate establishes a unified protocol for talking to completion
//! and embedding services, so that prompt assembly, output parsing and
//! the tool loop can switch between providers without modifying the
//! core codebase.
//!
//! Types in this crate don't define any behavior, instead they are the
//! constraints that the implementors should adhere to.

#![deny(missing_docs)]

mod embedding;
mod error;
mod provider;
mod request;
mod response;

pub use embedding::*;
pub use error::*;
pub use provider::*;
pub use request::*;
pub use response::*;
