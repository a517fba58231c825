//! Data model for the fixpoint reconciliation engine
//!
//! This crate contains the client-less building blocks the engine in
//! `fixpoint-runtime` converges over: the per-kind [`ResourceCache`] with
//! copy-on-write patch tracking, the dependency-ordered [`EnvCache`] for
//! composing container environments from many independent contributors, and
//! the [`StatusMap`] projection written back to the custom resource status.
//!
//! None of these structures perform any I/O or locking. They are owned by a
//! single per-instance context and mutated from one logical task at a time.
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod env;
mod error;
pub mod resources;
pub mod status;

pub use env::{EnvCache, EnvCacheEntry};
pub use error::Fatal;
pub use resources::{ResourceCache, ResourceCacheEntry};
pub use status::StatusMap;
