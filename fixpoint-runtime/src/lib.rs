//! Convergence engine for single-custom-resource operators
//!
//! The engine runs an ordered list of independently-authored control
//! functions to a fixed point. Each control function senses external and
//! cached state, reports whether it diverges from the desired state, and
//! responds by mutating the per-instance caches; the first discrepancy wins
//! and restarts the scan from the top, so units that depend on state
//! produced by earlier units need no explicit dependency wiring. After the
//! loop stabilizes, the patch engine turns dirty cache entries into create
//! and merge-patch calls against the API server.
//!
//! Hosts wire the engine into their event source (typically a
//! `kube-runtime` watcher) through the [`Dispatcher`], which owns one
//! [`ControlLoop`] per live custom resource instance.
#![deny(unsafe_code)]

pub mod client;
pub mod context;
pub mod control;
pub mod dispatcher;
pub mod patcher;

pub use client::KindClient;
pub use context::{Identity, LoopContext};
pub use control::{ControlFunction, ControlLoop};
pub use dispatcher::Dispatcher;
pub use fixpoint_core::{EnvCache, EnvCacheEntry, Fatal, ResourceCache, ResourceCacheEntry, StatusMap};
pub use patcher::{KindBinding, PatchEngine};
