//! Registry of live per-instance control loops.

use crate::context::Identity;
use crate::control::ControlLoop;
use ahash::AHashMap;
use fixpoint_core::Fatal;
use std::collections::hash_map::Entry;
use std::time::Duration;
use tracing::{debug, info};

/// Owns one [`ControlLoop`] per live custom resource instance and routes
/// reconcile requests to it.
///
/// The registry is an owned resource of the single dispatching component, in
/// the way a connection pool is, not ambient shared state. The dispatcher
/// (and therefore its host) must guarantee that requests for the same
/// instance key are never processed concurrently; requests for different
/// keys may be interleaved freely. The loops themselves perform no locking.
pub struct Dispatcher<F> {
    loops: AHashMap<String, ControlLoop>,
    factory: F,
}

impl<F> Dispatcher<F>
where
    F: FnMut(&Identity) -> ControlLoop,
{
    /// Create a dispatcher that builds new loops with `factory`.
    ///
    /// The factory is invoked the first time an instance is observed; it
    /// constructs the context and registers the control functions and patch
    /// bindings for that instance.
    pub fn new(factory: F) -> Self {
        Self {
            loops: AHashMap::new(),
            factory,
        }
    }

    /// Process one reconcile request.
    ///
    /// `observed` states whether the custom resource currently exists. A
    /// vanished resource triggers a cleanup pass and drops the instance
    /// context. On success, returns the requeue delay the host should apply
    /// (`None` to wait for the next natural event). A [`Fatal`] error must
    /// crash the hosting process.
    pub async fn dispatch(
        &mut self,
        identity: &Identity,
        observed: bool,
    ) -> Result<Option<Duration>, Fatal> {
        let key = identity.key();
        if !observed {
            if let Some(mut control_loop) = self.loops.remove(&key) {
                control_loop.cleanup().await;
                info!(instance = %key, "context was deleted");
            }
            return Ok(None);
        }

        let control_loop = match self.loops.entry(key) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                debug!(instance = %vacant.key(), "creating context");
                vacant.insert((self.factory)(identity))
            }
        };
        control_loop.run().await?;
        Ok(control_loop.context_mut().take_requeue())
    }

    /// The context of a live instance, for status projection.
    #[must_use]
    pub fn context(&self, identity: &Identity) -> Option<&crate::context::LoopContext> {
        self.loops.get(&identity.key()).map(ControlLoop::context)
    }

    /// Number of live instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Whether no instance is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}
