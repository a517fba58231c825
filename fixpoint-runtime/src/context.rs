//! Per-instance state shared by control functions and the patch engine.

use ahash::AHashMap;
use fixpoint_core::{EnvCache, ResourceCache, StatusMap};
use std::any::{Any, TypeId};
use std::time::Duration;
use tracing::{info_span, Span};

const REQUEUE_DELAY_SOON: Duration = Duration::from_secs(5);

/// Identity of one reconciled custom resource instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Name of the custom resource (and the application it describes).
    pub name: String,
    /// Namespace the instance lives in.
    pub namespace: String,
}

impl Identity {
    /// Create an identity from a name and namespace.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// The `namespace/name` registry key for this instance.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// State owned by one reconciled custom resource instance: the per-kind
/// resource caches, the environment variable cache, the status projection,
/// and the requeue request.
///
/// The context is single-writer. The dispatcher guarantees that reconcile
/// requests for the same instance are never processed concurrently, so no
/// internal locking is performed; every phase threads `&mut LoopContext`.
pub struct LoopContext {
    identity: Identity,
    span: Span,
    resources: AHashMap<TypeId, Box<dyn Any + Send>>,
    env: EnvCache,
    status: StatusMap,
    requeue: Option<Duration>,
}

impl LoopContext {
    /// Create the context for a newly observed instance.
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        let span = info_span!("instance", app = %identity.name, namespace = %identity.namespace);
        Self {
            identity,
            span,
            resources: AHashMap::new(),
            env: EnvCache::new(),
            status: StatusMap::new(),
            requeue: None,
        }
    }

    /// Identity of the instance this context belongs to.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The tracing span carrying this instance's identity fields.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The resource cache for kind `K`, created empty on first access.
    ///
    /// Each kind gets its own statically-typed cache; the key space within a
    /// kind is chosen by its control functions and patch binding.
    pub fn resources<K: Send + 'static>(&mut self) -> &mut ResourceCache<K> {
        self.resources
            .entry(TypeId::of::<K>())
            .or_insert_with(|| Box::new(ResourceCache::<K>::new()))
            .downcast_mut()
            .expect("resource cache is keyed by TypeId")
    }

    /// Read-only view of the resource cache for kind `K`, if any entry of
    /// that kind has ever been touched.
    #[must_use]
    pub fn resources_ref<K: Send + 'static>(&self) -> Option<&ResourceCache<K>> {
        self.resources
            .get(&TypeId::of::<K>())
            .and_then(|cache| cache.downcast_ref())
    }

    /// The environment variable cache.
    #[must_use]
    pub fn env(&self) -> &EnvCache {
        &self.env
    }

    /// Mutable access to the environment variable cache.
    pub fn env_mut(&mut self) -> &mut EnvCache {
        &mut self.env
    }

    /// The status projection map.
    #[must_use]
    pub fn status(&self) -> &StatusMap {
        &self.status
    }

    /// Mutable access to the status projection map.
    pub fn status_mut(&mut self) -> &mut StatusMap {
        &mut self.status
    }

    /// Ask the host to redeliver the reconcile event immediately.
    pub fn set_requeue_now(&mut self) {
        self.set_requeue_after(Duration::ZERO);
    }

    /// Ask the host to redeliver the reconcile event after a short delay.
    pub fn set_requeue_soon(&mut self) {
        self.set_requeue_after(REQUEUE_DELAY_SOON);
    }

    /// Ask the host to redeliver the reconcile event after `delay`.
    /// The shortest requested delay wins.
    pub fn set_requeue_after(&mut self, delay: Duration) {
        self.requeue = Some(self.requeue.map_or(delay, |current| current.min(delay)));
    }

    /// Return and reset the pending requeue request.
    pub fn take_requeue(&mut self) -> Option<Duration> {
        self.requeue.take()
    }
}
