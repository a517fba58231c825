//! The control function contract and the bounded convergence loop.

use crate::context::LoopContext;
use crate::patcher::PatchEngine;
use async_trait::async_trait;
use fixpoint_core::Fatal;
use tracing::{debug, info, warn, Instrument};

/// One reconciliation unit.
///
/// A control function owns a single concern (one child resource, one slice of
/// configuration) and converges it through three phases:
///
/// - [`sense`](ControlFunction::sense) reads the external API and the caches
///   and stores what it observed in private fields. It must be idempotent and
///   externally side-effect free, since it may run many times within one
///   convergence; read errors are logged inside the function, which then
///   proceeds with stale or zero-valued state.
/// - [`compare`](ControlFunction::compare) is pure: no I/O, no mutation. It
///   reports whether the sensed state diverges from the desired state.
/// - [`respond`](ControlFunction::respond) resolves the divergence by
///   mutating the caches only; it never calls the external API directly.
///   Actual writes are deferred to the patch engine.
///
/// [`cleanup`](ControlFunction::cleanup) is used solely during teardown; it
/// returns `true` once the unit has no further deletions pending and `false`
/// to request another cleanup pass (e.g. while an object it depends on is
/// still present).
#[async_trait]
pub trait ControlFunction: Send {
    /// Diagnostic label used in log output.
    fn describe(&self) -> &str;

    /// Observe external and cached state into private fields.
    async fn sense(&mut self, ctx: &mut LoopContext);

    /// Report whether sensed state diverges from desired state.
    fn compare(&self) -> bool;

    /// Resolve the divergence by mutating the caches.
    ///
    /// The only error a response can produce is a [`Fatal`] defect (such as
    /// an environment dependency cycle), which aborts the reconciliation and
    /// propagates to the host as a crash signal.
    fn respond(&mut self, ctx: &mut LoopContext) -> Result<(), Fatal>;

    /// Tear down this unit's managed state. Defaults to "nothing to do".
    async fn cleanup(&mut self, _ctx: &mut LoopContext) -> bool {
        true
    }
}

/// Runs registered control functions to a fixed point for one custom
/// resource instance.
///
/// One *attempt* scans the registered list in order, sensing and comparing
/// each function; at the first discrepancy the function responds and the
/// scan restarts from the top. Later functions may depend on cache state
/// only just produced by earlier ones (a service cannot be created before
/// the workload it targets is known), so restarting preserves a natural
/// dependency order without explicit wiring. The loop terminates when a
/// full scan finds no discrepancy, or fails with
/// [`Fatal::StabilizationLimit`] after `2 x |CFs|` attempts: oscillation
/// between control functions is a wiring defect and is never masked by
/// silent retries.
pub struct ControlLoop {
    ctx: LoopContext,
    engine: PatchEngine,
    cfs: Vec<Box<dyn ControlFunction>>,
}

impl ControlLoop {
    /// Create a loop over `ctx` that flushes through `engine`.
    #[must_use]
    pub fn new(ctx: LoopContext, engine: PatchEngine) -> Self {
        Self {
            ctx,
            engine,
            cfs: Vec::new(),
        }
    }

    /// Register a control function. Functions are evaluated in registration
    /// order, which must be deterministic and must place dependency-sensitive
    /// functions after their prerequisites.
    #[must_use]
    pub fn register(mut self, cf: impl ControlFunction + 'static) -> Self {
        self.cfs.push(Box::new(cf));
        self
    }

    /// The per-instance context.
    #[must_use]
    pub fn context(&self) -> &LoopContext {
        &self.ctx
    }

    /// Mutable access to the per-instance context.
    pub fn context_mut(&mut self) -> &mut LoopContext {
        &mut self.ctx
    }

    /// Run one reconciliation: reload tracked cache entries from the live
    /// API, converge the control functions, then execute dirty entries
    /// against the API.
    pub async fn run(&mut self) -> Result<(), Fatal> {
        let span = self.ctx.span().clone();
        let Self { ctx, engine, cfs } = self;
        async {
            engine.reload(ctx).await;

            // At least one scan must run so an empty or already-stable list
            // stabilizes in exactly one attempt.
            let max_attempts = (cfs.len() * 2).max(1);
            let mut stabilized = false;
            let mut attempt = 0;
            while attempt < max_attempts {
                debug!(attempt, max_attempts, "control loop executing");
                let mut changed = false;
                for cf in cfs.iter_mut() {
                    debug!(cf = cf.describe(), "sense");
                    cf.sense(ctx).await;
                    if cf.compare() {
                        info!(cf = cf.describe(), "respond");
                        cf.respond(ctx)?;
                        changed = true;
                        break;
                    }
                }
                if !changed {
                    stabilized = true;
                    break;
                }
                attempt += 1;
            }
            if !stabilized {
                return Err(Fatal::StabilizationLimit {
                    attempts: max_attempts,
                });
            }
            debug!("control loop is stable");

            engine.execute(ctx).await;
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Tear down managed resources after the custom resource has been
    /// removed.
    ///
    /// Runs bounded cleanup passes over the registered functions until all
    /// report completion. Exhausting the budget is logged as a standing
    /// warning rather than failing: teardown gaps are recoverable by an
    /// administrator, unlike convergence oscillation.
    pub async fn cleanup(&mut self) {
        let span = self.ctx.span().clone();
        let Self { ctx, cfs, .. } = self;
        async {
            info!("custom resource has been removed, starting resource cleanup");
            let max_attempts = (cfs.len() * 2).max(1);
            for _ in 0..max_attempts {
                let mut finished = true;
                for cf in cfs.iter_mut() {
                    let done = cf.cleanup(ctx).await;
                    if !done {
                        debug!(cf = cf.describe(), "control function requested cleanup retry");
                    }
                    finished = finished && done;
                }
                if finished {
                    info!("cleanup finished successfully");
                    return;
                }
            }
            warn!("cleanup did not finish, some resources may need to be deleted manually");
        }
        .instrument(span)
        .await;
    }
}
