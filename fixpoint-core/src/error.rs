use thiserror::Error;

/// Unrecoverable defects detected by the engine.
///
/// A `Fatal` value signals a bug in the wiring of the operator, not a
/// transient condition of the cluster. It terminates the current
/// reconciliation and is expected to propagate out of the hosting process as
/// a crash/restart signal. It must never be swallowed or retried.
#[derive(Debug, Error)]
pub enum Fatal {
    /// The control loop did not stabilize within its iteration budget,
    /// meaning two or more control functions are oscillating.
    #[error("control loop failed to stabilize within {attempts} attempts")]
    StabilizationLimit {
        /// The exhausted attempt budget (`2 × |CFs|`).
        attempts: usize,
    },

    /// An environment variable dependency chain exceeded the supported depth,
    /// which indicates a dependency cycle or an unreasonably long chain.
    #[error("environment variable dependency chain at {name:?} exceeded depth {depth}")]
    EnvDependencyCycle {
        /// Name of the variable at which the limit was hit.
        name: String,
        /// Recursion depth reached.
        depth: usize,
    },
}
