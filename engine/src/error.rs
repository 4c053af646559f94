//! Typed failure taxonomy for the engine.
//!
//! Every failure is surfaced to the caller as a value; process termination
//! belongs to the top-level driver only.
use std::time::Duration;

/// Errors produced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A control-plane call failed in transport or was rejected.
    #[error("control plane error: {source}")]
    Kube {
        /// Underlying client error.
        #[from]
        source: kube::Error,
    },
    /// A create call did not yield a usable resource.
    #[error("failed to create {kind} '{name}': {source}")]
    ResourceCreate {
        /// Resource kind, e.g. "pod".
        kind: &'static str,
        /// Name of the resource that was being created.
        name: String,
        /// Underlying client error.
        #[source]
        source: kube::Error,
    },
    /// A pod reached a terminal phase while we waited for it to run.
    #[error("pod '{name}' entered terminal phase '{phase}' while waiting for Running")]
    PodFailed {
        /// Name of the pod.
        name: String,
        /// Observed terminal phase.
        phase: String,
    },
    /// One or more creations in a batch failed; the rest were not rolled back.
    #[error("{}/{total} resources in batch were not created", .failed.len())]
    BatchCreate {
        /// Names of the resources that failed to create.
        failed: Vec<String>,
        /// Size of the batch.
        total: usize,
    },
    /// A migration failed after the replacement pod was created.
    ///
    /// Nothing is rolled back: the caller owns reconciliation and gets every
    /// resource identity involved.
    #[error(
        "migration of pod '{old_pod}' left partial state ({reason}): \
         new pod {new_pod:?}, new service {new_service:?}"
    )]
    MigrationPartial {
        /// Name of the pod that was being migrated.
        old_pod: String,
        /// Name of the service that routed to it.
        old_service: String,
        /// Name of the replacement pod, if it was created.
        new_pod: Option<String>,
        /// Name of the replacement service, if it was created.
        new_service: Option<String>,
        /// What went wrong.
        reason: String,
    },
    /// The engine or cluster is misconfigured, e.g. no reachable address.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Streaming a file into a pod failed.
    #[error("staging into pod '{pod}' failed: {source}")]
    Staging {
        /// Target pod.
        pod: String,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
    /// A call to the external routing controller failed.
    #[error("routing controller call failed: {source}")]
    Routing {
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
    /// A bounded wait expired before the observed condition held.
    #[error("timed out after {waited:?} waiting for {what}")]
    WaitTimeout {
        /// Description of the awaited condition.
        what: String,
        /// How long the wait lasted.
        waited: Duration,
    },
}
