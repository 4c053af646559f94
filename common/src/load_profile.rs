//! Wire type exchanged with the utilization server's `/metrics/{hostname}/` endpoint.
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Number of millicores that make up one dedicated core.
pub const CPU_UNIT: u64 = 1000;

/// Synthetic load assigned to a workload hostname.
///
/// The utilization server hands this profile to a stress container when it
/// registers, which then occupies `ram` and burns `cpu` accordingly.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, JsonSchema)]
pub struct LoadProfile {
    /// Memory to occupy, in mebibytes.
    pub ram: u64,
    /// CPU to burn, in millicores.
    pub cpu: u64,
}

impl LoadProfile {
    /// Number of cores to load at 100%.
    pub fn dedicated_cores(&self) -> u64 {
        self.cpu / CPU_UNIT
    }

    /// Leftover load on one extra core, in millicores.
    pub fn residual_millicores(&self) -> u64 {
        self.cpu % CPU_UNIT
    }
}
