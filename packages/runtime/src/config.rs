//! Runtime configuration.

use std::time::Duration;

/// Execution settings applied to every simulation a mesh creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Interval between cycle clock ticks.
    pub clock_period: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            clock_period: Duration::from_millis(200),
        }
    }
}

/// Mesh-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Queue depth of every task channel.
    pub channel_depth: usize,
    /// Ceiling on simultaneously owned network addresses.
    pub max_addresses: usize,
    /// Settings for simulations created in this mesh.
    pub sim: SimConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            channel_depth: 64,
            max_addresses: 1 << 20,
            sim: SimConfig::default(),
        }
    }
}
