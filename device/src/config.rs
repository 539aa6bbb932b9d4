//! Registry configuration.

/// Configuration of the devices a [`BufferRegistry`](crate::BufferRegistry) creates.
///
/// Capacities are byte budgets; `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct RegistryConfig {
    /// Number of accelerator devices next to the host (device 0).
    #[builder(default = 1)]
    pub accelerators: usize,
    /// Byte budget of the host device.
    pub host_capacity: Option<usize>,
    /// Byte budget of every accelerator device.
    pub device_capacity: Option<usize>,
    /// Freed allocations kept for reuse, per allocation size.
    #[builder(default = 32)]
    pub lru_depth: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { accelerators: 1, host_capacity: None, device_capacity: None, lru_depth: 32 }
    }
}

impl RegistryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `TESSEL_ACCELERATORS` - Number of accelerator devices (default: 1)
    /// * `TESSEL_HOST_MEMORY_MB` - Host memory budget in MiB (default: unlimited)
    /// * `TESSEL_DEVICE_MEMORY_MB` - Per-accelerator memory budget in MiB (default: unlimited)
    /// * `TESSEL_LRU_DEPTH` - Cached allocations per size (default: 32)
    pub fn from_env() -> Self {
        let accelerators = env_parse("TESSEL_ACCELERATORS").unwrap_or(1);
        let host_capacity = env_parse::<usize>("TESSEL_HOST_MEMORY_MB").map(|mb| mb.saturating_mul(1 << 20));
        let device_capacity = env_parse::<usize>("TESSEL_DEVICE_MEMORY_MB").map(|mb| mb.saturating_mul(1 << 20));
        let lru_depth = env_parse("TESSEL_LRU_DEPTH").unwrap_or(32);

        Self { accelerators, host_capacity, device_capacity, lru_depth }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
