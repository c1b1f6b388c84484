//! Host resource detection.
//!
//! The target devices are CPU-only, so the only things worth detecting are
//! memory and core count. They feed the default memory budget and the
//! default inference thread count when the configuration leaves them unset.

use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::warn;

const MIB: u64 = 1024 * 1024;

/// Smallest budget ever derived from host memory.
const BUDGET_FLOOR_MB: u64 = 512;

/// Snapshot of host memory and CPU resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResources {
    /// Total system RAM in bytes
    pub total_ram_bytes: u64,
    /// Available system RAM in bytes at detection time
    pub available_ram_bytes: u64,
    /// Number of logical CPU cores
    pub cpu_cores: usize,
}

impl HostResources {
    /// Inspect the host. Runs synchronously.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        Self {
            total_ram_bytes: sys.total_memory(),
            available_ram_bytes: sys.available_memory(),
            cpu_cores: num_cpus(),
        }
    }

    /// [`detect`](Self::detect) on the blocking pool, for async callers.
    ///
    /// If the detection task panics only the core count is reported.
    pub async fn detect_async() -> Self {
        match tokio::task::spawn_blocking(Self::detect).await {
            Ok(host) => host,
            Err(e) => {
                warn!(error = %e, "host detection failed");
                Self {
                    total_ram_bytes: 0,
                    available_ram_bytes: 0,
                    cpu_cores: num_cpus(),
                }
            }
        }
    }

    /// Budget used when none is configured: 80% of usable RAM.
    ///
    /// Falls back to total RAM when available RAM is unreported, with a
    /// floor of 512 MB so the value is always non-zero.
    pub fn default_memory_budget_mb(&self) -> u64 {
        let base = if self.available_ram_bytes > 0 {
            self.available_ram_bytes
        } else {
            self.total_ram_bytes
        };
        (((base as f64 * 0.8) as u64) / MIB).max(BUDGET_FLOOR_MB)
    }

    /// Thread count for a backend that does not pin one: all cores, capped
    /// at four so a generation call never starves the rest of the process.
    pub fn default_threads(&self) -> usize {
        self.cpu_cores.clamp(1, 4)
    }

    pub fn available_ram_mb(&self) -> u64 {
        self.available_ram_bytes / MIB
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detect_async_matches_sync_detect() {
        let host = HostResources::detect_async().await;
        assert_eq!(host.cpu_cores, HostResources::detect().cpu_cores);
        assert!(host.total_ram_bytes > 0);
    }

    #[test]
    fn test_detect_nonzero() {
        let host = HostResources::detect();
        assert!(host.total_ram_bytes > 0, "total RAM must be > 0");
        assert!(host.cpu_cores > 0, "cpu cores must be > 0");
    }

    #[test]
    fn test_default_budget_uses_available_ram() {
        let host = HostResources {
            total_ram_bytes: 8 * 1024 * MIB,
            available_ram_bytes: 4 * 1024 * MIB,
            cpu_cores: 4,
        };
        assert_eq!(host.default_memory_budget_mb(), 3276);
    }

    #[test]
    fn test_default_budget_falls_back_to_total_and_floor() {
        let unreported = HostResources {
            total_ram_bytes: 2 * 1024 * MIB,
            available_ram_bytes: 0,
            cpu_cores: 2,
        };
        assert_eq!(unreported.default_memory_budget_mb(), 1638);

        let tiny = HostResources {
            total_ram_bytes: 256 * MIB,
            available_ram_bytes: 100 * MIB,
            cpu_cores: 1,
        };
        assert_eq!(tiny.default_memory_budget_mb(), BUDGET_FLOOR_MB);
    }

    #[test]
    fn test_default_threads_capped() {
        let host = HostResources {
            total_ram_bytes: MIB,
            available_ram_bytes: MIB,
            cpu_cores: 16,
        };
        assert_eq!(host.default_threads(), 4);
    }
}
