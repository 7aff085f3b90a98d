//! Pool configuration.
//!
//! A [`PoolConfig`] describes the geometry of the buffer pool: how large
//! each shared-memory segment is, how many segment slots exist, and how
//! many of them are persistent (never released when they drain). The
//! configuration is validated once when the pool is created; the resolved
//! values are immutable for the pool's lifetime because every cooperating
//! process derives the same virtual layout from them.

use crate::chunk::MAX_CLASS;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};

const GIB: u64 = 1 << 30;

/// Smallest permitted segment size (256 MiB).
pub const MIN_SEGMENT_SIZE: usize = 1 << 28;

/// Largest permitted segment size (one maximal-class chunk, 16 GiB).
pub const MAX_SEGMENT_SIZE: usize = 1 << MAX_CLASS;

/// Smallest permitted number of segment slots.
pub const MIN_SEGMENTS: u32 = 2;

/// Largest permitted number of segment slots.
pub const MAX_SEGMENTS: u32 = 32_768;

/// Configuration for a [`DmaBufferPool`](crate::DmaBufferPool).
///
/// # Example
///
/// ```rust,ignore
/// use dmapool::PoolConfig;
///
/// let cfg = PoolConfig {
///     segment_size: 1 << 28,
///     max_segments: 8,
///     ..PoolConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Bytes per segment. Must be a multiple of the page size, between
    /// [`MIN_SEGMENT_SIZE`] and [`MAX_SEGMENT_SIZE`]. Also the upper bound
    /// on a single allocation.
    pub segment_size: usize,
    /// Total number of segment descriptor slots. The virtual reservation
    /// covers `max_segments * segment_size` bytes.
    pub max_segments: u32,
    /// Number of leading segments that are persistent: once created they
    /// are never released when their last chunk is freed. `None` derives a
    /// default from `device_memory` (see [`default_persistent_count`]).
    pub persistent_segments: Option<u32>,
    /// Total attached device memory in bytes, used only to derive the
    /// persistent-segment default. Zero is fine when no device is present.
    pub device_memory: u64,
    /// Token namespacing the shared-memory object names, so that unrelated
    /// pools on one host never collide. `None` derives a per-process
    /// unique value.
    pub namespace: Option<u32>,
    /// Install the SIGSEGV/SIGBUS handler that attaches segments on
    /// demand. Exactly one pool per process may have this enabled.
    pub install_fault_handler: bool,
    /// Stamp fresh payloads with `0xAE` and freed payloads with `0xF5`.
    /// Catches use-after-free and uninitialized reads at the cost of
    /// touching every allocated byte.
    pub poison: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            segment_size: 1 << 30,
            max_segments: 1024,
            persistent_segments: None,
            device_memory: 0,
            namespace: None,
            install_fault_handler: true,
            poison: false,
        }
    }
}

/// Validated configuration, fixed for the pool's lifetime.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub(crate) segment_size: usize,
    pub(crate) max_segments: u32,
    pub(crate) persistent_segments: u32,
    pub(crate) namespace: u32,
    pub(crate) install_fault_handler: bool,
    pub(crate) poison: bool,
}

impl PoolConfig {
    pub(crate) fn resolve(&self) -> Result<ResolvedConfig> {
        let page = rustix::param::page_size();
        if self.segment_size % page != 0 {
            return Err(Error::InvalidConfig(format!(
                "segment_size {} is not a multiple of the page size {}",
                self.segment_size, page
            )));
        }
        if !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&self.segment_size) {
            return Err(Error::InvalidConfig(format!(
                "segment_size {} outside [{}, {}]",
                self.segment_size, MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE
            )));
        }
        if !(MIN_SEGMENTS..=MAX_SEGMENTS).contains(&self.max_segments) {
            return Err(Error::InvalidConfig(format!(
                "max_segments {} outside [{}, {}]",
                self.max_segments, MIN_SEGMENTS, MAX_SEGMENTS
            )));
        }
        let persistent = match self.persistent_segments {
            Some(n) => {
                if n > self.max_segments {
                    return Err(Error::InvalidConfig(format!(
                        "persistent_segments {} exceeds max_segments {}",
                        n, self.max_segments
                    )));
                }
                n
            }
            None => default_persistent_count(self.device_memory, self.segment_size)
                .min(self.max_segments),
        };
        Ok(ResolvedConfig {
            segment_size: self.segment_size,
            max_segments: self.max_segments,
            persistent_segments: persistent,
            namespace: self.namespace.unwrap_or_else(unique_namespace),
            install_fault_handler: self.install_fault_handler,
            poison: self.poison,
        })
    }
}

/// Derive the default number of persistent segments from the total device
/// memory.
///
/// Device drivers can pin only a fraction of host memory before starving
/// the rest of the system, so the reserve tapers off: everything up to
/// 4 GiB, two thirds of the part above 4 GiB, half of the part above
/// 10 GiB, one third of the part above 16 GiB. The result is floored at
/// two segments.
pub fn default_persistent_count(device_memory: u64, segment_size: usize) -> u32 {
    let reserved = if device_memory >= 16 * GIB {
        (device_memory - 16 * GIB) / 3 + 11 * GIB
    } else if device_memory >= 10 * GIB {
        (device_memory - 10 * GIB) / 2 + 8 * GIB
    } else if device_memory >= 4 * GIB {
        (device_memory - 4 * GIB) * 2 / 3 + 4 * GIB
    } else {
        device_memory
    };
    ((reserved / segment_size as u64) as u32).max(2)
}

/// Per-process unique namespace token for object names.
///
/// Two pools created in one process (or in unrelated processes that happen
/// to share a pid after recycling) must not open each other's objects, so
/// the pid is mixed with a process-wide counter.
fn unique_namespace() -> u32 {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::process::id().rotate_left(8) ^ n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_resolves() {
        let cfg = PoolConfig::default().resolve().unwrap();
        assert_eq!(cfg.segment_size, 1 << 30);
        assert_eq!(cfg.max_segments, 1024);
        assert_eq!(cfg.persistent_segments, 2);
    }

    #[test]
    fn test_segment_size_bounds() {
        let too_small = PoolConfig {
            segment_size: 1 << 20,
            ..PoolConfig::default()
        };
        assert!(too_small.resolve().is_err());

        let unaligned = PoolConfig {
            segment_size: (1 << 28) + 13,
            ..PoolConfig::default()
        };
        assert!(unaligned.resolve().is_err());
    }

    #[test]
    fn test_persistent_cannot_exceed_total() {
        let cfg = PoolConfig {
            max_segments: 4,
            persistent_segments: Some(5),
            ..PoolConfig::default()
        };
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn test_persistent_tiers() {
        let seg = 1usize << 30;
        // No device: floor of two segments.
        assert_eq!(default_persistent_count(0, seg), 2);
        // 8 GiB device: 4 + 4*2/3 GiB reserved.
        assert_eq!(default_persistent_count(8 * GIB, seg), 6);
        // 12 GiB device: 8 + 1 GiB reserved.
        assert_eq!(default_persistent_count(12 * GIB, seg), 9);
        // 22 GiB device: 11 + 2 GiB reserved.
        assert_eq!(default_persistent_count(22 * GIB, seg), 13);
    }

    #[test]
    fn test_namespaces_are_unique() {
        let a = unique_namespace();
        let b = unique_namespace();
        assert_ne!(a, b);
    }
}
