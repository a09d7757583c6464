//! Hardware topology snapshot
//!
//! Packages, clusters, NUMA nodes, core counts and cache geometry, probed
//! once at startup. Consumed by [`crate::allocator::Allocator`] and
//! [`crate::pool::WorkerPool`]; nothing else reads the platform directly.
//!
//! On Linux the numbers come from sysfs; elsewhere (and when sysfs is
//! unavailable) conservative defaults apply: one package, one node, 64-byte
//! cache lines.

use std::num::NonZeroUsize;

/// Fallback cache line size when the platform does not report one.
const DEFAULT_LINE_BYTES: usize = 64;

/// Immutable description of the hardware this process runs on.
#[derive(Debug, Clone)]
pub struct Topology {
    /// CPU packages (sockets)
    pub num_packages: usize,
    /// Core clusters (CCX / tile); at least one per package
    pub num_clusters: usize,
    /// NUMA memory nodes
    pub num_nodes: usize,
    /// Logical cores available to this process
    pub num_cores: usize,
    /// Bytes per cache line
    pub line_bytes: usize,
    /// Bytes per native SIMD vector
    pub vector_bytes: usize,
    /// L1 data cache per core
    pub l1_bytes: usize,
    /// L2 cache per core
    pub l2_bytes: usize,
    /// Total L3 per package
    pub l3_bytes: usize,
}

impl Topology {
    /// Probe the running system.
    #[must_use]
    pub fn detect() -> Self {
        let num_cores = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let num_nodes = detect_numa_nodes();
        let num_packages = detect_packages();
        let line_bytes = detect_line_bytes();
        Self {
            num_packages,
            // Without cluster info, treat each package as one cluster.
            num_clusters: num_packages.max(1),
            num_nodes,
            num_cores,
            line_bytes,
            vector_bytes: native_vector_bytes(),
            l1_bytes: read_cache_bytes(0).unwrap_or(32 * 1024),
            l2_bytes: read_cache_bytes(2).unwrap_or(512 * 1024),
            l3_bytes: read_cache_bytes(3).unwrap_or(8 * 1024 * 1024),
        }
    }

    /// A fixed single-node topology for tests and embedded use.
    #[must_use]
    pub fn single_node(num_cores: usize) -> Self {
        Self {
            num_packages: 1,
            num_clusters: 1,
            num_nodes: 1,
            num_cores: num_cores.max(1),
            line_bytes: DEFAULT_LINE_BYTES,
            vector_bytes: native_vector_bytes(),
            l1_bytes: 32 * 1024,
            l2_bytes: 512 * 1024,
            l3_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Native vector width from compile-time target features.
#[must_use]
pub fn native_vector_bytes() -> usize {
    #[cfg(target_feature = "avx512f")]
    {
        64
    }
    #[cfg(all(target_feature = "avx2", not(target_feature = "avx512f")))]
    {
        32
    }
    #[cfg(not(any(target_feature = "avx2", target_feature = "avx512f")))]
    {
        16
    }
}

#[cfg(target_os = "linux")]
fn detect_numa_nodes() -> usize {
    // Nodes appear as /sys/devices/system/node/node<N>.
    let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") else {
        return 1;
    };
    let count = entries
        .flatten()
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with("node") && name[4..].chars().all(|c| c.is_ascii_digit())
        })
        .count();
    count.max(1)
}

#[cfg(not(target_os = "linux"))]
fn detect_numa_nodes() -> usize {
    1
}

#[cfg(target_os = "linux")]
fn detect_packages() -> usize {
    use std::collections::BTreeSet;
    let Ok(entries) = std::fs::read_dir("/sys/devices/system/cpu") else {
        return 1;
    };
    let mut packages = BTreeSet::new();
    for e in entries.flatten() {
        let name = e.file_name();
        let name = name.to_string_lossy().into_owned();
        if !name.starts_with("cpu") || !name[3..].chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let path = e.path().join("topology/physical_package_id");
        if let Ok(id) = std::fs::read_to_string(path) {
            if let Ok(id) = id.trim().parse::<usize>() {
                packages.insert(id);
            }
        }
    }
    packages.len().max(1)
}

#[cfg(not(target_os = "linux"))]
fn detect_packages() -> usize {
    1
}

#[cfg(target_os = "linux")]
fn detect_line_bytes() -> usize {
    std::fs::read_to_string("/sys/devices/system/cpu/cpu0/cache/index0/coherency_line_size")
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&n| n >= 32 && n.is_power_of_two())
        .unwrap_or(DEFAULT_LINE_BYTES)
}

#[cfg(not(target_os = "linux"))]
fn detect_line_bytes() -> usize {
    DEFAULT_LINE_BYTES
}

/// Cache size in bytes for the given sysfs cache index, if readable.
#[cfg(target_os = "linux")]
fn read_cache_bytes(index: usize) -> Option<usize> {
    let path = format!("/sys/devices/system/cpu/cpu0/cache/index{index}/size");
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    let (digits, mult) = match text.as_bytes().last()? {
        b'K' => (&text[..text.len() - 1], 1024),
        b'M' => (&text[..text.len() - 1], 1024 * 1024),
        _ => (text, 1),
    };
    digits.parse::<usize>().ok().map(|n| n * mult)
}

#[cfg(not(target_os = "linux"))]
fn read_cache_bytes(_index: usize) -> Option<usize> {
    None
}
