//! Aligned, NUMA-aware memory allocation
//!
//! The [`Allocator`] is an explicit context object constructed once from a
//! [`Topology`] snapshot and threaded through every call site that acquires
//! memory. All sizing queries are pure reads of constants cached at
//! construction; nothing here mutates per-allocation state, so a shared
//! reference may be used concurrently from any thread.
//!
//! Buffers are sized and aligned in multiples of the allocation *quantum*:
//! the granularity that is safe for NUMA page placement and avoids false
//! sharing. Small blocks come from the global aligned heap, large blocks
//! from anonymous mappings; both share the [`AlignedBuf`] ownership type,
//! which carries the matching release function.

use std::ptr::NonNull;

use crate::error::{PonderarError, Result};
use crate::topology::Topology;

/// Upper bound on [`Allocator::quantum_bytes`], usable for fixed-size
/// stack buffers and compile-time stride computations.
pub const MAX_QUANTUM_BYTES: usize = 4096;

/// Allocations at or above this many bytes come from an anonymous mapping
/// instead of the aligned heap (huge-page friendly, returned to the OS on
/// free).
const MAP_THRESHOLD_BYTES: usize = 2 * 1024 * 1024;

/// Release function paired with an allocation. The byte count is required
/// for the mapped variant.
pub type FreeFn = unsafe fn(*mut u8, usize);

/// Allocation and sizing context derived from hardware topology.
#[derive(Debug, Clone)]
pub struct Allocator {
    line_bytes: usize,
    vector_bytes: usize,
    step_bytes: usize,
    quantum_bytes: usize,
    l1_bytes: usize,
    l2_bytes: usize,
    l3_bytes: usize,
    num_nodes: usize,
    bind_enabled: bool,
}

impl Allocator {
    /// Derive all size constants from `topology`. Build exactly one of
    /// these per process, before any allocation, and share it by reference.
    ///
    /// `enable_bind` opts in to NUMA page binding; it only takes effect
    /// when the platform exposes page placement and more than one node
    /// exists.
    #[must_use]
    pub fn new(topology: &Topology, enable_bind: bool) -> Self {
        let line_bytes = topology.line_bytes;
        let vector_bytes = topology.vector_bytes;
        let step_bytes = line_bytes.max(vector_bytes);
        let bind_possible = cfg!(target_os = "linux") && enable_bind && topology.num_nodes > 1;
        // When binding may happen, the quantum must cover a whole page so a
        // bound region never straddles nodes. Otherwise cache-line/vector
        // granularity suffices.
        let quantum_bytes = if bind_possible {
            page_bytes().min(MAX_QUANTUM_BYTES)
        } else {
            step_bytes
        };
        debug_assert!(quantum_bytes <= MAX_QUANTUM_BYTES);
        debug_assert!(quantum_bytes % step_bytes == 0);
        Self {
            line_bytes,
            vector_bytes,
            step_bytes,
            quantum_bytes,
            l1_bytes: topology.l1_bytes,
            l2_bytes: topology.l2_bytes,
            l3_bytes: topology.l3_bytes,
            num_nodes: topology.num_nodes,
            bind_enabled: bind_possible,
        }
    }

    /// Bytes per cache line. Ranges chosen as multiples of this cannot
    /// false-share.
    #[must_use]
    pub fn line_bytes(&self) -> usize {
        self.line_bytes
    }

    /// Bytes per full native vector; loop-step granularity.
    #[must_use]
    pub fn vector_bytes(&self) -> usize {
        self.vector_bytes
    }

    /// Work granularity avoiding both false sharing and partial vectors.
    #[must_use]
    pub fn step_bytes(&self) -> usize {
        self.step_bytes
    }

    /// Allocation granularity, additionally safe for NUMA placement.
    #[must_use]
    pub fn quantum_bytes(&self) -> usize {
        self.quantum_bytes
    }

    /// `quantum_bytes / step_bytes`; the period of the cyclic row offsets.
    #[must_use]
    pub fn quantum_steps(&self) -> usize {
        self.quantum_bytes / self.step_bytes
    }

    /// L1 data cache per core.
    #[must_use]
    pub fn l1_bytes(&self) -> usize {
        self.l1_bytes
    }

    /// L2 cache per core.
    #[must_use]
    pub fn l2_bytes(&self) -> usize {
        self.l2_bytes
    }

    /// Total L3 per package.
    #[must_use]
    pub fn l3_bytes(&self) -> usize {
        self.l3_bytes
    }

    /// Round `bytes` up to a quantum multiple.
    ///
    /// # Panics
    ///
    /// When the rounded size exceeds `usize::MAX`. The allocation entry
    /// points reject such sizes before rounding.
    #[must_use]
    pub fn round_up_to_quantum(&self, bytes: usize) -> usize {
        bytes.next_multiple_of(self.quantum_bytes)
    }

    /// Allocate `num` elements of plain (no-drop) `T`, zero-initialized,
    /// aligned to the quantum. Returns the empty buffer if the quantum-
    /// rounded byte size overflows; callers must check
    /// [`AlignedBuf::is_empty`] before use when `num` is untrusted.
    #[must_use]
    pub fn alloc<T: Copy>(&self, num: usize) -> AlignedBuf<T> {
        let Some(bytes) = num
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|b| b.checked_next_multiple_of(self.quantum_bytes))
        else {
            return AlignedBuf::empty();
        };
        if num == 0 {
            return AlignedBuf::empty();
        }
        let (ptr, rounded, free) = self.alloc_bytes(bytes);
        AlignedBuf {
            ptr: ptr.cast(),
            num,
            bytes: rounded,
            free: Some(free),
        }
    }

    /// Same sizing contract as [`Allocator::alloc`], but constructs each
    /// element in place via `ctor(i)` and drops elements on release.
    #[must_use]
    pub fn alloc_with<T, F: FnMut(usize) -> T>(&self, num: usize, mut ctor: F) -> AlignedClassBuf<T> {
        let Some(bytes) = num
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|b| b.checked_next_multiple_of(self.quantum_bytes))
        else {
            return AlignedClassBuf::empty();
        };
        if num == 0 {
            return AlignedClassBuf::empty();
        }
        let (ptr, rounded, free) = self.alloc_bytes(bytes);
        let elems: *mut T = ptr.cast().as_ptr();
        for i in 0..num {
            // SAFETY: `elems` spans at least `num` elements of T; each slot
            // is written exactly once before any read.
            unsafe { elems.add(i).write(ctor(i)) };
        }
        AlignedClassBuf {
            ptr: ptr.cast(),
            num,
            bytes: rounded,
            free: Some(free),
        }
    }

    /// Whether [`Allocator::bind_memory`] can and should be called: page
    /// placement is available and more than one NUMA node exists.
    #[must_use]
    pub fn should_bind(&self) -> bool {
        self.bind_enabled && self.num_nodes > 1
    }

    /// Attempt to migrate `[ptr, ptr + bytes)` to `node`. Zeroes the region
    /// as a side effect of realizing pages on the target node, so only call
    /// this on freshly allocated buffers not yet in use.
    ///
    /// Preconditions (debug-asserted): `should_bind()`, and `ptr`/`bytes`
    /// are quantum multiples.
    ///
    /// # Errors
    ///
    /// [`PonderarError::BindFailed`] when the placement syscall is refused;
    /// the region stays valid and unbound.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an owned, writable region of at least `bytes`
    /// bytes with no live references into it.
    #[cfg(target_os = "linux")]
    pub unsafe fn bind_memory(&self, ptr: *mut u8, bytes: usize, node: usize) -> Result<()> {
        debug_assert!(self.should_bind());
        debug_assert_eq!(ptr as usize % self.quantum_bytes, 0);
        debug_assert_eq!(bytes % self.quantum_bytes, 0);
        // glibc ships no mbind wrapper (it lives in libnuma), so issue the
        // raw syscall with the kernel ABI constants.
        const MPOL_BIND: libc::c_long = 2;
        const MPOL_MF_STRICT: libc::c_ulong = 1 << 0;
        const MPOL_MF_MOVE: libc::c_ulong = 1 << 1;
        let nodemask: libc::c_ulong = 1 << node;
        // SAFETY: caller guarantees ownership of the region; nodemask is a
        // single word and maxnode covers it.
        let ret = libc::syscall(
            libc::SYS_mbind,
            ptr as *mut libc::c_void,
            bytes as libc::c_ulong,
            MPOL_BIND,
            std::ptr::addr_of!(nodemask),
            (8 * std::mem::size_of::<libc::c_ulong>()) as libc::c_ulong,
            MPOL_MF_MOVE | MPOL_MF_STRICT,
        );
        if ret != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(PonderarError::BindFailed { node, bytes, errno });
        }
        // First-touch on the target node; also why the contract says the
        // region is zeroed.
        std::ptr::write_bytes(ptr, 0, bytes);
        Ok(())
    }

    /// Non-Linux stub: binding is never available, so calling this is a
    /// precondition violation.
    ///
    /// # Errors
    ///
    /// Always returns [`PonderarError::BindFailed`].
    ///
    /// # Safety
    ///
    /// No memory is touched.
    #[cfg(not(target_os = "linux"))]
    pub unsafe fn bind_memory(&self, _ptr: *mut u8, bytes: usize, node: usize) -> Result<()> {
        debug_assert!(!self.should_bind());
        Err(PonderarError::BindFailed {
            node,
            bytes,
            errno: 0,
        })
    }

    /// Acquire `bytes` (rounded up to a quantum multiple) of zeroed memory
    /// aligned to the quantum, together with the matching release function.
    fn alloc_bytes(&self, bytes: usize) -> (NonNull<u8>, usize, FreeFn) {
        let rounded = self.round_up_to_quantum(bytes.max(1));
        if cfg!(unix) && rounded >= MAP_THRESHOLD_BYTES {
            if let Some(ptr) = alloc_mapped(rounded) {
                return (ptr, rounded, free_mapped);
            }
            // Mapping refused; fall through to the heap.
        }
        // Heap path always uses MAX_QUANTUM_BYTES alignment so the release
        // layout is reconstructible from the byte count alone.
        let layout = std::alloc::Layout::from_size_align(rounded, MAX_QUANTUM_BYTES)
            .expect("quantum-rounded layout");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(layout);
        };
        (ptr, rounded, free_heap)
    }
}

fn page_bytes() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf is always safe to call.
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n > 0 {
            return n as usize;
        }
    }
    #[allow(unreachable_code)]
    4096
}

/// Release function for the aligned-heap path.
unsafe fn free_heap(ptr: *mut u8, bytes: usize) {
    let layout = std::alloc::Layout::from_size_align(bytes, MAX_QUANTUM_BYTES)
        .expect("quantum-rounded layout");
    std::alloc::dealloc(ptr, layout);
}

#[cfg(unix)]
fn alloc_mapped(bytes: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous private mapping, no fd, offset 0.
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(raw.cast())
}

#[cfg(not(unix))]
fn alloc_mapped(_bytes: usize) -> Option<NonNull<u8>> {
    None
}

/// Release function for the mapped path.
#[cfg(unix)]
unsafe fn free_mapped(ptr: *mut u8, bytes: usize) {
    libc::munmap(ptr.cast(), bytes);
}

#[cfg(not(unix))]
unsafe fn free_mapped(_ptr: *mut u8, _bytes: usize) {
    unreachable!("mapped allocations do not exist on this platform");
}

/// Move-only owner of a quantum-aligned block of plain `T`.
///
/// The empty buffer (from sizing overflow, zero `num`, or
/// [`AlignedBuf::empty`]) owns nothing and is safe to drop.
#[derive(Debug)]
pub struct AlignedBuf<T> {
    ptr: NonNull<T>,
    num: usize,
    bytes: usize,
    free: Option<FreeFn>,
}

// SAFETY: AlignedBuf uniquely owns its block; access follows &/&mut rules.
unsafe impl<T: Send> Send for AlignedBuf<T> {}
unsafe impl<T: Sync> Sync for AlignedBuf<T> {}

impl<T> AlignedBuf<T> {
    /// The buffer that owns nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            num: 0,
            bytes: 0,
            free: None,
        }
    }

    /// Number of `T` elements requested at allocation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.num
    }

    /// True for the empty buffer (including failed overflow allocations).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    /// Quantum-rounded size of the underlying block.
    #[must_use]
    pub fn num_bytes(&self) -> usize {
        self.bytes
    }

    /// Base pointer; dangling when empty.
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    /// Mutable base pointer; dangling when empty.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// View the elements.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: `ptr` spans `num` initialized elements (zeroed Copy data).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.num) }
    }

    /// View the elements mutably.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: unique ownership, `num` initialized elements.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.num) }
    }
}

impl<T> Drop for AlignedBuf<T> {
    fn drop(&mut self) {
        if let Some(free) = self.free {
            // SAFETY: `free` matches the acquisition strategy and `bytes`
            // is the exact rounded size it was given.
            unsafe { free(self.ptr.as_ptr().cast(), self.bytes) };
        }
    }
}

/// Move-only owner of a quantum-aligned block of non-trivial `T`.
/// Elements are dropped in place before the block is released.
#[derive(Debug)]
pub struct AlignedClassBuf<T> {
    ptr: NonNull<T>,
    num: usize,
    bytes: usize,
    free: Option<FreeFn>,
}

// SAFETY: unique ownership, same reasoning as AlignedBuf.
unsafe impl<T: Send> Send for AlignedClassBuf<T> {}
unsafe impl<T: Sync> Sync for AlignedClassBuf<T> {}

impl<T> AlignedClassBuf<T> {
    /// The buffer that owns nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            num: 0,
            bytes: 0,
            free: None,
        }
    }

    /// Number of constructed elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.num
    }

    /// True for the empty buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num == 0
    }

    /// View the elements.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: all `num` elements were constructed by `alloc_with`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.num) }
    }

    /// View the elements mutably.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: unique ownership, all elements constructed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.num) }
    }
}

impl<T> Drop for AlignedClassBuf<T> {
    fn drop(&mut self) {
        let Some(free) = self.free else { return };
        for i in 0..self.num {
            // SAFETY: element i was constructed and is dropped exactly once.
            unsafe { std::ptr::drop_in_place(self.ptr.as_ptr().add(i)) };
        }
        // SAFETY: matching release function and exact rounded byte count.
        unsafe { free(self.ptr.as_ptr().cast(), self.bytes) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_alloc() -> Allocator {
        Allocator::new(&Topology::single_node(2), false)
    }

    #[test]
    fn test_overflow_returns_empty() {
        let alloc = test_alloc();
        let buf = alloc.alloc::<u64>(usize::MAX / 4);
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
        // Empty is droppable without touching an allocator.
        drop(buf);
    }

    #[test]
    fn test_rounding_overflow_returns_empty() {
        let alloc = test_alloc();
        // The element count survives the multiply guard but rounding the
        // byte size up to a quantum multiple would overflow.
        assert!(alloc.alloc::<u8>(usize::MAX).is_empty());
        assert!(alloc.alloc_with(usize::MAX, |_| 0u8).is_empty());
    }

    #[test]
    fn test_zero_len_is_empty() {
        let alloc = test_alloc();
        assert!(alloc.alloc::<f32>(0).is_empty());
    }

    #[test]
    fn test_alignment_and_rounding() {
        let alloc = test_alloc();
        let buf = alloc.alloc::<f32>(100);
        assert!(!buf.is_empty());
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.as_ptr() as usize % alloc.quantum_bytes(), 0);
        assert_eq!(buf.num_bytes() % alloc.quantum_bytes(), 0);
        assert!(buf.num_bytes() >= 400);
    }

    #[test]
    fn test_zero_initialized() {
        let alloc = test_alloc();
        let buf = alloc.alloc::<u8>(1 << 12);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mapped_path_large_alloc() {
        let alloc = test_alloc();
        // Above MAP_THRESHOLD_BYTES; exercises mmap/munmap on unix.
        let mut buf = alloc.alloc::<u8>(MAP_THRESHOLD_BYTES + 1);
        assert!(!buf.is_empty());
        buf.as_mut_slice()[MAP_THRESHOLD_BYTES] = 7;
        assert_eq!(buf.as_slice()[MAP_THRESHOLD_BYTES], 7);
    }

    #[test]
    fn test_move_transfers_ownership() {
        let alloc = test_alloc();
        let mut buf = alloc.alloc::<u32>(16);
        buf.as_mut_slice()[3] = 42;
        let moved = buf;
        assert_eq!(moved.as_slice()[3], 42);
    }

    #[test]
    fn test_alloc_with_ctor_and_drop() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Probe(usize);
        impl Drop for Probe {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }
        let alloc = test_alloc();
        {
            let buf = alloc.alloc_with(5, Probe);
            assert_eq!(buf.len(), 5);
            assert_eq!(buf.as_slice()[4].0, 4);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_alloc_with_overflow_returns_empty() {
        let alloc = test_alloc();
        let buf = alloc.alloc_with(usize::MAX / 2, |_| 0u64);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_step_and_quantum_relations() {
        let alloc = test_alloc();
        assert_eq!(
            alloc.step_bytes(),
            alloc.line_bytes().max(alloc.vector_bytes())
        );
        assert!(alloc.quantum_bytes() <= MAX_QUANTUM_BYTES);
        assert_eq!(alloc.quantum_bytes() % alloc.step_bytes(), 0);
        assert_eq!(
            alloc.quantum_steps(),
            alloc.quantum_bytes() / alloc.step_bytes()
        );
    }

    #[test]
    fn test_should_bind_single_node() {
        // One node: never bind, regardless of the opt-in.
        let alloc = Allocator::new(&Topology::single_node(2), true);
        assert!(!alloc.should_bind());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bind_memory_node_zero() {
        let mut topo = Topology::single_node(2);
        topo.num_nodes = 2;
        let alloc = Allocator::new(&topo, true);
        let mut buf = alloc.alloc::<u8>(alloc.quantum_bytes());
        // Node 0 always exists; the placement syscall may still be refused
        // on kernels without NUMA support, which must surface as BindFailed.
        let ret = unsafe { alloc.bind_memory(buf.as_mut_ptr(), buf.num_bytes(), 0) };
        match ret {
            Ok(()) => assert!(buf.as_slice().iter().all(|&b| b == 0)),
            Err(PonderarError::BindFailed { node, .. }) => assert_eq!(node, 0),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_bind_quantum_is_page_sized() {
        let mut topo = Topology::single_node(2);
        topo.num_nodes = 2;
        let alloc = Allocator::new(&topo, true);
        assert!(alloc.should_bind());
        assert!(alloc.quantum_bytes() >= alloc.step_bytes());
        assert_eq!(alloc.quantum_bytes() % alloc.step_bytes(), 0);
    }
}
