//! Row-major matrix views
//!
//! [`RowVectorBatch`] owns aligned storage for a `(rows x cols)` batch;
//! [`RowPtr`] is a non-owning view with an explicit stride used by the
//! batched compute paths.
//!
//! When the allocation quantum is a whole page (NUMA binding enabled),
//! padding every row to the quantum would make all rows alias the same
//! cache sets. `RowPtr` avoids that by pulling row `r` forward by a cyclic
//! offset of `(r & row_mask) * step` elements, a multiple of the cache-line
//! step that resets every `quantum_steps` rows. Row 0 is never offset, so
//! the view's base pointer is always the first row.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::allocator::{AlignedBuf, Allocator, MAX_QUANTUM_BYTES};

/// Rows and columns of a 2-D region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extents2D {
    /// Number of rows
    pub rows: usize,
    /// Elements per row
    pub cols: usize,
}

impl Extents2D {
    /// Convenience constructor.
    #[must_use]
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// `rows * cols`.
    #[must_use]
    pub fn area(&self) -> usize {
        self.rows * self.cols
    }
}

/// Stride that leaves room for the cyclic row offsets: `cols` rounded up to
/// a quantum of elements, plus one more quantum. Uses the compile-time
/// quantum upper bound so the value does not depend on runtime topology.
#[must_use]
pub fn stride_for_cyclic_offsets<T>(cols: usize) -> usize {
    let quantum = MAX_QUANTUM_BYTES / std::mem::size_of::<T>();
    cols.div_ceil(quantum) * quantum + quantum
}

/// Owning, aligned storage for a batch of row vectors.
///
/// Move-only; the backing [`AlignedBuf`] transfers with it.
#[derive(Debug)]
pub struct RowVectorBatch<T> {
    mem: AlignedBuf<T>,
    extents: Extents2D,
    stride: usize,
}

impl<T: Copy> RowVectorBatch<T> {
    /// Tightly packed batch (`stride == cols`), zero-initialized.
    #[must_use]
    pub fn new(alloc: &Allocator, extents: Extents2D) -> Self {
        Self::with_stride(alloc, extents, extents.cols)
    }

    /// Batch with an explicit `stride >= cols`. The allocation is
    /// `rows * stride` elements rounded up to the allocation quantum so the
    /// whole matrix may later be bound to a NUMA node.
    #[must_use]
    pub fn with_stride(alloc: &Allocator, extents: Extents2D, stride: usize) -> Self {
        assert!(
            stride >= extents.cols,
            "stride {stride} < cols {}",
            extents.cols
        );
        let quantum_elems = (alloc.quantum_bytes() / std::mem::size_of::<T>()).max(1);
        let padded = (extents.rows * stride).div_ceil(quantum_elems) * quantum_elems;
        Self {
            mem: alloc.alloc::<T>(padded),
            extents,
            stride,
        }
    }

    /// Batch padded for the cyclic-offset optimization.
    #[must_use]
    pub fn aligned(alloc: &Allocator, extents: Extents2D) -> Self {
        Self::with_stride(alloc, extents, stride_for_cyclic_offsets::<T>(extents.cols))
    }

    /// Number of rows in the batch.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.extents.rows
    }

    /// Elements per row.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.extents.cols
    }

    /// Elements between consecutive row starts.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The batch extents.
    #[must_use]
    pub fn extents(&self) -> Extents2D {
        self.extents
    }

    /// Row `i` as a slice of `cols` elements. Plain fixed-stride indexing;
    /// cyclic offsets only apply through [`RowPtr`].
    #[must_use]
    pub fn row(&self, i: usize) -> &[T] {
        debug_assert!(i < self.extents.rows);
        &self.mem.as_slice()[i * self.stride..i * self.stride + self.extents.cols]
    }

    /// Mutable row `i`.
    #[must_use]
    pub fn row_mut(&mut self, i: usize) -> &mut [T] {
        debug_assert!(i < self.extents.rows);
        let cols = self.extents.cols;
        let start = i * self.stride;
        &mut self.mem.as_mut_slice()[start..start + cols]
    }

    /// The entire padded storage, for whole-batch operations.
    #[must_use]
    pub fn all(&self) -> &[T] {
        self.mem.as_slice()
    }

    /// Mutable whole-batch storage.
    #[must_use]
    pub fn all_mut(&mut self) -> &mut [T] {
        self.mem.as_mut_slice()
    }

    /// Bytes covered by `rows * stride` elements.
    #[must_use]
    pub fn num_bytes(&self) -> usize {
        self.extents.rows * self.stride * std::mem::size_of::<T>()
    }
}

static STRIDE_WARNED: AtomicBool = AtomicBool::new(false);

/// Non-owning view of rows with an explicit stride and cyclic row offsets.
///
/// Copyable by design: the compute paths pass these by value. The caller is
/// responsible for not mutating the same rows from two views concurrently.
#[derive(Debug, Clone, Copy)]
pub struct RowPtr<'a, T> {
    row0: *mut T,
    stride: usize,
    /// Elements per step; copied from the allocator to keep row math local.
    step: u32,
    cols: u32,
    row_mask: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: the view itself carries no interior state; aliasing discipline is
// delegated to callers partitioning disjoint row ranges.
unsafe impl<T: Send> Send for RowPtr<'_, T> {}
unsafe impl<T: Sync> Sync for RowPtr<'_, T> {}

impl<'a, T: Copy> RowPtr<'a, T> {
    /// View over rows of `cols` elements starting at `row0`, with row
    /// starts `stride` elements apart. When `stride` is too small for the
    /// cyclic offsets they are disabled (once, with a diagnostic), leaving
    /// exact fixed-stride addressing.
    #[must_use]
    pub fn new(alloc: &Allocator, row0: &'a mut [T], cols: usize, stride: usize) -> Self {
        debug_assert!(stride >= cols);
        let step = (alloc.step_bytes() / std::mem::size_of::<T>()).max(1);
        let mut row_mask = alloc.quantum_steps() - 1;
        if stride < stride_for_cyclic_offsets::<T>(cols) {
            if row_mask != 0 && !STRIDE_WARNED.swap(true, Ordering::Relaxed) {
                eprintln!(
                    "ponderar: RowPtr stride={stride} < cyclic-offset stride for \
                     cols={cols}; disabling cyclic offsets"
                );
            }
            row_mask = 0;
        }
        Self {
            row0: row0.as_mut_ptr(),
            stride,
            step: u32::try_from(step).unwrap_or(u32::MAX),
            cols: u32::try_from(cols).unwrap_or(u32::MAX),
            row_mask,
            _marker: PhantomData,
        }
    }

    /// Tightly packed view (`stride == cols`).
    #[must_use]
    pub fn packed(alloc: &Allocator, row0: &'a mut [T], cols: usize) -> Self {
        Self::new(alloc, row0, cols, cols)
    }

    /// Start of row `r`: `row0 + stride*r` minus the cyclic padding offset.
    /// Row 0 is always `row0` exactly.
    #[must_use]
    pub fn row_ptr(&self, r: usize) -> *mut T {
        let pad = (r & self.row_mask) * self.step as usize;
        debug_assert!(pad * std::mem::size_of::<T>() < MAX_QUANTUM_BYTES);
        // SAFETY: callers constructed the view over storage spanning all
        // rows; pad never exceeds the extra quantum of stride padding.
        unsafe { self.row0.add(self.stride * r).sub(pad) }
    }

    /// Row `r` as a shared slice of `cols` elements.
    ///
    /// # Safety
    ///
    /// `r` must be within the viewed storage and no `&mut` to the same row
    /// may be live.
    #[must_use]
    pub unsafe fn row(&self, r: usize) -> &'a [T] {
        std::slice::from_raw_parts(self.row_ptr(r), self.cols as usize)
    }

    /// Row `r` as a mutable slice of `cols` elements.
    ///
    /// # Safety
    ///
    /// `r` must be within the viewed storage and the caller must guarantee
    /// exclusive access to this row (parallel callers partition disjoint
    /// row ranges).
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn row_mut(&self, r: usize) -> &'a mut [T] {
        std::slice::from_raw_parts_mut(self.row_ptr(r), self.cols as usize)
    }

    /// Elements per row.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols as usize
    }

    /// Elements between consecutive row starts.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Override the stride. This permanently disables the cyclic offsets:
    /// downstream fixed-stride writers (cache writers) require rows exactly
    /// `stride` elements apart.
    pub fn set_stride(&mut self, stride: usize) {
        debug_assert!(stride >= self.cols as usize);
        self.stride = stride;
        self.row_mask = 0;
    }

    /// Sub-view whose top-left is `(r, c)` and whose width is `cols`.
    /// Debug-asserts `c < self.cols()` and `cols <= self.cols() - c`.
    #[must_use]
    pub fn view(&self, r: usize, c: usize, cols: usize) -> RowPtr<'a, T> {
        debug_assert!(c < self.cols as usize);
        debug_assert!(cols <= self.cols as usize - c);
        RowPtr {
            // SAFETY: (r, c) is inside the viewed region per the asserts.
            row0: unsafe { self.row_ptr(r).add(c) },
            stride: self.stride,
            step: self.step,
            cols: u32::try_from(cols).unwrap_or(u32::MAX),
            row_mask: self.row_mask,
            _marker: PhantomData,
        }
    }
}

/// View an owning batch as a `RowPtr` covering all of its rows.
#[must_use]
pub fn row_ptr_from_batch<'a, T: Copy>(
    alloc: &Allocator,
    batch: &'a mut RowVectorBatch<T>,
) -> RowPtr<'a, T> {
    let cols = batch.cols();
    let stride = batch.stride();
    RowPtr::new(alloc, batch.all_mut(), cols, stride)
}
