//! Tensor handles
//!
//! A tensor is a named 2D row-major array with a weight type and a scale
//! factor. [`MatPtr`] is the type-erased description used by the blob
//! directory; [`MatStorageT`] couples that description with an owned,
//! quantum-aligned buffer of a concrete element type.
//!
//! [`MatElem`] is the minimal bound for anything that can live in a tensor
//! buffer (including the verification-only `f64`/complex instantiations);
//! [`Element`] additionally ties a type to its on-disk tag and codec.

use std::fmt;

use half::bf16;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::allocator::{AlignedBuf, Allocator};
use crate::error::{PonderarError, Result};
use crate::quantize::{nuq_compress, nuq_decompress, nuq_packed_len, Nuq4, Sfp8};

/// The closed set of on-disk weight representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightType {
    /// 32-bit IEEE float, scale always 1.0
    F32,
    /// bfloat16
    Bf16,
    /// 8-bit switched floating point
    Sfp8,
    /// Non-uniform 4-bit stream
    Nuq4,
}

impl WeightType {
    /// Stable wire tag written to blob directories.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            WeightType::F32 => 0,
            WeightType::Bf16 => 1,
            WeightType::Sfp8 => 2,
            WeightType::Nuq4 => 3,
        }
    }

    /// Inverse of [`tag`](Self::tag); anything outside the closed set is an
    /// error, never a default.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(WeightType::F32),
            1 => Ok(WeightType::Bf16),
            2 => Ok(WeightType::Sfp8),
            3 => Ok(WeightType::Nuq4),
            _ => Err(PonderarError::UnsupportedWeightType { tag }),
        }
    }

    /// Packed payload size in bytes for `num` logical elements.
    #[must_use]
    pub fn packed_bytes(self, num: usize) -> usize {
        match self {
            WeightType::F32 => num * 4,
            WeightType::Bf16 => num * 2,
            WeightType::Sfp8 => num,
            WeightType::Nuq4 => nuq_packed_len(num),
        }
    }
}

impl fmt::Display for WeightType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WeightType::F32 => "f32",
            WeightType::Bf16 => "bf16",
            WeightType::Sfp8 => "sfp8",
            WeightType::Nuq4 => "nuq4",
        };
        f.write_str(s)
    }
}

/// Anything that can populate a tensor buffer.
///
/// `packed_len` maps a logical element count to the number of `Self` values
/// stored; identity except for grouped streams.
pub trait MatElem: Copy + Default + Send + Sync + 'static {
    /// Stored values for `num` logical elements.
    #[must_use]
    fn packed_len(num: usize) -> usize {
        num
    }
}

impl MatElem for f32 {}
impl MatElem for f64 {}
impl MatElem for Complex<f64> {}
impl MatElem for bf16 {}
impl MatElem for Sfp8 {}

impl MatElem for Nuq4 {
    fn packed_len(num: usize) -> usize {
        nuq_packed_len(num)
    }
}

/// A [`MatElem`] with an on-disk identity and codec. Exactly the four
/// [`WeightType`] representations implement this.
pub trait Element: MatElem {
    /// The wire tag for this element type.
    const TYPE: WeightType;

    /// Pack `values` into `out`; `out.len() == Self::packed_len(values.len())`.
    fn compress(values: &[f32], out: &mut [Self]);

    /// Unpack `out.len()` logical elements from `packed`.
    fn decompress(packed: &[Self], out: &mut [f32]);
}

impl Element for f32 {
    const TYPE: WeightType = WeightType::F32;

    fn compress(values: &[f32], out: &mut [Self]) {
        out.copy_from_slice(values);
    }

    fn decompress(packed: &[Self], out: &mut [f32]) {
        out.copy_from_slice(packed);
    }
}

impl Element for bf16 {
    const TYPE: WeightType = WeightType::Bf16;

    fn compress(values: &[f32], out: &mut [Self]) {
        for (o, &v) in out.iter_mut().zip(values) {
            *o = bf16::from_f32(v);
        }
    }

    fn decompress(packed: &[Self], out: &mut [f32]) {
        for (o, &p) in out.iter_mut().zip(packed) {
            *o = p.to_f32();
        }
    }
}

impl Element for Sfp8 {
    const TYPE: WeightType = WeightType::Sfp8;

    fn compress(values: &[f32], out: &mut [Self]) {
        for (o, &v) in out.iter_mut().zip(values) {
            *o = Sfp8::encode(v);
        }
    }

    fn decompress(packed: &[Self], out: &mut [f32]) {
        for (o, &p) in out.iter_mut().zip(packed) {
            *o = p.decode();
        }
    }
}

impl Element for Nuq4 {
    const TYPE: WeightType = WeightType::Nuq4;

    fn compress(values: &[f32], out: &mut [Self]) {
        nuq_compress(values, out);
    }

    fn decompress(packed: &[Self], out: &mut [f32]) {
        nuq_decompress(packed, out);
    }
}

/// Type-erased tensor description: what the blob directory records.
#[derive(Debug, Clone, PartialEq)]
pub struct MatPtr {
    name: String,
    rows: usize,
    cols: usize,
    weight_type: WeightType,
    scale: f32,
}

impl MatPtr {
    #[must_use]
    pub fn new(name: &str, rows: usize, cols: usize, weight_type: WeightType) -> Self {
        Self {
            name: name.to_string(),
            rows,
            cols,
            weight_type,
            scale: 1.0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[must_use]
    pub fn weight_type(&self) -> WeightType {
        self.weight_type
    }

    /// Logical element count; always `rows * cols`.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.rows * self.cols
    }

    /// Packed payload size in bytes.
    #[must_use]
    pub fn packed_bytes(&self) -> usize {
        self.weight_type.packed_bytes(self.num_elements())
    }

    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Set the decode scale. `F32` tensors are stored unscaled; their scale
    /// stays 1.0.
    pub fn set_scale(&mut self, scale: f32) {
        debug_assert!(
            self.weight_type != WeightType::F32 || scale == 1.0,
            "f32 tensor '{}' must keep scale 1.0",
            self.name
        );
        self.scale = scale;
    }
}

/// A typed tensor owning its storage.
///
/// The buffer holds `T::packed_len(rows * cols)` values of `T`, quantum
/// aligned. Exclusively owned by one weight set; no aliasing.
#[derive(Debug)]
pub struct MatStorageT<T: MatElem> {
    name: String,
    rows: usize,
    cols: usize,
    scale: f32,
    buf: AlignedBuf<T>,
}

impl<T: MatElem> MatStorageT<T> {
    /// Allocate a zeroed `rows x cols` tensor.
    #[must_use]
    pub fn new(name: &str, rows: usize, cols: usize, alloc: &Allocator) -> Self {
        let buf = alloc.alloc::<T>(T::packed_len(rows * cols));
        Self {
            name: name.to_string(),
            rows,
            cols,
            scale: 1.0,
            buf,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.rows * self.cols
    }

    /// Stored values, which may be fewer or more than `num_elements()` for
    /// packed streams.
    #[must_use]
    pub fn packed_len(&self) -> usize {
        T::packed_len(self.rows * self.cols)
    }

    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn set_scale(&mut self, scale: f32) {
        self.scale = scale;
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.buf.as_slice()[..self.packed_len()]
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let n = self.packed_len();
        &mut self.buf.as_mut_slice()[..n]
    }

    #[must_use]
    pub fn at(&self, i: usize) -> T {
        self.as_slice()[i]
    }

    pub fn at_mut(&mut self, i: usize) -> &mut T {
        &mut self.as_mut_slice()[i]
    }

    /// One row as a slice. Only meaningful when storage is unpacked
    /// (one stored value per logical element).
    #[must_use]
    pub fn row(&self, r: usize) -> &[T] {
        debug_assert_eq!(self.packed_len(), self.num_elements());
        &self.as_slice()[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [T] {
        debug_assert_eq!(self.packed_len(), self.num_elements());
        let cols = self.cols;
        &mut self.as_mut_slice()[r * cols..(r + 1) * cols]
    }

    /// Reset every stored value to the default (all-zero for the disk types).
    pub fn zero_init(&mut self) {
        self.as_mut_slice().fill(T::default());
    }
}

impl<T: Element> MatStorageT<T> {
    /// The directory entry describing this tensor.
    #[must_use]
    pub fn mat_ptr(&self) -> MatPtr {
        let mut ptr = MatPtr::new(&self.name, self.rows, self.cols, T::TYPE);
        ptr.set_scale(self.scale);
        ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::NUQ_GROUP_BYTES;
    use crate::topology::Topology;

    fn alloc() -> Allocator {
        Allocator::new(&Topology::single_node(1), false)
    }

    #[test]
    fn test_weight_type_tags_round_trip() {
        for wt in [
            WeightType::F32,
            WeightType::Bf16,
            WeightType::Sfp8,
            WeightType::Nuq4,
        ] {
            assert_eq!(WeightType::from_tag(wt.tag()).unwrap(), wt);
        }
        assert!(matches!(
            WeightType::from_tag(7),
            Err(PonderarError::UnsupportedWeightType { tag: 7 })
        ));
    }

    #[test]
    fn test_weight_type_display_and_serde() {
        assert_eq!(WeightType::Sfp8.to_string(), "sfp8");
        let json = serde_json::to_string(&WeightType::Bf16).unwrap();
        assert_eq!(json, "\"bf16\"");
        let back: WeightType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, WeightType::Bf16);
    }

    #[test]
    fn test_packed_bytes() {
        assert_eq!(WeightType::F32.packed_bytes(10), 40);
        assert_eq!(WeightType::Bf16.packed_bytes(10), 20);
        assert_eq!(WeightType::Sfp8.packed_bytes(10), 10);
        assert_eq!(WeightType::Nuq4.packed_bytes(10), NUQ_GROUP_BYTES);
    }

    #[test]
    fn test_mat_ptr_num_elements() {
        let ptr = MatPtr::new("w", 3, 5, WeightType::F32);
        assert_eq!(ptr.num_elements(), 15);
        assert_eq!(ptr.packed_bytes(), 60);
        assert_eq!(ptr.scale(), 1.0);
    }

    #[test]
    fn test_storage_accessors() {
        let alloc = alloc();
        let mut m = MatStorageT::<f32>::new("w", 2, 3, &alloc);
        assert_eq!(m.num_elements(), 6);
        assert_eq!(m.as_slice(), &[0.0; 6]);
        *m.at_mut(4) = 2.5;
        assert_eq!(m.at(4), 2.5);
        assert_eq!(m.row(1), &[0.0, 2.5, 0.0]);
        m.row_mut(0)[2] = 1.0;
        assert_eq!(m.at(2), 1.0);
        m.zero_init();
        assert_eq!(m.as_slice(), &[0.0; 6]);
    }

    #[test]
    fn test_storage_packed_nuq() {
        let alloc = alloc();
        let m = MatStorageT::<Nuq4>::new("w", 4, 100, &alloc);
        assert_eq!(m.num_elements(), 400);
        assert_eq!(m.packed_len(), nuq_packed_len(400));
        assert_eq!(m.as_slice().len(), m.packed_len());
    }

    #[test]
    fn test_mat_ptr_from_storage() {
        let alloc = alloc();
        let mut m = MatStorageT::<bf16>::new("emb", 8, 4, &alloc);
        m.set_scale(0.5);
        let ptr = m.mat_ptr();
        assert_eq!(ptr.name(), "emb");
        assert_eq!(ptr.weight_type(), WeightType::Bf16);
        assert_eq!(ptr.scale(), 0.5);
        assert_eq!(ptr.packed_bytes(), 64);
    }
}
