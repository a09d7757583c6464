//! Structured blob store
//!
//! On-disk container for a model's weights. The file starts with a fixed
//! header (magic, version, flags, entry count) followed by a named blob
//! directory; every payload is 64-byte aligned. A file written with a table
//! of contents (`HAS_TOC`) embeds the JSON [`ModelConfig`] and the tokenizer
//! bytes as reserved directory entries, making it self-describing. Legacy
//! files have no TOC; they may carry a flat scale-factor array instead.
//!
//! The layout contract is round-trip only: a file written by [`BlobWriter`]
//! is read back bit-exactly by [`BlobReader`], tensor payloads included.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::config::ModelConfig;
use crate::error::{PonderarError, Result};
use crate::mat::{Element, MatStorageT, WeightType};
use crate::pool::WorkerPool;

/// File magic, "PBLB".
pub const MAGIC: [u8; 4] = *b"PBLB";

/// Current container version.
pub const VERSION: u32 = 2;

/// Flags bit: the file carries config (and possibly tokenizer) sections.
pub const FLAG_HAS_TOC: u32 = 1;

/// Payload alignment within the file.
const PAYLOAD_ALIGN: usize = 64;

/// Reserved entry names. Tensor names never start with `~`.
const CONFIG_NAME: &str = "~config";
const TOKENIZER_NAME: &str = "~tokenizer";
const SCALES_NAME: &str = "~scales";

/// Minimum payload size before a copy is split across workers.
const PARALLEL_COPY_MIN: usize = 1 << 20;

/// One directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub type_tag: u8,
    pub rows: u64,
    pub cols: u64,
    pub scale: f32,
    pub offset: u64,
    pub len: u64,
}

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Reinterpret a value slice as bytes. Sound for the `Copy` element types
/// stored here; assumes a little-endian host, as the rest of the IO path
/// does.
fn slice_bytes<T: Copy>(s: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(s.as_ptr().cast::<u8>(), std::mem::size_of_val(s)) }
}

// ---------------------------------------------------------------------------
// Writer

/// Accumulates named blobs in memory, then writes the container in one pass.
#[derive(Debug, Default)]
pub struct BlobWriter {
    entries: Vec<(DirEntry, Vec<u8>)>,
    has_toc: bool,
}

impl BlobWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one tensor. The packed payload is copied now so the storage can
    /// be dropped before `finish`.
    pub fn add_tensor<T: Element>(&mut self, mat: &MatStorageT<T>) {
        let entry = DirEntry {
            name: mat.name().to_string(),
            type_tag: T::TYPE.tag(),
            rows: mat.rows() as u64,
            cols: mat.cols() as u64,
            scale: mat.scale(),
            offset: 0,
            len: slice_bytes(mat.as_slice()).len() as u64,
        };
        self.entries.push((entry, slice_bytes(mat.as_slice()).to_vec()));
    }

    /// Queue the JSON model config; marks the file as having a TOC.
    pub fn add_config(&mut self, config: &ModelConfig) -> Result<()> {
        let json = serde_json::to_vec(config).map_err(|e| PonderarError::BadConfig {
            reason: format!("failed to serialize config: {e}"),
        })?;
        self.add_raw(CONFIG_NAME, json);
        self.has_toc = true;
        Ok(())
    }

    /// Queue the tokenizer as an opaque byte blob.
    pub fn add_tokenizer(&mut self, bytes: &[u8]) {
        self.add_raw(TOKENIZER_NAME, bytes.to_vec());
    }

    /// Queue a legacy flat scale-factor list.
    pub fn add_scales(&mut self, scales: &[f32]) {
        let mut bytes = Vec::with_capacity(scales.len() * 4);
        for s in scales {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.add_raw(SCALES_NAME, bytes);
    }

    fn add_raw(&mut self, name: &str, bytes: Vec<u8>) {
        let entry = DirEntry {
            name: name.to_string(),
            type_tag: 0,
            rows: 0,
            cols: 0,
            scale: 1.0,
            offset: 0,
            len: bytes.len() as u64,
        };
        self.entries.push((entry, bytes));
    }

    /// Write the container to `path`.
    pub fn finish(mut self, path: &Path) -> Result<()> {
        // Header: magic, version, flags, entry count.
        let mut header_len = 4 + 4 + 4 + 4;
        for (entry, _) in &self.entries {
            // name_len + name + tag + rows + cols + scale + offset + len
            header_len += 2 + entry.name.len() + 1 + 8 + 8 + 4 + 8 + 8;
        }

        let mut offset = align_up(header_len, PAYLOAD_ALIGN);
        for (entry, payload) in &mut self.entries {
            entry.offset = offset as u64;
            offset = align_up(offset + payload.len(), PAYLOAD_ALIGN);
        }

        let flags = if self.has_toc { FLAG_HAS_TOC } else { 0 };
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);
        w.write_all(&MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&flags.to_le_bytes())?;
        w.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        for (entry, _) in &self.entries {
            w.write_all(&(entry.name.len() as u16).to_le_bytes())?;
            w.write_all(entry.name.as_bytes())?;
            w.write_all(&[entry.type_tag])?;
            w.write_all(&entry.rows.to_le_bytes())?;
            w.write_all(&entry.cols.to_le_bytes())?;
            w.write_all(&entry.scale.to_le_bytes())?;
            w.write_all(&entry.offset.to_le_bytes())?;
            w.write_all(&entry.len.to_le_bytes())?;
        }

        let mut pos = header_len;
        for (entry, payload) in &self.entries {
            let pad = entry.offset as usize - pos;
            w.write_all(&vec![0u8; pad])?;
            w.write_all(payload)?;
            pos = entry.offset as usize + payload.len();
        }
        w.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reader

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        let Some(end) = end else {
            return Err(PonderarError::MalformedHeader {
                reason: format!("truncated at byte {}", self.pos),
            });
        };
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn read_f32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

/// Memory-mapped reader over a blob container.
pub struct BlobReader {
    mmap: Mmap,
    entries: Vec<DirEntry>,
    flags: u32,
}

impl BlobReader {
    /// Open and parse the directory. A missing file is the distinct
    /// [`PonderarError::FileNotFound`]; structural problems are
    /// [`PonderarError::MalformedHeader`].
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PonderarError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let mut r = Reader { buf: &mmap, pos: 0 };
        let magic = r.take(4)?;
        if magic != MAGIC {
            return Err(PonderarError::MalformedHeader {
                reason: format!("bad magic {magic:?}"),
            });
        }
        let version = r.read_u32()?;
        if version != VERSION {
            return Err(PonderarError::MalformedHeader {
                reason: format!("unsupported version {version}"),
            });
        }
        let flags = r.read_u32()?;
        let count = r.read_u32()? as usize;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let name_len = r.read_u16()? as usize;
            let name = std::str::from_utf8(r.take(name_len)?)
                .map_err(|_| PonderarError::MalformedHeader {
                    reason: "entry name is not UTF-8".to_string(),
                })?
                .to_string();
            let type_tag = r.read_u8()?;
            let rows = r.read_u64()?;
            let cols = r.read_u64()?;
            let scale = r.read_f32()?;
            let offset = r.read_u64()?;
            let len = r.read_u64()?;
            let end = offset.checked_add(len);
            if !end.is_some_and(|e| e <= mmap.len() as u64) {
                return Err(PonderarError::MalformedHeader {
                    reason: format!("entry '{name}' payload out of range"),
                });
            }
            entries.push(DirEntry {
                name,
                type_tag,
                rows,
                cols,
                scale,
                offset,
                len,
            });
        }

        Ok(Self {
            mmap,
            entries,
            flags,
        })
    }

    #[must_use]
    pub fn has_toc(&self) -> bool {
        self.flags & FLAG_HAS_TOC != 0
    }

    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Directory entries for tensors, in file order.
    #[must_use]
    pub fn tensor_entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|e| !e.name.starts_with('~'))
    }

    fn payload(&self, entry: &DirEntry) -> &[u8] {
        // Range-checked at open.
        &self.mmap[entry.offset as usize..(entry.offset + entry.len) as usize]
    }

    /// The embedded model config; requires a TOC file.
    pub fn read_config(&self) -> Result<ModelConfig> {
        let entry = self.entry(CONFIG_NAME).ok_or_else(|| PonderarError::BadConfig {
            reason: "file has no config section".to_string(),
        })?;
        let config: ModelConfig =
            serde_json::from_slice(self.payload(entry)).map_err(|e| PonderarError::BadConfig {
                reason: format!("config JSON: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// The tokenizer bytes, if a tokenizer section is present.
    pub fn read_tokenizer(&self) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.entry(TOKENIZER_NAME) else {
            return Ok(None);
        };
        if entry.len == 0 {
            return Err(PonderarError::BadTokenizer {
                reason: "tokenizer section is empty".to_string(),
            });
        }
        Ok(Some(self.payload(entry).to_vec()))
    }

    /// The legacy flat scale list; empty when the section is absent.
    pub fn read_scales(&self) -> Result<Vec<f32>> {
        let Some(entry) = self.entry(SCALES_NAME) else {
            return Ok(Vec::new());
        };
        let bytes = self.payload(entry);
        if bytes.len() % 4 != 0 {
            return Err(PonderarError::MalformedHeader {
                reason: "scale section length is not a multiple of 4".to_string(),
            });
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Copy one tensor's payload into pre-allocated storage of the matching
    /// element type. Checks type tag, shape, and payload size; sets the
    /// storage scale from the directory. Large payloads are copied in
    /// parallel across the pool.
    pub fn read_tensor<T: Element>(
        &self,
        name: &str,
        mat: &mut MatStorageT<T>,
        pool: &WorkerPool,
    ) -> Result<()> {
        let entry = self.entry(name).ok_or_else(|| PonderarError::MissingTensor {
            name: name.to_string(),
        })?;
        let weight_type = WeightType::from_tag(entry.type_tag)?;
        if weight_type != T::TYPE {
            return Err(PonderarError::TensorPayload {
                name: name.to_string(),
                reason: format!("stored as {weight_type}, requested {}", T::TYPE),
            });
        }
        if entry.rows as usize != mat.rows() || entry.cols as usize != mat.cols() {
            return Err(PonderarError::TensorPayload {
                name: name.to_string(),
                reason: format!(
                    "stored shape {}x{}, storage is {}x{}",
                    entry.rows,
                    entry.cols,
                    mat.rows(),
                    mat.cols()
                ),
            });
        }
        let src = self.payload(entry);
        let dst_len = mat.packed_len() * std::mem::size_of::<T>();
        if src.len() != dst_len {
            return Err(PonderarError::TensorPayload {
                name: name.to_string(),
                reason: format!("payload is {} bytes, expected {dst_len}", src.len()),
            });
        }
        let dst = unsafe {
            std::slice::from_raw_parts_mut(mat.as_mut_slice().as_mut_ptr().cast::<u8>(), dst_len)
        };
        copy_parallel(pool, src, dst);
        mat.set_scale(entry.scale);
        Ok(())
    }
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader")
            .field("entries", &self.entries.len())
            .field("flags", &self.flags)
            .finish()
    }
}

fn copy_parallel(pool: &WorkerPool, src: &[u8], dst: &mut [u8]) {
    if src.len() < PARALLEL_COPY_MIN {
        dst.copy_from_slice(src);
        return;
    }
    let dst_ptr = crate::pool::SendPtr(dst.as_mut_ptr());
    let n = src.len();
    pool.run_range(n, |range| {
        // Ranges are disjoint, so each worker writes a private window.
        let out = unsafe { dst_ptr.slice_at(range.start, range.len()) };
        out.copy_from_slice(&src[range]);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::config::{Model, ModelConfig};
    use crate::quantize::Sfp8;
    use crate::topology::Topology;
    use half::bf16;

    fn fixtures() -> (Allocator, WorkerPool) {
        let topo = Topology::single_node(2);
        (Allocator::new(&topo, false), WorkerPool::new(&topo).unwrap())
    }

    fn fill<T: Element>(mat: &mut MatStorageT<T>, values: &[f32]) {
        let packed = mat.packed_len();
        T::compress(values, &mut mat.as_mut_slice()[..packed]);
    }

    #[test]
    fn test_round_trip_tensor_exact() {
        let (alloc, pool) = fixtures();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.blob");

        let values: Vec<f32> = (0..24).map(|i| i as f32 * 0.25 - 3.0).collect();
        let mut m = MatStorageT::<f32>::new("w", 4, 6, &alloc);
        fill(&mut m, &values);

        let mut writer = BlobWriter::new();
        writer.add_tensor(&m);
        writer.finish(&path).unwrap();

        let reader = BlobReader::open(&path).unwrap();
        assert!(!reader.has_toc());
        let mut out = MatStorageT::<f32>::new("w", 4, 6, &alloc);
        reader.read_tensor("w", &mut out, &pool).unwrap();
        assert_eq!(out.as_slice(), m.as_slice());
    }

    #[test]
    fn test_round_trip_all_types_bit_exact() {
        let (alloc, pool) = fixtures();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.blob");
        let values: Vec<f32> = (0..256).map(|i| (i as f32 - 128.0) * 0.01).collect();

        let mut writer = BlobWriter::new();
        let mut f = MatStorageT::<f32>::new("f", 2, 128, &alloc);
        fill(&mut f, &values);
        let mut b = MatStorageT::<bf16>::new("b", 2, 128, &alloc);
        fill(&mut b, &values);
        let mut s = MatStorageT::<Sfp8>::new("s", 2, 128, &alloc);
        fill(&mut s, &values);
        let mut n = MatStorageT::<crate::quantize::Nuq4>::new("n", 2, 128, &alloc);
        fill(&mut n, &values);
        writer.add_tensor(&f);
        writer.add_tensor(&b);
        writer.add_tensor(&s);
        writer.add_tensor(&n);
        writer.finish(&path).unwrap();

        let reader = BlobReader::open(&path).unwrap();
        let mut f2 = MatStorageT::<f32>::new("f", 2, 128, &alloc);
        reader.read_tensor("f", &mut f2, &pool).unwrap();
        assert_eq!(f2.as_slice(), f.as_slice());
        let mut b2 = MatStorageT::<bf16>::new("b", 2, 128, &alloc);
        reader.read_tensor("b", &mut b2, &pool).unwrap();
        assert_eq!(b2.as_slice(), b.as_slice());
        let mut s2 = MatStorageT::<Sfp8>::new("s", 2, 128, &alloc);
        reader.read_tensor("s", &mut s2, &pool).unwrap();
        assert_eq!(s2.as_slice(), s.as_slice());
        let mut n2 = MatStorageT::<crate::quantize::Nuq4>::new("n", 2, 128, &alloc);
        reader.read_tensor("n", &mut n2, &pool).unwrap();
        assert_eq!(n2.as_slice(), n.as_slice());
    }

    #[test]
    fn test_toc_config_and_tokenizer() {
        let (_alloc, _pool) = fixtures();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toc.blob");

        let config = ModelConfig::for_model(Model::Tiny);
        let mut writer = BlobWriter::new();
        writer.add_config(&config).unwrap();
        writer.add_tokenizer(b"tok-model-bytes");
        writer.finish(&path).unwrap();

        let reader = BlobReader::open(&path).unwrap();
        assert!(reader.has_toc());
        assert_eq!(reader.read_config().unwrap(), config);
        assert_eq!(
            reader.read_tokenizer().unwrap().unwrap(),
            b"tok-model-bytes"
        );
    }

    #[test]
    fn test_legacy_scales_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.blob");

        let mut writer = BlobWriter::new();
        writer.add_scales(&[1.0, 0.5, 2.0]);
        writer.finish(&path).unwrap();

        let reader = BlobReader::open(&path).unwrap();
        assert!(!reader.has_toc());
        assert_eq!(reader.read_scales().unwrap(), vec![1.0, 0.5, 2.0]);
    }

    #[test]
    fn test_missing_file_is_distinct() {
        let err = BlobReader::open(Path::new("/nonexistent/weights.blob")).unwrap_err();
        assert!(matches!(err, PonderarError::FileNotFound { .. }));
    }

    #[test]
    fn test_malformed_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.blob");
        std::fs::write(&path, b"NOPE\x00\x00\x00\x00").unwrap();
        let err = BlobReader::open(&path).unwrap_err();
        assert!(matches!(err, PonderarError::MalformedHeader { .. }));

        std::fs::write(&path, b"PB").unwrap();
        let err = BlobReader::open(&path).unwrap_err();
        assert!(matches!(err, PonderarError::MalformedHeader { .. }));
    }

    #[test]
    fn test_type_and_shape_mismatch() {
        let (alloc, pool) = fixtures();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.blob");

        let m = MatStorageT::<f32>::new("w", 2, 3, &alloc);
        let mut writer = BlobWriter::new();
        writer.add_tensor(&m);
        writer.finish(&path).unwrap();

        let reader = BlobReader::open(&path).unwrap();
        let mut wrong_type = MatStorageT::<bf16>::new("w", 2, 3, &alloc);
        assert!(matches!(
            reader.read_tensor("w", &mut wrong_type, &pool),
            Err(PonderarError::TensorPayload { .. })
        ));
        let mut wrong_shape = MatStorageT::<f32>::new("w", 3, 2, &alloc);
        assert!(matches!(
            reader.read_tensor("w", &mut wrong_shape, &pool),
            Err(PonderarError::TensorPayload { .. })
        ));
        let mut absent = MatStorageT::<f32>::new("absent", 2, 3, &alloc);
        assert!(matches!(
            reader.read_tensor("absent", &mut absent, &pool),
            Err(PonderarError::MissingTensor { .. })
        ));
    }

    #[test]
    fn test_payloads_are_aligned() {
        let (alloc, _pool) = fixtures();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.blob");

        let a = MatStorageT::<f32>::new("a", 1, 3, &alloc);
        let b = MatStorageT::<f32>::new("b", 1, 5, &alloc);
        let mut writer = BlobWriter::new();
        writer.add_tensor(&a);
        writer.add_tensor(&b);
        writer.finish(&path).unwrap();

        let reader = BlobReader::open(&path).unwrap();
        for entry in reader.tensor_entries() {
            assert_eq!(entry.offset as usize % PAYLOAD_ALIGN, 0, "{}", entry.name);
        }
    }

    #[test]
    fn test_scale_carried_through_directory() {
        let (alloc, pool) = fixtures();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.blob");

        let mut m = MatStorageT::<Sfp8>::new("w", 1, 8, &alloc);
        m.set_scale(0.125);
        let mut writer = BlobWriter::new();
        writer.add_tensor(&m);
        writer.finish(&path).unwrap();

        let reader = BlobReader::open(&path).unwrap();
        let mut out = MatStorageT::<Sfp8>::new("w", 1, 8, &alloc);
        reader.read_tensor("w", &mut out, &pool).unwrap();
        assert_eq!(out.scale(), 0.125);
    }
}
