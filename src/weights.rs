//! Model weight storage
//!
//! [`ModelWeights<T>`] owns every tensor of a decoder model in one element
//! type. The traversal order of [`tensors`](ModelWeights::tensors) is the
//! ordering contract shared by save, load, and legacy scale application;
//! changing it breaks on-disk compatibility.
//!
//! [`WeightSet`] pins the "exactly one live representation" rule in the type
//! system: a model is f32, bf16, sfp8, or nuq4, never a mixture.
//! [`ModelStorage`] is the lifecycle wrapper: allocate fresh, load from a
//! blob file (TOC or legacy), save back out.

use std::path::Path;

use half::bf16;
use rand::Rng;

use crate::allocator::Allocator;
use crate::blob::{BlobReader, BlobWriter};
use crate::config::{LayerConfig, Model, ModelConfig};
use crate::error::{PonderarError, Result};
use crate::mat::{Element, MatElem, MatStorageT, WeightType};
use crate::pool::WorkerPool;
use crate::quantize::{Nuq4, Sfp8};

/// Which tensors a traversal visits.
///
/// Legacy files store the attention output projection dimension-major
/// (`attn_vec_einsum_w`, `[heads, model_dim, qkv_dim]`); TOC files store the
/// reshaped `att_weights` (`[model_dim, heads * qkv_dim]`). `Init` visits
/// both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalMode {
    WithToc,
    NoToc,
    Init,
}

/// All tensors of one transformer layer.
#[derive(Debug)]
pub struct LayerWeights<T: MatElem> {
    pub pre_attention_norm_scale: MatStorageT<T>,
    /// Legacy dimension-major attention output projection
    pub attn_vec_einsum_w: MatStorageT<T>,
    /// Reshaped attention output projection used by the forward pass
    pub att_weights: MatStorageT<T>,
    /// Fused Q, K, V projection
    pub qkv_einsum_w: MatStorageT<T>,
    pub pre_ffw_norm_scale: MatStorageT<T>,
    /// Fused gate and up FFN projection
    pub gating_einsum_w: MatStorageT<T>,
    pub linear_w: MatStorageT<T>,
}

impl<T: MatElem> LayerWeights<T> {
    fn new(idx: usize, layer: &LayerConfig, alloc: &Allocator) -> Self {
        let d = layer.model_dim;
        let name = |base: &str| format!("{base}_{idx}");
        Self {
            pre_attention_norm_scale: MatStorageT::new(
                &name("pre_attention_norm_scale"),
                1,
                d,
                alloc,
            ),
            attn_vec_einsum_w: MatStorageT::new(
                &name("attn_vec_einsum_w"),
                layer.heads * d,
                layer.qkv_dim,
                alloc,
            ),
            att_weights: MatStorageT::new(
                &name("att_weights"),
                d,
                layer.heads * layer.qkv_dim,
                alloc,
            ),
            qkv_einsum_w: MatStorageT::new(&name("qkv_einsum_w"), layer.qkv_rows(), d, alloc),
            pre_ffw_norm_scale: MatStorageT::new(&name("pre_ffw_norm_scale"), 1, d, alloc),
            gating_einsum_w: MatStorageT::new(
                &name("gating_einsum_w"),
                2 * layer.ff_hidden_dim,
                d,
                alloc,
            ),
            linear_w: MatStorageT::new(&name("linear_w"), d, layer.ff_hidden_dim, alloc),
        }
    }

    fn tensors(&self, mode: TraversalMode) -> Vec<&MatStorageT<T>> {
        let mut v = vec![&self.pre_attention_norm_scale];
        match mode {
            TraversalMode::Init => {
                v.push(&self.attn_vec_einsum_w);
                v.push(&self.att_weights);
            }
            TraversalMode::NoToc => v.push(&self.attn_vec_einsum_w),
            TraversalMode::WithToc => v.push(&self.att_weights),
        }
        v.push(&self.qkv_einsum_w);
        v.push(&self.pre_ffw_norm_scale);
        v.push(&self.gating_einsum_w);
        v.push(&self.linear_w);
        v
    }

    fn tensors_mut(&mut self, mode: TraversalMode) -> Vec<&mut MatStorageT<T>> {
        let mut v = vec![&mut self.pre_attention_norm_scale];
        match mode {
            TraversalMode::Init => {
                v.push(&mut self.attn_vec_einsum_w);
                v.push(&mut self.att_weights);
            }
            TraversalMode::NoToc => v.push(&mut self.attn_vec_einsum_w),
            TraversalMode::WithToc => v.push(&mut self.att_weights),
        }
        v.push(&mut self.qkv_einsum_w);
        v.push(&mut self.pre_ffw_norm_scale);
        v.push(&mut self.gating_einsum_w);
        v.push(&mut self.linear_w);
        v
    }

    /// Tensors carrying a legacy scale factor, in scale-list order.
    fn scaled_tensors_mut(&mut self) -> [&mut MatStorageT<T>; 4] {
        [
            &mut self.qkv_einsum_w,
            &mut self.attn_vec_einsum_w,
            &mut self.gating_einsum_w,
            &mut self.linear_w,
        ]
    }

    fn scaled_tensors(&self) -> [&MatStorageT<T>; 4] {
        [
            &self.qkv_einsum_w,
            &self.attn_vec_einsum_w,
            &self.gating_einsum_w,
            &self.linear_w,
        ]
    }
}

impl<T: Element> LayerWeights<T> {
    /// Convert the legacy `[heads, model_dim, qkv_dim]` attention output
    /// projection into `[model_dim, heads * qkv_dim]`, re-quantizing through
    /// f32 and carrying the scale over unchanged.
    pub fn reshape(&mut self, pool: &WorkerPool) {
        let qkv_dim = self.attn_vec_einsum_w.cols();
        let model_dim = self.att_weights.rows();
        let heads = self.attn_vec_einsum_w.rows() / model_dim;
        let total = heads * model_dim * qkv_dim;

        let mut legacy = vec![0.0f32; total];
        T::decompress(self.attn_vec_einsum_w.as_slice(), &mut legacy);

        let mut reshaped = vec![0.0f32; total];
        let out = crate::pool::SendPtr(reshaped.as_mut_ptr());
        let legacy_ref = &legacy;
        pool.run_range(model_dim, |range| {
            for m in range {
                // Disjoint output rows per worker.
                let row = unsafe { out.slice_at(m * heads * qkv_dim, heads * qkv_dim) };
                for h in 0..heads {
                    let src = h * model_dim * qkv_dim + m * qkv_dim;
                    row[h * qkv_dim..(h + 1) * qkv_dim]
                        .copy_from_slice(&legacy_ref[src..src + qkv_dim]);
                }
            }
        });

        T::compress(&reshaped, self.att_weights.as_mut_slice());
        let scale = self.attn_vec_einsum_w.scale();
        self.att_weights.set_scale(scale);
    }
}

/// All weights of a model, in one element type.
#[derive(Debug)]
pub struct ModelWeights<T: MatElem> {
    pub embedder_input_embedding: MatStorageT<T>,
    pub final_norm_scale: MatStorageT<T>,
    pub layers: Vec<LayerWeights<T>>,
    config: ModelConfig,
}

impl<T: MatElem> ModelWeights<T> {
    /// Allocate zeroed storage for every tensor the config names.
    #[must_use]
    pub fn allocate(config: &ModelConfig, alloc: &Allocator) -> Self {
        let layers = config
            .layer_configs
            .iter()
            .enumerate()
            .map(|(i, layer)| LayerWeights::new(i, layer, alloc))
            .collect();
        Self {
            embedder_input_embedding: MatStorageT::new(
                "embedder_input_embedding",
                config.vocab_size,
                config.model_dim,
                alloc,
            ),
            final_norm_scale: MatStorageT::new("final_norm_scale", 1, config.model_dim, alloc),
            layers,
            config: config.clone(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Tensors in the fixed traversal order: embedding, final norm, then
    /// each layer's tensors.
    #[must_use]
    pub fn tensors(&self, mode: TraversalMode) -> Vec<&MatStorageT<T>> {
        let mut v = vec![&self.embedder_input_embedding, &self.final_norm_scale];
        for layer in &self.layers {
            v.extend(layer.tensors(mode));
        }
        v
    }

    pub fn tensors_mut(&mut self, mode: TraversalMode) -> Vec<&mut MatStorageT<T>> {
        let mut v = vec![&mut self.embedder_input_embedding];
        v.push(&mut self.final_norm_scale);
        for layer in &mut self.layers {
            v.extend(layer.tensors_mut(mode));
        }
        v
    }

    /// Visit every tensor in traversal order.
    pub fn for_each_tensor<F: FnMut(&MatStorageT<T>)>(&self, mode: TraversalMode, mut f: F) {
        for mat in self.tensors(mode) {
            f(mat);
        }
    }

    pub fn for_each_tensor_mut<F: FnMut(&mut MatStorageT<T>)>(
        &mut self,
        mode: TraversalMode,
        mut f: F,
    ) {
        for mat in self.tensors_mut(mode) {
            f(mat);
        }
    }

    /// Reset every tensor (both attention layouts included) to zero.
    pub fn zero_init(&mut self) {
        self.for_each_tensor_mut(TraversalMode::Init, MatStorageT::zero_init);
    }

    /// Copy values and scales from a same-shaped model.
    pub fn copy_from(&mut self, other: &Self) {
        let src = other.tensors(TraversalMode::Init);
        for (dst, src) in self.tensors_mut(TraversalMode::Init).into_iter().zip(src) {
            dst.as_mut_slice().copy_from_slice(src.as_slice());
            dst.set_scale(src.scale());
        }
    }

    /// Either collect scales (when `scales` is empty) or apply them to the
    /// scaled tensors of every layer, in scale-list order. An inbound list
    /// whose length disagrees with the config is an error, never truncated.
    pub fn get_or_apply_scales(&mut self, scales: &mut Vec<f32>) -> Result<()> {
        let expected = self.config.num_tensor_scales;
        if scales.is_empty() {
            for layer in &self.layers {
                for mat in layer.scaled_tensors() {
                    scales.push(mat.scale());
                }
            }
            return Ok(());
        }
        if scales.len() != expected {
            return Err(PonderarError::ScaleCountMismatch {
                expected,
                actual: scales.len(),
            });
        }
        let mut targets = Vec::with_capacity(expected);
        for layer in &mut self.layers {
            targets.extend(layer.scaled_tensors_mut());
        }
        for (mat, &scale) in targets.into_iter().zip(scales.iter()) {
            mat.set_scale(scale);
        }
        Ok(())
    }
}

impl ModelWeights<f32> {
    /// Fill every stored tensor with N(0, stddev) noise. The reshaped
    /// `att_weights` copy is derived, not stored, so it is left alone.
    pub fn rand_init<R: Rng>(&mut self, stddev: f32, rng: &mut R) {
        for mat in self.tensors_mut(TraversalMode::NoToc) {
            for v in mat.as_mut_slice() {
                *v = stddev * sample_normal(rng);
            }
        }
    }

    /// Multiply legacy scales into the payload so the invariant "f32 tensors
    /// keep scale 1.0" holds after a legacy load.
    pub fn fold_scales(&mut self) {
        for layer in &mut self.layers {
            for mat in layer.scaled_tensors_mut() {
                let scale = mat.scale();
                if scale != 1.0 {
                    for v in mat.as_mut_slice() {
                        *v *= scale;
                    }
                    mat.set_scale(1.0);
                }
            }
        }
    }

    /// Per-tensor min/mean/max in traversal order.
    #[must_use]
    pub fn weight_stats(&self) -> Vec<WeightStats> {
        self.tensors(TraversalMode::Init)
            .into_iter()
            .map(|mat| {
                let s = mat.as_slice();
                let mut min = f32::INFINITY;
                let mut max = f32::NEG_INFINITY;
                let mut sum = 0.0f64;
                for &v in s {
                    min = min.min(v);
                    max = max.max(v);
                    sum += f64::from(v);
                }
                WeightStats {
                    name: mat.name().to_string(),
                    min,
                    max,
                    mean: (sum / s.len().max(1) as f64) as f32,
                }
            })
            .collect()
    }

    /// Print a one-line summary per tensor to stderr.
    pub fn log_weight_stats(&self) {
        for s in self.weight_stats() {
            eprintln!(
                "{}: min={:.6} mean={:.6} max={:.6}",
                s.name, s.min, s.mean, s.max
            );
        }
    }
}

/// Summary of one tensor's value distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightStats {
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

/// Box-Muller standard normal sample.
pub(crate) fn sample_normal<R: Rng>(rng: &mut R) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

// ---------------------------------------------------------------------------
// WeightSet

macro_rules! with_weights {
    ($set:expr, $w:ident => $body:expr) => {
        match $set {
            WeightSet::F32($w) => $body,
            WeightSet::Bf16($w) => $body,
            WeightSet::Sfp8($w) => $body,
            WeightSet::Nuq4($w) => $body,
        }
    };
}

/// A model's weights in exactly one of the four disk representations.
#[derive(Debug)]
pub enum WeightSet {
    F32(ModelWeights<f32>),
    Bf16(ModelWeights<bf16>),
    Sfp8(ModelWeights<Sfp8>),
    Nuq4(ModelWeights<Nuq4>),
}

impl WeightSet {
    /// Allocate for a weight type named by its wire tag; tags outside the
    /// closed set are rejected.
    pub fn create_for_type(tag: u8, config: &ModelConfig, alloc: &Allocator) -> Result<Self> {
        Ok(Self::create(WeightType::from_tag(tag)?, config, alloc))
    }

    #[must_use]
    pub fn create(weight_type: WeightType, config: &ModelConfig, alloc: &Allocator) -> Self {
        match weight_type {
            WeightType::F32 => WeightSet::F32(ModelWeights::allocate(config, alloc)),
            WeightType::Bf16 => WeightSet::Bf16(ModelWeights::allocate(config, alloc)),
            WeightType::Sfp8 => WeightSet::Sfp8(ModelWeights::allocate(config, alloc)),
            WeightType::Nuq4 => WeightSet::Nuq4(ModelWeights::allocate(config, alloc)),
        }
    }

    #[must_use]
    pub fn weight_type(&self) -> WeightType {
        match self {
            WeightSet::F32(_) => WeightType::F32,
            WeightSet::Bf16(_) => WeightType::Bf16,
            WeightSet::Sfp8(_) => WeightType::Sfp8,
            WeightSet::Nuq4(_) => WeightType::Nuq4,
        }
    }

    pub fn zero_init(&mut self) {
        with_weights!(self, w => w.zero_init());
    }

    /// The f32 instantiation, when that is the live representation.
    #[must_use]
    pub fn as_f32(&self) -> Option<&ModelWeights<f32>> {
        match self {
            WeightSet::F32(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut ModelWeights<f32>> {
        match self {
            WeightSet::F32(w) => Some(w),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ModelStorage

/// Lifecycle wrapper: allocate, load, save.
#[derive(Debug)]
pub struct ModelStorage {
    config: ModelConfig,
    weights: WeightSet,
}

impl ModelStorage {
    /// Fresh zeroed storage.
    #[must_use]
    pub fn allocate(config: &ModelConfig, weight_type: WeightType, alloc: &Allocator) -> Self {
        let mut config = config.clone();
        config.weight_type = weight_type;
        Self {
            weights: WeightSet::create(weight_type, &config, alloc),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[must_use]
    pub fn weights(&self) -> &WeightSet {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut WeightSet {
        &mut self.weights
    }

    /// Load a blob file. TOC files are self-describing; legacy files need
    /// an explicit model and weight type, get the flat scale list applied in
    /// traversal order, and then run the attention reshape pass. Returns the
    /// storage plus the embedded tokenizer bytes, if any.
    pub fn load(
        path: &Path,
        model: Option<Model>,
        weight_type: Option<WeightType>,
        alloc: &Allocator,
        pool: &WorkerPool,
    ) -> Result<(Self, Option<Vec<u8>>)> {
        let reader = BlobReader::open(path)?;
        if reader.has_toc() {
            let config = reader.read_config()?;
            let tokenizer = reader.read_tokenizer()?;
            let mut storage = Self::allocate(&config, config.weight_type, alloc);
            with_weights!(&mut storage.weights, w => {
                load_tensors(&reader, w, TraversalMode::WithToc, pool)?;
            });
            return Ok((storage, tokenizer));
        }

        let (Some(model), Some(weight_type)) = (model, weight_type) else {
            return Err(PonderarError::BadConfig {
                reason: "legacy file requires explicit model and weight type".to_string(),
            });
        };
        let config = ModelConfig::for_model(model);
        let mut storage = Self::allocate(&config, weight_type, alloc);
        let mut scales = reader.read_scales()?;
        with_weights!(&mut storage.weights, w => {
            load_tensors(&reader, w, TraversalMode::NoToc, pool)?;
            if !scales.is_empty() {
                w.get_or_apply_scales(&mut scales)?;
            }
        });
        if let WeightSet::F32(w) = &mut storage.weights {
            w.fold_scales();
        }
        with_weights!(&mut storage.weights, w => {
            for layer in &mut w.layers {
                layer.reshape(pool);
            }
        });
        Ok((storage, None))
    }

    /// Write a self-describing (TOC) blob file.
    pub fn save(&self, tokenizer: Option<&[u8]>, path: &Path) -> Result<()> {
        let mut writer = BlobWriter::new();
        let mut config = self.config.clone();
        config.weight_type = self.weights.weight_type();
        writer.add_config(&config)?;
        if let Some(tokenizer) = tokenizer {
            writer.add_tokenizer(tokenizer);
        }
        with_weights!(&self.weights, w => {
            for mat in w.tensors(TraversalMode::WithToc) {
                writer.add_tensor(mat);
            }
        });
        writer.finish(path)
    }
}

fn load_tensors<T: Element>(
    reader: &BlobReader,
    weights: &mut ModelWeights<T>,
    mode: TraversalMode,
    pool: &WorkerPool,
) -> Result<()> {
    for mat in weights.tensors_mut(mode) {
        let name = mat.name().to_string();
        reader.read_tensor(&name, mat, pool)?;
    }
    Ok(())
}
