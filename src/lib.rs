//! # Ponderar
//!
//! Ponderar (Spanish: "to weigh, to ponder") stores and serves transformer
//! weights: NUMA-aware aligned allocation, row-major matrix views over
//! compressed element types, and a single-file blob format for loading and
//! saving whole weight sets.
//!
//! On top of the storage sits a verified gradient engine: a cross-entropy
//! objective over decoder forward passes whose hand-written reverse pass is
//! checked element-by-element against a complex-step derivative oracle.
//!
//! ## Layout
//!
//! - [`topology`] / [`allocator`]: hardware detection and aligned,
//!   optionally node-bound allocation.
//! - [`rows`]: row-major batches and cyclic-offset row pointers.
//! - [`quantize`] / [`mat`]: the compressed element codecs and the typed
//!   matrix storage built on them.
//! - [`config`] / [`weights`]: model shapes and the per-layer weight sets.
//! - [`blob`]: the on-disk container.
//! - [`pool`]: the rayon worker pool the loaders and the batched math run on.
//! - [`backprop`]: forward pass, reverse pass, and the verification harness.
//!
//! ## Example
//!
//! ```rust
//! use ponderar::{Allocator, Model, ModelConfig, ModelWeights, Topology};
//!
//! let topology = Topology::detect();
//! let allocator = Allocator::new(&topology, false);
//! let config = ModelConfig::for_model(Model::Tiny);
//! let weights = ModelWeights::<f32>::allocate(&config, &allocator);
//! assert_eq!(weights.layers.len(), config.layer_configs.len());
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]

pub mod allocator;
pub mod backprop;
pub mod blob;
pub mod config;
pub mod error;
pub mod mat;
pub mod pool;
pub mod quantize;
pub mod rows;
pub mod topology;
pub mod weights;

pub use allocator::{AlignedBuf, Allocator};
pub use blob::{BlobReader, BlobWriter};
pub use config::{LayerConfig, Model, ModelConfig};
pub use error::{PonderarError, Result};
pub use mat::{Element, MatElem, MatPtr, MatStorageT, WeightType};
pub use pool::WorkerPool;
pub use rows::{Extents2D, RowPtr, RowVectorBatch};
pub use topology::Topology;
pub use weights::{ModelStorage, ModelWeights, TraversalMode, WeightSet};
