//! Whole-model persistence through the public API: allocate, save a
//! self-describing blob, and load it back on a fresh allocator.

use half::bf16;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::tempdir;

use ponderar::{
    Allocator, Model, ModelConfig, ModelStorage, PonderarError, Topology, TraversalMode,
    WeightSet, WeightType, WorkerPool,
};

fn fixtures() -> (Allocator, WorkerPool, ModelConfig) {
    let topo = Topology::single_node(2);
    (
        Allocator::new(&topo, false),
        WorkerPool::new(&topo).unwrap(),
        ModelConfig::for_model(Model::Tiny),
    )
}

#[test]
fn test_save_load_round_trip_f32() {
    let (alloc, pool, config) = fixtures();
    let dir = tempdir().unwrap();
    let path = dir.path().join("tiny-f32.blob");

    let mut storage = ModelStorage::allocate(&config, WeightType::F32, &alloc);
    {
        let w = storage.weights_mut().as_f32_mut().unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        w.rand_init(0.5, &mut rng);
        for layer in &mut w.layers {
            layer.reshape(&pool);
        }
    }
    storage.save(Some(b"tokenizer-bytes"), &path).unwrap();

    let (loaded, tokenizer) = ModelStorage::load(&path, None, None, &alloc, &pool).unwrap();
    assert_eq!(tokenizer.as_deref(), Some(&b"tokenizer-bytes"[..]));
    assert_eq!(loaded.weights().weight_type(), WeightType::F32);
    assert_eq!(loaded.config().model_dim, config.model_dim);
    assert_eq!(loaded.config().vocab_size, config.vocab_size);

    let original = storage.weights().as_f32().unwrap();
    let restored = loaded.weights().as_f32().unwrap();
    for (a, b) in original
        .tensors(TraversalMode::WithToc)
        .iter()
        .zip(restored.tensors(TraversalMode::WithToc))
    {
        assert_eq!(a.name(), b.name());
        assert_eq!(a.as_slice(), b.as_slice(), "tensor {}", a.name());
        assert_eq!(a.scale(), b.scale());
    }
}

#[test]
fn test_save_load_round_trip_bf16() {
    let (alloc, pool, config) = fixtures();
    let dir = tempdir().unwrap();
    let path = dir.path().join("tiny-bf16.blob");

    let mut storage = ModelStorage::allocate(&config, WeightType::Bf16, &alloc);
    match storage.weights_mut() {
        WeightSet::Bf16(w) => {
            for mat in w.tensors_mut(TraversalMode::WithToc) {
                for (i, v) in mat.as_mut_slice().iter_mut().enumerate() {
                    *v = bf16::from_f32((i % 251) as f32 * 0.5 - 60.0);
                }
            }
        }
        _ => unreachable!(),
    }
    storage.save(None, &path).unwrap();

    let (loaded, tokenizer) = ModelStorage::load(&path, None, None, &alloc, &pool).unwrap();
    assert!(tokenizer.is_none());
    assert_eq!(loaded.weights().weight_type(), WeightType::Bf16);
    match (storage.weights(), loaded.weights()) {
        (WeightSet::Bf16(a), WeightSet::Bf16(b)) => {
            for (ma, mb) in a
                .tensors(TraversalMode::WithToc)
                .iter()
                .zip(b.tensors(TraversalMode::WithToc))
            {
                assert_eq!(ma.as_slice(), mb.as_slice(), "tensor {}", ma.name());
            }
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_load_missing_file() {
    let (alloc, pool, _config) = fixtures();
    let dir = tempdir().unwrap();
    let err = ModelStorage::load(
        &dir.path().join("nope.blob"),
        None,
        None,
        &alloc,
        &pool,
    )
    .unwrap_err();
    assert!(matches!(err, PonderarError::FileNotFound { .. }));
}
