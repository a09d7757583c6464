//! Model configuration
//!
//! Static shape description of a decoder model: global dimensions plus one
//! [`LayerConfig`] per transformer layer. Serialized as JSON into the blob
//! store's TOC so a weights file is self-describing; legacy files carry no
//! config and the caller must name a [`Model`] instead.

use serde::{Deserialize, Serialize};

use crate::error::{PonderarError, Result};
use crate::mat::WeightType;

/// Known model shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Model {
    /// Small shape for tests and gradient verification
    Tiny,
    /// A 2B-parameter decoder shape
    Base2B,
}

/// Per-layer dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub model_dim: usize,
    pub ff_hidden_dim: usize,
    pub heads: usize,
    pub kv_heads: usize,
    pub qkv_dim: usize,
}

impl LayerConfig {
    /// Rows of the fused QKV projection: `heads` query heads plus one K and
    /// one V row block per KV head.
    #[must_use]
    pub fn qkv_rows(&self) -> usize {
        (self.heads + 2 * self.kv_heads) * self.qkv_dim
    }

    /// Elements in the fused QKV projection.
    #[must_use]
    pub fn qkv_elements(&self) -> usize {
        self.qkv_rows() * self.model_dim
    }

    /// Elements in the attention output projection (either layout).
    #[must_use]
    pub fn attn_vec_elements(&self) -> usize {
        self.heads * self.qkv_dim * self.model_dim
    }

    /// Elements in the gated FFN input projection (gate and up fused).
    #[must_use]
    pub fn gating_elements(&self) -> usize {
        2 * self.ff_hidden_dim * self.model_dim
    }

    /// Elements in the FFN output projection.
    #[must_use]
    pub fn linear_elements(&self) -> usize {
        self.model_dim * self.ff_hidden_dim
    }

    /// All stored elements of one layer, including the reshaped attention
    /// output copy and both norm scale vectors.
    #[must_use]
    pub fn total_elements(&self) -> usize {
        2 * self.model_dim
            + self.qkv_elements()
            + 2 * self.attn_vec_elements()
            + self.gating_elements()
            + self.linear_elements()
    }
}

/// Whole-model shape plus quantization and attention softcap settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_dim: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
    pub layer_configs: Vec<LayerConfig>,
    pub weight_type: WeightType,
    /// Legacy files carry this many trailing scale factors.
    pub num_tensor_scales: usize,
    /// Which tensors the legacy scale list applies to, in traversal order
    /// within each layer.
    pub scale_names: Vec<String>,
    /// Attention logit softcap; 0 disables
    pub att_cap: f32,
    /// Final logit softcap; 0 disables
    pub final_cap: f32,
    /// Multiplier applied to query vectors before attention
    pub query_scale: f32,
}

/// Tensors whose scales appear in a legacy file's trailing scale list.
const SCALED_TENSOR_NAMES: [&str; 4] = [
    "qkv_einsum_w",
    "attn_vec_einsum_w",
    "gating_einsum_w",
    "linear_w",
];

impl ModelConfig {
    /// The canonical configuration for a known model shape.
    #[must_use]
    pub fn for_model(model: Model) -> Self {
        match model {
            Model::Tiny => Self::shape(32, 16, 24, 64, 3, 1, 16, 2, 50.0, 30.0),
            Model::Base2B => Self::shape(2048, 256_000, 8192, 16_384, 8, 1, 256, 18, 50.0, 30.0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn shape(
        model_dim: usize,
        vocab_size: usize,
        seq_len: usize,
        ff_hidden_dim: usize,
        heads: usize,
        kv_heads: usize,
        qkv_dim: usize,
        layers: usize,
        att_cap: f32,
        final_cap: f32,
    ) -> Self {
        let layer = LayerConfig {
            model_dim,
            ff_hidden_dim,
            heads,
            kv_heads,
            qkv_dim,
        };
        Self {
            model_dim,
            vocab_size,
            seq_len,
            layer_configs: vec![layer; layers],
            weight_type: WeightType::F32,
            num_tensor_scales: SCALED_TENSOR_NAMES.len() * layers,
            scale_names: SCALED_TENSOR_NAMES.iter().map(|s| s.to_string()).collect(),
            att_cap,
            final_cap,
            query_scale: 1.0 / (qkv_dim as f32).sqrt(),
        }
    }

    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layer_configs.len()
    }

    /// All stored elements across the whole model.
    #[must_use]
    pub fn total_elements(&self) -> usize {
        self.vocab_size * self.model_dim
            + self.model_dim
            + self
                .layer_configs
                .iter()
                .map(LayerConfig::total_elements)
                .sum::<usize>()
    }

    /// Internal-consistency check, run after deserializing a TOC config.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(PonderarError::BadConfig {
                reason: reason.to_string(),
            })
        };
        if self.model_dim == 0 || self.vocab_size == 0 || self.seq_len == 0 {
            return fail("zero global dimension");
        }
        if self.layer_configs.is_empty() {
            return fail("no layers");
        }
        for (i, layer) in self.layer_configs.iter().enumerate() {
            if layer.model_dim != self.model_dim {
                return fail(&format!("layer {i} model_dim disagrees with model"));
            }
            if layer.heads == 0 || layer.kv_heads == 0 || layer.qkv_dim == 0 {
                return fail(&format!("layer {i} has a zero attention dimension"));
            }
            if layer.heads % layer.kv_heads != 0 {
                return fail(&format!("layer {i} heads not divisible by kv_heads"));
            }
            if layer.ff_hidden_dim == 0 {
                return fail(&format!("layer {i} has zero ff_hidden_dim"));
            }
        }
        if self.num_tensor_scales != self.scale_names.len() * self.num_layers() {
            return fail("num_tensor_scales disagrees with scale_names");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiny_shape() {
        let config = ModelConfig::for_model(Model::Tiny);
        assert_eq!(config.model_dim, 32);
        assert_eq!(config.vocab_size, 16);
        assert_eq!(config.seq_len, 24);
        assert_eq!(config.num_layers(), 2);
        let layer = &config.layer_configs[0];
        assert_eq!(layer.ff_hidden_dim, 64);
        assert_eq!(layer.heads, 3);
        assert_eq!(layer.kv_heads, 1);
        assert_eq!(layer.qkv_dim, 16);
        assert_eq!(config.num_tensor_scales, 8);
        assert_eq!(config.att_cap, 50.0);
        assert_eq!(config.final_cap, 30.0);
        assert!((config.query_scale - 0.25).abs() < 1e-7);
        config.validate().unwrap();
    }

    #[test]
    fn test_layer_element_formulas() {
        let layer = LayerConfig {
            model_dim: 32,
            ff_hidden_dim: 64,
            heads: 3,
            kv_heads: 1,
            qkv_dim: 16,
        };
        assert_eq!(layer.qkv_rows(), (3 + 2) * 16);
        assert_eq!(layer.qkv_elements(), 80 * 32);
        assert_eq!(layer.attn_vec_elements(), 3 * 16 * 32);
        assert_eq!(layer.gating_elements(), 2 * 64 * 32);
        assert_eq!(layer.linear_elements(), 32 * 64);
        assert_eq!(
            layer.total_elements(),
            2 * 32 + 80 * 32 + 2 * 1536 + 4096 + 2048
        );
    }

    #[test]
    fn test_total_elements() {
        let config = ModelConfig::for_model(Model::Tiny);
        let per_layer = config.layer_configs[0].total_elements();
        assert_eq!(
            config.total_elements(),
            16 * 32 + 32 + 2 * per_layer
        );
    }

    #[test]
    fn test_validate_rejects_inconsistency() {
        let mut config = ModelConfig::for_model(Model::Tiny);
        config.layer_configs[1].model_dim = 64;
        assert!(matches!(
            config.validate(),
            Err(PonderarError::BadConfig { .. })
        ));

        let mut config = ModelConfig::for_model(Model::Tiny);
        config.num_tensor_scales = 3;
        assert!(config.validate().is_err());

        let mut config = ModelConfig::for_model(Model::Tiny);
        config.layer_configs.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let config = ModelConfig::for_model(Model::Tiny);
        let json = serde_json::to_string(&config).unwrap();
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
