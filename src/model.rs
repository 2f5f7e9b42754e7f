/// In-memory model: config, weights, tokenizer. Read-only after load and
/// shared by every session via `&Model`.
use std::collections::BTreeMap;

use crate::quant::Weight;
use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Gelu,
    SwiGlu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    LayerNorm,
    RmsNorm,
}

/// Architecture hyperparameters extracted from GGUF metadata.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub arch: String,
    pub n_layers: usize,
    pub d_model: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    pub ffn_hidden: usize,
    pub activation: Activation,
    pub norm: NormKind,
    pub rope_theta: f32,
    pub max_context: usize,
    pub vocab_size: usize,
    pub eos_id: u32,
    pub bos_id: u32,
    pub chat_template: Option<String>,
    /// Parsed but never enforced; forward() ignores this and load emits a
    /// warning when it is present.
    pub sliding_window: Option<usize>,
}

/// A loaded model: immutable, `Send + Sync`, shared by every session.
pub struct Model {
    pub config: ModelConfig,
    pub weights: BTreeMap<String, Weight>,
    pub tokenizer: Tokenizer,
    warnings: Vec<String>,
}

impl Model {
    pub fn new(config: ModelConfig, weights: BTreeMap<String, Weight>, tokenizer: Tokenizer) -> Self {
        Self {
            config,
            weights,
            tokenizer,
            warnings: Vec::new(),
        }
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Load-time caveats (sliding window detected, architecture guessed from
    /// filename, ...) so callers don't have to parse log output.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn weight(&self, name: &str) -> Option<&Weight> {
        self.weights.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn dummy_config() -> ModelConfig {
        ModelConfig {
            arch: "llama".to_string(),
            n_layers: 1,
            d_model: 4,
            n_heads: 1,
            n_kv_heads: 1,
            head_dim: 4,
            ffn_hidden: 8,
            activation: Activation::SwiGlu,
            norm: NormKind::RmsNorm,
            rope_theta: 10000.0,
            max_context: 128,
            vocab_size: 4,
            eos_id: 3,
            bos_id: 0,
            chat_template: None,
            sliding_window: None,
        }
    }

    #[test]
    fn warnings_accumulate() {
        let mut weights = BTreeMap::new();
        weights.insert("tok_embd".to_string(), Weight::DenseF32(Tensor::zeros(vec![4, 4])));
        let tokenizer = Tokenizer::empty();
        let mut model = Model::new(dummy_config(), weights, tokenizer);
        model.push_warning("sliding window detected, not enforced");
        assert_eq!(model.warnings().len(), 1);
    }
}
