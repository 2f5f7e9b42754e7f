/// Transformer forward pass.
///
/// Tensor names follow the `llama.cpp` GGUF convention: `token_embd.weight`,
/// per-layer `blk.{i}.attn_norm.weight`/`attn_q.weight`/`attn_k.weight`/
/// `attn_v.weight`/`attn_output.weight`, `blk.{i}.ffn_norm.weight` and the
/// activation-dependent feed-forward weights (`ffn_gate`/`ffn_up`/`ffn_down`
/// for SwiGLU, `ffn_up`/`ffn_down` for GELU), and `output_norm.weight` /
/// `output.weight` (falling back to the tied embedding when absent).
///
/// `T >= 1` covers both prefill (`T` = prompt length) and decode (`T == 1`);
/// logits are only computed for the last row, since earlier rows are only
/// needed to populate the KV cache.
use crate::error::{SmallMindError, SmallMindResult};
use crate::kv_cache::KVCache;
use crate::model::{Activation, Model, ModelConfig, NormKind};
use crate::quant::Weight;

/// Scratch buffers sized once per session at `max_context` and reused across
/// every `forward` call, so steady-state decoding does not allocate.
pub struct ForwardWorkspace {
    hidden: Vec<f32>,
    normed: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    k_reorder: Vec<f32>,
    v_reorder: Vec<f32>,
    attn_concat: Vec<f32>,
    proj_out: Vec<f32>,
    scores: Vec<f32>,
    ffn_gate: Vec<f32>,
    ffn_up: Vec<f32>,
    last_row_normed: Vec<f32>,
}

impl ForwardWorkspace {
    pub fn new(config: &ModelConfig) -> Self {
        let t = config.max_context;
        let d_model = config.d_model;
        let q_dim = config.n_heads * config.head_dim;
        let kv_dim = config.n_kv_heads * config.head_dim;
        Self {
            hidden: vec![0.0; t * d_model],
            normed: vec![0.0; t * d_model],
            q: vec![0.0; t * q_dim],
            k: vec![0.0; t * kv_dim],
            v: vec![0.0; t * kv_dim],
            k_reorder: vec![0.0; t * kv_dim],
            v_reorder: vec![0.0; t * kv_dim],
            attn_concat: vec![0.0; t * q_dim],
            proj_out: vec![0.0; t * d_model],
            scores: vec![0.0; t],
            ffn_gate: vec![0.0; t * config.ffn_hidden],
            ffn_up: vec![0.0; t * config.ffn_hidden],
            last_row_normed: vec![0.0; d_model],
        }
    }
}

fn weight<'a>(model: &'a Model, name: &str) -> SmallMindResult<&'a Weight> {
    model
        .weight(name)
        .ok_or_else(|| SmallMindError::InvalidFormat(format!("missing tensor {name}")))
}

fn norm_inplace(kind: NormKind, input: &[f32], gamma: &Weight, beta: Option<&Weight>, out: &mut [f32]) {
    let gamma = gamma.to_f32();
    match kind {
        NormKind::RmsNorm => crate::kernels::rmsnorm(input, gamma.as_slice(), out, 1e-5),
        NormKind::LayerNorm => {
            let beta = beta.map(|b| b.to_f32());
            let zeros;
            let beta_slice = match &beta {
                Some(b) => b.as_slice(),
                None => {
                    zeros = vec![0.0f32; gamma.len()];
                    &zeros
                }
            };
            crate::kernels::layernorm(input, gamma.as_slice(), beta_slice, out, 1e-5);
        }
    }
}

/// Rearrange `[T, n_kv_heads*head_dim]` (token-major) into
/// `[n_kv_heads, T, head_dim]` (head-major), matching `KVCache`'s layout.
fn reorder_to_head_major(src: &[f32], dst: &mut [f32], t: usize, n_heads: usize, head_dim: usize) {
    for tok in 0..t {
        for h in 0..n_heads {
            let src_off = tok * n_heads * head_dim + h * head_dim;
            let dst_off = h * t * head_dim + tok * head_dim;
            dst[dst_off..dst_off + head_dim].copy_from_slice(&src[src_off..src_off + head_dim]);
        }
    }
}

/// Run one layer's self-attention block: norm, QKV projection, RoPE, cache
/// append, GQA-expanded causal attention, output projection, residual.
#[allow(clippy::too_many_arguments)]
fn attention_block(
    model: &Model,
    layer: usize,
    t: usize,
    cache: &mut KVCache,
    ws: &mut ForwardWorkspace,
) -> SmallMindResult<()> {
    let cfg = &model.config;
    let prefix = format!("blk.{layer}");

    let attn_norm = weight(model, &format!("{prefix}.attn_norm.weight"))?;
    norm_inplace(cfg.norm, &ws.hidden[..t * cfg.d_model], attn_norm, None, &mut ws.normed[..t * cfg.d_model]);

    let wq = weight(model, &format!("{prefix}.attn_q.weight"))?;
    let wk = weight(model, &format!("{prefix}.attn_k.weight"))?;
    let wv = weight(model, &format!("{prefix}.attn_v.weight"))?;
    let wo = weight(model, &format!("{prefix}.attn_output.weight"))?;

    let q_dim = cfg.n_heads * cfg.head_dim;
    let kv_dim = cfg.n_kv_heads * cfg.head_dim;
    wq.matmul_transpose_b(&ws.normed[..t * cfg.d_model], &mut ws.q[..t * q_dim], t, cfg.d_model, q_dim);
    wk.matmul_transpose_b(&ws.normed[..t * cfg.d_model], &mut ws.k[..t * kv_dim], t, cfg.d_model, kv_dim);
    wv.matmul_transpose_b(&ws.normed[..t * cfg.d_model], &mut ws.v[..t * kv_dim], t, cfg.d_model, kv_dim);

    let pos_before = cache.pos();
    crate::kernels::rope(
        &mut ws.q[..t * q_dim],
        &mut ws.k[..t * kv_dim],
        cfg.n_heads,
        cfg.n_kv_heads,
        cfg.head_dim,
        pos_before,
        cfg.rope_theta,
    );

    reorder_to_head_major(&ws.k[..t * kv_dim], &mut ws.k_reorder[..t * kv_dim], t, cfg.n_kv_heads, cfg.head_dim);
    reorder_to_head_major(&ws.v[..t * kv_dim], &mut ws.v_reorder[..t * kv_dim], t, cfg.n_kv_heads, cfg.head_dim);
    cache.append(layer, &ws.k_reorder[..t * kv_dim], &ws.v_reorder[..t * kv_dim], t)?;

    let scale = 1.0 / (cfg.head_dim as f32).sqrt();
    let kv_len = pos_before + t;
    let group_size = cfg.n_heads / cfg.n_kv_heads.max(1);

    for h in 0..cfg.n_heads {
        let kv_head = h / group_size.max(1);
        let key_head = cache.key_head(layer, kv_head);
        let value_head = cache.value_head(layer, kv_head);

        for tok in 0..t {
            let q_row = &ws.q[tok * q_dim + h * cfg.head_dim..tok * q_dim + (h + 1) * cfg.head_dim];
            let scores = &mut ws.scores[..kv_len];
            for (pos, score) in scores.iter_mut().enumerate() {
                let key = &key_head[pos * cfg.head_dim..(pos + 1) * cfg.head_dim];
                *score = q_row.iter().zip(key.iter()).map(|(a, b)| a * b).sum();
            }
            crate::kernels::softmax_row(scores, scale, pos_before + tok, 0);

            let out = &mut ws.attn_concat[tok * q_dim + h * cfg.head_dim..tok * q_dim + (h + 1) * cfg.head_dim];
            out.fill(0.0);
            for (pos, &w) in scores.iter().enumerate() {
                if w == 0.0 {
                    continue;
                }
                let value = &value_head[pos * cfg.head_dim..(pos + 1) * cfg.head_dim];
                for (o, &v) in out.iter_mut().zip(value.iter()) {
                    *o += w * v;
                }
            }
        }
    }

    wo.matmul_transpose_b(&ws.attn_concat[..t * q_dim], &mut ws.proj_out[..t * cfg.d_model], t, q_dim, cfg.d_model);
    for (h, p) in ws.hidden[..t * cfg.d_model].iter_mut().zip(ws.proj_out[..t * cfg.d_model].iter()) {
        *h += p;
    }

    Ok(())
}

fn mlp_block(model: &Model, layer: usize, t: usize, ws: &mut ForwardWorkspace) -> SmallMindResult<()> {
    let cfg = &model.config;
    let prefix = format!("blk.{layer}");

    let ffn_norm = weight(model, &format!("{prefix}.ffn_norm.weight"))?;
    norm_inplace(cfg.norm, &ws.hidden[..t * cfg.d_model], ffn_norm, None, &mut ws.normed[..t * cfg.d_model]);

    let w_down = weight(model, &format!("{prefix}.ffn_down.weight"))?;

    match cfg.activation {
        Activation::SwiGlu => {
            let w_gate = weight(model, &format!("{prefix}.ffn_gate.weight"))?;
            let w_up = weight(model, &format!("{prefix}.ffn_up.weight"))?;
            w_gate.matmul_transpose_b(&ws.normed[..t * cfg.d_model], &mut ws.ffn_gate[..t * cfg.ffn_hidden], t, cfg.d_model, cfg.ffn_hidden);
            w_up.matmul_transpose_b(&ws.normed[..t * cfg.d_model], &mut ws.ffn_up[..t * cfg.ffn_hidden], t, cfg.d_model, cfg.ffn_hidden);
            crate::kernels::silu_inplace(&mut ws.ffn_gate[..t * cfg.ffn_hidden]);
            for (g, u) in ws.ffn_gate[..t * cfg.ffn_hidden].iter_mut().zip(ws.ffn_up[..t * cfg.ffn_hidden].iter()) {
                *g *= u;
            }
            w_down.matmul_transpose_b(&ws.ffn_gate[..t * cfg.ffn_hidden], &mut ws.proj_out[..t * cfg.d_model], t, cfg.ffn_hidden, cfg.d_model);
        }
        Activation::Gelu => {
            let w_up = weight(model, &format!("{prefix}.ffn_up.weight"))?;
            w_up.matmul_transpose_b(&ws.normed[..t * cfg.d_model], &mut ws.ffn_up[..t * cfg.ffn_hidden], t, cfg.d_model, cfg.ffn_hidden);
            crate::kernels::gelu_inplace(&mut ws.ffn_up[..t * cfg.ffn_hidden]);
            w_down.matmul_transpose_b(&ws.ffn_up[..t * cfg.ffn_hidden], &mut ws.proj_out[..t * cfg.d_model], t, cfg.ffn_hidden, cfg.d_model);
        }
    }

    for (h, p) in ws.hidden[..t * cfg.d_model].iter_mut().zip(ws.proj_out[..t * cfg.d_model].iter()) {
        *h += p;
    }
    Ok(())
}

/// Run the full forward pass over `tokens`, appending to `cache` and writing
/// the final-position logits into `out_logits` (length `vocab_size`).
pub fn forward(
    model: &Model,
    tokens: &[u32],
    cache: &mut KVCache,
    ws: &mut ForwardWorkspace,
    out_logits: &mut [f32],
) -> SmallMindResult<()> {
    let cfg = &model.config;
    let t = tokens.len();
    if t == 0 {
        return Err(SmallMindError::InvalidArgument("forward called with no tokens".to_string()));
    }
    if cache.pos() + t > cfg.max_context {
        return Err(SmallMindError::InvalidArgument(format!(
            "context exhausted: pos {} + {} tokens exceeds max_context {}",
            cache.pos(),
            t,
            cfg.max_context
        )));
    }
    if out_logits.len() != cfg.vocab_size {
        return Err(SmallMindError::ShapeMismatch(format!(
            "out_logits length {} != vocab_size {}",
            out_logits.len(),
            cfg.vocab_size
        )));
    }

    let embeddings = weight(model, "token_embd.weight")?;
    let embed_table = embeddings.to_f32();
    for (tok_idx, &token) in tokens.iter().enumerate() {
        let row = &embed_table.as_slice()[token as usize * cfg.d_model..(token as usize + 1) * cfg.d_model];
        ws.hidden[tok_idx * cfg.d_model..(tok_idx + 1) * cfg.d_model].copy_from_slice(row);
    }

    for layer in 0..cfg.n_layers {
        attention_block(model, layer, t, cache, ws)?;
        mlp_block(model, layer, t, ws)?;
    }
    cache.advance(t)?;

    let output_norm = weight(model, "output_norm.weight")?;
    let last_row = &ws.hidden[(t - 1) * cfg.d_model..t * cfg.d_model];
    norm_inplace(cfg.norm, last_row, output_norm, None, &mut ws.last_row_normed);

    let output_head = model
        .weight("output.weight")
        .unwrap_or(embeddings);
    output_head.matmul_transpose_b(&ws.last_row_normed, out_logits, 1, cfg.d_model, cfg.vocab_size);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activation, ModelConfig, NormKind};
    use crate::tensor::Tensor;
    use crate::tokenizer::Tokenizer;
    use std::collections::BTreeMap;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            arch: "llama".to_string(),
            n_layers: 1,
            d_model: 4,
            n_heads: 2,
            n_kv_heads: 1,
            head_dim: 2,
            ffn_hidden: 8,
            activation: Activation::SwiGlu,
            norm: NormKind::RmsNorm,
            rope_theta: 10000.0,
            max_context: 16,
            vocab_size: 5,
            eos_id: 4,
            bos_id: 0,
            chat_template: None,
            sliding_window: None,
        }
    }

    fn dense(shape: Vec<usize>, fill: f32) -> Weight {
        Weight::DenseF32(Tensor::new(shape.clone(), vec![fill; shape.iter().product()]))
    }

    fn tiny_model() -> Model {
        let cfg = tiny_config();
        let mut weights = BTreeMap::new();
        weights.insert("token_embd.weight".to_string(), dense(vec![cfg.vocab_size, cfg.d_model], 0.1));
        weights.insert("blk.0.attn_norm.weight".to_string(), dense(vec![cfg.d_model], 1.0));
        weights.insert("blk.0.attn_q.weight".to_string(), dense(vec![cfg.n_heads * cfg.head_dim, cfg.d_model], 0.05));
        weights.insert("blk.0.attn_k.weight".to_string(), dense(vec![cfg.n_kv_heads * cfg.head_dim, cfg.d_model], 0.05));
        weights.insert("blk.0.attn_v.weight".to_string(), dense(vec![cfg.n_kv_heads * cfg.head_dim, cfg.d_model], 0.05));
        weights.insert("blk.0.attn_output.weight".to_string(), dense(vec![cfg.d_model, cfg.n_heads * cfg.head_dim], 0.05));
        weights.insert("blk.0.ffn_norm.weight".to_string(), dense(vec![cfg.d_model], 1.0));
        weights.insert("blk.0.ffn_gate.weight".to_string(), dense(vec![cfg.ffn_hidden, cfg.d_model], 0.05));
        weights.insert("blk.0.ffn_up.weight".to_string(), dense(vec![cfg.ffn_hidden, cfg.d_model], 0.05));
        weights.insert("blk.0.ffn_down.weight".to_string(), dense(vec![cfg.d_model, cfg.ffn_hidden], 0.05));
        weights.insert("output_norm.weight".to_string(), dense(vec![cfg.d_model], 1.0));
        weights.insert("output.weight".to_string(), dense(vec![cfg.vocab_size, cfg.d_model], 0.05));
        Model::new(cfg, weights, Tokenizer::empty())
    }

    #[test]
    fn forward_produces_finite_logits_and_advances_cache() {
        let model = tiny_model();
        let mut cache = KVCache::new(model.config.n_layers, model.config.n_kv_heads, model.config.max_context, model.config.head_dim);
        let mut ws = ForwardWorkspace::new(&model.config);
        let mut logits = vec![0.0f32; model.config.vocab_size];

        forward(&model, &[1, 2, 3], &mut cache, &mut ws, &mut logits).unwrap();
        assert_eq!(cache.pos(), 3);
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn forward_rejects_empty_tokens() {
        let model = tiny_model();
        let mut cache = KVCache::new(model.config.n_layers, model.config.n_kv_heads, model.config.max_context, model.config.head_dim);
        let mut ws = ForwardWorkspace::new(&model.config);
        let mut logits = vec![0.0f32; model.config.vocab_size];
        assert!(forward(&model, &[], &mut cache, &mut ws, &mut logits).is_err());
    }

    #[test]
    fn decode_after_prefill_matches_single_pass_cache_position() {
        let model = tiny_model();
        let mut cache_split = KVCache::new(model.config.n_layers, model.config.n_kv_heads, model.config.max_context, model.config.head_dim);
        let mut ws = ForwardWorkspace::new(&model.config);
        let mut logits = vec![0.0f32; model.config.vocab_size];

        forward(&model, &[1, 2], &mut cache_split, &mut ws, &mut logits).unwrap();
        forward(&model, &[3], &mut cache_split, &mut ws, &mut logits).unwrap();
        assert_eq!(cache_split.pos(), 3);

        let mut cache_single = KVCache::new(model.config.n_layers, model.config.n_kv_heads, model.config.max_context, model.config.head_dim);
        let mut logits_single = vec![0.0f32; model.config.vocab_size];
        forward(&model, &[1, 2, 3], &mut cache_single, &mut ws, &mut logits_single).unwrap();
        assert_eq!(cache_single.pos(), 3);
    }
}
