/// A generation session bound to one `Model`: owns the KV cache and every
/// reusable scratch buffer, so steady-state decoding after the first call
/// allocates nothing. `Fresh -> Active -> Idle -> Disposed`: `Active` only
/// while a `generate`/`generate_stream` call is actually running (guarded by
/// an atomic so a second concurrent call gets `SessionBusy` instead of
/// corrupting the shared workspace); `dispose` is terminal.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::constraints::Constraint;
use crate::error::{SmallMindError, SmallMindResult};
use crate::forward::{forward, ForwardWorkspace};
use crate::kv_cache::KVCache;
use crate::model::Model;
use crate::sampling::{self, SamplingConfig, SamplingWorkspace};
use crate::tokenizer::TokenId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Active,
    Idle,
    Disposed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinishReason {
    MaxTokens,
    Eos,
    StopToken(TokenId),
    StopSequence(String),
    ConstraintSatisfied,
    Cancelled,
    Timeout,
    ContextExhausted,
}

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub max_new_tokens: usize,
    pub sampling: SamplingConfig,
    /// Token IDs that end generation without being emitted, checked before
    /// `eos_id` per step.
    pub stop_token_ids: Vec<TokenId>,
    pub stop_sequences: Vec<String>,
    /// When a `stop_sequences` entry matches, whether the matched text is
    /// trimmed from the returned string (`true`) or kept (`false`).
    pub remove_stop_sequence: bool,
    pub seed: u64,
    pub timeout: Option<Duration>,
    pub constraint: Option<Constraint>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            sampling: SamplingConfig::default(),
            stop_token_ids: Vec::new(),
            stop_sequences: Vec::new(),
            remove_stop_sequence: true,
            seed: 0,
            timeout: None,
            constraint: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub tokens: Vec<TokenId>,
    pub text: String,
    pub finish_reason: FinishReason,
}

pub enum StreamControl {
    Continue,
    Cancel,
}

/// A session's own generate/generate_stream call is the only writer of its
/// workspace; `cancel_handle` is the one piece meant to be shared across
/// threads so another thread can ask a running generation to stop.
pub struct Session<'m> {
    model: &'m Model,
    cache: KVCache,
    workspace: ForwardWorkspace,
    sampling_ws: SamplingWorkspace,
    logits: Vec<f32>,
    history: Vec<TokenId>,
    state: SessionState,
    busy: AtomicBool,
    cancel_flag: Arc<AtomicBool>,
}

impl<'m> Session<'m> {
    pub fn new(model: &'m Model) -> Self {
        let cfg = &model.config;
        Self {
            cache: KVCache::new(cfg.n_layers, cfg.n_kv_heads, cfg.max_context, cfg.head_dim),
            workspace: ForwardWorkspace::new(cfg),
            sampling_ws: SamplingWorkspace::new(cfg.vocab_size),
            logits: vec![0.0; cfg.vocab_size],
            history: Vec::new(),
            state: SessionState::Fresh,
            busy: AtomicBool::new(false),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// A handle another thread can use to request cancellation of whatever
    /// `generate`/`generate_stream` call is currently in flight.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }

    /// Rewind to an empty sequence without reallocating cache or workspace
    /// buffers. Leaves `Disposed` sessions disposed.
    pub fn reset(&mut self) {
        if self.state == SessionState::Disposed {
            return;
        }
        self.cache.reset();
        self.history.clear();
        self.cancel_flag.store(false, Ordering::Relaxed);
        self.state = SessionState::Fresh;
    }

    pub fn dispose(&mut self) {
        self.state = SessionState::Disposed;
    }

    pub fn generate(&mut self, prompt_tokens: &[TokenId], options: &GenerationOptions) -> SmallMindResult<GenerationResult> {
        self.generate_stream(prompt_tokens, options, |_| StreamControl::Continue)
    }

    /// Runs generation, invoking `on_token` once per newly sampled token
    /// (including the one that triggers the terminal condition) so callers
    /// can stream output incrementally. Returning `StreamControl::Cancel`
    /// from `on_token` stops generation after that token is recorded.
    pub fn generate_stream(
        &mut self,
        prompt_tokens: &[TokenId],
        options: &GenerationOptions,
        mut on_token: impl FnMut(TokenId) -> StreamControl,
    ) -> SmallMindResult<GenerationResult> {
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(SmallMindError::SessionBusy);
        }
        let result = self.run_generate(prompt_tokens, options, &mut on_token);
        self.busy.store(false, Ordering::Release);
        result
    }

    fn run_generate(
        &mut self,
        prompt_tokens: &[TokenId],
        options: &GenerationOptions,
        on_token: &mut impl FnMut(TokenId) -> StreamControl,
    ) -> SmallMindResult<GenerationResult> {
        if self.state == SessionState::Disposed {
            return Err(SmallMindError::InvalidArgument("session has been disposed".to_string()));
        }
        if prompt_tokens.is_empty() {
            return Err(SmallMindError::InvalidArgument("prompt_tokens must not be empty".to_string()));
        }

        self.state = SessionState::Active;
        self.cancel_flag.store(false, Ordering::Relaxed);
        let deadline = options.timeout.map(|d| Instant::now() + d);
        let mut rng = StdRng::seed_from_u64(options.seed);

        let longest_stop = options.stop_sequences.iter().map(|s| s.len()).max().unwrap_or(0);
        let mut generated_tokens = Vec::new();
        let mut generated_text = String::new();

        forward(self.model, prompt_tokens, &mut self.cache, &mut self.workspace, &mut self.logits)?;
        self.history.extend_from_slice(prompt_tokens);

        let finish_reason = loop {
            if self.cancel_flag.load(Ordering::Relaxed) {
                break FinishReason::Cancelled;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break FinishReason::Timeout;
                }
            }

            if let Some(constraint) = &options.constraint {
                constraint.mask(&generated_text, &self.model.tokenizer, &mut self.logits);
            }

            let next = sampling::sample(&mut self.logits, &self.history, &options.sampling, &mut rng, &mut self.sampling_ws);

            // Stop tokens and EOS end generation without being emitted: no
            // history/text append, no on_token callback.
            if options.stop_token_ids.contains(&next) {
                break FinishReason::StopToken(next);
            }
            if next == self.model.config.eos_id {
                break FinishReason::Eos;
            }

            generated_tokens.push(next);
            self.history.push(next);
            generated_text.push_str(&self.model.tokenizer.decode_token(next));
            if longest_stop > 0 && generated_text.len() > longest_stop * 4 {
                let min_keep_from = generated_text.len() - longest_stop * 4;
                let keep_from = (min_keep_from..generated_text.len())
                    .find(|&i| generated_text.is_char_boundary(i))
                    .unwrap_or(generated_text.len());
                generated_text = generated_text[keep_from..].to_string();
            }
            // Advancing the cache is part of the same step as appending to
            // history, not contingent on whether this step also happens to
            // be the last one: every termination path below must leave
            // `cache.pos()` in sync with `history.len()` so a later
            // `generate()` call on this session continues from the right
            // position instead of re-prefilling over a stale cache frontier.
            forward(self.model, &[next], &mut self.cache, &mut self.workspace, &mut self.logits)?;

            let stream_control = on_token(next);

            if let Some(stop) = options.stop_sequences.iter().find(|s| generated_text.ends_with(s.as_str())) {
                break FinishReason::StopSequence(stop.clone());
            }
            if let Some(constraint) = &options.constraint {
                if constraint.is_complete(&generated_text) {
                    break FinishReason::ConstraintSatisfied;
                }
            }
            if matches!(stream_control, StreamControl::Cancel) {
                break FinishReason::Cancelled;
            }
            if generated_tokens.len() >= options.max_new_tokens {
                break FinishReason::MaxTokens;
            }
            if self.cache.pos() >= self.model.config.max_context {
                break FinishReason::ContextExhausted;
            }
        };

        self.state = SessionState::Idle;
        let mut text = self.model.tokenizer.decode(&generated_tokens);
        if options.remove_stop_sequence {
            if let FinishReason::StopSequence(ref stop) = finish_reason {
                if let Some(idx) = text.rfind(stop.as_str()) {
                    text.truncate(idx);
                }
            }
        }
        Ok(GenerationResult {
            text,
            tokens: generated_tokens,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activation, ModelConfig, NormKind};
    use crate::quant::Weight;
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

    /// Like `tiny_model`, but with a 2-entry vocabulary and an `eos_id`
    /// outside that range, so ties in uniform logits deterministically
    /// sample id 1 (`Iterator::max_by` keeps the last of equal maxima)
    /// without ever hitting an end-of-sequence break.
    fn tiny_model_with_vocab(vocab: Vec<String>) -> Model {
        let mut cfg = tiny_config();
        cfg.vocab_size = vocab.len();
        cfg.eos_id = vocab.len() as TokenId + 1;
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
        Model::new(cfg, weights, Tokenizer::new(vocab, Vec::new()))
    }

    #[test]
    fn greedy_generation_is_deterministic() {
        let model = tiny_model();
        let options = GenerationOptions {
            max_new_tokens: 3,
            sampling: SamplingConfig {
                temperature: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut session1 = Session::new(&model);
        let result1 = session1.generate(&[0, 1], &options).unwrap();
        let mut session2 = Session::new(&model);
        let result2 = session2.generate(&[0, 1], &options).unwrap();
        assert_eq!(result1.tokens, result2.tokens);
    }

    #[test]
    fn concurrent_generate_calls_report_busy() {
        let model = tiny_model();
        let mut session = Session::new(&model);
        let cancel = session.cancel_handle();
        cancel.store(false, Ordering::Relaxed);

        session.busy.store(true, Ordering::Release);
        let result = session.generate(&[0, 1], &GenerationOptions::default());
        assert!(matches!(result, Err(SmallMindError::SessionBusy)));
        session.busy.store(false, Ordering::Release);
    }

    #[test]
    fn reset_returns_to_fresh_state() {
        let model = tiny_model();
        let mut session = Session::new(&model);
        session.generate(&[0, 1], &GenerationOptions { max_new_tokens: 1, ..Default::default() }).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        session.reset();
        assert_eq!(session.state(), SessionState::Fresh);
        assert_eq!(session.cache.pos(), 0);
    }

    #[test]
    fn disposed_session_rejects_generate() {
        let model = tiny_model();
        let mut session = Session::new(&model);
        session.dispose();
        let result = session.generate(&[0, 1], &GenerationOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn cache_position_stays_in_sync_with_history_across_max_tokens_continuation() {
        let model = tiny_model();
        let mut session = Session::new(&model);
        let options = GenerationOptions {
            max_new_tokens: 2,
            sampling: SamplingConfig {
                temperature: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        session.generate(&[1, 2], &options).unwrap();
        assert_eq!(session.cache.pos(), session.history.len());

        // A second call on the same (Idle, not reset) session must prefill
        // from the cache's actual frontier, not one token behind it.
        session.generate(&[3], &options).unwrap();
        assert_eq!(session.cache.pos(), session.history.len());
    }

    #[test]
    fn stop_token_ends_generation_without_emitting_it() {
        let model = tiny_model();
        let mut session = Session::new(&model);
        let options = GenerationOptions {
            max_new_tokens: 5,
            sampling: SamplingConfig {
                temperature: 0.0,
                ..Default::default()
            },
            stop_token_ids: vec![0],
            ..Default::default()
        };
        let result = session.generate(&[1, 2], &options).unwrap();
        assert_eq!(result.finish_reason, FinishReason::StopToken(0));
        assert!(!result.tokens.contains(&0));
    }

    #[test]
    fn stop_sequence_is_trimmed_unless_remove_stop_sequence_is_false() {
        let model = tiny_model();
        let options_trim = GenerationOptions {
            max_new_tokens: 3,
            sampling: SamplingConfig {
                temperature: 0.0,
                ..Default::default()
            },
            stop_sequences: vec![model.tokenizer.decode(&[0])],
            remove_stop_sequence: true,
            ..Default::default()
        };
        let mut session = Session::new(&model);
        let trimmed = session.generate(&[1, 2], &options_trim).unwrap();
        assert_eq!(trimmed.finish_reason, FinishReason::StopSequence(options_trim.stop_sequences[0].clone()));
        assert!(!trimmed.text.ends_with(&options_trim.stop_sequences[0]));

        let options_keep = GenerationOptions {
            remove_stop_sequence: false,
            ..options_trim
        };
        let mut session = Session::new(&model);
        let kept = session.generate(&[1, 2], &options_keep).unwrap();
        assert!(kept.text.ends_with(&options_keep.stop_sequences[0]));
    }

    #[test]
    fn rolling_text_trim_does_not_panic_on_non_char_boundary() {
        // Token 1's vocab symbol is the single char for byte 0xC8 (in the
        // byte-to-unicode table's "maps to itself" range), which decodes
        // alone to an invalid one-byte UTF-8 sequence and gets replaced with
        // a 3-byte U+FFFD. Two of those tokens push generated_text past the
        // rolling window's `longest_stop * 4` bound right in the middle of
        // one replacement character's byte span.
        let byte_200_char = char::from_u32(200).unwrap();
        let model = tiny_model_with_vocab(vec!["placeholder".to_string(), byte_200_char.to_string()]);
        let options = GenerationOptions {
            max_new_tokens: 3,
            sampling: SamplingConfig {
                temperature: 0.0,
                ..Default::default()
            },
            stop_sequences: vec!["z".to_string()],
            ..Default::default()
        };
        let mut session = Session::new(&model);
        let result = session.generate(&[0, 1], &options).unwrap();
        assert_eq!(result.finish_reason, FinishReason::MaxTokens);
    }
}
