/// Logit-to-token sampling pipeline.
///
/// Applied in order: repetition/presence/frequency penalties over a trailing
/// window of history, temperature scaling (or immediate greedy argmax when
/// temperature <= 0), top-k truncation, softmax, top-p (nucleus) filtering,
/// min-p filtering, then inverse-CDF sampling against a seeded RNG.
use rand::rngs::StdRng;
use rand::Rng;

use crate::tokenizer::TokenId;

#[derive(Debug, Clone, Copy)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub min_p: Option<f32>,
    pub repetition_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    /// How many trailing history tokens the penalties look back over.
    pub repetition_window: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            min_p: None,
            repetition_penalty: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            repetition_window: 64,
        }
    }
}

/// Reusable scratch state so steady-state decoding does not allocate: a
/// `(token, logit)` candidate buffer sized once to `vocab_size`, and a
/// token-count scratch map for the repetition/frequency penalties.
pub struct SamplingWorkspace {
    candidates: Vec<(TokenId, f32)>,
    counts: std::collections::HashMap<TokenId, u32>,
}

impl SamplingWorkspace {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            candidates: Vec::with_capacity(vocab_size),
            counts: std::collections::HashMap::new(),
        }
    }
}

fn apply_penalties(logits: &mut [f32], history: &[TokenId], config: &SamplingConfig, ws: &mut SamplingWorkspace) {
    if config.repetition_penalty == 1.0 && config.presence_penalty == 0.0 && config.frequency_penalty == 0.0 {
        return;
    }
    ws.counts.clear();
    let start = history.len().saturating_sub(config.repetition_window);
    for &tok in &history[start..] {
        *ws.counts.entry(tok).or_insert(0) += 1;
    }
    for (&tok, &count) in ws.counts.iter() {
        let idx = tok as usize;
        if idx >= logits.len() {
            continue;
        }
        if config.repetition_penalty != 1.0 {
            logits[idx] /= if logits[idx] > 0.0 {
                config.repetition_penalty
            } else {
                1.0 / config.repetition_penalty
            };
        }
        logits[idx] -= config.presence_penalty;
        logits[idx] -= config.frequency_penalty * count as f32;
    }
}

/// Select the next token given raw `logits` (length `vocab_size`) and the
/// preceding `history`. Mutates `logits` in place as scratch space.
pub fn sample(
    logits: &mut [f32],
    history: &[TokenId],
    config: &SamplingConfig,
    rng: &mut StdRng,
    ws: &mut SamplingWorkspace,
) -> TokenId {
    apply_penalties(logits, history, config, ws);

    if config.temperature <= 0.0 {
        return argmax(logits);
    }

    for v in logits.iter_mut() {
        *v /= config.temperature;
    }

    ws.candidates.clear();
    ws.candidates
        .extend(logits.iter().enumerate().map(|(i, &v)| (i as TokenId, v)));

    if let Some(k) = config.top_k {
        let k = k.min(ws.candidates.len()).max(1);
        ws.candidates
            .select_nth_unstable_by(k - 1, |a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ws.candidates.truncate(k);
    }

    softmax_candidates(&mut ws.candidates);
    ws.candidates
        .sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(p) = config.top_p {
        let mut cumulative = 0.0f32;
        let mut cutoff = ws.candidates.len();
        for (i, &(_, prob)) in ws.candidates.iter().enumerate() {
            cumulative += prob;
            if cumulative >= p {
                cutoff = i + 1;
                break;
            }
        }
        ws.candidates.truncate(cutoff.max(1));
    }

    if let Some(min_p) = config.min_p {
        let max_prob = ws.candidates.first().map(|&(_, p)| p).unwrap_or(0.0);
        let threshold = min_p * max_prob;
        ws.candidates.retain(|&(_, p)| p >= threshold);
        if ws.candidates.is_empty() {
            ws.candidates.push((argmax(logits), 1.0));
        }
    }

    let total: f32 = ws.candidates.iter().map(|&(_, p)| p).sum();
    let draw: f32 = rng.gen_range(0.0..1.0) * total;
    let mut cumulative = 0.0f32;
    for &(token, prob) in ws.candidates.iter() {
        cumulative += prob;
        if draw <= cumulative {
            return token;
        }
    }
    ws.candidates.last().map(|&(t, _)| t).unwrap_or(0)
}

fn softmax_candidates(candidates: &mut [(TokenId, f32)]) {
    let max_val = candidates.iter().map(|&(_, v)| v).fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (_, v) in candidates.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for (_, v) in candidates.iter_mut() {
            *v /= sum;
        }
    }
}

fn argmax(logits: &[f32]) -> TokenId {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as TokenId)
        .unwrap_or(0)
}
