/// Byte-pair tokenizer with ordered merge rules, plus chat-template rendering.
pub mod bpe;
pub mod chat_template;

pub use chat_template::{apply_template, TemplateKind};

use std::collections::HashMap;

pub type TokenId = u32;

/// Vocabulary plus ordered BPE merge rules and the handful of special token
/// IDs the generation engine needs (`eos_id`/`bos_id` live on `ModelConfig`;
/// this only carries what encode/decode need).
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: Vec<String>,
    token_to_id: HashMap<String, TokenId>,
    merge_ranks: HashMap<(String, String), usize>,
}

impl Tokenizer {
    pub fn new(vocab: Vec<String>, merges: Vec<(String, String)>) -> Self {
        let mut token_to_id = HashMap::with_capacity(vocab.len());
        for (id, tok) in vocab.iter().enumerate() {
            token_to_id.insert(tok.clone(), id as TokenId);
        }
        let merge_ranks = merges
            .into_iter()
            .enumerate()
            .map(|(rank, pair)| (pair, rank))
            .collect();
        Self {
            vocab,
            token_to_id,
            merge_ranks,
        }
    }

    /// A tokenizer with no vocabulary, for tests that don't exercise BPE.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn token_str(&self, id: TokenId) -> Option<&str> {
        self.vocab.get(id as usize).map(|s| s.as_str())
    }

    pub fn token_id(&self, token: &str) -> Option<TokenId> {
        self.token_to_id.get(token).copied()
    }

    pub fn encode(&self, text: &str) -> Vec<TokenId> {
        bpe::encode(text, &self.vocab, &self.token_to_id, &self.merge_ranks)
    }

    pub fn decode(&self, ids: &[TokenId]) -> String {
        bpe::decode(ids, &self.vocab)
    }

    /// Decode a single token to its UTF-8 text, for incremental
    /// (stream/stop-sequence) text accumulation. Unlike `token_str`, which
    /// exposes the raw byte-to-unicode-mapped vocabulary symbol, this maps
    /// back through the byte table so multi-byte characters and whitespace
    /// come out as the bytes they represent.
    pub fn decode_token(&self, id: TokenId) -> String {
        bpe::decode(&[id], &self.vocab)
    }
}
