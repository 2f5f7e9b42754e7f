/// Core byte-pair encode/decode.
///
/// Bytes are mapped through the GPT-2-style byte-to-printable-unicode table
/// before merging, so merge rules (which are strings over that alphabet, as
/// stored in GGUF's `tokenizer.ggml.merges`) apply directly to the initial
/// symbol sequence. Encoding repeatedly merges the lowest-rank adjacent pair;
/// ties (which do not occur for distinct pairs, since ranks are unique, but
/// can occur when the same pair appears more than once) are broken by
/// leftmost position, i.e. the pair instances are merged left to right within
/// a round.
use super::TokenId;
use std::collections::HashMap;
use std::sync::OnceLock;

fn byte_to_unicode() -> &'static [char; 256] {
    static TABLE: OnceLock<[char; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut bytes_with_char: Vec<u32> = Vec::new();
        for range in [(b'!' as u32, b'~' as u32), (0xA1, 0xAC), (0xAE, 0xFF)] {
            bytes_with_char.extend(range.0..=range.1);
        }
        let mut table = [' '; 256];
        let mut extra = 0u32;
        for b in 0..256u32 {
            if bytes_with_char.contains(&b) {
                table[b as usize] = char::from_u32(b).unwrap();
            } else {
                table[b as usize] = char::from_u32(256 + extra).unwrap();
                extra += 1;
            }
        }
        table
    })
}

fn unicode_to_byte() -> &'static HashMap<char, u8> {
    static TABLE: OnceLock<HashMap<char, u8>> = OnceLock::new();
    TABLE.get_or_init(|| {
        byte_to_unicode()
            .iter()
            .enumerate()
            .map(|(b, &c)| (c, b as u8))
            .collect()
    })
}

/// Encode `text` into the initial byte-level symbol sequence, then merge
/// until no applicable rule remains, then map symbols to vocabulary IDs.
pub fn encode(
    text: &str,
    vocab: &[String],
    token_to_id: &HashMap<String, TokenId>,
    merge_ranks: &HashMap<(String, String), usize>,
) -> Vec<TokenId> {
    if text.is_empty() {
        return Vec::new();
    }

    let table = byte_to_unicode();
    let mut symbols: Vec<String> = text
        .bytes()
        .map(|b| table[b as usize].to_string())
        .collect();

    loop {
        let mut best: Option<(usize, usize)> = None; // (rank, position)
        for i in 0..symbols.len().saturating_sub(1) {
            let pair = (symbols[i].clone(), symbols[i + 1].clone());
            if let Some(&rank) = merge_ranks.get(&pair) {
                if best.map(|(r, _)| rank < r).unwrap_or(true) {
                    best = Some((rank, i));
                }
            }
        }
        let Some((rank, _)) = best else { break };

        let target_pair_at = |i: usize| -> bool {
            i + 1 < symbols.len()
                && merge_ranks
                    .get(&(symbols[i].clone(), symbols[i + 1].clone()))
                    .map(|&r| r == rank)
                    .unwrap_or(false)
        };

        let mut merged = Vec::with_capacity(symbols.len());
        let mut i = 0;
        while i < symbols.len() {
            if target_pair_at(i) {
                merged.push(format!("{}{}", symbols[i], symbols[i + 1]));
                i += 2;
            } else {
                merged.push(symbols[i].clone());
                i += 1;
            }
        }
        symbols = merged;
    }

    symbols
        .iter()
        .map(|s| {
            token_to_id.get(s).copied().unwrap_or_else(|| {
                // Vocabulary miss: fall back to per-byte symbols so encode
                // never silently drops text it can't merge further.
                vocab
                    .iter()
                    .position(|v| v == s)
                    .map(|id| id as TokenId)
                    .unwrap_or(0)
            })
        })
        .collect()
}

pub fn decode(ids: &[TokenId], vocab: &[String]) -> String {
    let byte_table = unicode_to_byte();
    let mut bytes = Vec::new();
    for &id in ids {
        let Some(token) = vocab.get(id as usize) else {
            continue;
        };
        for ch in token.chars() {
            if let Some(&b) = byte_table.get(&ch) {
                bytes.push(b);
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab_with_merges() -> (Vec<String>, HashMap<String, TokenId>, HashMap<(String, String), usize>) {
        let table = byte_to_unicode();
        let h = table[b'h' as usize].to_string();
        let e = table[b'e' as usize].to_string();
        let l = table[b'l' as usize].to_string();
        let o = table[b'o' as usize].to_string();
        let he = format!("{h}{e}");
        let ll = format!("{l}{l}");
        let hello = format!("{he}{ll}{o}");

        let vocab = vec![h.clone(), e.clone(), l.clone(), o.clone(), he.clone(), ll.clone(), hello.clone()];
        let mut token_to_id = HashMap::new();
        for (i, v) in vocab.iter().enumerate() {
            token_to_id.insert(v.clone(), i as TokenId);
        }
        let mut merge_ranks = HashMap::new();
        merge_ranks.insert((h, e), 0usize);
        merge_ranks.insert((l.clone(), l), 1usize);
        merge_ranks.insert((he, format!("{}{}", table[b'l' as usize], table[b'l' as usize])), 2usize);
        (vocab, token_to_id, merge_ranks)
    }

    #[test]
    fn encode_applies_lowest_rank_merges_first() {
        let (vocab, token_to_id, merge_ranks) = vocab_with_merges();
        let ids = encode("he", &vocab, &token_to_id, &merge_ranks);
        assert_eq!(ids.len(), 1);
        assert_eq!(vocab[ids[0] as usize], vocab[4]); // "he" merged token
    }

    #[test]
    fn encode_empty_text_is_empty() {
        let (vocab, token_to_id, merge_ranks) = vocab_with_merges();
        assert!(encode("", &vocab, &token_to_id, &merge_ranks).is_empty());
    }

    #[test]
    fn decode_reassembles_bytes() {
        let table = byte_to_unicode();
        let vocab = vec![table[b'a' as usize].to_string(), table[b'b' as usize].to_string()];
        let decoded = decode(&[0, 1, 0], &vocab);
        assert_eq!(decoded, "aba");
    }
}
