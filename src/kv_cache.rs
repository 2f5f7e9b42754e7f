/// Key-value cache for autoregressive decoding.
///
/// One flat `[n_kv_heads, max_context, head_dim]` buffer per layer for keys
/// and for values. All layers advance in lockstep, so a single scalar `pos`
/// (not one per layer) tracks how many positions are valid; writes to
/// `[0, pos)` are frozen once made; `append` only writes `[pos, pos+t)` and
/// leaves `pos` untouched, `advance` is what moves the frontier forward.
use crate::error::{SmallMindError, SmallMindResult};

#[derive(Debug, Clone)]
pub struct KVCache {
    n_kv_heads: usize,
    max_context: usize,
    head_dim: usize,
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
    pos: usize,
}

impl KVCache {
    pub fn new(n_layers: usize, n_kv_heads: usize, max_context: usize, head_dim: usize) -> Self {
        let buf_len = n_kv_heads * max_context * head_dim;
        Self {
            n_kv_heads,
            max_context,
            head_dim,
            keys: (0..n_layers).map(|_| vec![0.0f32; buf_len]).collect(),
            values: (0..n_layers).map(|_| vec![0.0f32; buf_len]).collect(),
            pos: 0,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn max_context(&self) -> usize {
        self.max_context
    }

    pub fn n_kv_heads(&self) -> usize {
        self.n_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn n_layers(&self) -> usize {
        self.keys.len()
    }

    /// Write `t` new positions worth of key/value data for `layer`, starting
    /// at the current `pos`. `new_k`/`new_v` are `[n_kv_heads, t, head_dim]`.
    /// Does not move `pos`; call `advance` once all layers for this step are
    /// written.
    pub fn append(&mut self, layer: usize, new_k: &[f32], new_v: &[f32], t: usize) -> SmallMindResult<()> {
        if self.pos + t > self.max_context {
            return Err(SmallMindError::InvalidArgument(format!(
                "kv cache overflow: pos {} + {} exceeds max_context {}",
                self.pos, t, self.max_context
            )));
        }
        let expected = self.n_kv_heads * t * self.head_dim;
        if new_k.len() != expected || new_v.len() != expected {
            return Err(SmallMindError::ShapeMismatch(format!(
                "kv append expected {expected} elements per tensor, got k={} v={}",
                new_k.len(),
                new_v.len()
            )));
        }

        let head_stride = self.max_context * self.head_dim;
        for head in 0..self.n_kv_heads {
            let src_start = head * t * self.head_dim;
            let dst_start = head * head_stride + self.pos * self.head_dim;
            let len = t * self.head_dim;
            self.keys[layer][dst_start..dst_start + len].copy_from_slice(&new_k[src_start..src_start + len]);
            self.values[layer][dst_start..dst_start + len].copy_from_slice(&new_v[src_start..src_start + len]);
        }
        Ok(())
    }

    /// Move the shared position frontier forward by `t` once every layer has
    /// been appended for this step.
    pub fn advance(&mut self, t: usize) -> SmallMindResult<()> {
        if self.pos + t > self.max_context {
            return Err(SmallMindError::InvalidArgument(format!(
                "kv cache overflow: pos {} + {} exceeds max_context {}",
                self.pos, t, self.max_context
            )));
        }
        self.pos += t;
        Ok(())
    }

    /// Full `[max_context, head_dim]` buffer for one kv head of one layer;
    /// the caller slices `[0, pos*head_dim)` (or further, mid-step) for the
    /// currently valid prefix.
    pub fn key_head(&self, layer: usize, head: usize) -> &[f32] {
        let stride = self.max_context * self.head_dim;
        let start = head * stride;
        &self.keys[layer][start..start + stride]
    }

    pub fn value_head(&self, layer: usize, head: usize) -> &[f32] {
        let stride = self.max_context * self.head_dim;
        let start = head * stride;
        &self.values[layer][start..start + stride]
    }

    /// Reset to an empty sequence without reallocating the backing buffers.
    pub fn reset(&mut self) {
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_advance_tracks_position() {
        let mut cache = KVCache::new(1, 2, 8, 4);
        let k = vec![1.0f32; 2 * 1 * 4];
        let v = vec![2.0f32; 2 * 1 * 4];
        cache.append(0, &k, &v, 1).unwrap();
        assert_eq!(cache.pos(), 0);
        cache.advance(1).unwrap();
        assert_eq!(cache.pos(), 1);

        let head0 = cache.key_head(0, 0);
        assert_eq!(&head0[0..4], &[1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn append_rejects_overflow() {
        let mut cache = KVCache::new(1, 1, 2, 4);
        let k = vec![0.0f32; 1 * 3 * 4];
        let v = vec![0.0f32; 1 * 3 * 4];
        assert!(cache.append(0, &k, &v, 3).is_err());
    }

    #[test]
    fn reset_clears_position_without_realloc() {
        let mut cache = KVCache::new(1, 1, 4, 2);
        let k = vec![5.0f32; 1 * 2 * 2];
        let v = vec![6.0f32; 1 * 2 * 2];
        cache.append(0, &k, &v, 2).unwrap();
        cache.advance(2).unwrap();
        assert_eq!(cache.pos(), 2);
        cache.reset();
        assert_eq!(cache.pos(), 0);
        // data from before reset is still readable until overwritten, since
        // reset only rewinds the position frontier.
        assert_eq!(cache.key_head(0, 0)[0], 5.0);
    }
}
