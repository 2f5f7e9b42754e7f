/// Rotary position embedding.
///
/// Rotation angle for dimension pair `j` is `theta_j = base^(-2j/head_dim)`;
/// position `p` rotates pair `(x[2j], x[2j+1])` by `p * theta_j`.

/// Apply RoPE in place to `q` (`[T, n_q_heads * head_dim]`) and `k`
/// (`[T, n_kv_heads * head_dim]`), one token per row, using position
/// `position_offset + t` for row `t`.
pub fn rope(
    q: &mut [f32],
    k: &mut [f32],
    n_q_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    position_offset: usize,
    theta: f32,
) {
    debug_assert_eq!(head_dim % 2, 0);
    let half = head_dim / 2;
    let q_row_len = n_q_heads * head_dim;
    let k_row_len = n_kv_heads * head_dim;
    debug_assert_eq!(q.len() % q_row_len, 0);
    debug_assert_eq!(k.len() % k_row_len, 0);
    let t_count = q.len() / q_row_len;
    debug_assert_eq!(k.len() / k_row_len, t_count);

    let mut cos_table = vec![0.0f32; half];
    let mut sin_table = vec![0.0f32; half];

    for t in 0..t_count {
        let pos = (position_offset + t) as f32;
        for j in 0..half {
            let freq = theta.powf(-2.0 * j as f32 / head_dim as f32);
            let angle = pos * freq;
            cos_table[j] = angle.cos();
            sin_table[j] = angle.sin();
        }

        let q_row = &mut q[t * q_row_len..(t + 1) * q_row_len];
        for head in q_row.chunks_mut(head_dim) {
            rotate_head(head, half, &cos_table, &sin_table);
        }

        let k_row = &mut k[t * k_row_len..(t + 1) * k_row_len];
        for head in k_row.chunks_mut(head_dim) {
            rotate_head(head, half, &cos_table, &sin_table);
        }
    }
}

#[inline]
fn rotate_head(head: &mut [f32], half: usize, cos_table: &[f32], sin_table: &[f32]) {
    for j in 0..half {
        let x0 = head[2 * j];
        let x1 = head[2 * j + 1];
        let c = cos_table[j];
        let s = sin_table[j];
        head[2 * j] = x0 * c - x1 * s;
        head[2 * j + 1] = x0 * s + x1 * c;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rope_at_position_zero_is_identity() {
        let mut q = vec![1.0, 2.0, 3.0, 4.0];
        let mut k = vec![5.0, 6.0, 7.0, 8.0];
        let original_q = q.clone();
        rope(&mut q, &mut k, 1, 1, 4, 0, 10000.0);
        for (a, b) in q.iter().zip(original_q.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn rope_preserves_pair_norm() {
        let mut q = vec![3.0, 4.0, 1.0, 0.0];
        let mut k = vec![0.0; 4];
        rope(&mut q, &mut k, 1, 1, 4, 5, 10000.0);
        let norm0 = (q[0] * q[0] + q[1] * q[1]).sqrt();
        let norm1 = (q[2] * q[2] + q[3] * q[3]).sqrt();
        assert!((norm0 - 5.0).abs() < 1e-4);
        assert!((norm1 - 1.0).abs() < 1e-4);
    }
}
