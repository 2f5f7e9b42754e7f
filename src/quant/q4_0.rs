/// Q4_0: `[f16 scale][16 x u8 two-nibbles]`, 18 bytes per 32-element block.
/// Each byte packs two 4-bit values; low nibble is element `i`, high nibble
/// is element `i + 16`. Dequant: `(nibble - 8) * scale`.
use half::f16;

const BLOCK_ELEMS: usize = 32;
const BLOCK_BYTES: usize = 18;
const HALF: usize = 16;

fn unpack_into(block: &[u8], out: &mut [f32]) {
    let scale = f16::from_le_bytes([block[0], block[1]]).to_f32();
    let nibbles = &block[2..2 + HALF];
    for (i, &byte) in nibbles.iter().enumerate() {
        let low = (byte & 0x0F) as i32 - 8;
        let high = ((byte >> 4) & 0x0F) as i32 - 8;
        out[i] = low as f32 * scale;
        out[i + HALF] = high as f32 * scale;
    }
}

pub fn dequantize(packed: &[u8], dst: &mut [f32]) {
    for (block, out) in packed.chunks_exact(BLOCK_BYTES).zip(dst.chunks_mut(BLOCK_ELEMS)) {
        unpack_into(block, out);
    }
}

pub fn quantize(src: &[f32], dst: &mut Vec<u8>) {
    dst.clear();
    for chunk in src.chunks(BLOCK_ELEMS) {
        let max_abs = chunk.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        let scale = if max_abs == 0.0 { 1.0 } else { max_abs / 8.0 };
        dst.extend_from_slice(&f16::from_f32(scale).to_le_bytes());
        let mut padded = [0.0f32; BLOCK_ELEMS];
        padded[..chunk.len()].copy_from_slice(chunk);
        for i in 0..HALF {
            let low = ((padded[i] / scale).round().clamp(-8.0, 7.0) as i32 + 8) as u8;
            let high = ((padded[i + HALF] / scale).round().clamp(-8.0, 7.0) as i32 + 8) as u8;
            dst.push(low | (high << 4));
        }
    }
}

/// `C <- A . W^T` for a Q4_0-packed weight of `N` rows, `K` input features.
pub fn fused_matmul_f32_q(packed: &[u8], a: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    let blocks_per_row = k / BLOCK_ELEMS;
    let row_bytes = blocks_per_row * BLOCK_BYTES;
    let mut unpacked = [0.0f32; BLOCK_ELEMS];

    for col in 0..n {
        let w_row = &packed[col * row_bytes..(col + 1) * row_bytes];
        for row in 0..m {
            c[row * n + col] = 0.0;
        }
        for (b, block) in w_row.chunks_exact(BLOCK_BYTES).enumerate() {
            unpack_into(block, &mut unpacked);
            let k_start = b * BLOCK_ELEMS;
            for row in 0..m {
                let a_block = &a[row * k + k_start..row * k + k_start + BLOCK_ELEMS];
                let partial: f32 = a_block.iter().zip(unpacked.iter()).map(|(x, y)| x * y).sum();
                c[row * n + col] += partial;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_worst_case_error_bounded_by_scale() {
        let src: Vec<f32> = (0..32).map(|i| -1.0 + 2.0 * i as f32 / 31.0).collect();
        let mut packed = Vec::new();
        quantize(&src, &mut packed);
        let mut out = vec![0.0; 32];
        dequantize(&packed, &mut out);
        let scale = 1.0 / 8.0;
        for (a, b) in src.iter().zip(out.iter()) {
            assert!((a - b).abs() <= scale + 1e-6, "{a} vs {b}");
        }
    }
}
