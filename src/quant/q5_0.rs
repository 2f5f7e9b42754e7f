/// Q5_0: `[f16 scale][4 x u8 high bits][16 x u8 low nibbles]`, 22 bytes per
/// 32-element block. The 32 high bits are packed LSB-first across the 4
/// high-bit bytes; low nibbles follow the Q4_0 packing (byte `i` holds
/// elements `i` and `i+16`). Dequant: `((high<<4)|low - 16) * scale`.
use half::f16;

const BLOCK_ELEMS: usize = 32;
const BLOCK_BYTES: usize = 22;
const HALF: usize = 16;

fn high_bit(high_bytes: &[u8], i: usize) -> u32 {
    let byte = high_bytes[i / 8];
    ((byte >> (i % 8)) & 1) as u32
}

fn unpack_into(block: &[u8], out: &mut [f32]) {
    let scale = f16::from_le_bytes([block[0], block[1]]).to_f32();
    let high_bytes = &block[2..6];
    let low_nibbles = &block[6..6 + HALF];

    for i in 0..HALF {
        let byte = low_nibbles[i];
        let low_a = (byte & 0x0F) as u32;
        let low_b = ((byte >> 4) & 0x0F) as u32;
        let high_a = high_bit(high_bytes, i);
        let high_b = high_bit(high_bytes, i + HALF);
        out[i] = ((high_a << 4) | low_a) as f32 - 16.0;
        out[i + HALF] = ((high_b << 4) | low_b) as f32 - 16.0;
    }
    for v in out.iter_mut() {
        *v *= scale;
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
        let scale = if max_abs == 0.0 { 1.0 } else { max_abs / 16.0 };
        dst.extend_from_slice(&f16::from_f32(scale).to_le_bytes());

        let mut padded = [0.0f32; BLOCK_ELEMS];
        padded[..chunk.len()].copy_from_slice(chunk);
        let mut quantized = [0u32; BLOCK_ELEMS];
        for (q, &v) in quantized.iter_mut().zip(padded.iter()) {
            *q = ((v / scale).round() + 16.0).clamp(0.0, 31.0) as u32;
        }

        let mut high_bytes = [0u8; 4];
        for (i, &q) in quantized.iter().enumerate() {
            let bit = (q >> 4) & 1;
            high_bytes[i / 8] |= (bit as u8) << (i % 8);
        }
        dst.extend_from_slice(&high_bytes);

        for i in 0..HALF {
            let low_a = (quantized[i] & 0x0F) as u8;
            let low_b = (quantized[i + HALF] & 0x0F) as u8;
            dst.push(low_a | (low_b << 4));
        }
    }
}

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
    fn round_trip_within_tolerance() {
        let src: Vec<f32> = (0..32).map(|i| -1.0 + 2.0 * i as f32 / 31.0).collect();
        let mut packed = Vec::new();
        quantize(&src, &mut packed);
        let mut out = vec![0.0; 32];
        dequantize(&packed, &mut out);
        for (a, b) in src.iter().zip(out.iter()) {
            assert!((a - b).abs() < 0.08, "{a} vs {b}");
        }
    }
}
