/// Q4_1: `[f16 scale][f16 min][16 x u8 nibbles]`, 20 bytes per 32-element
/// block. Dequant: `nibble * scale + min`.
use half::f16;

const BLOCK_ELEMS: usize = 32;
const BLOCK_BYTES: usize = 20;
const HALF: usize = 16;

fn unpack_into(block: &[u8], out: &mut [f32]) {
    let scale = f16::from_le_bytes([block[0], block[1]]).to_f32();
    let min = f16::from_le_bytes([block[2], block[3]]).to_f32();
    let nibbles = &block[4..4 + HALF];
    for (i, &byte) in nibbles.iter().enumerate() {
        let low = (byte & 0x0F) as f32;
        let high = ((byte >> 4) & 0x0F) as f32;
        out[i] = low * scale + min;
        out[i + HALF] = high * scale + min;
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
        let min = chunk.iter().copied().fold(f32::INFINITY, f32::min);
        let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let min = if min.is_finite() { min } else { 0.0 };
        let max = if max.is_finite() { max } else { 0.0 };
        let scale = if max > min { (max - min) / 15.0 } else { 1.0 };
        dst.extend_from_slice(&f16::from_f32(scale).to_le_bytes());
        dst.extend_from_slice(&f16::from_f32(min).to_le_bytes());
        let mut padded = [0.0f32; BLOCK_ELEMS];
        padded[..chunk.len()].copy_from_slice(chunk);
        for i in 0..HALF {
            let low = ((padded[i] - min) / scale).round().clamp(0.0, 15.0) as u8;
            let high = ((padded[i + HALF] - min) / scale).round().clamp(0.0, 15.0) as u8;
            dst.push(low | (high << 4));
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
