/// Q8_0: `[f16 scale][32 x i8]`, 34 bytes per 32-element block.
/// Dequant: `value = i8 * scale`.
use half::f16;

const BLOCK_ELEMS: usize = 32;
const BLOCK_BYTES: usize = 34;

fn read_scale(block: &[u8]) -> f32 {
    f16::from_le_bytes([block[0], block[1]]).to_f32()
}

fn unpack_into(block: &[u8], out: &mut [f32]) {
    let scale = read_scale(block);
    for (o, &byte) in out.iter_mut().zip(block[2..2 + BLOCK_ELEMS].iter()) {
        *o = (byte as i8) as f32 * scale;
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
        let scale = if max_abs == 0.0 { 1.0 } else { max_abs / 127.0 };
        dst.extend_from_slice(&f16::from_f32(scale).to_le_bytes());
        for &v in chunk {
            let q = (v / scale).round().clamp(-127.0, 127.0) as i8;
            dst.push(q as u8);
        }
        for _ in chunk.len()..BLOCK_ELEMS {
            dst.push(0);
        }
    }
}

/// `C <- A . W^T`. `W` packed rows = N output features, each row K/32 blocks.
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
