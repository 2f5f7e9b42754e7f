/// Q4_K: canonical llama.cpp K-quant layout, 256-element super-block, 144
/// bytes: `[f16 d][f16 dmin][12 bytes packed 6-bit scales/mins][128 bytes
/// 4-bit quants]`. The 128-byte `qs` region is split into two 64-byte halves
/// (one per 128 elements); within each half, byte `l` holds elements `l`
/// (low nibble) and `l+32` (high nibble) of a 64-element group, repeated
/// across four such groups. Eight 32-element sub-blocks each carry a 6-bit
/// scale `sc` and 6-bit min `m`: `value = d*sc*nibble - dmin*m`.
///
/// The 6-bit scale/min pairs are packed two-per-4-bits-extra across 12 bytes
/// using the scheme llama.cpp calls `get_scale_min_k4`: the first four bytes
/// hold sub-blocks 0-3's scales directly, the next four hold their mins, and
/// the last four hold sub-blocks 4-7's scale/min low nibbles, stealing the
/// high two bits of the first eight bytes for the extra precision.
use half::f16;

const SUPERBLOCK_ELEMS: usize = 256;
const SUPERBLOCK_BYTES: usize = 144;

fn get_scale_min(j: usize, q: &[u8]) -> (u8, u8) {
    if j < 4 {
        (q[j] & 0x3F, q[j + 4] & 0x3F)
    } else {
        let d = (q[j + 4] & 0x0F) | ((q[j - 4] >> 6) << 4);
        let m = (q[j + 4] >> 4) | ((q[j] >> 6) << 4);
        (d, m)
    }
}

fn set_scale_min(j: usize, d: u8, m: u8, q: &mut [u8]) {
    if j < 4 {
        q[j] = (q[j] & 0xC0) | (d & 0x3F);
        q[j + 4] = (q[j + 4] & 0xC0) | (m & 0x3F);
    } else {
        q[j + 4] = (d & 0x0F) | ((m & 0x0F) << 4);
        q[j - 4] = (q[j - 4] & 0x3F) | ((d & 0x30) << 2);
        q[j] = (q[j] & 0x3F) | ((m & 0x30) << 2);
    }
}

fn unpack_into(block: &[u8], out: &mut [f32]) {
    let d = f16::from_le_bytes([block[0], block[1]]).to_f32();
    let dmin = f16::from_le_bytes([block[2], block[3]]).to_f32();
    let scales = &block[4..16];
    let qs = &block[16..144];

    let mut is = 0;
    let mut y_off = 0;
    let mut q_off = 0;
    while y_off < SUPERBLOCK_ELEMS {
        let (sc1, m1) = get_scale_min(is, scales);
        let (sc2, m2) = get_scale_min(is + 1, scales);
        let d1 = d * sc1 as f32;
        let min1 = dmin * m1 as f32;
        let d2 = d * sc2 as f32;
        let min2 = dmin * m2 as f32;

        let q = &qs[q_off..q_off + 32];
        for l in 0..32 {
            out[y_off + l] = d1 * (q[l] & 0x0F) as f32 - min1;
        }
        for l in 0..32 {
            out[y_off + 32 + l] = d2 * (q[l] >> 4) as f32 - min2;
        }

        q_off += 32;
        y_off += 64;
        is += 2;
    }
}

pub fn dequantize(packed: &[u8], dst: &mut [f32]) {
    for (block, out) in packed
        .chunks_exact(SUPERBLOCK_BYTES)
        .zip(dst.chunks_mut(SUPERBLOCK_ELEMS))
    {
        unpack_into(block, out);
    }
}

pub fn quantize(src: &[f32], dst: &mut Vec<u8>) {
    dst.clear();
    for superblock in src.chunks(SUPERBLOCK_ELEMS) {
        let mut padded = [0.0f32; SUPERBLOCK_ELEMS];
        padded[..superblock.len()].copy_from_slice(superblock);

        let mut sub_scale = [0.0f32; 8];
        let mut sub_min = [0.0f32; 8];
        for sb in 0..8 {
            let chunk = &padded[sb * 32..sb * 32 + 32];
            let lo = chunk.iter().copied().fold(f32::INFINITY, f32::min);
            let hi = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            sub_min[sb] = lo;
            sub_scale[sb] = if hi > lo { (hi - lo) / 15.0 } else { 1.0 };
        }
        let d = sub_scale.iter().copied().fold(0.0f32, f32::max).max(1e-8) / 63.0;
        let dmin = sub_min
            .iter()
            .map(|m| m.abs())
            .fold(0.0f32, f32::max)
            .max(1e-8)
            / 63.0;

        let mut scale_codes = [0u8; 8];
        let mut min_codes = [0u8; 8];
        for sb in 0..8 {
            scale_codes[sb] = (sub_scale[sb] / d).round().clamp(0.0, 63.0) as u8;
            // m1 = dmin * m should equal -sub_min[sb]; dmin is positive so
            // only the sign-matching (negative) sub-block mins encode exactly.
            min_codes[sb] = (-sub_min[sb] / dmin).round().clamp(0.0, 63.0) as u8;
        }

        let mut scales_bytes = [0u8; 12];
        for is in 0..8 {
            set_scale_min(is, scale_codes[is], min_codes[is], &mut scales_bytes);
        }

        let mut qs = [0u8; 128];
        let mut q_off = 0;
        let mut y_off = 0;
        let mut is = 0;
        while y_off < SUPERBLOCK_ELEMS {
            let d1 = d * scale_codes[is] as f32;
            let min1 = dmin * min_codes[is] as f32;
            let d2 = d * scale_codes[is + 1] as f32;
            let min2 = dmin * min_codes[is + 1] as f32;
            for l in 0..32 {
                let lvl = if d1 != 0.0 {
                    ((padded[y_off + l] + min1) / d1).round().clamp(0.0, 15.0) as u8
                } else {
                    0
                };
                let hvl = if d2 != 0.0 {
                    ((padded[y_off + 32 + l] + min2) / d2).round().clamp(0.0, 15.0) as u8
                } else {
                    0
                };
                qs[q_off + l] = (qs[q_off + l] & 0xF0) | lvl;
                qs[q_off + l] = (qs[q_off + l] & 0x0F) | (hvl << 4);
            }
            q_off += 32;
            y_off += 64;
            is += 2;
        }

        dst.extend_from_slice(&f16::from_f32(d).to_le_bytes());
        dst.extend_from_slice(&f16::from_f32(dmin).to_le_bytes());
        dst.extend_from_slice(&scales_bytes);
        dst.extend_from_slice(&qs);
    }
}

/// `C <- A . W^T` for a Q4_K-packed weight.
pub fn fused_matmul_f32_q(packed: &[u8], a: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    let blocks_per_row = k / SUPERBLOCK_ELEMS;
    let row_bytes = blocks_per_row * SUPERBLOCK_BYTES;
    let mut unpacked = [0.0f32; SUPERBLOCK_ELEMS];

    for col in 0..n {
        let w_row = &packed[col * row_bytes..(col + 1) * row_bytes];
        for row in 0..m {
            c[row * n + col] = 0.0;
        }
        for (b, block) in w_row.chunks_exact(SUPERBLOCK_BYTES).enumerate() {
            unpack_into(block, &mut unpacked);
            let k_start = b * SUPERBLOCK_ELEMS;
            for row in 0..m {
                let a_block = &a[row * k + k_start..row * k + k_start + SUPERBLOCK_ELEMS];
                let partial: f32 = a_block.iter().zip(unpacked.iter()).map(|(x, y)| x * y).sum();
                c[row * n + col] += partial;
            }
        }
    }
}
