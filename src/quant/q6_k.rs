/// Q6_K: canonical llama.cpp K-quant layout, 256-element super-block, 210
/// bytes: `[128 bytes low-4-bit quants][64 bytes high-2-bit quants][16
/// signed-8-bit sub-block scales][f16 d]`. Sixteen 16-element sub-blocks
/// each share one `int8` scale; the 6-bit quant level (range -32..31) is
/// split across a 4-bit field in `ql` and a 2-bit field in `qh`, reassembled
/// and recentered by subtracting 32. `value = d * scale[sub] * level`.
use half::f16;

const SUPERBLOCK_ELEMS: usize = 256;
const SUPERBLOCK_BYTES: usize = 210;

fn unpack_into(block: &[u8], out: &mut [f32]) {
    let ql_all = &block[0..128];
    let qh_all = &block[128..192];
    let sc_all = &block[192..208];
    let d = f16::from_le_bytes([block[208], block[209]]).to_f32();

    for half_idx in 0..2 {
        let ql = &ql_all[half_idx * 64..half_idx * 64 + 64];
        let qh = &qh_all[half_idx * 32..half_idx * 32 + 32];
        let sc = &sc_all[half_idx * 8..half_idx * 8 + 8];
        let y = &mut out[half_idx * 128..half_idx * 128 + 128];

        for l in 0..32 {
            let is = l / 16;
            let q1 = (((ql[l] & 0x0F) | (((qh[l] >> 0) & 3) << 4)) as i32 - 32) as f32;
            let q2 = (((ql[l + 32] & 0x0F) | (((qh[l] >> 2) & 3) << 4)) as i32 - 32) as f32;
            let q3 = (((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) as i32 - 32) as f32;
            let q4 = (((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) as i32 - 32) as f32;

            y[l] = d * (sc[is] as i8) as f32 * q1;
            y[l + 32] = d * (sc[is + 2] as i8) as f32 * q2;
            y[l + 64] = d * (sc[is + 4] as i8) as f32 * q3;
            y[l + 96] = d * (sc[is + 6] as i8) as f32 * q4;
        }
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

        let mut sub_scale = [0.0f32; 16];
        for sb in 0..16 {
            let chunk = &padded[sb * 16..sb * 16 + 16];
            let max_abs = chunk.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
            sub_scale[sb] = max_abs / 31.0;
        }
        let d = sub_scale.iter().copied().fold(0.0f32, f32::max).max(1e-8) / 127.0;

        let mut sc_codes = [0i8; 16];
        for sb in 0..16 {
            sc_codes[sb] = (sub_scale[sb] / d).round().clamp(0.0, 127.0) as i8;
        }

        let mut ql = [0u8; 128];
        let mut qh = [0u8; 64];

        for half_idx in 0..2 {
            let base = half_idx * 128;
            let ql_out = &mut ql[half_idx * 64..half_idx * 64 + 64];
            let qh_out = &mut qh[half_idx * 32..half_idx * 32 + 32];
            let sc = &sc_codes[half_idx * 8..half_idx * 8 + 8];

            for l in 0..32 {
                let is = l / 16;
                let scale1 = d * sc[is] as f32;
                let scale2 = d * sc[is + 2] as f32;
                let scale3 = d * sc[is + 4] as f32;
                let scale4 = d * sc[is + 6] as f32;

                let level = |v: f32, s: f32| -> u8 {
                    if s == 0.0 {
                        32
                    } else {
                        ((v / s).round() + 32.0).clamp(0.0, 63.0) as u8
                    }
                };

                let lvl1 = level(padded[base + l], scale1);
                let lvl2 = level(padded[base + 32 + l], scale2);
                let lvl3 = level(padded[base + 64 + l], scale3);
                let lvl4 = level(padded[base + 96 + l], scale4);

                ql_out[l] = (ql_out[l] & 0xF0) | (lvl1 & 0x0F);
                ql_out[l + 32] = (ql_out[l + 32] & 0xF0) | (lvl2 & 0x0F);
                ql_out[l] |= (lvl3 & 0x0F) << 4;
                ql_out[l + 32] |= (lvl4 & 0x0F) << 4;

                qh_out[l] |= (lvl1 >> 4) << 0;
                qh_out[l] |= (lvl2 >> 4) << 2;
                qh_out[l] |= (lvl3 >> 4) << 4;
                qh_out[l] |= (lvl4 >> 4) << 6;
            }
        }

        dst.extend_from_slice(&ql);
        dst.extend_from_slice(&qh);
        for &s in sc_codes.iter() {
            dst.push(s as u8);
        }
        dst.extend_from_slice(&f16::from_f32(d).to_le_bytes());
    }
}

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
