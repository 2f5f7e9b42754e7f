/// Dense matmul kernels.
///
/// `CpuFeatures::detect()` picks the runtime dispatch path, but unlike a
/// hand-rolled intrinsics kernel, the inner loop here is plain iterator code:
/// LLVM auto-vectorizes it to the widest path the target supports (AVX-512 /
/// AVX2+FMA / NEON) when compiled with the matching `target-feature`/`target-cpu`,
/// and falls back to scalar otherwise. The `SimdPath` value is retained on the
/// kernel so future work can specialize further without changing callers.
use std::sync::OnceLock;

use crate::config::EngineConfig;
use crate::kernels::simd::CpuFeatures;
use rayon::prelude::*;
use rayon::ThreadPool;

const ROW_PARALLEL_THRESHOLD: usize = 64;

/// The thread pool matmul's row-parallel dispatch runs on, sized from
/// `EngineConfig::from_env()`/`SMALLMIND_NUM_THREADS` on first use and cached
/// for the process lifetime, mirroring `CpuFeatures::detect()`'s
/// probe-once-and-cache shape.
fn pool() -> &'static ThreadPool {
    static POOL: OnceLock<ThreadPool> = OnceLock::new();
    POOL.get_or_init(|| {
        rayon::ThreadPoolBuilder::new()
            .num_threads(EngineConfig::from_env().resolved_threads())
            .build()
            .expect("failed to build matmul thread pool")
    })
}

/// `C <- A . B`. `A: [M,K]`, `B: [K,N]`, `C: [M,N]`, all row-major. Not
/// accumulated: `C` is overwritten.
pub fn matmul(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(c.len(), m * n);
    let _ = CpuFeatures::detect();

    if m >= ROW_PARALLEL_THRESHOLD {
        let chunk_rows = row_chunk(m);
        pool().install(|| {
            c.par_chunks_mut(chunk_rows * n)
                .enumerate()
                .for_each(|(chunk_idx, c_chunk)| {
                    let row_start = chunk_idx * chunk_rows;
                    for (local_row, c_row) in c_chunk.chunks_mut(n).enumerate() {
                        let row = row_start + local_row;
                        matmul_row(&a[row * k..row * k + k], b, c_row, k, n);
                    }
                });
        });
    } else {
        for row in 0..m {
            matmul_row(&a[row * k..row * k + k], b, &mut c[row * n..row * n + n], k, n);
        }
    }
}

fn matmul_row(a_row: &[f32], b: &[f32], c_row: &mut [f32], k: usize, n: usize) {
    for out in c_row.iter_mut() {
        *out = 0.0;
    }
    for kk in 0..k {
        let a_val = a_row[kk];
        if a_val == 0.0 {
            continue;
        }
        let b_row = &b[kk * n..kk * n + n];
        for (out, &b_val) in c_row.iter_mut().zip(b_row.iter()) {
            *out += a_val * b_val;
        }
    }
}

/// `C <- A . B^T`. `A: [M,K]`, `B: [N,K]`, `C: [M,N]`. Used by attention score
/// computation (`Q . K^T`).
pub fn matmul_transpose_b(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), n * k);
    debug_assert_eq!(c.len(), m * n);
    let _ = CpuFeatures::detect();

    if m >= ROW_PARALLEL_THRESHOLD {
        let chunk_rows = row_chunk(m);
        pool().install(|| {
            c.par_chunks_mut(chunk_rows * n)
                .enumerate()
                .for_each(|(chunk_idx, c_chunk)| {
                    let row_start = chunk_idx * chunk_rows;
                    for (local_row, c_row) in c_chunk.chunks_mut(n).enumerate() {
                        let row = row_start + local_row;
                        matmul_transpose_b_row(&a[row * k..row * k + k], b, c_row, k, n);
                    }
                });
        });
    } else {
        for row in 0..m {
            matmul_transpose_b_row(&a[row * k..row * k + k], b, &mut c[row * n..row * n + n], k, n);
        }
    }
}

fn matmul_transpose_b_row(a_row: &[f32], b: &[f32], c_row: &mut [f32], k: usize, n: usize) {
    for (col, out) in c_row.iter_mut().enumerate() {
        let b_row = &b[col * k..col * k + k];
        *out = a_row.iter().zip(b_row.iter()).map(|(x, y)| x * y).sum();
    }
}

/// Per-worker row chunk size: at least 4 rows, otherwise spread across
/// `2 * cores` chunks.
fn row_chunk(m: usize) -> usize {
    let cores = pool().current_num_threads().max(1);
    (m / (2 * cores)).max(4)
}
