//! Fused quantized matmul vs. dequantize-then-matmul, across every block
//! codec. The fused kernel should win once `k`/`n` are large enough that
//! dequantizing the whole weight matrix dominates the dense matmul itself.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use smallmind_core::kernels::matmul_transpose_b;
use smallmind_core::quant::{q4_0, q4_1, q4_k, q5_0, q6_k, q8_0, QuantScheme, QuantizedTensor};

const M: usize = 4;
const K: usize = 4096;
const N: usize = 4096;

fn random_activations(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 2654435761) % 1009) as f32 / 1009.0 - 0.5).collect()
}

fn random_weights(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 40503) % 2003) as f32 / 2003.0 - 0.5).collect()
}

fn quantized_weight(scheme: QuantScheme, rows: usize, cols: usize) -> QuantizedTensor {
    let dense = random_weights(rows * cols);
    let mut packed = Vec::new();
    match scheme {
        QuantScheme::Q4_0 => q4_0::quantize(&dense, &mut packed),
        QuantScheme::Q4_1 => q4_1::quantize(&dense, &mut packed),
        QuantScheme::Q5_0 => q5_0::quantize(&dense, &mut packed),
        QuantScheme::Q8_0 => q8_0::quantize(&dense, &mut packed),
        QuantScheme::Q4K => q4_k::quantize(&dense, &mut packed),
        QuantScheme::Q6K => q6_k::quantize(&dense, &mut packed),
    }
    QuantizedTensor::new(scheme, rows, cols, packed).unwrap()
}

fn bench_scheme(c: &mut Criterion, scheme: QuantScheme) {
    let mut group = c.benchmark_group(format!("quantized_matmul/{}", scheme.name()));
    let weight = quantized_weight(scheme, N, K);
    let activations = random_activations(M * K);
    let mut out = vec![0.0f32; M * N];
    let mut dense = vec![0.0f32; N * K];

    group.bench_function(BenchmarkId::new("fused", scheme.name()), |b| {
        b.iter(|| {
            weight.fused_matmul_f32_q(&activations, &mut out, M, K, N);
        });
    });

    group.bench_function(BenchmarkId::new("dequantize_then_matmul", scheme.name()), |b| {
        b.iter(|| {
            weight.dequantize(&mut dense);
            matmul_transpose_b(&activations, &dense, &mut out, M, K, N);
        });
    });

    group.finish();
}

fn bench_all_schemes(c: &mut Criterion) {
    for scheme in [
        QuantScheme::Q4_0,
        QuantScheme::Q4_1,
        QuantScheme::Q5_0,
        QuantScheme::Q8_0,
        QuantScheme::Q4K,
        QuantScheme::Q6K,
    ] {
        bench_scheme(c, scheme);
    }
}

criterion_group!(benches, bench_all_schemes);
criterion_main!(benches);
