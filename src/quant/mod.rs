/// Quantized tensor formats and fused dequant+matmul kernels.
///
/// `QuantizedTensor` is a tagged variant over the six supported block codecs;
/// `Weight` layers `DenseF32`/`Quantized` on top as the unit actually stored in
/// a `Model`. Match once on the variant in the outer loop of a forward pass —
/// never per block.
pub mod q4_0;
pub mod q4_1;
pub mod q4_k;
pub mod q5_0;
pub mod q6_k;
pub mod q8_0;

use crate::error::{SmallMindError, SmallMindResult};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantScheme {
    Q4_0,
    Q4_1,
    Q5_0,
    Q8_0,
    Q4K,
    Q6K,
}

impl QuantScheme {
    /// Elements per block for this scheme (32 for the legacy schemes, 256 for
    /// the K-quant super-blocks).
    pub fn block_size(self) -> usize {
        match self {
            QuantScheme::Q4_0 | QuantScheme::Q4_1 | QuantScheme::Q5_0 | QuantScheme::Q8_0 => 32,
            QuantScheme::Q4K | QuantScheme::Q6K => 256,
        }
    }

    /// Packed bytes per block.
    pub fn bytes_per_block(self) -> usize {
        match self {
            QuantScheme::Q4_0 => 18,
            QuantScheme::Q4_1 => 20,
            QuantScheme::Q5_0 => 22,
            QuantScheme::Q8_0 => 34,
            QuantScheme::Q4K => 144,
            QuantScheme::Q6K => 210,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QuantScheme::Q4_0 => "Q4_0",
            QuantScheme::Q4_1 => "Q4_1",
            QuantScheme::Q5_0 => "Q5_0",
            QuantScheme::Q8_0 => "Q8_0",
            QuantScheme::Q4K => "Q4_K",
            QuantScheme::Q6K => "Q6_K",
        }
    }
}

/// A quantized weight matrix: logical `[rows, cols]` shape plus a packed byte
/// buffer laid out as consecutive fixed-size blocks.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    pub scheme: QuantScheme,
    pub rows: usize,
    pub cols: usize,
    pub packed: Vec<u8>,
}

impl QuantizedTensor {
    pub fn new(scheme: QuantScheme, rows: usize, cols: usize, packed: Vec<u8>) -> SmallMindResult<Self> {
        let total = rows * cols;
        let block_size = scheme.block_size();
        if total % block_size != 0 {
            return Err(SmallMindError::ShapeMismatch(format!(
                "{} elements not a multiple of block size {} for {}",
                total,
                block_size,
                scheme.name()
            )));
        }
        let num_blocks = total / block_size;
        let expected_bytes = num_blocks * scheme.bytes_per_block();
        if packed.len() != expected_bytes {
            return Err(SmallMindError::ShapeMismatch(format!(
                "packed buffer is {} bytes, expected {} for {} blocks of {}",
                packed.len(),
                expected_bytes,
                num_blocks,
                scheme.name()
            )));
        }
        Ok(Self {
            scheme,
            rows,
            cols,
            packed,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.rows * self.cols / self.scheme.block_size()
    }

    /// Decode every block into `dst` (length `rows * cols`).
    pub fn dequantize(&self, dst: &mut [f32]) {
        debug_assert_eq!(dst.len(), self.rows * self.cols);
        match self.scheme {
            QuantScheme::Q4_0 => q4_0::dequantize(&self.packed, dst),
            QuantScheme::Q4_1 => q4_1::dequantize(&self.packed, dst),
            QuantScheme::Q5_0 => q5_0::dequantize(&self.packed, dst),
            QuantScheme::Q8_0 => q8_0::dequantize(&self.packed, dst),
            QuantScheme::Q4K => q4_k::dequantize(&self.packed, dst),
            QuantScheme::Q6K => q6_k::dequantize(&self.packed, dst),
        }
    }

    /// Allocate a dense tensor and dequantize into it. Convenience wrapper
    /// around `dequantize` for tests and the fused-kernel validation helper.
    pub fn to_f32(&self) -> Tensor {
        let mut out = Tensor::zeros(vec![self.rows, self.cols]);
        self.dequantize(out.as_mut_slice());
        out
    }

    /// `C <- A . W^T` without materializing a dense copy of `W`. `A: [M,K]`,
    /// `W`: rows=N output features, cols=K input features, `C: [M,N]`.
    pub fn fused_matmul_f32_q(&self, a: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
        debug_assert_eq!(self.cols, k);
        debug_assert_eq!(self.rows, n);
        debug_assert_eq!(a.len(), m * k);
        debug_assert_eq!(c.len(), m * n);
        match self.scheme {
            QuantScheme::Q4_0 => q4_0::fused_matmul_f32_q(&self.packed, a, c, m, k, n),
            QuantScheme::Q4_1 => q4_1::fused_matmul_f32_q(&self.packed, a, c, m, k, n),
            QuantScheme::Q5_0 => q5_0::fused_matmul_f32_q(&self.packed, a, c, m, k, n),
            QuantScheme::Q8_0 => q8_0::fused_matmul_f32_q(&self.packed, a, c, m, k, n),
            QuantScheme::Q4K => q4_k::fused_matmul_f32_q(&self.packed, a, c, m, k, n),
            QuantScheme::Q6K => q6_k::fused_matmul_f32_q(&self.packed, a, c, m, k, n),
        }
    }
}

/// `DenseF32` or `Quantized`, the two shapes a loaded weight tensor takes.
#[derive(Debug, Clone)]
pub enum Weight {
    DenseF32(Tensor),
    Quantized(QuantizedTensor),
}

impl Weight {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Weight::DenseF32(t) => {
                let s = t.shape();
                (s[0], s.get(1).copied().unwrap_or(1))
            }
            Weight::Quantized(q) => (q.rows, q.cols),
        }
    }

    /// Materialize as a dense f32 tensor, dequantizing if needed.
    pub fn to_f32(&self) -> Tensor {
        match self {
            Weight::DenseF32(t) => t.clone(),
            Weight::Quantized(q) => q.to_f32(),
        }
    }

    /// `C <- A . W^T`, dispatching to the fused kernel for quantized weights
    /// or a dense matmul-transpose-b for f32 weights.
    pub fn matmul_transpose_b(&self, a: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
        match self {
            Weight::DenseF32(t) => {
                crate::kernels::matmul_transpose_b(a, t.as_slice(), c, m, k, n);
            }
            Weight::Quantized(q) => q.fused_matmul_f32_q(a, c, m, k, n),
        }
    }
}

/// `max(|fused_matmul(A,W) - matmul(A, dequantize(W))|)` tolerance helper used
/// by the correctness tests in `spec.md` §8.
pub fn validate_fused_matmul(q: &QuantizedTensor, a: &[f32], m: usize, k: usize, n: usize) -> f32 {
    let mut fused = vec![0.0f32; m * n];
    q.fused_matmul_f32_q(a, &mut fused, m, k, n);

    let dense = q.to_f32();
    let mut reference = vec![0.0f32; m * n];
    crate::kernels::matmul_transpose_b(a, dense.as_slice(), &mut reference, m, k, n);

    fused
        .iter()
        .zip(reference.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
