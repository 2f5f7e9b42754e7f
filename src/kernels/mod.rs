/// Numeric kernels: matmul, activations, normalization, rotary embedding.
///
/// Kernels never allocate and never fail at runtime; shape mismatches are
/// precondition violations caught by `debug_assert!` only (release builds
/// trust the caller, per the forward pass's zero-allocation hot path).
pub mod activation;
pub mod matmul;
pub mod norm;
pub mod rope;
pub mod simd;

pub use activation::{gelu_inplace, silu_inplace, softmax_row};
pub use matmul::{matmul, matmul_transpose_b};
pub use norm::{layernorm, rmsnorm};
pub use rope::rope;
pub use simd::CpuFeatures;
