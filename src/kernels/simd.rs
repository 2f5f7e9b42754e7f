/// Runtime CPU feature detection, memoized once per process.
///
/// This is the concrete mechanism behind "dispatch at runtime to the best
/// available SIMD path": callers probe `CpuFeatures::detect()` once and pick a
/// code path; per-call detection would reintroduce branch overhead on the hot
/// matmul loop.
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuFeatures {
    pub avx512f: bool,
    pub avx2: bool,
    pub fma: bool,
    pub neon: bool,
}

impl CpuFeatures {
    fn probe() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            CpuFeatures {
                avx512f: is_x86_feature_detected!("avx512f"),
                avx2: is_x86_feature_detected!("avx2"),
                fma: is_x86_feature_detected!("fma"),
                neon: false,
            }
        }
        #[cfg(target_arch = "aarch64")]
        {
            CpuFeatures {
                avx512f: false,
                avx2: false,
                fma: false,
                neon: std::arch::is_aarch64_feature_detected!("neon"),
            }
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            CpuFeatures {
                avx512f: false,
                avx2: false,
                fma: false,
                neon: false,
            }
        }
    }

    /// The process-wide feature set, detected on first call and cached.
    pub fn detect() -> Self {
        static CACHE: OnceLock<CpuFeatures> = OnceLock::new();
        *CACHE.get_or_init(Self::probe)
    }

    /// Which dispatch path `matmul`/`fused_matmul_f32_q` should take.
    pub fn best_path(&self) -> SimdPath {
        if self.avx512f {
            SimdPath::Avx512
        } else if self.avx2 && self.fma {
            SimdPath::Avx2Fma
        } else if self.neon {
            SimdPath::Neon
        } else {
            SimdPath::Scalar
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdPath {
    Avx512,
    Avx2Fma,
    Neon,
    Scalar,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_is_stable_across_calls() {
        assert_eq!(CpuFeatures::detect(), CpuFeatures::detect());
    }

    #[test]
    fn best_path_is_consistent_with_flags() {
        let f = CpuFeatures::detect();
        let path = f.best_path();
        if f.avx512f {
            assert_eq!(path, SimdPath::Avx512);
        } else if !f.avx2 && !f.neon {
            assert_eq!(path, SimdPath::Scalar);
        }
    }
}
