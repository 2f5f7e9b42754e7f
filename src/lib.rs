//! Local, CPU-only inference runtime for decoder-only transformer language
//! models: GGUF loading, quantized tensor codecs, SIMD-dispatched kernels,
//! GQA attention with a KV cache, and a generation engine with sampling,
//! constrained decoding, and stop-sequence handling.
pub mod config;
pub mod constraints;
pub mod error;
pub mod forward;
pub mod gguf;
pub mod kernels;
pub mod kv_cache;
pub mod logging;
pub mod model;
pub mod quant;
pub mod sampling;
pub mod session;
pub mod tensor;
pub mod tokenizer;

pub use config::EngineConfig;
pub use error::{SmallMindError, SmallMindResult};
pub use gguf::load_model;
pub use model::Model;
pub use session::{FinishReason, GenerationOptions, GenerationResult, Session, SessionState, StreamControl};
