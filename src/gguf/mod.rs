/// GGUF binary format: on-disk types plus the loader that assembles a `Model`.
pub mod format;
pub mod loader;

pub use format::{GgufDType, GgufHeader, GgufValue, GgufValueType, TensorInfo, GGUF_MAGIC};
pub use loader::load_model;
