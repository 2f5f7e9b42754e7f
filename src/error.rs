/// Crate-wide error taxonomy.
///
/// `Cancelled`/`Timeout`/`ContextExhausted` are deliberately absent: they are
/// `FinishReason` values returned from the generation loop, not errors.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmallMindError {
    #[error("invalid GGUF format: {0}")]
    InvalidFormat(String),

    #[error("unsupported quantization scheme: {0}")]
    UnsupportedQuantization(String),

    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("session is busy with another generation call")]
    SessionBusy,

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type SmallMindResult<T> = Result<T, SmallMindError>;
