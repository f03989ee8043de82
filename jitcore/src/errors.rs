use std::error::Error;
use thiserror::Error;

/// A failure to compile a function.
///
/// A failed compilation never produces code: the caller keeps running whatever tier it was
/// running before and decides for itself whether to try again.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("General error: {0}")]
    /// The input handed to us by the instruction selection layer was ill-formed.
    General(String),
    #[error("Internal error: {0}")]
    /// Something went wrong when compiling that is probably the result of a bug in jitcore (e.g.
    /// a live value ended up with neither a register nor a stack slot, or the encoded buffer
    /// failed its integrity check).
    InternalError(String),
    #[error("Limit exceeded: {0}")]
    /// A limit was exceeded (e.g. a call with more arguments than we can pass in registers, or
    /// more values than an index type can represent).
    LimitExceeded(String),
    #[error("Resource exhausted: {0}")]
    /// Compilation failed because an external resource (normally memory) was exhausted.
    ResourceExhausted(Box<dyn Error + Send + Sync>),
}

impl From<std::collections::TryReserveError> for CompilationError {
    fn from(e: std::collections::TryReserveError) -> Self {
        CompilationError::ResourceExhausted(Box::new(e))
    }
}
