use crate::numeric::NumericKind;

use thiserror::Error;

/// Crate-wide error type. Every pipeline entry point reports failures
/// through one of these variants so callers can tell input-compatibility
/// problems, parse errors, I/O failures and capability-negotiation failures
/// apart without matching on message text.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Inputs cannot be processed together (mismatched geometry, numeric
    /// kind, multi-file input to a non-container target, ...).
    #[error("incompatible input: {0}")]
    Incompatible(String),

    /// Malformed expression syntax.
    #[error("syntax error at byte {position}: {message}")]
    Parse { position: usize, message: String },

    /// No registered converter claims the file and no fallback is set,
    /// or no converter declares the requested target extension.
    #[error("no converter for {0}")]
    NoConverter(String),

    /// The operation has no implementation for this numeric kind.
    #[error("{operation} not supported for {kind}")]
    Unsupported {
        operation: &'static str,
        kind: NumericKind,
    },

    /// A dataset or mesh file could not be opened or is not valid.
    #[error("could not open {0}")]
    OpenFailed(String),

    /// The file is not a valid container, or a block is malformed.
    #[error("container error: {0}")]
    Container(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConvertError>;
