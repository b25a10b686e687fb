use std::fmt;

/// Errors shared across the sift crates.
///
/// Compilation itself accumulates located diagnostics rather than failing on
/// the first problem; those are carried by the compiler's own error type.
/// `SiftError` is the currency of everything else: native functions, value
/// helpers, and embedders.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SiftError {
    #[error("Compile error: {0}")]
    Compile(String),

    #[error("Type error: expected {expected}, got {got}")]
    Type { expected: String, got: String },

    #[error("Arity error: {name} expects {expected} args, got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("{0} is not defined")]
    Unbound(String),
}

impl SiftError {
    pub fn compile(msg: impl fmt::Display) -> Self {
        SiftError::Compile(msg.to_string())
    }

    pub fn type_error(expected: impl Into<String>, got: impl Into<String>) -> Self {
        SiftError::Type {
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn arity(name: impl Into<String>, expected: impl Into<String>, got: usize) -> Self {
        SiftError::Arity {
            name: name.into(),
            expected: expected.into(),
            got,
        }
    }
}
