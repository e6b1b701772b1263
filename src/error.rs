use std::fmt::{Display, Formatter};

use crate::nn::Loss;

///
/// Error type for all fallible operations of this crate.
///
/// Every variant is a deterministic input-validation failure: none of them
/// are transient, so callers should not retry, and none of them are ever
/// substituted with a "nearby" valid input (e.g. a key at an adjacent level).
///
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The supplied context is not a valid leveled context, e.g. its
    /// modulus chain is empty or its parameters are inconsistent.
    InvalidContext { reason: String },
    /// A key or context was requested at a level outside `1..=chain_len`.
    LevelOutOfRange { level: usize, chain_len: usize },
    /// A rotation key was requested at a level that was deliberately
    /// skipped during generation.
    MissingRotationKey { level: usize },
    /// The loss/activation pairing is outside the supported set
    /// (categorical cross-entropy + softmax, or mean squared error).
    UnsupportedLoss { loss: Loss },
    /// Prediction and label tensors have diverging shapes.
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },
}

impl Error {
    pub(crate) fn invalid_context<S: Into<String>>(reason: S) -> Self {
        Error::InvalidContext { reason: reason.into() }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidContext { reason } => {
                write!(f, "invalid leveled context: {}", reason)
            }
            Error::LevelOutOfRange { level, chain_len } => {
                write!(f, "level {} is outside the chain's valid range 1..={}", level, chain_len)
            }
            Error::MissingRotationKey { level } => {
                write!(f, "no rotation key was generated for level {}; it was in the skip set", level)
            }
            Error::UnsupportedLoss { loss } => {
                write!(
                    f,
                    "unsupported loss {:?}; only categorical cross-entropy with softmax and mean squared error are supported",
                    loss
                )
            }
            Error::ShapeMismatch { expected, actual } => {
                write!(f, "predictions and labels must have the same shape, got {:?} and {:?}", expected, actual)
            }
        }
    }
}

impl std::error::Error for Error {}

#[test]
fn test_error_messages_carry_payload() {
    let err = Error::LevelOutOfRange { level: 7, chain_len: 3 };
    assert!(err.to_string().contains("level 7"));
    assert!(err.to_string().contains("1..=3"));

    let err = Error::MissingRotationKey { level: 2 };
    assert!(err.to_string().contains("level 2"));

    let err = Error::ShapeMismatch { expected: vec![8, 10], actual: vec![8, 3] };
    assert!(err.to_string().contains("[8, 10]"));
    assert!(err.to_string().contains("[8, 3]"));
}
