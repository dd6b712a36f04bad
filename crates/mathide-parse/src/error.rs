//! Error types for the parse layer
//!
//! Every failure here is recoverable by the caller: the session treats it
//! as "no usable data this turn" and never aborts.

use crate::payload::PayloadShape;

/// Failure of one decode stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    /// Stage label (`direct`, `expression_repair`, ...)
    pub stage: &'static str,
    /// Decoder message for this stage
    pub message: String,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)
    }
}

/// Errors while turning model text into typed records
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// No bracketed payload of the expected shape in the text
    #[error("no structured {expected} payload present in model output")]
    NoPayload {
        /// Shape that was searched for
        expected: PayloadShape,
        /// Full model text
        original: String,
    },

    /// All decode stages exhausted
    #[error("could not decode model output after {} stages", .attempts.len())]
    ParseFailure {
        /// Text handed to the decoder
        original: String,
        /// One entry per attempted stage, in order
        attempts: Vec<StageFailure>,
    },

    /// Decoded, but required fields are absent
    #[error("{record} response is missing required fields: {}", .fields.join(", "))]
    MissingField {
        /// Record type name
        record: &'static str,
        /// Missing field names
        fields: Vec<&'static str>,
    },

    /// Decoded, but the value has the wrong shape or field types
    #[error("{record} response has unexpected shape: {message}")]
    InvalidShape {
        /// Record type name
        record: &'static str,
        /// What was wrong
        message: String,
    },
}

impl DecodeError {
    /// Structural failure (no payload or every stage failed)
    #[inline]
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::NoPayload { .. } | Self::ParseFailure { .. })
    }

    /// Field-level failure on an otherwise decodable payload
    #[inline]
    #[must_use]
    pub fn is_field_level(&self) -> bool {
        matches!(self, Self::MissingField { .. } | Self::InvalidShape { .. })
    }

    /// Original model text, when the failure carries it
    #[must_use]
    pub fn original_text(&self) -> Option<&str> {
        match self {
            Self::NoPayload { original, .. } | Self::ParseFailure { original, .. } => {
                Some(original)
            }
            _ => None,
        }
    }

    pub(crate) fn invalid_shape(record: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidShape {
            record,
            message: message.into(),
        }
    }
}
