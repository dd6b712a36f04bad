//! Payload location
//!
//! Model output usually wraps the structured payload in prose or code
//! fences. The payload is taken as the span from the first opening bracket
//! of the expected kind to the last closing bracket of that kind.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};

/// Kind of bracketed payload to search for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadShape {
    /// `[ ... ]`
    Array,
    /// `{ ... }`
    Object,
    /// Whichever bracket kind opens first
    Any,
}

impl PayloadShape {
    /// Opening and closing delimiters, `None` for [`PayloadShape::Any`]
    #[inline]
    #[must_use]
    pub fn delimiters(self) -> Option<(char, char)> {
        match self {
            Self::Array => Some(('[', ']')),
            Self::Object => Some(('{', '}')),
            Self::Any => None,
        }
    }
}

impl std::fmt::Display for PayloadShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Array => write!(f, "array"),
            Self::Object => write!(f, "object"),
            Self::Any => write!(f, "json"),
        }
    }
}

/// Extract the payload span of the given shape from model text
///
/// # Errors
///
/// Returns [`DecodeError::NoPayload`] when no opening bracket exists, no
/// closing bracket exists, or the last closing bracket precedes the first
/// opening one.
pub fn locate_payload(text: &str, shape: PayloadShape) -> Result<&str, DecodeError> {
    let (open, close) = match shape.delimiters() {
        Some(pair) => pair,
        None => match text.find(['{', '[']) {
            Some(idx) if text[idx..].starts_with('[') => ('[', ']'),
            Some(_) => ('{', '}'),
            None => return Err(no_payload(text, shape)),
        },
    };

    let start = text.find(open);
    let end = text.rfind(close);

    match (start, end) {
        (Some(start), Some(end)) if end > start => Ok(&text[start..=end]),
        _ => Err(no_payload(text, shape)),
    }
}

fn no_payload(text: &str, expected: PayloadShape) -> DecodeError {
    tracing::debug!(%expected, len = text.len(), "no payload located in model output");
    DecodeError::NoPayload {
        expected,
        original: text.to_owned(),
    }
}
