//! Resilient decoder
//!
//! Tries progressively more aggressive rewrites of the payload text until
//! one of them decodes:
//!
//! 1. the text as-is
//! 2. expression escape repair ([`repair_expression_escapes`])
//! 3. unrecognized escape doubling
//! 4. unrecognized escape stripping
//!
//! The first stage that decodes wins. The decoder holds no state and may
//! be shared freely across tasks.

use crate::error::{DecodeError, StageFailure};
use crate::repair::repair_expression_escapes;
use serde_json::Value;
use tracing::{debug, error};

/// One stage of the decode pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DecodeStage {
    /// Decode the text unchanged
    Direct,
    /// Double single-escaped known math commands inside string literals
    ExpressionRepair,
    /// Double every escape character that does not start a JSON escape
    EscapeDoubling,
    /// Delete every escape character that does not start a JSON escape
    EscapeStripping,
}

impl DecodeStage {
    /// All stages in the order they are attempted
    pub const ALL: [DecodeStage; 4] = [
        Self::Direct,
        Self::ExpressionRepair,
        Self::EscapeDoubling,
        Self::EscapeStripping,
    ];

    /// Stable label used in logs and diagnostics
    #[inline]
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::ExpressionRepair => "expression_repair",
            Self::EscapeDoubling => "escape_doubling",
            Self::EscapeStripping => "escape_stripping",
        }
    }

    /// 1-based position in the pipeline
    #[inline]
    #[must_use]
    pub fn number(self) -> usize {
        self as usize + 1
    }

    fn rewrite(self, text: &str) -> String {
        match self {
            Self::Direct => text.to_owned(),
            Self::ExpressionRepair => repair_expression_escapes(text),
            Self::EscapeDoubling => double_unrecognized_escapes(text),
            Self::EscapeStripping => strip_unrecognized_escapes(text),
        }
    }
}

impl std::fmt::Display for DecodeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A successfully decoded value and the stage that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Decoded structured value
    pub value: Value,
    /// Stage that succeeded
    pub stage: DecodeStage,
}

impl Decoded {
    /// Whether any rewrite was needed
    #[inline]
    #[must_use]
    pub fn was_repaired(&self) -> bool {
        self.stage != DecodeStage::Direct
    }
}

/// Multi-stage decoder for model output
#[derive(Debug, Clone, Copy, Default)]
pub struct ResilientDecoder;

impl ResilientDecoder {
    /// Create a decoder
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Decode text, trying each stage in order
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::ParseFailure`] with one [`StageFailure`] per
    /// stage when every stage fails.
    pub fn decode(&self, text: &str) -> Result<Decoded, DecodeError> {
        let mut attempts = Vec::with_capacity(DecodeStage::ALL.len());

        for stage in DecodeStage::ALL {
            let candidate = stage.rewrite(text);
            match serde_json::from_str::<Value>(&candidate) {
                Ok(value) => {
                    if stage != DecodeStage::Direct {
                        debug!(stage = %stage, "decoded model output after repair");
                    }
                    return Ok(Decoded { value, stage });
                }
                Err(err) => {
                    debug!(stage = %stage, error = %err, "decode stage failed");
                    attempts.push(StageFailure {
                        stage: stage.label(),
                        message: err.to_string(),
                    });
                }
            }
        }

        error!(
            stages = attempts.len(),
            original = %text,
            "all decode stages exhausted"
        );
        Err(DecodeError::ParseFailure {
            original: text.to_owned(),
            attempts,
        })
    }
}

/// Decode with a default [`ResilientDecoder`]
///
/// # Errors
///
/// See [`ResilientDecoder::decode`].
pub fn decode(text: &str) -> Result<Decoded, DecodeError> {
    ResilientDecoder::new().decode(text)
}

/// Stage 3: double escape characters that do not begin a JSON escape
///
/// `\"`, `\\`, `\/`, `\b`, `\f`, `\n`, `\r`, `\t` and `\u` followed by four
/// hex digits are copied through unchanged.
fn double_unrecognized_escapes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut idx = 0;

    while idx < chars.len() {
        let ch = chars[idx];
        if ch != '\\' {
            out.push(ch);
            idx += 1;
            continue;
        }
        match chars.get(idx + 1) {
            Some(&next @ ('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't')) => {
                out.push('\\');
                out.push(next);
                idx += 2;
            }
            Some('u') if is_unicode_escape(&chars[idx + 2..]) => {
                out.extend(&chars[idx..idx + 6]);
                idx += 6;
            }
            _ => {
                out.push_str("\\\\");
                idx += 1;
            }
        }
    }

    out
}

fn is_unicode_escape(rest: &[char]) -> bool {
    rest.len() >= 4 && rest[..4].iter().all(char::is_ascii_hexdigit)
}

/// Stage 4: drop escape characters that do not begin a valid JSON escape
fn strip_unrecognized_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some(&next @ ('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u')) => {
                out.push('\\');
                out.push(next);
                chars.next();
            }
            _ => {}
        }
    }

    out
}
