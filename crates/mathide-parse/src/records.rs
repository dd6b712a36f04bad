//! Typed response records
//!
//! Each model operation answers with a fixed shape. Records declare their
//! required fields so that a payload missing them is rejected with a
//! [`DecodeError::MissingField`] naming every absent field, instead of a
//! generic deserialization message.
//!
//! Generation responses are handled element by element: a malformed element
//! is dropped with a warning and the rest are kept.

use crate::decoder::ResilientDecoder;
use crate::error::DecodeError;
use crate::payload::{locate_payload, PayloadShape};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// A required field and the alternative keys accepted for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Canonical key
    pub name: &'static str,
    /// Alternative keys models are known to use
    pub aliases: &'static [&'static str],
}

impl Field {
    /// Field with no aliases
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self { name, aliases: &[] }
    }

    /// Field with alternative keys
    #[must_use]
    pub const fn with_aliases(name: &'static str, aliases: &'static [&'static str]) -> Self {
        Self { name, aliases }
    }

    /// Whether the object carries this field under any accepted key
    #[must_use]
    pub fn is_present(&self, object: &Map<String, Value>) -> bool {
        std::iter::once(self.name)
            .chain(self.aliases.iter().copied())
            .any(|key| object.get(key).is_some_and(|v| !v.is_null()))
    }

    /// Move a value found under an alternative key to the canonical key
    ///
    /// A non-null canonical value wins. Alternative keys are removed, so
    /// each field reaches deserialization exactly once.
    pub fn canonicalize(&self, object: &mut Map<String, Value>) {
        for alias in self.aliases {
            let Some(value) = object.remove(*alias) else {
                continue;
            };
            let vacant = !object.get(self.name).is_some_and(|v| !v.is_null());
            if vacant && !value.is_null() {
                object.insert(self.name.to_owned(), value);
            }
        }
    }
}

/// A response shape with required fields enforced at decode time
pub trait ResponseRecord: DeserializeOwned {
    /// Short name used in errors
    const NAME: &'static str;

    /// Payload kind to locate in the model text
    const SHAPE: PayloadShape = PayloadShape::Object;

    /// Fields that must be present
    const REQUIRED: &'static [Field];

    /// Fold alternative keys of every required field into their canonical key
    fn canonicalize(object: &mut Map<String, Value>) {
        for field in Self::REQUIRED {
            field.canonicalize(object);
        }
    }

    /// Names of required fields absent from `object`
    fn missing_fields(object: &Map<String, Value>) -> Vec<&'static str> {
        Self::REQUIRED
            .iter()
            .filter(|field| !field.is_present(object))
            .map(|field| field.name)
            .collect()
    }
}

/// Locate, decode and validate a single record from model text
///
/// # Errors
///
/// - [`DecodeError::NoPayload`] when no bracketed object is present
/// - [`DecodeError::ParseFailure`] when every decode stage fails
/// - [`DecodeError::MissingField`] when required fields are absent
/// - [`DecodeError::InvalidShape`] when a field has the wrong type
pub fn read_record<R: ResponseRecord>(text: &str) -> Result<R, DecodeError> {
    let payload = locate_payload(text, R::SHAPE)?;
    let decoded = ResilientDecoder::new().decode(payload)?;
    debug!(record = R::NAME, stage = %decoded.stage, "decoded response payload");

    let Value::Object(mut object) = decoded.value else {
        return Err(DecodeError::invalid_shape(R::NAME, "expected a JSON object"));
    };

    R::canonicalize(&mut object);
    let missing = R::missing_fields(&object);
    if !missing.is_empty() {
        warn!(record = R::NAME, missing = ?missing, "response is missing required fields");
        return Err(DecodeError::MissingField {
            record: R::NAME,
            fields: missing,
        });
    }

    serde_json::from_value(Value::Object(object))
        .map_err(|err| DecodeError::invalid_shape(R::NAME, err.to_string()))
}

/// Locate and decode a generation response, keeping every valid element
///
/// Elements that are not objects, lack a required field, or have fields of
/// the wrong type are dropped with a warning. An empty result is not an
/// error.
///
/// # Errors
///
/// Structural failures only: no array payload, all decode stages failed, or
/// the decoded payload is not an array.
pub fn read_generation(text: &str) -> Result<Vec<GenerationItem>, DecodeError> {
    let payload = locate_payload(text, GenerationItem::SHAPE)?;
    let decoded = ResilientDecoder::new().decode(payload)?;

    let Value::Array(elements) = decoded.value else {
        return Err(DecodeError::invalid_shape(
            GenerationItem::NAME,
            "expected a JSON array",
        ));
    };

    let total = elements.len();
    let items: Vec<GenerationItem> = elements
        .into_iter()
        .enumerate()
        .filter_map(|(index, element)| read_generation_item(index, element))
        .collect();

    if items.len() < total {
        warn!(
            kept = items.len(),
            dropped = total - items.len(),
            "dropped malformed generation elements"
        );
    }
    Ok(items)
}

fn read_generation_item(index: usize, element: Value) -> Option<GenerationItem> {
    let Value::Object(mut object) = element else {
        warn!(index, "generation element is not an object, dropping");
        return None;
    };
    GenerationItem::canonicalize(&mut object);

    let missing = GenerationItem::missing_fields(&object);
    if !missing.is_empty() {
        warn!(index, missing = ?missing, "generation element is missing fields, dropping");
        return None;
    }

    match serde_json::from_value(Value::Object(object)) {
        Ok(item) => Some(item),
        Err(err) => {
            warn!(index, error = %err, "generation element has invalid field types, dropping");
            None
        }
    }
}

/// One candidate transformation as emitted by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationItem {
    /// Human-readable description, may contain `{name}` placeholders
    pub description: String,
    /// Expression the transformation produces or describes
    pub expression: String,
    /// Category tag
    pub kind: String,
    /// Free-form metadata (the `usefulness` tag lives here)
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Raw parameter specs, validated by the session layer
    #[serde(default)]
    pub parameter_definitions: Option<Vec<Value>>,
    /// Whether the user must supply values before applying
    #[serde(default)]
    pub requires_user_input: bool,
}

impl ResponseRecord for GenerationItem {
    const NAME: &'static str = "generation";
    const SHAPE: PayloadShape = PayloadShape::Array;
    const REQUIRED: &'static [Field] = &[
        Field::new("description"),
        Field::new("expression"),
        Field::with_aliases("kind", &["type"]),
    ];
}

/// Apply response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResponse {
    /// Expression after applying the transformation
    pub result: String,
    /// Whether the model considers the application valid
    pub valid: bool,
    /// Explanation of the applied step
    #[serde(default)]
    pub explanation: String,
    /// Problems found while applying
    #[serde(default)]
    pub errors: Option<Vec<String>>,
}

impl ResponseRecord for ApplyResponse {
    const NAME: &'static str = "apply";
    const REQUIRED: &'static [Field] = &[
        Field::with_aliases("result", &["result_expression"]),
        Field::with_aliases("valid", &["is_valid"]),
    ];
}

/// Completion check verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    /// Whether the task is solved
    pub solved: bool,
    /// Confidence in `0..=1`
    pub confidence: f64,
    /// Reasoning behind the verdict
    pub explanation: String,
    /// Kind of solution reached
    pub category: String,
    /// Suggested follow-up steps
    #[serde(default)]
    pub next_steps: Option<Vec<String>>,
}

impl ResponseRecord for CheckResponse {
    const NAME: &'static str = "check";
    const REQUIRED: &'static [Field] = &[
        Field::with_aliases("solved", &["is_solved"]),
        Field::new("confidence"),
        Field::new("explanation"),
        Field::with_aliases("category", &["solution_type"]),
    ];
}

impl CheckResponse {
    /// Confidence clamped to `0..=1`
    #[must_use]
    pub fn clamped_confidence(&self) -> f64 {
        if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        }
    }
}

/// Progress analysis over the whole step chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressResponse {
    /// Overall assessment (`good`, `stuck`, `regressing`, ...)
    pub progress_assessment: String,
    /// Confidence of the assessment
    #[serde(default)]
    pub confidence: f64,
    /// Free text analysis
    #[serde(default)]
    pub analysis: String,
    /// Whether a rollback is advised
    pub recommend_rollback: bool,
    /// Step number to roll back to
    #[serde(default)]
    pub recommended_step: Option<i64>,
    /// Why the rollback is advised
    #[serde(default)]
    pub rollback_reason: Option<String>,
    /// Message suitable for showing to the user
    #[serde(default)]
    pub suggestion_message: Option<String>,
}

impl ResponseRecord for ProgressResponse {
    const NAME: &'static str = "progress";
    const REQUIRED: &'static [Field] = &[
        Field::new("progress_assessment"),
        Field::new("recommend_rollback"),
    ];
}

/// Verdict on a user-performed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResponse {
    /// Whether the claimed result is correct
    pub is_correct: bool,
    /// Correct result of the claimed transformation
    pub corrected_result: String,
    /// Explanation of the verdict
    #[serde(default)]
    pub verification_explanation: String,
    /// Individual mistakes
    #[serde(default)]
    pub errors_found: Option<Vec<String>>,
    /// Step-by-step recomputation
    #[serde(default)]
    pub step_by_step_check: Option<String>,
    /// Assessment of the user's own result, when one was given
    #[serde(default)]
    pub user_result_assessment: Option<String>,
}

impl ResponseRecord for VerificationResponse {
    const NAME: &'static str = "verification";
    const REQUIRED: &'static [Field] =
        &[Field::new("is_correct"), Field::new("corrected_result")];
}

/// Branch entry inside a branching response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BranchItem {
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Branch expression
    #[serde(default)]
    pub expression: Option<String>,
    /// Condition under which the branch applies
    #[serde(default)]
    pub condition: Option<String>,
    /// Whether the branch is admissible
    #[serde(default)]
    pub is_valid: Option<bool>,
}

/// Branching analysis of the current expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchingResponse {
    /// Whether the expression splits
    pub requires_branching: bool,
    /// `system`, `cases` or `alternatives`
    #[serde(default)]
    pub solution_type: Option<String>,
    /// Branches, when splitting
    #[serde(default)]
    pub branches: Vec<BranchItem>,
    /// Short description of the split
    #[serde(default)]
    pub description: Option<String>,
    /// Why the split is needed
    #[serde(default)]
    pub explanation: String,
}

impl ResponseRecord for BranchingResponse {
    const NAME: &'static str = "branching";
    const REQUIRED: &'static [Field] = &[Field::new("requires_branching")];
}
