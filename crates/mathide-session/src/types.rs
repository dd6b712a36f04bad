//! Session data model
//!
//! Defines the values that flow through a solving session:
//! - Identifiers for candidates, steps and users
//! - Candidates (transformations offered by the model) and their parameters
//! - Steps and the branch annotations attached to them

use mathide_parse::records::GenerationItem;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use ulid::Ulid;
use uuid::Uuid;

/// Opaque candidate identifier
///
/// Rendered as 26 characters, short enough for UI callback payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandidateId(pub Ulid);

impl CandidateId {
    /// Generate new candidate ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CandidateId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Stable step identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub Uuid);

impl StepId {
    /// Generate new step ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StepId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of the user owning a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of value a parameter accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    /// Numeric value
    Number,
    /// Free text
    Text,
    /// One of the listed options
    Choice,
    /// Math expression
    Expression,
}

/// Specification of a value the user must supply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Placeholder name, substituted as `{name}`
    pub name: String,
    /// Question shown to the user
    #[serde(alias = "prompt_text")]
    pub prompt: String,
    /// Accepted value kind
    #[serde(alias = "type")]
    pub param_type: ParameterType,
    /// Options for [`ParameterType::Choice`]
    #[serde(default)]
    pub options: Option<Vec<Value>>,
    /// Used when no value is supplied
    #[serde(default)]
    pub default_value: Option<Value>,
    /// Free-form validation hint
    #[serde(default)]
    pub validation_rule: Option<String>,
    /// Values worth offering as shortcuts
    #[serde(default)]
    pub suggested_values: Option<Vec<Value>>,
}

impl ParameterDefinition {
    /// Parse a raw definition, `None` when it is incomplete or ill-typed
    #[must_use]
    pub fn from_value(raw: &Value) -> Option<Self> {
        match serde_json::from_value(raw.clone()) {
            Ok(definition) => Some(definition),
            Err(err) => {
                tracing::warn!(error = %err, "dropping invalid parameter definition");
                None
            }
        }
    }

    /// Default value rendered as substitution text
    #[must_use]
    pub fn default_text(&self) -> Option<String> {
        self.default_value.as_ref().and_then(value_text)
    }
}

/// A concrete parameter value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterValue {
    /// Parameter name
    pub name: String,
    /// Value substituted for `{name}`
    pub value: String,
}

/// A definition that could not be filled
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no value and no default for parameter `{name}`")]
pub struct UnfilledParameter {
    /// Name of the unfilled definition
    pub name: String,
}

/// Usefulness tag carried in candidate metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Usefulness {
    /// Tagged `good`
    Good,
    /// Tagged `neutral`
    Neutral,
    /// Any other tag, or none
    Other,
}

impl Usefulness {
    /// Sort rank, lower first
    #[inline]
    #[must_use]
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// A candidate transformation offered for a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Human-readable description
    pub description: String,
    /// Expression the transformation is about
    pub expression: String,
    /// Category tag
    #[serde(alias = "type")]
    pub kind: String,
    /// Filled parameter values
    #[serde(default)]
    pub parameters: Vec<ParameterValue>,
    /// Values to request before applying
    #[serde(default)]
    pub parameter_definitions: Option<Vec<ParameterDefinition>>,
    /// Whether parameters must be filled before applying
    #[serde(default)]
    pub requires_user_input: bool,
    /// Expected result shown before applying
    #[serde(default)]
    pub preview_result: Option<String>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Candidate {
    /// Kind tag used for user-described transformations
    pub const CUSTOM_KIND: &'static str = "custom";

    /// Build a candidate from a decoded generation element
    ///
    /// Invalid parameter definitions are dropped; the candidate is kept.
    #[must_use]
    pub fn from_record(item: GenerationItem) -> Self {
        let definitions: Vec<ParameterDefinition> = item
            .parameter_definitions
            .unwrap_or_default()
            .iter()
            .filter_map(ParameterDefinition::from_value)
            .collect();

        let requires_user_input = item.requires_user_input || !definitions.is_empty();

        Self {
            description: item.description,
            expression: item.expression,
            kind: item.kind,
            parameters: Vec::new(),
            parameter_definitions: (!definitions.is_empty()).then_some(definitions),
            requires_user_input,
            preview_result: None,
            metadata: item.metadata,
        }
    }

    /// A transformation described by the user in free text
    #[must_use]
    pub fn custom(description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            expression: description.clone(),
            description,
            kind: Self::CUSTOM_KIND.to_string(),
            parameters: Vec::new(),
            parameter_definitions: None,
            requires_user_input: false,
            preview_result: None,
            metadata: Map::new(),
        }
    }

    /// Usefulness tag from metadata (`usefulness`, or the `usefullness` spelling)
    #[must_use]
    pub fn usefulness(&self) -> Usefulness {
        let tag = self
            .metadata
            .get("usefulness")
            .or_else(|| self.metadata.get("usefullness"))
            .and_then(Value::as_str);
        match tag {
            Some("good") => Usefulness::Good,
            Some("neutral") => Usefulness::Neutral,
            _ => Usefulness::Other,
        }
    }

    /// Definitions still to be filled, empty when none
    #[must_use]
    pub fn definitions(&self) -> &[ParameterDefinition] {
        self.parameter_definitions.as_deref().unwrap_or_default()
    }

    /// Whether the candidate can be applied as-is
    #[inline]
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        !self.requires_user_input
    }

    /// Resolve every definition and substitute the values
    ///
    /// `provider` is asked for each definition in order; the definition's
    /// default is used when it yields nothing. The candidate is left
    /// untouched when any definition stays unresolved. A filled candidate
    /// has no definitions left and only records the values in `parameters`.
    ///
    /// # Errors
    ///
    /// [`UnfilledParameter`] naming the first unresolved definition.
    pub fn fill_parameters<F>(&mut self, mut provider: F) -> Result<(), UnfilledParameter>
    where
        F: FnMut(&ParameterDefinition) -> Option<String>,
    {
        let mut values = Vec::with_capacity(self.definitions().len());
        for definition in self.definitions() {
            let value = provider(definition)
                .or_else(|| definition.default_text())
                .ok_or_else(|| UnfilledParameter {
                    name: definition.name.clone(),
                })?;
            values.push(ParameterValue {
                name: definition.name.clone(),
                value,
            });
        }

        self.description = substitute(&self.description, &values);
        self.expression = substitute(&self.expression, &values);
        self.parameters = values;
        self.parameter_definitions = None;
        self.requires_user_input = false;
        Ok(())
    }
}

/// Replace every `{name}` placeholder with its value
#[must_use]
pub fn substitute(text: &str, values: &[ParameterValue]) -> String {
    values.iter().fold(text.to_owned(), |acc, param| {
        acc.replace(&format!("{{{}}}", param.name), &param.value)
    })
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// How a step decomposes into branches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchKind {
    /// All branches hold simultaneously
    System,
    /// Exactly one branch holds, by condition
    Cases,
    /// Independent alternative solution paths
    Alternatives,
}

impl BranchKind {
    /// Lowercase tag
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Cases => "cases",
            Self::Alternatives => "alternatives",
        }
    }
}

impl std::fmt::Display for BranchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BranchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "cases" => Ok(Self::Cases),
            "alternatives" => Ok(Self::Alternatives),
            other => Err(format!("unknown branch kind: {other}")),
        }
    }
}

/// Read-only branch annotation on a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Identifier unique within the step (`branch_0`, ...)
    pub id: String,
    /// Display name
    pub name: String,
    /// Branch expression
    pub expression: String,
    /// Condition under which the branch applies
    #[serde(default)]
    pub condition: Option<String>,
    /// Whether the branch is admissible
    #[serde(default = "default_true")]
    pub is_valid: bool,
}

fn default_true() -> bool {
    true
}

/// One step of the solving chain
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Stable identifier
    pub id: StepId,
    /// Position in the chain, 0-based
    pub ordinal: usize,
    /// Expression the step worked on
    pub expression: String,
    /// Candidate applied at this step
    pub chosen_candidate: Option<Candidate>,
    /// Expression after applying the candidate
    pub result_expression: Option<String>,
    /// Candidates that were on offer when the choice was made
    pub available_candidate_ids: Vec<CandidateId>,
    /// Previous step, `None` for the first
    pub parent_id: Option<StepId>,
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Decomposition kind when branches are attached
    pub branch_kind: Option<BranchKind>,
    /// Branch annotations
    pub branches: Vec<Branch>,
    /// Free-form metadata
    pub metadata: Map<String, Value>,
}

impl Step {
    /// Expression the chain continues from after this step
    #[must_use]
    pub fn effective_expression(&self) -> &str {
        self.result_expression.as_deref().unwrap_or(&self.expression)
    }
}
