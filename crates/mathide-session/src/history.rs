//! Step history
//!
//! The causal chain of steps for one session. The chain is linear: every
//! step's parent is the step before it, and rollback truncates. There is
//! no redo.
//!
//! # Persisted layout
//!
//! ```json
//! {
//!   "original_task": "2(x+1)=4",
//!   "current_step_number": 2,
//!   "steps": [
//!     {"id": "…", "step_number": 0, "expression": "…",
//!      "available_transformations": ["01J…"], "chosen_transformation": null,
//!      "result_expression": null, "timestamp": "2026-01-01T00:00:00Z",
//!      "parent_id": null, "metadata": {}}
//!   ]
//! }
//! ```

use crate::error::HistoryImportError;
use crate::types::{Branch, BranchKind, Candidate, CandidateId, Step, StepId};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

/// Ordered, truncating chain of steps
#[derive(Debug, Clone, PartialEq)]
pub struct StepHistory {
    original_task: String,
    steps: Vec<Step>,
}

/// Display projection of one step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    /// Step id
    pub id: StepId,
    /// Position in the chain
    pub step_number: usize,
    /// Expression the step worked on
    pub expression: String,
    /// Whether a candidate was applied
    pub has_chosen_candidate: bool,
    /// Description of the applied candidate
    pub chosen_description: Option<String>,
    /// Whether a result exists
    pub has_result: bool,
    /// Result of the step
    pub result_expression: Option<String>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Number of branch annotations
    pub branch_count: usize,
}

/// Display projection of the whole chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySummary {
    /// Task the session started from
    pub original_task: String,
    /// Number of steps
    pub total_steps: usize,
    /// Index of the current step, `None` when empty
    pub cursor: Option<usize>,
    /// Whether the last step carries a result
    pub is_complete: bool,
    /// Per-step projection
    pub steps: Vec<StepSummary>,
}

impl StepHistory {
    /// Start an empty history for a task
    #[must_use]
    pub fn new(original_task: impl Into<String>) -> Self {
        Self {
            original_task: original_task.into(),
            steps: Vec::new(),
        }
    }

    /// Task the history was started for
    #[inline]
    #[must_use]
    pub fn original_task(&self) -> &str {
        &self.original_task
    }

    /// Append a step after the current one
    pub fn append(
        &mut self,
        expression: impl Into<String>,
        available_candidate_ids: Vec<CandidateId>,
        chosen_candidate: Option<Candidate>,
        result_expression: Option<String>,
    ) -> &Step {
        let ordinal = self.steps.len();
        let step = Step {
            id: StepId::new(),
            ordinal,
            expression: expression.into(),
            chosen_candidate,
            result_expression,
            available_candidate_ids,
            parent_id: self.steps.last().map(|s| s.id),
            created_at: Utc::now(),
            branch_kind: None,
            branches: Vec::new(),
            metadata: Map::new(),
        };
        debug!(step = %step.id, ordinal, "appended step");
        self.steps.push(step);
        &self.steps[ordinal]
    }

    /// Truncate so that step `ordinal` becomes the last step
    ///
    /// Returns `false` and leaves the chain unchanged when `ordinal` is
    /// negative or not below the current length.
    pub fn rollback_to_ordinal(&mut self, ordinal: i64) -> bool {
        match usize::try_from(ordinal) {
            Ok(index) if index < self.steps.len() => {
                self.truncate_after(index);
                true
            }
            _ => false,
        }
    }

    /// Truncate so that the step with `id` becomes the last step
    pub fn rollback_to_id(&mut self, id: &StepId) -> bool {
        match self.steps.iter().position(|s| s.id == *id) {
            Some(index) => {
                self.truncate_after(index);
                true
            }
            None => false,
        }
    }

    fn truncate_after(&mut self, index: usize) {
        let discarded = self.steps.len() - index - 1;
        self.steps.truncate(index + 1);
        info!(ordinal = index, discarded, "rolled back history");
    }

    /// Last step of the chain
    #[inline]
    #[must_use]
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Result of the current step, else its expression, else empty
    #[must_use]
    pub fn current_expression(&self) -> &str {
        self.current_step()
            .map_or("", |step| step.effective_expression())
    }

    /// Whether there is an earlier step to return to
    #[inline]
    #[must_use]
    pub fn can_rollback(&self) -> bool {
        self.steps.len() >= 2
    }

    /// Step by id
    #[must_use]
    pub fn step_by_id(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == *id)
    }

    /// Step by ordinal
    #[must_use]
    pub fn step_by_ordinal(&self, ordinal: usize) -> Option<&Step> {
        self.steps.get(ordinal)
    }

    /// All steps in order
    #[inline]
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no step exists
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Attach branch annotations to the current step
    ///
    /// Returns `false` when the history is empty.
    pub fn attach_branches(
        &mut self,
        kind: BranchKind,
        branches: Vec<Branch>,
        reason: Option<String>,
    ) -> bool {
        let Some(step) = self.steps.last_mut() else {
            return false;
        };
        step.branch_kind = Some(kind);
        step.branches = branches;
        step.metadata
            .insert("branch_kind".to_string(), Value::from(kind.as_str()));
        if let Some(reason) = reason {
            step.metadata
                .insert("branching_reason".to_string(), Value::from(reason));
        }
        true
    }

    /// Display projection of the chain
    #[must_use]
    pub fn summary(&self) -> HistorySummary {
        HistorySummary {
            original_task: self.original_task.clone(),
            total_steps: self.steps.len(),
            cursor: self.steps.len().checked_sub(1),
            is_complete: self
                .current_step()
                .is_some_and(|s| s.result_expression.is_some()),
            steps: self
                .steps
                .iter()
                .map(|step| StepSummary {
                    id: step.id,
                    step_number: step.ordinal,
                    expression: step.expression.clone(),
                    has_chosen_candidate: step.chosen_candidate.is_some(),
                    chosen_description: step
                        .chosen_candidate
                        .as_ref()
                        .map(|c| c.description.clone()),
                    has_result: step.result_expression.is_some(),
                    result_expression: step.result_expression.clone(),
                    timestamp: step.created_at,
                    branch_count: step.branches.len(),
                })
                .collect(),
        }
    }

    /// Serialize the full chain
    #[must_use]
    pub fn export(&self) -> Value {
        let steps: Vec<Value> = self.steps.iter().map(export_step).collect();
        json!({
            "original_task": self.original_task,
            "current_step_number": self.steps.len(),
            "steps": steps,
        })
    }

    /// Rebuild a history from [`StepHistory::export`] output
    ///
    /// # Errors
    ///
    /// The first structural problem found, field by field. No partially
    /// populated history is ever returned.
    pub fn import(data: &Value) -> Result<Self, HistoryImportError> {
        let top = data.as_object().ok_or(HistoryImportError::NotAnObject)?;

        let original_task = top
            .get("original_task")
            .and_then(Value::as_str)
            .ok_or(HistoryImportError::MissingTopField("original_task"))?
            .to_owned();
        let declared = top
            .get("current_step_number")
            .and_then(Value::as_u64)
            .ok_or(HistoryImportError::MissingTopField("current_step_number"))?;
        let raw_steps = top
            .get("steps")
            .and_then(Value::as_array)
            .ok_or(HistoryImportError::MissingTopField("steps"))?;

        let mut steps: Vec<Step> = Vec::with_capacity(raw_steps.len());
        for (index, raw) in raw_steps.iter().enumerate() {
            let step = import_step(index, raw)?;

            if step.ordinal != index {
                return Err(HistoryImportError::InconsistentChain(format!(
                    "step at position {index} has step_number {}",
                    step.ordinal
                )));
            }
            let expected_parent = steps.last().map(|s| s.id);
            if step.parent_id != expected_parent {
                return Err(HistoryImportError::InconsistentChain(format!(
                    "step {index} does not link to the previous step"
                )));
            }
            if steps.iter().any(|s| s.id == step.id) {
                return Err(HistoryImportError::InconsistentChain(format!(
                    "duplicate step id {}",
                    step.id
                )));
            }
            steps.push(step);
        }

        if usize::try_from(declared).ok() != Some(steps.len()) {
            return Err(HistoryImportError::InconsistentChain(format!(
                "current_step_number {declared} does not match {} steps",
                steps.len()
            )));
        }

        info!(steps = steps.len(), "imported history");
        Ok(Self {
            original_task,
            steps,
        })
    }
}

fn export_step(step: &Step) -> Value {
    let mut out = json!({
        "id": step.id.to_string(),
        "step_number": step.ordinal,
        "expression": step.expression,
        "available_transformations": step
            .available_candidate_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        "chosen_transformation": step.chosen_candidate,
        "result_expression": step.result_expression,
        "timestamp": step.created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        "parent_id": step.parent_id.map(|id| id.to_string()),
        "metadata": step.metadata,
    });
    if let Some(map) = out.as_object_mut() {
        if let Some(kind) = step.branch_kind {
            map.insert("branch_kind".to_string(), Value::from(kind.as_str()));
        }
        if !step.branches.is_empty() {
            map.insert("branches".to_string(), json!(step.branches));
        }
    }
    out
}

fn import_step(index: usize, raw: &Value) -> Result<Step, HistoryImportError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| invalid(index, "step", "not an object"))?;
    let field = |name: &'static str| {
        obj.get(name).ok_or(HistoryImportError::MissingField {
            step: index,
            field: name,
        })
    };

    let id = field("id")?
        .as_str()
        .ok_or_else(|| invalid(index, "id", "not a string"))?
        .parse::<StepId>()
        .map_err(|e| invalid(index, "id", e))?;

    let ordinal = field("step_number")?
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| invalid(index, "step_number", "not a non-negative integer"))?;

    let expression = field("expression")?
        .as_str()
        .ok_or_else(|| invalid(index, "expression", "not a string"))?
        .to_owned();

    let available_candidate_ids = field("available_transformations")?
        .as_array()
        .ok_or_else(|| invalid(index, "available_transformations", "not an array"))?
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| invalid(index, "available_transformations", "id is not a string"))?
                .parse::<CandidateId>()
                .map_err(|e| invalid(index, "available_transformations", e))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let parent_id = match field("parent_id")? {
        Value::Null => None,
        Value::String(s) => Some(
            s.parse::<StepId>()
                .map_err(|e| invalid(index, "parent_id", e))?,
        ),
        _ => return Err(invalid(index, "parent_id", "not a string or null")),
    };

    let created_at = field("timestamp")?
        .as_str()
        .ok_or_else(|| invalid(index, "timestamp", "not a string"))
        .and_then(|s| parse_timestamp(s).ok_or_else(|| invalid(index, "timestamp", s)))?;

    let chosen_candidate = match field("chosen_transformation")? {
        Value::Null => None,
        value => Some(
            serde_json::from_value::<Candidate>(value.clone())
                .map_err(|e| invalid(index, "chosen_transformation", e))?,
        ),
    };

    let result_expression = match field("result_expression")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        _ => return Err(invalid(index, "result_expression", "not a string")),
    };

    let metadata = match field("metadata")? {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        _ => return Err(invalid(index, "metadata", "not an object")),
    };

    let branch_kind = match obj.get("branch_kind") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(
            s.parse::<BranchKind>()
                .map_err(|e| invalid(index, "branch_kind", e))?,
        ),
        Some(_) => return Err(invalid(index, "branch_kind", "not a string")),
    };

    let branches = match obj.get("branches") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => serde_json::from_value::<Vec<Branch>>(value.clone())
            .map_err(|e| invalid(index, "branches", e))?,
    };

    Ok(Step {
        id,
        ordinal,
        expression,
        chosen_candidate,
        result_expression,
        available_candidate_ids,
        parent_id,
        created_at,
        branch_kind,
        branches,
        metadata,
    })
}

fn invalid(step: usize, field: &'static str, reason: impl ToString) -> HistoryImportError {
    HistoryImportError::InvalidField {
        step,
        field,
        reason: reason.to_string(),
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
