//! Prompt catalog
//!
//! Built-in system/user templates for every model operation. Templates use
//! `{name}` placeholders; unknown placeholders are left as written, which
//! keeps the literal braces of math markup and JSON examples intact.

use std::collections::HashMap;

/// Model operation a prompt belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Candidate generation
    Generation,
    /// Applying a candidate
    Apply,
    /// Completion check
    Check,
    /// Progress analysis
    Progress,
    /// Verification of a user step
    Verify,
    /// Branching analysis
    Branching,
}

impl Operation {
    /// Every operation
    pub const ALL: [Operation; 6] = [
        Self::Generation,
        Self::Apply,
        Self::Check,
        Self::Progress,
        Self::Verify,
        Self::Branching,
    ];

    /// Short name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Apply => "apply",
            Self::Check => "check",
            Self::Progress => "progress",
            Self::Verify => "verify",
            Self::Branching => "branching",
        }
    }
}

/// System and user template pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    /// System message template
    pub system: String,
    /// User message template
    pub user: String,
}

/// Templates per operation
#[derive(Debug, Clone)]
pub struct PromptCatalog {
    templates: HashMap<Operation, PromptTemplate>,
}

impl Default for PromptCatalog {
    fn default() -> Self {
        let templates = Operation::ALL
            .into_iter()
            .map(|op| {
                let (system, user) = builtin(op);
                (
                    op,
                    PromptTemplate {
                        system: system.to_string(),
                        user: user.to_string(),
                    },
                )
            })
            .collect();
        Self { templates }
    }
}

impl PromptCatalog {
    /// Catalog with the built-in templates
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the templates for one operation
    #[must_use]
    pub fn with_template(
        mut self,
        op: Operation,
        system: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        self.templates.insert(
            op,
            PromptTemplate {
                system: system.into(),
                user: user.into(),
            },
        );
        self
    }

    /// Template for an operation
    #[must_use]
    pub fn template(&self, op: Operation) -> &PromptTemplate {
        // every operation is seeded in Default and only ever replaced
        &self.templates[&op]
    }

    /// Rendered `(system, user)` text for an operation
    #[must_use]
    pub fn render(&self, op: Operation, vars: &[(&str, &str)]) -> (String, String) {
        let template = self.template(op);
        (render(&template.system, vars), render(&template.user, vars))
    }
}

/// Single-pass `{name}` substitution
///
/// Substituted values are never rescanned, so a value containing
/// `{other}` stays literal.
#[must_use]
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let key_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let key = &after[..key_len];

        let value = (key_len > 0 && after[key_len..].starts_with('}'))
            .then(|| vars.iter().find(|(name, _)| *name == key).map(|(_, v)| *v))
            .flatten();

        match value {
            Some(value) => {
                out.push_str(value);
                rest = &after[key_len + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

const JSON_RULES: &str = "Answer with JSON only. Inside JSON strings every LaTeX backslash must be doubled, e.g. \"\\\\frac{1}{2}\".";

fn builtin(op: Operation) -> (String, &'static str) {
    match op {
        Operation::Generation => (
            format!(
                "You are a mathematics tutor. Propose up to {{max_candidates}} distinct next transformations for the expression. \
                 Return a JSON array of objects with keys description, expression, type, optional metadata \
                 (with usefulness: good|neutral|bad), optional parameter_definitions and requires_user_input. {JSON_RULES}"
            ),
            "Task: {task}\nCurrent expression: {expression}",
        ),
        Operation::Apply => (
            format!(
                "You apply one transformation to a mathematical expression. \
                 Return a JSON object with keys result, valid, explanation and optional errors. {JSON_RULES}"
            ),
            "Expression: {expression}\nTransformation: {description}\nTransformation expression: {transformation}\nType: {kind}",
        ),
        Operation::Check => (
            format!(
                "You decide whether a task is solved. Return a JSON object with keys solved, confidence (0..1), \
                 explanation, category (exact|approximate|partial) and optional next_steps. {JSON_RULES}"
            ),
            "Task: {task}\nCurrent expression: {expression}",
        ),
        Operation::Progress => (
            format!(
                "You review the steps of a solution. Return a JSON object with keys progress_assessment, confidence, \
                 analysis, recommend_rollback, optional recommended_step, rollback_reason and suggestion_message. {JSON_RULES}"
            ),
            "Task: {task}\nCurrent expression: {expression}\nSteps:\n{steps}",
        ),
        Operation::Verify => (
            format!(
                "You verify a transformation performed by the user. Return a JSON object with keys is_correct, \
                 corrected_result, verification_explanation, optional errors_found, step_by_step_check and \
                 user_result_assessment. {JSON_RULES}"
            ),
            "Expression: {expression}\nTransformation: {description}\nClaimed result: {result}\nUser result: {user_result}",
        ),
        Operation::Branching => (
            format!(
                "You decide whether an expression splits into a system, cases or alternatives. Return a JSON object \
                 with keys requires_branching, solution_type, branches (name, expression, condition, is_valid), \
                 description and explanation. {JSON_RULES}"
            ),
            "Task: {task}\nCurrent expression: {expression}",
        ),
    }
}
