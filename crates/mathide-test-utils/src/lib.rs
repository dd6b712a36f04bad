//! Testing utilities for the MathIDE workspace
//!
//! Shared test helpers and fixtures:
//! - [`ScriptedClient`], a completion client replaying queued replies
//! - JSON builders for every model reply shape
//! - A fast engine configuration without retry delays

#![allow(missing_docs)]

use async_trait::async_trait;
use mathide_core::{
    CompletionClient, CompletionError, CompletionRequest, CompletionResponse, EngineConfig,
    RetryPolicy, SessionOrchestrator, TokenUsage,
};
use mathide_session::UserId;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// Completion client answering from a queue
///
/// Every request is recorded. Once the queue is empty, requests fail with
/// [`CompletionError::Other`].
#[derive(Debug, Default)]
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client preloaded with successful replies
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        for reply in replies {
            client.push_reply(reply);
        }
        client
    }

    pub fn push_reply(&self, text: impl Into<String>) -> &Self {
        self.replies.lock().push_back(Ok(text.into()));
        self
    }

    pub fn push_json(&self, value: &Value) -> &Self {
        self.push_reply(value.to_string())
    }

    pub fn push_error(&self, error: CompletionError) -> &Self {
        self.replies.lock().push_back(Err(error));
        self
    }

    /// Replies not consumed yet
    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        self.requests.lock().push(request.clone());
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(CompletionError::Other("script exhausted".to_string())))?;

        let completion_tokens = u32::try_from(reply.len()).unwrap_or(u32::MAX);
        Ok(CompletionResponse {
            content: reply,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens,
                total_tokens: completion_tokens.saturating_add(10),
            },
            finish_reason: "stop".to_string(),
            model: request.model.clone(),
        })
    }
}

/// Default config with instant retries
pub fn test_config() -> EngineConfig {
    EngineConfig::new()
        .with_transcript_logging(false)
        .with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 0,
        })
}

/// Orchestrator over a shared scripted client
pub fn scripted_engine(
    client: &Arc<ScriptedClient>,
) -> SessionOrchestrator<Arc<ScriptedClient>> {
    SessionOrchestrator::new(Arc::clone(client), test_config())
}

pub const ALICE: UserId = UserId(1);
pub const BOB: UserId = UserId(2);

/// Generation element
pub fn candidate_json(description: &str, expression: &str, kind: &str) -> Value {
    json!({"description": description, "expression": expression, "kind": kind})
}

/// Generation element with a usefulness tag
pub fn tagged_candidate_json(description: &str, usefulness: &str) -> Value {
    json!({
        "description": description,
        "expression": description,
        "kind": "step",
        "metadata": {"usefulness": usefulness}
    })
}

/// Generation element with one numeric parameter `{name}`
pub fn parameterized_candidate_json(description: &str, expression: &str, name: &str) -> Value {
    json!({
        "description": description,
        "expression": expression,
        "kind": "parameterized",
        "requires_user_input": true,
        "parameter_definitions": [
            {"name": name, "prompt_text": format!("value for {name}?"), "type": "number"}
        ]
    })
}

pub fn generation_json(items: &[Value]) -> Value {
    Value::Array(items.to_vec())
}

pub fn apply_json(result: &str, valid: bool) -> Value {
    json!({"result": result, "valid": valid, "explanation": format!("gives {result}")})
}

pub fn check_json(solved: bool, confidence: f64) -> Value {
    let (explanation, category) = if solved {
        ("solved", "exact")
    } else {
        ("keep going", "partial")
    };
    json!({
        "solved": solved,
        "confidence": confidence,
        "explanation": explanation,
        "category": category,
    })
}

pub fn progress_json(recommend_rollback: bool, recommended_step: Option<i64>) -> Value {
    let assessment = if recommend_rollback { "regressing" } else { "good" };
    json!({
        "progress_assessment": assessment,
        "confidence": 0.8,
        "analysis": "reviewed",
        "recommend_rollback": recommend_rollback,
        "recommended_step": recommended_step,
        "rollback_reason": recommend_rollback.then_some("sign error"),
        "suggestion_message": recommend_rollback.then_some("go back"),
    })
}

pub fn branching_json(solution_type: &str, expressions: &[&str]) -> Value {
    let branches: Vec<Value> = expressions
        .iter()
        .map(|expression| json!({"expression": expression}))
        .collect();
    json!({
        "requires_branching": true,
        "solution_type": solution_type,
        "branches": branches,
        "explanation": "splits by sign",
    })
}

pub fn verification_json(is_correct: bool, corrected_result: &str) -> Value {
    json!({
        "is_correct": is_correct,
        "corrected_result": corrected_result,
        "verification_explanation": "recomputed",
    })
}
