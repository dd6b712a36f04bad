use async_trait::async_trait;
use mathide_core::{
    ApplyOutcome, BranchingOutcome, CompletionClient, CompletionError, CompletionRequest,
    CompletionResponse, FillOutcome, OrchestratorError, RollbackTarget, SelectOutcome,
    SessionOrchestrator, VerificationRequest,
};
use mathide_parse::DecodeError;
use mathide_session::{BranchKind, CandidateId, PhaseError, SessionPhase, UserId};
use mathide_test_utils::{
    apply_json, branching_json, candidate_json, check_json, generation_json,
    parameterized_candidate_json, progress_json, scripted_engine, tagged_candidate_json,
    test_config, verification_json, ScriptedClient, ALICE, BOB,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn expand_offer() -> serde_json::Value {
    generation_json(&[candidate_json("expand", "2x+2=4", "expand")])
}

/// Engine with ALICE's session started and one generated offer selected
async fn selected_engine(
    client: &Arc<ScriptedClient>,
) -> (SessionOrchestrator<Arc<ScriptedClient>>, String) {
    client.push_json(&expand_offer());
    let engine = scripted_engine(client);
    engine.new_session(ALICE, "2(x+1)=4").unwrap();
    let generated = engine.generate(ALICE).await.unwrap();
    let id = generated.offers[0].id.to_string();
    engine.select(ALICE, &id).await.unwrap();
    (engine, id)
}

#[tokio::test]
async fn test_linear_equation_end_to_end() {
    let client = Arc::new(ScriptedClient::new());
    client
        .push_json(&expand_offer())
        .push_json(&apply_json("2x+2=4", true))
        .push_json(&check_json(true, 0.95));
    let engine = scripted_engine(&client);

    let initial = engine.new_session(ALICE, "2(x+1)=4").unwrap();
    let generated = engine.generate(ALICE).await.unwrap();
    assert_eq!(generated.step_id, initial);
    assert_eq!(generated.offers.len(), 1);
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::AwaitingSelection));

    let id = generated.offers[0].id.to_string();
    assert!(matches!(
        engine.select(ALICE, &id).await.unwrap(),
        SelectOutcome::ReadyToApply(_)
    ));
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::Applying));

    let ApplyOutcome::Applied { result, .. } = engine.apply(ALICE).await.unwrap() else {
        panic!("expected the transformation to be applied");
    };
    assert_eq!(result, "2x+2=4");

    let summary = engine.summary(ALICE).await.unwrap();
    assert_eq!(summary.total_steps, 2);
    assert_eq!(summary.steps[1].expression, "2(x+1)=4");
    assert_eq!(summary.steps[1].result_expression.as_deref(), Some("2x+2=4"));
    assert_eq!(summary.steps[1].chosen_description.as_deref(), Some("expand"));

    let exported = engine.export(ALICE).await.unwrap();
    assert_eq!(exported["steps"][1]["available_transformations"], json!([id]));
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::GeneratingCandidates));

    let verdict = engine.check(ALICE).await.unwrap();
    assert!(verdict.solved);
    assert_eq!(verdict.category, "exact");
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::Solved));

    let requests = client.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].messages[1].content.contains("2(x+1)=4"));
    assert!(requests[1].messages[1].content.contains("expand"));
    assert!(requests[2].messages[1]
        .content
        .contains("Current expression: 2x+2=4"));
    assert!((requests[0].temperature - 0.7).abs() < f32::EPSILON);
    assert!((requests[2].temperature - 0.2).abs() < f32::EPSILON);
    assert_eq!(requests[0].model, "o4-mini");
}

#[tokio::test]
async fn test_unsolved_check_returns_to_generation() {
    let client = Arc::new(ScriptedClient::new());
    let (engine, _) = selected_engine(&client).await;
    client
        .push_json(&check_json(false, 1.4))
        .push_json(&check_json(true, 0.9));

    let verdict = engine.check(ALICE).await.unwrap();
    assert!(!verdict.solved);
    assert!((verdict.confidence - 1.0).abs() < f64::EPSILON);
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::GeneratingCandidates));
    assert!(engine.selection(ALICE).await.is_none());

    engine.check(ALICE).await.unwrap();
    assert!(matches!(
        engine.check(ALICE).await,
        Err(OrchestratorError::Phase(PhaseError::IllegalTransition { .. }))
    ));
    assert_eq!(client.calls(), 3);
}

#[tokio::test]
async fn test_solved_session_continues_only_after_rollback() {
    let client = Arc::new(ScriptedClient::new());
    let (engine, id) = selected_engine(&client).await;
    client
        .push_json(&check_json(true, 0.9))
        .push_json(&expand_offer());

    assert!(engine.check(ALICE).await.unwrap().solved);
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::Solved));

    assert!(matches!(
        engine.generate(ALICE).await,
        Err(OrchestratorError::Phase(PhaseError::IllegalTransition {
            from: SessionPhase::Solved,
            to: SessionPhase::GeneratingCandidates,
        }))
    ));
    assert!(matches!(
        engine.select(ALICE, &id).await,
        Err(OrchestratorError::Phase(PhaseError::IllegalTransition { .. }))
    ));
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::Solved));
    assert_eq!(client.calls(), 2);

    assert!(engine.rollback(ALICE, RollbackTarget::Ordinal(0)).await.unwrap());
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::AwaitingSelection));
    assert_eq!(engine.generate(ALICE).await.unwrap().offers.len(), 1);
    assert_eq!(client.calls(), 3);
}

#[tokio::test]
async fn test_single_escaped_command_is_recovered() {
    let client = Arc::new(ScriptedClient::new());
    client.push_reply(r#"[{"description":"d","expression":"\sin(x)","kind":"t"}]"#);
    let engine = scripted_engine(&client);
    engine.new_session(ALICE, r"\sin(x) = 0").unwrap();

    let generated = engine.generate(ALICE).await.unwrap();
    assert_eq!(generated.offers.len(), 1);
    assert_eq!(generated.offers[0].candidate.expression, r"\sin(x)");
    assert_eq!(generated.offers[0].candidate.kind, "t");
}

#[tokio::test]
async fn test_apply_missing_valid_leaves_history_unchanged() {
    let client = Arc::new(ScriptedClient::new());
    let (engine, _) = selected_engine(&client).await;

    client.push_reply(r#"{"result": "2x+2=4"}"#);
    let err = engine.apply(ALICE).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Decode(DecodeError::MissingField { ref fields, .. }) if fields == &vec!["valid"]
    ));
    assert!(err.is_retryable());
    assert_eq!(engine.summary(ALICE).await.unwrap().total_steps, 1);
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::Applying));
    assert!(engine.selection(ALICE).await.is_some());

    client.push_json(&apply_json("2x+2=4", true));
    assert!(matches!(
        engine.apply(ALICE).await.unwrap(),
        ApplyOutcome::Applied { .. }
    ));
    assert_eq!(engine.summary(ALICE).await.unwrap().total_steps, 2);
}

#[tokio::test]
async fn test_rejected_apply_returns_to_offers() {
    let client = Arc::new(ScriptedClient::new());
    let (engine, id) = selected_engine(&client).await;

    client.push_json(&json!({
        "result": "2x+1=4",
        "valid": false,
        "explanation": "distribution is wrong",
        "errors": ["2*1 is 2"]
    }));
    let outcome = engine.apply(ALICE).await.unwrap();
    assert_eq!(
        outcome,
        ApplyOutcome::Rejected {
            explanation: "distribution is wrong".into(),
            errors: vec!["2*1 is 2".into()],
        }
    );
    assert_eq!(engine.summary(ALICE).await.unwrap().total_steps, 1);
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::AwaitingSelection));
    assert!(matches!(
        engine.select(ALICE, &id).await.unwrap(),
        SelectOutcome::ReadyToApply(_)
    ));
}

#[tokio::test]
async fn test_unknown_and_foreign_ids_are_not_found() {
    let client = Arc::new(ScriptedClient::new());
    client.push_json(&expand_offer()).push_json(&expand_offer());
    let engine = scripted_engine(&client);
    engine.new_session(ALICE, "2(x+1)=4").unwrap();
    engine.new_session(BOB, "3x=9").unwrap();
    engine.generate(ALICE).await.unwrap();
    let bobs = engine.generate(BOB).await.unwrap();

    assert_eq!(engine.select(ALICE, "garbage").await.unwrap(), SelectOutcome::NotFound);
    assert_eq!(
        engine.select(ALICE, &CandidateId::new().to_string()).await.unwrap(),
        SelectOutcome::NotFound
    );
    assert_eq!(
        engine.select(ALICE, &bobs.offers[0].id.to_string()).await.unwrap(),
        SelectOutcome::NotFound
    );
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::AwaitingSelection));
}

#[tokio::test]
async fn test_offers_are_ranked_and_limited() {
    let client = Arc::new(ScriptedClient::new());
    client.push_json(&generation_json(&[
        tagged_candidate_json("b1", "bad"),
        tagged_candidate_json("g1", "good"),
        tagged_candidate_json("n1", "neutral"),
        tagged_candidate_json("b2", "bad"),
        tagged_candidate_json("g2", "good"),
        tagged_candidate_json("n2", "neutral"),
        tagged_candidate_json("b3", "bad"),
    ]));
    let engine = scripted_engine(&client);
    engine.new_session(ALICE, "x").unwrap();

    let generated = engine.generate(ALICE).await.unwrap();
    let mut names: Vec<_> = generated
        .offers
        .iter()
        .map(|offer| offer.candidate.description.clone())
        .collect();
    names.sort();
    assert_eq!(names, vec!["b1", "g1", "g2", "n1", "n2"]);
    assert_eq!(engine.offers(ALICE).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_malformed_elements_are_dropped() {
    let client = Arc::new(ScriptedClient::new());
    client
        .push_json(&json!([
            {"description": "no expression", "kind": "x"},
            "not an object",
            {"description": "ok", "expression": "x=1", "type": "solve"}
        ]))
        .push_json(&json!([{"description": "missing fields"}]))
        .push_reply("I could not think of anything.");
    let engine = scripted_engine(&client);
    engine.new_session(ALICE, "x+0=1").unwrap();

    let generated = engine.generate(ALICE).await.unwrap();
    assert_eq!(generated.offers.len(), 1);
    assert_eq!(generated.offers[0].candidate.kind, "solve");

    let empty = engine.generate(ALICE).await.unwrap();
    assert!(empty.is_empty());
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::GeneratingCandidates));

    let err = engine.generate(ALICE).await.unwrap_err();
    assert!(err.is_decode_failure());
    assert!(matches!(
        err,
        OrchestratorError::Decode(DecodeError::NoPayload { .. })
    ));
}

#[tokio::test]
async fn test_preview_mode_stamps_offers() {
    let client = Arc::new(ScriptedClient::new());
    client.push_json(&expand_offer());
    let engine =
        SessionOrchestrator::new(Arc::clone(&client), test_config().with_preview_mode(true));
    engine.new_session(ALICE, "2(x+1)=4").unwrap();

    let generated = engine.generate(ALICE).await.unwrap();
    assert_eq!(
        generated.offers[0].candidate.preview_result.as_deref(),
        Some("2x+2=4")
    );
}

#[tokio::test]
async fn test_parameters_are_supplied_one_at_a_time() {
    let client = Arc::new(ScriptedClient::new());
    client.push_json(&generation_json(&[parameterized_candidate_json(
        "multiply both sides by {k}",
        "{k}(x+1) = 2*{k}",
        "k",
    )]));
    let engine = scripted_engine(&client);
    engine.new_session(ALICE, "x+1=2").unwrap();
    let generated = engine.generate(ALICE).await.unwrap();
    let id = generated.offers[0].id.to_string();

    let SelectOutcome::AwaitingParameters { pending, .. } =
        engine.select(ALICE, &id).await.unwrap()
    else {
        panic!("expected parameters to be requested");
    };
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].prompt, "value for k?");
    assert_eq!(
        engine.phase(ALICE).await,
        Some(SessionPhase::AwaitingParameterInput)
    );
    assert!(matches!(
        engine.apply(ALICE).await,
        Err(OrchestratorError::Phase(PhaseError::IllegalTransition { .. }))
    ));

    assert_eq!(
        engine.supply_parameter(ALICE, "q", "1").await.unwrap(),
        FillOutcome::UnknownParameter("q".into())
    );
    let FillOutcome::Complete(candidate) = engine.supply_parameter(ALICE, "k", "3").await.unwrap()
    else {
        panic!("expected the fill to complete");
    };
    assert_eq!(candidate.description, "multiply both sides by 3");
    assert_eq!(candidate.expression, "3(x+1) = 2*3");
    assert!(candidate.is_concrete());
    assert!(candidate.definitions().is_empty());
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::Applying));

    client.push_json(&apply_json("3x+3=6", true));
    engine.apply(ALICE).await.unwrap();
    let request = client.last_request().unwrap();
    assert!(request.messages[1].content.contains("3(x+1) = 2*3"));

    // the registered candidate keeps its placeholders
    let offered = engine.registry().resolve_str(&id).unwrap().1;
    assert_eq!(offered.expression, "{k}(x+1) = 2*{k}");
}

#[tokio::test]
async fn test_fill_through_provider() {
    let client = Arc::new(ScriptedClient::new());
    client.push_json(&generation_json(&[parameterized_candidate_json(
        "add {a}",
        "x + {a}",
        "a",
    )]));
    let engine = scripted_engine(&client);
    engine.new_session(ALICE, "x").unwrap();
    let generated = engine.generate(ALICE).await.unwrap();
    engine
        .select(ALICE, &generated.offers[0].id.to_string())
        .await
        .unwrap();

    assert_eq!(
        engine.fill_parameters(ALICE, |_| None).await.unwrap(),
        FillOutcome::Missing("a".into())
    );
    assert_eq!(
        engine.phase(ALICE).await,
        Some(SessionPhase::AwaitingParameterInput)
    );

    let outcome = engine
        .fill_parameters(ALICE, |definition| {
            (definition.name == "a").then(|| "5".to_string())
        })
        .await
        .unwrap();
    assert!(matches!(outcome, FillOutcome::Complete(ref c) if c.expression == "x + 5"));
}

#[tokio::test]
async fn test_rollback_restores_offers_and_forgets_later_ones() {
    let client = Arc::new(ScriptedClient::new());
    let (engine, id) = selected_engine(&client).await;
    client
        .push_json(&apply_json("2x+2=4", true))
        .push_json(&generation_json(&[candidate_json("subtract 2", "2x=2", "subtract")]));
    engine.apply(ALICE).await.unwrap();
    let later = engine.generate(ALICE).await.unwrap();
    let later_id = later.offers[0].id;

    assert!(!engine.rollback(ALICE, RollbackTarget::Ordinal(5)).await.unwrap());
    assert!(!engine.rollback(ALICE, RollbackTarget::Ordinal(-1)).await.unwrap());
    assert_eq!(engine.summary(ALICE).await.unwrap().total_steps, 2);

    assert!(engine.rollback(ALICE, RollbackTarget::Ordinal(0)).await.unwrap());
    assert_eq!(engine.summary(ALICE).await.unwrap().total_steps, 1);
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::AwaitingSelection));
    assert!(engine.registry().resolve(&later_id).is_none());

    let offers = engine.offers(ALICE).await.unwrap();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].id.to_string(), id);
    assert!(matches!(
        engine.select(ALICE, &id).await.unwrap(),
        SelectOutcome::ReadyToApply(_)
    ));
}

#[tokio::test]
async fn test_rollback_by_id() {
    let client = Arc::new(ScriptedClient::new());
    let (engine, _) = selected_engine(&client).await;
    client.push_json(&apply_json("2x+2=4", true));
    engine.apply(ALICE).await.unwrap();

    let first = engine.summary(ALICE).await.unwrap().steps[0].id;
    assert!(engine.rollback(ALICE, RollbackTarget::Id(first)).await.unwrap());
    assert_eq!(engine.summary(ALICE).await.unwrap().total_steps, 1);
}

#[tokio::test]
async fn test_progress_recommendation_outside_chain_is_withdrawn() {
    let client = Arc::new(ScriptedClient::new());
    let (engine, _) = selected_engine(&client).await;
    client
        .push_json(&apply_json("2x+2=4", true))
        .push_json(&progress_json(true, Some(5)))
        .push_json(&progress_json(true, Some(0)))
        .push_json(&progress_json(false, None));
    engine.apply(ALICE).await.unwrap();

    let report = engine.analyze_progress(ALICE).await.unwrap();
    assert_eq!(report.assessment, "regressing");
    assert!(report.recommendation.is_none());

    let report = engine.analyze_progress(ALICE).await.unwrap();
    let recommendation = report.recommendation.unwrap();
    assert_eq!(recommendation.step, 0);
    assert_eq!(recommendation.reason.as_deref(), Some("sign error"));
    assert!(client.last_request().unwrap().messages[1]
        .content
        .contains("Step 1: 2(x+1)=4 | applied: expand | result: 2x+2=4"));

    let report = engine.analyze_progress(ALICE).await.unwrap();
    assert!(report.recommendation.is_none());
    // advisory only
    assert_eq!(engine.summary(ALICE).await.unwrap().total_steps, 2);
}

#[tokio::test]
async fn test_branches_attach_to_current_step() {
    let client = Arc::new(ScriptedClient::new());
    client
        .push_json(&branching_json("cases", &["x = 1", "x = -1"]))
        .push_json(&branching_json("tree", &["y = 0"]))
        .push_json(&json!({"requires_branching": false, "explanation": "linear"}));
    let engine = scripted_engine(&client);
    engine.new_session(ALICE, "|x| = 1").unwrap();

    let BranchingOutcome::Branched { kind, branches, .. } =
        engine.analyze_branching(ALICE).await.unwrap()
    else {
        panic!("expected branches");
    };
    assert_eq!(kind, BranchKind::Cases);
    assert_eq!(
        branches.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(),
        vec!["branch_0", "branch_1"]
    );
    assert_eq!(branches[1].name, "Branch 2");
    assert!(branches.iter().all(|b| b.is_valid));

    let exported = engine.export(ALICE).await.unwrap();
    assert_eq!(exported["steps"][0]["branch_kind"], "cases");
    assert_eq!(exported["steps"][0]["metadata"]["branching_reason"], "splits by sign");
    assert_eq!(exported["steps"][0]["branches"][0]["expression"], "x = 1");

    assert!(matches!(
        engine.analyze_branching(ALICE).await.unwrap(),
        BranchingOutcome::Branched { kind: BranchKind::Alternatives, .. }
    ));
    assert_eq!(
        engine.analyze_branching(ALICE).await.unwrap(),
        BranchingOutcome::Linear {
            explanation: "linear".into()
        }
    );
    assert_eq!(engine.summary(ALICE).await.unwrap().steps[0].branch_count, 1);
}

#[tokio::test]
async fn test_custom_transformation() {
    let client = Arc::new(ScriptedClient::new());
    client.push_json(&apply_json("x = 2", true));
    let engine = scripted_engine(&client);
    engine.new_session(ALICE, "2x = 4").unwrap();

    assert!(matches!(
        engine.apply_custom(ALICE, "   ").await,
        Err(OrchestratorError::EmptyDescription)
    ));
    let outcome = engine.apply_custom(ALICE, "divide by 2").await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Applied { ref result, .. } if result == "x = 2"));

    let exported = engine.export(ALICE).await.unwrap();
    assert_eq!(exported["steps"][1]["chosen_transformation"]["kind"], "custom");
    assert_eq!(
        exported["steps"][1]["chosen_transformation"]["description"],
        "divide by 2"
    );
}

#[tokio::test]
async fn test_verify_needs_no_session() {
    let client = Arc::new(ScriptedClient::new());
    client.push_json(&verification_json(false, "x = 3"));
    let engine = scripted_engine(&client);

    let verdict = engine
        .verify(&VerificationRequest {
            expression: "x + 1 = 4".into(),
            claimed_description: "subtract 1".into(),
            claimed_result: "x = 5".into(),
            user_result: None,
        })
        .await
        .unwrap();
    assert!(!verdict.is_correct);
    assert_eq!(verdict.corrected_result, "x = 3");
    assert!(engine.store().is_empty());
    assert!((client.last_request().unwrap().temperature - 0.1).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_cancel_isolates_users() {
    let client = Arc::new(ScriptedClient::new());
    client.push_json(&expand_offer()).push_json(&expand_offer());
    let engine = scripted_engine(&client);
    engine.new_session(ALICE, "2(x+1)=4").unwrap();
    engine.new_session(BOB, "2(x+1)=4").unwrap();
    let alices = engine.generate(ALICE).await.unwrap();
    engine.generate(BOB).await.unwrap();

    assert!(engine.cancel(ALICE));
    assert_eq!(engine.phase(ALICE).await, Some(SessionPhase::AwaitingTask));
    assert!(engine.registry().resolve(&alices.offers[0].id).is_none());
    assert!(matches!(
        engine.generate(ALICE).await,
        Err(OrchestratorError::Phase(PhaseError::NoTask))
    ));

    assert_eq!(engine.phase(BOB).await, Some(SessionPhase::AwaitingSelection));
    assert_eq!(engine.offers(BOB).await.unwrap().len(), 1);
    assert!(!engine.cancel(UserId(99)));
}

#[tokio::test]
async fn test_session_preconditions() {
    let client = Arc::new(ScriptedClient::new());
    let engine = scripted_engine(&client);

    assert!(matches!(
        engine.new_session(ALICE, "  "),
        Err(OrchestratorError::EmptyTask)
    ));
    assert!(matches!(
        engine.generate(UserId(77)).await,
        Err(OrchestratorError::NoSession(UserId(77)))
    ));

    engine.new_session(ALICE, "x").unwrap();
    assert!(matches!(
        engine.apply(ALICE).await,
        Err(OrchestratorError::Phase(PhaseError::NoSelection))
    ));
    assert!(matches!(
        engine.supply_parameter(ALICE, "a", "1").await,
        Err(OrchestratorError::Phase(PhaseError::NoSelection))
    ));
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn test_export_import_between_users() {
    let client = Arc::new(ScriptedClient::new());
    let (engine, _) = selected_engine(&client).await;
    client.push_json(&apply_json("2x+2=4", true));
    engine.apply(ALICE).await.unwrap();

    let exported = engine.export(ALICE).await.unwrap();
    engine.import(BOB, &exported).unwrap();
    assert_eq!(
        engine.summary(BOB).await.unwrap(),
        engine.summary(ALICE).await.unwrap()
    );
    assert_eq!(engine.phase(BOB).await, Some(SessionPhase::GeneratingCandidates));

    let mut broken = exported.clone();
    broken["steps"][1]["parent_id"] = json!(null);
    assert!(matches!(
        engine.import(BOB, &broken),
        Err(OrchestratorError::Import(_))
    ));
    assert!(matches!(
        engine.import(BOB, &json!({"original_task": "x", "current_step_number": 0, "steps": []})),
        Err(OrchestratorError::Import(_))
    ));
    assert_eq!(engine.summary(BOB).await.unwrap().total_steps, 2);
}

#[tokio::test]
async fn test_transient_failure_is_retried_during_generation() {
    let client = Arc::new(ScriptedClient::new());
    client
        .push_error(CompletionError::Connection("reset".into()))
        .push_json(&expand_offer())
        .push_error(CompletionError::Other("invalid key".into()));
    let engine = scripted_engine(&client);
    engine.new_session(ALICE, "2(x+1)=4").unwrap();

    assert_eq!(engine.generate(ALICE).await.unwrap().offers.len(), 1);
    assert_eq!(client.calls(), 2);

    let err = engine.generate(ALICE).await.unwrap_err();
    assert!(err.aborts_operation());
    assert!(!err.is_retryable());
    assert_eq!(client.calls(), 3);
    // offers from the earlier round survive the failed one
    assert_eq!(engine.offers(ALICE).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sessions_progress_concurrently() {
    let client = Arc::new(ScriptedClient::new());
    client.push_json(&expand_offer()).push_json(&expand_offer());
    let engine = scripted_engine(&client);
    engine.new_session(ALICE, "2(x+1)=4").unwrap();
    engine.new_session(BOB, "2(x+1)=4").unwrap();

    let (a, b) = futures::future::join(engine.generate(ALICE), engine.generate(BOB)).await;
    assert_ne!(a.unwrap().offers[0].id, b.unwrap().offers[0].id);
    assert_eq!(engine.registry().len(), 2);
}

/// Client whose replies never arrive
struct StalledClient;

#[async_trait]
impl CompletionClient for StalledClient {
    async fn complete(
        &self,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_apply_leaves_session_intact() {
    let engine = SessionOrchestrator::new(StalledClient, test_config());
    engine.new_session(ALICE, "2x = 4").unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_secs(5), engine.apply_custom(ALICE, "divide by 2"))
            .await;
    assert!(abandoned.is_err());

    assert_eq!(engine.summary(ALICE).await.unwrap().total_steps, 1);
    assert_eq!(
        engine.phase(ALICE).await,
        Some(SessionPhase::GeneratingCandidates)
    );
}

/// Client that holds every reply until the gate is opened
struct GatedClient {
    gate: Notify,
    inner: ScriptedClient,
}

#[async_trait]
impl CompletionClient for GatedClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        self.gate.notified().await;
        self.inner.complete(request).await
    }
}

#[tokio::test]
async fn test_session_replaced_mid_generation_releases_its_offers() {
    let client = Arc::new(GatedClient {
        gate: Notify::new(),
        inner: ScriptedClient::new(),
    });
    client
        .inner
        .push_json(&expand_offer())
        .push_json(&expand_offer());
    let engine = SessionOrchestrator::new(Arc::clone(&client), test_config());
    engine.new_session(ALICE, "2(x+1)=4").unwrap();

    client.gate.notify_one();
    let first = engine.generate(ALICE).await.unwrap();
    assert_eq!(engine.registry().len(), 1);

    // the replacement happens while the second generation holds the lock
    let (second, ()) = futures::future::join(engine.generate(ALICE), async {
        engine.new_session(ALICE, "x + 1 = 2").unwrap();
        assert_eq!(engine.registry().len(), 1);
        client.gate.notify_one();
    })
    .await;

    assert!(second.unwrap().offers.is_empty());
    assert!(engine.registry().is_empty());
    assert!(engine.registry().resolve(&first.offers[0].id).is_none());
    assert_eq!(
        engine.phase(ALICE).await,
        Some(SessionPhase::GeneratingCandidates)
    );
}

#[tokio::test(start_paused = true)]
async fn test_idle_sessions_are_evicted_with_their_offers() {
    let client = Arc::new(ScriptedClient::new());
    client.push_json(&expand_offer());
    let engine = SessionOrchestrator::new(
        Arc::clone(&client),
        test_config().with_idle_timeout(Duration::from_secs(60)),
    );
    engine.new_session(ALICE, "2(x+1)=4").unwrap();
    engine.generate(ALICE).await.unwrap();
    assert_eq!(engine.registry().len(), 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    engine.new_session(BOB, "x").unwrap();
    tokio::time::advance(Duration::from_secs(45)).await;

    assert_eq!(engine.evict_idle(), 1);
    assert!(engine.registry().is_empty());
    assert_eq!(engine.phase(ALICE).await, None);
    assert!(engine.phase(BOB).await.is_some());
}
