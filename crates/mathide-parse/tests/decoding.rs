use mathide_parse::prelude::*;
use mathide_parse::{decode, repair_expression_escapes, DecodeError};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[test]
fn test_single_escaped_generation_is_recovered_by_repair() {
    let text = r#"[{"description":"d","expression":"\sin(x)","kind":"t"}]"#;

    let decoded = decode(text).unwrap();
    assert_eq!(decoded.stage, DecodeStage::ExpressionRepair);

    let items = read_generation(text).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].expression, r"\sin(x)");
    assert_eq!(items[0].kind, "t");
}

#[test]
fn test_apply_response_from_fenced_reply() {
    let text = "The transformation gives:\n```json\n{\n  \"result\": \"\\sqrt{x} = 2\",\n  \"valid\": true,\n  \"explanation\": \"divide\"\n}\n```";
    let response: ApplyResponse = read_record(text).unwrap();
    assert_eq!(response.result, r"\sqrt{x} = 2");
    assert_eq!(response.explanation, "divide");
}

#[test]
fn test_check_response_with_greek_letters() {
    let text = r#"{"solved": true, "confidence": 0.95, "explanation": "\alpha = \pi", "category": "exact"}"#;
    let response: CheckResponse = read_record(text).unwrap();
    assert!(response.solved);
    assert_eq!(response.explanation, r"\alpha = \pi");
}

#[test]
fn test_prose_without_payload() {
    let err = read_record::<CheckResponse>("I could not solve this one.").unwrap_err();
    assert!(err.is_structural());
    assert!(matches!(err, DecodeError::NoPayload { .. }));
}

#[test]
fn test_broken_payload_carries_diagnostics() {
    let err = read_record::<ApplyResponse>(r#"{"result": "x", "valid": tru}"#).unwrap_err();
    match err {
        DecodeError::ParseFailure { original, attempts } => {
            assert_eq!(original, r#"{"result": "x", "valid": tru}"#);
            assert_eq!(attempts.len(), 4);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

fn fragment() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("x"),
        Just("2"),
        Just(" + "),
        Just("= 0"),
        Just(r"\sin("),
        Just(r"\\cos("),
        Just(r"\frac{1}{2}"),
        Just(r"\\frac{3}{4}"),
        Just(r"\alpha "),
        Just(r"\\theta "),
        Just(r"\sqrt{"),
        Just(")"),
        Just("}"),
    ]
}

fn literal_body() -> impl Strategy<Value = String> {
    prop::collection::vec(fragment(), 0..12).prop_map(|parts| parts.concat())
}

proptest! {
    #[test]
    fn prop_repair_is_idempotent(body in literal_body(), key in "[a-z]{1,8}") {
        let text = format!(r#"{{"{key}": "{body}", "n": [1, 2]}}"#);
        let once = repair_expression_escapes(&text);
        let twice = repair_expression_escapes(&once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_repaired_text_is_valid_json(body in literal_body()) {
        let text = format!(r#"{{"e": "{body}"}}"#);
        let repaired = repair_expression_escapes(&text);
        let value: serde_json::Value = serde_json::from_str(&repaired)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert!(value["e"].is_string());
    }

    #[test]
    fn prop_single_escaped_command_is_doubled(prefix in "[a-z0-9 +=]{0,6}") {
        let text = format!(r#"{{"e": "{prefix}\sin(x)"}}"#);
        let repaired = repair_expression_escapes(&text);
        prop_assert!(repaired.contains(r"\\sin(x)"));
    }

    #[test]
    fn prop_decoder_never_panics(text in ".{0,64}") {
        match decode(&text) {
            Ok(_) | Err(DecodeError::ParseFailure { .. }) => {}
            Err(other) => prop_assert!(false, "unexpected error variant: {other:?}"),
        }
    }
}
