//! Idempotency keys.
//!
//! The same logical operation must resolve to the same key regardless of
//! retries, so keys are built from canonical JSON: object keys sorted
//! lexicographically at every level, numbers in serde_json's shortest
//! round-trip form, no whitespace. The workflow key also folds in today's
//! date, rotating keys daily.

use chrono::NaiveDate;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Render a value as canonical JSON.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json's string rendering handles escaping.
            out.push_str(&Value::String(s.clone()).to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 of a string, hex-encoded.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Key for one logical workflow start:
/// `workflow:{type}:{user}:{sha256(canonical fingerprint)}`.
pub fn workflow_key(
    workflow_type: &str,
    user_id: Option<&str>,
    input: &Value,
    context: &Value,
    date: NaiveDate,
) -> String {
    let user = user_id.unwrap_or("anonymous");
    let fingerprint = canonical_json(&json!({
        "type": workflow_type,
        "userId": user,
        "input": input,
        "context": context,
        "date": date.to_string(),
    }));
    format!(
        "workflow:{workflow_type}:{user}:{}",
        sha256_hex(&fingerprint)
    )
}

/// Key for one logical step execution within a workflow:
/// `step:{name}:{sha256(canonical fingerprint)}`.
pub fn step_key(workflow_key: &str, name: &str, input: &Value) -> String {
    let fingerprint = canonical_json(&json!({
        "workflowKey": workflow_key,
        "name": name,
        "input": input,
    }));
    format!("step:{name}:{}", sha256_hex(&fingerprint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_sorts_keys_at_every_level() {
        let a = json!({ "b": { "z": 1, "a": 2 }, "a": [ { "y": 1, "x": 2 } ] });
        let b = json!({ "a": [ { "x": 2, "y": 1 } ], "b": { "a": 2, "z": 1 } });
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            canonical_json(&a),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn canonical_has_no_whitespace_and_escapes_strings() {
        let value = json!({ "msg": "line\nbreak \"quoted\"" });
        let canon = canonical_json(&value);
        assert!(!canon.contains('\n'));
        assert!(canon.contains(r#"\n"#));
        assert!(canon.contains(r#"\""#));
    }

    #[test]
    fn canonical_numbers_round_trip() {
        let value = json!({ "int": 42, "float": 1.5, "neg": -7 });
        assert_eq!(canonical_json(&value), r#"{"float":1.5,"int":42,"neg":-7}"#);
    }

    #[test]
    fn workflow_keys_are_stable_for_equal_inputs() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let input = json!({ "contractCode": "0x1", "contractName": "T" });
        let k1 = workflow_key("contract_deployment", Some("u1"), &input, &json!({}), date);
        let k2 = workflow_key("contract_deployment", Some("u1"), &input, &json!({}), date);
        assert_eq!(k1, k2);
        assert!(k1.starts_with("workflow:contract_deployment:u1:"));
    }

    #[test]
    fn workflow_keys_differ_by_user_input_and_date() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let next_day = NaiveDate::from_ymd_opt(2026, 8, 2).unwrap();
        let input = json!({ "a": 1 });

        let base = workflow_key("t", Some("u1"), &input, &json!({}), date);
        assert_ne!(
            base,
            workflow_key("t", Some("u2"), &input, &json!({}), date)
        );
        assert_ne!(
            base,
            workflow_key("t", Some("u1"), &json!({ "a": 2 }), &json!({}), date)
        );
        assert_ne!(
            base,
            workflow_key("t", Some("u1"), &input, &json!({}), next_day),
            "keys rotate daily"
        );
    }

    #[test]
    fn key_ignores_input_key_order() {
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let k1 = workflow_key("t", None, &json!({ "a": 1, "b": 2 }), &json!({}), date);
        let k2 = workflow_key("t", None, &json!({ "b": 2, "a": 1 }), &json!({}), date);
        assert_eq!(k1, k2);
    }

    #[test]
    fn step_keys_bind_workflow_name_and_input() {
        let base = step_key("workflow:t:u:abc", "deploy_contract", &json!({ "x": 1 }));
        assert!(base.starts_with("step:deploy_contract:"));
        assert_ne!(
            base,
            step_key("workflow:t:u:abc", "deploy_contract", &json!({ "x": 2 }))
        );
        assert_ne!(
            base,
            step_key("workflow:t:u:other", "deploy_contract", &json!({ "x": 1 }))
        );
    }
}
