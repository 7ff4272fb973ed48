//! Filter Evaluator: a pure predicate engine deciding whether an event
//! payload satisfies a subscription's filter. No I/O, no mutation (§4.2).

use serde_json::Value;

use crate::types::{Condition, Filter, Operator};

/// Evaluates `filter` against `payload`. `None` (absent filter) always
/// matches.
pub fn matches(filter: Option<&Filter>, payload: &Value) -> bool {
    let filter = match filter {
        Some(f) => f,
        None => return true,
    };

    if !filter.link_ids.is_empty() && !set_contains_field(&filter.link_ids, payload, "linkId") {
        return false;
    }
    if !filter.page_ids.is_empty() && !set_contains_field(&filter.page_ids, payload, "pageId") {
        return false;
    }
    if !filter.campaign_ids.is_empty()
        && !set_contains_field(&filter.campaign_ids, payload, "campaignId")
    {
        return false;
    }
    if !filter.tags.is_empty() && !tags_overlap(&filter.tags, payload) {
        return false;
    }

    filter.conditions.iter().all(|c| condition_holds(c, payload))
}

fn set_contains_field(allowed: &[String], payload: &Value, field: &str) -> bool {
    match payload.get(field).and_then(Value::as_str) {
        Some(v) => allowed.iter().any(|a| a == v),
        None => false,
    }
}

fn tags_overlap(required: &[String], payload: &Value) -> bool {
    let payload_tags = match payload.get("tags").and_then(Value::as_array) {
        Some(arr) => arr,
        None => return false,
    };
    required.iter().any(|want| {
        payload_tags
            .iter()
            .any(|t| t.as_str().map(|s| s == want).unwrap_or(false))
    })
}

fn condition_holds(condition: &Condition, payload: &Value) -> bool {
    let v = payload.get(&condition.field_path).cloned().unwrap_or(Value::Null);
    let compare = &condition.compare_value;

    match &condition.operator {
        Operator::Eq => &v == compare,
        Operator::Ne => &v != compare,
        Operator::Gt => numeric_cmp(&v, compare).map(|o| o.is_gt()).unwrap_or(false),
        Operator::Lt => numeric_cmp(&v, compare).map(|o| o.is_lt()).unwrap_or(false),
        Operator::Contains => coerce_string(&v).contains(&coerce_string(compare)),
        Operator::StartsWith => coerce_string(&v).starts_with(&coerce_string(compare)),
        // Lenient per §4.2: an unknown operator that somehow reached
        // evaluation (bypassing the create/update validation path) is
        // treated as vacuously true.
        Operator::Unknown(op) => {
            tracing::warn!(
                operator = %op,
                field = %condition.field_path,
                "unknown filter operator treated as vacuously true"
            );
            true
        }
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let a = a.as_f64()?;
    let b = b.as_f64()?;
    a.partial_cmp(&b)
}

fn coerce_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Condition;
    use serde_json::json;

    fn cond(field: &str, op: Operator, value: Value) -> Condition {
        Condition {
            field_path: field.to_string(),
            operator: op,
            compare_value: value,
        }
    }

    #[test]
    fn absent_filter_always_matches() {
        assert!(matches(None, &json!({"linkId": "L1"})));
    }

    #[test]
    fn link_id_set_constrains() {
        let filter = Filter {
            link_ids: vec!["L1".into()],
            ..Default::default()
        };
        assert!(matches(Some(&filter), &json!({"linkId": "L1"})));
        assert!(!matches(Some(&filter), &json!({"linkId": "L2"})));
        assert!(!matches(Some(&filter), &json!({})));
    }

    #[test]
    fn tags_require_at_least_one_overlap() {
        let filter = Filter {
            tags: vec!["x".into(), "y".into()],
            ..Default::default()
        };
        assert!(matches(Some(&filter), &json!({"tags": ["a", "x"]})));
        assert!(!matches(Some(&filter), &json!({"tags": ["a", "b"]})));
        assert!(!matches(Some(&filter), &json!({})));
    }

    #[test]
    fn eq_and_ne_use_structural_equality() {
        let filter = Filter {
            conditions: vec![cond("status", Operator::Eq, json!("active"))],
            ..Default::default()
        };
        assert!(matches(Some(&filter), &json!({"status": "active"})));
        assert!(!matches(Some(&filter), &json!({"status": "paused"})));

        let filter = Filter {
            conditions: vec![cond("status", Operator::Ne, json!("active"))],
            ..Default::default()
        };
        assert!(matches(Some(&filter), &json!({"status": "paused"})));
        assert!(!matches(Some(&filter), &json!({"status": "active"})));
    }

    #[test]
    fn gt_lt_require_both_sides_numeric() {
        let filter = Filter {
            conditions: vec![cond("amount", Operator::Gt, json!(10))],
            ..Default::default()
        };
        assert!(matches(Some(&filter), &json!({"amount": 20})));
        assert!(!matches(Some(&filter), &json!({"amount": 5})));
        assert!(!matches(Some(&filter), &json!({"amount": "20"})));
    }

    #[test]
    fn contains_and_starts_with_coerce_to_string() {
        let filter = Filter {
            conditions: vec![cond("url", Operator::Contains, json!("example"))],
            ..Default::default()
        };
        assert!(matches(Some(&filter), &json!({"url": "https://example.com"})));
        assert!(!matches(Some(&filter), &json!({"url": "https://other.com"})));

        let filter = Filter {
            conditions: vec![cond("code", Operator::StartsWith, json!("abc"))],
            ..Default::default()
        };
        assert!(matches(Some(&filter), &json!({"code": "abcdef"})));
        assert!(!matches(Some(&filter), &json!({"code": "xabc"})));
    }

    #[test]
    fn absent_field_is_treated_as_null() {
        let filter = Filter {
            conditions: vec![cond("missing", Operator::Eq, Value::Null)],
            ..Default::default()
        };
        assert!(matches(Some(&filter), &json!({})));
    }

    #[test]
    fn unknown_operator_is_lenient() {
        let filter = Filter {
            conditions: vec![cond("status", Operator::Unknown("regex".into()), json!("^a.*"))],
            ..Default::default()
        };
        assert!(matches(Some(&filter), &json!({"status": "anything"})));
    }

    #[test]
    fn conditions_are_conjunctive_and_short_circuit() {
        let filter = Filter {
            conditions: vec![
                cond("status", Operator::Eq, json!("active")),
                cond("amount", Operator::Gt, json!(100)),
            ],
            ..Default::default()
        };
        assert!(matches(Some(&filter), &json!({"status": "active", "amount": 200})));
        assert!(!matches(Some(&filter), &json!({"status": "active", "amount": 5})));
        assert!(!matches(Some(&filter), &json!({"status": "paused", "amount": 200})));
    }

    #[test]
    fn is_deterministic_and_idempotent() {
        let filter = Filter {
            link_ids: vec!["L1".into()],
            conditions: vec![cond("amount", Operator::Gt, json!(10))],
            ..Default::default()
        };
        let payload = json!({"linkId": "L1", "amount": 50});
        let first = matches(Some(&filter), &payload);
        let second = matches(Some(&filter), &payload);
        assert_eq!(first, second);
        assert!(first);
    }
}
