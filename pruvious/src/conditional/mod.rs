//! Conditional logic: per-field rule trees that decide whether a field takes
//! part in validation for a given input.
//!
//! A rule is a JSON object whose keys are field paths relative to the gated
//! field (or `$every` / `$some`), and whose values are either a literal
//! (shorthand for `eq`) or an `{ operator: operand }` object:
//!
//! ```yaml
//! conditionalLogic:
//!   showPrice: true
//!   tags: { gte: 2 }
//!   $some:
//!     - { kind: { eq: physical } }
//!     - { kind: { regexp: "^digital" } }
//! ```
//!
//! Evaluation is pure and recursive.

use crate::error::{PruviousError, Result};
use crate::schema::path::FieldPath;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;

/// A parsed conditional logic tree.
#[derive(Debug, Clone)]
pub enum ConditionalRule {
    /// Every nested rule must match (`$every`, or several keys in one object)
    Every(Vec<ConditionalRule>),
    /// At least one nested rule must match (`$some`)
    Some(Vec<ConditionalRule>),
    /// A test against the value of a dependency field
    Field { path: String, condition: Condition },
}

#[derive(Debug, Clone)]
pub enum Condition {
    Compare(CompareOperator, Value),
    Regexp(Regex),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ConditionalRule {
    /// Parse a rule tree from its JSON/YAML form.
    pub fn parse(rule: &Value) -> Result<Self> {
        let map = rule.as_object().ok_or_else(|| {
            PruviousError::ConditionalLogic("Conditional logic must be an object".into())
        })?;

        let mut rules = Vec::new();
        for (key, value) in map {
            match key.as_str() {
                "$every" => rules.push(ConditionalRule::Every(parse_rule_list(value)?)),
                "$some" => rules.push(ConditionalRule::Some(parse_rule_list(value)?)),
                path => rules.extend(parse_field_conditions(path, value)?),
            }
        }

        Ok(if rules.len() == 1 {
            rules.remove(0)
        } else {
            ConditionalRule::Every(rules)
        })
    }

    /// Evaluate this rule for the field at `field_path` against `input`.
    ///
    /// Fails when a referenced dependency field is absent from the input.
    pub fn evaluate(&self, input: &Value, field_path: &FieldPath) -> Result<bool> {
        match self {
            ConditionalRule::Every(rules) => {
                for rule in rules {
                    if !rule.evaluate(input, field_path)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ConditionalRule::Some(rules) => {
                for rule in rules {
                    if rule.evaluate(input, field_path)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ConditionalRule::Field { path, condition } => {
                let dependency = field_path.resolve_relative(path);
                let value = dependency.lookup(input).ok_or_else(|| {
                    PruviousError::ConditionalLogic(format!(
                        "The field '{dependency}' is required by the conditional logic of '{field_path}'"
                    ))
                })?;
                Ok(condition.matches(value))
            }
        }
    }

    /// Every dependency path referenced by this rule, unresolved.
    pub fn dependencies(&self) -> Vec<&str> {
        match self {
            ConditionalRule::Every(rules) | ConditionalRule::Some(rules) => {
                rules.iter().flat_map(|r| r.dependencies()).collect()
            }
            ConditionalRule::Field { path, .. } => vec![path.as_str()],
        }
    }
}

impl Condition {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Condition::Regexp(re) => match value {
                Value::String(s) => re.is_match(s),
                Value::Number(n) => re.is_match(&n.to_string()),
                Value::Bool(b) => re.is_match(&b.to_string()),
                _ => false,
            },
            Condition::Compare(op, operand) => match op {
                CompareOperator::Eq => loose_eq(value, operand),
                CompareOperator::Ne => !loose_eq(value, operand),
                CompareOperator::Gt => compare(value, operand) == Some(Ordering::Greater),
                CompareOperator::Gte => matches!(
                    compare(value, operand),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
                CompareOperator::Lt => compare(value, operand) == Some(Ordering::Less),
                CompareOperator::Lte => matches!(
                    compare(value, operand),
                    Some(Ordering::Less | Ordering::Equal)
                ),
            },
        }
    }
}

/// Parse a rule tree and evaluate it in one step.
pub fn matches_conditional_logic(input: &Value, field_path: &str, rule: &Value) -> Result<bool> {
    ConditionalRule::parse(rule)?.evaluate(input, &FieldPath::parse_dotted(field_path))
}

fn parse_rule_list(value: &Value) -> Result<Vec<ConditionalRule>> {
    match value {
        Value::Array(items) => items.iter().map(ConditionalRule::parse).collect(),
        Value::Object(_) => Ok(vec![ConditionalRule::parse(value)?]),
        _ => Err(PruviousError::ConditionalLogic(
            "'$every' and '$some' expect a list of rules".into(),
        )),
    }
}

fn parse_field_conditions(path: &str, value: &Value) -> Result<Vec<ConditionalRule>> {
    let operators = match value {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| is_operator(k)) => map,
        literal => {
            return Ok(vec![ConditionalRule::Field {
                path: path.to_string(),
                condition: Condition::Compare(CompareOperator::Eq, literal.clone()),
            }])
        }
    };

    operators
        .iter()
        .map(|(op, operand)| {
            let condition = match op.as_str() {
                "regexp" => {
                    let pattern = operand.as_str().ok_or_else(|| {
                        PruviousError::ConditionalLogic(format!(
                            "The 'regexp' operand for '{path}' must be a string"
                        ))
                    })?;
                    let re = Regex::new(pattern).map_err(|e| {
                        PruviousError::ConditionalLogic(format!(
                            "Invalid regular expression for '{path}': {e}"
                        ))
                    })?;
                    Condition::Regexp(re)
                }
                other => Condition::Compare(compare_operator(other), operand.clone()),
            };
            Ok(ConditionalRule::Field {
                path: path.to_string(),
                condition,
            })
        })
        .collect()
}

fn is_operator(key: &str) -> bool {
    matches!(key, "eq" | "ne" | "gt" | "gte" | "lt" | "lte" | "regexp")
}

fn compare_operator(key: &str) -> CompareOperator {
    match key {
        "ne" => CompareOperator::Ne,
        "gt" => CompareOperator::Gt,
        "gte" => CompareOperator::Gte,
        "lt" => CompareOperator::Lt,
        "lte" => CompareOperator::Lte,
        _ => CompareOperator::Eq,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering comparison. Arrays compare by length against a numeric operand.
fn compare(value: &Value, operand: &Value) -> Option<Ordering> {
    match (value, operand) {
        (Value::Array(items), Value::Number(n)) => (items.len() as f64).partial_cmp(&n.as_f64()?),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gte_matches() {
        let input = json!({ "a": 5 });
        assert!(matches_conditional_logic(&input, "b", &json!({ "a": { "gte": 5 } })).unwrap());
        assert!(!matches_conditional_logic(&input, "b", &json!({ "a": { "gte": 6 } })).unwrap());
    }

    #[test]
    fn test_missing_dependency_fails() {
        let input = json!({ "c": 1 });
        let result = matches_conditional_logic(&input, "b", &json!({ "a": { "gte": 5 } }));
        assert!(matches!(result, Err(PruviousError::ConditionalLogic(_))));
    }

    #[test]
    fn test_literal_is_eq() {
        let input = json!({ "enabled": true });
        assert!(matches_conditional_logic(&input, "x", &json!({ "enabled": true })).unwrap());
        assert!(!matches_conditional_logic(&input, "x", &json!({ "enabled": false })).unwrap());
    }

    #[test]
    fn test_array_compares_length() {
        let input = json!({ "tags": ["a", "b", "c"] });
        assert!(matches_conditional_logic(&input, "x", &json!({ "tags": { "gt": 2 } })).unwrap());
        assert!(matches_conditional_logic(&input, "x", &json!({ "tags": { "lte": 3 } })).unwrap());
        assert!(!matches_conditional_logic(&input, "x", &json!({ "tags": { "lt": 3 } })).unwrap());
    }

    #[test]
    fn test_every_and_some() {
        let input = json!({ "a": 1, "b": "digital-download" });
        let every = json!({ "$every": [{ "a": 1 }, { "b": { "regexp": "^digital" } }] });
        assert!(matches_conditional_logic(&input, "x", &every).unwrap());

        let some = json!({ "$some": [{ "a": 2 }, { "b": { "ne": "physical" } }] });
        assert!(matches_conditional_logic(&input, "x", &some).unwrap());

        let none = json!({ "$some": [{ "a": 2 }, { "b": "physical" }] });
        assert!(!matches_conditional_logic(&input, "x", &none).unwrap());
    }

    #[test]
    fn test_multiple_keys_are_all_required() {
        let input = json!({ "a": 1, "b": 2 });
        assert!(!matches_conditional_logic(&input, "x", &json!({ "a": 1, "b": 3 })).unwrap());
        assert!(matches_conditional_logic(&input, "x", &json!({ "a": { "gte": 1, "lt": 2 } })).unwrap());
    }

    #[test]
    fn test_sibling_inside_repeater() {
        let input = json!({ "items": [{ "kind": "link", "url": "" }, { "kind": "text" }] });
        let rule = json!({ "kind": "link" });
        assert!(matches_conditional_logic(&input, "items.0.url", &rule).unwrap());
        assert!(!matches_conditional_logic(&input, "items.1.url", &rule).unwrap());
    }

    #[test]
    fn test_invalid_regexp_rejected_at_parse() {
        let result = ConditionalRule::parse(&json!({ "a": { "regexp": "(" } }));
        assert!(result.is_err());
    }

    #[test]
    fn test_numbers_compare_loosely() {
        let input = json!({ "a": 5.0 });
        assert!(matches_conditional_logic(&input, "b", &json!({ "a": 5 })).unwrap());
    }
}
