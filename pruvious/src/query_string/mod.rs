//! Parse URL query parameters into query options.
//!
//! Recognized keys: `select`, `where`, `order`, `group`, `limit`, `offset`,
//! `page`, `perPage`, `populate`, `search`, `search:<structure>` and
//! `language`. Unknown keys are ignored. Problems never abort parsing; they
//! are collected in [`ParsedQueryString::errors`].
//!
//! The `where` grammar is a comma separated list of `field[operator][value]`
//! conditions and `some:[...]` / `every:[...]` groups. Lists and pairs are
//! comma separated inside the value brackets, `null` (any case) is the null
//! literal and a backslash escapes the next character.

pub mod stringify;
pub mod tokenizer;

pub use stringify::{stringify_order, stringify_where};

use crate::fields::builtin::number_value;
use crate::fields::ValueKind;
use crate::query::builder::check_condition;
use crate::query::{OrderTarget, OrderTerm, WhereNode, WhereOperator};
use crate::schema::{ResolvedCollection, ResolvedField, SortDirection};
use crate::search::split_keywords;
use serde_json::Value;
use std::collections::BTreeMap;
use tokenizer::{build_tree, split_raw, split_unescaped, tokenize, unescape, TokenTree};

const INVALID_WHERE: &str = "Invalid where clause";

/// Query options parsed from a query string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQueryString {
    pub select: Option<Vec<String>>,
    pub filter: Vec<WhereNode>,
    pub search: BTreeMap<String, Vec<String>>,
    pub order: Vec<OrderTerm>,
    pub group: Vec<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub populate: Option<bool>,
    pub language: Option<String>,
    /// Distinct messages, in the order they were found
    pub errors: Vec<String>,
}

impl ParsedQueryString {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        push_error(&mut self.errors, message.into());
    }
}

fn push_error(errors: &mut Vec<String>, message: String) {
    if !errors.contains(&message) {
        errors.push(message);
    }
}

/// Parse decoded `(key, value)` pairs for `collection`.
pub fn parse_query_string(collection: &ResolvedCollection, pairs: &[(String, String)]) -> ParsedQueryString {
    let mut parsed = ParsedQueryString::default();
    let mut page: Option<u64> = None;
    let mut per_page: Option<u64> = None;

    for (key, value) in pairs {
        match key.as_str() {
            "select" => parse_select(collection, value, &mut parsed),
            "where" => {
                let nodes = parse_where(collection, value, &mut parsed.errors);
                parsed.filter.extend(nodes);
            }
            "order" => parse_order(collection, value, &mut parsed),
            "group" => {
                for field in split_list(value) {
                    match visible_field(collection, &field) {
                        Some(_) if !parsed.group.contains(&field) => parsed.group.push(field),
                        Some(_) => {}
                        None => parsed.error(format!("The field '{field}' does not exist")),
                    }
                }
            }
            "limit" => parsed.limit = parse_count(key, value, &mut parsed.errors),
            "offset" => parsed.offset = parse_count(key, value, &mut parsed.errors),
            "page" => page = parse_count(key, value, &mut parsed.errors),
            "perPage" => per_page = parse_count(key, value, &mut parsed.errors),
            "populate" => match parse_booleanish(value) {
                Some(populate) => parsed.populate = Some(populate),
                None => parsed.error("The 'populate' parameter must be a boolean"),
            },
            "language" => {
                let language = value.trim().to_ascii_lowercase();
                if !language.is_empty() {
                    parsed.language = Some(language);
                }
            }
            _ => {
                if let Some(structure) = search_key(key) {
                    if collection.search_structure(structure).is_some() {
                        parsed.search.insert(structure.to_string(), split_keywords(value));
                    } else {
                        parsed.error(format!("The search structure '{structure}' does not exist"));
                    }
                } else {
                    log::trace!("{}: ignoring query parameter '{key}'", collection.name);
                }
            }
        }
    }

    match (page, per_page) {
        (Some(_), _) if parsed.offset.is_some() => {
            parsed.error("The 'page' and 'offset' parameters cannot be used together");
        }
        (Some(page), Some(per_page)) => {
            if page == 0 {
                parsed.error("The 'page' parameter must be greater than 0");
            } else {
                parsed.offset = Some((page - 1) * per_page);
                parsed.limit = Some(per_page);
            }
        }
        (Some(_), None) => parsed.error("The 'page' parameter requires 'perPage'"),
        (None, Some(per_page)) => parsed.limit = Some(per_page),
        (None, None) => {}
    }
    parsed
}

/// Parse an encoded query such as `where=price[gt][10]&limit=5`.
pub fn parse_raw_query(collection: &ResolvedCollection, query: &str) -> ParsedQueryString {
    let mut pairs = Vec::new();
    let mut errors = Vec::new();
    for part in query.trim_start_matches('?').split('&').filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        match (decode(key), decode(value)) {
            (Some(key), Some(value)) => pairs.push((key, value)),
            _ => push_error(&mut errors, format!("Invalid percent-encoding in '{part}'")),
        }
    }
    let mut parsed = parse_query_string(collection, &pairs);
    for error in errors {
        parsed.error(error);
    }
    parsed
}

fn decode(text: &str) -> Option<String> {
    urlencoding::decode(&text.replace('+', " "))
        .ok()
        .map(|s| s.into_owned())
}

fn search_key(key: &str) -> Option<&str> {
    if key == "search" {
        Some("default")
    } else {
        key.strip_prefix("search:").filter(|s| !s.is_empty())
    }
}

/// Fields exposed to query strings. Protected fields are hidden.
fn visible_field<'c>(collection: &'c ResolvedCollection, name: &str) -> Option<&'c ResolvedField> {
    collection.field(name).filter(|f| !f.protected)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_select(collection: &ResolvedCollection, value: &str, parsed: &mut ParsedQueryString) {
    if value.trim() == "*" {
        parsed.select = Some(
            collection
                .fields
                .iter()
                .filter(|f| !f.protected)
                .map(|f| f.name.clone())
                .collect(),
        );
        return;
    }
    let mut select = Vec::new();
    for field in split_list(value) {
        if visible_field(collection, &field).is_none() {
            parsed.error(format!("The field '{field}' does not exist"));
        } else if !select.contains(&field) {
            select.push(field);
        }
    }
    parsed.select = Some(select);
}

fn parse_order(collection: &ResolvedCollection, value: &str, parsed: &mut ParsedQueryString) {
    for item in split_list(value) {
        let (target, direction) = match item.strip_prefix(':') {
            Some(rest) => {
                let (structure, direction) = rest.split_once(':').unwrap_or((rest, "asc"));
                if collection.search_structure(structure).is_none() {
                    parsed.error(format!("The search structure '{structure}' does not exist"));
                    continue;
                }
                (OrderTarget::Search(structure.to_string()), direction)
            }
            None => {
                let (field, direction) = item.split_once(':').unwrap_or((item.as_str(), "asc"));
                if visible_field(collection, field).is_none() {
                    parsed.error(format!("The field '{field}' does not exist"));
                    continue;
                }
                (OrderTarget::Field(field.to_string()), direction)
            }
        };
        match SortDirection::parse(direction) {
            Some(direction) => parsed.order.push(OrderTerm { target, direction }),
            None => parsed.error(format!("Invalid sort direction '{direction}'")),
        }
    }
}

fn parse_count(key: &str, value: &str, errors: &mut Vec<String>) -> Option<u64> {
    match value.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            push_error(errors, format!("The '{key}' parameter must be a non-negative integer"));
            None
        }
    }
}

fn parse_booleanish(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

// ── where ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum GroupKind {
    Some,
    Every,
}

#[derive(Debug)]
enum State {
    Field,
    Group(GroupKind),
    Operator(String),
    Value(String, WhereOperator),
    SkipValue,
}

/// Parse the `where` grammar into filter nodes. Malformed fragments are
/// skipped and reported in `errors`.
pub fn parse_where(collection: &ResolvedCollection, input: &str, errors: &mut Vec<String>) -> Vec<WhereNode> {
    let (tree, balanced) = build_tree(tokenize(input));
    if !balanced {
        push_error(errors, INVALID_WHERE.to_string());
    }
    parse_nodes(collection, &tree, errors)
}

fn parse_nodes(collection: &ResolvedCollection, tree: &[TokenTree], errors: &mut Vec<String>) -> Vec<WhereNode> {
    let mut nodes = Vec::new();
    let mut state = State::Field;

    for item in tree {
        state = match (state, item) {
            (State::Field, TokenTree::Literal(text)) => field_state(text, errors),
            (State::Field, TokenTree::Group(_)) => State::Field,
            (State::Group(kind), TokenTree::Group(children)) => {
                let inner = parse_nodes(collection, children, errors);
                if !inner.is_empty() {
                    nodes.push(match kind {
                        GroupKind::Some => WhereNode::Some(inner),
                        GroupKind::Every => WhereNode::Every(inner),
                    });
                }
                State::Field
            }
            (State::Operator(field), TokenTree::Group(children)) => {
                let name = group_text(children).map(|raw| unescape(&raw)).unwrap_or_default();
                let operator = WhereOperator::parse(name.trim());
                match operator {
                    Some(operator) => State::Value(field, operator),
                    None => {
                        push_error(errors, format!("Invalid operator '{name}'"));
                        State::SkipValue
                    }
                }
            }
            (State::Value(field, operator), TokenTree::Group(children)) => {
                match group_text(children) {
                    Some(raw) => match build_condition(collection, &field, operator, &raw) {
                        Ok(node) => nodes.push(node),
                        Err(message) => push_error(errors, message),
                    },
                    None => push_error(errors, format!("Invalid value for the field '{field}'")),
                }
                State::Field
            }
            (State::SkipValue, TokenTree::Group(_)) => State::Field,
            (_, TokenTree::Literal(text)) => {
                push_error(errors, INVALID_WHERE.to_string());
                field_state(text, errors)
            }
        };
    }

    if !matches!(state, State::Field) {
        push_error(errors, INVALID_WHERE.to_string());
    }
    nodes
}

/// Read a literal between conditions. Its last name starts the next condition
/// or group; any name before it has no operator.
fn field_state(text: &str, errors: &mut Vec<String>) -> State {
    let mut pending: Option<String> = None;
    for piece in split_unescaped(text, ',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        if pending.is_some() {
            push_error(errors, INVALID_WHERE.to_string());
        }
        pending = Some(piece.to_string());
    }
    match pending {
        None => State::Field,
        Some(name) if name.eq_ignore_ascii_case("some:") => State::Group(GroupKind::Some),
        Some(name) if name.eq_ignore_ascii_case("every:") => State::Group(GroupKind::Every),
        Some(name) => State::Operator(name),
    }
}

/// Raw text of a bracket group. Nested groups are not allowed here.
fn group_text(children: &[TokenTree]) -> Option<String> {
    let mut text = String::new();
    for child in children {
        match child {
            TokenTree::Literal(s) => text.push_str(s),
            TokenTree::Group(_) => return None,
        }
    }
    Some(text)
}

fn build_condition(
    collection: &ResolvedCollection,
    field: &str,
    operator: WhereOperator,
    raw: &str,
) -> std::result::Result<WhereNode, String> {
    let resolved =
        visible_field(collection, field).ok_or_else(|| format!("The field '{field}' does not exist"))?;
    let value = if operator.is_pattern() {
        Value::String(unescape(raw))
    } else if operator.expects_list() || operator.expects_pair() {
        let items = split_raw(raw, ',')
            .iter()
            .map(|item| cast_scalar(resolved, item))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Value::Array(items)
    } else {
        cast_scalar(resolved, raw)?
    };
    check_condition(collection, field, operator, &value)?;
    Ok(WhereNode::condition(field, operator, value))
}

/// Cast one textual operand by the kind of value the field holds.
///
/// `raw` still carries its escapes: an escaped `\null` is the text "null".
fn cast_scalar(field: &ResolvedField, raw: &str) -> std::result::Result<Value, String> {
    if raw.trim().eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    let text = unescape(raw);
    let trimmed = text.trim();
    match field.behavior().value_kind() {
        ValueKind::Number => trimmed
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(number_value)
            .ok_or_else(|| format!("The value '{trimmed}' of the field '{}' must be a number", field.name)),
        ValueKind::Boolean => match trimmed.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("The value '{trimmed}' of the field '{}' must be a boolean", field.name)),
        },
        _ => Ok(Value::String(text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::schema::Schema;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SCHEMA: &str = r#"
collections:
  products:
    search:
      default: [{ field: name }]
    fields:
      name: { type: text }
      price: { type: number }
      active: { type: switch }
      secret: { type: text, protected: true }
"#;

    fn schema() -> Schema {
        Schema::from_yaml(SCHEMA, EngineConfig::default()).unwrap()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn where_nodes(input: &str) -> (Vec<WhereNode>, Vec<String>) {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let mut errors = Vec::new();
        let nodes = parse_where(products, input, &mut errors);
        (nodes, errors)
    }

    #[test]
    fn test_parse_conditions() {
        let (nodes, errors) = where_nodes("price[gt][10],name[=][Lamp]");
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(
            nodes,
            vec![
                WhereNode::condition("price", WhereOperator::Gt, json!(10)),
                WhereNode::condition("name", WhereOperator::Eq, json!("Lamp")),
            ]
        );
    }

    #[test]
    fn test_parse_groups_lists_and_null() {
        let (nodes, errors) =
            where_nodes(r"some:[price[between][1,9.5],every:[active[eq][true],name[in][a\,b,NULL]]]");
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(
            nodes,
            vec![WhereNode::Some(vec![
                WhereNode::condition("price", WhereOperator::Between, json!([1, 9.5])),
                WhereNode::Every(vec![
                    WhereNode::condition("active", WhereOperator::Eq, json!(true)),
                    WhereNode::condition("name", WhereOperator::In, json!(["a,b", null])),
                ]),
            ])]
        );
    }

    #[test]
    fn test_invalid_fragments_are_skipped() {
        let (nodes, errors) = where_nodes("secret[=][x],price[approx][1],price[gt][abc],name[like][a%],price");
        assert_eq!(nodes, vec![WhereNode::condition("name", WhereOperator::Like, json!("a%"))]);
        assert_eq!(
            errors,
            vec![
                "The field 'secret' does not exist",
                "Invalid operator 'approx'",
                "The value 'abc' of the field 'price' must be a number",
                "Invalid where clause",
            ]
        );
    }

    #[test]
    fn test_operator_checks_apply() {
        let (nodes, errors) = where_nodes("price[like][1%],price[between][1]");
        assert!(nodes.is_empty());
        assert_eq!(
            errors,
            vec![
                "The operator 'like' cannot be used on the field 'price'",
                "The operator 'between' requires exactly two values",
            ]
        );
    }

    #[test]
    fn test_stringified_where_parses_back() {
        let (nodes, errors) = where_nodes(r"some:[price[gte][2.5],name[in][x\[1\],y]],active[ne][false]");
        assert!(errors.is_empty(), "{errors:?}");
        let (reparsed, errors) = where_nodes(&stringify_where(&nodes));
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(reparsed, nodes);
    }

    #[test]
    fn test_null_text_survives_stringify() {
        let nodes = vec![
            WhereNode::condition("name", WhereOperator::Eq, json!("null")),
            WhereNode::condition("name", WhereOperator::In, json!(["NULL", null])),
        ];
        let text = stringify_where(&nodes);
        assert_eq!(text, r"name[eq][\null],name[in][\NULL,null]");
        let (reparsed, errors) = where_nodes(&text);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(reparsed, nodes);

        let (nodes, _) = where_nodes("name[=][null]");
        assert_eq!(nodes, vec![WhereNode::condition("name", WhereOperator::Eq, Value::Null)]);
    }

    #[test]
    fn test_parse_query_string() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let parsed = parse_query_string(
            products,
            &pairs(&[
                ("select", "name,price,name"),
                ("where", "price[lt][100]"),
                ("order", "price:desc,:default"),
                ("group", "active"),
                ("page", "3"),
                ("perPage", "20"),
                ("populate", "1"),
                ("search", "Desk  LAMP"),
                ("language", "EN"),
                ("utm_source", "mail"),
            ]),
        );
        assert!(parsed.is_valid(), "{:?}", parsed.errors);
        assert_eq!(parsed.select, Some(vec!["name".to_string(), "price".to_string()]));
        assert_eq!(parsed.filter, vec![WhereNode::condition("price", WhereOperator::Lt, json!(100))]);
        assert_eq!(
            parsed.order,
            vec![
                OrderTerm {
                    target: OrderTarget::Field("price".into()),
                    direction: SortDirection::Desc,
                },
                OrderTerm {
                    target: OrderTarget::Search("default".into()),
                    direction: SortDirection::Asc,
                },
            ]
        );
        assert_eq!(parsed.group, vec!["active"]);
        assert_eq!((parsed.offset, parsed.limit), (Some(40), Some(20)));
        assert_eq!(parsed.populate, Some(true));
        assert_eq!(parsed.search["default"], vec!["desk", "lamp"]);
        assert_eq!(parsed.language.as_deref(), Some("en"));
    }

    #[test]
    fn test_query_string_errors_are_distinct() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let parsed = parse_query_string(
            products,
            &pairs(&[
                ("select", "nope,nope"),
                ("order", "nope:desc,price:sideways"),
                ("limit", "-1"),
                ("page", "2"),
                ("offset", "5"),
                ("search:missing", "x"),
                ("populate", "maybe"),
            ]),
        );
        assert_eq!(
            parsed.errors,
            vec![
                "The field 'nope' does not exist",
                "Invalid sort direction 'sideways'",
                "The 'limit' parameter must be a non-negative integer",
                "The search structure 'missing' does not exist",
                "The 'populate' parameter must be a boolean",
                "The 'page' and 'offset' parameters cannot be used together",
            ]
        );
        assert_eq!(parsed.select, Some(vec![]));
    }

    #[test]
    fn test_select_star_hides_protected_fields() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let parsed = parse_query_string(products, &pairs(&[("select", "*")]));
        let select = parsed.select.unwrap();
        assert!(select.contains(&"name".to_string()));
        assert!(!select.contains(&"secret".to_string()));
    }

    #[test]
    fn test_parse_raw_query_decodes() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let parsed = parse_raw_query(products, "?where=name%5Beq%5D%5BDesk+lamp%5D&limit=5");
        assert!(parsed.is_valid(), "{:?}", parsed.errors);
        assert_eq!(parsed.filter, vec![WhereNode::condition("name", WhereOperator::Eq, json!("Desk lamp"))]);
        assert_eq!(parsed.limit, Some(5));

        let parsed = parse_raw_query(products, "where=%E0%A4%A");
        assert_eq!(parsed.errors, vec!["Invalid percent-encoding in 'where=%E0%A4%A'"]);
    }
}
