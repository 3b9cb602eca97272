use super::tokenizer::escape;
use crate::query::{OrderTarget, OrderTerm, WhereNode};
use serde_json::Value;

/// Render filter nodes in the `where` grammar. Parsing the result yields the
/// same nodes.
pub fn stringify_where(nodes: &[WhereNode]) -> String {
    nodes.iter().map(stringify_node).collect::<Vec<_>>().join(",")
}

fn stringify_node(node: &WhereNode) -> String {
    match node {
        WhereNode::Condition { field, operator, value } => {
            format!("{}[{}][{}]", escape(field), operator.as_str(), stringify_value(value))
        }
        WhereNode::Some(children) => format!("some:[{}]", stringify_where(children)),
        WhereNode::Every(children) => format!("every:[{}]", stringify_where(children)),
    }
}

fn stringify_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) if s.trim().eq_ignore_ascii_case("null") => {
            // Escaped so it parses back as text, not as null
            let start = s.len() - s.trim_start().len();
            format!("{}\\{}", &s[..start], &s[start..])
        }
        Value::String(s) => escape(s),
        Value::Array(items) => items.iter().map(stringify_value).collect::<Vec<_>>().join(","),
        Value::Object(_) => escape(&value.to_string()),
        other => other.to_string(),
    }
}

/// `field:asc,:structure:desc`
pub fn stringify_order(terms: &[OrderTerm]) -> String {
    terms
        .iter()
        .map(|term| match &term.target {
            OrderTarget::Field(field) => format!("{field}:{}", term.direction.as_str()),
            OrderTarget::Search(structure) => format!(":{structure}:{}", term.direction.as_str()),
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::WhereOperator;
    use crate::schema::SortDirection;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_stringify_where() {
        let nodes = vec![
            WhereNode::condition("price", WhereOperator::Between, json!([10, 20.5])),
            WhereNode::Some(vec![
                WhereNode::condition("name", WhereOperator::Eq, json!("a,b")),
                WhereNode::condition("category", WhereOperator::Eq, Value::Null),
            ]),
        ];
        assert_eq!(
            stringify_where(&nodes),
            r"price[between][10,20.5],some:[name[eq][a\,b],category[eq][null]]"
        );
    }

    #[test]
    fn test_stringify_order() {
        let terms = vec![
            OrderTerm {
                target: OrderTarget::Field("price".into()),
                direction: SortDirection::Desc,
            },
            OrderTerm {
                target: OrderTarget::Search("default".into()),
                direction: SortDirection::Asc,
            },
        ];
        assert_eq!(stringify_order(&terms), "price:desc,:default:asc");
    }
}
