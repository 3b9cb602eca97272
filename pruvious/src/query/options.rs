use crate::schema::{ResolvedCollection, SortDirection};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A filter comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WhereOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    NotBetween,
    In,
    NotIn,
    Like,
    NotLike,
    ILike,
    NotILike,
}

impl WhereOperator {
    pub const ALL: [WhereOperator; 14] = [
        WhereOperator::Eq,
        WhereOperator::Ne,
        WhereOperator::Gt,
        WhereOperator::Gte,
        WhereOperator::Lt,
        WhereOperator::Lte,
        WhereOperator::Between,
        WhereOperator::NotBetween,
        WhereOperator::In,
        WhereOperator::NotIn,
        WhereOperator::Like,
        WhereOperator::NotLike,
        WhereOperator::ILike,
        WhereOperator::NotILike,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WhereOperator::Eq => "eq",
            WhereOperator::Ne => "ne",
            WhereOperator::Gt => "gt",
            WhereOperator::Gte => "gte",
            WhereOperator::Lt => "lt",
            WhereOperator::Lte => "lte",
            WhereOperator::Between => "between",
            WhereOperator::NotBetween => "notBetween",
            WhereOperator::In => "in",
            WhereOperator::NotIn => "notIn",
            WhereOperator::Like => "like",
            WhereOperator::NotLike => "notLike",
            WhereOperator::ILike => "ilike",
            WhereOperator::NotILike => "notIlike",
        }
    }

    /// Parse an operator name or its symbolic alias (`=`, `!=`, `>`, `>=`, `<`, `<=`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "=" => return Some(WhereOperator::Eq),
            "!=" => return Some(WhereOperator::Ne),
            ">" => return Some(WhereOperator::Gt),
            ">=" => return Some(WhereOperator::Gte),
            "<" => return Some(WhereOperator::Lt),
            "<=" => return Some(WhereOperator::Lte),
            _ => {}
        }
        Self::ALL.iter().copied().find(|op| op.as_str() == s)
    }

    /// `gt`, `gte`, `lt`, `lte`, `between`, `notBetween`
    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            WhereOperator::Gt
                | WhereOperator::Gte
                | WhereOperator::Lt
                | WhereOperator::Lte
                | WhereOperator::Between
                | WhereOperator::NotBetween
        )
    }

    /// `in`, `notIn`
    pub fn expects_list(&self) -> bool {
        matches!(self, WhereOperator::In | WhereOperator::NotIn)
    }

    /// `between`, `notBetween`
    pub fn expects_pair(&self) -> bool {
        matches!(self, WhereOperator::Between | WhereOperator::NotBetween)
    }

    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            WhereOperator::Like | WhereOperator::NotLike | WhereOperator::ILike | WhereOperator::NotILike
        )
    }
}

impl fmt::Display for WhereOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of the filter tree. A list of nodes is an implicit AND.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereNode {
    Condition {
        field: String,
        operator: WhereOperator,
        value: Value,
    },
    /// At least one child matches
    Some(Vec<WhereNode>),
    /// Every child matches
    Every(Vec<WhereNode>),
}

impl WhereNode {
    pub fn condition(field: &str, operator: WhereOperator, value: Value) -> Self {
        WhereNode::Condition {
            field: field.to_string(),
            operator,
            value,
        }
    }

    /// `{ field: { op: value } }`, `{ "$some": [...] }` or `{ "$every": [...] }`
    pub fn to_json(&self) -> Value {
        match self {
            WhereNode::Condition { field, operator, value } => {
                let mut condition = Map::new();
                condition.insert(operator.as_str().to_string(), value.clone());
                let mut node = Map::new();
                node.insert(field.clone(), Value::Object(condition));
                Value::Object(node)
            }
            WhereNode::Some(nodes) => json!({ "$some": nodes.iter().map(WhereNode::to_json).collect::<Vec<_>>() }),
            WhereNode::Every(nodes) => json!({ "$every": nodes.iter().map(WhereNode::to_json).collect::<Vec<_>>() }),
        }
    }

    /// Every field name referenced in this subtree.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            WhereNode::Condition { field, .. } => vec![field.as_str()],
            WhereNode::Some(nodes) | WhereNode::Every(nodes) => nodes.iter().flat_map(WhereNode::fields).collect(),
        }
    }
}

/// Sort target: a field, or the relevance of a search structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrderTarget {
    Field(String),
    Search(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderTerm {
    pub target: OrderTarget,
    pub direction: SortDirection,
}

impl OrderTerm {
    pub fn to_json(&self) -> Value {
        let target = match &self.target {
            OrderTarget::Field(field) => field.clone(),
            OrderTarget::Search(structure) => format!(":{structure}"),
        };
        json!([target, self.direction.as_str()])
    }
}

/// Accumulated builder state.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Selected fields in selection order, no duplicates
    pub select: Vec<String>,
    pub filter: Vec<WhereNode>,
    /// Search structure → lowercase keywords
    pub search: BTreeMap<String, Vec<String>>,
    pub order: Vec<OrderTerm>,
    pub group: Vec<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub populate: bool,
    pub fallback: bool,
    pub language: Option<String>,
}

impl QueryOptions {
    /// Defaults for a collection: every field selected, fallback on.
    pub fn for_collection(collection: &ResolvedCollection) -> Self {
        QueryOptions {
            select: collection.fields.iter().map(|f| f.name.clone()).collect(),
            filter: Vec::new(),
            search: BTreeMap::new(),
            order: Vec::new(),
            group: Vec::new(),
            offset: None,
            limit: None,
            populate: false,
            fallback: true,
            language: None,
        }
    }

    /// The filter tree as JSON, with search keywords folded in.
    pub fn where_json(&self) -> Value {
        let mut nodes: Vec<Value> = self.filter.iter().map(WhereNode::to_json).collect();
        if !self.search.is_empty() {
            let search: Map<String, Value> = self
                .search
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            nodes.push(json!({ "$search": search }));
        }
        Value::Array(nodes)
    }

    pub fn order_json(&self) -> Value {
        Value::Array(self.order.iter().map(OrderTerm::to_json).collect())
    }

    /// Every field referenced by select, where, order and group.
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self.select.iter().map(String::as_str).collect();
        fields.extend(self.filter.iter().flat_map(WhereNode::fields));
        fields.extend(self.order.iter().filter_map(|o| match &o.target {
            OrderTarget::Field(f) => Some(f.as_str()),
            OrderTarget::Search(_) => None,
        }));
        fields.extend(self.group.iter().map(String::as_str));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_operator_aliases() {
        assert_eq!(WhereOperator::parse("="), Some(WhereOperator::Eq));
        assert_eq!(WhereOperator::parse(">="), Some(WhereOperator::Gte));
        assert_eq!(WhereOperator::parse("notIlike"), Some(WhereOperator::NotILike));
        assert_eq!(WhereOperator::parse("approx"), None);
        for op in WhereOperator::ALL {
            assert_eq!(WhereOperator::parse(op.as_str()), Some(op));
        }
    }

    #[test]
    fn test_node_json() {
        let node = WhereNode::Some(vec![
            WhereNode::condition("price", WhereOperator::Gt, json!(10)),
            WhereNode::condition("status", WhereOperator::Eq, json!("active")),
        ]);
        assert_eq!(
            node.to_json(),
            json!({ "$some": [{ "price": { "gt": 10 } }, { "status": { "eq": "active" } }] })
        );
        assert_eq!(node.fields(), vec!["price", "status"]);
    }
}
