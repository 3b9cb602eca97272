//! Fluent builder for multi-entry collections.
//!
//! Setters mutate the builder in place and return `&mut Self`. Terminal
//! operations borrow it immutably, so one builder can run several terminals.
//! Use `clone()` to branch a query shape.

use super::options::{OrderTarget, OrderTerm, QueryOptions, WhereNode, WhereOperator};
use super::populate::Populator;
use super::{cached, cast_row, compile_nodes, filter_operand, store_row, Engine, FieldErrors, QueryFailure, QueryResult};
use crate::cache::Mutation;
use crate::error::{PruviousError, Result};
use crate::fields::pipeline::Pipeline;
use crate::fields::{Operation, Record, ValueKind};
use crate::query_string::ParsedQueryString;
use crate::schema::{ResolvedCollection, SortDirection};
use crate::search::split_keywords;
use crate::store::{Aggregate, Filter, OrderBy, OrderExpr, Row, StoreQuery};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One page of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paginated {
    pub records: Vec<Record>,
    pub current_page: u64,
    pub last_page: u64,
    pub per_page: u64,
    pub total: u64,
}

// ── Filters ────────────────────────────────────────────────────────

/// Check that a condition can be applied to a field of `collection`.
pub(crate) fn check_condition(
    collection: &ResolvedCollection,
    field: &str,
    operator: WhereOperator,
    value: &Value,
) -> std::result::Result<(), String> {
    let Some(resolved) = collection.field(field) else {
        return Err(format!("The field '{field}' does not exist"));
    };
    if operator.expects_pair() {
        if value.as_array().map_or(true, |items| items.len() != 2) {
            return Err(format!("The operator '{operator}' requires exactly two values"));
        }
    } else if operator.expects_list() {
        if !value.is_array() {
            return Err(format!("The operator '{operator}' requires an array value"));
        }
    } else if operator.is_pattern() && !value.is_string() {
        return Err(format!("The operator '{operator}' requires a string value"));
    }
    if operator.is_ordering() || operator.is_pattern() {
        let kind = resolved.behavior().value_kind();
        let supported = if operator.is_pattern() {
            kind == ValueKind::String
        } else {
            matches!(kind, ValueKind::String | ValueKind::Number)
        };
        if !supported {
            return Err(format!("The operator '{operator}' cannot be used on the field '{field}'"));
        }
    }
    Ok(())
}

/// Filter setters shared by [`QueryBuilder`] and the scopes of `some`/`every`.
pub trait WhereClauses {
    fn scope_collection(&self) -> &ResolvedCollection;

    fn push_node(&mut self, node: WhereNode);

    fn push_warning(&mut self, message: String);

    /// Add `field <operator> value`. Invalid conditions are dropped with a warning.
    fn where_op(&mut self, field: &str, operator: WhereOperator, value: impl Into<Value>) -> &mut Self {
        let value = value.into();
        match check_condition(self.scope_collection(), field, operator, &value) {
            Ok(()) => self.push_node(WhereNode::condition(field, operator, value)),
            Err(message) => {
                log::warn!("{}: {message}", self.scope_collection().name);
                self.push_warning(message);
            }
        }
        self
    }

    fn where_eq(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.where_op(field, WhereOperator::Eq, value)
    }

    fn where_ne(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.where_op(field, WhereOperator::Ne, value)
    }

    fn where_gt(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.where_op(field, WhereOperator::Gt, value)
    }

    fn where_gte(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.where_op(field, WhereOperator::Gte, value)
    }

    fn where_lt(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.where_op(field, WhereOperator::Lt, value)
    }

    fn where_lte(&mut self, field: &str, value: impl Into<Value>) -> &mut Self {
        self.where_op(field, WhereOperator::Lte, value)
    }

    fn where_between(&mut self, field: &str, from: impl Into<Value>, to: impl Into<Value>) -> &mut Self {
        self.where_op(field, WhereOperator::Between, Value::Array(vec![from.into(), to.into()]))
    }

    fn where_not_between(&mut self, field: &str, from: impl Into<Value>, to: impl Into<Value>) -> &mut Self {
        self.where_op(field, WhereOperator::NotBetween, Value::Array(vec![from.into(), to.into()]))
    }

    fn where_in<V: Into<Value>>(&mut self, field: &str, values: Vec<V>) -> &mut Self {
        self.where_op(field, WhereOperator::In, Value::from(values))
    }

    fn where_not_in<V: Into<Value>>(&mut self, field: &str, values: Vec<V>) -> &mut Self {
        self.where_op(field, WhereOperator::NotIn, Value::from(values))
    }

    fn where_like(&mut self, field: &str, pattern: &str) -> &mut Self {
        self.where_op(field, WhereOperator::Like, pattern)
    }

    fn where_not_like(&mut self, field: &str, pattern: &str) -> &mut Self {
        self.where_op(field, WhereOperator::NotLike, pattern)
    }

    fn where_ilike(&mut self, field: &str, pattern: &str) -> &mut Self {
        self.where_op(field, WhereOperator::ILike, pattern)
    }

    fn where_not_ilike(&mut self, field: &str, pattern: &str) -> &mut Self {
        self.where_op(field, WhereOperator::NotILike, pattern)
    }

    fn where_null(&mut self, field: &str) -> &mut Self {
        self.where_op(field, WhereOperator::Eq, Value::Null)
    }

    fn where_not_null(&mut self, field: &str) -> &mut Self {
        self.where_op(field, WhereOperator::Ne, Value::Null)
    }

    /// Match when at least one branch matches. Every branch builds its
    /// conditions in a fresh scope; the conditions of one branch are ANDed.
    fn some(&mut self, branches: &[&dyn Fn(&mut WhereScope<'_>)]) -> &mut Self {
        let (groups, warnings) = run_branches(self.scope_collection(), branches);
        let children: Vec<WhereNode> = groups
            .into_iter()
            .filter_map(|mut nodes| match nodes.len() {
                0 => None,
                1 => nodes.pop(),
                _ => Some(WhereNode::Every(nodes)),
            })
            .collect();
        for warning in warnings {
            self.push_warning(warning);
        }
        if !children.is_empty() {
            self.push_node(WhereNode::Some(children));
        }
        self
    }

    /// Match when every branch matches.
    fn every(&mut self, branches: &[&dyn Fn(&mut WhereScope<'_>)]) -> &mut Self {
        let (groups, warnings) = run_branches(self.scope_collection(), branches);
        let children: Vec<WhereNode> = groups.into_iter().flatten().collect();
        for warning in warnings {
            self.push_warning(warning);
        }
        if !children.is_empty() {
            self.push_node(WhereNode::Every(children));
        }
        self
    }
}

fn run_branches(
    collection: &ResolvedCollection,
    branches: &[&dyn Fn(&mut WhereScope<'_>)],
) -> (Vec<Vec<WhereNode>>, Vec<String>) {
    let mut groups = Vec::with_capacity(branches.len());
    let mut warnings = Vec::new();
    for branch in branches {
        let mut scope = WhereScope::new(collection);
        branch(&mut scope);
        warnings.append(&mut scope.warnings);
        groups.push(scope.nodes);
    }
    (groups, warnings)
}

/// An isolated set of conditions used inside `some`/`every`.
pub struct WhereScope<'c> {
    collection: &'c ResolvedCollection,
    nodes: Vec<WhereNode>,
    warnings: Vec<String>,
}

impl<'c> WhereScope<'c> {
    pub fn new(collection: &'c ResolvedCollection) -> Self {
        WhereScope {
            collection,
            nodes: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn nodes(&self) -> &[WhereNode] {
        &self.nodes
    }
}

impl WhereClauses for WhereScope<'_> {
    fn scope_collection(&self) -> &ResolvedCollection {
        self.collection
    }

    fn push_node(&mut self, node: WhereNode) {
        self.nodes.push(node);
    }

    fn push_warning(&mut self, message: String) {
        self.warnings.push(message);
    }
}

// ── Builder ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct QueryBuilder<'e> {
    engine: &'e Engine,
    collection: &'e ResolvedCollection,
    options: QueryOptions,
    warnings: Vec<String>,
}

impl WhereClauses for QueryBuilder<'_> {
    fn scope_collection(&self) -> &ResolvedCollection {
        self.collection
    }

    fn push_node(&mut self, node: WhereNode) {
        self.options.filter.push(node);
    }

    fn push_warning(&mut self, message: String) {
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }
}

impl<'e> QueryBuilder<'e> {
    pub(crate) fn new(engine: &'e Engine, collection: &'e ResolvedCollection) -> Self {
        QueryBuilder {
            engine,
            collection,
            options: QueryOptions::for_collection(collection),
            warnings: Vec::new(),
        }
    }

    pub fn collection(&self) -> &ResolvedCollection {
        self.collection
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Messages about dropped selections, conditions and sort terms.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn warn(&mut self, message: String) {
        log::warn!("{}: {message}", self.collection.name);
        self.push_warning(message);
    }

    fn known_fields(&mut self, fields: &[&str]) -> Vec<String> {
        let mut known = Vec::new();
        for field in fields {
            if self.collection.has_field(field) {
                if !known.iter().any(|k| k == field) {
                    known.push(field.to_string());
                }
            } else {
                self.warn(format!("The field '{field}' does not exist"));
            }
        }
        known
    }

    // ── Selection ──────────────────────────────────────────────────

    /// Select exactly these fields.
    pub fn select(&mut self, fields: &[&str]) -> &mut Self {
        self.options.select = self.known_fields(fields);
        self
    }

    pub fn select_all(&mut self) -> &mut Self {
        self.options.select = self.collection.fields.iter().map(|f| f.name.clone()).collect();
        self
    }

    pub fn deselect(&mut self, fields: &[&str]) -> &mut Self {
        self.options.select.retain(|f| !fields.contains(&f.as_str()));
        self
    }

    // ── Search, order, grouping, pagination ────────────────────────

    /// Require every keyword of `keywords` in the given search structure.
    pub fn search(&mut self, keywords: &str, structure: &str) -> &mut Self {
        if self.collection.search_structure(structure).is_none() {
            self.warn(format!("The search structure '{structure}' does not exist"));
            return self;
        }
        let keywords = split_keywords(keywords);
        if keywords.is_empty() {
            self.options.search.remove(structure);
        } else {
            self.options.search.insert(structure.to_string(), keywords);
        }
        self
    }

    /// Sort by a field, or by search relevance with `:structure`.
    pub fn order(&mut self, field: &str, direction: SortDirection) -> &mut Self {
        let target = match field.strip_prefix(':') {
            Some(structure) if self.collection.search_structure(structure).is_some() => {
                OrderTarget::Search(structure.to_string())
            }
            Some(structure) => {
                self.warn(format!("The search structure '{structure}' does not exist"));
                return self;
            }
            None if self.collection.has_field(field) => OrderTarget::Field(field.to_string()),
            None => {
                self.warn(format!("The field '{field}' does not exist"));
                return self;
            }
        };
        self.options.order.push(OrderTerm { target, direction });
        self
    }

    /// Records where the keywords occur earlier come first.
    pub fn order_by_search_relevance(&mut self, structure: &str) -> &mut Self {
        self.order(&format!(":{structure}"), SortDirection::Asc)
    }

    pub fn group(&mut self, fields: &[&str]) -> &mut Self {
        for field in self.known_fields(fields) {
            if !self.options.group.contains(&field) {
                self.options.group.push(field);
            }
        }
        self
    }

    pub fn offset(&mut self, offset: u64) -> &mut Self {
        self.options.offset = Some(offset);
        self
    }

    pub fn limit(&mut self, limit: u64) -> &mut Self {
        self.options.limit = Some(limit);
        self
    }

    /// Set offset and limit for a 1-based page.
    pub fn page(&mut self, page: u64, per_page: u64) -> &mut Self {
        let per_page = per_page.max(1);
        self.options.offset = Some((page.max(1) - 1) * per_page);
        self.options.limit = Some(per_page);
        self
    }

    pub fn populate(&mut self) -> &mut Self {
        self.options.populate = true;
        self
    }

    pub fn unpopulate(&mut self) -> &mut Self {
        self.options.populate = false;
        self
    }

    pub fn fallback(&mut self) -> &mut Self {
        self.options.fallback = true;
        self
    }

    pub fn no_fallback(&mut self) -> &mut Self {
        self.options.fallback = false;
        self
    }

    /// Context language for defaults, fallback and population.
    pub fn language(&mut self, code: &str) -> &mut Self {
        let code = code.trim().to_ascii_lowercase();
        if self.engine.schema().languages().is_supported(&code) {
            self.options.language = Some(code);
        } else {
            self.warn(format!("The language '{code}' is not supported"));
        }
        self
    }

    /// Restore default options and drop collected warnings.
    pub fn reset(&mut self) -> &mut Self {
        self.options = QueryOptions::for_collection(self.collection);
        self.warnings.clear();
        self
    }

    /// Merge the options of a parsed query string into this builder.
    pub fn apply_query_string(&mut self, parsed: &ParsedQueryString) -> &mut Self {
        if let Some(select) = &parsed.select {
            self.options.select = select.clone();
        }
        self.options.filter.extend(parsed.filter.iter().cloned());
        for (structure, keywords) in &parsed.search {
            self.options.search.insert(structure.clone(), keywords.clone());
        }
        self.options.order.extend(parsed.order.iter().cloned());
        for field in &parsed.group {
            if !self.options.group.contains(field) {
                self.options.group.push(field.clone());
            }
        }
        if parsed.offset.is_some() {
            self.options.offset = parsed.offset;
        }
        if parsed.limit.is_some() {
            self.options.limit = parsed.limit;
        }
        if let Some(populate) = parsed.populate {
            self.options.populate = populate;
        }
        if let Some(language) = &parsed.language {
            self.language(language);
        }
        self
    }

    // ── Compilation ────────────────────────────────────────────────

    fn context_language(&self) -> &str {
        self.options
            .language
            .as_deref()
            .unwrap_or(&self.engine.schema().languages().primary)
    }

    fn store_filter(&self, options: &QueryOptions) -> Option<Filter> {
        let mut filters = compile_nodes(self.collection, &options.filter);
        for (structure, keywords) in &options.search {
            if let Some(structure) = self.collection.search_structure(structure) {
                filters.extend(keywords.iter().map(|keyword| Filter::Contains {
                    column: structure.column.clone(),
                    needle: keyword.clone(),
                }));
            }
        }
        match filters.len() {
            0 => None,
            1 => filters.pop(),
            _ => Some(Filter::And(filters)),
        }
    }

    fn store_query(&self, options: &QueryOptions) -> StoreQuery {
        let columns_of = |fields: &[String]| -> Vec<String> {
            fields
                .iter()
                .filter_map(|f| self.collection.field(f))
                .map(|f| f.column.clone())
                .collect()
        };
        let order = options
            .order
            .iter()
            .filter_map(|term| {
                let expr = match &term.target {
                    OrderTarget::Field(field) => OrderExpr::Column(self.collection.field(field)?.column.clone()),
                    OrderTarget::Search(name) => {
                        let structure = self.collection.search_structure(name)?;
                        OrderExpr::SearchRelevance {
                            column: structure.column.clone(),
                            keywords: options.search.get(name).cloned().unwrap_or_default(),
                        }
                    }
                };
                Some(OrderBy {
                    expr,
                    direction: term.direction,
                })
            })
            .collect();

        StoreQuery {
            table: self.collection.table.clone(),
            columns: columns_of(&options.select),
            filter: self.store_filter(options),
            order,
            group: columns_of(&options.group),
            offset: options.offset,
            limit: options.limit,
        }
    }

    // ── Read pipeline ──────────────────────────────────────────────

    /// Cast, fallback-check and optionally populate raw rows.
    fn finish_rows(&self, rows: Vec<Row>, options: &QueryOptions, fallback: bool) -> Result<Vec<Record>> {
        let schema = self.engine.schema();
        let language = self.context_language();
        let pipeline = Pipeline::new(schema, self.collection, Operation::Read, language);
        let populator = Populator::new(self.engine, language, schema.config().population_depth);

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let mut record = cast_row(self.collection, row);
            if fallback {
                pipeline.apply_fallback(&mut record);
            }
            if options.populate {
                populator.populate(self.collection, &mut record)?;
            }
            records.push(record);
        }
        Ok(records)
    }

    fn fetch(&self, options: &QueryOptions) -> Result<Vec<Record>> {
        let rows = self.engine.store().find_all(&self.store_query(options))?;
        self.finish_rows(rows, options, options.fallback)
    }

    fn cached<T>(&self, method: &str, options: &QueryOptions, run: impl FnOnce() -> Result<T>) -> QueryResult<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let primary = self.engine.schema().languages().primary.as_str();
        match options.language.as_deref() {
            Some(code) if code != primary => {
                // Keyed per context language; the filter itself is unchanged
                let mut keyed = options.clone();
                keyed
                    .filter
                    .push(WhereNode::condition("language", WhereOperator::Eq, Value::String(code.to_string())));
                cached(self.engine, self.collection, method, &keyed, run)
            }
            _ => cached(self.engine, self.collection, method, options, run),
        }
    }

    pub fn all(&self) -> QueryResult<Vec<Record>> {
        self.cached("all", &self.options, || self.fetch(&self.options))
    }

    /// All matching records plus the total count ignoring offset and limit.
    pub fn all_with_count(&self) -> QueryResult<(Vec<Record>, u64)> {
        self.cached("allWithCount", &self.options, || {
            let records = self.fetch(&self.options)?;
            let total = self.count_matching(&self.options)?;
            Ok((records, total))
        })
    }

    pub fn first(&self) -> QueryResult<Option<Record>> {
        let mut options = self.options.clone();
        options.limit = Some(1);
        self.cached("first", &options, || Ok(self.fetch(&options)?.into_iter().next()))
    }

    pub fn paginate(&self, page: u64, per_page: u64) -> QueryResult<Paginated> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let mut options = self.options.clone();
        options.offset = Some((page - 1) * per_page);
        options.limit = Some(per_page);
        self.cached("paginate", &options, || {
            let records = self.fetch(&options)?;
            let total = self.count_matching(&options)?;
            Ok(Paginated {
                records,
                current_page: page,
                last_page: total.div_ceil(per_page).max(1),
                per_page,
                total,
            })
        })
    }

    fn count_matching(&self, options: &QueryOptions) -> Result<u64> {
        self.engine
            .store()
            .count(&self.collection.table, self.store_filter(options).as_ref())
    }

    pub fn count(&self) -> QueryResult<u64> {
        self.cached("count", &self.options, || self.count_matching(&self.options))
    }

    pub fn exists(&self) -> QueryResult<bool> {
        Ok(self.count()? > 0)
    }

    pub fn min(&self, field: &str) -> QueryResult<Value> {
        self.aggregate(Aggregate::Min, field)
    }

    pub fn max(&self, field: &str) -> QueryResult<Value> {
        self.aggregate(Aggregate::Max, field)
    }

    pub fn sum(&self, field: &str) -> QueryResult<Value> {
        self.aggregate(Aggregate::Sum, field)
    }

    fn aggregate(&self, function: Aggregate, field: &str) -> QueryResult<Value> {
        let resolved = self.collection.field(field).ok_or_else(|| PruviousError::UnknownField {
            collection: self.collection.name.clone(),
            field: field.to_string(),
        })?;
        let method = format!("{}:{field}", function.sql_function().to_lowercase());
        self.cached(&method, &self.options, || {
            let raw = self.engine.store().aggregate(
                &self.collection.table,
                function,
                &resolved.column,
                self.store_filter(&self.options).as_ref(),
            )?;
            Ok(match (function, raw) {
                (_, Value::Null) => Value::Null,
                (Aggregate::Sum, Value::Number(n)) => {
                    n.as_f64().map(crate::fields::builtin::number_value).unwrap_or(Value::Null)
                }
                (_, raw) => resolved.behavior().deserialize(raw)?,
            })
        })
    }

    // ── Write pipeline ─────────────────────────────────────────────

    /// Run the write pipeline without persisting.
    pub fn validate(&self, input: &Record, operation: Operation) -> QueryResult<Record> {
        let pipeline = Pipeline::new(self.engine.schema(), self.collection, operation, self.context_language());
        pipeline
            .process_write(input)
            .map_err(|errors| QueryFailure::Invalid { errors })
    }

    pub fn create(&self, input: &Record) -> QueryResult<Record> {
        let mut record = self.validate(input, Operation::Create)?;
        let mut unique = self.unique_errors(std::slice::from_ref(&record), &[])?;
        if let Some(errors) = unique.pop().filter(|e| !e.is_empty()) {
            return Err(QueryFailure::Invalid { errors });
        }
        self.stamp(&mut record, Operation::Create);

        let row = self.engine.store().create(&self.collection.table, &store_row(self.collection, &record)?)?;
        let records = self.finish_rows(vec![row], &self.options, true)?;
        self.after_write(&records, Mutation::Create)?;
        records
            .into_iter()
            .next()
            .map(|record| self.select_fields(record))
            .ok_or_else(|| QueryFailure::Message("The record was not created".into()))
    }

    /// Create every input or none of them.
    pub fn create_many(&self, inputs: &[Record]) -> QueryResult<Vec<Record>> {
        let mut records = Vec::with_capacity(inputs.len());
        let mut errors = Vec::with_capacity(inputs.len());
        for input in inputs {
            match self.validate(input, Operation::Create) {
                Ok(record) => {
                    records.push(record);
                    errors.push(FieldErrors::new());
                }
                Err(QueryFailure::Invalid { errors: field_errors }) => errors.push(field_errors),
                Err(other) => return Err(other),
            }
        }
        if errors.iter().any(|e| !e.is_empty()) {
            return Err(QueryFailure::InvalidBatch { errors });
        }

        let unique = self.unique_errors(&records, &[])?;
        if unique.iter().any(|e| !e.is_empty()) {
            return Err(QueryFailure::InvalidBatch { errors: unique });
        }

        let mut rows = Vec::with_capacity(records.len());
        for record in &mut records {
            self.stamp(record, Operation::Create);
            rows.push(store_row(self.collection, record)?);
        }
        let created = self.engine.store().bulk_create(&self.collection.table, &rows)?;
        let records = self.finish_rows(created, &self.options, true)?;
        self.after_write(&records, Mutation::Create)?;
        Ok(records.into_iter().map(|r| self.select_fields(r)).collect())
    }

    /// Update every matching record and return them as updated.
    pub fn update(&self, input: &Record) -> QueryResult<Vec<Record>> {
        let mut record = self.validate(input, Operation::Update)?;
        let ids = self.matching_ids()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let errors: FieldErrors = if ids.len() > 1 {
            self.collection
                .fields
                .iter()
                .filter(|f| f.unique && record.get(&f.name).is_some_and(|v| !v.is_null()))
                .map(|f| (f.name.clone(), "The value must be unique".to_string()))
                .collect()
        } else {
            self.unique_errors(std::slice::from_ref(&record), &ids)?
                .pop()
                .unwrap_or_default()
        };
        if !errors.is_empty() {
            return Err(QueryFailure::Invalid { errors });
        }

        self.stamp(&mut record, Operation::Update);
        let row = store_row(self.collection, &record)?;
        let filter = Filter::id_in(&ids);
        if !row.is_empty() {
            self.engine.store().update(&self.collection.table, &row, Some(&filter))?;
        }

        let mut query = StoreQuery::table(&self.collection.table);
        query.filter = Some(filter);
        let rows = self.engine.store().find_all(&query)?;
        let records = self.finish_rows(rows, &self.options, true)?;
        self.after_write(&records, Mutation::Update)?;
        Ok(records.into_iter().map(|r| self.select_fields(r)).collect())
    }

    /// Delete every matching record and return them as they were.
    pub fn delete(&self) -> QueryResult<Vec<Record>> {
        let ids = self.matching_ids()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = Filter::id_in(&ids);

        let mut query = self.store_query(&self.options);
        query.filter = Some(filter.clone());
        query.offset = None;
        query.limit = None;
        query.group.clear();
        let rows = self.engine.store().find_all(&query)?;
        let records = self.finish_rows(rows, &self.options, self.options.fallback)?;

        let deleted = self.engine.store().destroy(&self.collection.table, Some(&filter))?;
        log::debug!("Deleted {deleted} record(s) from '{}'", self.collection.name);
        if !self.collection.search.is_empty() {
            self.engine.indexer().schedule(&self.collection.name, ids);
        }
        self.engine.cache().invalidate(self.collection, Mutation::Delete);
        Ok(records)
    }

    // ── Write helpers ──────────────────────────────────────────────

    /// Ids of the matching records, captured before any mutation.
    fn matching_ids(&self) -> Result<Vec<i64>> {
        let mut query = self.store_query(&self.options);
        query.columns = vec!["id".into()];
        query.group.clear();
        Ok(self
            .engine
            .store()
            .find_all(&query)?
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_i64))
            .collect())
    }

    /// Unique-field and translation-slot conflicts, one map per record.
    /// Records with ids in `exclude` do not count as conflicts.
    fn unique_errors(&self, records: &[Record], exclude: &[i64]) -> Result<Vec<FieldErrors>> {
        let store = self.engine.store();
        let not_excluded = Filter::Condition {
            column: "id".into(),
            operator: WhereOperator::NotIn,
            value: Value::from(exclude.to_vec()),
        };

        let mut all_errors = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            let mut errors = FieldErrors::new();
            let earlier = &records[..i];

            for field in self.collection.fields.iter().filter(|f| f.unique) {
                let Some(value) = record.get(&field.name).filter(|v| !v.is_null()) else {
                    continue;
                };
                let duplicate_in_batch = earlier.iter().any(|r| r.get(&field.name) == Some(value));
                let filter = Filter::And(vec![
                    Filter::Condition {
                        column: field.column.clone(),
                        operator: WhereOperator::Eq,
                        value: filter_operand(field, value),
                    },
                    not_excluded.clone(),
                ]);
                if duplicate_in_batch || store.count(&self.collection.table, Some(&filter))? > 0 {
                    errors.insert(field.name.clone(), "The value must be unique".into());
                }
            }

            if let (Some(token), Some(language)) = (
                record.get("translations").and_then(Value::as_str),
                record.get("language").and_then(Value::as_str),
            ) {
                let same_slot = |r: &Record| {
                    r.get("translations").and_then(Value::as_str) == Some(token)
                        && r.get("language").and_then(Value::as_str) == Some(language)
                };
                let filter = Filter::And(vec![
                    Filter::eq("translations", token),
                    Filter::eq("language", language),
                    not_excluded.clone(),
                ]);
                if earlier.iter().any(same_slot) || store.count(&self.collection.table, Some(&filter))? > 0 {
                    errors.insert(
                        "language".into(),
                        format!("A translation in the language '{language}' already exists"),
                    );
                }
            }

            all_errors.push(errors);
        }
        Ok(all_errors)
    }

    fn stamp(&self, record: &mut Record, operation: Operation) {
        if !self.collection.has_timestamps() {
            return;
        }
        let now = Value::from(chrono::Utc::now().timestamp_millis());
        if operation == Operation::Create {
            record.insert("createdAt".into(), now.clone());
        }
        record.insert("updatedAt".into(), now);
    }

    fn select_fields(&self, mut record: Record) -> Record {
        record.retain(|key, _| self.options.select.iter().any(|s| s == key));
        record
    }

    /// Mirror non-translatable values, queue reindexing, invalidate the cache.
    fn after_write(&self, records: &[Record], mutation: Mutation) -> Result<()> {
        let mut ids: Vec<i64> = records
            .iter()
            .filter_map(|r| r.get("id").and_then(Value::as_i64))
            .collect();
        ids.extend(self.mirror_translations(records)?);

        if !self.collection.search.is_empty() {
            self.engine.indexer().schedule(&self.collection.name, ids);
        }
        self.engine.cache().invalidate(self.collection, mutation);
        Ok(())
    }

    /// Copy non-translatable field values to the other translations of each
    /// record. Returns the ids of the records that were touched.
    fn mirror_translations(&self, records: &[Record]) -> Result<Vec<i64>> {
        if !self.collection.mirror_translation {
            return Ok(Vec::new());
        }
        let shared: Vec<_> = self
            .collection
            .writable_fields()
            .filter(|f| !f.translatable && !f.reserved)
            .collect();
        if shared.is_empty() {
            return Ok(Vec::new());
        }

        let store = self.engine.store();
        let mut touched = Vec::new();
        for record in records {
            let (Some(id), Some(token)) = (
                record.get("id").and_then(Value::as_i64),
                record.get("translations").and_then(Value::as_str),
            ) else {
                continue;
            };
            let values: Record = shared
                .iter()
                .filter_map(|f| record.get(&f.name).map(|v| (f.name.clone(), v.clone())))
                .collect();
            let filter = Filter::And(vec![
                Filter::eq("translations", token),
                Filter::Condition {
                    column: "id".into(),
                    operator: WhereOperator::Ne,
                    value: Value::from(id),
                },
            ]);

            let mut query = StoreQuery::table(&self.collection.table);
            query.columns = vec!["id".into()];
            query.filter = Some(filter.clone());
            let others: Vec<i64> = store
                .find_all(&query)?
                .iter()
                .filter_map(|row| row.get("id").and_then(Value::as_i64))
                .collect();
            if others.is_empty() {
                continue;
            }
            store.update(&self.collection.table, &store_row(self.collection, &values)?, Some(&filter))?;
            log::debug!("Mirrored {} field(s) of record {id} to {} translation(s)", values.len(), others.len());
            touched.extend(others);
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::schema::Schema;
    use crate::store::SqliteStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::panic::AssertUnwindSafe;
    use std::sync::Arc;

    const SCHEMA: &str = r#"
languages:
  primary: en
  supported: [en, de]
collections:
  products:
    translatable: true
    mirrorTranslation: true
    cacheQueries: 0
    search:
      default: [{ field: name }]
    fields:
      name: { type: text }
      price: { type: number, options: { min: 0 } }
      sku: { type: text, unique: true }
      stock: { type: number, translatable: false }
      category: { type: record, options: { collection: categories } }
  categories:
    cacheQueries: 0
    clearCacheRules: { onUpdate: false }
    fields:
      name: { type: text, required: true }
      parent: { type: record, options: { collection: categories } }
  settings:
    mode: single
    fields:
      title: { type: text }
  pages:
    cacheQueries: 0
    fields:
      title: { type: text }
      content: { type: blocks, options: { allowedBlocks: [featured] } }
blocks:
  featured:
    fields:
      heading: { type: text }
      product: { type: record, options: { collection: products } }
"#;

    fn engine() -> Engine {
        let schema = Arc::new(Schema::from_yaml(SCHEMA, EngineConfig::default()).unwrap());
        let store = SqliteStore::open_in_memory().unwrap();
        store.sync_schema(&schema).unwrap();
        Engine::new(schema, Arc::new(store))
    }

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn ids(records: &[Record]) -> Vec<i64> {
        records.iter().map(|r| r["id"].as_i64().unwrap()).collect()
    }

    #[test]
    fn test_where_gt_filters_records() {
        let engine = engine();
        let products = engine.query("products").unwrap();
        for (name, price) in [("Pen", 5), ("Desk", 250), ("Lamp", 120)] {
            products.create(&record(json!({ "name": name, "price": price }))).unwrap();
        }

        let records = engine.query("products").unwrap().where_gt("price", 100).all().unwrap();
        let names: Vec<&str> = records.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Desk", "Lamp"]);
        assert!(records.iter().all(|r| r["price"].as_f64().unwrap() > 100.0));
    }

    #[test]
    fn test_search_relevance_order() {
        let engine = engine();
        let products = engine.query("products").unwrap();
        products.create(&record(json!({ "name": "Product name" }))).unwrap();
        products.create(&record(json!({ "name": "Product with long name" }))).unwrap();
        products.create(&record(json!({ "name": "Unrelated" }))).unwrap();
        engine.indexer().wait_idle().unwrap();

        let records = engine
            .query("products")
            .unwrap()
            .search("name", "default")
            .order_by_search_relevance("default")
            .all()
            .unwrap();
        assert_eq!(ids(&records), vec![1, 2]);
    }

    #[test]
    fn test_create_with_invalid_value_writes_nothing() {
        let engine = engine();
        let products = engine.query("products").unwrap();

        let failure = products.create(&record(json!({ "price": "not-a-number" }))).unwrap_err();
        assert_eq!(
            failure.to_json(),
            json!({ "success": false, "errors": { "price": "The value must be a number" } })
        );
        assert_eq!(products.count().unwrap(), 0);
    }

    #[test]
    fn test_update_drops_immutable_fields() {
        let schema = Arc::new(
            Schema::from_yaml(
                "collections:\n  items:\n    fields:\n      code: { type: text, immutable: true }\n      label: { type: text }\n",
                EngineConfig::default(),
            )
            .unwrap(),
        );
        let store = SqliteStore::open_in_memory().unwrap();
        store.sync_schema(&schema).unwrap();
        let engine = Engine::new(schema, Arc::new(store));

        let items = engine.query("items").unwrap();
        items.create(&record(json!({ "code": "A-1", "label": "First" }))).unwrap();
        let updated = engine
            .query("items")
            .unwrap()
            .where_eq("id", 1)
            .update(&record(json!({ "code": "B-2", "label": "Renamed" })))
            .unwrap();
        assert_eq!(updated[0]["code"], json!("A-1"));
        assert_eq!(updated[0]["label"], json!("Renamed"));
    }

    #[test]
    fn test_create_many_is_all_or_nothing() {
        let engine = engine();
        let products = engine.query("products").unwrap();

        let failure = products
            .create_many(&[
                record(json!({ "name": "Valid", "price": 1 })),
                record(json!({ "name": "Invalid", "price": -5 })),
            ])
            .unwrap_err();
        match failure {
            QueryFailure::InvalidBatch { errors } => {
                assert!(errors[0].is_empty());
                assert_eq!(errors[1]["price"], "The value must be greater than or equal to 0");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(products.count().unwrap(), 0);

        let created = products
            .create_many(&[record(json!({ "name": "A" })), record(json!({ "name": "B" }))])
            .unwrap();
        assert_eq!(ids(&created), vec![1, 2]);
    }

    #[test]
    fn test_update_invalidates_cached_reads() {
        let engine = engine();
        let products = engine.query("products").unwrap();
        products.create(&record(json!({ "name": "Lamp", "price": 10 }))).unwrap();
        engine.indexer().wait_idle().unwrap();

        let mut query = engine.query("products").unwrap();
        query.select(&["id", "name", "price"]);
        assert_eq!(query.all().unwrap()[0]["price"], json!(10));

        engine
            .query("products")
            .unwrap()
            .where_eq("id", 1)
            .update(&record(json!({ "price": 20 })))
            .unwrap();
        engine.indexer().wait_idle().unwrap();
        assert_eq!(query.all().unwrap()[0]["price"], json!(20));
    }

    #[test]
    fn test_disabled_clear_rule_keeps_cache() {
        let engine = engine();
        let categories = engine.query("categories").unwrap();
        categories.create(&record(json!({ "name": "Tools" }))).unwrap();

        let mut query = engine.query("categories").unwrap();
        query.select(&["id", "name"]);
        assert_eq!(query.all().unwrap()[0]["name"], json!("Tools"));

        engine
            .query("categories")
            .unwrap()
            .where_eq("id", 1)
            .update(&record(json!({ "name": "Hardware" })))
            .unwrap();
        assert_eq!(query.all().unwrap()[0]["name"], json!("Tools"));
        assert_eq!(query.no_fallback().all().unwrap()[0]["name"], json!("Hardware"));
    }

    #[test]
    fn test_cached_reads_are_kept_apart_per_language() {
        let engine = engine();
        let categories = engine.query("categories").unwrap();
        categories.create(&record(json!({ "name": "Tools" }))).unwrap();

        let mut query = engine.query("categories").unwrap();
        query.select(&["id", "name"]);
        assert_eq!(query.all().unwrap()[0]["name"], json!("Tools"));

        engine
            .query("categories")
            .unwrap()
            .where_eq("id", 1)
            .update(&record(json!({ "name": "Hardware" })))
            .unwrap();
        // The primary-language entry is still cached; German reads have their own
        assert_eq!(query.all().unwrap()[0]["name"], json!("Tools"));
        assert_eq!(query.language("de").all().unwrap()[0]["name"], json!("Hardware"));
        assert_eq!(query.language("en").all().unwrap()[0]["name"], json!("Tools"));
    }

    #[test]
    fn test_unique_fields() {
        let engine = engine();
        let products = engine.query("products").unwrap();
        products.create(&record(json!({ "name": "A", "sku": "X-1" }))).unwrap();

        let failure = products.create(&record(json!({ "name": "B", "sku": "X-1" }))).unwrap_err();
        assert_eq!(
            failure,
            QueryFailure::Invalid {
                errors: FieldErrors::from([("sku".to_string(), "The value must be unique".to_string())])
            }
        );

        // Updating a record to its own value is not a conflict
        let updated = engine
            .query("products")
            .unwrap()
            .where_eq("sku", "X-1")
            .update(&record(json!({ "sku": "X-1", "price": 3 })))
            .unwrap();
        assert_eq!(updated.len(), 1);
    }

    #[test]
    fn test_translations_share_mirrored_fields() {
        let engine = engine();
        let products = engine.query("products").unwrap();
        let english = products.create(&record(json!({ "name": "Chair", "stock": 4 }))).unwrap();
        let token = english["translations"].as_str().unwrap().to_string();

        let german = products
            .create(&record(json!({ "name": "Stuhl", "language": "de", "translations": token, "stock": 9 })))
            .unwrap();
        assert_eq!(german["stock"], json!(9));

        let chair = engine.query("products").unwrap().where_eq("id", 1).first().unwrap().unwrap();
        assert_eq!(chair["stock"], json!(9));
        assert_eq!(chair["name"], json!("Chair"));

        let failure = products
            .create(&record(json!({ "name": "Sessel", "language": "de", "translations": token })))
            .unwrap_err();
        assert!(matches!(failure, QueryFailure::Invalid { errors } if errors.contains_key("language")));
    }

    #[test]
    fn test_populate_follows_relations_to_depth() {
        let engine = engine();
        let categories = engine.query("categories").unwrap();
        categories.create(&record(json!({ "name": "Root" }))).unwrap();
        categories.create(&record(json!({ "name": "Lighting", "parent": 1 }))).unwrap();
        categories.create(&record(json!({ "name": "Lamps", "parent": 2 }))).unwrap();
        engine
            .query("products")
            .unwrap()
            .create(&record(json!({ "name": "Desk Lamp", "category": 3 })))
            .unwrap();

        let plain = engine.query("products").unwrap().first().unwrap().unwrap();
        assert_eq!(plain["category"], json!(3));

        let populated = engine.query("products").unwrap().populate().first().unwrap().unwrap();
        assert_eq!(populated["category"]["name"], json!("Lamps"));
        assert_eq!(populated["category"]["parent"]["name"], json!("Lighting"));
        // Two hops deep: the third reference stays a casted id
        assert_eq!(populated["category"]["parent"]["parent"], json!(1));
    }

    #[test]
    fn test_populate_self_reference_stops_at_depth() {
        let engine = engine();
        let categories = engine.query("categories").unwrap();
        categories.create(&record(json!({ "name": "Loop" }))).unwrap();
        engine
            .query("categories")
            .unwrap()
            .where_eq("id", 1)
            .update(&record(json!({ "parent": 1 })))
            .unwrap();

        let populated = engine.query("categories").unwrap().populate().first().unwrap().unwrap();
        assert_eq!(populated["parent"]["name"], json!("Loop"));
        assert_eq!(populated["parent"]["parent"]["name"], json!("Loop"));
        assert_eq!(populated["parent"]["parent"]["parent"], json!(1));
    }

    #[test]
    fn test_populate_reaches_record_fields_inside_blocks() {
        let engine = engine();
        engine
            .query("products")
            .unwrap()
            .create(&record(json!({ "name": "Desk Lamp" })))
            .unwrap();
        engine
            .query("pages")
            .unwrap()
            .create(&record(json!({
                "title": "Home",
                "content": [{ "name": "featured", "fields": { "heading": "Pick", "product": 1 } }],
            })))
            .unwrap();

        let plain = engine.query("pages").unwrap().first().unwrap().unwrap();
        assert_eq!(plain["content"][0]["fields"]["product"], json!(1));

        let populated = engine.query("pages").unwrap().populate().first().unwrap().unwrap();
        assert_eq!(populated["content"][0]["fields"]["heading"], json!("Pick"));
        assert_eq!(populated["content"][0]["fields"]["product"]["name"], json!("Desk Lamp"));
    }

    #[test]
    fn test_some_and_every_groups() {
        let engine = engine();
        let products = engine.query("products").unwrap();
        for (name, price) in [("Pen", 5), ("Desk", 250), ("Lamp", 120), ("Cup", 8)] {
            products.create(&record(json!({ "name": name, "price": price }))).unwrap();
        }

        let records = engine
            .query("products")
            .unwrap()
            .some(&[
                &|s: &mut WhereScope<'_>| {
                    s.where_lt("price", 6);
                },
                &|s: &mut WhereScope<'_>| {
                    s.where_gt("price", 100).where_like("name", "D%");
                },
            ])
            .order("name", SortDirection::Asc)
            .all()
            .unwrap();
        let names: Vec<&str> = records.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Desk", "Pen"]);

        let count = engine
            .query("products")
            .unwrap()
            .every(&[
                &|s: &mut WhereScope<'_>| {
                    s.where_gte("price", 8);
                },
                &|s: &mut WhereScope<'_>| {
                    s.where_lte("price", 120);
                },
            ])
            .count()
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_panicking_branch_leaves_builder_untouched() {
        let engine = engine();
        let mut builder = engine.query("products").unwrap();
        builder.where_gt("price", 1);

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            builder.some(&[
                &|s: &mut WhereScope<'_>| {
                    s.where_eq("name", "a");
                },
                &|_: &mut WhereScope<'_>| panic!("branch failed"),
            ]);
        }));
        assert!(result.is_err());
        assert_eq!(builder.options().filter.len(), 1);
    }

    #[test]
    fn test_invalid_conditions_become_warnings() {
        let engine = engine();
        let mut builder = engine.query("products").unwrap();
        builder
            .where_eq("missing", 1)
            .where_in("price", vec![1, 2])
            .where_op("price", WhereOperator::In, 5)
            .where_like("price", "1%")
            .order("nope", SortDirection::Desc);
        assert_eq!(builder.options().filter.len(), 1);
        assert_eq!(
            builder.warnings(),
            &[
                "The field 'missing' does not exist".to_string(),
                "The operator 'in' requires an array value".to_string(),
                "The operator 'like' cannot be used on the field 'price'".to_string(),
                "The field 'nope' does not exist".to_string(),
            ]
        );
    }

    #[test]
    fn test_paginate_and_aggregates() {
        let engine = engine();
        let products = engine.query("products").unwrap();
        for price in [3, 1, 4, 1, 5] {
            products.create(&record(json!({ "name": "Item", "price": price }))).unwrap();
        }

        let page = engine
            .query("products")
            .unwrap()
            .order("price", SortDirection::Asc)
            .paginate(3, 2)
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0]["price"], json!(5));
        assert_eq!((page.current_page, page.last_page, page.total), (3, 3, 5));

        let query = engine.query("products").unwrap();
        assert_eq!(query.min("price").unwrap(), json!(1));
        assert_eq!(query.max("price").unwrap(), json!(5));
        assert_eq!(query.sum("price").unwrap(), json!(14));
        assert!(query.exists().unwrap());
        assert!(query.min("missing").is_err());

        let (records, total) = engine.query("products").unwrap().limit(2).all_with_count().unwrap();
        assert_eq!((records.len(), total), (2, 5));
    }

    #[test]
    fn test_delete_returns_removed_records() {
        let engine = engine();
        let products = engine.query("products").unwrap();
        for name in ["A", "B", "C"] {
            products.create(&record(json!({ "name": name }))).unwrap();
        }

        let deleted = engine
            .query("products")
            .unwrap()
            .where_in("name", vec!["A", "C"])
            .select(&["id", "name"])
            .delete()
            .unwrap();
        assert_eq!(deleted, vec![record(json!({ "id": 1, "name": "A" })), record(json!({ "id": 3, "name": "C" }))]);
        assert_eq!(products.count().unwrap(), 1);
        assert!(engine.query("products").unwrap().where_eq("id", 9).delete().unwrap().is_empty());
    }

    #[test]
    fn test_select_and_clone() {
        let engine = engine();
        engine
            .query("products")
            .unwrap()
            .create(&record(json!({ "name": "Pen", "price": 2 })))
            .unwrap();

        let mut base = engine.query("products").unwrap();
        base.select(&["name", "price"]);
        let mut branch = base.clone();
        branch.deselect(&["price"]).where_gt("price", 5);

        assert_eq!(base.first().unwrap().unwrap(), record(json!({ "name": "Pen", "price": 2 })));
        assert!(branch.first().unwrap().is_none());
        branch.reset();
        assert_eq!(branch.options(), &QueryOptions::for_collection(branch.collection()));
    }
}
