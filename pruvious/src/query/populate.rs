use super::{cast_row, Engine};
use crate::error::Result;
use crate::fields::pipeline::Pipeline;
use crate::fields::{FieldContext, Operation, Record, RelationFetcher};
use crate::schema::path::FieldPath;
use crate::schema::{NestedFields, ResolvedCollection, ResolvedField};
use crate::store::{Filter, StoreQuery};
use serde_json::Value;

/// Loads related records for population, `depth` hops deep.
///
/// Related records are casted and fallback-checked. While depth remains they
/// are populated in turn, so reference cycles stop at the depth bound.
pub struct Populator<'e> {
    engine: &'e Engine,
    language: &'e str,
    depth: usize,
}

impl<'e> Populator<'e> {
    pub fn new(engine: &'e Engine, language: &'e str, depth: usize) -> Self {
        Populator {
            engine,
            language,
            depth,
        }
    }

    /// Replace every populatable value in `record` with its populated form.
    pub fn populate(&self, collection: &ResolvedCollection, record: &mut Record) -> Result<()> {
        if self.depth == 0 {
            return Ok(());
        }
        let next = Populator::new(self.engine, self.language, self.depth - 1);
        let input = Value::Object(record.clone());
        for field in &collection.fields {
            let Some(value) = record.get_mut(&field.name) else {
                continue;
            };
            let path = FieldPath::field(&field.name);
            self.populate_value(collection, field, &path, value, &input, &next)?;
        }
        Ok(())
    }

    fn populate_value(
        &self,
        collection: &ResolvedCollection,
        field: &ResolvedField,
        path: &FieldPath,
        value: &mut Value,
        input: &Value,
        next: &Populator<'_>,
    ) -> Result<()> {
        if field.population && field.behavior().population_type().is_some() {
            let ctx = FieldContext {
                schema: self.engine.schema(),
                collection,
                field,
                path,
                operation: Operation::Read,
                input,
                language: self.language,
            };
            *value = field.behavior().populate(&ctx, value, next)?;
            return Ok(());
        }

        let Value::Array(items) = value else {
            return Ok(());
        };
        match &field.nested {
            NestedFields::None => {}
            NestedFields::Repeater(subfields) => {
                for (i, item) in items.iter_mut().enumerate() {
                    let Value::Object(entry) = item else {
                        continue;
                    };
                    for sub in subfields {
                        if let Some(sub_value) = entry.get_mut(&sub.name) {
                            let sub_path = path.index(i).key(&sub.name);
                            self.populate_value(collection, sub, &sub_path, sub_value, input, next)?;
                        }
                    }
                }
            }
            NestedFields::Blocks(allowed) => {
                for (i, item) in items.iter_mut().enumerate() {
                    let Value::Object(entry) = item else {
                        continue;
                    };
                    let Some(block) = entry
                        .get("name")
                        .and_then(Value::as_str)
                        .filter(|name| allowed.iter().any(|a| a == name))
                        .and_then(|name| self.engine.schema().block(name))
                    else {
                        continue;
                    };
                    let Some(Value::Object(fields)) = entry.get_mut("fields") else {
                        continue;
                    };
                    for sub in &block.fields {
                        if let Some(sub_value) = fields.get_mut(&sub.name) {
                            let sub_path = path.index(i).key("fields").key(&sub.name);
                            self.populate_value(collection, sub, &sub_path, sub_value, input, next)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl RelationFetcher for Populator<'_> {
    fn fetch_records(&self, collection: &str, ids: &[i64]) -> Result<Vec<Record>> {
        let collection = self.engine.schema().collection(collection)?;
        let mut query = StoreQuery::table(&collection.table);
        query.filter = Some(Filter::id_in(ids));

        let pipeline = Pipeline::new(self.engine.schema(), collection, Operation::Read, self.language);
        let mut records = Vec::new();
        for row in self.engine.store().find_all(&query)? {
            let mut record = cast_row(collection, row);
            pipeline.apply_fallback(&mut record);
            self.populate(collection, &mut record)?;
            records.push(record);
        }
        Ok(records)
    }
}
