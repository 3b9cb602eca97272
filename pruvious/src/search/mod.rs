//! Search keywords.
//!
//! Every search structure of a collection owns a denormalized `_search_*`
//! column holding the lowercased keywords of its fields. After a write the
//! affected records are queued on [`SearchIndexer`], which rebuilds those
//! columns off the caller's thread and flushes the query cache when done.

use crate::cache::CacheLayer;
use crate::error::{PruviousError, Result};
use crate::fields::{FieldContext, Operation, Record};
use crate::query::cast_row;
use crate::schema::path::FieldPath;
use crate::schema::{ResolvedCollection, Schema};
use crate::store::{Filter, RecordStore, Row, StoreQuery};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Keywords of every search structure of `collection` for one record.
///
/// Each field contributes its `extract_keywords` output; the parts are joined
/// with single spaces and lowercased.
pub fn build_keywords(schema: &Schema, collection: &ResolvedCollection, record: &Record) -> BTreeMap<String, String> {
    let input = Value::Object(record.clone());
    let language = record
        .get("language")
        .and_then(Value::as_str)
        .unwrap_or(&schema.languages().primary);

    let mut keywords = BTreeMap::new();
    for structure in &collection.search {
        let mut parts = Vec::new();
        for name in &structure.fields {
            let (Some(field), Some(value)) = (collection.field(name), record.get(name)) else {
                continue;
            };
            let path = FieldPath::field(name);
            let ctx = FieldContext {
                schema,
                collection,
                field,
                path: &path,
                operation: Operation::Read,
                input: &input,
                language,
            };
            let text = field.behavior().extract_keywords(&ctx, value);
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !text.is_empty() {
                parts.push(text);
            }
        }
        keywords.insert(structure.column.clone(), parts.join(" ").to_lowercase());
    }
    keywords
}

/// Lowercase and split a search string into keywords.
pub fn split_keywords(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Rebuild the search columns of the given records right away.
pub fn reindex(schema: &Schema, store: &dyn RecordStore, collection: &str, ids: &[i64]) -> Result<usize> {
    let collection = schema.collection(collection)?;
    if collection.search.is_empty() || ids.is_empty() {
        return Ok(0);
    }

    let mut query = StoreQuery::table(&collection.table);
    query.filter = Some(Filter::id_in(ids));
    let rows = store.find_all(&query)?;

    let mut updated = 0;
    for row in rows {
        let record = cast_row(collection, row);
        let Some(id) = record.get("id").and_then(Value::as_i64) else {
            continue;
        };
        let values: Row = build_keywords(schema, collection, &record)
            .into_iter()
            .map(|(column, text)| (column, Value::String(text)))
            .collect();
        updated += store.update(&collection.table, &values, Some(&Filter::eq("id", id)))?;
    }
    log::debug!("Rebuilt search keywords of {updated} record(s) in '{}'", collection.name);
    Ok(updated)
}

// ── Background indexer ─────────────────────────────────────────────

struct Job {
    collection: String,
    ids: Vec<i64>,
}

#[derive(Default)]
struct IndexState {
    /// Queued or running jobs per record.
    pending: HashMap<(String, i64), usize>,
    queued: usize,
}

impl IndexState {
    fn enqueue(&mut self, job: &Job) {
        for id in &job.ids {
            *self.pending.entry((job.collection.clone(), *id)).or_insert(0) += 1;
        }
        self.queued += 1;
    }

    /// Returns true once no job is left.
    fn release(&mut self, job: &Job) -> bool {
        for id in &job.ids {
            let key = (job.collection.clone(), *id);
            if let Some(count) = self.pending.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    self.pending.remove(&key);
                }
            }
        }
        self.queued = self.queued.saturating_sub(1);
        self.queued == 0
    }
}

struct Shared {
    state: Mutex<IndexState>,
    idle: Condvar,
}

impl Shared {
    fn finish(&self, job: &Job) {
        if let Ok(mut state) = self.state.lock() {
            if state.release(job) {
                self.idle.notify_all();
            }
        }
    }
}

/// Rebuilds search keywords after writes.
///
/// In background mode jobs run on a worker thread fed through a channel and
/// always run to completion. In inline mode [`schedule`](Self::schedule)
/// does the work before returning.
pub struct SearchIndexer {
    schema: Arc<Schema>,
    store: Arc<dyn RecordStore>,
    cache: CacheLayer,
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl SearchIndexer {
    /// Start an indexer. `background` selects the worker thread mode.
    pub fn start(schema: Arc<Schema>, store: Arc<dyn RecordStore>, cache: CacheLayer, background: bool) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(IndexState::default()),
            idle: Condvar::new(),
        });

        let (sender, worker) = if background {
            let (tx, rx) = mpsc::channel::<Job>();
            let schema = Arc::clone(&schema);
            let store = Arc::clone(&store);
            let cache = cache.clone();
            let shared = Arc::clone(&shared);
            let worker = std::thread::spawn(move || {
                // Exits once every sender is gone
                while let Ok(job) = rx.recv() {
                    run_job(&schema, store.as_ref(), &cache, &job);
                    shared.finish(&job);
                }
            });
            (Some(tx), Some(worker))
        } else {
            (None, None)
        };

        SearchIndexer {
            schema,
            store,
            cache,
            sender,
            worker,
            shared,
        }
    }

    /// Queue a keyword rebuild for `ids` of `collection`.
    pub fn schedule(&self, collection: &str, ids: Vec<i64>) {
        if ids.is_empty() {
            return;
        }
        let job = Job {
            collection: collection.to_string(),
            ids,
        };

        if let Ok(mut state) = self.shared.state.lock() {
            state.enqueue(&job);
        }

        match &self.sender {
            Some(sender) => {
                log::debug!("Queued search reindex of {} record(s) in '{collection}'", job.ids.len());
                if let Err(mpsc::SendError(job)) = sender.send(job) {
                    log::warn!("Search indexer stopped; reindexing '{collection}' inline");
                    run_job(&self.schema, self.store.as_ref(), &self.cache, &job);
                    self.shared.finish(&job);
                }
            }
            None => {
                run_job(&self.schema, self.store.as_ref(), &self.cache, &job);
                self.shared.finish(&job);
            }
        }
    }

    /// Whether a rebuild for this record is queued or running.
    pub fn is_pending(&self, collection: &str, id: i64) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.pending.contains_key(&(collection.to_string(), id)))
            .unwrap_or(false)
    }

    /// Block until every queued job has finished.
    pub fn wait_idle(&self) -> Result<()> {
        let state = self
            .shared
            .state
            .lock()
            .map_err(|_| PruviousError::Other("search indexer state poisoned".into()))?;
        let _state = self
            .shared
            .idle
            .wait_while(state, |state| state.queued > 0)
            .map_err(|_| PruviousError::Other("search indexer state poisoned".into()))?;
        Ok(())
    }
}

impl Drop for SearchIndexer {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Search indexer worker panicked");
            }
        }
    }
}

fn run_job(schema: &Schema, store: &dyn RecordStore, cache: &CacheLayer, job: &Job) {
    match reindex(schema, store, &job.collection, &job.ids) {
        Ok(_) => cache.flush(),
        Err(e) => log::error!("Search reindex of '{}' failed: {e}", job.collection),
    }
}
