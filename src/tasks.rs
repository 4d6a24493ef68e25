//! Deferred work: relation propagation and search index rebuilds.
//!
//! Tasks are delivered at least once, so every task is idempotent; a task
//! that fails is retried from the start of its page.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bones::RELATIONS_KIND;
use crate::datatype::{Key, Value};
use crate::engine::{Database, DELAYED_UPDATE_TAG};
use crate::error::Result;
use crate::persist::{Cursor, FilterOp, Query, Store};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeferredTask {
    /// Refresh every entity whose relation to `dest` is older than `min_change_time` (ms).
    UpdateRelations {
        dest: Key,
        min_change_time: i64,
        cursor: Option<Cursor>,
    },
    /// Reload, refresh and save every entity of a kind.
    RebuildSearchIndex { kind: String, cursor: Option<Cursor> },
}

impl DeferredTask {
    pub fn run(&self, db: &Database) -> Result<PropagationOutcome> {
        match self {
            DeferredTask::UpdateRelations {
                dest,
                min_change_time,
                cursor,
            } => update_relations(db, dest, *min_change_time, cursor.as_ref()),
            DeferredTask::RebuildSearchIndex { kind, cursor } => {
                rebuild_search_index(db, kind, cursor.as_ref())
            }
        }
    }
}

/// Somewhere deferred tasks can be handed to.
pub trait TaskQueue: Send + Sync {
    fn defer(&self, task: DeferredTask) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropagationOutcome {
    Done,
    /// The page was full; a follow-up task continues at the cursor.
    Rescheduled(Cursor),
}

// ------------- Relation propagation -------------
/// Processes one page of relation records pointing at `dest`.
///
/// Every source entity is reloaded, refreshed and saved without marking it
/// dirty again. Records whose source is gone, and sources that fail to
/// refresh or save, are logged and skipped.
pub fn update_relations(
    db: &Database,
    dest: &Key,
    min_change_time: i64,
    cursor: Option<&Cursor>,
) -> Result<PropagationOutcome> {
    let query = Query::new(RELATIONS_KIND)
        .filter("dest.key", FilterOp::Eq, dest.encode())
        .filter(DELAYED_UPDATE_TAG, FilterOp::Lt, Value::Int(min_change_time));
    let batch = db
        .store()
        .run_query(&query, db.settings().relations.batch_size, cursor)?;
    for record in &batch.entities {
        let Some(source) = record.key().and_then(Key::parent) else {
            error!(dest = %dest, "relation record without source");
            continue;
        };
        let kind = record
            .get("viur_src_kind")
            .and_then(Value::as_text)
            .unwrap_or(source.kind());
        let definition = match db.registry().lookup(kind) {
            Ok(definition) => definition,
            Err(err) => {
                error!(dest = %dest, source = %source, error = %err, "stale relation, unknown source kind");
                continue;
            }
        };
        let mut skel = definition.instance();
        if !db.load(&mut skel, source)? {
            error!(dest = %dest, source = %source, "stale relation, source entity is gone");
            continue;
        }
        let saved = skel
            .refresh(db.store())
            .and_then(|_| db.save(&mut skel, true));
        match saved {
            Ok(_) => debug!(dest = %dest, source = %source, "relation refreshed"),
            Err(err) => warn!(dest = %dest, source = %source, error = %err, "could not refresh relation source"),
        }
    }
    info!(dest = %dest, records = batch.entities.len(), "relation propagation page done");
    reschedule(db, batch.more, batch.cursor, cursor, |cursor| {
        DeferredTask::UpdateRelations {
            dest: dest.clone(),
            min_change_time,
            cursor: Some(cursor),
        }
    })
}

/// Processes one page of entities of `kind`, refreshing and re-saving each
/// so search documents and tags are rebuilt.
pub fn rebuild_search_index(
    db: &Database,
    kind: &str,
    cursor: Option<&Cursor>,
) -> Result<PropagationOutcome> {
    let definition = db.registry().lookup(kind)?;
    let batch = db
        .store()
        .run_query(&Query::new(kind), db.settings().search.page_size, cursor)?;
    for entity in &batch.entities {
        let mut skel = definition.instance();
        skel.from_entity(entity);
        let saved = skel
            .refresh(db.store())
            .and_then(|_| db.save(&mut skel, true));
        if let Err(err) = saved {
            warn!(kind, key = ?entity.key(), error = %err, "could not rebuild entity");
        }
    }
    info!(kind, entities = batch.entities.len(), "search index page rebuilt");
    reschedule(db, batch.more, batch.cursor, cursor, |cursor| {
        DeferredTask::RebuildSearchIndex {
            kind: kind.to_string(),
            cursor: Some(cursor),
        }
    })
}

fn reschedule(
    db: &Database,
    more: bool,
    next: Option<Cursor>,
    previous: Option<&Cursor>,
    task: impl FnOnce(Cursor) -> DeferredTask,
) -> Result<PropagationOutcome> {
    match next {
        Some(next) if more && Some(&next) != previous => {
            db.task_queue().defer(task(next.clone()))?;
            Ok(PropagationOutcome::Rescheduled(next))
        }
        _ => Ok(PropagationOutcome::Done),
    }
}

// ------------- Local execution -------------
/// An in-process FIFO queue; tasks run when [`LocalTaskQueue::run_pending`]
/// is called, either directly or from a [`TaskWorker`].
#[derive(Debug)]
pub struct LocalTaskQueue {
    pending: Mutex<VecDeque<(DeferredTask, u32)>>,
    max_attempts: u32,
}

impl LocalTaskQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.pending.lock()?.len())
    }
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    pub fn pending(&self) -> Result<Vec<DeferredTask>> {
        Ok(self.pending.lock()?.iter().map(|(t, _)| t.clone()).collect())
    }

    /// Runs the tasks queued so far, returning how many succeeded. Failed
    /// tasks are queued again until they used up their attempts; tasks
    /// deferred while running wait for the next call.
    pub fn run_pending(&self, db: &Database) -> Result<usize> {
        let batch: Vec<(DeferredTask, u32)> = self.pending.lock()?.drain(..).collect();
        let mut succeeded = 0;
        for (task, attempts) in batch {
            match task.run(db) {
                Ok(outcome) => {
                    succeeded += 1;
                    debug!(task = ?task, outcome = ?outcome, "task done");
                }
                Err(err) if attempts + 1 < self.max_attempts => {
                    warn!(task = ?task, attempt = attempts + 1, error = %err, "task failed, will retry");
                    self.pending.lock()?.push_back((task, attempts + 1));
                }
                Err(err) => {
                    error!(task = ?task, error = %err, "task failed too often, dropping it");
                }
            }
        }
        Ok(succeeded)
    }

    /// Keeps running until the queue is empty or `max_rounds` is reached.
    pub fn run_until_idle(&self, db: &Database, max_rounds: usize) -> Result<usize> {
        let mut succeeded = 0;
        for _ in 0..max_rounds {
            if self.is_empty()? {
                break;
            }
            succeeded += self.run_pending(db)?;
        }
        Ok(succeeded)
    }
}

impl TaskQueue for LocalTaskQueue {
    fn defer(&self, task: DeferredTask) -> Result<()> {
        debug!(task = ?task, "task deferred");
        self.pending.lock()?.push_back((task, 0));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Drains a [`LocalTaskQueue`] on a background thread until cancelled.
pub struct TaskWorker {
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl TaskWorker {
    pub fn spawn(db: Arc<Database>, queue: Arc<LocalTaskQueue>, poll_interval: Duration) -> Self {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let join = thread::spawn(move || {
            while !token.is_cancelled() {
                match queue.run_pending(&db) {
                    Ok(0) => thread::sleep(poll_interval),
                    Ok(n) => debug!(tasks = n, "worker ran tasks"),
                    Err(err) => {
                        error!(error = %err, "worker could not run tasks");
                        thread::sleep(poll_interval);
                    }
                }
            }
        });
        Self {
            cancel,
            join: Some(join),
        }
    }

    /// Request cancellation; the worker stops after its current round.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn stop(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
