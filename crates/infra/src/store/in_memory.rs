//! In-memory store for tests/dev.
//!
//! Behaves like the Postgres store where courier depends on it:
//! - writes are buffered per transaction and applied atomically on commit
//! - row locks are real (`Wait` blocks on a condvar, `NoWait` fails, `SkipLocked` skips)
//! - unique keys are enforced on insert and again at commit
//! - reads outside a transaction only see committed rows

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use super::{LockMode, Record, Store, StoreError, Transaction};

type TxId = u64;

struct Tables<R: Record> {
    rows: HashMap<R::Id, R>,
    keys: HashMap<R::Key, R::Id>,
    locks: HashMap<R::Id, TxId>,
}

pub struct InMemoryStore<R: Record> {
    tables: Mutex<Tables<R>>,
    released: Condvar,
    next_tx: AtomicU64,
}

impl<R: Record> InMemoryStore<R> {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                rows: HashMap::new(),
                keys: HashMap::new(),
                locks: HashMap::new(),
            }),
            released: Condvar::new(),
            next_tx: AtomicU64::new(1),
        }
    }

    /// Every committed row, in creation order.
    pub fn rows(&self) -> Vec<R> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        in_creation_order(tables.rows.values().cloned())
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables<R>>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Take (or confirm) `tx`'s lock on `id`. `false` means the row was skipped.
    fn acquire<'a>(
        &'a self,
        mut tables: MutexGuard<'a, Tables<R>>,
        tx: TxId,
        id: R::Id,
        mode: LockMode,
    ) -> Result<(MutexGuard<'a, Tables<R>>, bool), StoreError> {
        loop {
            match tables.locks.get(&id).copied() {
                None => {
                    tables.locks.insert(id, tx);
                    return Ok((tables, true));
                }
                Some(owner) if owner == tx => return Ok((tables, true)),
                Some(_) => match mode {
                    LockMode::NoWait => return Err(StoreError::Locked(id.to_string())),
                    LockMode::SkipLocked => return Ok((tables, false)),
                    LockMode::Wait => {
                        tables = self.released.wait(tables).map_err(|_| StoreError::Poisoned)?;
                    }
                },
            }
        }
    }
}

impl<R: Record> Default for InMemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> core::fmt::Debug for InMemoryStore<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let rows = self.tables.lock().map(|t| t.rows.len()).unwrap_or_default();
        f.debug_struct("InMemoryStore").field("rows", &rows).finish()
    }
}

fn in_creation_order<R: Record>(rows: impl Iterator<Item = R>) -> Vec<R> {
    let mut rows: Vec<R> = rows.collect();
    rows.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.id().cmp(&b.id()))
    });
    rows
}

impl<R: Record> Store<R> for InMemoryStore<R> {
    fn begin(&self) -> Result<Box<dyn Transaction<R> + '_>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            store: self,
            tx: self.next_tx.fetch_add(1, Ordering::SeqCst),
            writes: BTreeMap::new(),
            inserted: HashSet::new(),
            finished: false,
        }))
    }

    fn get_or_create(&self, record: R) -> Result<(R, bool), StoreError> {
        let mut tables = self.tables()?;
        let key = record.unique_key();
        if let Some(existing) = tables.keys.get(&key).and_then(|id| tables.rows.get(id)) {
            return Ok((existing.clone(), false));
        }
        if tables.rows.contains_key(&record.id()) {
            return Err(StoreError::Conflict(record.id().to_string()));
        }
        tables.keys.insert(key, record.id());
        tables.rows.insert(record.id(), record.clone());
        Ok((record, true))
    }

    fn get(&self, id: R::Id) -> Result<Option<R>, StoreError> {
        Ok(self.tables()?.rows.get(&id).cloned())
    }

    fn select(&self, selector: &R::Selector, limit: usize) -> Result<Vec<R>, StoreError> {
        let tables = self.tables()?;
        let mut rows = in_creation_order(tables.rows.values().filter(|r| r.matches(selector)).cloned());
        rows.truncate(limit);
        Ok(rows)
    }
}

struct InMemoryTransaction<'a, R: Record> {
    store: &'a InMemoryStore<R>,
    tx: TxId,
    writes: BTreeMap<R::Id, R>,
    inserted: HashSet<R::Id>,
    finished: bool,
}

impl<R: Record> InMemoryTransaction<'_, R> {
    /// The row as this transaction sees it (own writes first).
    fn view(&self, tables: &Tables<R>, id: R::Id) -> Option<R> {
        self.writes
            .get(&id)
            .or_else(|| tables.rows.get(&id))
            .cloned()
    }

    fn release(&mut self) {
        let mut tables = self.store.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.locks.retain(|_, owner| *owner != self.tx);
        drop(tables);
        self.store.released.notify_all();
        self.finished = true;
    }
}

impl<R: Record> Transaction<R> for InMemoryTransaction<'_, R> {
    fn select(
        &mut self,
        selector: &R::Selector,
        limit: usize,
        lock: LockMode,
    ) -> Result<Vec<R>, StoreError> {
        let mut tables = self.store.tables()?;
        let candidates = in_creation_order(
            tables
                .rows
                .values()
                .filter(|r| !self.writes.contains_key(&r.id()))
                .chain(self.writes.values())
                .filter(|r| r.matches(selector))
                .cloned(),
        );

        let mut selected = Vec::new();
        for candidate in candidates {
            if selected.len() >= limit {
                break;
            }
            let id = candidate.id();
            let (guard, held) = self.store.acquire(tables, self.tx, id, lock)?;
            tables = guard;
            if !held {
                continue;
            }
            // The row may have changed while we waited for it.
            if let Some(current) = self.view(&tables, id).filter(|r| r.matches(selector)) {
                selected.push(current);
            }
        }
        Ok(selected)
    }

    fn lock(&mut self, id: R::Id, lock: LockMode) -> Result<Option<R>, StoreError> {
        let tables = self.store.tables()?;
        if self.view(&tables, id).is_none() {
            return Ok(None);
        }
        let (tables, held) = self.store.acquire(tables, self.tx, id, lock)?;
        Ok(if held { self.view(&tables, id) } else { None })
    }

    fn lock_many(&mut self, ids: &[R::Id], lock: LockMode) -> Result<Vec<R>, StoreError> {
        let mut tables = self.store.tables()?;
        let targets = in_creation_order(ids.iter().filter_map(|id| self.view(&tables, *id)));

        let mut locked = Vec::with_capacity(targets.len());
        for target in targets {
            let id = target.id();
            let (guard, held) = self.store.acquire(tables, self.tx, id, lock)?;
            tables = guard;
            if held {
                locked.extend(self.view(&tables, id));
            }
        }
        Ok(locked)
    }

    fn insert(&mut self, record: &R) -> Result<(), StoreError> {
        let mut tables = self.store.tables()?;
        let id = record.id();
        if tables.rows.contains_key(&id) || self.writes.contains_key(&id) {
            return Err(StoreError::Conflict(id.to_string()));
        }
        let key = record.unique_key();
        let pending_duplicate = self
            .inserted
            .iter()
            .filter_map(|pending| self.writes.get(pending))
            .any(|pending| pending.unique_key() == key);
        if tables.keys.contains_key(&key) || pending_duplicate {
            return Err(StoreError::Conflict(format!("{key:?}")));
        }

        tables.locks.insert(id, self.tx);
        self.inserted.insert(id);
        self.writes.insert(id, record.clone());
        Ok(())
    }

    fn save(&mut self, record: &R) -> Result<(), StoreError> {
        let tables = self.store.tables()?;
        let id = record.id();
        if self.view(&tables, id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        // An UPDATE takes the row lock.
        let _held = self.store.acquire(tables, self.tx, id, LockMode::Wait)?;
        self.writes.insert(id, record.clone());
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let mut tables = self.store.tables()?;

        for id in &self.inserted {
            if let Some(record) = self.writes.get(id) {
                let key = record.unique_key();
                if tables.keys.contains_key(&key) {
                    return Err(StoreError::Conflict(format!("{key:?}")));
                }
            }
        }

        let writes = std::mem::take(&mut self.writes);
        for (id, record) in writes {
            let key = record.unique_key();
            if let Some(previous) = tables.rows.get(&id).map(Record::unique_key) {
                if previous != key {
                    tables.keys.remove(&previous);
                }
            }
            tables.keys.insert(key, id);
            tables.rows.insert(id, record);
        }
        drop(tables);

        self.release();
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.writes.clear();
        self.release();
        Ok(())
    }
}

impl<R: Record> Drop for InMemoryTransaction<'_, R> {
    fn drop(&mut self) {
        if !self.finished {
            self.release();
        }
    }
}
