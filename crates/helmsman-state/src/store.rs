//! RecordStore: redb-backed persistence for rollout records.
//!
//! Provides create/get/list plus closure-based updates that run inside a
//! single write transaction. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::broadcast;
use tracing::debug;

use helmsman_core::{RecordKey, WorkloadRef};

use crate::error::{map_err, StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use crate::watch::{Subscription, WatchFilter};

/// Buffered change events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Thread-safe record store backed by redb.
#[derive(Clone)]
pub struct RecordStore {
    db: Arc<Database>,
    events: broadcast::Sender<ChangeEvent>,
    /// Held from `begin_write` through `publish`, so subscribers see
    /// events in commit order across records.
    commit_order: Arc<Mutex<()>>,
}

impl RecordStore {
    /// Open (or create) a persistent record store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db)?;
        debug!(?path, "record store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory record store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db)?;
        debug!("in-memory record store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
            commit_order: Arc::new(Mutex::new(())),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    // ── Records ────────────────────────────────────────────────────

    /// Insert a new record. Fails if the key is already taken.
    pub fn create(&self, record: &RolloutRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let _order = self.commit_order();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "record created");

        self.publish(ChangeEvent {
            key: record.key(),
            fields: vec![RecordField::Created],
            record: record.clone(),
        });
        Ok(())
    }

    /// Get a record by key.
    pub fn get(&self, key: &RecordKey) -> StateResult<Option<RolloutRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(key.table_key().as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: RolloutRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// All records of one workload, newest first.
    pub fn list_for_workload(&self, workload: &WorkloadRef) -> StateResult<Vec<RolloutRecord>> {
        let prefix = format!("{}/", workload.table_key());
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: RolloutRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        sort_newest_first(&mut results);
        Ok(results)
    }

    /// Every record in the store, newest first.
    pub fn list(&self) -> StateResult<Vec<RolloutRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: RolloutRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        sort_newest_first(&mut results);
        Ok(results)
    }

    /// Read-modify-write one record inside a single write transaction.
    ///
    /// `f` sees the current record and mutates it in place. If it returns
    /// `Err`, nothing is written. If it leaves the record unchanged, nothing
    /// is written and no event is published. Identity fields cannot change.
    pub fn update<T, E, F>(&self, key: &RecordKey, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut RolloutRecord) -> Result<T, E>,
        E: From<StateError>,
    {
        let table_key = key.table_key();
        let _order = self.commit_order();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;

        let bytes = {
            let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let guard = table.get(table_key.as_str()).map_err(map_err!(Read))?;
            guard.map(|g| g.value().to_vec())
        };
        let Some(bytes) = bytes else {
            txn.abort().map_err(map_err!(Transaction))?;
            return Err(StateError::NotFound(table_key).into());
        };
        let before: RolloutRecord =
            serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;

        let mut record = before.clone();
        let out = match f(&mut record) {
            Ok(out) => out,
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                return Err(e);
            }
        };

        if record.table_key() != table_key {
            txn.abort().map_err(map_err!(Transaction))?;
            return Err(StateError::Write(format!("record identity is immutable: {table_key}")).into());
        }

        let fields = RolloutRecord::changed_fields(&before, &record);
        if fields.is_empty() {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(out);
        }

        let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            table
                .insert(table_key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        self.publish(ChangeEvent {
            key: key.clone(),
            fields,
            record,
        });
        Ok(out)
    }

    /// Append one log entry to a record.
    pub fn append_log(
        &self,
        key: &RecordKey,
        severity: Severity,
        message: impl Into<String>,
    ) -> StateResult<()> {
        let message = message.into();
        self.update(key, |record| {
            record.push_log(severity, message);
            Ok::<_, StateError>(())
        })
    }

    // ── Subscriptions ──────────────────────────────────────────────

    /// Subscribe to committed changes matching `filter`.
    pub fn subscribe(&self, filter: WatchFilter) -> Subscription {
        Subscription::new(self.events.subscribe(), filter)
    }

    fn commit_order(&self) -> MutexGuard<'_, ()> {
        // The guard protects no data, so a poisoned lock is still usable.
        self.commit_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ChangeEvent) {
        // No receivers is fine: nobody is watching.
        let _ = self.events.send(event);
    }
}

fn sort_newest_first(records: &mut [RolloutRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman_core::WorkloadKind;
    use std::time::Duration;

    fn test_record(env: &str, workload: &str, id: &str) -> RolloutRecord {
        RolloutRecord::new(
            &RecordKey::new(env, workload, id),
            WorkloadKind::Service,
            "main",
            "v42",
            "alice",
        )
    }

    // ── Record CRUD ────────────────────────────────────────────────

    #[test]
    fn create_and_get() {
        let store = RecordStore::open_in_memory().unwrap();
        let rec = test_record("prod", "api", "a1");

        store.create(&rec).unwrap();
        let got = store.get(&rec.key()).unwrap();
        assert_eq!(got, Some(rec));
    }

    #[test]
    fn create_twice_fails() {
        let store = RecordStore::open_in_memory().unwrap();
        let rec = test_record("prod", "api", "a1");
        store.create(&rec).unwrap();

        let err = store.create(&rec).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn get_missing_is_none() {
        let store = RecordStore::open_in_memory().unwrap();
        assert!(store.get(&RecordKey::new("prod", "api", "nope")).unwrap().is_none());
    }

    #[test]
    fn list_for_workload_filters_by_prefix() {
        let store = RecordStore::open_in_memory().unwrap();
        let mut older = test_record("prod", "api", "a1");
        older.created_at = 1000;
        let mut newer = test_record("prod", "api", "a2");
        newer.created_at = 2000;
        store.create(&older).unwrap();
        store.create(&newer).unwrap();
        // Same name prefix, different workload.
        store.create(&test_record("prod", "api-worker", "b1")).unwrap();
        store.create(&test_record("staging", "api", "c1")).unwrap();

        let records = store
            .list_for_workload(&WorkloadRef::new("prod", "api"))
            .unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a1"]);

        assert_eq!(store.list().unwrap().len(), 4);
    }

    // ── Updates ────────────────────────────────────────────────────

    #[test]
    fn update_persists_changes() {
        let store = RecordStore::open_in_memory().unwrap();
        let rec = test_record("prod", "api", "a1");
        store.create(&rec).unwrap();

        let state = store
            .update(&rec.key(), |r| {
                r.state = RolloutState::Running;
                r.clock += Duration::from_secs(2);
                Ok::<_, StateError>(r.state)
            })
            .unwrap();
        assert_eq!(state, RolloutState::Running);

        let got = store.get(&rec.key()).unwrap().unwrap();
        assert_eq!(got.state, RolloutState::Running);
        assert_eq!(got.clock, Duration::from_secs(2));
    }

    #[test]
    fn failed_update_writes_nothing() {
        let store = RecordStore::open_in_memory().unwrap();
        let rec = test_record("prod", "api", "a1");
        store.create(&rec).unwrap();

        let result: Result<(), StateError> = store.update(&rec.key(), |r| {
            r.state = RolloutState::Failed;
            Err(StateError::Write("rejected".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(
            store.get(&rec.key()).unwrap().unwrap().state,
            RolloutState::New
        );
    }

    #[test]
    fn update_missing_is_not_found() {
        let store = RecordStore::open_in_memory().unwrap();
        let err = store
            .update(&RecordKey::new("prod", "api", "nope"), |_| Ok::<_, StateError>(()))
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn identity_cannot_change() {
        let store = RecordStore::open_in_memory().unwrap();
        let rec = test_record("prod", "api", "a1");
        store.create(&rec).unwrap();

        let err = store
            .update(&rec.key(), |r| {
                r.id = "other".to_string();
                Ok::<_, StateError>(())
            })
            .unwrap_err();
        assert!(matches!(err, StateError::Write(_)));
    }

    #[test]
    fn append_log_keeps_order() {
        let store = RecordStore::open_in_memory().unwrap();
        let rec = test_record("prod", "api", "a1");
        store.create(&rec).unwrap();

        store.append_log(&rec.key(), Severity::Debug, "first").unwrap();
        store.append_log(&rec.key(), Severity::Warn, "second").unwrap();

        let log = store.get(&rec.key()).unwrap().unwrap().log;
        let messages: Vec<_> = log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(log[1].severity, Severity::Warn);
    }

    // ── Subscriptions ──────────────────────────────────────────────

    #[tokio::test]
    async fn subscription_sees_matching_changes_only() {
        let store = RecordStore::open_in_memory().unwrap();
        let rec = test_record("prod", "api", "a1");
        let other = test_record("prod", "worker", "b1");
        store.create(&rec).unwrap();
        store.create(&other).unwrap();

        let mut sub = store.subscribe(WatchFilter::Record(rec.key()));

        store
            .update(&other.key(), |r| {
                r.state = RolloutState::Running;
                Ok::<_, StateError>(())
            })
            .unwrap();
        store
            .update(&rec.key(), |r| {
                r.state = RolloutState::Running;
                Ok::<_, StateError>(())
            })
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.key, rec.key());
        assert!(event.touches(RecordField::State));
        assert_eq!(event.record.state, RolloutState::Running);
    }

    #[tokio::test]
    async fn events_arrive_in_commit_order_across_records() {
        use std::sync::atomic::{AtomicU32, Ordering};

        const WRITERS: u32 = 16;
        let store = RecordStore::open_in_memory().unwrap();
        let keys: Vec<RecordKey> = (0..WRITERS)
            .map(|i| {
                let rec = test_record("prod", "api", &format!("r{i}"));
                store.create(&rec).unwrap();
                rec.key()
            })
            .collect();

        let mut sub = store.subscribe(WatchFilter::All);
        // Stamped inside the write transaction, so it follows commit order.
        let sequence = AtomicU32::new(1);
        std::thread::scope(|scope| {
            for key in &keys {
                let store = store.clone();
                let sequence = &sequence;
                scope.spawn(move || {
                    store
                        .update(key, |r| {
                            r.desired_replicas = sequence.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, StateError>(())
                        })
                        .unwrap();
                });
            }
        });

        let mut seen = Vec::new();
        for _ in 0..WRITERS {
            seen.push(sub.recv().await.unwrap().record.desired_replicas);
        }
        assert_eq!(seen, (1..=WRITERS).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn no_op_update_publishes_nothing() {
        let store = RecordStore::open_in_memory().unwrap();
        let rec = test_record("prod", "api", "a1");
        store.create(&rec).unwrap();

        let mut sub = store.subscribe(WatchFilter::Workload(rec.workload_ref()));
        store.update(&rec.key(), |_| Ok::<_, StateError>(())).unwrap();
        store.append_log(&rec.key(), Severity::Info, "touched").unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.fields, vec![RecordField::Log]);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");
        let rec = test_record("prod", "api", "a1");

        {
            let store = RecordStore::open(&db_path).unwrap();
            store.create(&rec).unwrap();
        }

        let store = RecordStore::open(&db_path).unwrap();
        let got = store.get(&rec.key()).unwrap();
        assert_eq!(got.map(|r| r.tag), Some("v42".to_string()));
    }
}
