//! # Stage: History Store
//!
//! ## Responsibility
//! Append-only, per-benchmark ordered log of [`MeasurementRecord`]s for one
//! suite. Records are kept in commit-timestamp order; lookups are by
//! benchmark name (dense ordered `Vec` per name) and by commit id (secondary
//! index from commit to the shared [`RunMetadata`] and the benchmarks the run
//! touched).
//!
//! ## Guarantees
//! - Ordered: every history is non-decreasing in timestamp after any sequence
//!   of successful appends; equal timestamps keep arrival order
//! - Atomic per benchmark: a record is either stored as-is or not at all
//! - One unit per benchmark: a unit change is refused with `UnitConflict`
//! - Concurrency: one mutex per benchmark name; appends to different names
//!   never contend, appends to the same name are serialized
//!
//! ## NOT Responsible For
//! - Deciding whether a value regressed (analyzer)
//! - Durability (persist)

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::AppendError;
use crate::model::{MeasurementRecord, RunMetadata};

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// Lock helpers: histories only ever grow by whole records, so a guard
// recovered from a poisoned lock still sees consistent data.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// BackfillPolicy
// ---------------------------------------------------------------------------

/// What to do with a record older than the newest entry of its history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillPolicy {
    /// Refuse with `OutOfOrderInsert`.
    #[default]
    Reject,
    /// Insert at its timestamp position.
    Resort,
}

// ---------------------------------------------------------------------------
// BenchmarkHistory
// ---------------------------------------------------------------------------

/// Ordered records of one benchmark name.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkHistory {
    name: String,
    records: Vec<MeasurementRecord>,
}

impl BenchmarkHistory {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), records: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit fixed by the first record, `None` while empty.
    pub fn unit(&self) -> Option<&str> {
        self.records.first().map(|r| r.unit.as_str())
    }

    pub fn records(&self) -> &[MeasurementRecord] {
        &self.records
    }

    pub fn latest(&self) -> Option<&MeasurementRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Where `record` would go, or why it cannot.
    fn insert_position(
        &self,
        record: &MeasurementRecord,
        policy: BackfillPolicy,
    ) -> Result<usize, AppendError> {
        if let Some(unit) = self.unit() {
            if unit != record.unit {
                return Err(AppendError::UnitConflict {
                    name: self.name.clone(),
                    expected: unit.to_string(),
                    found: record.unit.clone(),
                });
            }
        }
        let ts = record.timestamp();
        match self.records.last() {
            Some(last) if ts < last.timestamp() => match policy {
                BackfillPolicy::Reject => Err(AppendError::OutOfOrderInsert {
                    name: self.name.clone(),
                    latest: last.timestamp(),
                    found: ts,
                }),
                BackfillPolicy::Resort => {
                    Ok(self.records.partition_point(|r| r.timestamp() <= ts))
                }
            },
            _ => Ok(self.records.len()),
        }
    }

    fn append(&mut self, record: MeasurementRecord, policy: BackfillPolicy) -> Result<usize, AppendError> {
        let pos = self.insert_position(&record, policy)?;
        self.records.insert(pos, record);
        Ok(pos)
    }

    /// Up to `count` records before the last record of `commit_id` that pass
    /// `keep`, oldest first. When the commit is absent the whole history is
    /// the prefix.
    fn prior<F>(&self, commit_id: &str, count: usize, keep: F) -> Vec<MeasurementRecord>
    where
        F: Fn(&MeasurementRecord) -> bool,
    {
        let end = self
            .records
            .iter()
            .rposition(|r| r.commit_id() == commit_id)
            .unwrap_or(self.records.len());
        tail(&self.records[..end], count, keep)
    }
}

fn tail<F>(records: &[MeasurementRecord], count: usize, keep: F) -> Vec<MeasurementRecord>
where
    F: Fn(&MeasurementRecord) -> bool,
{
    let mut picked: Vec<MeasurementRecord> = records
        .iter()
        .rev()
        .filter(|r| keep(r))
        .take(count)
        .cloned()
        .collect();
    picked.reverse();
    picked
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// A consistent, restartable view of part of a history, oldest first.
///
/// Not lazy: the records are copied out under the benchmark's lock when the
/// window is taken, so later appends never show up in an existing window and
/// the lock is not held while callers iterate. Iterating borrows; the window
/// can be walked any number of times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Window {
    records: Vec<MeasurementRecord>,
}

impl Window {
    pub fn iter(&self) -> std::slice::Iter<'_, MeasurementRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&MeasurementRecord> {
        self.records.last()
    }

    pub fn as_slice(&self) -> &[MeasurementRecord] {
        &self.records
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.records.iter().map(|r| r.value)
    }
}

impl From<Vec<MeasurementRecord>> for Window {
    fn from(records: Vec<MeasurementRecord>) -> Self {
        Self { records }
    }
}

impl<'a> IntoIterator for &'a Window {
    type Item = &'a MeasurementRecord;
    type IntoIter = std::slice::Iter<'a, MeasurementRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl IntoIterator for Window {
    type Item = MeasurementRecord;
    type IntoIter = std::vec::IntoIter<MeasurementRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

// ---------------------------------------------------------------------------
// HistoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RunEntry {
    meta: Arc<RunMetadata>,
    /// Arrival order, used to break timestamp ties.
    seq: u64,
    /// Benchmarks this run contributed, in append order.
    benches: Vec<String>,
}

/// All benchmark histories of one suite.
#[derive(Debug)]
pub struct HistoryStore {
    policy: BackfillPolicy,
    histories: RwLock<BTreeMap<String, Arc<Mutex<BenchmarkHistory>>>>,
    runs: RwLock<HashMap<String, RunEntry>>,
    next_seq: AtomicU64,
    last_update_ms: Arc<AtomicU64>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(BackfillPolicy::default())
    }
}

impl HistoryStore {
    pub fn new(policy: BackfillPolicy) -> Self {
        Self::with_clock(policy, Arc::new(AtomicU64::new(0)))
    }

    /// Store whose appends bump a last-update cell shared with its owner.
    pub(crate) fn with_clock(policy: BackfillPolicy, last_update_ms: Arc<AtomicU64>) -> Self {
        Self {
            policy,
            histories: RwLock::new(BTreeMap::new()),
            runs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            last_update_ms,
        }
    }

    pub fn policy(&self) -> BackfillPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: BackfillPolicy) {
        self.policy = policy;
    }

    /// Unix ms of the last successful append (or of the loaded document).
    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms.load(Ordering::SeqCst)
    }

    fn history_handle(&self, name: &str) -> Option<Arc<Mutex<BenchmarkHistory>>> {
        read(&self.histories).get(name).cloned()
    }

    fn history_handle_or_create(&self, name: &str) -> Arc<Mutex<BenchmarkHistory>> {
        if let Some(handle) = self.history_handle(name) {
            return handle;
        }
        write(&self.histories)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BenchmarkHistory::new(name))))
            .clone()
    }

    /// Insert `record` into the history named by `record.name`.
    ///
    /// Returns the position it landed at. On error the history is unchanged.
    pub fn append(&self, record: MeasurementRecord) -> Result<usize, AppendError> {
        let name = record.name.clone();
        let run = Arc::clone(&record.run);
        let handle = self.history_handle_or_create(&name);

        let pos = lock(&handle).append(record, self.policy)?;

        {
            let mut runs = write(&self.runs);
            let entry = runs.entry(run.commit_id().to_string()).or_insert_with(|| RunEntry {
                meta: Arc::clone(&run),
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                benches: Vec::new(),
            });
            if !entry.benches.iter().any(|b| b == &name) {
                entry.benches.push(name.clone());
            }
        }

        self.last_update_ms.fetch_max(now_ms(), Ordering::SeqCst);
        tracing::debug!(
            target: "benchwatch::history",
            benchmark = %name,
            commit = %run.commit_id(),
            position = pos,
            "appended record"
        );
        Ok(pos)
    }

    /// Snapshot of the most recent `count` records of `name`, oldest first.
    pub fn window(&self, name: &str, count: usize) -> Window {
        self.window_where(name, count, |_| true)
    }

    /// The most recent `count` records of `name` that pass `keep`.
    pub fn window_where<F>(&self, name: &str, count: usize, keep: F) -> Window
    where
        F: Fn(&MeasurementRecord) -> bool,
    {
        match self.history_handle(name) {
            Some(handle) => Window::from(tail(lock(&handle).records(), count, keep)),
            None => Window::default(),
        }
    }

    /// Up to `count` records of `name` preceding `commit_id`'s record.
    pub fn prior_window<F>(&self, name: &str, commit_id: &str, count: usize, keep: F) -> Window
    where
        F: Fn(&MeasurementRecord) -> bool,
    {
        match self.history_handle(name) {
            Some(handle) => Window::from(lock(&handle).prior(commit_id, count, keep)),
            None => Window::default(),
        }
    }

    /// Full ordered history of `name`, `None` if the name was never appended.
    pub fn history(&self, name: &str) -> Option<Window> {
        let handle = self.history_handle(name)?;
        let guard = lock(&handle);
        if guard.is_empty() {
            return None;
        }
        Some(Window::from(guard.records().to_vec()))
    }

    /// Unit of `name`'s history.
    pub fn unit(&self, name: &str) -> Option<String> {
        let handle = self.history_handle(name)?;
        let guard = lock(&handle);
        guard.unit().map(str::to_string)
    }

    /// Every benchmark name with at least one record.
    pub fn names(&self) -> BTreeSet<String> {
        read(&self.histories)
            .iter()
            .filter(|(_, h)| !lock(h).is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn contains_commit(&self, commit_id: &str) -> bool {
        read(&self.runs).contains_key(commit_id)
    }

    pub fn run(&self, commit_id: &str) -> Option<Arc<RunMetadata>> {
        read(&self.runs).get(commit_id).map(|e| Arc::clone(&e.meta))
    }

    /// Every record a run contributed, in the order it was appended.
    pub fn records_for_commit(&self, commit_id: &str) -> Vec<MeasurementRecord> {
        let benches = match read(&self.runs).get(commit_id) {
            Some(entry) => entry.benches.clone(),
            None => return Vec::new(),
        };
        benches
            .iter()
            .filter_map(|name| {
                let handle = self.history_handle(name)?;
                let guard = lock(&handle);
                guard.records().iter().rev().find(|r| r.commit_id() == commit_id).cloned()
            })
            .collect()
    }

    /// All runs with their records, ordered by timestamp then arrival.
    pub fn runs_in_order(&self) -> Vec<(Arc<RunMetadata>, Vec<MeasurementRecord>)> {
        let mut entries: Vec<RunEntry> = read(&self.runs).values().cloned().collect();
        entries.sort_by(|a, b| {
            a.meta
                .timestamp()
                .cmp(&b.meta.timestamp())
                .then(a.seq.cmp(&b.seq))
        });
        entries
            .into_iter()
            .map(|entry| {
                let records = self.records_for_commit(entry.meta.commit_id());
                (entry.meta, records)
            })
            .filter(|(_, records)| !records.is_empty())
            .collect()
    }

    pub fn run_count(&self) -> usize {
        read(&self.runs).len()
    }

    /// Drop every record of a run that was never made durable.
    ///
    /// Only the ingestion pipeline calls this, when saving the catalog after
    /// an append fails. Histories left empty keep their slot but report no
    /// unit and are not listed by [`HistoryStore::names`].
    pub(crate) fn retract_uncommitted(&self, commit_id: &str) {
        let entry = match write(&self.runs).remove(commit_id) {
            Some(entry) => entry,
            None => return,
        };
        for name in &entry.benches {
            if let Some(handle) = self.history_handle(name) {
                lock(&handle).records.retain(|r| r.commit_id() != commit_id);
            }
        }
        tracing::debug!(
            target: "benchwatch::history",
            commit = %commit_id,
            benchmarks = entry.benches.len(),
            "retracted uncommitted run"
        );
    }
}

impl PartialEq for HistoryStore {
    fn eq(&self, other: &Self) -> bool {
        if self.names() != other.names() {
            return false;
        }
        let same_histories = self
            .names()
            .iter()
            .all(|name| self.history(name) == other.history(name));
        let ours: Vec<_> = self.runs_in_order();
        let theirs: Vec<_> = other.runs_in_order();
        same_histories && ours == theirs
    }
}
