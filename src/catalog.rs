//! # Stage: Catalog
//!
//! ## Responsibility
//! Process-wide benchmark state: one [`HistoryStore`] per suite plus the
//! repository metadata (source URL, last-update timestamp). Built once at
//! startup from the persisted document, handed by reference to the
//! ingestion pipeline, saved after every successful ingestion.
//!
//! ## Guarantees
//! - Every append in any suite bumps the catalog's last-update timestamp
//! - Suites are only removed by the ingestion pipeline, and only when the
//!   failed ingestion that created them left them empty
//!
//! ## NOT Responsible For
//! - Reading or writing the document (persist)

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::history::{BackfillPolicy, HistoryStore};

/// Suite name used when neither the run nor the config names one.
pub const DEFAULT_SUITE: &str = "Benchmark";

#[derive(Debug)]
pub struct Catalog {
    repo_url: String,
    policy: BackfillPolicy,
    suites: RwLock<BTreeMap<String, Arc<HistoryStore>>>,
    last_update_ms: Arc<AtomicU64>,
}

impl Catalog {
    pub fn new(repo_url: impl Into<String>, policy: BackfillPolicy) -> Self {
        Self {
            repo_url: repo_url.into(),
            policy,
            suites: RwLock::new(BTreeMap::new()),
            last_update_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    pub fn set_repo_url(&mut self, repo_url: impl Into<String>) {
        self.repo_url = repo_url.into();
    }

    pub fn policy(&self) -> BackfillPolicy {
        self.policy
    }

    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms.load(Ordering::SeqCst)
    }

    /// Restore the timestamp carried by a loaded document.
    pub(crate) fn set_last_update_ms(&self, ms: u64) {
        self.last_update_ms.store(ms, Ordering::SeqCst);
    }

    pub fn suite(&self, name: &str) -> Option<Arc<HistoryStore>> {
        self.suites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Suite `name`, created empty on first use.
    pub fn suite_or_create(&self, name: &str) -> Arc<HistoryStore> {
        if let Some(store) = self.suite(name) {
            return store;
        }
        self.suites
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(HistoryStore::with_clock(self.policy, Arc::clone(&self.last_update_ms)))
            })
            .clone()
    }

    /// Drop suite `name` if it holds no runs. Returns whether it was removed.
    pub(crate) fn remove_empty_suite(&self, name: &str) -> bool {
        let mut suites = self.suites.write().unwrap_or_else(PoisonError::into_inner);
        match suites.get(name) {
            Some(store) if store.run_count() == 0 => {
                suites.remove(name);
                tracing::debug!(target: "benchwatch::catalog", suite = %name, "removed empty suite");
                true
            }
            _ => false,
        }
    }

    pub fn suite_names(&self) -> Vec<String> {
        self.suites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Whether any suite has a run for this commit.
    pub fn contains_commit(&self, commit_id: &str) -> bool {
        self.suites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|s| s.contains_commit(commit_id))
    }

    /// Total number of stored runs across suites.
    pub fn run_count(&self) -> usize {
        self.suites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| s.run_count())
            .sum()
    }
}

impl PartialEq for Catalog {
    fn eq(&self, other: &Self) -> bool {
        self.repo_url == other.repo_url
            && self.last_update_ms() == other.last_update_ms()
            && self.suite_names() == other.suite_names()
            && self
                .suite_names()
                .iter()
                .all(|name| self.suite(name) == other.suite(name))
    }
}
