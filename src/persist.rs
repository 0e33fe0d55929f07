//! # Stage: Persistence
//!
//! ## Responsibility
//! Convert the in-memory [`Catalog`] to and from its persisted document and
//! store that document behind the [`CatalogPersistence`] trait:
//!
//! ```text
//! { lastUpdate, repoUrl, entries: { <suite>: [ run, ... ] } }
//! ```
//!
//! Backends: a JSON file (optionally wrapped as `window.BENCHMARK_DATA = ...`
//! for chart pages), an append-only SQLite snapshot table, and an in-memory
//! store for tests and dry runs.
//!
//! ## Guarantees
//! - Round trip: `from_catalog` then `into_catalog` reproduces an equal catalog
//! - File saves are atomic: a temp file in the same directory renamed into place
//! - SQLite saves never overwrite; every save is a new row, load reads the newest
//!
//! ## NOT Responsible For
//! - When to save (ingestion pipeline)

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::error::{BenchError, Result};
use crate::history::{now_ms, BackfillPolicy};
use crate::model::{MeasurementRecord, Run};

/// Prefix chart pages expect in front of the document.
pub const DATA_JS_PREFIX: &str = "window.BENCHMARK_DATA = ";

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// The persisted catalog. Runs within a suite are ordered oldest to newest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCatalog {
    /// Unix ms of the last append.
    #[serde(default)]
    pub last_update: u64,
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<Run>>,
}

impl PersistedCatalog {
    /// Snapshot every suite of `catalog`.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let entries = catalog
            .suite_names()
            .into_iter()
            .filter_map(|suite| {
                let store = catalog.suite(&suite)?;
                let runs = store
                    .runs_in_order()
                    .into_iter()
                    .map(|(meta, records)| Run {
                        commit: meta.commit.clone(),
                        date: meta.date,
                        tool: meta.tool.clone(),
                        benches: records.iter().map(MeasurementRecord::to_measurement).collect(),
                        extra: meta.extra.clone(),
                    })
                    .collect();
                Some((suite, runs))
            })
            .collect();
        Self {
            last_update: catalog.last_update_ms(),
            repo_url: catalog.repo_url().to_string(),
            entries,
        }
    }

    /// Rebuild a catalog. Runs are replayed in timestamp order, so a document
    /// written out of order still loads under [`BackfillPolicy::Reject`].
    ///
    /// A bench that fails validation makes the whole document invalid. A
    /// bench the store refuses (unit change mid-history) or a repeated commit
    /// id is skipped with a warning; such documents cannot be produced by
    /// ingestion.
    pub fn into_catalog(self, policy: BackfillPolicy) -> Result<Catalog> {
        let catalog = Catalog::new(self.repo_url, policy);
        for (suite, mut runs) in self.entries {
            let store = catalog.suite_or_create(&suite);
            runs.sort_by_key(|run| run.commit.timestamp);
            for run in runs {
                if store.contains_commit(&run.commit.id) {
                    tracing::warn!(
                        target: "benchwatch::persist",
                        suite = %suite,
                        commit = %run.commit.id,
                        "skipping repeated commit in document"
                    );
                    continue;
                }
                let meta = Arc::new(run.metadata());
                for bench in &run.benches {
                    let record = MeasurementRecord::from_measurement(bench, Arc::clone(&meta))
                        .map_err(|e| {
                            BenchError::persistence(format!(
                                "suite `{}`, commit {}: {}",
                                suite, run.commit.id, e
                            ))
                        })?;
                    if let Err(e) = store.append(record) {
                        tracing::warn!(
                            target: "benchwatch::persist",
                            suite = %suite,
                            commit = %run.commit.id,
                            error = %e,
                            "skipping bench from document"
                        );
                    }
                }
            }
        }
        catalog.set_last_update_ms(self.last_update);
        Ok(catalog)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse plain JSON or the `window.BENCHMARK_DATA = {...};` wrapper.
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(strip_data_js(text))?)
    }
}

fn strip_data_js(text: &str) -> &str {
    let trimmed = text.trim();
    let body = match trimmed.strip_prefix("window.BENCHMARK_DATA") {
        Some(rest) => rest.trim_start().strip_prefix('=').unwrap_or(rest),
        None => trimmed,
    };
    body.trim().trim_end_matches(';').trim_end()
}

/// Load the stored catalog, or start an empty one.
pub fn load_catalog(
    persistence: &dyn CatalogPersistence,
    policy: BackfillPolicy,
    repo_url: &str,
) -> Result<Catalog> {
    let mut catalog = match persistence.load()? {
        Some(doc) => doc.into_catalog(policy)?,
        None => {
            tracing::info!(
                target: "benchwatch::persist",
                store = %persistence.describe(),
                "no stored catalog, starting empty"
            );
            Catalog::new(repo_url, policy)
        }
    };
    if !repo_url.is_empty() && catalog.repo_url() != repo_url {
        catalog.set_repo_url(repo_url);
    }
    Ok(catalog)
}

// ---------------------------------------------------------------------------
// CatalogPersistence
// ---------------------------------------------------------------------------

/// Durable home of the catalog document.
pub trait CatalogPersistence: Send + Sync {
    /// The latest saved document, `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<PersistedCatalog>>;

    /// Make `doc` durable. Returns only once it is.
    fn save(&self, doc: &PersistedCatalog) -> Result<()>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Pick a backend from the file extension: `.js` is the chart-page wrapper,
/// `.db` / `.sqlite` is SQLite, anything else plain JSON.
pub fn open_for_path(path: impl AsRef<Path>) -> Result<Box<dyn CatalogPersistence>> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("db") | Some("sqlite") | Some("sqlite3") => Ok(Box::new(SqlitePersistence::open(path)?)),
        _ => Ok(Box::new(FilePersistence::new(path))),
    }
}

// ---------------------------------------------------------------------------
// FilePersistence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    /// `window.BENCHMARK_DATA = {...}` for static chart pages.
    DataJs,
}

impl DocumentFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("js") => DocumentFormat::DataJs,
            _ => DocumentFormat::Json,
        }
    }

    fn encode(&self, doc: &PersistedCatalog) -> Result<String> {
        let json = doc.to_json()?;
        Ok(match self {
            DocumentFormat::Json => format!("{}\n", json),
            DocumentFormat::DataJs => format!("{}{}\n", DATA_JS_PREFIX, json),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
    format: DocumentFormat,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = DocumentFormat::for_path(&path);
        Self { path, format }
    }

    pub fn with_format(path: impl Into<PathBuf>, format: DocumentFormat) -> Self {
        Self { path: path.into(), format }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> DocumentFormat {
        self.format
    }
}

impl CatalogPersistence for FilePersistence {
    fn load(&self) -> Result<Option<PersistedCatalog>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)?;
        let doc = PersistedCatalog::from_text(&text)?;
        tracing::debug!(
            target: "benchwatch::persist",
            path = %self.path.display(),
            suites = doc.entries.len(),
            "loaded catalog document"
        );
        Ok(Some(doc))
    }

    fn save(&self, doc: &PersistedCatalog) -> Result<()> {
        let text = self.format.encode(doc)?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| BenchError::Io(e.error))?;
        tracing::debug!(
            target: "benchwatch::persist",
            path = %self.path.display(),
            bytes = text.len(),
            "saved catalog document"
        );
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// ---------------------------------------------------------------------------
// SqlitePersistence
// ---------------------------------------------------------------------------

/// Append-only snapshot table: each save is a new row.
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
    location: String,
}

impl SqlitePersistence {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        Self::with_connection(conn, path.display().to_string())
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn with_connection(conn: Connection, location: String) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS catalog_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                saved_at INTEGER NOT NULL,
                last_update INTEGER NOT NULL,
                document TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn), location })
    }

    /// Number of saved snapshots.
    pub fn snapshot_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM catalog_snapshots", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl CatalogPersistence for SqlitePersistence {
    fn load(&self) -> Result<Option<PersistedCatalog>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let text: Option<String> = conn
            .query_row(
                "SELECT document FROM catalog_snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        text.map(|t| PersistedCatalog::from_text(&t)).transpose()
    }

    fn save(&self, doc: &PersistedCatalog) -> Result<()> {
        let text = serde_json::to_string(doc)?;
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO catalog_snapshots (saved_at, last_update, document) VALUES (?1, ?2, ?3)",
            params![now_ms() as i64, doc.last_update as i64, text],
        )?;
        tracing::debug!(
            target: "benchwatch::persist",
            db = %self.location,
            "inserted catalog snapshot"
        );
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.location)
    }
}

// ---------------------------------------------------------------------------
// MemoryPersistence
// ---------------------------------------------------------------------------

/// Keeps the last saved document as serialized bytes.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    saved: Mutex<Option<String>>,
    saves: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with an existing document.
    pub fn with_document(doc: &PersistedCatalog) -> Result<Self> {
        let store = Self::new();
        *store.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(doc.to_json()?);
        Ok(store)
    }

    /// Make every following save fail (simulates an unavailable disk).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// The stored bytes, exactly as saved.
    pub fn contents(&self) -> Option<String> {
        self.saved.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl CatalogPersistence for MemoryPersistence {
    fn load(&self) -> Result<Option<PersistedCatalog>> {
        self.contents().map(|t| PersistedCatalog::from_text(&t)).transpose()
    }

    fn save(&self, doc: &PersistedCatalog) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BenchError::persistence("memory store is failing"));
        }
        let text = doc.to_json()?;
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(text);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// Persistence handles are shared between a pipeline and its host.
impl<T: CatalogPersistence + ?Sized> CatalogPersistence for Arc<T> {
    fn load(&self) -> Result<Option<PersistedCatalog>> {
        (**self).load()
    }

    fn save(&self, doc: &PersistedCatalog) -> Result<()> {
        (**self).save(doc)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Commit, Measurement};
    use chrono::DateTime;

    fn run(id: &str, ts: &str, benches: &[(&str, f64)]) -> Run {
        let commit = Commit::new(id, DateTime::parse_from_rfc3339(ts).unwrap());
        benches.iter().fold(Run::new(commit, 1_607_000_000_000, "cargo"), |run, (name, v)| {
            run.with_bench(Measurement::new(*name, *v, v / 10.0, "ns/iter"))
        })
    }

    fn doc() -> PersistedCatalog {
        let mut entries = BTreeMap::new();
        entries.insert(
            "Benchmark".to_string(),
            vec![
                run("a", "2020-12-03T12:02:08+01:00", &[("x", 10.0), ("y", 20.0)]),
                run("b", "2020-12-03T12:36:21+01:00", &[("x", 11.0)]),
            ],
        );
        PersistedCatalog {
            last_update: 1_607_028_535_951,
            repo_url: "https://github.com/rune-rs/rune".into(),
            entries,
        }
    }

    #[test]
    fn test_strip_data_js_variants() {
        assert_eq!(strip_data_js("window.BENCHMARK_DATA = {}\n"), "{}");
        assert_eq!(strip_data_js("window.BENCHMARK_DATA={};"), "{}");
        assert_eq!(strip_data_js("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_document_field_names_are_camel_case() {
        let json = serde_json::to_value(doc()).unwrap();
        assert!(json.get("lastUpdate").is_some());
        assert!(json.get("repoUrl").is_some());
        assert_eq!(json["entries"]["Benchmark"][0]["benches"][0]["range"], "± 1");
    }

    #[test]
    fn test_document_round_trips_through_catalog() {
        let original = doc();
        let catalog = original.clone().into_catalog(BackfillPolicy::Reject).unwrap();
        assert_eq!(catalog.last_update_ms(), 1_607_028_535_951);
        assert_eq!(PersistedCatalog::from_catalog(&catalog), original);
    }

    #[test]
    fn test_out_of_order_document_is_sorted_on_load() {
        let mut d = doc();
        d.entries.get_mut("Benchmark").unwrap().reverse();
        let catalog = d.into_catalog(BackfillPolicy::Reject).unwrap();
        let back = PersistedCatalog::from_catalog(&catalog);
        assert_eq!(back.entries["Benchmark"][0].commit.id, "a");
    }

    #[test]
    fn test_invalid_bench_in_document_fails_load() {
        let mut d = doc();
        d.entries.get_mut("Benchmark").unwrap()[0].benches[0].range = Some("± nope".into());
        let err = d.into_catalog(BackfillPolicy::Reject).unwrap_err();
        assert!(matches!(err, BenchError::Persistence(_)));
    }

    #[test]
    fn test_empty_suite_survives_round_trip() {
        let mut d = doc();
        d.entries.insert("empty".into(), Vec::new());
        let catalog = d.clone().into_catalog(BackfillPolicy::Reject).unwrap();
        assert_eq!(PersistedCatalog::from_catalog(&catalog), d);
    }

    #[test]
    fn test_file_persistence_missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path().join("data.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_file_persistence_data_js_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.js");
        let store = FilePersistence::new(&path);
        assert_eq!(store.format(), DocumentFormat::DataJs);
        store.save(&doc()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(DATA_JS_PREFIX));
        assert_eq!(store.load().unwrap(), Some(doc()));
    }

    #[test]
    fn test_sqlite_keeps_every_snapshot() {
        let store = SqlitePersistence::in_memory().unwrap();
        assert!(store.load().unwrap().is_none());
        let mut d = doc();
        store.save(&d).unwrap();
        d.last_update += 1;
        store.save(&d).unwrap();
        assert_eq!(store.snapshot_count().unwrap(), 2);
        assert_eq!(store.load().unwrap().unwrap().last_update, d.last_update);
    }

    #[test]
    fn test_memory_persistence_failing() {
        let store = MemoryPersistence::new();
        store.set_failing(true);
        assert!(store.save(&doc()).is_err());
        assert_eq!(store.save_count(), 0);
        store.set_failing(false);
        store.save(&doc()).unwrap();
        assert_eq!(store.load().unwrap(), Some(doc()));
    }

    #[test]
    fn test_open_for_path_picks_backend() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_for_path(dir.path().join("bench.db")).unwrap();
        assert!(db.describe().starts_with("sqlite:"));
        let js = open_for_path(dir.path().join("data.js")).unwrap();
        assert!(js.describe().ends_with("data.js"));
    }

    #[test]
    fn test_load_catalog_applies_repo_url_to_empty_store() {
        let store = MemoryPersistence::new();
        let catalog = load_catalog(&store, BackfillPolicy::Reject, "https://x").unwrap();
        assert_eq!(catalog.repo_url(), "https://x");
        assert!(catalog.suite_names().is_empty());
    }
}
