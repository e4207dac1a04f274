#![allow(clippy::missing_errors_doc)]

//! File-backed record store for certification records.
//!
//! The canonical table lives in memory behind one `RwLock`. Every mutation
//! runs against a copy of the table, rewrites the whole backing file through a
//! temporary file plus rename, and only then swaps the copy in. A failed write
//! therefore leaves both memory and disk at their previous state.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use cert_tracker_core::{
    plan_bulk_edit, BulkEditPlan, BulkEditSummary, CertError, CertificationId,
    CertificationPatch, CertificationRecord, DerivationPolicy, EditedRow, NewCertification,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const STORE_FORMAT_VERSION: u32 = 1;

/// First write plus one retry.
const WRITE_ATTEMPTS: usize = 2;

#[derive(Debug, Deserialize)]
struct StoreFile {
    format_version: u32,
    next_id: u64,
    records: Vec<CertificationRecord>,
}

#[derive(Debug, Serialize)]
struct StoreFileRef<'a> {
    format_version: u32,
    next_id: u64,
    records: &'a [CertificationRecord],
}

#[derive(Debug, Clone)]
struct Table {
    next_id: u64,
    records: Vec<CertificationRecord>,
}

impl Table {
    fn empty() -> Self {
        Self {
            next_id: 1,
            records: Vec::new(),
        }
    }

    fn position(&self, id: CertificationId) -> Result<usize, CertError> {
        self.records
            .iter()
            .position(|record| record.id == id)
            .ok_or(CertError::NotFound(id))
    }
}

/// Writes the encoded table to its final location.
type FileWriter = Box<dyn Fn(&Path, &[u8]) -> io::Result<()> + Send + Sync>;

pub struct JsonCertificationStore {
    path: PathBuf,
    policy: DerivationPolicy,
    table: RwLock<Table>,
    writer: FileWriter,
}

impl fmt::Debug for JsonCertificationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCertificationStore")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl JsonCertificationStore {
    /// Opens the store at `path`, creating an empty file when none exists.
    pub fn open(path: &Path, policy: DerivationPolicy) -> Result<Self, CertError> {
        policy.validate()?;

        let table = match fs::read_to_string(path) {
            Ok(body) => decode_table(path, &body)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let table = Table::empty();
                persist(path, &table, &write_atomically)?;
                info!(path = %path.display(), "created empty certification store");
                table
            }
            Err(err) => {
                return Err(CertError::Persistence(format!(
                    "failed to read certification store at {}: {err}",
                    path.display()
                )))
            }
        };

        debug!(
            path = %path.display(),
            records = table.records.len(),
            next_id = table.next_id,
            "opened certification store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            policy,
            table: RwLock::new(table),
            writer: Box::new(write_atomically),
        })
    }

    #[cfg(test)]
    fn with_writer(mut self, writer: FileWriter) -> Self {
        self.writer = writer;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn policy(&self) -> &DerivationPolicy {
        &self.policy
    }

    /// Assigns the next id, derives dependent dates unless overrides are
    /// supplied, persists, and returns the stored record.
    pub fn add(&self, input: NewCertification) -> Result<CertificationRecord, CertError> {
        let policy = self.policy;
        self.mutate("add", move |table| {
            let id = CertificationId(table.next_id);
            let record = input.into_record(id, &policy)?;
            table.next_id = next_id_after(table.next_id)?;
            table.records.push(record.clone());
            Ok(record)
        })
    }

    pub fn update(
        &self,
        id: CertificationId,
        patch: &CertificationPatch,
    ) -> Result<CertificationRecord, CertError> {
        let policy = self.policy;
        self.mutate("update", move |table| {
            let position = table.position(id)?;
            let updated = table.records[position].apply_patch(patch, &policy)?;
            table.records[position] = updated.clone();
            Ok(updated)
        })
    }

    pub fn delete(&self, id: CertificationId) -> Result<(), CertError> {
        self.mutate("delete", move |table| {
            let position = table.position(id)?;
            table.records.remove(position);
            Ok(())
        })
    }

    pub fn get(&self, id: CertificationId) -> Result<CertificationRecord, CertError> {
        let table = self.read()?;
        let position = table.position(id)?;
        Ok(table.records[position].clone())
    }

    /// Snapshot of all records in insertion order.
    pub fn list(&self) -> Result<Vec<CertificationRecord>, CertError> {
        Ok(self.read()?.records.clone())
    }

    /// Swaps the table for the submitted snapshot in one step. Rows keep
    /// their ids, id-less rows are added, and records absent from `rows` are
    /// deleted. Any malformed row rejects the whole batch.
    pub fn replace_all(&self, rows: &[EditedRow]) -> Result<BulkEditSummary, CertError> {
        let policy = self.policy;
        self.mutate("replace_all", move |table| {
            let plan = plan_bulk_edit(&table.records, rows)?;
            apply_plan_to(table, &plan, &policy)
        })
    }

    /// Three-way bulk edit: diffs `submitted` against the `loaded` snapshot
    /// the editor started from and applies only those changes to the current
    /// table, leaving records added by others in the meantime untouched.
    pub fn apply_bulk_edit(
        &self,
        loaded: &[CertificationRecord],
        submitted: &[EditedRow],
    ) -> Result<BulkEditSummary, CertError> {
        let plan = plan_bulk_edit(loaded, submitted)?;
        self.apply_plan(&plan)
    }

    pub fn apply_plan(&self, plan: &BulkEditPlan) -> Result<BulkEditSummary, CertError> {
        let policy = self.policy;
        self.mutate("apply_plan", move |table| apply_plan_to(table, plan, &policy))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Table>, CertError> {
        self.table.read().map_err(|_| lock_poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Table>, CertError> {
        self.table.write().map_err(|_| lock_poisoned())
    }

    fn mutate<T>(
        &self,
        operation: &'static str,
        change: impl FnOnce(&mut Table) -> Result<T, CertError>,
    ) -> Result<T, CertError> {
        let mut guard = self.write()?;
        let mut next = guard.clone();
        let output = change(&mut next)?;
        persist(&self.path, &next, &*self.writer)?;
        debug!(
            operation,
            records = next.records.len(),
            "certification store mutation committed"
        );
        *guard = next;
        Ok(output)
    }
}

fn apply_plan_to(
    table: &mut Table,
    plan: &BulkEditPlan,
    policy: &DerivationPolicy,
) -> Result<BulkEditSummary, CertError> {
    let mut next_id = table.next_id;
    table.records = plan.apply(&table.records, &mut next_id, policy)?;
    table.next_id = next_id;
    let summary = plan.summary();
    info!(
        added = summary.added,
        updated = summary.updated,
        deleted = summary.deleted,
        "applied bulk certification edit"
    );
    Ok(summary)
}

fn next_id_after(current: u64) -> Result<u64, CertError> {
    current
        .checked_add(1)
        .ok_or_else(|| CertError::Persistence("certification id space exhausted".to_string()))
}

fn lock_poisoned() -> CertError {
    CertError::Persistence("certification table lock poisoned".to_string())
}

fn decode_table(path: &Path, body: &str) -> Result<Table, CertError> {
    let file: StoreFile = serde_json::from_str(body).map_err(|err| {
        CertError::Persistence(format!(
            "invalid certification store file {}: {err}",
            path.display()
        ))
    })?;

    if file.format_version != STORE_FORMAT_VERSION {
        return Err(CertError::Persistence(format!(
            "unsupported certification store format_version {} (expected {STORE_FORMAT_VERSION})",
            file.format_version
        )));
    }

    let mut seen = BTreeSet::new();
    for (idx, record) in file.records.iter().enumerate() {
        record.validate().map_err(|err| {
            CertError::Persistence(format!(
                "invalid record at records[{idx}] in {}: {err}",
                path.display()
            ))
        })?;
        if !seen.insert(record.id) {
            return Err(CertError::Persistence(format!(
                "duplicate certification id {} in {}",
                record.id,
                path.display()
            )));
        }
    }

    let floor = match seen.last() {
        Some(max_id) => next_id_after(max_id.0)?,
        None => 1,
    };
    Ok(Table {
        next_id: file.next_id.max(floor),
        records: file.records,
    })
}

fn persist(
    path: &Path,
    table: &Table,
    write: &dyn Fn(&Path, &[u8]) -> io::Result<()>,
) -> Result<(), CertError> {
    let body = serde_json::to_vec_pretty(&StoreFileRef {
        format_version: STORE_FORMAT_VERSION,
        next_id: table.next_id,
        records: &table.records,
    })
    .map_err(|err| CertError::Persistence(format!("failed to encode certification store: {err}")))?;

    let mut last_error = None;
    for attempt in 1..=WRITE_ATTEMPTS {
        match write(path, &body) {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(
                    attempt,
                    path = %path.display(),
                    error = %err,
                    "certification store write failed"
                );
                last_error = Some(err);
            }
        }
    }

    Err(CertError::Persistence(format!(
        "failed writing certification store to {} after {WRITE_ATTEMPTS} attempts: {}",
        path.display(),
        last_error.map_or_else(|| "unknown error".to_string(), |err| err.to_string())
    )))
}

fn write_atomically(path: &Path, body: &[u8]) -> io::Result<()> {
    let tmp_path = temp_path_for(path);
    let result = write_then_rename(&tmp_path, path, body);
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_then_rename(tmp_path: &Path, path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = File::create(tmp_path)?;
    file.write_all(body)?;
    file.sync_all()?;
    fs::rename(tmp_path, path)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".tmp");
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cert_tracker_core::{derive, parse_date, DueDate, DueDates, RenewalFrequency};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use time::Date;

    fn must<T>(result: Result<T, CertError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    fn must_io<T>(result: io::Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected io error: {err}"),
        }
    }

    fn date(value: &str) -> Date {
        must(parse_date(value))
    }

    fn temp_dir() -> tempfile::TempDir {
        must_io(tempfile::tempdir())
    }

    fn fixture_store(dir: &tempfile::TempDir) -> JsonCertificationStore {
        must(JsonCertificationStore::open(
            &dir.path().join("certifications.json"),
            DerivationPolicy::standard(),
        ))
    }

    fn fixture_input(name: &str) -> NewCertification {
        NewCertification {
            name: name.to_string(),
            issuer: "Example Institute".to_string(),
            external_cert_id: Some(format!("{name}-ID")),
            earned_date: Some(date("2024-01-15")),
            due_dates: None,
            fee: Decimal::new(12_000, 2),
            renewal_frequency: RenewalFrequency::Biennial,
        }
    }

    #[test]
    fn open_creates_empty_file() {
        let dir = temp_dir();
        let store = fixture_store(&dir);
        assert!(store.path().exists());
        assert!(must(store.list()).is_empty());

        let body = must_io(fs::read_to_string(store.path()));
        let value: serde_json::Value = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("store file is not JSON: {err}"),
        };
        assert_eq!(value["format_version"], serde_json::json!(1));
        assert_eq!(value["next_id"], serde_json::json!(1));
    }

    #[test]
    fn add_assigns_ids_and_derives_dates() {
        let dir = temp_dir();
        let store = fixture_store(&dir);

        let first = must(store.add(fixture_input("alpha")));
        let second = must(store.add(fixture_input("beta")));
        assert_eq!(first.id, CertificationId(1));
        assert_eq!(second.id, CertificationId(2));
        assert_eq!(first.ce_due_date, DueDate::Set(date("2027-01-15")));
        assert_eq!(first.amf_due_date, DueDate::Set(date("2025-01-15")));
        assert_eq!(first.expiration_date, DueDate::Set(date("2029-01-15")));
    }

    #[test]
    fn add_rejects_missing_required_fields_without_writing() {
        let dir = temp_dir();
        let store = fixture_store(&dir);
        let before = must_io(fs::read_to_string(store.path()));

        let mut input = fixture_input("alpha");
        input.earned_date = None;
        assert!(matches!(
            store.add(input),
            Err(CertError::Validation { field, .. }) if field == "earned_date"
        ));
        assert!(must(store.list()).is_empty());
        assert_eq!(must_io(fs::read_to_string(store.path())), before);
    }

    #[test]
    fn records_round_trip_through_reopen() {
        let dir = temp_dir();
        let store = fixture_store(&dir);
        let mut input = fixture_input("alpha");
        input.due_dates = Some(DueDates {
            ce_due_date: DueDate::Unset,
            amf_due_date: DueDate::Set(date("2024-12-31")),
            expiration_date: DueDate::Unset,
        });
        let added = must(store.add(input));
        drop(store);

        let reopened = fixture_store(&dir);
        assert_eq!(must(reopened.list()), vec![added]);
    }

    #[test]
    fn unset_dates_persist_as_null() {
        let dir = temp_dir();
        let store = fixture_store(&dir);
        let mut input = fixture_input("alpha");
        input.due_dates = Some(DueDates::unset());
        let _ = must(store.add(input));

        let body = must_io(fs::read_to_string(store.path()));
        assert!(body.contains("\"expiration_date\": null"));
        assert!(!body.contains("N/A"));
    }

    #[test]
    fn ids_are_not_reused_after_delete_and_reopen() {
        let dir = temp_dir();
        let store = fixture_store(&dir);
        let _ = must(store.add(fixture_input("alpha")));
        let second = must(store.add(fixture_input("beta")));
        must(store.delete(second.id));
        drop(store);

        let reopened = fixture_store(&dir);
        let third = must(reopened.add(fixture_input("gamma")));
        assert_eq!(third.id, CertificationId(3));
    }

    #[test]
    fn update_and_delete_report_missing_ids() {
        let dir = temp_dir();
        let store = fixture_store(&dir);
        let missing = CertificationId(42);
        assert_eq!(
            store.update(missing, &CertificationPatch::default()),
            Err(CertError::NotFound(missing))
        );
        assert_eq!(store.delete(missing), Err(CertError::NotFound(missing)));
        assert_eq!(store.get(missing), Err(CertError::NotFound(missing)));
    }

    #[test]
    fn update_with_new_anchor_rederives_dates() {
        let dir = temp_dir();
        let store = fixture_store(&dir);
        let added = must(store.add(fixture_input("alpha")));

        let patch = CertificationPatch {
            earned_date: Some(date("2025-07-04")),
            ..CertificationPatch::default()
        };
        let updated = must(store.update(added.id, &patch));
        assert_eq!(
            updated.due_dates(),
            must(derive(date("2025-07-04"), store.policy()))
        );
        assert_eq!(must(store.get(added.id)), updated);
    }

    #[test]
    fn replace_all_rejects_batch_with_one_malformed_row() {
        let dir = temp_dir();
        let store = fixture_store(&dir);
        let original = must(store.add(fixture_input("existing")));
        let before_file = must_io(fs::read_to_string(store.path()));

        let mut rows: Vec<EditedRow> = (0..11)
            .map(|idx| {
                let mut row = EditedRow::from_record(&original);
                row.id = None;
                row.name = format!("batch-{idx}");
                row
            })
            .collect();
        rows[6].name = String::new();

        assert!(matches!(
            store.replace_all(&rows),
            Err(CertError::Validation { field, .. }) if field == "rows[6].name"
        ));
        assert_eq!(must(store.list()), vec![original]);
        assert_eq!(must_io(fs::read_to_string(store.path())), before_file);
    }

    #[test]
    fn replace_all_swaps_table_with_adds_updates_and_deletes() {
        let dir = temp_dir();
        let store = fixture_store(&dir);
        let keep = must(store.add(fixture_input("keep")));
        let _dropped = must(store.add(fixture_input("dropped")));

        let mut kept_row = EditedRow::from_record(&keep);
        kept_row.fee = Decimal::new(15_000, 2);
        let mut new_row = EditedRow::from_record(&keep);
        new_row.id = None;
        new_row.name = "fresh".to_string();

        let summary = must(store.replace_all(&[kept_row, new_row]));
        assert_eq!(
            summary,
            BulkEditSummary {
                added: 1,
                updated: 1,
                deleted: 1
            }
        );

        let listed = must(store.list());
        let names: Vec<&str> = listed.iter().map(|record| record.name.as_str()).collect();
        assert_eq!(names, vec!["keep", "fresh"]);
        assert_eq!(listed[0].fee, Decimal::new(15_000, 2));
        assert_eq!(listed[1].id, CertificationId(3));
    }

    #[test]
    fn failed_write_leaves_memory_unchanged() {
        let dir = temp_dir();
        let nested = dir.path().join("nested");
        must_io(fs::create_dir(&nested));
        let store = must(JsonCertificationStore::open(
            &nested.join("certifications.json"),
            DerivationPolicy::standard(),
        ));
        let added = must(store.add(fixture_input("alpha")));

        must_io(fs::remove_dir_all(&nested));
        assert!(matches!(
            store.add(fixture_input("beta")),
            Err(CertError::Persistence(_))
        ));
        assert!(matches!(
            store.delete(added.id),
            Err(CertError::Persistence(_))
        ));
        assert_eq!(must(store.list()), vec![added]);
    }

    #[test]
    fn transient_write_failure_is_retried_once() {
        let dir = temp_dir();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let store = fixture_store(&dir).with_writer(Box::new(move |path: &Path, body: &[u8]| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(io::Error::other("transient"));
            }
            write_atomically(path, body)
        }));

        let added = must(store.add(fixture_input("alpha")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(must(store.list()), vec![added.clone()]);
        drop(store);
        assert_eq!(must(fixture_store(&dir).list()), vec![added]);
    }

    #[test]
    fn persistent_write_failure_stops_after_bounded_attempts() {
        let dir = temp_dir();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let store = fixture_store(&dir).with_writer(Box::new(move |_: &Path, _: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("disk full"))
        }));

        assert!(matches!(
            store.add(fixture_input("alpha")),
            Err(CertError::Persistence(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), WRITE_ATTEMPTS);
        assert!(must(store.list()).is_empty());
        drop(store);
        assert!(must(fixture_store(&dir).list()).is_empty());
    }

    #[test]
    fn open_reports_invalid_stored_record_as_persistence_error() {
        let dir = temp_dir();
        let path = dir.path().join("certifications.json");
        let body = serde_json::json!({
            "format_version": 1,
            "next_id": 2,
            "records": [{
                "id": 1,
                "name": "  ",
                "issuer": "Example Institute",
                "external_cert_id": null,
                "earned_date": "2024-01-15",
                "ce_due_date": null,
                "amf_due_date": null,
                "expiration_date": null,
                "fee": "0",
                "renewal_frequency": "none"
            }]
        });
        must_io(fs::write(&path, body.to_string()));
        match JsonCertificationStore::open(&path, DerivationPolicy::standard()) {
            Err(CertError::Persistence(message)) => assert!(message.contains("records[0]")),
            other => panic!("expected persistence error, got {other:?}"),
        }
    }

    #[test]
    fn open_rejects_corrupt_file() {
        let dir = temp_dir();
        let path = dir.path().join("certifications.json");
        must_io(fs::write(&path, "not-json"));
        let err = match JsonCertificationStore::open(&path, DerivationPolicy::standard()) {
            Ok(_) => panic!("expected corrupt store to fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("invalid certification store file"));
    }

    #[test]
    fn open_rejects_string_sentinels_for_dates() {
        let dir = temp_dir();
        let path = dir.path().join("certifications.json");
        let body = serde_json::json!({
            "format_version": 1,
            "next_id": 2,
            "records": [{
                "id": 1,
                "name": "alpha",
                "issuer": "Example Institute",
                "external_cert_id": null,
                "earned_date": "2024-01-15",
                "ce_due_date": "2027-01-15",
                "amf_due_date": "2025-01-15",
                "expiration_date": "N/A",
                "fee": "0",
                "renewal_frequency": "none"
            }]
        });
        must_io(fs::write(&path, body.to_string()));
        assert!(matches!(
            JsonCertificationStore::open(&path, DerivationPolicy::standard()),
            Err(CertError::Persistence(_))
        ));
    }

    #[test]
    fn open_repairs_stale_next_id() {
        let dir = temp_dir();
        let path = dir.path().join("certifications.json");
        let body = serde_json::json!({
            "format_version": 1,
            "next_id": 1,
            "records": [{
                "id": 5,
                "name": "alpha",
                "issuer": "Example Institute",
                "external_cert_id": null,
                "earned_date": "2024-01-15",
                "ce_due_date": null,
                "amf_due_date": null,
                "expiration_date": null,
                "fee": "0",
                "renewal_frequency": "none"
            }]
        });
        must_io(fs::write(&path, body.to_string()));
        let store = must(JsonCertificationStore::open(&path, DerivationPolicy::standard()));
        let added = must(store.add(fixture_input("beta")));
        assert_eq!(added.id, CertificationId(6));
    }

    #[test]
    fn concurrent_writers_and_readers_see_whole_states() {
        let dir = temp_dir();
        let store = Arc::new(fixture_store(&dir));

        let writers: Vec<_> = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for idx in 0..10 {
                        let _ = must(store.add(fixture_input(&format!("w{worker}-{idx}"))));
                    }
                })
            })
            .collect();

        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let snapshot = must(store.list());
                    let ids: Vec<u64> = snapshot.iter().map(|record| record.id.0).collect();
                    let expected: Vec<u64> = (1..=snapshot.len() as u64).collect();
                    assert_eq!(ids, expected);
                }
            })
        };

        for handle in writers {
            if let Err(err) = handle.join() {
                panic!("writer thread panicked: {err:?}");
            }
        }
        if let Err(err) = reader.join() {
            panic!("reader thread panicked: {err:?}");
        }

        assert_eq!(must(store.list()).len(), 40);
        drop(store);
        assert_eq!(must(fixture_store(&dir).list()).len(), 40);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]
        #[test]
        fn prop_reopen_matches_memory(ops in prop::collection::vec((any::<bool>(), 0usize..8), 1..30)) {
            let dir = temp_dir();
            let store = fixture_store(&dir);
            for (is_add, pick) in ops {
                let current = must(store.list());
                if is_add || current.is_empty() {
                    let _ = must(store.add(fixture_input(&format!("p{pick}"))));
                } else {
                    let target = current[pick % current.len()].id;
                    must(store.delete(target));
                }
            }
            let in_memory = must(store.list());
            drop(store);
            prop_assert_eq!(must(fixture_store(&dir).list()), in_memory);
        }
    }
}
