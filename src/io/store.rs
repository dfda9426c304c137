//! File-backed forecast store.
//!
//! Layout under the store root:
//!
//! ```text
//! forecasts/YYYY/MM/DD/<PRODUCT>.csv        one file per product per day
//! forecasts/YYYY/MM/DD/<PRODUCT>.meta.json  fallback metadata for that file
//! index.json                                master discovery index
//! latest/<PRODUCT>.json                     newest-date pointer per product
//! locks/<YYYY-MM-DD>.lock                   run locks
//! locks/store.lock                          index writer lock
//! ```
//!
//! Write order per product: forecast CSV, then metadata, then (after all
//! products) the index and the latest pointers. Every file is written to a
//! temp file in the target directory and renamed into place. A crash before
//! the index update leaves files the index does not know about; a crash
//! between CSV and metadata leaves a sidecar whose fallback keys disagree
//! with the records. `verify_index` reports both, reads ignore the stale
//! sidecar, and `rebuild_index` repairs the index and removes stale sidecars.
//!
//! Index and pointer updates run under `locks/store.lock` so writers in
//! other processes (or other handles on the same root) serialize.
//!
//! Reads take the sample count from each file's header, so a store handle
//! configured for one N can read batches written with another.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::{FallbackRecord, ForecastBatch, ForecastRecord, ModelKey, Product};
use crate::error::{NotFoundError, RetrieveError, StorageError};
use crate::io::index::{IndexEntry, IndexReport, LatestPointer, StoreIndex};
use crate::io::lock::{RunLock, StoreLock};
use crate::io::schema::ForecastSchema;

const INDEX_FILE: &str = "index.json";
const FORECAST_DIR: &str = "forecasts";
const LATEST_DIR: &str = "latest";
const LOCK_DIR: &str = "locks";

/// Where a batch ended up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageRef {
    pub target_date: NaiveDate,
    pub files: Vec<PathBuf>,
    pub index: PathBuf,
}

/// Sidecar metadata stored next to each forecast file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProductMeta {
    target_date: NaiveDate,
    product: Product,
    sample_count: usize,
    fallbacks: Vec<FallbackRecord>,
}

#[derive(Debug)]
pub struct ForecastStore {
    root: PathBuf,
    schema: ForecastSchema,
    write_lock: Mutex<()>,
}

impl ForecastStore {
    pub fn open(root: impl Into<PathBuf>, schema: ForecastSchema) -> Result<Self, StorageError> {
        let root = root.into();
        for dir in [root.join(FORECAST_DIR), root.join(LATEST_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| StorageError::WriteFailure {
                path: dir.clone(),
                message: format!("creating store directory: {e}"),
            })?;
        }
        Ok(Self {
            root,
            schema,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the forecast file for `(date, product)`. Pure.
    pub fn path_for(&self, date: NaiveDate, product: Product) -> PathBuf {
        self.root.join(relative_path(date, product, "csv"))
    }

    fn meta_path_for(&self, date: NaiveDate, product: Product) -> PathBuf {
        self.root.join(relative_path(date, product, "meta.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn latest_path(&self, product: Product) -> PathBuf {
        self.root.join(LATEST_DIR).join(format!("{product}.json"))
    }

    /// Take the per-date run lock.
    pub fn lock_run(&self, date: NaiveDate) -> Result<RunLock, StorageError> {
        RunLock::acquire(&self.root.join(LOCK_DIR), date)
    }

    /// Serialize index writers: threads of this handle, then every other
    /// descriptor on the store lock file.
    fn lock_index(&self) -> Result<(MutexGuard<'_, ()>, StoreLock), StorageError> {
        let guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = StoreLock::acquire(&self.root.join(LOCK_DIR))?;
        Ok((guard, lock))
    }

    /// Persist a batch: one file per product, then index and pointers.
    pub fn store(&self, batch: &ForecastBatch) -> Result<StorageRef, StorageError> {
        if batch.records.is_empty() {
            return Err(StorageError::SchemaViolation {
                details: vec!["batch has no records".to_string()],
            });
        }
        let (details, _) = self.schema.violations(batch, &Product::ALL);
        if !details.is_empty() {
            return Err(StorageError::SchemaViolation { details });
        }
        for record in &batch.records {
            if record.key(batch.target_date).is_none() {
                return Err(StorageError::SchemaViolation {
                    details: vec![format!(
                        "{} record at {} is outside the horizon of {}",
                        record.product, record.timestamp, batch.target_date
                    )],
                });
            }
        }

        let _guard = self.lock_index()?;
        let mut index = self.load_index_or_rebuild()?;

        let mut files = Vec::new();
        for product in batch.products() {
            let part = batch.for_product(product);
            let path = self.write_product(&part, product)?;
            index.upsert(IndexEntry {
                target_date: batch.target_date,
                product,
                path: relative_path(batch.target_date, product, "csv"),
                records: part.records.len(),
                fallback_records: part.fallback_count(),
                generation_timestamp: part.records.iter().map(|r| r.generation_timestamp).max(),
            });
            files.push(path);
        }

        self.write_index(&index)?;
        for product in batch.products() {
            self.advance_latest(batch.target_date, product)?;
        }

        tracing::info!(
            date = %batch.target_date,
            files = files.len(),
            records = batch.records.len(),
            "forecast batch stored"
        );
        Ok(StorageRef {
            target_date: batch.target_date,
            files,
            index: self.index_path(),
        })
    }

    fn write_product(&self, part: &ForecastBatch, product: Product) -> Result<PathBuf, StorageError> {
        let date = part.target_date;

        let path = self.path_for(date, product);
        let bytes = self.encode_csv(part).map_err(|message| StorageError::WriteFailure {
            path: path.clone(),
            message,
        })?;
        atomic_write(&path, &bytes)?;
        self.write_meta(date, product, &part.fallbacks)?;

        tracing::debug!(path = %path.display(), records = part.records.len(), "forecast file written");
        Ok(path)
    }

    fn write_meta(&self, date: NaiveDate, product: Product, fallbacks: &[FallbackRecord]) -> Result<(), StorageError> {
        let meta = ProductMeta {
            target_date: date,
            product,
            sample_count: self.schema.sample_count,
            fallbacks: fallbacks.to_vec(),
        };
        let path = self.meta_path_for(date, product);
        let bytes = serde_json::to_vec_pretty(&meta).map_err(|e| StorageError::WriteFailure {
            path: path.clone(),
            message: e.to_string(),
        })?;
        atomic_write(&path, &bytes)
    }

    fn encode_csv(&self, part: &ForecastBatch) -> Result<Vec<u8>, String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(self.schema.columns())
            .map_err(|e| format!("writing header: {e}"))?;
        for record in &part.records {
            writer
                .write_record(self.schema.to_row(record))
                .map_err(|e| format!("writing row: {e}"))?;
        }
        writer.into_inner().map_err(|e| format!("flushing CSV: {e}"))
    }

    /// Read the stored batch for `(date, product)`.
    ///
    /// A metadata sidecar that disagrees with the records is dropped.
    pub fn retrieve(&self, date: NaiveDate, product: Product) -> Result<ForecastBatch, RetrieveError> {
        let (batch, stale) = self.read_stored(date, product)?;
        if stale {
            tracing::warn!(%date, %product, "fallback metadata does not match stored records, ignoring it");
        }
        Ok(batch)
    }

    /// Read CSV and sidecar; the flag is set when the sidecar was stale.
    fn read_stored(&self, date: NaiveDate, product: Product) -> Result<(ForecastBatch, bool), RetrieveError> {
        let path = self.path_for(date, product);
        if !path.exists() {
            return Err(NotFoundError::Batch { date, product }.into());
        }

        let (schema, records) = decode_csv(&path)?;
        let meta = self.read_meta(date, product)?;
        let stale = !meta_matches(meta.as_ref(), date, product, schema, &records);
        let fallbacks = match meta {
            Some(meta) if !stale => meta.fallbacks,
            _ => Vec::new(),
        };

        let batch = ForecastBatch {
            target_date: date,
            records,
            fallbacks,
        };
        Ok((batch, stale))
    }

    /// Read the newest stored batch for `product`.
    ///
    /// Tries the O(1) latest pointer first and falls back to the index.
    pub fn retrieve_latest(&self, product: Product) -> Result<ForecastBatch, RetrieveError> {
        match self.read_latest(product) {
            Ok(Some(pointer)) => match self.retrieve(pointer.target_date, product) {
                Ok(batch) => return Ok(batch),
                Err(e) => tracing::warn!(%product, error = %e, "latest pointer is stale, using index"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(%product, error = %e, "latest pointer unreadable, using index"),
        }

        let index = self.load_index()?;
        let entry = index.latest(product).ok_or(NotFoundError::Latest(product))?;
        self.retrieve(entry.target_date, product)
    }

    /// Stored dates for `product`, newest first, with whether each is all-fallback.
    pub fn history(&self, product: Product) -> Result<Vec<(NaiveDate, bool)>, StorageError> {
        let index = match self.load_index() {
            Err(StorageError::IndexCorruption { .. }) => {
                let _guard = self.lock_index()?;
                self.load_index_or_rebuild()?
            }
            other => other?,
        };
        Ok(index
            .for_product(product)
            .into_iter()
            .map(|e| (e.target_date, e.is_fallback()))
            .collect())
    }

    /// Compare the index with the files on disk.
    pub fn verify_index(&self) -> Result<IndexReport, StorageError> {
        let on_disk = self.scan_files()?;
        let mut report = IndexReport::default();

        let index = match self.load_index() {
            Ok(index) => index,
            Err(StorageError::IndexCorruption { .. }) => {
                report.corrupt = true;
                StoreIndex::default()
            }
            Err(e) => return Err(e),
        };

        for (date, product) in &on_disk {
            if index.get(*date, *product).is_none() {
                report.unindexed.push((*date, *product));
            }
        }
        for entry in &index.entries {
            if !on_disk.contains(&(entry.target_date, entry.product)) {
                report.dangling.push((entry.target_date, entry.product));
            }
        }
        for (date, product) in &on_disk {
            if let Ok((_, true)) = self.read_stored(*date, *product) {
                report.stale_metadata.push((*date, *product));
            }
        }
        Ok(report)
    }

    /// Regenerate the index and latest pointers from the stored files, and
    /// remove stale sidecars.
    ///
    /// Unreadable files are skipped (and logged). Returns the entry count.
    pub fn rebuild_index(&self) -> Result<usize, StorageError> {
        let _guard = self.lock_index()?;
        let index = self.rebuild_index_inner()?;
        Ok(index.entries.len())
    }

    /// Caller holds `lock_index`.
    fn rebuild_index_inner(&self) -> Result<StoreIndex, StorageError> {
        let mut index = StoreIndex::default();
        for (date, product) in self.scan_files()? {
            let (batch, stale) = match self.read_stored(date, product) {
                Ok(read) => read,
                Err(e) => {
                    tracing::warn!(%date, %product, error = %e, "skipping unreadable forecast file");
                    continue;
                }
            };
            if stale {
                let meta_path = self.meta_path_for(date, product);
                fs::remove_file(&meta_path).map_err(|e| StorageError::WriteFailure {
                    path: meta_path.clone(),
                    message: e.to_string(),
                })?;
                tracing::info!(%date, %product, "stale fallback metadata removed");
            }
            index.upsert(IndexEntry {
                target_date: date,
                product,
                path: relative_path(date, product, "csv"),
                records: batch.records.len(),
                fallback_records: batch.fallback_count(),
                generation_timestamp: batch.records.iter().map(|r| r.generation_timestamp).max(),
            });
        }
        self.write_index(&index)?;

        for product in Product::ALL {
            let path = self.latest_path(product);
            match index.latest(product) {
                Some(entry) => self.write_latest(entry.target_date, product)?,
                None if path.exists() => fs::remove_file(&path).map_err(|e| StorageError::WriteFailure {
                    path: path.clone(),
                    message: e.to_string(),
                })?,
                None => {}
            }
        }

        tracing::info!(entries = index.entries.len(), "store index rebuilt");
        Ok(index)
    }

    /// Load the index; a missing index is an empty store.
    pub fn load_index(&self) -> Result<StoreIndex, StorageError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(StoreIndex::default());
        }
        let file = File::open(&path).map_err(|e| StorageError::ReadFailure {
            path: path.clone(),
            message: e.to_string(),
        })?;
        serde_json::from_reader(file).map_err(|e| StorageError::IndexCorruption {
            path,
            message: e.to_string(),
        })
    }

    /// Caller holds `lock_index`.
    fn load_index_or_rebuild(&self) -> Result<StoreIndex, StorageError> {
        match self.load_index() {
            Err(StorageError::IndexCorruption { path, message }) => {
                tracing::warn!(path = %path.display(), %message, "index corrupt, rebuilding from files");
                self.rebuild_index_inner()
            }
            other => other,
        }
    }

    fn write_index(&self, index: &StoreIndex) -> Result<(), StorageError> {
        let path = self.index_path();
        let bytes = serde_json::to_vec_pretty(index).map_err(|e| StorageError::WriteFailure {
            path: path.clone(),
            message: e.to_string(),
        })?;
        atomic_write(&path, &bytes)
    }

    fn read_latest(&self, product: Product) -> Result<Option<LatestPointer>, StorageError> {
        let path = self.latest_path(product);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).map_err(|e| StorageError::ReadFailure {
            path: path.clone(),
            message: e.to_string(),
        })?;
        serde_json::from_reader(file)
            .map(Some)
            .map_err(|e| StorageError::ReadFailure {
                path,
                message: e.to_string(),
            })
    }

    /// Swap the pointer to `date` unless it already points somewhere newer.
    /// Caller holds `lock_index`.
    fn advance_latest(&self, date: NaiveDate, product: Product) -> Result<(), StorageError> {
        let current = self.read_latest(product).ok().flatten();
        if current.is_some_and(|p| p.target_date > date) {
            return Ok(());
        }
        self.write_latest(date, product)
    }

    fn write_latest(&self, date: NaiveDate, product: Product) -> Result<(), StorageError> {
        let path = self.latest_path(product);
        let pointer = LatestPointer {
            target_date: date,
            path: relative_path(date, product, "csv"),
        };
        let bytes = serde_json::to_vec_pretty(&pointer).map_err(|e| StorageError::WriteFailure {
            path: path.clone(),
            message: e.to_string(),
        })?;
        atomic_write(&path, &bytes)
    }

    fn read_meta(&self, date: NaiveDate, product: Product) -> Result<Option<ProductMeta>, StorageError> {
        let path = self.meta_path_for(date, product);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).map_err(|e| StorageError::ReadFailure {
            path: path.clone(),
            message: e.to_string(),
        })?;
        serde_json::from_reader(file)
            .map(Some)
            .map_err(|e| StorageError::ReadFailure {
                path,
                message: format!("invalid metadata: {e}"),
            })
    }

    /// Every `(date, product)` with a forecast file on disk.
    fn scan_files(&self) -> Result<Vec<(NaiveDate, Product)>, StorageError> {
        let base = self.root.join(FORECAST_DIR);
        let mut out = Vec::new();
        for year in list_dir(&base)? {
            for month in list_dir(&year)? {
                for day in list_dir(&month)? {
                    let Some(date) = date_from_dirs(&year, &month, &day) else {
                        continue;
                    };
                    for file in list_dir(&day)? {
                        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                            continue;
                        };
                        if let Some(code) = name.strip_suffix(".csv") {
                            if let Ok(product) = code.parse::<Product>() {
                                out.push((date, product));
                            }
                        }
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Whether a sidecar describes exactly the fallback records of its CSV.
/// No sidecar is fine: records carry their own fallback reason.
fn meta_matches(
    meta: Option<&ProductMeta>,
    date: NaiveDate,
    product: Product,
    schema: ForecastSchema,
    records: &[ForecastRecord],
) -> bool {
    let Some(meta) = meta else {
        return true;
    };
    let flagged: BTreeSet<ModelKey> = records
        .iter()
        .filter(|r| r.is_fallback)
        .filter_map(|r| r.key(date))
        .collect();
    let listed: BTreeSet<ModelKey> = meta.fallbacks.iter().flat_map(|f| f.keys.iter().copied()).collect();
    meta.target_date == date
        && meta.product == product
        && meta.sample_count == schema.sample_count
        && listed == flagged
}

/// Parse a forecast CSV with the schema its header declares.
fn decode_csv(path: &Path) -> Result<(ForecastSchema, Vec<ForecastRecord>), StorageError> {
    let read_err = |message: String| StorageError::ReadFailure {
        path: path.to_path_buf(),
        message,
    };

    let file = File::open(path).map_err(|e| read_err(e.to_string()))?;
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);

    let headers = reader
        .headers()
        .map_err(|e| read_err(format!("reading header: {e}")))?
        .clone();
    let schema = ForecastSchema::from_header(headers.iter()).map_err(read_err)?;

    let mut records = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let line = idx + 2;
        let row = row.map_err(|e| read_err(format!("line {line}: {e}")))?;
        let fields: Vec<&str> = row.iter().collect();
        let record = schema
            .parse_row(&fields)
            .map_err(|errors| read_err(format!("line {line}: {}", errors.join("; "))))?;
        records.push(record);
    }
    Ok((schema, records))
}

fn relative_path(date: NaiveDate, product: Product, ext: &str) -> String {
    format!(
        "{FORECAST_DIR}/{}/{product}.{ext}",
        date.format("%Y/%m/%d")
    )
}

fn date_from_dirs(year: &Path, month: &Path, day: &Path) -> Option<NaiveDate> {
    let part = |p: &Path| p.file_name()?.to_str()?.parse::<u32>().ok();
    let year = i32::try_from(part(year)?).ok()?;
    NaiveDate::from_ymd_opt(year, part(month)?, part(day)?)
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|e| StorageError::ReadFailure {
        path: dir.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::ReadFailure {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}

/// Atomic write: write to a temp file in the target directory, then rename.
fn atomic_write(target: &Path, data: &[u8]) -> Result<(), StorageError> {
    let write_err = |message: String| StorageError::WriteFailure {
        path: target.to_path_buf(),
        message,
    };
    let parent = target
        .parent()
        .ok_or_else(|| write_err("path has no parent directory".to_string()))?;
    fs::create_dir_all(parent).map_err(|e| write_err(format!("creating {}: {e}", parent.display())))?;

    let temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| write_err(format!("creating temp file: {e}")))?;
    let mut file = temp.as_file();
    file.write_all(data)
        .map_err(|e| write_err(format!("writing temp file: {e}")))?;
    file.sync_all()
        .map_err(|e| write_err(format!("syncing temp file: {e}")))?;
    temp.persist(target)
        .map_err(|e| write_err(format!("renaming temp file: {}", e.error)))?;
    Ok(())
}
