//! Standardized input dataset and the sources that provide it.
//!
//! Acquisition and validation of raw feeds happen upstream; this crate only
//! consumes an hourly, UTC-stamped table of named series (prices per product,
//! load forecast, generation by fuel). `InputSource` is the seam to that
//! upstream system. `CsvInputSource` reads the wide CSV export used by the
//! binary.
//!
//! CSV shape:
//! - a `timestamp` column (RFC 3339, or `YYYY-MM-DD HH:MM[:SS]` taken as UTC)
//! - one column per series (`price_dalmp`, `load_forecast`, `gen_wind`, ...)
//! - empty cells mean "no value at this hour"

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use csv::StringRecord;

use crate::error::DataError;

/// Hourly values of one series, keyed by UTC timestamp.
pub type Series = BTreeMap<DateTime<Utc>, f64>;

/// Name of the system load forecast series.
pub const LOAD_SERIES: &str = "load_forecast";

/// Name of the generation series for a fuel.
pub fn generation_series(fuel: &str) -> String {
    format!("gen_{fuel}")
}

/// Read-only, already-validated input table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputDataset {
    series: BTreeMap<String, Series>,
}

impl InputDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, series: &str, at: DateTime<Utc>, value: f64) {
        self.series
            .entry(series.to_string())
            .or_default()
            .insert(at, value);
    }

    /// Drop a whole series (upstream feed outage).
    pub fn remove_series(&mut self, series: &str) -> Option<Series> {
        self.series.remove(series)
    }

    pub fn series(&self, name: &str) -> Option<&Series> {
        self.series.get(name)
    }

    pub fn value(&self, series: &str, at: DateTime<Utc>) -> Option<f64> {
        self.series.get(series)?.get(&at).copied()
    }

    pub fn first_timestamp(&self, series: &str) -> Option<DateTime<Utc>> {
        self.series.get(series)?.keys().next().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(BTreeMap::is_empty)
    }
}

/// Provider of the dataset for a run date.
pub trait InputSource: Send + Sync {
    fn load(&self, target_date: NaiveDate) -> Result<InputDataset, DataError>;
}

impl InputSource for InputDataset {
    fn load(&self, _target_date: NaiveDate) -> Result<InputDataset, DataError> {
        if self.is_empty() {
            return Err(DataError::Empty);
        }
        Ok(self.clone())
    }
}

/// Wide CSV file produced by the upstream ingestion job.
#[derive(Debug, Clone)]
pub struct CsvInputSource {
    path: PathBuf,
}

impl CsvInputSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl InputSource for CsvInputSource {
    fn load(&self, _target_date: NaiveDate) -> Result<InputDataset, DataError> {
        let file = File::open(&self.path).map_err(|e| DataError::Read {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        read_dataset(file)
    }
}

/// Parse a wide CSV table into a dataset.
pub fn read_dataset(reader: impl std::io::Read) -> Result<InputDataset, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader
        .headers()
        .map_err(|e| DataError::Parse {
            line: 1,
            message: format!("failed to read CSV headers: {e}"),
        })?
        .clone();
    let header_map = build_header_map(&headers);

    let ts_idx = *header_map.get("timestamp").ok_or_else(|| DataError::Parse {
        line: 1,
        message: "missing required column: `timestamp`".to_string(),
    })?;
    let series_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != ts_idx)
        .map(|(idx, name)| (idx, normalize_header_name(name)))
        .collect();

    let mut dataset = InputDataset::new();
    for (idx, result) in reader.records().enumerate() {
        // records() starts after the header line; CSV lines are 1-based.
        let line = idx + 2;
        let record = result.map_err(|e| DataError::Parse {
            line,
            message: format!("CSV parse error: {e}"),
        })?;
        parse_row(&record, ts_idx, &series_cols, line, &mut dataset)?;
    }

    if dataset.is_empty() {
        return Err(DataError::Empty);
    }
    Ok(dataset)
}

fn parse_row(
    record: &StringRecord,
    ts_idx: usize,
    series_cols: &[(usize, String)],
    line: usize,
    dataset: &mut InputDataset,
) -> Result<(), DataError> {
    let raw_ts = record
        .get(ts_idx)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DataError::Parse {
            line,
            message: "missing timestamp".to_string(),
        })?;
    let at = parse_timestamp(raw_ts).map_err(|message| DataError::Parse { line, message })?;

    for (idx, name) in series_cols {
        let Some(cell) = record.get(*idx).filter(|s| !s.is_empty()) else {
            continue;
        };
        let value = cell
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| DataError::Parse {
                line,
                message: format!("invalid value '{cell}' in column `{name}`"),
            })?;
        dataset.insert(name, at, value);
    }
    Ok(())
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports sometimes prefix the first header with a BOM.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

/// Parse a UTC timestamp. Naive timestamps are taken as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    const FMTS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"];
    for fmt in FMTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!(
        "Invalid timestamp '{s}'. Expected RFC 3339 or YYYY-MM-DD HH:MM[:SS]."
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn reads_wide_csv_with_gaps() {
        let csv = "\u{feff}Timestamp,price_dalmp,load_forecast\n\
                   2026-01-01T01:00:00Z,25.5,41000\n\
                   2026-01-01 02:00,,40500\n";
        let ds = read_dataset(csv.as_bytes()).unwrap();

        let h1 = Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap();
        let h2 = Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap();
        assert_eq!(ds.value("price_dalmp", h1), Some(25.5));
        assert_eq!(ds.value("price_dalmp", h2), None);
        assert_eq!(ds.value(LOAD_SERIES, h2), Some(40500.0));
        assert_eq!(ds.first_timestamp("price_dalmp"), Some(h1));
    }

    #[test]
    fn rejects_non_numeric_cells_with_line_number() {
        let csv = "timestamp,price_dalmp\n2026-01-01T01:00:00Z,abc\n";
        let err = read_dataset(csv.as_bytes()).unwrap_err();
        assert!(matches!(err, DataError::Parse { line: 2, .. }));
    }

    #[test]
    fn requires_timestamp_column() {
        let err = read_dataset("price_dalmp\n1.0\n".as_bytes()).unwrap_err();
        assert!(matches!(err, DataError::Parse { line: 1, .. }));
    }
}
