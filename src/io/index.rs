//! Discovery index and "latest" pointers.
//!
//! The master index (`index.json`) lists every stored (date, product) file.
//! Each product also has a `latest/<PRODUCT>.json` pointer naming its newest
//! stored date. Both are replaced by atomic rename, so readers see either the
//! old or the new version, never a partial write.
//!
//! The index is derived data: it can always be rebuilt from the stored files.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Product;

pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub target_date: NaiveDate,
    pub product: Product,
    /// Path relative to the store root, `/`-separated.
    pub path: String,
    pub records: usize,
    pub fallback_records: usize,
    pub generation_timestamp: Option<DateTime<Utc>>,
}

impl IndexEntry {
    /// Every record in the file is a fallback substitute.
    pub fn is_fallback(&self) -> bool {
        self.records > 0 && self.fallback_records == self.records
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreIndex {
    pub version: u32,
    pub entries: Vec<IndexEntry>,
}

impl Default for StoreIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: Vec::new(),
        }
    }
}

impl StoreIndex {
    /// Insert or replace the entry for `(entry.target_date, entry.product)`.
    pub fn upsert(&mut self, entry: IndexEntry) {
        self.entries
            .retain(|e| !(e.target_date == entry.target_date && e.product == entry.product));
        self.entries.push(entry);
        self.entries
            .sort_by(|a, b| a.target_date.cmp(&b.target_date).then(a.product.cmp(&b.product)));
    }

    pub fn get(&self, date: NaiveDate, product: Product) -> Option<&IndexEntry> {
        self.entries
            .iter()
            .find(|e| e.target_date == date && e.product == product)
    }

    /// Entries for a product, newest first.
    pub fn for_product(&self, product: Product) -> Vec<&IndexEntry> {
        let mut out: Vec<&IndexEntry> = self.entries.iter().filter(|e| e.product == product).collect();
        out.sort_by(|a, b| b.target_date.cmp(&a.target_date));
        out
    }

    pub fn latest(&self, product: Product) -> Option<&IndexEntry> {
        self.for_product(product).into_iter().next()
    }
}

/// Contents of `latest/<PRODUCT>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub target_date: NaiveDate,
    pub path: String,
}

/// Result of comparing the index with the files on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexReport {
    /// Stored files with no index entry (crash between write and index update).
    pub unindexed: Vec<(NaiveDate, Product)>,
    /// Index entries whose file is gone.
    pub dangling: Vec<(NaiveDate, Product)>,
    /// Metadata sidecars that disagree with the records in their CSV.
    pub stale_metadata: Vec<(NaiveDate, Product)>,
    /// The index file exists but could not be parsed.
    pub corrupt: bool,
}

impl IndexReport {
    pub fn is_consistent(&self) -> bool {
        self.unindexed.is_empty()
            && self.dangling.is_empty()
            && self.stale_metadata.is_empty()
            && !self.corrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(day: u32, product: Product, fallback_records: usize) -> IndexEntry {
        IndexEntry {
            target_date: NaiveDate::from_ymd_opt(2026, 5, day).unwrap(),
            product,
            path: format!("forecasts/2026/05/{day:02}/{product}.csv"),
            records: 72,
            fallback_records,
            generation_timestamp: None,
        }
    }

    #[test]
    fn upsert_replaces_same_date_and_product() {
        let mut index = StoreIndex::default();
        index.upsert(entry(1, Product::Dalmp, 0));
        index.upsert(entry(1, Product::Dalmp, 72));
        index.upsert(entry(2, Product::Dalmp, 0));
        assert_eq!(index.entries.len(), 2);
        assert!(index.get(NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(), Product::Dalmp).unwrap().is_fallback());
    }

    #[test]
    fn latest_is_newest_date_for_product() {
        let mut index = StoreIndex::default();
        index.upsert(entry(3, Product::Dalmp, 0));
        index.upsert(entry(9, Product::Rtlmp, 0));
        index.upsert(entry(5, Product::Dalmp, 1));
        assert_eq!(index.latest(Product::Dalmp).unwrap().target_date.to_string(), "2026-05-05");
        assert!(index.latest(Product::RegUp).is_none());
        assert!(!index.latest(Product::Dalmp).unwrap().is_fallback());
    }
}
