//! Fallback coordinator.
//!
//! For each affected product the coordinator walks a small state machine:
//!
//! ```text
//! Idle -> FailureIdentified -> SourceSelected -> Retrieved
//!      -> TimestampAdjusted -> Marked -> Done
//!                     SourceSelected -> Escalated
//! ```
//!
//! A source is a stored batch for a strictly earlier date whose records carry
//! the configured sample count and can cover every needed hour. The most
//! recent source whose needed records are all original forecasts wins; if
//! every candidate is itself a fallback, the most recent one is used.
//!
//! Timestamps move forward by whole days, so hour-of-day is preserved. Hours
//! the source does not reach are filled from the same hour-of-day on another
//! day of the source (earlier first). Values are never invented.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Duration, NaiveDate};

use crate::domain::{
    FailureDescription, FallbackRecord, FallbackState, ForecastBatch, ForecastRecord, HourEnding,
    MAX_HORIZON, ModelKey, Product,
};
use crate::error::FallbackError;
use crate::io::ForecastStore;

/// Visited states for one product's activation.
#[derive(Debug, Clone)]
struct StateTrail {
    states: Vec<FallbackState>,
}

impl StateTrail {
    fn new() -> Self {
        Self {
            states: vec![FallbackState::Idle],
        }
    }

    fn current(&self) -> FallbackState {
        self.states.last().copied().unwrap_or(FallbackState::Idle)
    }

    fn advance(&mut self, next: FallbackState) -> Result<(), FallbackError> {
        let from = self.current();
        if !from.can_advance_to(next) {
            return Err(FallbackError::InvalidTransition { from, to: next });
        }
        tracing::debug!(?from, to = ?next, "fallback state");
        self.states.push(next);
        Ok(())
    }
}

/// A candidate prior batch, already mapped onto the target horizon.
struct Source {
    date: NaiveDate,
    /// Source records by hour ending relative to the source date.
    by_hour: BTreeMap<u8, ForecastRecord>,
}

impl Source {
    /// The source hour used to fill target hour `h`, if any.
    fn hour_for(&self, h: u8) -> Option<u8> {
        if self.by_hour.contains_key(&h) {
            return Some(h);
        }
        let earlier = (1..=h / 24).map(|k| h - 24 * k).filter(|&c| c >= 1);
        let later = (1..=MAX_HORIZON / 24)
            .map(|k| u16::from(h) + 24 * u16::from(k))
            .take_while(|&c| c <= u16::from(MAX_HORIZON))
            .filter_map(|c| u8::try_from(c).ok());
        earlier.chain(later).find(|c| self.by_hour.contains_key(c))
    }

    fn covers(&self, hours: &BTreeSet<u8>) -> bool {
        hours.iter().all(|&h| self.hour_for(h).is_some())
    }

    /// Needed records come from the source's own hours and none is a fallback.
    fn is_clean_for(&self, hours: &BTreeSet<u8>) -> bool {
        hours.iter().all(|&h| {
            self.hour_for(h)
                .and_then(|s| self.by_hour.get(&s))
                .is_some_and(|r| !r.is_fallback)
        })
    }
}

#[derive(Debug, Clone)]
pub struct FallbackCoordinator {
    store: Arc<ForecastStore>,
    products: Vec<Product>,
    horizon: u8,
    sample_count: usize,
}

impl FallbackCoordinator {
    pub fn new(store: Arc<ForecastStore>, products: &[Product], horizon: u8, sample_count: usize) -> Self {
        let mut products = products.to_vec();
        products.sort();
        products.dedup();
        Self {
            store,
            products,
            horizon,
            sample_count,
        }
    }

    /// Build substitute records for `missing_keys` (empty = whole horizon).
    ///
    /// Returns a batch holding only fallback records plus one `FallbackRecord`
    /// per product. Fails with `Escalated` if any affected product has no
    /// eligible source; nothing is returned for the others in that case.
    pub fn activate(
        &self,
        failure: &FailureDescription,
        missing_keys: &[ModelKey],
        target_date: NaiveDate,
    ) -> Result<ForecastBatch, FallbackError> {
        let keys: Vec<ModelKey> = if missing_keys.is_empty() {
            ModelKey::horizon(&self.products, self.horizon)
        } else {
            let mut keys = missing_keys.to_vec();
            keys.sort();
            keys.dedup();
            keys
        };

        let mut by_product: BTreeMap<Product, BTreeSet<u8>> = BTreeMap::new();
        for key in &keys {
            by_product
                .entry(key.product)
                .or_default()
                .insert(key.hour_ending.get());
        }

        tracing::warn!(
            date = %target_date,
            kind = %failure.kind,
            keys = keys.len(),
            message = %failure.message,
            "fallback activated"
        );

        let mut batch = ForecastBatch::new(target_date, Vec::new());
        let mut unsourced = Vec::new();

        for (product, hours) in &by_product {
            let mut trail = StateTrail::new();
            trail.advance(FallbackState::FailureIdentified)?;

            let source = self.select_source(*product, hours, target_date);
            trail.advance(FallbackState::SourceSelected)?;

            let Some((source, was_fallback)) = source else {
                trail.advance(FallbackState::Escalated)?;
                unsourced.extend(hours.iter().filter_map(|&h| {
                    HourEnding::new(h).map(|h| ModelKey::new(*product, h))
                }));
                continue;
            };
            trail.advance(FallbackState::Retrieved)?;

            let shift_days = (target_date - source.date).num_days();
            let shift = Duration::days(shift_days);
            let reason = format!(
                "{}: {} (source {}, shifted +{}d)",
                failure.kind, failure.message, source.date, shift_days
            );

            let mut records = Vec::with_capacity(hours.len());
            let mut extended_hours = Vec::new();
            for &h in hours {
                let Some(src_hour) = source.hour_for(h) else {
                    continue;
                };
                let Some(src) = source.by_hour.get(&src_hour) else {
                    continue;
                };
                let offset = Duration::hours(i64::from(h) - i64::from(src_hour));
                if src_hour != h {
                    extended_hours.push(h);
                }
                records.push(ForecastRecord {
                    timestamp: src.timestamp + shift + offset,
                    ..src.clone()
                });
            }
            trail.advance(FallbackState::TimestampAdjusted)?;

            for record in &mut records {
                record.is_fallback = true;
                record.fallback_reason = Some(reason.clone());
            }
            trail.advance(FallbackState::Marked)?;
            trail.advance(FallbackState::Done)?;

            tracing::info!(
                %product,
                source = %source.date,
                shift_days,
                records = records.len(),
                extended = extended_hours.len(),
                source_was_fallback = was_fallback,
                "fallback source applied"
            );

            let product_keys = records
                .iter()
                .filter_map(|r| r.key(target_date))
                .collect();
            batch.merge(ForecastBatch {
                target_date,
                records,
                fallbacks: vec![FallbackRecord {
                    product: *product,
                    keys: product_keys,
                    failure: failure.kind,
                    reason,
                    source_date: source.date,
                    source_was_fallback: was_fallback,
                    shift_days,
                    extended_hours,
                    states: trail.states,
                }],
            });
        }

        if !unsourced.is_empty() {
            let products: BTreeSet<Product> = unsourced.iter().map(|k| k.product).collect();
            let names: Vec<String> = products.iter().map(Product::to_string).collect();
            let message = format!(
                "no prior forecast available for {} (before {target_date}); manual intervention required",
                names.join(", ")
            );
            tracing::error!(date = %target_date, kind = %failure.kind, %message, "fallback escalated");
            return Err(FallbackError::Escalated {
                failure: failure.kind,
                missing: unsourced,
                message,
            });
        }

        Ok(batch)
    }

    /// Most recent eligible source; prefers one whose needed records are all
    /// original forecasts. Returns the source and whether it is a fallback.
    fn select_source(
        &self,
        product: Product,
        hours: &BTreeSet<u8>,
        target_date: NaiveDate,
    ) -> Option<(Source, bool)> {
        let history = match self.store.history(product) {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(%product, error = %e, "cannot list stored forecasts");
                return None;
            }
        };

        let mut first_eligible: Option<Source> = None;
        for (date, _) in history.into_iter().filter(|(d, _)| *d < target_date) {
            let stored = match self.store.retrieve(date, product) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(%product, %date, error = %e, "skipping unreadable fallback candidate");
                    continue;
                }
            };
            if stored.records.iter().any(|r| r.samples.len() != self.sample_count) {
                tracing::debug!(%product, %date, "candidate has a different sample count");
                continue;
            }

            let by_hour: BTreeMap<u8, ForecastRecord> = stored
                .records
                .into_iter()
                .filter_map(|r| r.hour_ending(date).map(|h| (h.get(), r)))
                .collect();
            let source = Source { date, by_hour };
            if !source.covers(hours) {
                continue;
            }
            if source.is_clean_for(hours) {
                return Some((source, false));
            }
            if first_eligible.is_none() {
                first_eligible = Some(source);
            }
        }
        first_eligible.map(|s| (s, true))
    }
}
