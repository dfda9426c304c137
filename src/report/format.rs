//! Formatted terminal output for runs and stored batches.
//!
//! Kept separate from the pipeline so output changes stay local.

use crate::app::pipeline::RunOutcome;
use crate::domain::{ForecastBatch, RunStatus};
use crate::io::{IndexReport, format_timestamp};
use crate::report::{HourBand, hour_bands};

/// Format a run outcome: status, counts, failures, fallbacks, validation.
pub fn format_run_summary(outcome: &RunOutcome) -> String {
    let diag = &outcome.diagnostics;
    let mut out = String::new();

    out.push_str("=== pricecast run ===\n");
    out.push_str(&format!("Target date: {}\n", outcome.target_date));
    out.push_str(&format!("Status: {}\n", outcome.status));
    out.push_str(&format!(
        "Keys: {} | failed: {} | from fallback: {}\n",
        diag.keys_total,
        diag.failures.len(),
        diag.fallback_keys().len()
    ));
    out.push_str(&format!("Elapsed: {:.3}s", diag.elapsed.as_secs_f64()));
    if diag.deadline_exceeded {
        out.push_str(" (deadline exceeded)");
    }
    out.push('\n');

    if let Some(stored) = &outcome.batch_ref {
        out.push_str("\nStored:\n");
        for path in &stored.files {
            out.push_str(&format!("- {}\n", path.display()));
        }
    }

    if !diag.validation.is_empty() {
        out.push_str("\nValidation:\n");
        for result in &diag.validation {
            let mark = if result.passed { "ok" } else { "FAIL" };
            out.push_str(&format!("  {:<13} {mark}", result.stage.to_string()));
            if !result.passed {
                out.push_str(&format!(" ({} key(s))", result.keys.len()));
            }
            out.push('\n');
        }
    }

    if !diag.failures.is_empty() {
        out.push_str("\nFailed keys:\n");
        const SHOWN: usize = 10;
        for failure in diag.failures.iter().take(SHOWN) {
            out.push_str(&format!("- [{}] {}\n", failure.kind(), failure.error));
        }
        if diag.failures.len() > SHOWN {
            out.push_str(&format!("  ... and {} more\n", diag.failures.len() - SHOWN));
        }
    }

    if let Some(failure) = &diag.batch_failure {
        out.push_str(&format!("\nWhole batch replaced ({}): {}\n", failure.kind, failure.message));
    }

    if !diag.fallbacks.is_empty() {
        out.push_str("\nFallback sources:\n");
        for fb in &diag.fallbacks {
            out.push_str(&format!(
                "- {}: {} key(s) from {} (+{}d{}{})\n",
                fb.product,
                fb.keys.len(),
                fb.source_date,
                fb.shift_days,
                if fb.source_was_fallback { ", source was itself a fallback" } else { "" },
                if fb.extended_hours.is_empty() {
                    String::new()
                } else {
                    format!(", {} hour(s) extended", fb.extended_hours.len())
                },
            ));
        }
    }

    if outcome.status == RunStatus::Failed {
        if let Some(err) = &diag.error {
            out.push_str(&format!("\nError: {err}\n"));
        }
    }

    out
}

/// Format a stored batch. `full` prints every hour; otherwise a summary.
pub fn format_batch(batch: &ForecastBatch, full: bool) -> String {
    let mut out = String::new();
    let bands = hour_bands(batch);

    out.push_str(&format!(
        "Forecast for {} | products: {} | records: {} | fallback: {}\n",
        batch.target_date,
        batch
            .products()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(","),
        batch.records.len(),
        batch.fallback_count()
    ));
    if let Some(generated) = batch.records.iter().map(|r| r.generation_timestamp).max() {
        out.push_str(&format!("Generated: {}\n", format_timestamp(generated)));
    }
    for fb in &batch.fallbacks {
        out.push_str(&format!("Fallback: {}\n", fb.reason));
    }
    out.push('\n');

    out.push_str(
        format!(
            "{:<22} {:<6} {:>10} {:>10} {:>10} {:>10} {:<3}\n",
            "timestamp", "prod", "point", "p10", "p50", "p90", "fb"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(
        format!(
            "{:-<22} {:-<6} {:-<10} {:-<10} {:-<10} {:-<10} {:-<3}\n",
            "", "", "", "", "", "", ""
        )
        .trim_end(),
    );
    out.push('\n');

    let shown: Box<dyn Iterator<Item = &HourBand>> = if full {
        Box::new(bands.iter())
    } else {
        // Every sixth hour keeps the summary short.
        Box::new(bands.iter().enumerate().filter(|(i, _)| i % 6 == 0).map(|(_, b)| b))
    };
    for band in shown {
        out.push_str(&format!(
            "{:<22} {:<6} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:<3}\n",
            format_timestamp(band.timestamp),
            band.product.to_string(),
            band.point,
            band.p10,
            band.p50,
            band.p90,
            if band.is_fallback { "y" } else { "" }
        ));
    }

    out
}

/// Format an index consistency report.
pub fn format_index_report(report: &IndexReport) -> String {
    if report.is_consistent() {
        return "Index is consistent with stored files.\n".to_string();
    }
    let mut out = String::new();
    if report.corrupt {
        out.push_str("Index file is corrupt.\n");
    }
    for (date, product) in &report.unindexed {
        out.push_str(&format!("unindexed: {date} {product}\n"));
    }
    for (date, product) in &report.dangling {
        out.push_str(&format!("dangling:  {date} {product}\n"));
    }
    for (date, product) in &report.stale_metadata {
        out.push_str(&format!("stale metadata: {date} {product}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ForecastRecord, Product, horizon_start};
    use chrono::{Duration, NaiveDate};

    #[test]
    fn batch_table_marks_fallback_rows() {
        let date = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        let records = (1..=2)
            .map(|h| ForecastRecord {
                timestamp: horizon_start(date) + Duration::hours(h),
                product: Product::Dalmp,
                point_forecast: 25.0,
                samples: vec![20.0, 25.0, 30.0],
                generation_timestamp: horizon_start(date),
                is_fallback: h == 2,
                fallback_reason: None,
            })
            .collect();
        let text = format_batch(&ForecastBatch::new(date, records), true);
        assert!(text.contains("records: 2 | fallback: 1"));
        let rows: Vec<&str> = text.lines().filter(|l| l.starts_with("2026-04-01")).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].trim_end().ends_with('y'));
        assert!(rows[0].contains("21.00"));
    }

    #[test]
    fn consistent_index_has_one_line() {
        assert_eq!(format_index_report(&IndexReport::default()).lines().count(), 1);
    }
}
