//! Aggregations over per-period metric series.
//!
//! Series arrive newest-first. Trailing-twelve-month sums the most recent
//! four periods; when fewer are available the average of what is there is
//! scaled to a full year and the result is tagged partial.

use appraisal_core::Coverage;
use chrono::NaiveDate;

/// One period of a base metric's series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub value: Option<f64>,
}

impl SeriesPoint {
    pub fn new(
        period_start: Option<NaiveDate>,
        period_end: Option<NaiveDate>,
        value: Option<f64>,
    ) -> Self {
        Self {
            period_start,
            period_end,
            value,
        }
    }
}

/// Result of one aggregation: the value plus the coverage tag and period
/// range that feed group metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutcome {
    pub value: Option<f64>,
    pub coverage: Coverage,
    pub sample_count: usize,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
}

impl AggregateOutcome {
    fn no_data() -> Self {
        Self {
            value: None,
            coverage: Coverage::NoData,
            sample_count: 0,
            period_start: None,
            period_end: None,
        }
    }
}

/// Sum of the most recent four periods. With 1-3 values available the
/// average is annualized (scaled by 4) and tagged partial; with none the
/// result is null and tagged no-data.
pub fn trailing_twelve_month(series: &[SeriesPoint]) -> AggregateOutcome {
    let window = 4;
    let considered = &series[..series.len().min(window)];
    let values: Vec<f64> = considered.iter().filter_map(|p| p.value).collect();
    if values.is_empty() {
        return AggregateOutcome::no_data();
    }
    let sum: f64 = values.iter().sum();
    let (period_start, period_end) = period_envelope(considered);
    if values.len() == window {
        AggregateOutcome {
            value: Some(sum),
            coverage: Coverage::Full,
            sample_count: values.len(),
            period_start,
            period_end,
        }
    } else {
        let annualized = sum / values.len() as f64 * window as f64;
        AggregateOutcome {
            value: Some(annualized),
            coverage: Coverage::Partial,
            sample_count: values.len(),
            period_start,
            period_end,
        }
    }
}

/// Mean of the available values among the most recent `window` periods.
pub fn trailing_average(series: &[SeriesPoint], window: usize) -> AggregateOutcome {
    let window = window.max(1);
    let considered = &series[..series.len().min(window)];
    let values: Vec<f64> = considered.iter().filter_map(|p| p.value).collect();
    if values.is_empty() {
        return AggregateOutcome::no_data();
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let (period_start, period_end) = period_envelope(considered);
    AggregateOutcome {
        value: Some(mean),
        coverage: if values.len() == window {
            Coverage::Full
        } else {
            Coverage::Partial
        },
        sample_count: values.len(),
        period_start,
        period_end,
    }
}

/// Most recent non-null value.
pub fn last_value(series: &[SeriesPoint]) -> AggregateOutcome {
    match series.iter().find(|p| p.value.is_some()) {
        Some(point) => AggregateOutcome {
            value: point.value,
            coverage: Coverage::Full,
            sample_count: 1,
            period_start: point.period_start,
            period_end: point.period_end,
        },
        None => AggregateOutcome::no_data(),
    }
}

fn period_envelope(points: &[SeriesPoint]) -> (Option<NaiveDate>, Option<NaiveDate>) {
    let start = points
        .iter()
        .filter(|p| p.value.is_some())
        .filter_map(|p| p.period_start.or(p.period_end))
        .min();
    let end = points
        .iter()
        .filter(|p| p.value.is_some())
        .filter_map(|p| p.period_end.or(p.period_start))
        .max();
    (start, end)
}
