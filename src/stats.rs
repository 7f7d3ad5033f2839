//! Archive-wide aggregation of validation and f-shift results.
//!
//! Everything here is a monoid: `merge` is associative and commutative, so
//! partial aggregates computed in any order (or on any thread) combine into
//! the same final result. Means are held as sum+count, extrema as running
//! min/max, distributions as fixed-bucket histograms.

use std::collections::BTreeMap;

use crate::fshift::FShiftResult;
use crate::validate::ValidationResult;

/// Upper edges \[Hz\] of the absolute-error histogram's finite buckets. One
/// underflow bucket (< 0.1 Hz) sits in front and one overflow bucket
/// (≥ 1 MHz) behind, for 9 buckets total.
pub const ERROR_HISTOGRAM_EDGES_HZ: [f64; 8] = [1e-1, 1.0, 1e1, 1e2, 1e3, 1e4, 1e5, 1e6];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorHistogram {
    counts: [u64; ERROR_HISTOGRAM_EDGES_HZ.len() + 1],
}

impl ErrorHistogram {
    pub fn record(&mut self, abs_error_hz: f64) {
        let bucket = ERROR_HISTOGRAM_EDGES_HZ
            .iter()
            .position(|edge| abs_error_hz < *edge)
            .unwrap_or(ERROR_HISTOGRAM_EDGES_HZ.len());
        self.counts[bucket] += 1;
    }

    pub fn merge(&mut self, other: &ErrorHistogram) {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts.iter()) {
            *mine += theirs;
        }
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Running distribution moments: count, mean (as sum/count), min, max.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for Moments {
    fn default() -> Moments {
        Moments {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Moments {
    pub fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: &Moments) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Aggregate over one observation's results. Derived and recomputable; a
/// cache, not authoritative storage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservationSummary {
    /// Observation label, e.g. `2021/01/97920B-310A`.
    pub label: String,

    pub n_results: u64,
    pub n_pass: u64,
    pub n_fail: u64,
    pub n_unmatched: u64,

    /// Absolute-error distribution over matched keys.
    pub error: Moments,
    pub error_hist: ErrorHistogram,

    /// F-shift value distribution.
    pub fshift: Moments,

    /// F-shift computations rejected for an unrecognized mixer chip.
    pub n_fshift_errors: u64,

    /// Script lines that failed to tokenize.
    pub n_script_errors: u64,

    /// Element-level problems accumulated across the VCI documents.
    pub n_vci_errors: u64,

    /// Scan-and-antenna pairs skipped during extraction.
    pub n_extract_errors: u64,
}

impl ObservationSummary {
    pub fn from_results(
        label: &str,
        results: &[ValidationResult],
        fshifts: &[FShiftResult],
        n_fshift_errors: u64,
    ) -> ObservationSummary {
        let mut summary = ObservationSummary {
            label: label.to_string(),
            n_fshift_errors,
            ..ObservationSummary::default()
        };
        for result in results {
            summary.n_results += 1;
            if result.unmatched() {
                summary.n_unmatched += 1;
            } else if result.passed() {
                summary.n_pass += 1;
            } else {
                summary.n_fail += 1;
            }
            if let Some(err) = result.abs_error_hz {
                summary.error.record(err);
                summary.error_hist.record(err);
            }
        }
        for fshift in fshifts {
            summary.fshift.record(fshift.fshift_hz);
        }
        summary
    }

    /// Fraction of matched comparisons that passed.
    pub fn pass_rate(&self) -> Option<f64> {
        let matched = self.n_pass + self.n_fail;
        (matched > 0).then(|| self.n_pass as f64 / matched as f64)
    }
}

/// Per-group accumulator inside [`ArchiveStatistics`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupStats {
    pub observations: u64,
    pub n_results: u64,
    pub n_pass: u64,
    pub n_fail: u64,
    pub n_unmatched: u64,
    pub n_fshift_errors: u64,
    pub n_script_errors: u64,
    pub n_vci_errors: u64,
    pub n_extract_errors: u64,
    pub error: Moments,
    pub error_hist: ErrorHistogram,
    pub fshift: Moments,
}

impl GroupStats {
    pub fn ingest(&mut self, summary: &ObservationSummary) {
        self.observations += 1;
        self.n_results += summary.n_results;
        self.n_pass += summary.n_pass;
        self.n_fail += summary.n_fail;
        self.n_unmatched += summary.n_unmatched;
        self.n_fshift_errors += summary.n_fshift_errors;
        self.n_script_errors += summary.n_script_errors;
        self.n_vci_errors += summary.n_vci_errors;
        self.n_extract_errors += summary.n_extract_errors;
        self.error.merge(&summary.error);
        self.error_hist.merge(&summary.error_hist);
        self.fshift.merge(&summary.fshift);
    }

    pub fn merge(&mut self, other: &GroupStats) {
        self.observations += other.observations;
        self.n_results += other.n_results;
        self.n_pass += other.n_pass;
        self.n_fail += other.n_fail;
        self.n_unmatched += other.n_unmatched;
        self.n_fshift_errors += other.n_fshift_errors;
        self.n_script_errors += other.n_script_errors;
        self.n_vci_errors += other.n_vci_errors;
        self.n_extract_errors += other.n_extract_errors;
        self.error.merge(&other.error);
        self.error_hist.merge(&other.error_hist);
        self.fshift.merge(&other.fshift);
    }

    pub fn pass_rate(&self) -> Option<f64> {
        let matched = self.n_pass + self.n_fail;
        (matched > 0).then(|| self.n_pass as f64 / matched as f64)
    }
}

/// Aggregate across many observations, grouped by a caller-chosen key (a
/// band designation, a year, a configuration code...). Built incrementally;
/// two partial aggregates merge into the same result regardless of order.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveStatistics<K: Ord> {
    groups: BTreeMap<K, GroupStats>,

    /// Observations whose pipeline failed outright. Counted, never silently
    /// dropped.
    pub failed_observations: u64,
}

impl<K: Ord> Default for ArchiveStatistics<K> {
    fn default() -> ArchiveStatistics<K> {
        ArchiveStatistics {
            groups: BTreeMap::new(),
            failed_observations: 0,
        }
    }
}

impl<K: Ord> ArchiveStatistics<K> {
    pub fn ingest(&mut self, key: K, summary: &ObservationSummary) {
        self.groups.entry(key).or_default().ingest(summary);
    }

    pub fn record_failure(&mut self) {
        self.failed_observations += 1;
    }

    /// Monoid combine; consumes the right-hand aggregate.
    pub fn merge(mut self, other: ArchiveStatistics<K>) -> ArchiveStatistics<K> {
        for (key, stats) in other.groups {
            self.groups.entry(key).or_default().merge(&stats);
        }
        self.failed_observations += other.failed_observations;
        self
    }

    pub fn groups(&self) -> impl Iterator<Item = (&K, &GroupStats)> {
        self.groups.iter()
    }

    pub fn group(&self, key: &K) -> Option<&GroupStats> {
        self.groups.get(key)
    }

    pub fn n_observations(&self) -> u64 {
        self.groups.values().map(|g| g.observations).sum()
    }
}
