//! Compares script-derived (expected) against VCI-derived (realized) LO
//! offsets.
//!
//! The two record sets are joined on the composite (scan, antenna) key,
//! never positionally. A key present on only one side is a first-class
//! [`ValidationStatus::Unmatched`] outcome, reported rather than dropped: a
//! missing realization is itself a meaningful failure.

use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;

use crate::FrequencySetup;

/// Validator configuration. The pass decision is governed by the absolute
/// tolerance; the relative error is stored in every result so callers can
/// re-threshold without reparsing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidateConfig {
    /// Absolute tolerance \[Hz\] on |expected - realized|.
    pub tolerance_hz: f64,
}

impl Default for ValidateConfig {
    fn default() -> ValidateConfig {
        ValidateConfig { tolerance_hz: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Pass,
    Fail,
    /// The scripted setup had no realized counterpart in the VCI-derived
    /// set.
    UnmatchedExpected,
    /// The VCI recorded a setup the script never asked for.
    UnmatchedRealized,
}

/// One scan×antenna comparison outcome. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub scan: u32,
    pub antenna: String,
    /// Script-derived LO1 offset \[Hz\], if the key was present there.
    pub expected_hz: Option<f64>,
    /// VCI-derived LO1 offset \[Hz\], if the key was present there.
    pub realized_hz: Option<f64>,
    /// |expected - realized| \[Hz\], for matched keys.
    pub abs_error_hz: Option<f64>,
    /// Absolute error scaled by |expected|; `None` for unmatched keys or a
    /// zero expectation.
    pub rel_error: Option<f64>,
    /// The tolerance the pass decision used \[Hz\].
    pub tolerance_hz: f64,
    pub status: ValidationStatus,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.status == ValidationStatus::Pass
    }

    pub fn unmatched(&self) -> bool {
        matches!(
            self.status,
            ValidationStatus::UnmatchedExpected | ValidationStatus::UnmatchedRealized
        )
    }
}

/// Compare the two setup sets. Output is ordered by (scan, antenna), one
/// result per key in the union of the two key sets.
pub fn validate(
    expected: &[FrequencySetup],
    realized: &[FrequencySetup],
    config: &ValidateConfig,
) -> Vec<ValidationResult> {
    let expected_by_key: BTreeMap<(u32, String), &FrequencySetup> =
        expected.iter().map(|s| (s.key(), s)).collect();
    let realized_by_key: BTreeMap<(u32, String), &FrequencySetup> =
        realized.iter().map(|s| (s.key(), s)).collect();

    let keys: Vec<(u32, String)> = expected_by_key
        .keys()
        .chain(realized_by_key.keys())
        .cloned()
        .sorted()
        .dedup()
        .collect();

    let results: Vec<ValidationResult> = keys
        .into_iter()
        .map(|key| {
            let expected_hz = expected_by_key.get(&key).map(|s| s.lo1_offset_hz);
            let realized_hz = realized_by_key.get(&key).map(|s| s.lo1_offset_hz);
            let (scan, antenna) = key;
            match (expected_hz, realized_hz) {
                (Some(e), Some(r)) => {
                    let abs_error = (e - r).abs();
                    let status = if abs_error <= config.tolerance_hz {
                        ValidationStatus::Pass
                    } else {
                        ValidationStatus::Fail
                    };
                    ValidationResult {
                        scan,
                        antenna,
                        expected_hz: Some(e),
                        realized_hz: Some(r),
                        abs_error_hz: Some(abs_error),
                        rel_error: (e != 0.0).then(|| abs_error / e.abs()),
                        tolerance_hz: config.tolerance_hz,
                        status,
                    }
                }
                (expected_hz, realized_hz) => ValidationResult {
                    scan,
                    antenna,
                    expected_hz,
                    realized_hz,
                    abs_error_hz: None,
                    rel_error: None,
                    tolerance_hz: config.tolerance_hz,
                    status: if expected_hz.is_some() {
                        ValidationStatus::UnmatchedExpected
                    } else {
                        ValidationStatus::UnmatchedRealized
                    },
                },
            }
        })
        .collect();

    debug!(
        "validated {} keys ({} unmatched)",
        results.len(),
        results.iter().filter(|r| r.unmatched()).count()
    );
    results
}
