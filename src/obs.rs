//! The per-observation pipeline: one script plus its VCI documents, through
//! extraction, validation and f-shift computation, down to an
//! [`ObservationSummary`].
//!
//! Scans do not always get their own VCI document; the control software
//! reuses the previous configuration until a new one is loaded. Realized
//! setups for such scans come from the most recent VCI at or before the
//! scan.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use thiserror::Error;
use vec1::Vec1;

use crate::extract::{self, ExtractError, Extraction};
use crate::fshift::{self, subband_window, FShiftResult, FshiftError, MixerFlag};
use crate::parse::script::{parse_script, ScriptParse};
use crate::parse::vci::{parse_vci, VciFormatError, VciParse};
use crate::stats::ObservationSummary;
use crate::validate::{validate, ValidateConfig, ValidationResult};
use crate::FrequencySetup;

#[derive(Debug, Error)]
pub enum ObsError {
    #[error("no VCI documents supplied")]
    NoVci,

    #[error(transparent)]
    Vci(#[from] VciFormatError),

    #[error("scan {scan} precedes the first VCI document (scan {first})")]
    NoVciForScan { scan: u32, first: u32 },
}

/// Everything derived from one observation. The summary at the bottom is
/// recomputable from the rest at any time.
#[derive(Debug)]
pub struct Observation {
    pub label: String,
    pub script: ScriptParse,
    pub vci: Vec1<VciParse>,

    /// Script-derived (intended) setups.
    pub expected: Vec<FrequencySetup>,

    /// VCI-derived (realized) setups, after scan reuse resolution.
    pub realized: Vec<FrequencySetup>,

    pub results: Vec<ValidationResult>,
    pub fshifts: Vec<FShiftResult>,

    /// Scan-and-antenna pairs skipped during extraction, from either input.
    /// Kept so that nothing is dropped uncounted.
    pub extract_errors: Vec<ExtractError>,

    /// F-shift computations rejected for an unrecognized mixer chip. Kept so
    /// that nothing is dropped uncounted.
    pub fshift_errors: Vec<FshiftError>,

    pub summary: ObservationSummary,
}

/// Run the full pipeline over already-loaded text content. File reading is
/// the caller's concern.
pub fn process_observation(
    label: &str,
    script_text: &str,
    vci_texts: &[&str],
    config: &ValidateConfig,
) -> Result<Observation, ObsError> {
    let script = parse_script(script_text);
    if !script.errors.is_empty() {
        warn!(
            "{label}: {} script line(s) failed to parse",
            script.errors.len()
        );
    }

    let vci: Vec<VciParse> = vci_texts
        .iter()
        .map(|text| parse_vci(text))
        .collect::<Result<_, _>>()?;
    let vci = Vec1::try_from_vec(vci).map_err(|_| ObsError::NoVci)?;

    let Extraction {
        setups: expected,
        errors: mut extract_errors,
    } = extract::from_commands(&script);
    let (realized, mut realized_errors) = realized_setups(&vci, &expected)?;
    extract_errors.append(&mut realized_errors);
    if !extract_errors.is_empty() {
        warn!(
            "{label}: {} setup(s) skipped during extraction",
            extract_errors.len()
        );
    }

    let results = validate(&expected, &realized, config);

    let mut fshifts = vec![];
    let mut fshift_errors = vec![];
    for setup in &realized {
        match fshift::fshift(setup) {
            Ok(result) => fshifts.push(result),
            Err(e) => fshift_errors.push(e),
        }
    }
    if !fshift_errors.is_empty() {
        warn!("{label}: {} f-shift computation(s) failed", fshift_errors.len());
    }

    let mut summary =
        ObservationSummary::from_results(label, &results, &fshifts, fshift_errors.len() as u64);
    summary.n_script_errors = script.errors.len() as u64;
    summary.n_vci_errors = vci.iter().map(|parse| parse.errors.len() as u64).sum();
    summary.n_extract_errors = extract_errors.len() as u64;
    debug!(
        "{label}: {} expected, {} realized, pass rate {:?}",
        expected.len(),
        realized.len(),
        summary.pass_rate()
    );

    Ok(Observation {
        label: label.to_string(),
        script,
        vci,
        expected,
        realized,
        results,
        fshifts,
        extract_errors,
        fshift_errors,
        summary,
    })
}

impl Observation {
    /// Classify the applied f-shifts against every sub-band's validity
    /// window, returning the first flag that is not `Okay` (or `Okay` when
    /// all sub-bands are satisfied). `None` when the script header carries
    /// no array configuration or no sub-band has enough attributes for a
    /// window.
    pub fn worst_mixer_flag(&self) -> Option<MixerFlag> {
        let max_baseline_m = self.script.header.max_baseline_m()?;
        let mut any_window = false;
        for parse in self.vci.iter() {
            let scan = parse.scan_num().ok()?;
            let Some(f_used) = self
                .fshifts
                .iter()
                .find(|f| f.scan == scan)
                .map(|f| f.fshift_hz)
            else {
                continue;
            };
            for baseband in parse.basebands() {
                for subband in baseband.subbands() {
                    let Some(sky) = subband.sky_freq_hz() else {
                        continue;
                    };
                    let Some(window) = subband_window(&subband, sky, max_baseline_m) else {
                        continue;
                    };
                    any_window = true;
                    let flag = window.flag(f_used);
                    if flag.is_bad() {
                        return Some(flag);
                    }
                }
            }
        }
        any_window.then_some(MixerFlag::Okay)
    }
}

/// Collect realized setups from every VCI document, then fill in the scans
/// the script expects but no document covers directly, reusing the most
/// recent VCI at or before each.
fn realized_setups(
    vci: &Vec1<VciParse>,
    expected: &[FrequencySetup],
) -> Result<(Vec<FrequencySetup>, Vec<ExtractError>), ObsError> {
    let mut by_scan: BTreeMap<u32, &VciParse> = BTreeMap::new();
    for parse in vci.iter() {
        by_scan.insert(parse.scan_num()?, parse);
    }

    let mut errors = vec![];
    let mut out: BTreeMap<(u32, String), FrequencySetup> = BTreeMap::new();
    for parse in vci.iter() {
        let mut extraction = extract::from_vci(parse);
        errors.append(&mut extraction.errors);
        for setup in extraction.setups {
            out.insert(setup.key(), setup);
        }
    }

    let script_scans: BTreeSet<u32> = expected.iter().map(|s| s.scan).collect();
    for &scan in &script_scans {
        if by_scan.contains_key(&scan) {
            continue;
        }
        // Most recent VCI at or before this scan.
        let (&reused_scan, reused) =
            by_scan
                .range(..=scan)
                .next_back()
                .ok_or_else(|| ObsError::NoVciForScan {
                    scan,
                    first: *by_scan.keys().next().expect("vci is non-empty"),
                })?;
        debug!("scan {scan} reuses the VCI of scan {reused_scan}");
        // Extraction errors were already counted on the document's own scan.
        for mut setup in extract::from_vci(reused).setups {
            setup.scan = scan;
            out.insert(setup.key(), setup);
        }
    }

    Ok((out.into_values().collect(), errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::ValidationStatus;

    fn vci_doc(scan: u32, lo1: f64) -> String {
        format!(
            r#"<vciRequest>
  <subArray configId="obs_scan{scan}" scanId="{scan}" name="A1">
    <station name="ANT1"/>
    <station name="ANT2"/>
    <stationInputOutput>
      <baseBand swbbName="A0C0" bw="128e6" inQuant="8" lo1Offset="{lo1}"/>
    </stationInputOutput>
  </subArray>
</vciRequest>"#
        )
    }

    #[test]
    fn scan_without_its_own_vci_reuses_the_previous_one() {
        let script = "\
SUBARRAY A1 ANT1,ANT2
SCAN 1
FREQ LO1=1.0GHz
SCAN 2
FREQ LO1=1.0GHz
SCAN 3
FREQ LO1=2.0GHz
";
        let vci1 = vci_doc(1, 1e9);
        let vci3 = vci_doc(3, 2e9);
        let obs = process_observation(
            "test",
            script,
            &[&vci1, &vci3],
            &ValidateConfig::default(),
        )
        .unwrap();

        // Scan 2 reuses scan 1's configuration, so every key matches and
        // scans 1 and 2 compare equal.
        assert_eq!(obs.results.len(), 6);
        assert!(obs.results.iter().all(|r| r.passed()));
    }

    #[test]
    fn scan_before_any_vci_is_an_error() {
        let script = "SUBARRAY A1 ANT1\nSCAN 1\nFREQ LO1=1.0GHz\n";
        let vci = vci_doc(5, 1e9);
        let err =
            process_observation("test", script, &[&vci], &ValidateConfig::default()).unwrap_err();
        assert!(matches!(err, ObsError::NoVciForScan { scan: 1, first: 5 }));
    }

    #[test]
    fn no_vci_documents_is_an_error() {
        let err = process_observation("test", "SOURCE 3C48\n", &[], &ValidateConfig::default())
            .unwrap_err();
        assert!(matches!(err, ObsError::NoVci));
    }

    #[test]
    fn vci_only_scans_show_up_unmatched() {
        let script = "SUBARRAY A1 ANT1,ANT2\nSCAN 2\nFREQ LO1=1.0GHz\n";
        let vci2 = vci_doc(2, 1e9);
        let vci7 = vci_doc(7, 1.5e9);
        let obs = process_observation(
            "test",
            script,
            &[&vci2, &vci7],
            &ValidateConfig::default(),
        )
        .unwrap();
        let unmatched: Vec<_> = obs.results.iter().filter(|r| r.unmatched()).collect();
        assert_eq!(unmatched.len(), 2);
        assert!(unmatched
            .iter()
            .all(|r| r.status == ValidationStatus::UnmatchedRealized && r.scan == 7));
    }

    #[test]
    fn mixer_window_flags() {
        let script = "\
#   Array Configurations: B
SUBARRAY A1 ANT1
SCAN 1
FREQ LO1=1000001000Hz
";
        let vci_for = |lo1: f64| {
            format!(
                r#"<vciRequest>
  <subArray configId="obs_scan1" scanId="1" name="A1">
    <station name="ANT1"/>
    <stationInputOutput>
      <baseBand swbbName="A0C0" bw="128e6" centerFreq="1.5e9" inQuant="8" lo1Offset="{lo1}">
        <subBand centralFreq="64e6" bw="32e6" swIndex="1" sbid="0">
          <polProducts>
            <pp spectralChannels="64"/>
            <blbProdIntegration recirculation="1" minIntegTime="1000000"/>
          </polProducts>
        </subBand>
      </baseBand>
    </stationInputOutput>
  </subArray>
</vciRequest>"#
            )
        };

        // 1000001000 mod 1e8 = 1000 Hz, inside [30, 32e6/3e3] Hz.
        let okay = vci_for(1_000_001_000.0);
        let obs =
            process_observation("test", script, &[&okay], &ValidateConfig::default()).unwrap();
        assert_eq!(obs.worst_mixer_flag(), Some(MixerFlag::Okay));

        // 2000030000 mod 1e8 = 30 kHz, above the window's upper bound.
        let above = vci_for(2_000_030_000.0);
        let obs =
            process_observation("test", script, &[&above], &ValidateConfig::default()).unwrap();
        assert_eq!(obs.worst_mixer_flag(), Some(MixerFlag::Above));
    }

    #[test]
    fn incomplete_pair_fails_alone_and_every_error_is_counted() {
        // Line 2 fails to tokenize; scan 2 selects a fresh antenna that
        // never resolves an LO1; the VCI carries one bad attribute. None of
        // that stops scan 1's setups from validating, and every problem
        // lands in the summary's counters.
        let script = "\
SUBARRAY A1 ANT1,ANT2
FREQ LO1=notafreq
SCAN 1
FREQ LO1=1.0GHz
SCAN 2
ANTENNA ANT3
FREQ LO2=0.5GHz
";
        let vci = r#"<vciRequest>
  <subArray configId="obs_scan1" scanId="1" name="A1">
    <station name="ANT1"/>
    <station name="ANT2"/>
    <baseBand swbbName="A0C0" bw="oops" lo1Offset="1e9"/>
  </subArray>
</vciRequest>"#;
        let obs =
            process_observation("test", script, &[vci], &ValidateConfig::default()).unwrap();

        assert_eq!(obs.expected.len(), 2);
        assert!(obs.results.iter().all(|r| r.passed()));
        assert_eq!(
            obs.extract_errors,
            vec![ExtractError::IncompleteSetup {
                scan: 2,
                antenna: "ANT3".to_string()
            }]
        );
        assert_eq!(obs.summary.n_script_errors, 1);
        assert_eq!(obs.summary.n_vci_errors, 1);
        assert_eq!(obs.summary.n_extract_errors, 1);
    }

    #[test]
    fn fshift_failures_are_counted_not_dropped() {
        let script = "SUBARRAY A1 ANT1\nFREQ LO1=1.0GHz\n";
        let vci = r#"<vciRequest>
  <subArray configId="obs_scan1" scanId="1" name="A1">
    <station name="ANT1"/>
    <baseBand swbbName="A0C0" bw="128e6" lo1Offset="1e9" mixerChip="L999-9"/>
  </subArray>
</vciRequest>"#;
        let obs =
            process_observation("test", script, &[vci], &ValidateConfig::default()).unwrap();
        assert!(obs.fshifts.is_empty());
        assert_eq!(obs.fshift_errors.len(), 1);
        assert_eq!(obs.summary.n_fshift_errors, 1);
    }
}
