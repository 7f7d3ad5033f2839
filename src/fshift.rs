//! The L302 mixer f-shift and its validity window.
//!
//! The f-shift applied by an L302 chip stage is the first LO offset reduced
//! modulo the mixer reference interval, plus a per-stage calibration
//! constant. The window analysis classifies a candidate f-shift against the
//! bounds the correlator imposes:
//!
//! ```text
//! f_maxfringe = 460 Hz · (b_max / 20 km) · (f_sky / 50 GHz)
//! f_min = max(f_maxfringe, 30 / τ)
//! f_max = bw / 4e4   (recirculating)    bw / 3e3   (otherwise)
//! ```

use thiserror::Error;

use crate::parse::vci::SubbandView;
use crate::{FrequencySetup, MixerConfig};

/// The mixer's reference interval \[Hz\]. LO offsets wrap into one interval
/// before the stage calibration is applied.
pub const L302_REF_INTERVAL_HZ: f64 = 1e8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FshiftError {
    #[error("unrecognized mixer chip variant: '{chip}'")]
    InvalidMixerConfig { chip: String },
}

/// The recognized L302 chip stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerChip {
    Stage1,
    Stage2,
    Stage3,
    Stage4,
}

impl MixerChip {
    /// Resolve an identifier such as `L302-2` (case-insensitive, `_` also
    /// accepted as the separator).
    pub fn from_name(name: &str) -> Option<MixerChip> {
        let normalized = name.trim().to_ascii_uppercase().replace('_', "-");
        match normalized.as_str() {
            "L302-1" => Some(MixerChip::Stage1),
            "L302-2" => Some(MixerChip::Stage2),
            "L302-3" => Some(MixerChip::Stage3),
            "L302-4" => Some(MixerChip::Stage4),
            _ => None,
        }
    }

    /// Per-stage calibration constant \[Hz\] added to the wrapped offset.
    pub fn calibration_hz(self) -> f64 {
        match self {
            MixerChip::Stage1 => 0.0,
            MixerChip::Stage2 => 0.25,
            MixerChip::Stage3 => 0.5,
            MixerChip::Stage4 => 0.75,
        }
    }
}

/// The derived f-shift for one scan×antenna setup.
#[derive(Debug, Clone, PartialEq)]
pub struct FShiftResult {
    pub scan: u32,
    pub antenna: String,
    /// Computed mixer frequency shift \[Hz\].
    pub fshift_hz: f64,
    /// The resolved chip stage.
    pub chip: MixerChip,
    /// The mixer parameters the computation used.
    pub mixer: MixerConfig,
}

/// Compute the f-shift for a setup. Pure and deterministic: identical inputs
/// always yield identical results.
pub fn fshift(setup: &FrequencySetup) -> Result<FShiftResult, FshiftError> {
    let chip =
        MixerChip::from_name(&setup.mixer.chip).ok_or_else(|| FshiftError::InvalidMixerConfig {
            chip: setup.mixer.chip.clone(),
        })?;
    let wrapped = setup.lo1_offset_hz.rem_euclid(L302_REF_INTERVAL_HZ);
    Ok(FShiftResult {
        scan: setup.scan,
        antenna: setup.antenna.clone(),
        fshift_hz: wrapped + chip.calibration_hz(),
        chip,
        mixer: setup.mixer.clone(),
    })
}

/// How a candidate f-shift sits against the `[f_min, f_max]` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerFlag {
    Okay,
    Below,
    Above,
    /// The window itself is empty (`f_min > f_max`); no f-shift can satisfy
    /// this sub-band.
    Fail,
}

impl MixerFlag {
    pub fn is_bad(self) -> bool {
        self != MixerFlag::Okay
    }
}

pub fn mixer_flag(fshift_hz: f64, f_min_hz: f64, f_max_hz: f64) -> MixerFlag {
    if f_min_hz > f_max_hz {
        MixerFlag::Fail
    } else if fshift_hz < f_min_hz {
        MixerFlag::Below
    } else if fshift_hz > f_max_hz {
        MixerFlag::Above
    } else {
        MixerFlag::Okay
    }
}

/// The f-shift validity window of one sub-band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubbandWindow {
    pub f_min_hz: f64,
    pub f_max_hz: f64,
    /// The sub-band's own optimum f-shift.
    pub f_opt_hz: f64,
}

impl SubbandWindow {
    pub fn flag(&self, fshift_hz: f64) -> MixerFlag {
        mixer_flag(fshift_hz, self.f_min_hz, self.f_max_hz)
    }

    pub fn opt_flag(&self) -> MixerFlag {
        self.flag(self.f_opt_hz)
    }
}

/// Maximum fringe rate \[Hz\] for a baseline length and observed sky
/// frequency.
pub fn max_fringe_hz(max_baseline_m: f64, sky_freq_hz: f64) -> f64 {
    460.0 * (max_baseline_m / 1e3 / 20.0) * (sky_freq_hz / 50e9)
}

/// Build the validity window for a sub-band, given the array's maximum
/// baseline and the sub-band's observed sky frequency. `None` when the
/// sub-band element lacks the bandwidth or timing attributes the bounds
/// need.
pub fn subband_window(
    subband: &SubbandView,
    sky_freq_hz: f64,
    max_baseline_m: f64,
) -> Option<SubbandWindow> {
    let tau = subband.integration_time_s()?;
    let bw = subband.bw_hz()?;
    let f_min_hz = max_fringe_hz(max_baseline_m, sky_freq_hz).max(30.0 / tau);
    let divisor = if subband.recirculation() > 1 { 4e4 } else { 3e3 };
    Some(SubbandWindow {
        f_min_hz,
        f_max_hz: bw / divisor,
        f_opt_hz: subband.freq_opt_hz()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BasebandId, FrequencySetup};

    fn setup(lo1: f64, chip: &str) -> FrequencySetup {
        FrequencySetup {
            scan: 1,
            antenna: "ANT1".to_string(),
            subarray: "A1".to_string(),
            band: None,
            lo1_offset_hz: lo1,
            lo2_offset_hz: None,
            baseband: BasebandId::A0C0,
            mixer: MixerConfig {
                chip: chip.to_string(),
                gain: 1.0,
            },
        }
    }

    #[test]
    fn fshift_is_deterministic() {
        let s = setup(1.35e9, "L302-2");
        let a = fshift(&s).unwrap();
        let b = fshift(&s).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fshift_wraps_into_the_reference_interval() {
        // 1.35 GHz mod 100 MHz = 50 MHz, stage 2 adds 0.25 Hz.
        let r = fshift(&setup(1.35e9, "L302-2")).unwrap();
        assert_eq!(r.fshift_hz, 50e6 + 0.25);
        assert_eq!(r.chip, MixerChip::Stage2);
    }

    #[test]
    fn negative_offsets_wrap_nonnegative() {
        let r = fshift(&setup(-30e6, "L302-1")).unwrap();
        assert_eq!(r.fshift_hz, 70e6);
    }

    #[test]
    fn unknown_chip_is_rejected() {
        assert_eq!(
            fshift(&setup(1e9, "L999-1")),
            Err(FshiftError::InvalidMixerConfig {
                chip: "L999-1".to_string()
            })
        );
    }

    #[test]
    fn chip_name_variants() {
        assert_eq!(MixerChip::from_name("l302_3"), Some(MixerChip::Stage3));
        assert_eq!(MixerChip::from_name(" L302-4 "), Some(MixerChip::Stage4));
        assert_eq!(MixerChip::from_name("L302"), None);
    }

    #[test]
    fn window_classification() {
        assert_eq!(mixer_flag(5.0, 1.0, 10.0), MixerFlag::Okay);
        assert_eq!(mixer_flag(0.5, 1.0, 10.0), MixerFlag::Below);
        assert_eq!(mixer_flag(20.0, 1.0, 10.0), MixerFlag::Above);
        assert_eq!(mixer_flag(5.0, 10.0, 1.0), MixerFlag::Fail);
        assert!(MixerFlag::Below.is_bad());
        assert!(!MixerFlag::Okay.is_bad());
    }

    #[test]
    fn max_fringe_scales_with_baseline_and_frequency() {
        // 20 km baseline at 50 GHz is the 460 Hz reference point.
        assert!((max_fringe_hz(20e3, 50e9) - 460.0).abs() < 1e-9);
        assert!((max_fringe_hz(10e3, 25e9) - 115.0).abs() < 1e-9);
    }
}
