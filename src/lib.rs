//! Cross-checks LO frequency offsets between observing scripts and VCI
//! configuration documents, and derives the per-antenna L302 mixer f-shift.
//!
//! Scripts carry the *intended* frequency setup, VCI documents carry the
//! *realized* one. Both are parsed into structured records, normalized into
//! per-scan, per-antenna [`FrequencySetup`]s, compared within a numeric
//! tolerance, and folded into archive-wide statistics.

pub mod extract;
pub mod fshift;
pub mod obs;
pub mod parse;
pub mod stats;
pub mod validate;

/// Convert a frequency value with a unit suffix into Hz. Suffixes are
/// case-insensitive; a bare value is already in Hz.
pub fn frequency_to_hz(value: f64, unit: &str) -> Option<f64> {
    let factor = match unit.to_ascii_lowercase().as_str() {
        "" | "hz" => 1.0,
        "khz" => 1e3,
        "mhz" => 1e6,
        "ghz" => 1e9,
        _ => return None,
    };
    Some(value * factor)
}

/// Parse a frequency token such as `1.000GHz`, `-5.5MHz` or `500` into Hz.
/// Returns `None` if the token is not numeric or carries an unknown suffix.
pub fn parse_frequency_hz(token: &str) -> Option<f64> {
    let trimmed = token.trim();
    // A bare number, possibly in scientific notation.
    if let Ok(value) = trimmed.parse::<f64>() {
        return Some(value);
    }
    let lower = trimmed.to_ascii_lowercase();
    // "khz" must be tried before "hz".
    for (suffix, factor) in [("ghz", 1e9), ("mhz", 1e6), ("khz", 1e3), ("hz", 1.0)] {
        if let Some(number) = lower.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|value| value * factor);
        }
    }
    None
}

/// The baseband/IF pairs the samplers feed. `A0/C0` and `B0/D0` belong to the
/// 8-bit path; the numbered pairs belong to the 3-bit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BasebandId {
    A0C0,
    B0D0,
    A1C1,
    A2C2,
    B1D1,
    B2D2,
}

impl BasebandId {
    /// Accepts both the slashed VCI spelling (`A0/C0`) and the bare one
    /// (`A0C0`), case-insensitively.
    pub fn from_name(name: &str) -> Option<BasebandId> {
        let compact: String = name
            .chars()
            .filter(|c| *c != '/')
            .collect::<String>()
            .to_ascii_uppercase();
        match compact.as_str() {
            "A0C0" => Some(BasebandId::A0C0),
            "B0D0" => Some(BasebandId::B0D0),
            "A1C1" => Some(BasebandId::A1C1),
            "A2C2" => Some(BasebandId::A2C2),
            "B1D1" => Some(BasebandId::B1D1),
            "B2D2" => Some(BasebandId::B2D2),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BasebandId::A0C0 => "A0/C0",
            BasebandId::B0D0 => "B0/D0",
            BasebandId::A1C1 => "A1/C1",
            BasebandId::A2C2 => "A2/C2",
            BasebandId::B1D1 => "B1/D1",
            BasebandId::B2D2 => "B2/D2",
        }
    }

    pub fn is_8bit(self) -> bool {
        matches!(self, BasebandId::A0C0 | BasebandId::B0D0)
    }

    pub fn is_3bit(self) -> bool {
        !self.is_8bit()
    }
}

/// Mixer parameters as recorded in a script or VCI document. The chip-stage
/// identifier is kept as raw text here; it is only resolved against the known
/// L302 variants when an f-shift is actually computed, so an unrecognized
/// chip poisons that computation alone and not the parse.
#[derive(Debug, Clone, PartialEq)]
pub struct MixerConfig {
    /// Chip-stage identifier text, e.g. `L302-1`.
    pub chip: String,

    /// Digital gain setting for the stage.
    pub gain: f64,
}

impl Default for MixerConfig {
    fn default() -> MixerConfig {
        MixerConfig {
            chip: "L302-1".to_string(),
            gain: 1.0,
        }
    }
}

/// The normalized per-scan, per-antenna frequency setup. One of these exists
/// for every scan×antenna combination present in a parsed script or VCI
/// document; omitted parameters have already been resolved by inheritance
/// when one of these is built.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencySetup {
    /// Scan number within the observation.
    pub scan: u32,

    /// Antenna name, e.g. `ANT1` or `ea05`.
    pub antenna: String,

    /// The subarray this antenna was selected under.
    pub subarray: String,

    /// Receiver band designation, if one was recorded.
    pub band: Option<String>,

    /// Requested/realized first LO offset \[Hz\], signed.
    pub lo1_offset_hz: f64,

    /// Second LO offset \[Hz\], if the setup specified one.
    pub lo2_offset_hz: Option<f64>,

    /// Which baseband/IF pair the setup routes to.
    pub baseband: BasebandId,

    /// L302 mixer stage parameters.
    pub mixer: MixerConfig,
}

impl FrequencySetup {
    /// The composite key joining the script-derived and VCI-derived record
    /// sets. Correlation is never positional.
    pub fn key(&self) -> (u32, String) {
        (self.scan, self.antenna.clone())
    }
}
