//! Builds normalized [`FrequencySetup`] records from parsed inputs.
//!
//! Both walks keep an explicit context (active subarray, active scan, active
//! antenna set, per-antenna last-written setup) that is updated as selection
//! commands/elements go by. A frequency setup may omit parameters; they are
//! inherited per antenna, last write wins. What can never be inherited out of
//! thin air is the first LO offset: a scan and antenna with no resolvable LO1
//! produce an [`ExtractError::IncompleteSetup`], not a default-zero record.
//! Such failures skip that one scan and antenna; every other pair still comes
//! out, with the skips accumulated in [`Extraction::errors`].

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};
use thiserror::Error;

use crate::parse::script::{Command, CommandKind, ScriptParse};
use crate::parse::vci::{scan_num_from_config_id, ConfigurationNode, VciParse};
use crate::{BasebandId, FrequencySetup, MixerConfig};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractError {
    #[error("scan {scan}, antenna {antenna}: no LO1 offset resolvable from any prior or current setup")]
    IncompleteSetup { scan: u32, antenna: String },

    #[error("frequency setup at line {line_num} with no antennas selected")]
    NoAntennaSelected { line_num: u32 },

    #[error("'{tag}' element with LO offsets but no stations in scope")]
    NoAntennaInScope { tag: String },
}

/// The setups one extraction pass produced, plus the failures it skipped
/// along the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub setups: Vec<FrequencySetup>,
    pub errors: Vec<ExtractError>,
}

/// Parameters gathered so far for one antenna. Fields stay `None` until some
/// setup touches them.
#[derive(Debug, Clone, Default)]
struct PartialSetup {
    lo1_offset_hz: Option<f64>,
    lo2_offset_hz: Option<f64>,
    band: Option<String>,
    baseband: Option<BasebandId>,
    mixer: Option<MixerConfig>,
}

#[derive(Debug, Default)]
struct Context {
    subarray: Option<String>,
    scan: Option<u32>,
    antennas: Vec<String>,
    current: BTreeMap<String, PartialSetup>,
}

impl Context {
    fn select_antennas<I: IntoIterator<Item = String>>(&mut self, ants: I) {
        self.antennas = ants.into_iter().collect();
        for ant in &self.antennas {
            self.current.entry(ant.clone()).or_default();
        }
    }

    /// Apply one frequency setup to every selected antenna, inheriting
    /// unspecified parameters from that antenna's previous setup. An antenna
    /// with no resolvable LO1 is noted in `incomplete` and skipped; a later
    /// setup in the same scan may still complete it.
    fn apply_setup(
        &mut self,
        update: &PartialSetup,
        out: &mut BTreeMap<(u32, String), FrequencySetup>,
        incomplete: &mut BTreeSet<(u32, String)>,
    ) {
        let scan = self.scan.unwrap_or(1);
        let subarray = self.subarray.clone().unwrap_or_default();
        for ant in &self.antennas {
            let slot = self.current.entry(ant.clone()).or_default();
            if let Some(lo1) = update.lo1_offset_hz {
                slot.lo1_offset_hz = Some(lo1);
            }
            if let Some(lo2) = update.lo2_offset_hz {
                slot.lo2_offset_hz = Some(lo2);
            }
            if let Some(band) = &update.band {
                slot.band = Some(band.clone());
            }
            if let Some(bb) = update.baseband {
                slot.baseband = Some(bb);
            }
            if let Some(mixer) = &update.mixer {
                slot.mixer = Some(mixer.clone());
            }

            let Some(lo1) = slot.lo1_offset_hz else {
                incomplete.insert((scan, ant.clone()));
                continue;
            };
            let setup = FrequencySetup {
                scan,
                antenna: ant.clone(),
                subarray: subarray.clone(),
                band: slot.band.clone(),
                lo1_offset_hz: lo1,
                lo2_offset_hz: slot.lo2_offset_hz,
                baseband: slot.baseband.unwrap_or(BasebandId::A0C0),
                mixer: slot.mixer.clone().unwrap_or_default(),
            };
            trace!("setup for scan {scan} antenna {ant}: LO1 {lo1} Hz");
            out.insert((scan, ant.clone()), setup);
        }
    }
}

/// Turn incomplete-pair markers into errors, dropping those a later setup
/// completed, and package the extraction.
fn finish(
    out: BTreeMap<(u32, String), FrequencySetup>,
    mut errors: Vec<ExtractError>,
    incomplete: BTreeSet<(u32, String)>,
) -> Extraction {
    for (scan, antenna) in incomplete {
        if !out.contains_key(&(scan, antenna.clone())) {
            errors.push(ExtractError::IncompleteSetup { scan, antenna });
        }
    }
    Extraction {
        setups: out.into_values().collect(),
        errors,
    }
}

/// Walk a parsed script's command sequence in document order and produce its
/// intended frequency setups, one per scan and antenna. Unknown commands
/// never contribute. A failing pair is skipped and reported, never fatal for
/// the rest of the script.
pub fn from_commands(parse: &ScriptParse) -> Extraction {
    let mut ctx = Context::default();
    let mut out = BTreeMap::new();
    let mut errors = vec![];
    let mut incomplete = BTreeSet::new();

    for command in &parse.commands {
        match &command.kind {
            CommandKind::Subarray => {
                let mut args = command.args.iter().filter_map(|a| a.value.as_str());
                ctx.subarray = args.next().map(str::to_string);
                ctx.select_antennas(args.map(str::to_string).collect::<Vec<_>>());
            }
            CommandKind::Antenna => {
                let ants: Vec<String> = command
                    .args
                    .iter()
                    .filter_map(|a| a.value.as_str())
                    .map(str::to_string)
                    .collect();
                ctx.select_antennas(ants);
            }
            CommandKind::Scan => {
                if let Some(n) = command.args.first().and_then(|a| a.value.as_hz()) {
                    ctx.scan = Some(n as u32);
                }
            }
            CommandKind::Freq => {
                if ctx.antennas.is_empty() {
                    errors.push(ExtractError::NoAntennaSelected {
                        line_num: command.line_num,
                    });
                    continue;
                }
                let update = setup_from_freq_command(command);
                ctx.apply_setup(&update, &mut out, &mut incomplete);
            }
            // Source selection and unknown commands carry no frequency
            // information.
            CommandKind::Source | CommandKind::Unknown(_) => (),
        }
    }

    let extraction = finish(out, errors, incomplete);
    debug!(
        "extracted {} setups from script ({} skipped)",
        extraction.setups.len(),
        extraction.errors.len()
    );
    extraction
}

fn setup_from_freq_command(command: &Command) -> PartialSetup {
    let mut update = PartialSetup::default();
    for arg in &command.args {
        let Some(name) = arg.name.as_deref() else {
            continue;
        };
        match name {
            "LO1" => update.lo1_offset_hz = arg.value.as_hz(),
            "LO2" => update.lo2_offset_hz = arg.value.as_hz(),
            "BAND" => update.band = arg.value.as_str().map(str::to_string),
            "BASEBAND" => {
                update.baseband = arg
                    .value
                    .as_str()
                    .and_then(BasebandId::from_name);
            }
            "MIXER" => {
                if let Some(chip) = arg.value.as_str() {
                    update.mixer = Some(MixerConfig {
                        chip: chip.to_string(),
                        ..MixerConfig::default()
                    });
                }
            }
            "GAIN" => {
                if let Some(gain) = arg.value.as_hz() {
                    let mut mixer = update.mixer.take().unwrap_or_default();
                    mixer.gain = gain;
                    update.mixer = Some(mixer);
                }
            }
            _ => (),
        }
    }
    update
}

/// Walk a parsed VCI tree in document order and produce the realized
/// frequency setups it records. Unknown elements are skipped opaquely; a
/// failing pair is skipped and reported.
pub fn from_vci(parse: &VciParse) -> Extraction {
    let mut ctx = Context::default();
    let mut out = BTreeMap::new();
    let mut errors = vec![];
    let mut incomplete = BTreeSet::new();
    walk_vci(&parse.root, &mut ctx, &mut out, &mut errors, &mut incomplete);
    let extraction = finish(out, errors, incomplete);
    debug!(
        "extracted {} setups from VCI ({} skipped)",
        extraction.setups.len(),
        extraction.errors.len()
    );
    extraction
}

fn walk_vci(
    node: &ConfigurationNode,
    ctx: &mut Context,
    out: &mut BTreeMap<(u32, String), FrequencySetup>,
    errors: &mut Vec<ExtractError>,
    incomplete: &mut BTreeSet<(u32, String)>,
) {
    if node.is_tag("subArray") {
        ctx.subarray = node
            .attr_text("name")
            .or_else(|| node.attr_text("configId"));
        // Prefer the scan-number convention in configId; fall back on the
        // raw scanId attribute.
        let from_config_id = node
            .attr_text("configId")
            .and_then(|id| scan_num_from_config_id(&id));
        ctx.scan = from_config_id.or_else(|| node.attr_hz("scanId").map(|v| v as u32));
        let stations: Vec<String> = node
            .children
            .iter()
            .filter(|c| c.is_tag("station") || c.is_tag("antenna"))
            .filter_map(|c| c.attr_text("name"))
            .collect();
        if !stations.is_empty() {
            ctx.select_antennas(stations);
        }
    }

    if node.is_tag("baseBand") || node.is_tag("loIfSetup") {
        if let Some(update) = setup_from_vci_node(node) {
            if ctx.antennas.is_empty() {
                errors.push(ExtractError::NoAntennaInScope {
                    tag: node.tag.clone(),
                });
            } else {
                ctx.apply_setup(&update, out, incomplete);
            }
        }
    }

    for child in &node.children {
        walk_vci(child, ctx, out, errors, incomplete);
    }
}

/// A baseband/loIfSetup element only counts as a frequency setup if it
/// carries at least one LO offset; plain signal-path basebands are left to
/// inheritance.
fn setup_from_vci_node(node: &ConfigurationNode) -> Option<PartialSetup> {
    let lo1 = node
        .attr_hz("lo1Offset")
        .or_else(|| node.attr_hz("widarOffsetFreq"));
    let lo2 = node.attr_hz("lo2Offset");
    if lo1.is_none() && lo2.is_none() {
        return None;
    }
    let mut update = PartialSetup {
        lo1_offset_hz: lo1,
        lo2_offset_hz: lo2,
        band: node.attr_text("rcvr").or_else(|| node.attr_text("band")),
        baseband: node
            .attr_text("swbbName")
            .or_else(|| node.attr_text("name"))
            .and_then(|n| BasebandId::from_name(&n)),
        mixer: None,
    };
    if let Some(chip) = node.attr_text("mixerChip") {
        update.mixer = Some(MixerConfig {
            chip,
            gain: node.attr_hz("mixerGain").unwrap_or(1.0),
        });
    }
    Some(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::script::parse_script;
    use crate::parse::vci::parse_vci;

    #[test]
    fn script_setups_per_selected_antenna() {
        let parse = parse_script("SUBARRAY A1 ANT1,ANT2\nFREQ LO1=1.000GHz LO2=0.500GHz\n");
        let Extraction { setups, errors } = from_commands(&parse);
        assert!(errors.is_empty());
        assert_eq!(setups.len(), 2);
        for setup in &setups {
            assert_eq!(setup.scan, 1);
            assert_eq!(setup.subarray, "A1");
            assert_eq!(setup.lo1_offset_hz, 1e9);
            assert_eq!(setup.lo2_offset_hz, Some(5e8));
        }
        assert_eq!(setups[0].antenna, "ANT1");
        assert_eq!(setups[1].antenna, "ANT2");
    }

    #[test]
    fn inheritance_is_last_write_wins_per_antenna() {
        let text = "\
SUBARRAY A1 ANT1,ANT2
FREQ LO1=1.0GHz LO2=0.5GHz BAND=Lband
SCAN 2
ANTENNA ANT2
FREQ LO1=1.2GHz
";
        let setups = from_commands(&parse_script(text)).setups;
        // Scan 1: both antennas; scan 2: only ANT2, with LO2/band inherited.
        assert_eq!(setups.len(), 3);
        let s2 = setups
            .iter()
            .find(|s| s.scan == 2 && s.antenna == "ANT2")
            .unwrap();
        assert_eq!(s2.lo1_offset_hz, 1.2e9);
        assert_eq!(s2.lo2_offset_hz, Some(5e8));
        assert_eq!(s2.band.as_deref(), Some("Lband"));
    }

    #[test]
    fn incomplete_setup_is_an_error_not_a_default() {
        // FREQ without LO1 for antennas that never had one.
        let parse = parse_script("SUBARRAY A1 ANT1\nFREQ LO2=0.5GHz\n");
        let extraction = from_commands(&parse);
        assert!(extraction.setups.is_empty());
        assert_eq!(
            extraction.errors,
            vec![ExtractError::IncompleteSetup {
                scan: 1,
                antenna: "ANT1".to_string()
            }]
        );
    }

    #[test]
    fn incomplete_pair_does_not_discard_the_rest() {
        // Scan 2 selects a fresh antenna and never resolves an LO1; the two
        // fully-resolved setups from scan 1 must still come out.
        let text = "\
SUBARRAY A1 ANT1,ANT2
SCAN 1
FREQ LO1=1.0GHz
SCAN 2
ANTENNA ANT3
FREQ LO2=0.5GHz
";
        let Extraction { setups, errors } = from_commands(&parse_script(text));
        assert_eq!(setups.len(), 2);
        assert!(setups.iter().all(|s| s.scan == 1));
        assert_eq!(
            errors,
            vec![ExtractError::IncompleteSetup {
                scan: 2,
                antenna: "ANT3".to_string()
            }]
        );
    }

    #[test]
    fn lo1_supplied_later_in_the_same_scan_completes_the_pair() {
        let text = "SUBARRAY A1 ANT1\nFREQ LO2=0.5GHz\nFREQ LO1=1.0GHz\n";
        let Extraction { setups, errors } = from_commands(&parse_script(text));
        assert_eq!(setups.len(), 1);
        assert_eq!(setups[0].lo1_offset_hz, 1e9);
        assert!(errors.is_empty());
    }

    #[test]
    fn freq_with_no_antenna_context_is_an_error() {
        let parse = parse_script("FREQ LO1=1.0GHz\nSUBARRAY A1 ANT1\nFREQ LO1=2.0GHz\n");
        let Extraction { setups, errors } = from_commands(&parse);
        assert_eq!(errors, vec![ExtractError::NoAntennaSelected { line_num: 1 }]);
        // The later, well-scoped setup still comes out.
        assert_eq!(setups.len(), 1);
        assert_eq!(setups[0].lo1_offset_hz, 2e9);
    }

    #[test]
    fn unknown_commands_do_not_contribute() {
        let text = "SUBARRAY A1 ANT1\nWAIT 30s\nFREQ LO1=2.0GHz\n";
        let setups = from_commands(&parse_script(text)).setups;
        assert_eq!(setups.len(), 1);
        assert_eq!(setups[0].lo1_offset_hz, 2e9);
    }

    #[test]
    fn vci_setups() {
        let doc = r#"<vciRequest>
  <subArray configId="obs_scan1" scanId="101" name="A1">
    <station name="ANT1"/>
    <station name="ANT2"/>
    <stationInputOutput>
      <baseBand swbbName="A0C0" bw="128e6" inQuant="8" lo1Offset="1000000500"/>
    </stationInputOutput>
  </subArray>
</vciRequest>"#;
        let Extraction { setups, errors } = from_vci(&parse_vci(doc).unwrap());
        assert!(errors.is_empty());
        assert_eq!(setups.len(), 2);
        for setup in &setups {
            assert_eq!(setup.scan, 1);
            assert_eq!(setup.lo1_offset_hz, 1_000_000_500.0);
            assert_eq!(setup.baseband, BasebandId::A0C0);
        }
    }

    #[test]
    fn later_duplicate_setup_wins() {
        let text = "\
SUBARRAY A1 ANT1
FREQ LO1=1.0GHz
FREQ LO1=1.1GHz
";
        let setups = from_commands(&parse_script(text)).setups;
        assert_eq!(setups.len(), 1);
        assert_eq!(setups[0].lo1_offset_hz, 1.1e9);
    }

    #[test]
    fn vci_offsets_without_stations_are_reported() {
        let doc = r#"<vciRequest>
  <subArray configId="obs_scan1" scanId="1" name="A1">
    <baseBand swbbName="A0C0" bw="128e6" lo1Offset="1e9"/>
  </subArray>
</vciRequest>"#;
        let Extraction { setups, errors } = from_vci(&parse_vci(doc).unwrap());
        assert!(setups.is_empty());
        assert_eq!(
            errors,
            vec![ExtractError::NoAntennaInScope {
                tag: "baseBand".to_string()
            }]
        );
    }
}
