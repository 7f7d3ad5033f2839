//! Parsing of VCI configuration documents.
//!
//! A VCI document is a nested, attribute-bearing description of the realized
//! hardware setup for one scan. The schema is versioned by the control
//! software, so unknown elements are preserved as opaque nodes rather than
//! rejected. A structurally malformed document (e.g. an unclosed root) is
//! unrecoverable and fails the whole file; element-level problems accumulate
//! in [`VciParse::errors`] while the siblings still parse.

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use roxmltree::Document;
use thiserror::Error;

use super::Value;
use crate::BasebandId;

lazy_static! {
    static ref P_SCAN: Regex = Regex::new(r"_scan(\d+)").unwrap();
}

/// The scan number embedded in a `configId` attribute by the `_scan<N>`
/// naming convention. Trailing text after the number is tolerated.
pub(crate) fn scan_num_from_config_id(config_id: &str) -> Option<u32> {
    P_SCAN.captures(config_id)?[1].parse().ok()
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VciFormatError {
    #[error("malformed VCI document: {0}")]
    Malformed(String),

    #[error("element '{tag}' at line {row}: missing required attribute '{attr}'")]
    MissingAttribute { tag: String, row: u32, attr: &'static str },

    #[error("element '{tag}' at line {row}: attribute '{attr}' is not numeric: '{value}'")]
    BadAttribute {
        tag: String,
        row: u32,
        attr: &'static str,
        value: String,
    },

    #[error("invalid scan name convention: '{0}'")]
    BadConfigId(String),
}

/// One node of the parsed VCI tree. Owns its children exclusively; the
/// extractor traverses it read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationNode {
    /// Element tag name, namespace stripped.
    pub tag: String,

    /// Attributes in document order, values coerced numeric-vs-string.
    pub attrs: Vec<(String, Value)>,

    pub children: Vec<ConfigurationNode>,

    /// Trimmed text content, if any.
    pub text: Option<String>,
}

impl ConfigurationNode {
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attrs
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn attr_hz(&self, name: &str) -> Option<f64> {
        self.attr(name).and_then(Value::as_hz)
    }

    /// The attribute's raw textual form, whatever it was coerced to.
    pub fn attr_text(&self, name: &str) -> Option<String> {
        self.attr(name).map(|v| match v {
            Value::Str(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Frequency(hz) => hz.to_string(),
        })
    }

    pub fn is_tag(&self, tag: &str) -> bool {
        self.tag.eq_ignore_ascii_case(tag)
    }

    pub fn children_tagged<'a>(
        &'a self,
        tag: &str,
    ) -> impl Iterator<Item = &'a ConfigurationNode> + 'a {
        // Own the tag so the returned nodes borrow only from `self`.
        let tag = tag.to_string();
        self.children.iter().filter(move |c| c.is_tag(&tag))
    }

    /// Depth-first search over the whole subtree.
    pub fn descendants_tagged<'a>(
        &'a self,
        tag: &str,
    ) -> Box<dyn Iterator<Item = &'a ConfigurationNode> + 'a> {
        let here_tag = tag.to_string();
        let here = self.children.iter().filter(move |c| c.is_tag(&here_tag));
        let below_tag = tag.to_string();
        let below = self
            .children
            .iter()
            .flat_map(move |c| c.descendants_tagged(&below_tag));
        Box::new(here.chain(below))
    }

    pub fn find(&self, tag: &str) -> Option<&ConfigurationNode> {
        self.descendants_tagged(tag).next()
    }
}

/// The result of parsing one VCI document: the owned tree plus accumulated
/// element-level errors.
#[derive(Debug, Clone, PartialEq)]
pub struct VciParse {
    pub root: ConfigurationNode,
    pub errors: Vec<VciFormatError>,
}

impl VciParse {
    /// The scan id recorded on the first `subArray` element.
    pub fn scan_id(&self) -> Option<i64> {
        let subarray = self.root.find("subArray")?;
        subarray.attr_hz("scanId").map(|v| v as i64)
    }

    /// The scan number, recovered from the `configId` attribute's trailing
    /// `_scan<N>` convention.
    pub fn scan_num(&self) -> Result<u32, VciFormatError> {
        let config_id = self
            .root
            .find("subArray")
            .and_then(|s| s.attr_text("configId"))
            .ok_or_else(|| VciFormatError::BadConfigId(String::new()))?;
        scan_num_from_config_id(&config_id)
            .ok_or(VciFormatError::BadConfigId(config_id))
    }

    /// Views onto every `baseBand` element in the document.
    pub fn basebands(&self) -> impl Iterator<Item = BasebandView<'_>> {
        self.root
            .descendants_tagged("baseBand")
            .map(BasebandView)
    }
}

/// Parse raw VCI content into an owned tree. Only a structural failure of
/// the document itself is an `Err`; element-level problems come back in
/// [`VciParse::errors`].
pub fn parse_vci(text: &str) -> Result<VciParse, VciFormatError> {
    let doc = Document::parse(text).map_err(|e| VciFormatError::Malformed(e.to_string()))?;
    let mut errors = vec![];
    let root = convert(&doc, doc.root_element(), &mut errors);
    debug!(
        "parsed VCI root '{}' with {} element errors",
        root.tag,
        errors.len()
    );
    Ok(VciParse { root, errors })
}

fn convert(
    doc: &Document,
    node: roxmltree::Node,
    errors: &mut Vec<VciFormatError>,
) -> ConfigurationNode {
    let tag = node.tag_name().name().to_string();
    let attrs: Vec<(String, Value)> = node
        .attributes()
        .map(|a| (a.name().to_string(), Value::coerce(a.value())))
        .collect();
    let children: Vec<ConfigurationNode> = node
        .children()
        .filter(|c| c.is_element())
        .map(|c| convert(doc, c, errors))
        .collect();
    let text = node
        .children()
        .filter_map(|c| c.text())
        .map(str::trim)
        .find(|t| !t.is_empty())
        .map(str::to_string);

    let converted = ConfigurationNode {
        tag,
        attrs,
        children,
        text,
    };
    check_known(doc, node, &converted, errors);
    converted
}

/// Required attributes on the element types the extractor understands.
/// Unknown tags are deliberately left unchecked.
fn check_known(
    doc: &Document,
    node: roxmltree::Node,
    converted: &ConfigurationNode,
    errors: &mut Vec<VciFormatError>,
) {
    let row = doc.text_pos_at(node.range().start).row;
    let required: &[(&str, bool)] = match converted.tag.to_ascii_lowercase().as_str() {
        // (attribute, must be numeric)
        "subarray" => &[("configId", false), ("scanId", true)],
        "baseband" => &[("bw", true)],
        "subband" => &[("centralFreq", true), ("bw", true)],
        _ => return,
    };
    for &(attr, numeric) in required {
        match converted.attr(attr) {
            None => errors.push(VciFormatError::MissingAttribute {
                tag: converted.tag.clone(),
                row,
                attr,
            }),
            Some(v) if numeric && v.as_hz().is_none() => {
                errors.push(VciFormatError::BadAttribute {
                    tag: converted.tag.clone(),
                    row,
                    attr,
                    value: converted.attr_text(attr).unwrap_or_default(),
                })
            }
            Some(_) => (),
        }
    }
}

/// Read-only view over a `baseBand` element.
#[derive(Debug, Clone, Copy)]
pub struct BasebandView<'a>(pub &'a ConfigurationNode);

impl<'a> BasebandView<'a> {
    pub fn name(&self) -> Option<String> {
        self.0.attr_text("name")
    }

    pub fn swbb_name(&self) -> Option<String> {
        self.0.attr_text("swbbName")
    }

    pub fn baseband_id(&self) -> Option<BasebandId> {
        self.swbb_name()
            .or_else(|| self.name())
            .and_then(|n| BasebandId::from_name(&n))
    }

    /// Sampler input quantization (bits).
    pub fn in_quant(&self) -> Option<i64> {
        self.0.attr_hz("inQuant").map(|v| v as i64)
    }

    pub fn is_8bit(&self) -> bool {
        self.in_quant() == Some(8)
    }

    pub fn is_3bit(&self) -> bool {
        self.in_quant() == Some(3)
    }

    /// Baseband bandwidth \[Hz\].
    pub fn bw_hz(&self) -> Option<f64> {
        self.0.attr_hz("bw")
    }

    pub fn bb_pair(&self) -> Option<(i64, i64)> {
        let a = self.0.attr_hz("bbA")? as i64;
        let b = self.0.attr_hz("bbB")? as i64;
        Some((a, b))
    }

    pub fn subbands(&self) -> impl Iterator<Item = SubbandView<'a>> + '_ {
        let baseband = *self;
        self.0
            .children_tagged("subBand")
            .map(move |node| SubbandView { node, baseband })
    }
}

/// Read-only view over a `subBand` element, with its parent baseband kept
/// alongside since several derived quantities need both.
#[derive(Debug, Clone, Copy)]
pub struct SubbandView<'a> {
    pub node: &'a ConfigurationNode,
    pub baseband: BasebandView<'a>,
}

impl SubbandView<'_> {
    /// Sub-band bandwidth \[Hz\].
    pub fn bw_hz(&self) -> Option<f64> {
        self.node.attr_hz("bw")
    }

    /// Sub-band center frequency within the baseband \[Hz\].
    pub fn central_freq_hz(&self) -> Option<f64> {
        self.node.attr_hz("centralFreq")
    }

    pub fn sw_index(&self) -> Option<i64> {
        self.node.attr_hz("swIndex").map(|v| v as i64)
    }

    pub fn sbid(&self) -> Option<i64> {
        self.node.attr_hz("sbid").map(|v| v as i64)
    }

    /// Number of polarization products.
    pub fn npol(&self) -> usize {
        match self.node.find("polProducts") {
            Some(pp) => pp.children_tagged("pp").count().max(1),
            None => 1,
        }
    }

    /// Spectral channel count of the first polarization product, or -1 when
    /// no product is present (mirroring how absent products are recorded in
    /// the archive's summary tables).
    pub fn nchan(&self) -> i64 {
        self.node
            .find("pp")
            .and_then(|pp| pp.attr_hz("spectralChannels"))
            .map(|v| v as i64)
            .unwrap_or(-1)
    }

    fn blb_integration(&self) -> Option<&ConfigurationNode> {
        self.node.find("blbProdIntegration")
    }

    pub fn recirculation(&self) -> i64 {
        self.blb_integration()
            .and_then(|n| n.attr_hz("recirculation"))
            .map(|v| v as i64)
            .unwrap_or(1)
    }

    /// Minimum hardware integration time \[s\] (recorded in µs).
    pub fn min_integ_time_s(&self) -> Option<f64> {
        self.blb_integration()
            .and_then(|n| n.attr_hz("minIntegTime"))
            .map(|us| us * 1e-6)
    }

    /// The cc/lta/cbe integration factors, each defaulting to 1 when absent.
    pub fn integ_factors(&self) -> (i64, i64, i64) {
        let get = |attr: &str| {
            self.blb_integration()
                .and_then(|n| n.attr_hz(attr))
                .map(|v| v as i64)
                .unwrap_or(1)
        };
        (
            get("ccIntegFactor"),
            get("ltaIntegFactor"),
            get("cbeIntegFactor"),
        )
    }

    /// Total integration time \[s\]: the hardware minimum scaled by
    /// recirculation and the correlator back-end factors.
    pub fn integration_time_s(&self) -> Option<f64> {
        let (cc, lta, cbe) = self.integ_factors();
        let factor = (self.recirculation() * cc * lta * cbe) as f64;
        self.min_integ_time_s().map(|t| t * factor)
    }

    /// Sampling frequency \[Hz\]: twice the sub-band bandwidth.
    pub fn freq_samp_hz(&self) -> Option<f64> {
        self.bw_hz().map(|bw| 2.0 * bw)
    }

    /// Observed sky frequency \[Hz\] of this sub-band: the offset of the
    /// sub-band's center from the start of the baseband passband. Needs the
    /// baseband to record its own center frequency.
    pub fn sky_freq_hz(&self) -> Option<f64> {
        let bb_center = self.baseband.0.attr_hz("centerFreq")?;
        let bb_bw = self.baseband.bw_hz()?;
        let sb_offset = self.central_freq_hz()?;
        Some(bb_center - bb_bw / 2.0 + sb_offset)
    }

    /// The optimum f-shift \[Hz\] for this sub-band:
    /// `1.25/π · sqrt(f_samp / τ)`.
    pub fn freq_opt_hz(&self) -> Option<f64> {
        let f_samp = self.freq_samp_hz()?;
        let tau = self.integration_time_s()?;
        Some(1.25 / std::f64::consts::PI * (f_samp / tau).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0"?>
<vciRequest>
  <subArray configId="obs_scan3" scanId="301">
    <station name="ANT1"/>
    <station name="ANT2"/>
    <stationInputOutput>
      <baseBand name="A0/C0" swbbName="A0C0" bw="128e6" inQuant="8" bbA="0" bbB="1" lo1Offset="1000000500">
        <subBand centralFreq="64e6" bw="32e6" swIndex="1" sbid="0">
          <polProducts>
            <pp spectralChannels="64"/>
            <pp spectralChannels="64"/>
            <blbProdIntegration recirculation="1" minIntegTime="1000000" ltaIntegFactor="2"/>
          </polProducts>
        </subBand>
      </baseBand>
    </stationInputOutput>
  </subArray>
</vciRequest>
"#;

    #[test]
    fn reparse_is_deterministic() {
        let a = parse_vci(DOC).unwrap();
        let b = parse_vci(DOC).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tree_shape_and_scan_identity() {
        let parse = parse_vci(DOC).unwrap();
        assert!(parse.errors.is_empty());
        assert_eq!(parse.root.tag, "vciRequest");
        assert_eq!(parse.scan_id(), Some(301));
        assert_eq!(parse.scan_num().unwrap(), 3);
    }

    #[test]
    fn baseband_and_subband_views() {
        let parse = parse_vci(DOC).unwrap();
        let bb = parse.basebands().next().unwrap();
        assert!(bb.is_8bit());
        assert_eq!(bb.baseband_id(), Some(BasebandId::A0C0));
        assert_eq!(bb.bw_hz(), Some(128e6));
        assert_eq!(bb.bb_pair(), Some((0, 1)));

        let sb = bb.subbands().next().unwrap();
        assert_eq!(sb.central_freq_hz(), Some(64e6));
        assert_eq!(sb.npol(), 2);
        assert_eq!(sb.nchan(), 64);
        assert_eq!(sb.recirculation(), 1);
        assert_eq!(sb.min_integ_time_s(), Some(1.0));
        assert_eq!(sb.integ_factors(), (1, 2, 1));
        assert_eq!(sb.integration_time_s(), Some(2.0));
        assert_eq!(sb.freq_samp_hz(), Some(64e6));
        let f_opt = sb.freq_opt_hz().unwrap();
        let expect = 1.25 / std::f64::consts::PI * (64e6_f64 / 2.0).sqrt();
        assert!((f_opt - expect).abs() < 1e-9);
    }

    #[test]
    fn unknown_elements_are_preserved() {
        let doc = r#"<vciRequest><futureWidget mode="x"><inner/></futureWidget></vciRequest>"#;
        let parse = parse_vci(doc).unwrap();
        let widget = parse.root.find("futureWidget").unwrap();
        assert_eq!(widget.attr_text("mode").as_deref(), Some("x"));
        assert_eq!(widget.children.len(), 1);
        assert!(parse.errors.is_empty());
    }

    #[test]
    fn structural_failure_is_fatal() {
        assert!(matches!(
            parse_vci("<vciRequest><subArray>"),
            Err(VciFormatError::Malformed(_))
        ));
    }

    #[test]
    fn element_errors_accumulate_per_sibling() {
        let doc = r#"<vciRequest>
  <subArray configId="obs_scan1" scanId="not-a-number"/>
  <subArray configId="obs_scan2" scanId="2"/>
</vciRequest>"#;
        let parse = parse_vci(doc).unwrap();
        assert_eq!(parse.errors.len(), 1);
        assert!(matches!(
            &parse.errors[0],
            VciFormatError::BadAttribute { tag, attr: "scanId", .. } if tag == "subArray"
        ));
        // The healthy sibling still parsed.
        assert_eq!(parse.root.children_tagged("subArray").count(), 2);
    }

    #[test]
    fn find_result_outlives_the_tag_string() {
        let parse = parse_vci(DOC).unwrap();
        let node = {
            let tag = String::from("subArray");
            parse.root.find(&tag)
        };
        // The returned node borrows the tree, not the tag.
        assert!(node.is_some());
        assert_eq!(node.unwrap().attr_text("scanId").as_deref(), Some("301"));
    }

    #[test]
    fn config_id_with_trailing_text_still_names_the_scan() {
        let doc = r#"<vciRequest><subArray configId="obs_scan4_retry" scanId="4"/></vciRequest>"#;
        let parse = parse_vci(doc).unwrap();
        assert_eq!(parse.scan_num().unwrap(), 4);
        assert_eq!(scan_num_from_config_id("obs_scan12_backup"), Some(12));
        assert_eq!(scan_num_from_config_id("no_convention_here"), None);
    }

    #[test]
    fn self_closing_elements() {
        let doc = r#"<vciRequest><subArray configId="c_scan1" scanId="1"/></vciRequest>"#;
        let parse = parse_vci(doc).unwrap();
        assert_eq!(parse.scan_num().unwrap(), 1);
    }
}
