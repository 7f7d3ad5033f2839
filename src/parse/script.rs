//! Parsing of line-oriented observing scripts.
//!
//! The script grammar has drifted over the years of the archive, so parsing
//! is tolerant rather than exact: comment and blank lines are skipped,
//! unrecognized command names are retained as [`CommandKind::Unknown`], and a
//! malformed line is recorded as a [`ScriptSyntaxError`] without aborting the
//! rest of the file.

use hifitime::Epoch;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use thiserror::Error;

use super::Value;

lazy_static! {
    static ref P_PROJECT: Regex =
        Regex::new(r"(?m)^#\s+(?:EVLA )?PROJECT (.+?), DB ID (\d+)\s*$").unwrap();
    static ref P_MJD: Regex =
        Regex::new(r"Assumed Script Start:.*MJD ([\d.]+)\)").unwrap();
    static ref P_ARRAY_CONF: Regex =
        Regex::new(r"(?m)^#\s+Array Configurations: (.+?)\s*$").unwrap();
}

/// Maximum baseline length \[m\] for each array configuration.
const CONFIG_MAX_BASELINES: [(char, f64); 4] = [
    ('A', 36_400.0),
    ('B', 11_100.0),
    ('C', 3_400.0),
    ('D', 1_030.0),
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScriptSyntaxError {
    #[error("line {line_num}: unrecognized token '{token}'")]
    BadToken { line_num: u32, token: String },

    #[error("line {line_num}: {command} command is missing its {what}")]
    MissingArgument {
        line_num: u32,
        command: &'static str,
        what: &'static str,
    },
}

/// A parsed script directive. Immutable once parsed; the extractor consumes
/// these in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    /// Positional and named arguments, in the order written.
    pub args: Vec<Arg>,
    /// 1-based source line, for error reporting.
    pub line_num: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// `FREQ LO1=.. [LO2=..] [BAND=..] [BASEBAND=..] [MIXER=..]`
    Freq,
    /// `SCAN <num> [source]`
    Scan,
    /// `SUBARRAY <name> <ant,...>`
    Subarray,
    /// `ANTENNA <ant,...>`
    Antenna,
    /// `SOURCE <name>`
    Source,
    /// Anything else, retained verbatim so historical format drift does not
    /// abort the parse. Never contributes to the frequency model.
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Value,
}

impl Arg {
    fn positional(value: Value) -> Arg {
        Arg { name: None, value }
    }

    fn named(name: &str, value: Value) -> Arg {
        Arg {
            name: Some(name.to_string()),
            value,
        }
    }
}

/// Metadata recovered from the script's header comments. All of it is
/// optional; older files in the archive do not carry every header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptHeader {
    /// Project code, e.g. `13B-014`.
    pub project_code: Option<String>,

    /// Scheduling-database id of the scheduling block.
    pub db_id: Option<u64>,

    /// Assumed script start epoch, from the header's MJD.
    pub start: Option<Epoch>,

    /// The longest-baseline array configuration among those the script was
    /// scheduled for (`A`..`D`).
    pub max_config: Option<char>,
}

impl ScriptHeader {
    /// Maximum baseline length \[m\] implied by the array configuration.
    pub fn max_baseline_m(&self) -> Option<f64> {
        let config = self.max_config?;
        CONFIG_MAX_BASELINES
            .iter()
            .find(|(c, _)| *c == config)
            .map(|(_, b)| *b)
    }
}

/// The result of parsing one script: the ordered command sequence plus every
/// line-level error encountered along the way. A syntactically broken line
/// never aborts the remainder of the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptParse {
    pub header: ScriptHeader,
    pub commands: Vec<Command>,
    pub errors: Vec<ScriptSyntaxError>,
}

/// Parse raw script text. Pure: all diagnostics come back in the
/// [`ScriptParse`], nothing is printed.
pub fn parse_script(text: &str) -> ScriptParse {
    let header = parse_header(text);
    let mut commands = vec![];
    let mut errors = vec![];

    for (i, line) in text.lines().enumerate() {
        let line_num = (i + 1) as u32;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_line(trimmed, line_num) {
            Ok(command) => commands.push(command),
            Err(e) => errors.push(e),
        }
    }

    debug!(
        "parsed {} commands, {} errors",
        commands.len(),
        errors.len()
    );
    ScriptParse {
        header,
        commands,
        errors,
    }
}

fn parse_header(text: &str) -> ScriptHeader {
    let mut header = ScriptHeader::default();
    if let Some(caps) = P_PROJECT.captures(text) {
        header.project_code = Some(caps[1].to_string());
        header.db_id = caps[2].parse().ok();
    }
    if let Some(caps) = P_MJD.captures(text) {
        if let Ok(mjd) = caps[1].parse::<f64>() {
            header.start = Some(Epoch::from_mjd_utc(mjd));
        }
    }
    if let Some(caps) = P_ARRAY_CONF.captures(text) {
        header.max_config = max_config(&caps[1]);
    }
    header
}

/// Reduce a comma-separated list of array configuration codes to the one with
/// the longest baseline. A move configuration like `C=>CNB` reduces to its
/// alphabetically-least letter (`B` here, because `N` sorts after `D`);
/// `Any` reduces to `A` the same way.
fn max_config(group: &str) -> Option<char> {
    group
        .split(',')
        .filter_map(|part| part.chars().filter(char::is_ascii_uppercase).min())
        .min()
}

fn parse_line(line: &str, line_num: u32) -> Result<Command, ScriptSyntaxError> {
    let mut tokens = line.split_ascii_whitespace();
    let name = tokens
        .next()
        .expect("line is non-empty, checked by caller");
    let rest: Vec<&str> = tokens.collect();

    let missing = |command, what| ScriptSyntaxError::MissingArgument {
        line_num,
        command,
        what,
    };

    match name.to_ascii_uppercase().as_str() {
        "FREQ" => {
            let mut args = vec![];
            for token in &rest {
                let (arg_name, raw) =
                    token
                        .split_once('=')
                        .ok_or_else(|| ScriptSyntaxError::BadToken {
                            line_num,
                            token: token.to_string(),
                        })?;
                let value = Value::coerce(raw);
                // LO offsets must be numeric.
                if matches!(arg_name.to_ascii_uppercase().as_str(), "LO1" | "LO2")
                    && value.as_hz().is_none()
                {
                    return Err(ScriptSyntaxError::BadToken {
                        line_num,
                        token: token.to_string(),
                    });
                }
                args.push(Arg::named(&arg_name.to_ascii_uppercase(), value));
            }
            Ok(Command {
                kind: CommandKind::Freq,
                args,
                line_num,
            })
        }

        "SCAN" => {
            let num = rest.first().ok_or_else(|| missing("SCAN", "scan number"))?;
            let num: u32 = num.parse().map_err(|_| ScriptSyntaxError::BadToken {
                line_num,
                token: num.to_string(),
            })?;
            let mut args = vec![Arg::positional(Value::Number(f64::from(num)))];
            if let Some(source) = rest.get(1) {
                args.push(Arg::positional(Value::Str(source.to_string())));
            }
            Ok(Command {
                kind: CommandKind::Scan,
                args,
                line_num,
            })
        }

        "SUBARRAY" => {
            let name = rest
                .first()
                .ok_or_else(|| missing("SUBARRAY", "subarray name"))?;
            let ants = rest
                .get(1)
                .ok_or_else(|| missing("SUBARRAY", "antenna list"))?;
            let mut args = vec![Arg::positional(Value::Str(name.to_string()))];
            args.extend(antenna_list(ants));
            Ok(Command {
                kind: CommandKind::Subarray,
                args,
                line_num,
            })
        }

        "ANTENNA" => {
            let ants = rest
                .first()
                .ok_or_else(|| missing("ANTENNA", "antenna list"))?;
            Ok(Command {
                kind: CommandKind::Antenna,
                args: antenna_list(ants).collect(),
                line_num,
            })
        }

        "SOURCE" => {
            let source = rest
                .first()
                .ok_or_else(|| missing("SOURCE", "source name"))?;
            Ok(Command {
                kind: CommandKind::Source,
                args: vec![Arg::positional(Value::Str(source.to_string()))],
                line_num,
            })
        }

        _ => Ok(Command {
            kind: CommandKind::Unknown(line.to_string()),
            args: rest.iter().map(|t| Arg::positional(Value::coerce(t))).collect(),
            line_num,
        }),
    }
}

fn antenna_list(token: &str) -> impl Iterator<Item = Arg> + '_ {
    token
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|ant| Arg::positional(Value::Str(ant.to_string())))
}
