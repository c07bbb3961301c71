use chrono::{NaiveDateTime, SubsecRound};
use regex::{Captures, Regex};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;

use super::context::ParserContext;
use super::event::{build_repair_event, Direction, RepairEvent, RepairKind, RepairMatch};
use super::tailer::decode_line;
use crate::clock::Clock;

const LOG_TIMESTAMP_FORMAT: &str = "%Y.%m.%d %H:%M:%S";

/// How many trailing lines bulk reprocessing looks at by default.
pub const DEFAULT_REPROCESS_LINES: usize = 100;

const SYSTEM_CONTEXT_PATTERN: &str =
    r"(?i)Listener: (?P<system>.+?) \((?P<security>-?\d+\.\d+)\)";
const OUTGOING_REPAIR_PATTERN: &str = r"(?i)\[ (?P<timestamp>\d{4}\.\d{2}\.\d{2} \d{2}:\d{2}:\d{2}) \] \(combat\) (?P<actor>.+?) remotely repairs (?P<amount>\d+) (?P<kind>shield|armor) damage to (?P<target>.+?) - (?P<module>.+?) - (?P<system>.+?)$";
const INCOMING_REPAIR_PATTERN: &str = r"(?i)\[ (?P<timestamp>\d{4}\.\d{2}\.\d{2} \d{2}:\d{2}:\d{2}) \] \(combat\) (?P<actor>.+?) remotely repairs (?P<amount>\d+) (?P<kind>shield|armor) damage to you - (?P<module>.+?) - (?P<system>.+?)$";
const SELF_REPAIR_PATTERN: &str = r"(?i)\[ (?P<timestamp>\d{4}\.\d{2}\.\d{2} \d{2}:\d{2}:\d{2}) \] \(combat\) Your (?P<module>.+?) repairs (?P<amount>\d+) (?P<kind>shield|armor) damage$";

/// The recognized line shapes, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineShape {
    SystemContext,
    OutgoingRepair,
    IncomingRepair,
    SelfRepair,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineMatch {
    SystemContext { system: String, security: String },
    Repair(RepairMatch),
}

type Extractor = fn(&Captures<'_>, &dyn Clock) -> Option<LineMatch>;

struct ShapeMatcher {
    shape: LineShape,
    pattern: Regex,
    extract: Extractor,
}

lazy_static::lazy_static! {
    static ref LINE_SHAPES: Vec<ShapeMatcher> = vec![
        shape_matcher(LineShape::SystemContext, SYSTEM_CONTEXT_PATTERN, extract_system_context),
        shape_matcher(LineShape::OutgoingRepair, OUTGOING_REPAIR_PATTERN, extract_outgoing_repair),
        shape_matcher(LineShape::IncomingRepair, INCOMING_REPAIR_PATTERN, extract_incoming_repair),
        shape_matcher(LineShape::SelfRepair, SELF_REPAIR_PATTERN, extract_self_repair),
    ];
}

fn shape_matcher(shape: LineShape, pattern: &str, extract: Extractor) -> ShapeMatcher {
    ShapeMatcher {
        shape,
        pattern: Regex::new(pattern).expect("line shape pattern is valid"),
        extract,
    }
}

/// Classifies one line. First matching shape wins; `None` means the line is
/// not interesting.
pub fn classify_line(line: &str, clock: &dyn Clock) -> Option<(LineShape, LineMatch)> {
    let trimmed_line = line.trim_end();
    if trimmed_line.trim_start().is_empty() {
        return None;
    }

    LINE_SHAPES.iter().find_map(|matcher| {
        let captures = matcher.pattern.captures(trimmed_line)?;
        (matcher.extract)(&captures, clock).map(|line_match| (matcher.shape, line_match))
    })
}

/// Parses one line, updating `context` on system lines.
pub fn parse_line(
    line: &str,
    context: &mut ParserContext,
    clock: &dyn Clock,
) -> Option<RepairEvent> {
    match classify_line(line, clock)?.1 {
        LineMatch::SystemContext { system, security } => {
            context.observe_system(&system, &security);
            None
        }
        LineMatch::Repair(repair) => Some(build_repair_event(repair, context)),
    }
}

/// Parses a batch of raw lines in order and returns the repair events found.
pub fn parse_lines<I, S>(
    lines: I,
    context: &mut ParserContext,
    clock: &dyn Clock,
) -> Vec<RepairEvent>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| parse_line(line.as_ref(), context, clock))
        .collect()
}

/// Reparses the last `max_lines` lines of a log file, trailing partial line
/// included. A missing file yields no events.
pub fn parse_log_file(
    path: &Path,
    context: &mut ParserContext,
    clock: &dyn Clock,
    max_lines: usize,
) -> std::io::Result<Vec<RepairEvent>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error),
    };
    if max_lines == 0 {
        return Ok(Vec::new());
    }

    let mut reader = BufReader::new(file);
    let mut buffer = Vec::new();
    let mut recent_lines = VecDeque::with_capacity(max_lines.min(DEFAULT_REPROCESS_LINES));

    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer)? == 0 {
            break;
        }

        if recent_lines.len() == max_lines {
            recent_lines.pop_front();
        }
        recent_lines.push_back(decode_line(&buffer));
    }

    tracing::debug!(
        path = %path.display(),
        lines = recent_lines.len(),
        "Reprocessing combat log tail"
    );
    Ok(parse_lines(recent_lines, context, clock))
}

fn extract_system_context(captures: &Captures<'_>, _clock: &dyn Clock) -> Option<LineMatch> {
    Some(LineMatch::SystemContext {
        system: captures.name("system")?.as_str().trim().to_string(),
        security: captures.name("security")?.as_str().to_string(),
    })
}

fn extract_outgoing_repair(captures: &Captures<'_>, clock: &dyn Clock) -> Option<LineMatch> {
    let target = captures.name("target")?.as_str();
    if target.eq_ignore_ascii_case("you") {
        return None;
    }

    extract_remote_repair(captures, clock, Direction::Outgoing, target)
}

fn extract_incoming_repair(captures: &Captures<'_>, clock: &dyn Clock) -> Option<LineMatch> {
    let actor = captures.name("actor")?.as_str();
    extract_remote_repair(captures, clock, Direction::Incoming, actor)
}

fn extract_remote_repair(
    captures: &Captures<'_>,
    clock: &dyn Clock,
    direction: Direction,
    counterpart: &str,
) -> Option<LineMatch> {
    Some(LineMatch::Repair(RepairMatch {
        timestamp: extract_timestamp(captures, clock),
        direction,
        kind: RepairKind::from_keyword(captures.name("kind")?.as_str())?,
        amount: captures.name("amount")?.as_str().parse().ok()?,
        counterpart: Some(counterpart.trim().to_string()),
        module: captures.name("module")?.as_str().trim().to_string(),
        system: captures
            .name("system")
            .map(|value| value.as_str().trim().to_string())
            .filter(|value| !value.is_empty()),
    }))
}

fn extract_self_repair(captures: &Captures<'_>, clock: &dyn Clock) -> Option<LineMatch> {
    Some(LineMatch::Repair(RepairMatch {
        timestamp: extract_timestamp(captures, clock),
        direction: Direction::SelfRepair,
        kind: RepairKind::from_keyword(captures.name("kind")?.as_str())?,
        amount: captures.name("amount")?.as_str().parse().ok()?,
        counterpart: None,
        module: captures.name("module")?.as_str().trim().to_string(),
        system: None,
    }))
}

/// Falls back to the clock, cut to whole seconds, when the stamp has the
/// right shape but is not a real date (e.g. month 13).
fn extract_timestamp(captures: &Captures<'_>, clock: &dyn Clock) -> NaiveDateTime {
    captures
        .name("timestamp")
        .and_then(|value| parse_log_timestamp(value.as_str()))
        .unwrap_or_else(|| clock.now().naive_utc().trunc_subsecs(0))
}

pub fn parse_log_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), LOG_TIMESTAMP_FORMAT).ok()
}
