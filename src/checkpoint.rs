//! Checkpoint logs and resume detection.
//!
//! Three plain-text logs make a calculation resumable:
//!
//! - **Discovery log** (`<family>/states_log.txt`): every discovered
//!   quantum-number triple, then `ListEnd`, then one section per attempted
//!   cycle. A section starts with `First Cycle Last Calculated:` (or
//!   `Second`, `Third`, `Fourth`) and receives the triple of the last job of
//!   every finished sub-batch. `CalculationFinalized` closes the log.
//! - **Sorted log** (`<family>/states_sorted.txt`): one line per state in
//!   ascending total energy,
//!   `i, jj, eigv; higherConfig, percent, overlap, accuracy, energyDiff, totalEnergy`.
//!   It is complete when it has as many lines as the discovery list.
//! - **Transition log** (`transitions/<class>/transitions_log.txt`):
//!   `Calculated transitions:`, one `initial => final` line per finished
//!   sub-batch, then `Finished <Class> Transitions`.
//!
//! Resume detection reads the logs of every family and transition class of a
//! run and combines them into one [`ResumeDecision`]. The combination always
//! picks the narrowest corrective action: a family whose log claims to be
//! finalized but fails the cross-check resumes from its last cycle marker, a
//! family with a short sorted log is resorted, and each transition class
//! resumes on its own.

use crate::config::{Config, Family, TransitionClass, MAX_CYCLES};
use crate::naming::FileNaming;
use crate::state::{format_pair, parse_pair, ConvergenceParams, QuantumNumbers, State};
use log::debug;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Ends the discovery list.
pub const LIST_END: &str = "ListEnd";
/// Closes a discovery log after the last cycle.
pub const FINALIZED: &str = "CalculationFinalized";
/// First line of a transition log.
pub const TRANSITIONS_HEADER: &str = "Calculated transitions:";

const CYCLE_NAMES: [&str; MAX_CYCLES as usize] = ["First", "Second", "Third", "Fourth"];

/// Errors raised while reading or writing checkpoint logs.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// A log could not be read or written
    #[error("IO error on {path}: {source}")]
    Io {
        /// Log file
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// A log line could not be parsed
    #[error("Malformed checkpoint {path} line {line}: {message}")]
    Malformed {
        /// Log file
        path: PathBuf,
        /// 1-based line number
        line: usize,
        /// What was wrong with the line
        message: String,
    },
    /// A combination of logs no run can produce
    #[error("Unexpected combination of checkpoint files: {0}")]
    UnexpectedCombination(String),
}

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Marker line opening the section of `cycle` (1-based).
pub fn cycle_marker(cycle: u8) -> String {
    let name = CYCLE_NAMES
        .get(usize::from(cycle.saturating_sub(1)))
        .copied()
        .unwrap_or("Unknown");
    format!("{} Cycle Last Calculated:", name)
}

fn parse_cycle_marker(line: &str) -> Option<u8> {
    (1..=MAX_CYCLES).find(|&c| line == cycle_marker(c))
}

/// Marker line closing the transition log of `class`.
pub fn transitions_finished(class: TransitionClass) -> String {
    format!("Finished {} Transitions", class)
}

/// Appends one line to a log, creating it when needed.
pub fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

/// Reads a log, `None` when it does not exist.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path).map(Some).map_err(io_error(path))
}

fn write_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    fs::write(path, text).map_err(io_error(path))
}

fn append(path: &Path, line: &str) -> Result<()> {
    append_line(path, line).map_err(io_error(path))
}

// Discovery log

/// Sub-batch markers recorded under one cycle header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSection {
    /// Cycle number, 1 to 4
    pub cycle: u8,
    /// Last job reached in this cycle, `None` before the first sub-batch ended
    pub last: Option<QuantumNumbers>,
}

/// Parsed discovery log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryLog {
    /// Discovered triples in enumeration order
    pub states: Vec<QuantumNumbers>,
    /// The end-of-list marker was found
    pub list_ended: bool,
    /// Cycle sections in file order
    pub sections: Vec<CycleSection>,
    /// The finalized marker was found
    pub finalized: bool,
}

impl DiscoveryLog {
    /// Parses the text of a discovery log.
    ///
    /// The returned error carries the 1-based line number and a message.
    pub fn parse(text: &str) -> std::result::Result<Self, (usize, String)> {
        let mut log = DiscoveryLog::default();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if log.finalized {
                return Err((index + 1, format!("'{}' after {}", line, FINALIZED)));
            }
            if !log.list_ended {
                if line == LIST_END {
                    log.list_ended = true;
                } else {
                    let qn = line.parse().map_err(|e| (index + 1, e))?;
                    log.states.push(qn);
                }
                continue;
            }
            if line == FINALIZED {
                log.finalized = true;
            } else if let Some(cycle) = parse_cycle_marker(line) {
                let previous = log.sections.last().map_or(0, |s| s.cycle);
                if cycle <= previous {
                    return Err((
                        index + 1,
                        format!("cycle {} section after cycle {}", cycle, previous),
                    ));
                }
                log.sections.push(CycleSection { cycle, last: None });
            } else {
                let qn = line.parse().map_err(|e| (index + 1, e))?;
                match log.sections.last_mut() {
                    Some(section) => section.last = Some(qn),
                    None => {
                        return Err((index + 1, format!("'{}' outside a cycle section", line)))
                    }
                }
            }
        }
        Ok(log)
    }

    /// Renders the log back to text.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for qn in &self.states {
            text.push_str(&format!("{}\n", qn));
        }
        if self.list_ended {
            text.push_str(LIST_END);
            text.push('\n');
        }
        for section in &self.sections {
            text.push_str(&cycle_marker(section.cycle));
            text.push('\n');
            if let Some(last) = section.last {
                text.push_str(&format!("{}\n", last));
            }
        }
        if self.finalized {
            text.push_str(FINALIZED);
            text.push('\n');
        }
        text
    }

    /// Drops every section after `cycle` and the finalized marker.
    pub fn truncate_to(&mut self, cycle: u8) {
        self.sections.retain(|s| s.cycle <= cycle);
        self.finalized = false;
    }
}

/// Reads and parses a discovery log.
pub fn read_discovery(path: &Path) -> Result<Option<DiscoveryLog>> {
    match read_optional(path)? {
        None => Ok(None),
        Some(text) => DiscoveryLog::parse(&text)
            .map(Some)
            .map_err(|(line, message)| CheckpointError::Malformed {
                path: path.to_path_buf(),
                line,
                message,
            }),
    }
}

/// Writes a fresh discovery log: every triple followed by `ListEnd`.
pub fn write_discovery(path: &Path, states: &[QuantumNumbers]) -> Result<()> {
    let log = DiscoveryLog {
        states: states.to_vec(),
        list_ended: true,
        ..DiscoveryLog::default()
    };
    write_text(path, &log.to_text())
}

/// Opens the section of `cycle`.
pub fn write_cycle_header(path: &Path, cycle: u8) -> Result<()> {
    append(path, &cycle_marker(cycle))
}

/// Closes a discovery log.
pub fn write_finalized(path: &Path) -> Result<()> {
    append(path, FINALIZED)
}

/// Keeps a discovery log up to the section being resumed.
pub fn rewrite_discovery(path: &Path, log: &DiscoveryLog) -> Result<()> {
    write_text(path, &log.to_text())
}

/// Where a state family stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FamilyResume {
    /// No discovery log
    Fresh,
    /// The discovery list is incomplete or disagrees with the enumeration
    RedoDiscovery,
    /// Discovery complete, no cycle started
    StartCycles,
    /// Continue `cycle` after `last` (from its first job when `None`)
    ResumeCycle {
        /// Cycle to continue
        cycle: u8,
        /// Last job checkpointed in that cycle
        last: Option<QuantumNumbers>,
    },
    /// Every cycle done
    Finalized,
}

impl fmt::Display for FamilyResume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FamilyResume::Fresh => write!(f, "fresh"),
            FamilyResume::RedoDiscovery => write!(f, "redo discovery"),
            FamilyResume::StartCycles => write!(f, "start cycles"),
            FamilyResume::ResumeCycle { cycle, last: None } => {
                write!(f, "resume cycle {} from its first job", cycle)
            }
            FamilyResume::ResumeCycle {
                cycle,
                last: Some(qn),
            } => write!(f, "resume cycle {} after {}", cycle, qn),
            FamilyResume::Finalized => write!(f, "finalized"),
        }
    }
}

/// Decides where a family resumes from its discovery log.
///
/// `expected` is the independently enumerated list of triples. Cycle 1 runs
/// every state, so its last marker must be the last expected triple before
/// later sections or the finalized marker are trusted.
pub fn detect_family(log: Option<&DiscoveryLog>, expected: &[QuantumNumbers]) -> FamilyResume {
    let log = match log {
        None => return FamilyResume::Fresh,
        Some(log) => log,
    };
    if !log.list_ended || log.states != expected {
        return FamilyResume::RedoDiscovery;
    }
    let first = match log.sections.first() {
        None => return FamilyResume::StartCycles,
        Some(section) => section,
    };
    let cycle_one_done = first.cycle == 1 && first.last.as_ref() == expected.last();
    if !cycle_one_done {
        return FamilyResume::ResumeCycle {
            cycle: 1,
            last: if first.cycle == 1 { first.last } else { None },
        };
    }
    if log.finalized {
        return FamilyResume::Finalized;
    }
    let current = log.sections.last().unwrap_or(first);
    FamilyResume::ResumeCycle {
        cycle: current.cycle,
        last: current.last,
    }
}

// Sorted log

/// Formats one state as a sorted-log line.
pub fn sorted_line(state: &State) -> String {
    let p = &state.params;
    format!(
        "{}; {}, {}, {}, {}, {}, {}",
        state.qn,
        p.higher_config,
        p.highest_percent,
        p.overlap,
        p.accuracy,
        p.energy_diff,
        p.total_energy
    )
}

/// Parses one sorted-log line.
///
/// `complete` is not stored and is restored as `energy_diff >= 0`.
pub fn parse_sorted_line(line: &str) -> std::result::Result<(QuantumNumbers, ConvergenceParams), String> {
    let (identity, parameters) = line
        .split_once(';')
        .ok_or_else(|| format!("missing ';' in '{}'", line))?;
    let qn: QuantumNumbers = identity.parse()?;

    let fields: Vec<&str> = parameters.rsplitn(6, ", ").collect();
    if fields.len() != 6 {
        return Err(format!("expected 6 parameters in '{}'", line));
    }
    let number = |field: &str| {
        field
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("invalid number '{}' in '{}'", field.trim(), line))
    };
    let energy_diff = number(fields[1])?;
    let params = ConvergenceParams {
        complete: energy_diff >= 0.0,
        higher_config: fields[5].trim().to_string(),
        highest_percent: number(fields[4])?,
        overlap: number(fields[3])?,
        accuracy: number(fields[2])?,
        energy_diff,
        total_energy: number(fields[0])?,
    };
    Ok((qn, params))
}

/// Writes the sorted log of a family.
pub fn write_sorted(path: &Path, states: &[State]) -> Result<()> {
    let text: String = states.iter().map(|s| sorted_line(s) + "\n").collect();
    write_text(path, &text)
}

/// Reads a sorted log.
pub fn read_sorted(path: &Path) -> Result<Option<Vec<(QuantumNumbers, ConvergenceParams)>>> {
    let text = match read_optional(path)? {
        None => return Ok(None),
        Some(text) => text,
    };
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            parse_sorted_line(line).map_err(|message| CheckpointError::Malformed {
                path: path.to_path_buf(),
                line: index + 1,
                message,
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn count_lines(text: &str) -> usize {
    text.lines().filter(|line| !line.trim().is_empty()).count()
}

// Transition log

/// Where a transition class stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResume {
    /// No transition log
    NotStarted,
    /// Continue after `last` (from the first pair when `None`)
    Partial {
        /// Last checkpointed pair
        last: Option<(QuantumNumbers, QuantumNumbers)>,
    },
    /// The log carries the finished marker
    Finished,
}

impl fmt::Display for TransitionResume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionResume::NotStarted => write!(f, "not started"),
            TransitionResume::Partial { last: None } => write!(f, "started, no pair finished"),
            TransitionResume::Partial {
                last: Some((initial, final_state)),
            } => write!(f, "resume after {}", format_pair(initial, final_state)),
            TransitionResume::Finished => write!(f, "finished"),
        }
    }
}

/// Decides where a transition class resumes from its log text.
pub fn detect_transitions(
    text: Option<&str>,
    class: TransitionClass,
) -> std::result::Result<TransitionResume, (usize, String)> {
    let text = match text {
        None => return Ok(TransitionResume::NotStarted),
        Some(text) => text,
    };
    let finished = transitions_finished(class);
    let mut started = false;
    let mut last = None;
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line == TRANSITIONS_HEADER {
            started = true;
        } else if line == finished {
            return Ok(TransitionResume::Finished);
        } else {
            last = Some(parse_pair(line).map_err(|e| (index + 1, e))?);
            started = true;
        }
    }
    Ok(if started {
        TransitionResume::Partial { last }
    } else {
        TransitionResume::NotStarted
    })
}

/// Starts a transition log.
pub fn write_transitions_header(path: &Path) -> Result<()> {
    write_text(path, &format!("{}\n", TRANSITIONS_HEADER))
}

/// Closes a transition log.
pub fn write_transitions_finished(path: &Path, class: TransitionClass) -> Result<()> {
    append(path, &transitions_finished(class))
}

// Resume decision

/// Checkpoint state of one family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilySnapshot {
    /// Family described
    pub family: Family,
    /// Where its discovery log stands
    pub resume: FamilyResume,
    /// The discovery log carries the finalized marker (trusted or not)
    pub finalized_marker: bool,
    /// Number of triples the enumeration expects
    pub expected: usize,
    /// Lines in the sorted log, `None` when absent
    pub sorted_lines: Option<usize>,
}

/// Checkpoint state of a whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    /// One entry per active family
    pub families: Vec<FamilySnapshot>,
    /// One entry per active transition class
    pub classes: Vec<(TransitionClass, TransitionResume)>,
}

/// Next action of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Run discovery or cycles for the listed families
    Redo {
        /// Families still running, with their resume points
        families: Vec<(Family, FamilyResume)>,
    },
    /// Every family finalized, no sorted log yet
    ProceedToSort,
    /// Rewrite the sorted logs of the listed families
    Resort {
        /// Families whose sorted log is missing or short
        families: Vec<Family>,
    },
    /// Sorted logs valid, no transition started
    ProceedToTransitions,
    /// Continue the listed classes, the rest are finished
    ProceedToTransitionsPartial {
        /// Unfinished classes with their resume points
        classes: Vec<(TransitionClass, TransitionResume)>,
    },
    /// Every transition class finished
    ProceedToSpectra,
}

impl fmt::Display for ResumeDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeDecision::Redo { families } => {
                write!(f, "state calculations pending:")?;
                for (family, resume) in families {
                    write!(f, "\n  {}: {}", family, resume)?;
                }
                Ok(())
            }
            ResumeDecision::ProceedToSort => write!(f, "all states finalized, energy sort pending"),
            ResumeDecision::Resort { families } => {
                let names: Vec<String> = families.iter().map(|f| f.to_string()).collect();
                write!(f, "sorted logs to rewrite: {}", names.join(", "))
            }
            ResumeDecision::ProceedToTransitions => write!(f, "states sorted, transitions pending"),
            ResumeDecision::ProceedToTransitionsPartial { classes } => {
                write!(f, "transitions partially done:")?;
                for (class, resume) in classes {
                    write!(f, "\n  {}: {}", class, resume)?;
                }
                Ok(())
            }
            ResumeDecision::ProceedToSpectra => write!(f, "all transitions done, spectra pending"),
        }
    }
}

/// Combines the snapshot of every family and class into one decision.
pub fn decide(snapshot: &RunSnapshot) -> Result<ResumeDecision> {
    let any_transition = snapshot
        .classes
        .iter()
        .any(|(_, resume)| *resume != TransitionResume::NotStarted);

    let pending: Vec<&FamilySnapshot> = snapshot
        .families
        .iter()
        .filter(|f| f.resume != FamilyResume::Finalized)
        .collect();
    if !pending.is_empty() {
        if let Some(orphan) = pending
            .iter()
            .find(|f| f.sorted_lines.is_some() && !f.finalized_marker)
        {
            return Err(CheckpointError::UnexpectedCombination(format!(
                "{} states have a sorted log but their discovery log is not finalized",
                orphan.family
            )));
        }
        if any_transition {
            return Err(CheckpointError::UnexpectedCombination(
                "transition logs exist while state calculations are unfinished".to_string(),
            ));
        }
        return Ok(ResumeDecision::Redo {
            families: pending
                .iter()
                .map(|f| (f.family, f.resume.clone()))
                .collect(),
        });
    }

    let unsorted: Vec<Family> = snapshot
        .families
        .iter()
        .filter(|f| f.sorted_lines != Some(f.expected))
        .map(|f| f.family)
        .collect();
    if !unsorted.is_empty() {
        if any_transition {
            return Err(CheckpointError::UnexpectedCombination(
                "transition logs exist without valid sorted logs".to_string(),
            ));
        }
        let none_sorted = snapshot.families.iter().all(|f| f.sorted_lines.is_none());
        return Ok(if none_sorted {
            ResumeDecision::ProceedToSort
        } else {
            ResumeDecision::Resort { families: unsorted }
        });
    }

    if !any_transition {
        return Ok(ResumeDecision::ProceedToTransitions);
    }
    let open: Vec<(TransitionClass, TransitionResume)> = snapshot
        .classes
        .iter()
        .filter(|(_, resume)| *resume != TransitionResume::Finished)
        .cloned()
        .collect();
    Ok(if open.is_empty() {
        ResumeDecision::ProceedToSpectra
    } else {
        ResumeDecision::ProceedToTransitionsPartial { classes: open }
    })
}

/// Reads every log of a run.
///
/// `expected` maps each configured family to its enumerated triples.
pub fn snapshot(
    naming: &FileNaming,
    config: &Config,
    expected: &BTreeMap<Family, Vec<QuantumNumbers>>,
) -> Result<RunSnapshot> {
    let mut families = Vec::new();
    for family in config.families() {
        let qns = expected.get(&family).map(Vec::as_slice).unwrap_or(&[]);
        let log = read_discovery(&naming.discovery_log(family))?;
        let resume = detect_family(log.as_ref(), qns);
        let sorted_lines = read_optional(&naming.sorted_log(family))?.map(|t| count_lines(&t));
        debug!("{} family: {}", family, resume);
        families.push(FamilySnapshot {
            family,
            resume,
            finalized_marker: log.as_ref().map_or(false, |l| l.finalized),
            expected: qns.len(),
            sorted_lines,
        });
    }

    let mut classes = Vec::new();
    for class in config.transition_classes() {
        let path = naming.transition_log(class);
        let text = read_optional(&path)?;
        let resume = detect_transitions(text.as_deref(), class).map_err(|(line, message)| {
            CheckpointError::Malformed {
                path: path.clone(),
                line,
                message,
            }
        })?;
        classes.push((class, resume));
    }
    Ok(RunSnapshot { families, classes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn qns(n: usize) -> Vec<QuantumNumbers> {
        (0..n).map(|i| QuantumNumbers::new(i, 1, 1)).collect()
    }

    fn family(resume: FamilyResume, finalized: bool, sorted: Option<usize>) -> FamilySnapshot {
        FamilySnapshot {
            family: Family::OneHole,
            resume,
            finalized_marker: finalized,
            expected: 3,
            sorted_lines: sorted,
        }
    }

    #[test]
    fn test_discovery_log_text_round_trip() {
        let text = "0, 1, 1\n1, 1, 1\n2, 3, 1\nListEnd\nFirst Cycle Last Calculated:\n1, 1, 1\n2, 3, 1\nSecond Cycle Last Calculated:\n";
        let log = DiscoveryLog::parse(text).unwrap();
        assert_eq!(log.states.len(), 3);
        assert_eq!(
            log.sections,
            vec![
                CycleSection {
                    cycle: 1,
                    last: Some(QuantumNumbers::new(2, 3, 1))
                },
                CycleSection {
                    cycle: 2,
                    last: None
                }
            ]
        );
        assert!(!log.finalized);
        // Intermediate sub-batch markers collapse to the last one
        let reparsed = DiscoveryLog::parse(&log.to_text()).unwrap();
        assert_eq!(reparsed, log);
    }

    #[test]
    fn test_discovery_log_rejects_out_of_order_sections() {
        let text = "0, 1, 1\nListEnd\nSecond Cycle Last Calculated:\nFirst Cycle Last Calculated:\n";
        assert_eq!(DiscoveryLog::parse(text).unwrap_err().0, 4);
        assert!(DiscoveryLog::parse("0, 1\n").is_err());
    }

    #[test]
    fn test_detect_family_shapes() {
        let expected = qns(3);
        assert_eq!(detect_family(None, &expected), FamilyResume::Fresh);

        let partial = DiscoveryLog::parse("0, 1, 1\n1, 1, 1\n").unwrap();
        assert_eq!(detect_family(Some(&partial), &expected), FamilyResume::RedoDiscovery);

        let other = DiscoveryLog::parse("0, 1, 1\n1, 1, 1\n2, 1, 2\nListEnd\n").unwrap();
        assert_eq!(detect_family(Some(&other), &expected), FamilyResume::RedoDiscovery);

        let listed = DiscoveryLog::parse("0, 1, 1\n1, 1, 1\n2, 1, 1\nListEnd\n").unwrap();
        assert_eq!(detect_family(Some(&listed), &expected), FamilyResume::StartCycles);

        let mut log = listed.clone();
        log.sections.push(CycleSection { cycle: 1, last: None });
        assert_eq!(
            detect_family(Some(&log), &expected),
            FamilyResume::ResumeCycle { cycle: 1, last: None }
        );

        log.sections[0].last = Some(expected[0]);
        assert_eq!(
            detect_family(Some(&log), &expected),
            FamilyResume::ResumeCycle {
                cycle: 1,
                last: Some(expected[0])
            }
        );

        log.sections[0].last = Some(expected[2]);
        log.sections.push(CycleSection {
            cycle: 3,
            last: Some(expected[1]),
        });
        assert_eq!(
            detect_family(Some(&log), &expected),
            FamilyResume::ResumeCycle {
                cycle: 3,
                last: Some(expected[1])
            }
        );

        log.finalized = true;
        assert_eq!(detect_family(Some(&log), &expected), FamilyResume::Finalized);
    }

    #[test]
    fn test_inconsistent_finalized_log_resumes_from_cycle_marker() {
        let expected = qns(3);
        let text = "0, 1, 1\n1, 1, 1\n2, 1, 1\nListEnd\nFirst Cycle Last Calculated:\n1, 1, 1\nCalculationFinalized\n";
        let log = DiscoveryLog::parse(text).unwrap();
        assert_eq!(
            detect_family(Some(&log), &expected),
            FamilyResume::ResumeCycle {
                cycle: 1,
                last: Some(expected[1])
            }
        );
    }

    #[test]
    fn test_truncate_drops_later_sections() {
        let text = "0, 1, 1\nListEnd\nFirst Cycle Last Calculated:\n0, 1, 1\nSecond Cycle Last Calculated:\nCalculationFinalized\n";
        let mut log = DiscoveryLog::parse(text).unwrap();
        log.truncate_to(1);
        assert_eq!(
            log.to_text(),
            "0, 1, 1\nListEnd\nFirst Cycle Last Calculated:\n0, 1, 1\n"
        );
    }

    #[test]
    fn test_sorted_line_round_trip() {
        let mut state = State::new(QuantumNumbers::new(4, 3, 2), "2p", "(1s)2 (2s)2 (2p)5");
        state.params = ConvergenceParams {
            complete: true,
            higher_config: "2p-1, 2p+3".to_string(),
            highest_percent: 97.123456789,
            overlap: 1.25e-7,
            accuracy: 3e-6,
            energy_diff: 0.015625,
            total_energy: -3512.987654321012,
        };
        let line = sorted_line(&state);
        assert!(line.starts_with("4, 3, 2; 2p-1, 2p+3, "));
        let (qn, params) = parse_sorted_line(&line).unwrap();
        assert_eq!(qn, state.qn);
        assert_eq!(params, state.params);
    }

    #[test]
    fn test_sorted_log_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("one_hole/states_sorted.txt");
        assert!(read_sorted(&path).unwrap().is_none());

        let states: Vec<State> = qns(2)
            .into_iter()
            .map(|qn| State::new(qn, "1s", "(1s)1"))
            .collect();
        write_sorted(&path, &states).unwrap();
        let read = read_sorted(&path).unwrap().unwrap();
        assert_eq!(read.len(), 2);
        assert!(!read[0].1.complete);
    }

    #[test]
    fn test_transition_log_shapes() {
        let class = TransitionClass::Auger;
        assert_eq!(detect_transitions(None, class).unwrap(), TransitionResume::NotStarted);
        assert_eq!(
            detect_transitions(Some(""), class).unwrap(),
            TransitionResume::NotStarted
        );
        assert_eq!(
            detect_transitions(Some("Calculated transitions:\n"), class).unwrap(),
            TransitionResume::Partial { last: None }
        );
        let text = "Calculated transitions:\n0, 1, 1 => 2, 0, 1\n1, 1, 1 => 0, 2, 1\n";
        assert_eq!(
            detect_transitions(Some(text), class).unwrap(),
            TransitionResume::Partial {
                last: Some((QuantumNumbers::new(1, 1, 1), QuantumNumbers::new(0, 2, 1)))
            }
        );
        let done = format!("{}Finished Auger Transitions\n", text);
        assert_eq!(
            detect_transitions(Some(&done), class).unwrap(),
            TransitionResume::Finished
        );
        // Another class's finished marker is not a pair line
        let wrong = format!("{}Finished Diagram Transitions\n", text);
        assert!(detect_transitions(Some(&wrong), class).is_err());
    }

    #[test]
    fn test_decide_redo_and_fatal_combinations() {
        let redo = RunSnapshot {
            families: vec![family(FamilyResume::StartCycles, false, None)],
            classes: vec![(TransitionClass::Diagram, TransitionResume::NotStarted)],
        };
        assert_eq!(
            decide(&redo).unwrap(),
            ResumeDecision::Redo {
                families: vec![(Family::OneHole, FamilyResume::StartCycles)]
            }
        );

        let orphan_sorted = RunSnapshot {
            families: vec![family(FamilyResume::StartCycles, false, Some(3))],
            classes: vec![],
        };
        assert!(matches!(
            decide(&orphan_sorted),
            Err(CheckpointError::UnexpectedCombination(_))
        ));

        // A degraded finalized log keeps its stale sorted log without failing
        let degraded = RunSnapshot {
            families: vec![family(
                FamilyResume::ResumeCycle { cycle: 1, last: None },
                true,
                Some(3),
            )],
            classes: vec![],
        };
        assert!(matches!(decide(&degraded).unwrap(), ResumeDecision::Redo { .. }));

        let orphan_transitions = RunSnapshot {
            families: vec![family(FamilyResume::Finalized, true, Some(2))],
            classes: vec![(TransitionClass::Diagram, TransitionResume::Finished)],
        };
        assert!(matches!(
            decide(&orphan_transitions),
            Err(CheckpointError::UnexpectedCombination(_))
        ));
    }

    #[test]
    fn test_decide_sort_and_transition_stages() {
        let mut snapshot = RunSnapshot {
            families: vec![
                family(FamilyResume::Finalized, true, None),
                FamilySnapshot {
                    family: Family::TwoHole,
                    ..family(FamilyResume::Finalized, true, None)
                },
            ],
            classes: vec![
                (TransitionClass::Diagram, TransitionResume::NotStarted),
                (TransitionClass::Auger, TransitionResume::NotStarted),
            ],
        };
        assert_eq!(decide(&snapshot).unwrap(), ResumeDecision::ProceedToSort);

        snapshot.families[0].sorted_lines = Some(3);
        snapshot.families[1].sorted_lines = Some(1);
        assert_eq!(
            decide(&snapshot).unwrap(),
            ResumeDecision::Resort {
                families: vec![Family::TwoHole]
            }
        );

        snapshot.families[1].sorted_lines = Some(3);
        assert_eq!(decide(&snapshot).unwrap(), ResumeDecision::ProceedToTransitions);

        snapshot.classes[0].1 = TransitionResume::Finished;
        assert_eq!(
            decide(&snapshot).unwrap(),
            ResumeDecision::ProceedToTransitionsPartial {
                classes: vec![(TransitionClass::Auger, TransitionResume::NotStarted)]
            }
        );

        snapshot.classes[1].1 = TransitionResume::Finished;
        assert_eq!(decide(&snapshot).unwrap(), ResumeDecision::ProceedToSpectra);
    }

    #[test]
    fn test_cycle_markers() {
        assert_eq!(cycle_marker(1), "First Cycle Last Calculated:");
        assert_eq!(cycle_marker(4), "Fourth Cycle Last Calculated:");
        assert_eq!(parse_cycle_marker("Third Cycle Last Calculated:"), Some(3));
        assert_eq!(
            transitions_finished(TransitionClass::SatelliteAuger),
            "Finished Satellite Auger Transitions"
        );
    }
}
