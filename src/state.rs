//! Core data structures for calculated atomic levels and transitions.
//!
//! - [`QuantumNumbers`]: the `(shell, 2J, eigenvalue)` identity of a state job
//! - [`ConvergenceParams`]: the diagnostics parsed from the latest solver output
//! - [`FailedOrbitals`]: the bounded list of orbital overrides used by late cycles
//! - [`State`]: one calculated level
//! - [`Transition`]: one candidate decay between two levels
//!
//! The convergence predicate lives here as well: [`ConvergenceParams::classify`]
//! sorts every parameter tuple into exactly one [`Convergence`] class.

use crate::config::Thresholds;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of one state calculation within a family.
///
/// Text form is `i, jj, eigv`, the form used by every checkpoint log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuantumNumbers {
    /// Index of the configuration in the family's configuration list
    pub shell: usize,
    /// Twice the total angular momentum
    pub two_j: u32,
    /// 1-based eigenvalue index among the levels with this 2J
    pub eigenvalue: u32,
}

impl QuantumNumbers {
    /// Creates a new quantum-number triple.
    pub fn new(shell: usize, two_j: u32, eigenvalue: u32) -> Self {
        Self {
            shell,
            two_j,
            eigenvalue,
        }
    }

    /// Statistical weight `2J + 1` of the level.
    pub fn multiplicity(&self) -> f64 {
        f64::from(self.two_j) + 1.0
    }
}

impl fmt::Display for QuantumNumbers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.shell, self.two_j, self.eigenvalue)
    }
}

impl FromStr for QuantumNumbers {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(format!("expected 'i, jj, eigv', found '{}'", s.trim()));
        }
        let parse = |field: &str, name: &str| {
            field
                .parse::<u64>()
                .map_err(|_| format!("invalid {} '{}' in '{}'", name, field, s.trim()))
        };
        Ok(Self {
            shell: parse(parts[0], "shell index")? as usize,
            two_j: parse(parts[1], "2J")? as u32,
            eigenvalue: parse(parts[2], "eigenvalue")? as u32,
        })
    }
}

/// Outcome of the convergence predicate.
///
/// The eight variants partition every possible parameter tuple: the energy
/// term, the overlap term and the accuracy term either hold or fail, and
/// `Converged` is the case where all three hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Convergence {
    /// Every criterion satisfied
    Converged,
    /// Only the energy criterion failed (or the run is incomplete)
    BadEnergy,
    /// Only the overlap criterion failed
    BadOverlap,
    /// Only the accuracy criterion failed
    BadAccuracy,
    /// Energy and overlap failed
    BadEnergyOverlap,
    /// Energy and accuracy failed
    BadEnergyAccuracy,
    /// Overlap and accuracy failed
    BadOverlapAccuracy,
    /// Every criterion failed
    BadAll,
}

/// Convergence diagnostics of the latest solver run of a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceParams {
    /// The ETOT block was present in the output
    pub complete: bool,
    /// Dominant jj configuration
    pub higher_config: String,
    /// Weight of the dominant configuration in percent
    pub highest_percent: f64,
    /// Largest overlap integral magnitude (1.0 when absent)
    pub overlap: f64,
    /// Eigenenergy variation of the last iteration
    pub accuracy: f64,
    /// Difference between the ETOT columns (-1.0 when absent)
    pub energy_diff: f64,
    /// Total (Welton) energy in atomic units
    pub total_energy: f64,
}

impl Default for ConvergenceParams {
    fn default() -> Self {
        Self {
            complete: false,
            higher_config: String::new(),
            highest_percent: 0.0,
            overlap: 1.0,
            accuracy: 1.0,
            energy_diff: -1.0,
            total_energy: 0.0,
        }
    }
}

impl ConvergenceParams {
    /// Applies the convergence predicate.
    ///
    /// `converged <=> complete && 0 <= energy_diff < energy threshold
    /// && overlap < overlap threshold && accuracy < accuracy threshold`.
    /// NaN diagnostics fail their term.
    pub fn classify(&self, thresholds: &Thresholds) -> Convergence {
        let energy_ok = self.complete
            && self.energy_diff >= 0.0
            && self.energy_diff < thresholds.energy_diff;
        let overlap_ok = self.overlap < thresholds.overlap;
        let accuracy_ok = self.accuracy < thresholds.accuracy;

        match (energy_ok, overlap_ok, accuracy_ok) {
            (true, true, true) => Convergence::Converged,
            (false, true, true) => Convergence::BadEnergy,
            (true, false, true) => Convergence::BadOverlap,
            (true, true, false) => Convergence::BadAccuracy,
            (false, false, true) => Convergence::BadEnergyOverlap,
            (false, true, false) => Convergence::BadEnergyAccuracy,
            (true, false, false) => Convergence::BadOverlapAccuracy,
            (false, false, false) => Convergence::BadAll,
        }
    }

    /// Shorthand for `classify(..) == Convergence::Converged`.
    pub fn is_converged(&self, thresholds: &Thresholds) -> bool {
        self.classify(thresholds) == Convergence::Converged
    }
}

/// Orbitals that failed to converge, tagged with the cycle whose output
/// reported them.
///
/// Recording is idempotent per cycle, so replaying a cycle after a restart
/// does not grow the list. The active list is a FIFO of at most two distinct
/// orbitals: recording a third evicts the oldest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedOrbitals {
    entries: Vec<(u8, String)>,
}

impl FailedOrbitals {
    /// Most orbitals carried into a late cycle.
    pub const CAPACITY: usize = 2;

    /// Records the orbital reported by the output of `cycle`.
    ///
    /// An existing record for the same cycle is replaced.
    pub fn record(&mut self, cycle: u8, orbital: &str) {
        self.entries.retain(|(c, _)| *c != cycle);
        self.entries.push((cycle, orbital.to_string()));
        self.entries.sort_by_key(|(c, _)| *c);
    }

    /// True when no cycle reported a failing orbital.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Active list after the outputs of cycles `1..=cycle` were read.
    pub fn after_cycle(&self, cycle: u8) -> Vec<String> {
        let mut active: Vec<String> = Vec::with_capacity(Self::CAPACITY);
        for (_, orbital) in self.entries.iter().filter(|(c, _)| *c <= cycle) {
            if active.contains(orbital) {
                continue;
            }
            if active.len() == Self::CAPACITY {
                active.remove(0);
            }
            active.push(orbital.clone());
        }
        active
    }

    /// Orbital overrides spliced into the input of `cycle`.
    ///
    /// Cycle 3 carries the most recent failing orbital, cycle 4 the whole
    /// active list; earlier cycles carry none.
    pub fn overrides_for(&self, cycle: u8) -> Vec<String> {
        match cycle {
            3 => {
                let mut active = self.after_cycle(2);
                let keep = active.len().saturating_sub(1);
                active.drain(..keep);
                active
            }
            4 => self.after_cycle(3),
            _ => Vec::new(),
        }
    }

    /// Serialises to the `failed_orbitals.txt` format (`<cycle> <orbital>`).
    pub fn to_text(&self) -> String {
        self.entries
            .iter()
            .map(|(cycle, orbital)| format!("{} {}\n", cycle, orbital))
            .collect()
    }

    /// Parses the `failed_orbitals.txt` format, skipping malformed lines.
    pub fn from_text(text: &str) -> Self {
        let mut orbitals = FailedOrbitals::default();
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(cycle), Some(orbital)) = (parts.next(), parts.next()) {
                if let Ok(cycle) = cycle.parse::<u8>() {
                    orbitals.record(cycle, orbital);
                }
            }
        }
        orbitals
    }
}

/// One calculated atomic level.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    /// Job identity
    pub qn: QuantumNumbers,
    /// Human-readable vacancy label (e.g. `1s2p`)
    pub shell_label: String,
    /// Electron configuration handed to the solver
    pub configuration: String,
    /// Diagnostics of the latest solver output
    pub params: ConvergenceParams,
    /// Failing orbitals collected across cycles
    pub failed_orbitals: FailedOrbitals,
}

impl State {
    /// Creates a state with unmeasured convergence parameters.
    pub fn new(qn: QuantumNumbers, shell_label: &str, configuration: &str) -> Self {
        Self {
            qn,
            shell_label: shell_label.to_string(),
            configuration: configuration.to_string(),
            params: ConvergenceParams::default(),
            failed_orbitals: FailedOrbitals::default(),
        }
    }

    /// Whether the latest output satisfies the convergence predicate.
    pub fn is_converged(&self, thresholds: &Thresholds) -> bool {
        self.params.is_converged(thresholds)
    }
}

/// Snapshot of one end of a transition.
///
/// Copied from the sorted state list when the transition is created, so later
/// changes to the state do not leak into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Identity of the state
    pub qn: QuantumNumbers,
    /// Vacancy label of the state
    pub shell_label: String,
    /// Electron configuration of the state
    pub configuration: String,
    /// Dominant jj configuration
    pub higher_config: String,
    /// Weight of the dominant configuration
    pub highest_percent: f64,
    /// Total energy of the state
    pub total_energy: f64,
}

impl From<&State> for Endpoint {
    fn from(state: &State) -> Self {
        Self {
            qn: state.qn,
            shell_label: state.shell_label.clone(),
            configuration: state.configuration.clone(),
            higher_config: state.params.higher_config.clone(),
            highest_percent: state.params.highest_percent,
            total_energy: state.params.total_energy,
        }
    }
}

/// One candidate decay between an initial and a final state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Decaying state
    pub initial: Endpoint,
    /// State the decay ends in
    pub final_state: Endpoint,
    /// Transition energy reported by the solver (eV)
    pub energy: f64,
    /// Transition rate reported by the solver (1/s)
    pub rate: f64,
    /// Sum of all rates leaving the initial state
    pub total_rate_from_initial: f64,
    /// Per-multipole rates (radiative transitions only)
    pub multipoles: Vec<(String, f64)>,
}

impl Transition {
    /// Creates a transition with no computed attributes yet.
    pub fn new(initial: &State, final_state: &State) -> Self {
        Self {
            initial: Endpoint::from(initial),
            final_state: Endpoint::from(final_state),
            energy: 0.0,
            rate: 0.0,
            total_rate_from_initial: 0.0,
            multipoles: Vec::new(),
        }
    }

    /// `(initial, final)` identity of the transition.
    pub fn key(&self) -> (QuantumNumbers, QuantumNumbers) {
        (self.initial.qn, self.final_state.qn)
    }

    /// Branching ratio of this decay channel (0 when nothing leaves the level).
    pub fn branching_ratio(&self) -> f64 {
        if self.total_rate_from_initial > 0.0 {
            self.rate / self.total_rate_from_initial
        } else {
            0.0
        }
    }
}

/// Formats a transition identity the way the transition logs store it.
pub fn format_pair(initial: &QuantumNumbers, final_state: &QuantumNumbers) -> String {
    format!("{} => {}", initial, final_state)
}

/// Parses a `i1, jj1, eigv1 => i2, jj2, eigv2` line.
pub fn parse_pair(line: &str) -> Result<(QuantumNumbers, QuantumNumbers), String> {
    let (initial, final_state) = line
        .split_once("=>")
        .ok_or_else(|| format!("expected 'initial => final', found '{}'", line.trim()))?;
    Ok((initial.parse()?, final_state.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(complete: bool, energy_diff: f64, overlap: f64, accuracy: f64) -> ConvergenceParams {
        ConvergenceParams {
            complete,
            energy_diff,
            overlap,
            accuracy,
            ..ConvergenceParams::default()
        }
    }

    #[test]
    fn test_quantum_numbers_text_form() {
        let qn = QuantumNumbers::new(2, 3, 1);
        assert_eq!(qn.to_string(), "2, 3, 1");
        assert_eq!("2, 3, 1".parse::<QuantumNumbers>(), Ok(qn));
        assert_eq!(" 2,3 ,1 ".parse::<QuantumNumbers>(), Ok(qn));
        assert!("2, 3".parse::<QuantumNumbers>().is_err());
        assert!("2, x, 1".parse::<QuantumNumbers>().is_err());
    }

    #[test]
    fn test_each_partition_is_reachable() {
        let t = Thresholds {
            energy_diff: 1.0,
            overlap: 0.1,
            accuracy: 0.01,
        };
        assert_eq!(params(true, 0.5, 0.05, 0.001).classify(&t), Convergence::Converged);
        assert_eq!(params(true, 2.0, 0.05, 0.001).classify(&t), Convergence::BadEnergy);
        assert_eq!(params(true, 0.5, 0.5, 0.001).classify(&t), Convergence::BadOverlap);
        assert_eq!(params(true, 0.5, 0.05, 0.1).classify(&t), Convergence::BadAccuracy);
        assert_eq!(params(true, 2.0, 0.5, 0.001).classify(&t), Convergence::BadEnergyOverlap);
        assert_eq!(params(true, 2.0, 0.05, 0.1).classify(&t), Convergence::BadEnergyAccuracy);
        assert_eq!(params(true, 0.5, 0.5, 0.1).classify(&t), Convergence::BadOverlapAccuracy);
        assert_eq!(params(true, 2.0, 0.5, 0.1).classify(&t), Convergence::BadAll);
    }

    #[test]
    fn test_thresholds_are_strict_and_sentinel_fails() {
        let t = Thresholds {
            energy_diff: 1.0,
            overlap: 0.1,
            accuracy: 0.01,
        };
        assert_eq!(params(true, 1.0, 0.05, 0.001).classify(&t), Convergence::BadEnergy);
        assert_eq!(params(true, 0.5, 0.1, 0.001).classify(&t), Convergence::BadOverlap);
        assert_eq!(params(true, 0.5, 0.05, 0.01).classify(&t), Convergence::BadAccuracy);
        assert_eq!(params(true, -1.0, 0.05, 0.001).classify(&t), Convergence::BadEnergy);
        assert_eq!(params(false, 0.5, 0.05, 0.001).classify(&t), Convergence::BadEnergy);
        assert_eq!(params(true, 0.0, 0.05, 0.001).classify(&t), Convergence::Converged);
        assert_eq!(ConvergenceParams::default().classify(&t), Convergence::BadAll);
    }

    #[test]
    fn test_failed_orbitals_fifo() {
        let mut orbitals = FailedOrbitals::default();
        orbitals.record(1, "2p+");
        assert_eq!(orbitals.after_cycle(1), vec!["2p+"]);
        assert!(orbitals.overrides_for(2).is_empty());

        orbitals.record(2, "2s");
        assert_eq!(orbitals.after_cycle(2), vec!["2p+", "2s"]);
        assert_eq!(orbitals.overrides_for(3), vec!["2s"]);

        orbitals.record(3, "1s");
        assert_eq!(orbitals.after_cycle(3), vec!["2s", "1s"]);
        assert_eq!(orbitals.overrides_for(4), vec!["2s", "1s"]);
    }

    #[test]
    fn test_failed_orbitals_replay_is_idempotent() {
        let mut orbitals = FailedOrbitals::default();
        orbitals.record(1, "2p+");
        orbitals.record(2, "2p-");
        orbitals.record(2, "2p-");
        assert_eq!(orbitals.to_text(), "1 2p+\n2 2p-\n");

        let reread = FailedOrbitals::from_text(&orbitals.to_text());
        assert_eq!(reread, orbitals);
    }

    #[test]
    fn test_failed_orbitals_repeat_keeps_single_entry() {
        let mut orbitals = FailedOrbitals::default();
        orbitals.record(1, "3d+");
        orbitals.record(2, "3d+");
        assert_eq!(orbitals.after_cycle(2), vec!["3d+"]);
        orbitals.record(3, "4s");
        assert_eq!(orbitals.overrides_for(4), vec!["3d+", "4s"]);
    }

    #[test]
    fn test_pair_round_trip() {
        let a = QuantumNumbers::new(0, 1, 1);
        let b = QuantumNumbers::new(4, 3, 2);
        let line = format_pair(&a, &b);
        assert_eq!(line, "0, 1, 1 => 4, 3, 2");
        assert_eq!(parse_pair(&line), Ok((a, b)));
        assert!(parse_pair("0, 1, 1").is_err());
    }
}
