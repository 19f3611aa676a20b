//! File and directory naming for the calculation tree.
//!
//! Every path the orchestrator reads or writes is produced here, so the
//! layout of a run is defined in one place:
//!
//! ```text
//! <label>/
//!   run_parameters.txt
//!   openhole_<label>.log
//!   radiative/                      one directory per state family
//!     states_log.txt                discovery + cycle checkpoint log
//!     states_sorted.txt             energy-sorted states
//!     by_hand.txt                   states left for manual review
//!     state_2_3_1/                  one directory per state job
//!       mdfgme.dat  state_2_3_1.f05  state_2_3_1.f06  state_2_3_1.f09
//!       failed_orbitals.txt  tmp/
//!   transitions/
//!     diagram/
//!       transitions_log.txt
//!       pair_2_3_1-0_1_1/           one directory per transition job
//!   results/
//! ```
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use openhole::config::Family;
//! use openhole::naming::FileNaming;
//! use openhole::state::QuantumNumbers;
//!
//! let naming = FileNaming::new(Path::new("/data"), "Ne");
//! let qn = QuantumNumbers::new(2, 3, 1);
//! assert_eq!(naming.state_job(&qn), "state_2_3_1");
//! assert_eq!(
//!     naming.state_dir(Family::OneHole, &qn),
//!     Path::new("/data/Ne/radiative/state_2_3_1")
//! );
//! ```

use crate::config::{Family, TransitionClass};
use crate::state::QuantumNumbers;
use std::path::{Path, PathBuf};

/// Companion file the solver reads to find its input.
pub const COMPANION_FILE: &str = "mdfgme.dat";
/// Solver input extension
pub const INPUT_EXT: &str = "f05";
/// Solver output extension
pub const OUTPUT_EXT: &str = "f06";
/// Solver wavefunction extension
pub const WAVEFUNCTION_EXT: &str = "f09";
/// Scratch directory the solver expects inside each job directory
pub const SCRATCH_DIR: &str = "tmp";
/// Per-state record of failing orbitals
pub const FAILED_ORBITALS_FILE: &str = "failed_orbitals.txt";
/// Wavefunction of the initial state, staged into a transition directory
pub const INITIAL_WAVEFUNCTION: &str = "initial.f09";
/// Wavefunction of the final state, staged into a transition directory
pub const FINAL_WAVEFUNCTION: &str = "final.f09";

/// Builds every path of one calculation tree.
#[derive(Debug, Clone)]
pub struct FileNaming {
    root: PathBuf,
    label: String,
}

impl FileNaming {
    /// Creates the naming for `<parent>/<label>`.
    pub fn new(parent: &Path, label: &str) -> Self {
        Self {
            root: parent.join(label),
            label: label.to_string(),
        }
    }

    /// Default run label for an input file: its file stem.
    pub fn label_from_input(input_path: &Path) -> String {
        input_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("openhole_run")
            .to_string()
    }

    /// Root directory of the calculation.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Write-once record of the run parameters.
    pub fn run_parameters(&self) -> PathBuf {
        self.root.join("run_parameters.txt")
    }

    /// Log file used when file logging is enabled.
    pub fn log_file(&self) -> PathBuf {
        self.root.join(format!("openhole_{}.log", self.label))
    }

    // State families

    /// Directory of a state family.
    pub fn family_dir(&self, family: Family) -> PathBuf {
        self.root.join(family.dir_name())
    }

    /// Discovery and cycle checkpoint log of a family.
    pub fn discovery_log(&self, family: Family) -> PathBuf {
        self.family_dir(family).join("states_log.txt")
    }

    /// Energy-sorted state list of a family.
    pub fn sorted_log(&self, family: Family) -> PathBuf {
        self.family_dir(family).join("states_sorted.txt")
    }

    /// States of a family left for manual review.
    pub fn by_hand(&self, family: Family) -> PathBuf {
        self.family_dir(family).join("by_hand.txt")
    }

    /// File stem of a state job: `state_{shell}_{2J}_{eigenvalue}`.
    pub fn state_job(&self, qn: &QuantumNumbers) -> String {
        format!("state_{}_{}_{}", qn.shell, qn.two_j, qn.eigenvalue)
    }

    /// Working directory of a state job.
    pub fn state_dir(&self, family: Family, qn: &QuantumNumbers) -> PathBuf {
        self.family_dir(family).join(self.state_job(qn))
    }

    /// Solver output of a state job.
    pub fn state_output(&self, family: Family, qn: &QuantumNumbers) -> PathBuf {
        self.state_dir(family, qn)
            .join(format!("{}.{}", self.state_job(qn), OUTPUT_EXT))
    }

    /// Wavefunction written by a state job.
    pub fn state_wavefunction(&self, family: Family, qn: &QuantumNumbers) -> PathBuf {
        self.state_dir(family, qn)
            .join(format!("{}.{}", self.state_job(qn), WAVEFUNCTION_EXT))
    }

    /// Failing-orbital record of a state job.
    pub fn failed_orbitals(&self, family: Family, qn: &QuantumNumbers) -> PathBuf {
        self.state_dir(family, qn).join(FAILED_ORBITALS_FILE)
    }

    // Transitions

    /// Directory holding all transition classes.
    pub fn transitions_dir(&self) -> PathBuf {
        self.root.join("transitions")
    }

    /// Directory of one transition class.
    pub fn class_dir(&self, class: TransitionClass) -> PathBuf {
        self.transitions_dir().join(class.dir_name())
    }

    /// Checkpoint log of a transition class.
    pub fn transition_log(&self, class: TransitionClass) -> PathBuf {
        self.class_dir(class).join("transitions_log.txt")
    }

    /// File stem of a transition job.
    ///
    /// Format: `pair_{i1}_{jj1}_{e1}-{i2}_{jj2}_{e2}`
    pub fn transition_job(&self, initial: &QuantumNumbers, final_state: &QuantumNumbers) -> String {
        format!(
            "pair_{}_{}_{}-{}_{}_{}",
            initial.shell,
            initial.two_j,
            initial.eigenvalue,
            final_state.shell,
            final_state.two_j,
            final_state.eigenvalue
        )
    }

    /// Working directory of a transition job.
    pub fn transition_dir(
        &self,
        class: TransitionClass,
        initial: &QuantumNumbers,
        final_state: &QuantumNumbers,
    ) -> PathBuf {
        self.class_dir(class)
            .join(self.transition_job(initial, final_state))
    }

    /// Solver output of a transition job.
    pub fn transition_output(
        &self,
        class: TransitionClass,
        initial: &QuantumNumbers,
        final_state: &QuantumNumbers,
    ) -> PathBuf {
        self.transition_dir(class, initial, final_state).join(format!(
            "{}.{}",
            self.transition_job(initial, final_state),
            OUTPUT_EXT
        ))
    }

    // Results

    /// Directory of the aggregated results.
    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    /// Line list of one transition class.
    pub fn spectrum(&self, class: TransitionClass) -> PathBuf {
        self.results_dir()
            .join(format!("{}_spectrum.txt", class.dir_name()))
    }

    /// Level widths.
    pub fn widths(&self) -> PathBuf {
        self.results_dir().join("widths.txt")
    }

    /// Fluorescence yields.
    pub fn yields(&self) -> PathBuf {
        self.results_dir().join("yields.txt")
    }

    /// Machine-readable summary.
    pub fn results_json(&self) -> PathBuf {
        self.results_dir().join("results.json")
    }
}

/// Input file name of the job living in `dir` (`<dir name>.f05`).
pub fn input_name(dir: &Path) -> String {
    let stem = dir.file_name().and_then(|s| s.to_str()).unwrap_or("job");
    format!("{}.{}", stem, INPUT_EXT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_from_input() {
        assert_eq!(FileNaming::label_from_input(Path::new("/runs/Ne.inp")), "Ne");
        assert_eq!(FileNaming::label_from_input(Path::new("Ar_test.input")), "Ar_test");
    }

    #[test]
    fn test_family_files() {
        let naming = FileNaming::new(Path::new("runs"), "Ne");
        assert_eq!(naming.root(), Path::new("runs/Ne"));
        assert_eq!(
            naming.discovery_log(Family::TwoHole),
            Path::new("runs/Ne/auger/states_log.txt")
        );
        assert_eq!(
            naming.by_hand(Family::ShakeUp),
            Path::new("runs/Ne/shakeup/by_hand.txt")
        );
        assert_eq!(naming.log_file(), Path::new("runs/Ne/openhole_Ne.log"));
    }

    #[test]
    fn test_state_job_files() {
        let naming = FileNaming::new(Path::new("runs"), "Ne");
        let qn = QuantumNumbers::new(0, 1, 1);
        assert_eq!(
            naming.state_output(Family::OneHole, &qn),
            Path::new("runs/Ne/radiative/state_0_1_1/state_0_1_1.f06")
        );
        assert_eq!(
            input_name(&naming.state_dir(Family::OneHole, &qn)),
            "state_0_1_1.f05"
        );
    }

    #[test]
    fn test_transition_job_files() {
        let naming = FileNaming::new(Path::new("runs"), "Ne");
        let initial = QuantumNumbers::new(2, 3, 1);
        let final_state = QuantumNumbers::new(0, 1, 1);
        assert_eq!(
            naming.transition_dir(TransitionClass::Diagram, &initial, &final_state),
            Path::new("runs/Ne/transitions/diagram/pair_2_3_1-0_1_1")
        );
        assert_eq!(
            naming.spectrum(TransitionClass::SatelliteAuger),
            Path::new("runs/Ne/results/satellite_auger_spectrum.txt")
        );
    }
}
