//! Four-cycle convergence refinement of one state family.
//!
//! Every state of a family runs in cycle 1 with the base template. Each later
//! cycle reruns only the states that still fail the convergence predicate:
//!
//! | cycle | template | overrides |
//! |---|---|---|
//! | 1 | base | none |
//! | 2 | ten steps | none |
//! | 3 | ten steps + orbitals | most recent failing orbital |
//! | 4 | ten steps + orbitals | last two failing orbitals |
//!
//! A cycle is a barrier: all its jobs are dispatched and parsed before the
//! next one is planned. States still failing after cycle 4 are listed in
//! `by_hand.txt` for manual review.

use crate::checkpoint::{self, CheckpointError, FamilyResume};
use crate::config::{Family, Thresholds, MAX_CYCLES};
use crate::dispatcher::{DispatchError, Dispatcher, Job};
use crate::naming::FileNaming;
use crate::output;
use crate::state::{FailedOrbitals, QuantumNumbers, State};
use crate::template::{StateInput, TemplateError, TemplateKind, TemplateSet};
use log::{debug, info, warn};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while refining a family.
#[derive(Error, Debug)]
pub enum CycleError {
    /// A sub-batch could not be prepared or launched
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// A state input could not be rendered
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// The discovery log could not be read or written
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// Failed-orbital or manual-review files could not be written
    #[error("IO error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

/// Result type for refinement cycles
pub type Result<T> = std::result::Result<T, CycleError>;

/// Outcome of a family's refinement.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Family refined
    pub family: Family,
    /// Cycles that dispatched at least one job in this invocation
    pub attempted: Vec<u8>,
    /// States converged after the last cycle
    pub converged: usize,
    /// States left for manual review
    pub by_hand: Vec<QuantumNumbers>,
}

/// Runs the refinement cycles of state families.
pub struct CycleRunner<'a> {
    naming: &'a FileNaming,
    templates: &'a TemplateSet,
    dispatcher: &'a Dispatcher<'a>,
    atomic_number: u32,
    thresholds: Thresholds,
}

impl<'a> CycleRunner<'a> {
    /// Runner for states of an atom with `atomic_number`.
    pub fn new(
        naming: &'a FileNaming,
        templates: &'a TemplateSet,
        dispatcher: &'a Dispatcher<'a>,
        atomic_number: u32,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            naming,
            templates,
            dispatcher,
            atomic_number,
            thresholds,
        }
    }

    /// Brings `states` (in discovery order) from `resume` to finalized.
    pub fn run_family(
        &self,
        family: Family,
        states: &mut [State],
        resume: &FamilyResume,
    ) -> Result<CycleReport> {
        let log_path = self.naming.discovery_log(family);
        let (first_cycle, mut resume_after, mut header_written) = match resume {
            FamilyResume::Fresh | FamilyResume::RedoDiscovery => {
                let qns: Vec<QuantumNumbers> = states.iter().map(|s| s.qn).collect();
                checkpoint::write_discovery(&log_path, &qns)?;
                self.clear_failed_orbitals(family, states)?;
                info!("{} states: discovered {} levels", family, qns.len());
                (1, None, false)
            }
            FamilyResume::StartCycles => (1, None, false),
            FamilyResume::ResumeCycle { cycle, last } => {
                let mut log = checkpoint::read_discovery(&log_path)?.unwrap_or_default();
                log.truncate_to(*cycle);
                checkpoint::rewrite_discovery(&log_path, &log)?;
                self.load_failed_orbitals(family, states)?;
                info!("{} states: {}", family, resume);
                (*cycle, *last, true)
            }
            FamilyResume::Finalized => {
                self.load_failed_orbitals(family, states)?;
                self.refresh(family, states);
                return Ok(self.report(family, states, Vec::new()));
            }
        };

        let mut attempted = Vec::new();
        for cycle in first_cycle..=MAX_CYCLES {
            self.refresh(family, states);
            let start = match resume_after.take() {
                Some(last) => states
                    .iter()
                    .position(|s| s.qn == last)
                    .map_or(0, |index| index + 1),
                None => 0,
            };
            let selected: Vec<usize> = (start..states.len())
                .filter(|&i| cycle == 1 || !states[i].is_converged(&self.thresholds))
                .collect();

            if !header_written {
                if selected.is_empty() {
                    debug!("{} states: nothing to run in cycle {}", family, cycle);
                    continue;
                }
                checkpoint::write_cycle_header(&log_path, cycle)?;
            }
            header_written = false;

            if !selected.is_empty() {
                info!(
                    "{} states: cycle {} with {} job(s)",
                    family,
                    cycle,
                    selected.len()
                );
                let jobs = self.jobs(family, cycle, states, &selected)?;
                self.dispatcher.dispatch(&jobs, Some(&log_path))?;
                attempted.push(cycle);
            }

            self.refresh(family, states);
            if cycle < MAX_CYCLES {
                self.record_failed_orbitals(family, cycle, states)?;
            }
            let failing = states
                .iter()
                .filter(|s| !s.is_converged(&self.thresholds))
                .count();
            info!(
                "{} states: {} of {} converged after cycle {}",
                family,
                states.len() - failing,
                states.len(),
                cycle
            );
        }

        checkpoint::write_finalized(&log_path)?;
        let report = self.report(family, states, attempted);
        self.write_by_hand(family, states, &report.by_hand)?;
        Ok(report)
    }

    fn jobs(&self, family: Family, cycle: u8, states: &[State], selected: &[usize]) -> Result<Vec<Job>> {
        let kind = TemplateKind::for_cycle(cycle);
        selected
            .iter()
            .map(|&i| {
                let state = &states[i];
                let overrides = state.failed_orbitals.overrides_for(cycle);
                let input = self.templates.render_state(
                    kind,
                    &StateInput {
                        atomic_number: self.atomic_number,
                        configuration: &state.configuration,
                        two_j: state.qn.two_j,
                        eigenvalue: state.qn.eigenvalue,
                        failed_orbitals: &overrides,
                    },
                )?;
                Ok(Job::new(
                    self.naming.state_dir(family, &state.qn),
                    input,
                    state.qn.to_string(),
                ))
            })
            .collect()
    }

    /// Reloads every state's parameters from its current output.
    pub fn refresh(&self, family: Family, states: &mut [State]) {
        for state in states.iter_mut() {
            state.params = output::state_output_or_default(&self.naming.state_output(family, &state.qn)).params;
        }
    }

    fn record_failed_orbitals(&self, family: Family, cycle: u8, states: &mut [State]) -> Result<()> {
        for state in states.iter_mut() {
            if state.is_converged(&self.thresholds) {
                continue;
            }
            let parsed = output::state_output_or_default(&self.naming.state_output(family, &state.qn));
            let orbital = match parsed.failed_orbital {
                Some(orbital) => orbital,
                None => continue,
            };
            state.failed_orbitals.record(cycle, &orbital);
            let path = self.naming.failed_orbitals(family, &state.qn);
            fs::write(&path, state.failed_orbitals.to_text()).map_err(|source| CycleError::Io {
                path: path.clone(),
                source,
            })?;
            debug!("{}: orbital {} failed in cycle {}", state.qn, orbital, cycle);
        }
        Ok(())
    }

    fn clear_failed_orbitals(&self, family: Family, states: &mut [State]) -> Result<()> {
        for state in states.iter_mut() {
            state.failed_orbitals = FailedOrbitals::default();
            let path = self.naming.failed_orbitals(family, &state.qn);
            if path.exists() {
                fs::remove_file(&path).map_err(|source| CycleError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    fn load_failed_orbitals(&self, family: Family, states: &mut [State]) -> Result<()> {
        for state in states.iter_mut() {
            let path = self.naming.failed_orbitals(family, &state.qn);
            state.failed_orbitals = match checkpoint::read_optional(&path)? {
                Some(text) => FailedOrbitals::from_text(&text),
                None => FailedOrbitals::default(),
            };
        }
        Ok(())
    }

    fn report(&self, family: Family, states: &[State], attempted: Vec<u8>) -> CycleReport {
        let by_hand: Vec<QuantumNumbers> = states
            .iter()
            .filter(|s| !s.is_converged(&self.thresholds))
            .map(|s| s.qn)
            .collect();
        CycleReport {
            family,
            attempted,
            converged: states.len() - by_hand.len(),
            by_hand,
        }
    }

    fn write_by_hand(&self, family: Family, states: &[State], by_hand: &[QuantumNumbers]) -> Result<()> {
        let path = self.naming.by_hand(family);
        let io = |source| CycleError::Io {
            path: path.clone(),
            source,
        };
        if by_hand.is_empty() {
            if path.exists() {
                fs::remove_file(&path).map_err(io)?;
            }
            return Ok(());
        }
        warn!(
            "{} states: {} level(s) did not converge after {} cycles, see {}",
            family,
            by_hand.len(),
            MAX_CYCLES,
            path.display()
        );
        let text: String = states
            .iter()
            .filter(|s| by_hand.contains(&s.qn))
            .map(|s| format!("{}; {}; {:?}\n", s.qn, s.shell_label, s.params.classify(&self.thresholds)))
            .collect();
        fs::write(&path, text).map_err(io)
    }
}

/// Sorts states by ascending total energy, keeping discovery order for ties.
pub fn sort_by_energy(states: &mut [State]) {
    states.sort_by(|a, b| a.params.total_energy.total_cmp(&b.params.total_energy));
}
