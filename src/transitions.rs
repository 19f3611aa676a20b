//! Transition pair enumeration and dispatch.
//!
//! Pairs are built from energy-sorted (ascending) state lists:
//!
//! - same family (radiative classes): every pair of distinct states, the
//!   lower-energy one being the final state;
//! - across families (Auger classes): for every initial state, the final
//!   states in ascending energy up to, not including, the first one whose
//!   energy is not below the initial energy. The scan stops there.
//!
//! Every transition job gets `initial.f09` and `final.f09` copies of the two
//! state wavefunctions for the duration of its sub-batch.

use crate::checkpoint::{self, CheckpointError, TransitionResume};
use crate::config::TransitionClass;
use crate::dispatcher::{DispatchError, Dispatcher, Job, Staged};
use crate::naming::{FileNaming, FINAL_WAVEFUNCTION, INITIAL_WAVEFUNCTION};
use crate::output;
use crate::state::{format_pair, Endpoint, State, Transition};
use crate::template::{TemplateError, TemplateSet, TransitionInput};
use log::{info, warn};
use thiserror::Error;

/// Errors raised while running a transition class.
#[derive(Error, Debug)]
pub enum TransitionError {
    /// A pair sub-batch could not be staged or launched
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// A transition input could not be rendered
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// The transition log could not be read or written
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Result type for transition classes
pub type Result<T> = std::result::Result<T, TransitionError>;

/// `(initial, final)` index pairs within one sorted list.
pub fn radiative_pairs(states: &[State]) -> Vec<(usize, usize)> {
    (0..states.len())
        .flat_map(|initial| (0..initial).map(move |final_state| (initial, final_state)))
        .collect()
}

/// `(initial, final)` index pairs between two sorted lists, energy-allowed only.
pub fn auger_pairs(initial: &[State], finals: &[State]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (i, state) in initial.iter().enumerate() {
        for (f, candidate) in finals.iter().enumerate() {
            if state.params.total_energy - candidate.params.total_energy <= 0.0 {
                break;
            }
            pairs.push((i, f));
        }
    }
    pairs
}

/// Runs the transition jobs of each class.
pub struct TransitionRunner<'a> {
    naming: &'a FileNaming,
    templates: &'a TemplateSet,
    dispatcher: &'a Dispatcher<'a>,
    atomic_number: u32,
}

impl<'a> TransitionRunner<'a> {
    /// Runner for transitions of an atom with `atomic_number`.
    pub fn new(
        naming: &'a FileNaming,
        templates: &'a TemplateSet,
        dispatcher: &'a Dispatcher<'a>,
        atomic_number: u32,
    ) -> Self {
        Self {
            naming,
            templates,
            dispatcher,
            atomic_number,
        }
    }

    /// Enumerates, dispatches and reads back one class.
    ///
    /// `finals` is ignored for radiative classes, whose pairs come from
    /// `initial` alone.
    pub fn run_class(
        &self,
        class: TransitionClass,
        initial: &[State],
        finals: &[State],
        resume: &TransitionResume,
    ) -> Result<Vec<Transition>> {
        let finals = if class.is_radiative() { initial } else { finals };
        let pairs = if class.is_radiative() {
            radiative_pairs(initial)
        } else {
            auger_pairs(initial, finals)
        };
        let key = |&(i, f): &(usize, usize)| (initial[i].qn, finals[f].qn);

        let log = self.naming.transition_log(class);
        let start = match resume {
            TransitionResume::Finished => pairs.len(),
            TransitionResume::Partial { last: None } => 0,
            TransitionResume::Partial { last: Some(last) } => {
                match pairs.iter().position(|p| key(p) == *last) {
                    Some(index) => index + 1,
                    None => {
                        warn!(
                            "{} transitions: {} is not a pair of this run, restarting the class",
                            class,
                            format_pair(&last.0, &last.1)
                        );
                        checkpoint::write_transitions_header(&log)?;
                        0
                    }
                }
            }
            TransitionResume::NotStarted => {
                checkpoint::write_transitions_header(&log)?;
                0
            }
        };

        if start < pairs.len() {
            info!(
                "{} transitions: {} of {} pair(s) to calculate",
                class,
                pairs.len() - start,
                pairs.len()
            );
            let jobs = pairs[start..]
                .iter()
                .map(|&(i, f)| self.job(class, &initial[i], &finals[f]))
                .collect::<Result<Vec<Job>>>()?;
            self.dispatcher.dispatch(&jobs, Some(&log))?;
        }
        if *resume != TransitionResume::Finished {
            checkpoint::write_transitions_finished(&log, class)?;
        }

        Ok(pairs
            .iter()
            .map(|&(i, f)| self.read(class, &initial[i], &finals[f]))
            .collect())
    }

    fn job(&self, class: TransitionClass, initial: &State, final_state: &State) -> Result<Job> {
        let dir = self.naming.transition_dir(class, &initial.qn, &final_state.qn);
        let input = self.templates.render_transition(
            class.is_radiative(),
            &TransitionInput {
                atomic_number: self.atomic_number,
                initial: &Endpoint::from(initial),
                final_state: &Endpoint::from(final_state),
                initial_wavefunction: INITIAL_WAVEFUNCTION,
                final_wavefunction: FINAL_WAVEFUNCTION,
            },
        )?;
        let staged = vec![
            Staged {
                from: self
                    .naming
                    .state_wavefunction(class.initial_family(), &initial.qn),
                to: dir.join(INITIAL_WAVEFUNCTION),
            },
            Staged {
                from: self
                    .naming
                    .state_wavefunction(class.final_family(), &final_state.qn),
                to: dir.join(FINAL_WAVEFUNCTION),
            },
        ];
        Ok(Job {
            dir,
            input,
            marker: format_pair(&initial.qn, &final_state.qn),
            staged,
        })
    }

    fn read(&self, class: TransitionClass, initial: &State, final_state: &State) -> Transition {
        let mut transition = Transition::new(initial, final_state);
        let path = self
            .naming
            .transition_output(class, &initial.qn, &final_state.qn);
        match output::read_transition_output(&path, class.is_radiative()) {
            Ok(parsed) => {
                transition.energy = parsed.energy;
                transition.rate = parsed.rate;
                transition.multipoles = parsed.multipoles;
            }
            Err(e) => warn!(
                "{} transition {}: {}; rate set to 0",
                class,
                format_pair(&initial.qn, &final_state.qn),
                e
            ),
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::QuantumNumbers;

    fn sorted(energies: &[f64]) -> Vec<State> {
        energies
            .iter()
            .enumerate()
            .map(|(i, &e)| {
                let mut state = State::new(QuantumNumbers::new(i, 1, 1), "x", "(1s)1");
                state.params.total_energy = e;
                state
            })
            .collect()
    }

    #[test]
    fn test_radiative_pairs_put_lower_state_last() {
        let states = sorted(&[-30.0, -20.0, -10.0]);
        assert_eq!(radiative_pairs(&states), vec![(1, 0), (2, 0), (2, 1)]);
        assert!(radiative_pairs(&states[..1]).is_empty());
    }

    #[test]
    fn test_auger_pairs_stop_at_first_forbidden_final_state() {
        let finals = sorted(&[-50.0, -40.0, -30.0]);

        // Below every final state
        assert!(auger_pairs(&sorted(&[-60.0]), &finals).is_empty());
        // Equal energy is forbidden too
        assert!(auger_pairs(&sorted(&[-50.0]), &finals).is_empty());
        // Between: only the cheaper final states
        assert_eq!(auger_pairs(&sorted(&[-35.0]), &finals), vec![(0, 0), (0, 1)]);
        // Above all
        assert_eq!(
            auger_pairs(&sorted(&[-10.0]), &finals),
            vec![(0, 0), (0, 1), (0, 2)]
        );
    }

    #[test]
    fn test_auger_scan_breaks_instead_of_skipping() {
        // An unsorted tail after the forbidden state is never reached
        let finals = sorted(&[-50.0, -20.0, -45.0]);
        assert_eq!(auger_pairs(&sorted(&[-30.0]), &finals), vec![(0, 0)]);
    }
}
