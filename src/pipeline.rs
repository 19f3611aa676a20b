//! The resumable run driver.
//!
//! A run is a loop over checkpoint decisions: read every log of the
//! calculation tree, decide the next stage with [`checkpoint::decide`], run
//! that stage, and read the logs again. A fresh run and an interrupted run
//! go through the same loop, so whatever a crash left behind is picked up
//! at the narrowest point the logs allow:
//!
//! 1. state families: discovery and up to four refinement cycles
//! 2. energy sort of every family
//! 3. transition classes, each resumed on its own
//! 4. aggregation into spectra, widths and yields
//!
//! A decision that repeats means the last stage did not move the logs
//! forward; the loop stops with [`RunError::Stalled`] instead of spinning.

use crate::checkpoint::{self, CheckpointError, ResumeDecision, TransitionResume};
use crate::cleanup::{CleanupConfig, CleanupError, CleanupManager};
use crate::config::{Config, Family, TransitionClass};
use crate::cycle::{self, CycleError, CycleRunner};
use crate::dispatcher::{BatchLimits, Dispatcher};
use crate::enumerator::{self, Configuration, EnumerationError};
use crate::launcher::{self, LaunchError, Launcher};
use crate::naming::FileNaming;
use crate::parser::{ParseError, RunParameters};
use crate::rates::{self, RatesError, Summary, TransitionsByClass};
use crate::settings::{ConfigError, Settings};
use crate::state::{QuantumNumbers, State};
use crate::template::{TemplateError, TemplateSet};
use crate::transitions::{TransitionError, TransitionRunner};
use crate::validation::{self, ValidationError};
use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Every fatal error of a run.
#[derive(Error, Debug)]
pub enum RunError {
    /// Run input or run parameters
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Program settings
    #[error(transparent)]
    Settings(#[from] ConfigError),
    /// Configuration rejected before any job ran
    #[error("Invalid configuration: {0}")]
    Validation(#[from] ValidationError),
    /// Configuration enumeration
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),
    /// Solver templates
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// Launcher construction
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// Checkpoint logs
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// State refinement
    #[error(transparent)]
    Cycle(#[from] CycleError),
    /// Transition calculations
    #[error(transparent)]
    Transition(#[from] TransitionError),
    /// Result writing
    #[error(transparent)]
    Rates(#[from] RatesError),
    /// Scratch cleanup
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
    /// Calculation tree I/O
    #[error("IO error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// Logs and enumeration disagree in a way a resume cannot repair
    #[error("Inconsistent calculation tree: {0}")]
    Inconsistent(String),
    /// The same decision came back after acting on it
    #[error("No progress on resume decision: {0}")]
    Stalled(String),
}

/// Result type for runs
pub type Result<T> = std::result::Result<T, RunError>;

/// Everything derived from the input before the first job runs.
struct Plan {
    naming: FileNaming,
    configurations: BTreeMap<Family, Vec<Configuration>>,
    expected: BTreeMap<Family, Vec<QuantumNumbers>>,
}

/// Reconciles the run parameters, validates the configuration and
/// enumerates every family.
///
/// With `record` unset nothing is written to the calculation tree.
fn plan(config: &mut Config, parent: &Path, record: bool) -> Result<Plan> {
    let naming = FileNaming::new(parent, &config.label);
    let parameters_path = naming.run_parameters();
    if parameters_path.exists() {
        let recorded = RunParameters::read(&parameters_path)?;
        for change in recorded.apply_to(config) {
            warn!("Run parameters: {}", change);
        }
    }

    let configurations_dir = config
        .configurations_dir
        .clone()
        .unwrap_or_else(|| naming.root().join("configurations"));
    validation::validate_config(config, &configurations_dir)?;

    if record && !parameters_path.exists() {
        fs::create_dir_all(naming.root()).map_err(|source| RunError::Io {
            path: naming.root().to_path_buf(),
            source,
        })?;
        RunParameters::from_config(config).write(&parameters_path)?;
        info!("Recorded run parameters in {}", parameters_path.display());
    }

    let configurations = enumerator::build_configurations(config, &configurations_dir)?;
    let expected = configurations
        .iter()
        .map(|(family, list)| (*family, enumerator::discover(list)))
        .collect();
    Ok(Plan {
        naming,
        configurations,
        expected,
    })
}

/// Current resume decision of the calculation described by `config`,
/// without dispatching or writing anything.
pub fn status(mut config: Config, parent: &Path) -> Result<ResumeDecision> {
    let plan = plan(&mut config, parent, false)?;
    let snapshot = checkpoint::snapshot(&plan.naming, &config, &plan.expected)?;
    Ok(checkpoint::decide(&snapshot)?)
}

/// One calculation and everything needed to drive it.
pub struct RunContext {
    config: Config,
    settings: Settings,
    naming: FileNaming,
    templates: TemplateSet,
    launcher: Box<dyn Launcher>,
    configurations: BTreeMap<Family, Vec<Configuration>>,
    expected: BTreeMap<Family, Vec<QuantumNumbers>>,
}

impl RunContext {
    /// Prepares the calculation tree under `parent/<label>` with a given
    /// launcher.
    pub fn new(
        mut config: Config,
        settings: Settings,
        parent: &Path,
        launcher: Box<dyn Launcher>,
    ) -> Result<Self> {
        let Plan {
            naming,
            configurations,
            expected,
        } = plan(&mut config, parent, true)?;
        let templates = TemplateSet::load(config.templates_dir.as_deref(), config.nuclear_model)?;
        info!(
            "Launcher: {} ({} family(ies), {} transition class(es))",
            launcher.name(),
            expected.len(),
            config.transition_classes().len()
        );
        Ok(Self {
            config,
            settings,
            naming,
            templates,
            launcher,
            configurations,
            expected,
        })
    }

    /// Prepares the calculation with the launcher selected in the settings.
    pub fn prepare(config: Config, settings: Settings, parent: &Path) -> Result<Self> {
        let threads = validation::resolve_threads(&config, &settings);
        let solver = config
            .solver
            .clone()
            .unwrap_or_else(|| settings.solver.command.clone());
        let launcher = launcher::from_settings(&settings, &solver, threads)?;
        validation::provide_user_guidance(&config, threads);
        Self::new(config, settings, parent, launcher)
    }

    /// Configuration after reconciliation with the recorded parameters.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Layout of the calculation tree.
    pub fn naming(&self) -> &FileNaming {
        &self.naming
    }

    /// Triples of every family in discovery order.
    pub fn expected(&self) -> &BTreeMap<Family, Vec<QuantumNumbers>> {
        &self.expected
    }

    /// Reads every log and decides the next stage.
    pub fn decide(&self) -> Result<ResumeDecision> {
        let snapshot = checkpoint::snapshot(&self.naming, &self.config, &self.expected)?;
        Ok(checkpoint::decide(&snapshot)?)
    }

    /// Drives the calculation to the end and returns the aggregated results.
    pub fn run(&self) -> Result<Summary> {
        let mut previous: Option<ResumeDecision> = None;
        loop {
            let decision = self.decide()?;
            info!("Resume decision: {}", decision);
            if previous.as_ref() == Some(&decision) {
                return Err(RunError::Stalled(decision.to_string()));
            }

            match &decision {
                ResumeDecision::Redo { families } => {
                    for (family, resume) in families {
                        self.run_family(*family, resume)?;
                    }
                }
                ResumeDecision::ProceedToSort => self.sort(&self.config.families())?,
                ResumeDecision::Resort { families } => self.sort(families)?,
                ResumeDecision::ProceedToTransitions => {
                    let classes: Vec<(TransitionClass, TransitionResume)> = self
                        .config
                        .transition_classes()
                        .into_iter()
                        .map(|class| (class, TransitionResume::NotStarted))
                        .collect();
                    self.run_transitions(&classes)?;
                }
                ResumeDecision::ProceedToTransitionsPartial { classes } => {
                    self.run_transitions(classes)?;
                }
                ResumeDecision::ProceedToSpectra => return self.spectra(),
            }
            previous = Some(decision);
        }
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(
            self.launcher.as_ref(),
            BatchLimits {
                arg_max: self.settings.parallel.arg_max,
                safety_divisor: self.settings.parallel.safety_divisor,
            },
        )
    }

    fn cleanup_manager(&self) -> CleanupManager {
        CleanupManager::new(CleanupConfig::from_settings(&self.settings))
    }

    fn configurations_of(&self, family: Family) -> Result<&[Configuration]> {
        self.configurations
            .get(&family)
            .map(Vec::as_slice)
            .ok_or_else(|| RunError::Inconsistent(format!("{} states are not part of this run", family)))
    }

    fn state(&self, family: Family, qn: QuantumNumbers) -> Result<State> {
        let configuration = self.configurations_of(family)?.get(qn.shell).ok_or_else(|| {
            RunError::Inconsistent(format!(
                "{} state {} refers to configuration {} which does not exist",
                family, qn, qn.shell
            ))
        })?;
        Ok(State::new(qn, &configuration.label, &configuration.configuration))
    }

    /// States of a family in discovery order, with default parameters.
    fn family_states(&self, family: Family) -> Result<Vec<State>> {
        self.expected
            .get(&family)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .map(|qn| self.state(family, *qn))
            .collect()
    }

    /// States of a family in energy order, as recorded by the sorted log.
    fn sorted_states(&self, family: Family) -> Result<Vec<State>> {
        let path = self.naming.sorted_log(family);
        let entries = checkpoint::read_sorted(&path)?.ok_or_else(|| {
            RunError::Inconsistent(format!("{} is missing", path.display()))
        })?;
        entries
            .into_iter()
            .map(|(qn, params)| {
                let mut state = self.state(family, qn)?;
                state.params = params;
                Ok(state)
            })
            .collect()
    }

    fn run_family(&self, family: Family, resume: &checkpoint::FamilyResume) -> Result<()> {
        // A redone family invalidates whatever was sorted before
        let sorted = self.naming.sorted_log(family);
        if sorted.exists() {
            warn!("{} states: removing stale {}", family, sorted.display());
            fs::remove_file(&sorted).map_err(|source| RunError::Io {
                path: sorted.clone(),
                source,
            })?;
        }

        let mut states = self.family_states(family)?;
        let dispatcher = self.dispatcher();
        let runner = CycleRunner::new(
            &self.naming,
            &self.templates,
            &dispatcher,
            self.config.atomic_number,
            self.config.thresholds,
        );
        let report = runner.run_family(family, &mut states, resume)?;
        println!(
            "{} states: {} of {} converged, {} left for manual review",
            family,
            report.converged,
            states.len(),
            report.by_hand.len()
        );

        let dirs: Vec<PathBuf> = states
            .iter()
            .map(|s| self.naming.state_dir(family, &s.qn))
            .collect();
        self.cleanup_manager()
            .cleanup_directories(&format!("{} states", family), dirs.iter())?;
        Ok(())
    }

    fn sort(&self, families: &[Family]) -> Result<()> {
        let dispatcher = self.dispatcher();
        let runner = CycleRunner::new(
            &self.naming,
            &self.templates,
            &dispatcher,
            self.config.atomic_number,
            self.config.thresholds,
        );
        for &family in families {
            let mut states = self.family_states(family)?;
            runner.refresh(family, &mut states);
            cycle::sort_by_energy(&mut states);
            checkpoint::write_sorted(&self.naming.sorted_log(family), &states)?;
            info!("{} states: sorted {} levels by energy", family, states.len());
        }
        Ok(())
    }

    fn class_states(&self, class: TransitionClass) -> Result<(Vec<State>, Vec<State>)> {
        let initial = self.sorted_states(class.initial_family())?;
        let finals = if class.is_radiative() {
            Vec::new()
        } else {
            self.sorted_states(class.final_family())?
        };
        Ok((initial, finals))
    }

    fn run_transitions(&self, classes: &[(TransitionClass, TransitionResume)]) -> Result<()> {
        let dispatcher = self.dispatcher();
        let runner = TransitionRunner::new(
            &self.naming,
            &self.templates,
            &dispatcher,
            self.config.atomic_number,
        );
        let cleanup = self.cleanup_manager();
        for (class, resume) in classes {
            let (initial, finals) = self.class_states(*class)?;
            let transitions = runner.run_class(*class, &initial, &finals, resume)?;
            println!("{} transitions: {} pair(s) finished", class, transitions.len());

            let dirs: Vec<PathBuf> = transitions
                .iter()
                .map(|t| {
                    self.naming
                        .transition_dir(*class, &t.initial.qn, &t.final_state.qn)
                })
                .collect();
            cleanup.cleanup_directories(&format!("{} transitions", class), dirs.iter())?;
        }
        Ok(())
    }

    fn spectra(&self) -> Result<Summary> {
        let dispatcher = self.dispatcher();
        let runner = TransitionRunner::new(
            &self.naming,
            &self.templates,
            &dispatcher,
            self.config.atomic_number,
        );
        let mut transitions = TransitionsByClass::new();
        for class in self.config.transition_classes() {
            let (initial, finals) = self.class_states(class)?;
            let list = runner.run_class(class, &initial, &finals, &TransitionResume::Finished)?;
            transitions.insert(class, list);
        }

        let summary = rates::summarize(
            self.naming.label(),
            self.config.atomic_number,
            &mut transitions,
        );
        rates::write_results(&self.naming, &summary)?;
        info!(
            "Results written to {}",
            self.naming.results_dir().display()
        );
        Ok(summary)
    }
}
