//! Configuration structures for an openhole run.
//!
//! This module defines the configuration types shared by every stage of a
//! calculation:
//!
//! - [`Config`]: Main run configuration parsed from the run-input file
//! - [`Thresholds`]: Convergence criteria applied to every state
//! - [`Family`]: The state families (one-hole, two-hole, ...) of a run
//! - [`TransitionClass`]: The transition calculations derived from the families
//! - [`ConfigurationMode`]: Automatic enumeration or externally supplied lists
//! - [`TimeoutPolicy`]: What to do when a solver invocation hangs
//!
//! Configuration can be parsed from input files (see [`parser`](crate::parser))
//! or created programmatically.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Reduced Planck constant in eV*s, used to turn rates into level widths.
pub const HBAR_EV_S: f64 = 6.582119569e-16;

/// Number of refinement cycles every state goes through at most.
pub const MAX_CYCLES: u8 = 4;

/// Convergence criteria for a single state calculation.
///
/// A state is converged only when the solver run completed and all three
/// diagnostics are strictly below their thresholds (see
/// [`ConvergenceParams::classify`](crate::state::ConvergenceParams::classify)).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Largest accepted difference between the two ETOT columns
    pub energy_diff: f64,
    /// Largest accepted wavefunction overlap integral
    pub overlap: f64,
    /// Largest accepted eigenenergy variation of the last cycle
    pub accuracy: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            energy_diff: 1.0,
            overlap: 1.0e-6,
            accuracy: 1.0e-5,
        }
    }
}

/// A family of atomic states calculated together.
///
/// One-hole and two-hole families are part of every run. The remaining
/// families are switched on in the run-input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Family {
    /// Single vacancy states (diagram lines)
    OneHole,
    /// Double vacancy states (Auger final states, satellite lines)
    TwoHole,
    /// Triple vacancy states (satellite Auger final states)
    ThreeHole,
    /// Double vacancy states with one promoted electron
    ShakeUp,
    /// Single vacancy states with one promoted electron
    Excitation,
}

impl Family {
    /// Every family in processing order.
    pub const ALL: [Family; 5] = [
        Family::OneHole,
        Family::TwoHole,
        Family::ThreeHole,
        Family::ShakeUp,
        Family::Excitation,
    ];

    /// Directory of the family below the calculation root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Family::OneHole => "radiative",
            Family::TwoHole => "auger",
            Family::ThreeHole => "satellites",
            Family::ShakeUp => "shakeup",
            Family::Excitation => "excitation",
        }
    }

    /// Name of the manually supplied configuration list.
    pub fn csv_name(self) -> &'static str {
        match self {
            Family::OneHole => "1hole.csv",
            Family::TwoHole => "2hole.csv",
            Family::ThreeHole => "3hole.csv",
            Family::ShakeUp => "shakeup.csv",
            Family::Excitation => "excitation.csv",
        }
    }

    /// Electrons removed from the neutral atom for this family.
    pub fn removed_electrons(self) -> u32 {
        match self {
            Family::OneHole | Family::Excitation => 1,
            Family::TwoHole | Family::ShakeUp => 2,
            Family::ThreeHole => 3,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::OneHole => "one-hole",
            Family::TwoHole => "two-hole",
            Family::ThreeHole => "three-hole",
            Family::ShakeUp => "shake-up",
            Family::Excitation => "excitation",
        };
        f.write_str(name)
    }
}

/// A class of transition calculations between two state families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransitionClass {
    /// Radiative decays inside the one-hole family
    Diagram,
    /// Auger decays from one-hole to two-hole states
    Auger,
    /// Radiative decays inside the two-hole family
    Satellite,
    /// Auger decays from two-hole to three-hole states
    SatelliteAuger,
    /// Radiative decays inside the shake-up family
    ShakeUp,
    /// Radiative decays inside the excitation family
    Excitation,
}

impl TransitionClass {
    /// Every class in processing order.
    pub const ALL: [TransitionClass; 6] = [
        TransitionClass::Diagram,
        TransitionClass::Auger,
        TransitionClass::Satellite,
        TransitionClass::SatelliteAuger,
        TransitionClass::ShakeUp,
        TransitionClass::Excitation,
    ];

    /// Family of the decaying states.
    pub fn initial_family(self) -> Family {
        match self {
            TransitionClass::Diagram | TransitionClass::Auger => Family::OneHole,
            TransitionClass::Satellite | TransitionClass::SatelliteAuger => Family::TwoHole,
            TransitionClass::ShakeUp => Family::ShakeUp,
            TransitionClass::Excitation => Family::Excitation,
        }
    }

    /// Family of the states the decay ends in.
    pub fn final_family(self) -> Family {
        match self {
            TransitionClass::Diagram => Family::OneHole,
            TransitionClass::Auger | TransitionClass::Satellite => Family::TwoHole,
            TransitionClass::SatelliteAuger => Family::ThreeHole,
            TransitionClass::ShakeUp => Family::ShakeUp,
            TransitionClass::Excitation => Family::Excitation,
        }
    }

    /// Radiative classes pair states of one family; the others are Auger.
    pub fn is_radiative(self) -> bool {
        !matches!(self, TransitionClass::Auger | TransitionClass::SatelliteAuger)
    }

    /// Directory and file stem used for this class.
    pub fn dir_name(self) -> &'static str {
        match self {
            TransitionClass::Diagram => "diagram",
            TransitionClass::Auger => "auger",
            TransitionClass::Satellite => "satellite",
            TransitionClass::SatelliteAuger => "satellite_auger",
            TransitionClass::ShakeUp => "shakeup",
            TransitionClass::Excitation => "excitation",
        }
    }
}

impl fmt::Display for TransitionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionClass::Diagram => "Diagram",
            TransitionClass::Auger => "Auger",
            TransitionClass::Satellite => "Satellite",
            TransitionClass::SatelliteAuger => "Satellite Auger",
            TransitionClass::ShakeUp => "Shake-up",
            TransitionClass::Excitation => "Excitation",
        };
        f.write_str(name)
    }
}

/// How the electron configurations of each family are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationMode {
    /// Enumerate configurations from the neutral ground state
    Automatic,
    /// Read `configuration, label` lists supplied by the user
    Manual,
}

impl fmt::Display for ConfigurationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationMode::Automatic => f.write_str("auto"),
            ConfigurationMode::Manual => f.write_str("manual"),
        }
    }
}

impl FromStr for ConfigurationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" => Ok(ConfigurationMode::Automatic),
            "manual" => Ok(ConfigurationMode::Manual),
            other => Err(format!("unknown configuration mode '{}'", other)),
        }
    }
}

/// Behaviour when a solver invocation exceeds the configured timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutPolicy {
    /// Kill the job and abort the whole batch
    Fatal,
    /// Kill the job and relaunch it up to the given number of times
    Retry(u32),
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy::Fatal
    }
}

impl fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPolicy::Fatal => f.write_str("fatal"),
            TimeoutPolicy::Retry(n) => write!(f, "retry:{}", n),
        }
    }
}

impl FromStr for TimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_lowercase();
        if value == "fatal" {
            return Ok(TimeoutPolicy::Fatal);
        }
        if let Some(count) = value.strip_prefix("retry:") {
            return count
                .trim()
                .parse()
                .map(TimeoutPolicy::Retry)
                .map_err(|_| format!("invalid retry count in '{}'", s));
        }
        Err(format!("unknown timeout policy '{}'", s))
    }
}

/// Complete configuration of an openhole run.
///
/// # Required Fields
///
/// Only `atomic_number` has no usable default. Everything else falls back to
/// the values of [`Config::default`].
///
/// # Examples
///
/// ```
/// use openhole::config::{Config, Family};
///
/// let mut config = Config::default();
/// config.atomic_number = 10;
/// config.label = "Ne".to_string();
/// assert_eq!(config.families(), vec![Family::OneHole, Family::TwoHole]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Atomic number Z of the element
    pub atomic_number: u32,
    /// Run label; also the root directory of the calculation tree
    pub label: String,
    /// Automatic enumeration or manual configuration lists
    pub mode: ConfigurationMode,
    /// Calculate three-hole states and satellite Auger transitions
    pub three_holes: bool,
    /// Calculate shake-up states and their radiative transitions
    pub shake_up: bool,
    /// Calculate excitation states and their radiative transitions
    pub excitation: bool,
    /// Use the nuclear-model template variants
    pub nuclear_model: bool,
    /// Concurrent solver invocations, 0 for the settings default
    pub threads: usize,
    /// Convergence thresholds
    pub thresholds: Thresholds,
    /// Directory holding user templates (built-in templates otherwise)
    pub templates_dir: Option<PathBuf>,
    /// Directory holding the manual configuration lists
    pub configurations_dir: Option<PathBuf>,
    /// Solver command overriding the settings file
    pub solver: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            atomic_number: 0,
            label: "openhole_run".to_string(),
            mode: ConfigurationMode::Automatic,
            three_holes: false,
            shake_up: false,
            excitation: false,
            nuclear_model: false,
            threads: 0,
            thresholds: Thresholds::default(),
            templates_dir: None,
            configurations_dir: None,
            solver: None,
        }
    }
}

impl Config {
    /// State families calculated in this run, in processing order.
    pub fn families(&self) -> Vec<Family> {
        Family::ALL
            .iter()
            .copied()
            .filter(|family| self.includes(*family))
            .collect()
    }

    /// Whether the given family is part of this run.
    pub fn includes(&self, family: Family) -> bool {
        match family {
            Family::OneHole | Family::TwoHole => true,
            Family::ThreeHole => self.three_holes,
            Family::ShakeUp => self.shake_up,
            Family::Excitation => self.excitation,
        }
    }

    /// Transition classes whose two families are both part of this run.
    pub fn transition_classes(&self) -> Vec<TransitionClass> {
        TransitionClass::ALL
            .iter()
            .copied()
            .filter(|class| self.includes(class.initial_family()) && self.includes(class.final_family()))
            .collect()
    }

    /// Number of electrons of the neutral atom.
    pub fn electrons(&self) -> u32 {
        self.atomic_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_families_follow_flags() {
        let mut config = Config::default();
        config.three_holes = true;
        config.excitation = true;
        assert_eq!(
            config.families(),
            vec![Family::OneHole, Family::TwoHole, Family::ThreeHole, Family::Excitation]
        );
        assert_eq!(
            config.transition_classes(),
            vec![
                TransitionClass::Diagram,
                TransitionClass::Auger,
                TransitionClass::Satellite,
                TransitionClass::SatelliteAuger,
                TransitionClass::Excitation,
            ]
        );
    }

    #[test]
    fn test_timeout_policy_parsing() {
        assert_eq!("fatal".parse::<TimeoutPolicy>(), Ok(TimeoutPolicy::Fatal));
        assert_eq!("Retry:3".parse::<TimeoutPolicy>(), Ok(TimeoutPolicy::Retry(3)));
        assert!("retry:x".parse::<TimeoutPolicy>().is_err());
        assert!("sometimes".parse::<TimeoutPolicy>().is_err());
        assert_eq!(TimeoutPolicy::Retry(2).to_string(), "retry:2");
    }

    #[test]
    fn test_radiative_classes() {
        assert!(TransitionClass::Diagram.is_radiative());
        assert!(!TransitionClass::Auger.is_radiative());
        assert!(!TransitionClass::SatelliteAuger.is_radiative());
        assert_eq!(TransitionClass::SatelliteAuger.final_family(), Family::ThreeHole);
    }
}
