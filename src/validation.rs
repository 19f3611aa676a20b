//! Run configuration validation for openhole.
//!
//! Validation happens once, before anything is written to the calculation
//! tree, so that a bad input fails fast with a message that says what to
//! change instead of failing hours later inside a batch.
//!
//! # Features
//!
//! - Element and family checks (the atom must keep electrons after the holes)
//! - Threshold and worker-count checks
//! - Directory existence checks for manual configurations and user templates
//! - Configuration guidance printed before a run starts

use crate::config::{Config, ConfigurationMode, Family};
use crate::settings::Settings;
use log::warn;
use std::path::Path;

/// Heaviest element the shell table can describe.
pub const MAX_ATOMIC_NUMBER: u32 = 118;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error with user guidance.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Error category for programmatic handling
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Optional suggestion for fixing the issue
    pub suggestion: Option<String>,
    /// Optional reference to documentation or examples
    pub reference: Option<String>,
}

/// Categories of validation errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// Element outside the supported range
    UnsupportedElement,
    /// Requested family cannot be built for this element
    IncompatibleCombination,
    /// Invalid configuration parameters
    InvalidConfiguration,
    /// Missing required files or directories
    MissingDependencies,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nSuggestion: {}", suggestion)?;
        }
        if let Some(reference) = &self.reference {
            write!(f, "\n\nFor more information: {}", reference)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Validates a run configuration.
///
/// `configurations_dir` is the directory the manual configuration lists
/// will be read from; it is only checked in manual mode.
///
/// # Examples
///
/// ```
/// use openhole::config::Config;
/// use openhole::validation::validate_config;
/// use std::path::Path;
///
/// let mut config = Config::default();
/// config.atomic_number = 10;
/// assert!(validate_config(&config, Path::new("configurations")).is_ok());
///
/// config.atomic_number = 0;
/// assert!(validate_config(&config, Path::new("configurations")).is_err());
/// ```
pub fn validate_config(config: &Config, configurations_dir: &Path) -> ValidationResult<()> {
    validate_element(config)?;
    validate_thresholds(config)?;
    validate_directories(config, configurations_dir)?;
    Ok(())
}

fn validate_element(config: &Config) -> ValidationResult<()> {
    if config.atomic_number == 0 || config.atomic_number > MAX_ATOMIC_NUMBER {
        return Err(ValidationError {
            category: ErrorCategory::UnsupportedElement,
            message: format!(
                "Atomic number {} is outside the supported range 1..={}",
                config.atomic_number, MAX_ATOMIC_NUMBER
            ),
            suggestion: Some("Set atomic_number to the Z of a real element".to_string()),
            reference: None,
        });
    }

    // Every state must keep at least one electron
    for family in config.families() {
        if config.mode == ConfigurationMode::Automatic
            && family.removed_electrons() >= config.electrons()
        {
            return Err(ValidationError {
                category: ErrorCategory::IncompatibleCombination,
                message: format!(
                    "Z = {} has {} electron(s), too few for {} states",
                    config.atomic_number,
                    config.electrons(),
                    family
                ),
                suggestion: Some(match family {
                    Family::ThreeHole => "Set three_holes = false".to_string(),
                    Family::ShakeUp => "Set shake_up = false".to_string(),
                    Family::Excitation => "Set excitation = false".to_string(),
                    _ => format!(
                        "Automatic mode always runs one-hole and two-hole states, which needs Z >= 3; \
                         for Z = {} use mode = manual with hand-written configuration lists",
                        config.atomic_number
                    ),
                }),
                reference: None,
            });
        }
    }
    Ok(())
}

fn validate_thresholds(config: &Config) -> ValidationResult<()> {
    let thresholds = &config.thresholds;
    for (name, value) in [
        ("energy_diff_threshold", thresholds.energy_diff),
        ("overlap_threshold", thresholds.overlap),
        ("accuracy_threshold", thresholds.accuracy),
    ] {
        if !value.is_finite() || value <= 0.0 {
            return Err(ValidationError {
                category: ErrorCategory::InvalidConfiguration,
                message: format!("{} must be a positive number, found {}", name, value),
                suggestion: Some(format!(
                    "Remove {} from the input to use the default",
                    name
                )),
                reference: None,
            });
        }
    }
    Ok(())
}

fn validate_directories(config: &Config, configurations_dir: &Path) -> ValidationResult<()> {
    if config.mode == ConfigurationMode::Manual && !configurations_dir.is_dir() {
        return Err(ValidationError {
            category: ErrorCategory::MissingDependencies,
            message: format!(
                "Manual mode needs the configuration directory {}",
                configurations_dir.display()
            ),
            suggestion: Some(
                "Create it with 1hole.csv and 2hole.csv (plus 3hole.csv, shakeup.csv, \
                 excitation.csv when enabled), or use mode = auto"
                    .to_string(),
            ),
            reference: Some(
                "Each line of a configuration file reads '<configuration>, <label>'".to_string(),
            ),
        });
    }
    if let Some(dir) = &config.templates_dir {
        if !dir.is_dir() {
            return Err(ValidationError {
                category: ErrorCategory::MissingDependencies,
                message: format!("Template directory {} does not exist", dir.display()),
                suggestion: Some(
                    "Remove templates_dir to use the built-in templates".to_string(),
                ),
                reference: None,
            });
        }
    }
    Ok(())
}

/// Worker count for the run: the input value, else the settings default,
/// capped at the number of CPUs.
pub fn resolve_threads(config: &Config, settings: &Settings) -> usize {
    let requested = if config.threads > 0 {
        config.threads
    } else {
        settings.general.default_threads.max(1)
    };
    let cpus = num_cpus::get();
    if requested > cpus {
        warn!(
            "{} threads requested but only {} CPUs are available, using {}",
            requested, cpus, cpus
        );
        cpus
    } else {
        requested
    }
}

/// Prints what the run is going to calculate.
pub fn provide_user_guidance(config: &Config, threads: usize) {
    println!("\n****Run Configuration****");
    println!(
        "Element: Z = {} ({} electrons), label '{}'",
        config.atomic_number,
        config.electrons(),
        config.label
    );
    println!("Configurations: {}", config.mode);
    let families: Vec<String> = config.families().iter().map(|f| f.to_string()).collect();
    println!("State families: {}", families.join(", "));
    let classes: Vec<String> = config
        .transition_classes()
        .iter()
        .map(|c| c.to_string())
        .collect();
    println!("Transition classes: {}", classes.join(", "));
    println!("Solver workers: {}", threads);

    if config.nuclear_model {
        println!("Nuclear model: using the nuclear-model template variants");
    }
    if config.mode == ConfigurationMode::Manual {
        println!("Manual Mode: electron counts of the configuration lists are checked before discovery");
    }
    if config.three_holes || config.shake_up {
        println!("Note: three-hole and shake-up families multiply the number of solver jobs");
    }
    println!("****End Run Configuration****\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn neon() -> Config {
        Config {
            atomic_number: 10,
            label: "Ne".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_atomic_number_range() {
        let dir = Path::new("unused");
        assert!(validate_config(&neon(), dir).is_ok());

        let config = Config {
            atomic_number: 119,
            ..neon()
        };
        let error = validate_config(&config, dir).unwrap_err();
        assert_eq!(error.category, ErrorCategory::UnsupportedElement);
    }

    #[test]
    fn test_three_holes_need_electrons() {
        let config = Config {
            atomic_number: 3,
            three_holes: true,
            ..neon()
        };
        let error = validate_config(&config, Path::new("unused")).unwrap_err();
        assert_eq!(error.category, ErrorCategory::IncompatibleCombination);
        assert!(error.to_string().contains("three_holes = false"));
    }

    #[test]
    fn test_helium_runs_in_manual_mode_only() {
        let helium = Config {
            atomic_number: 2,
            label: "He".to_string(),
            ..Config::default()
        };
        let error = validate_config(&helium, Path::new("unused")).unwrap_err();
        assert_eq!(error.category, ErrorCategory::IncompatibleCombination);
        let suggestion = error.suggestion.clone().unwrap();
        assert!(suggestion.contains("Z >= 3"));
        assert!(suggestion.contains("mode = manual"));

        let temp_dir = TempDir::new().unwrap();
        let manual = Config {
            mode: ConfigurationMode::Manual,
            ..helium
        };
        assert!(validate_config(&manual, temp_dir.path()).is_ok());
    }

    #[test]
    fn test_thresholds_must_be_positive() {
        let mut config = neon();
        config.thresholds.overlap = 0.0;
        let error = validate_config(&config, Path::new("unused")).unwrap_err();
        assert_eq!(error.category, ErrorCategory::InvalidConfiguration);
        assert!(error.message.contains("overlap_threshold"));
    }

    #[test]
    fn test_manual_mode_needs_directory() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            mode: ConfigurationMode::Manual,
            ..neon()
        };
        assert!(validate_config(&config, temp_dir.path()).is_ok());

        let missing = temp_dir.path().join("missing");
        let error = validate_config(&config, &missing).unwrap_err();
        assert_eq!(error.category, ErrorCategory::MissingDependencies);
        assert!(error.reference.is_some());
    }

    #[test]
    fn test_thread_resolution() {
        let settings = Settings::default();
        let config = Config {
            threads: 1,
            ..neon()
        };
        assert_eq!(resolve_threads(&config, &settings), 1);

        let config = Config {
            threads: usize::MAX,
            ..neon()
        };
        assert_eq!(resolve_threads(&config, &settings), num_cpus::get());

        let resolved = resolve_threads(&neon(), &settings);
        assert!(resolved >= 1 && resolved <= settings.general.default_threads);
    }
}
