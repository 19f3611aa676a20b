//! Run-input and run-parameter file parsing.
//!
//! # Run-input format
//!
//! A run is described by a plain `key = value` file. Keys are
//! case-insensitive, `#` starts a comment and blank lines are ignored:
//!
//! ```text
//! # Neon K-shell
//! atomic_number = 10
//! label = Ne
//! mode = auto
//! three_holes = false
//! shake_up = false
//! excitation = false
//! nuclear_model = false
//! threads = 8
//! energy_diff_threshold = 1.0
//! overlap_threshold = 1.0e-6
//! accuracy_threshold = 1.0e-5
//! ```
//!
//! Only `atomic_number` is required. `label` defaults to the file stem and
//! names the root directory of the calculation tree.
//!
//! # Run parameters file
//!
//! The first invocation records the physics-relevant settings in
//! `<root>/run_parameters.txt`:
//!
//! ```text
//! Atomic number Z= 10
//! Number of electrons: 10
//! Configuration mode: auto
//! Three holes: false
//! Shake-up: false
//! Excitation: false
//! Nuclear model: false
//! ```
//!
//! A resumed run re-reads this file and its values take precedence over the
//! run-input file, since the logs on disk were produced with them.

use crate::config::{Config, ConfigurationMode};
use crate::naming::FileNaming;
use log::warn;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for parsing operations.
#[derive(Error, Debug)]
pub enum ParseError {
    /// I/O error when reading or writing files
    #[error("IO error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// Parse error with descriptive message
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Type alias for parse operation results
type Result<T> = std::result::Result<T, ParseError>;

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ParseError::Parse(format!(
            "{} expects true or false, found '{}'",
            key, value
        ))),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ParseError::Parse(format!("invalid value '{}' for {}", value, key)))
}

/// Parses a run-input file.
///
/// Relative `templates_dir` and `configurations_dir` paths are resolved
/// against the directory of the input file.
pub fn parse_input(path: &Path) -> Result<Config> {
    let content = read(path)?;
    let mut config = parse_input_str(&content, &FileNaming::label_from_input(path))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for dir in [&mut config.templates_dir, &mut config.configurations_dir] {
        if let Some(relative) = dir.as_ref().filter(|d| d.is_relative()) {
            *dir = Some(base.join(relative));
        }
    }
    Ok(config)
}

/// Parses the text of a run-input file; `default_label` is used when the
/// file sets none.
pub fn parse_input_str(content: &str, default_label: &str) -> Result<Config> {
    let mut config = Config {
        label: default_label.to_string(),
        ..Config::default()
    };
    let mut has_atomic_number = false;

    for (index, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            ParseError::Parse(format!("line {}: expected 'key = value', found '{}'", index + 1, line))
        })?;
        let key = key.trim().to_lowercase();
        if key == "atomic_number" {
            has_atomic_number = true;
        }
        parse_parameter(&key, value.trim(), &mut config)?;
    }

    if !has_atomic_number {
        return Err(ParseError::Parse("atomic_number is required".to_string()));
    }
    Ok(config)
}

fn parse_parameter(key: &str, value: &str, config: &mut Config) -> Result<()> {
    match key {
        "atomic_number" => config.atomic_number = parse_value(key, value)?,
        "label" => config.label = value.to_string(),
        "mode" => config.mode = value.parse().map_err(ParseError::Parse)?,
        "configurations_dir" => config.configurations_dir = Some(PathBuf::from(value)),
        "three_holes" => config.three_holes = parse_bool(key, value)?,
        "shake_up" => config.shake_up = parse_bool(key, value)?,
        "excitation" => config.excitation = parse_bool(key, value)?,
        "nuclear_model" => config.nuclear_model = parse_bool(key, value)?,
        "threads" => config.threads = parse_value(key, value)?,
        "energy_diff_threshold" => config.thresholds.energy_diff = parse_value(key, value)?,
        "overlap_threshold" => config.thresholds.overlap = parse_value(key, value)?,
        "accuracy_threshold" => config.thresholds.accuracy = parse_value(key, value)?,
        "templates_dir" => config.templates_dir = Some(PathBuf::from(value)),
        "solver" => config.solver = Some(value.to_string()),
        _ => warn!("Ignoring unknown input key '{}'", key),
    }
    Ok(())
}

/// Physics-relevant settings recorded when a calculation starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunParameters {
    /// Nuclear charge Z
    pub atomic_number: u32,
    /// Electrons of the neutral atom
    pub electrons: u32,
    /// Automatic or manual configurations
    pub mode: ConfigurationMode,
    /// Three-hole family enabled
    pub three_holes: bool,
    /// Shake-up family enabled
    pub shake_up: bool,
    /// Excitation family enabled
    pub excitation: bool,
    /// Finite nuclear model templates
    pub nuclear_model: bool,
}

const Z_LABEL: &str = "Atomic number Z=";
const ELECTRONS_LABEL: &str = "Number of electrons:";
const MODE_LABEL: &str = "Configuration mode:";
const THREE_HOLES_LABEL: &str = "Three holes:";
const SHAKE_UP_LABEL: &str = "Shake-up:";
const EXCITATION_LABEL: &str = "Excitation:";
const NUCLEAR_LABEL: &str = "Nuclear model:";

impl RunParameters {
    /// Parameters of `config` as they would be recorded.
    pub fn from_config(config: &Config) -> Self {
        Self {
            atomic_number: config.atomic_number,
            electrons: config.electrons(),
            mode: config.mode,
            three_holes: config.three_holes,
            shake_up: config.shake_up,
            excitation: config.excitation,
            nuclear_model: config.nuclear_model,
        }
    }

    /// Text of `run_parameters.txt`, one labelled value per line.
    pub fn to_text(&self) -> String {
        format!(
            "{} {}\n{} {}\n{} {}\n{} {}\n{} {}\n{} {}\n{} {}\n",
            Z_LABEL,
            self.atomic_number,
            ELECTRONS_LABEL,
            self.electrons,
            MODE_LABEL,
            self.mode,
            THREE_HOLES_LABEL,
            self.three_holes,
            SHAKE_UP_LABEL,
            self.shake_up,
            EXCITATION_LABEL,
            self.excitation,
            NUCLEAR_LABEL,
            self.nuclear_model
        )
    }

    /// Parses the text written by [`RunParameters::to_text`].
    pub fn parse(text: &str) -> Result<Self> {
        let field = |label: &str| -> Result<&str> {
            text.lines()
                .find_map(|line| line.trim().strip_prefix(label))
                .map(str::trim)
                .ok_or_else(|| ParseError::Parse(format!("run parameters lack '{}'", label)))
        };
        Ok(Self {
            atomic_number: parse_value(Z_LABEL, field(Z_LABEL)?)?,
            electrons: parse_value(ELECTRONS_LABEL, field(ELECTRONS_LABEL)?)?,
            mode: field(MODE_LABEL)?.parse().map_err(ParseError::Parse)?,
            three_holes: parse_bool(THREE_HOLES_LABEL, field(THREE_HOLES_LABEL)?)?,
            shake_up: parse_bool(SHAKE_UP_LABEL, field(SHAKE_UP_LABEL)?)?,
            excitation: parse_bool(EXCITATION_LABEL, field(EXCITATION_LABEL)?)?,
            nuclear_model: parse_bool(NUCLEAR_LABEL, field(NUCLEAR_LABEL)?)?,
        })
    }

    /// Reads a recorded parameters file.
    pub fn read(path: &Path) -> Result<Self> {
        Self::parse(&read(path)?)
    }

    /// Records the parameters at `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text()).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overwrites `config` with the recorded values.
    ///
    /// Returns one message per value that differed.
    pub fn apply_to(&self, config: &mut Config) -> Vec<String> {
        let mut changes = Vec::new();
        let mut sync = |name: &str, recorded: String, current: String| {
            if recorded != current {
                changes.push(format!(
                    "{}: input says {}, calculation on disk uses {}",
                    name, current, recorded
                ));
            }
        };
        sync(
            "atomic number",
            self.atomic_number.to_string(),
            config.atomic_number.to_string(),
        );
        sync("configuration mode", self.mode.to_string(), config.mode.to_string());
        sync("three holes", self.three_holes.to_string(), config.three_holes.to_string());
        sync("shake-up", self.shake_up.to_string(), config.shake_up.to_string());
        sync("excitation", self.excitation.to_string(), config.excitation.to_string());
        sync(
            "nuclear model",
            self.nuclear_model.to_string(),
            config.nuclear_model.to_string(),
        );

        config.atomic_number = self.atomic_number;
        config.mode = self.mode;
        config.three_holes = self.three_holes;
        config.shake_up = self.shake_up;
        config.excitation = self.excitation;
        config.nuclear_model = self.nuclear_model;
        changes
    }
}

/// Commented run-input template written by `openhole ci <name>.inp`.
pub fn generate_input_template(label: &str) -> String {
    format!(
        "# openhole run input\n\
         # Lines are 'key = value'; '#' starts a comment.\n\
         \n\
         # Element (required)\n\
         atomic_number = 10\n\
         # Root directory of the calculation tree\n\
         label = {label}\n\
         \n\
         # auto: enumerate configurations, manual: read <configurations_dir>/*.csv\n\
         mode = auto\n\
         # configurations_dir = configurations\n\
         \n\
         # Optional state families (one- and two-hole states are always calculated)\n\
         three_holes = false\n\
         shake_up = false\n\
         excitation = false\n\
         \n\
         # Use the nuclear-model input templates\n\
         nuclear_model = false\n\
         \n\
         # Concurrent solver runs (capped at the CPU count)\n\
         threads = 4\n\
         \n\
         # Convergence thresholds\n\
         energy_diff_threshold = 1.0\n\
         overlap_threshold = 1.0e-6\n\
         accuracy_threshold = 1.0e-5\n\
         \n\
         # templates_dir = templates\n\
         # solver = mcdfgme\n"
    )
}

/// Writes a run-input template.
pub fn create_input_template(path: &Path) -> Result<()> {
    let label = FileNaming::label_from_input(path);
    fs::write(path, generate_input_template(&label)).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_input_str() {
        let text = "\
# comment
Atomic_Number = 29   # copper
three_holes = yes
mode = manual
threads = 12
overlap_threshold = 2.5e-6
solver = /opt/mcdfgme/bin/mcdfgme
";
        let config = parse_input_str(text, "Cu").unwrap();
        assert_eq!(config.atomic_number, 29);
        assert_eq!(config.label, "Cu");
        assert!(config.three_holes);
        assert!(!config.shake_up);
        assert_eq!(config.mode, ConfigurationMode::Manual);
        assert_eq!(config.threads, 12);
        assert_eq!(config.thresholds.overlap, 2.5e-6);
        assert_eq!(config.thresholds.accuracy, 1.0e-5);
        assert_eq!(config.solver.as_deref(), Some("/opt/mcdfgme/bin/mcdfgme"));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(parse_input_str("label = x\n", "x").is_err());
        assert!(parse_input_str("atomic_number = ten\n", "x").is_err());
        assert!(parse_input_str("atomic_number = 10\nshake_up = maybe\n", "x").is_err());
        assert!(parse_input_str("atomic_number 10\n", "x").is_err());
    }

    #[test]
    fn test_parse_input_resolves_relative_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Ne.inp");
        fs::write(&path, "atomic_number = 10\ntemplates_dir = tpl\n").unwrap();
        let config = parse_input(&path).unwrap();
        assert_eq!(config.label, "Ne");
        assert_eq!(config.templates_dir, Some(dir.path().join("tpl")));
    }

    #[test]
    fn test_run_parameters_text() {
        let mut config = Config::default();
        config.atomic_number = 10;
        config.shake_up = true;
        let params = RunParameters::from_config(&config);
        let text = params.to_text();
        assert!(text.starts_with("Atomic number Z= 10\nNumber of electrons: 10\nConfiguration mode: auto\n"));
        assert_eq!(RunParameters::parse(&text).unwrap(), params);
        assert!(RunParameters::parse("Atomic number Z= 10\n").is_err());
    }

    #[test]
    fn test_recorded_parameters_win() {
        let mut recorded = Config::default();
        recorded.atomic_number = 10;
        recorded.three_holes = true;
        let params = RunParameters::from_config(&recorded);

        let mut config = Config::default();
        config.atomic_number = 10;
        config.nuclear_model = true;
        let changes = params.apply_to(&mut config);
        assert_eq!(changes.len(), 2);
        assert!(config.three_holes);
        assert!(!config.nuclear_model);
    }

    #[test]
    fn test_input_template_parses() {
        let config = parse_input_str(&generate_input_template("Ne"), "other").unwrap();
        assert_eq!(config.label, "Ne");
        assert_eq!(config.atomic_number, 10);
    }
}
