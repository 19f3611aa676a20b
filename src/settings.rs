//! Program settings for openhole.
//!
//! Settings describe the machine a calculation runs on rather than the
//! calculation itself: which solver binary to call, how jobs are launched,
//! how verbose logging is and which scratch files survive cleanup. They are
//! read from INI files with the following precedence:
//!
//! 1. Local configuration (`./openhole_config.cfg`)
//! 2. User configuration (`~/.config/openhole/openhole_config.cfg`)
//! 3. System configuration (`/etc/openhole/openhole_config.cfg`)
//! 4. Built-in defaults
//!
//! # Configuration File Format
//!
//! ```ini
//! [solver]
//! command = mcdfgme
//! timeout = 0
//! timeout_policy = fatal
//!
//! [parallel]
//! launcher = pool
//! parallel_command = parallel
//! arg_max = 2097152
//! safety_divisor = 17
//!
//! [general]
//! default_threads = 4
//! print_level = 1
//!
//! [logging]
//! level = info
//! file_logging = false
//!
//! [cleanup]
//! enabled = true
//! preserve_extensions = f03
//! verbose = 1
//! ```
//!
//! Keys missing from a file keep the value of the lower-precedence layer.

use crate::config::TimeoutPolicy;
use configparser::ini::Ini;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Name of the settings file at every level of the hierarchy.
pub const SETTINGS_FILE: &str = "openhole_config.cfg";

/// Errors that can occur during settings loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading settings files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid settings value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

type Section = HashMap<String, Option<String>>;

/// All program settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// External solver invocation
    pub solver: SolverSettings,
    /// Batch launching
    pub parallel: ParallelSettings,
    /// General program settings
    pub general: GeneralSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
    /// Cleanup configuration
    pub cleanup: CleanupSettings,
}

/// How the solver binary is called.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Solver command, possibly with arguments (default: "mcdfgme")
    pub command: String,
    /// Per-job wall-clock limit in seconds, 0 disables it (default: 0)
    pub timeout: u64,
    /// What happens when the limit is hit (default: fatal)
    pub timeout_policy: TimeoutPolicy,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            command: "mcdfgme".to_string(),
            timeout: 0,
            timeout_policy: TimeoutPolicy::Fatal,
        }
    }
}

/// Which process pool runs a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LauncherKind {
    /// In-process worker pool (supports timeouts)
    Pool,
    /// One `parallel` invocation per sub-batch
    GnuParallel,
}

impl fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LauncherKind::Pool => f.write_str("pool"),
            LauncherKind::GnuParallel => f.write_str("gnu-parallel"),
        }
    }
}

impl FromStr for LauncherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pool" => Ok(LauncherKind::Pool),
            "gnu-parallel" | "parallel" => Ok(LauncherKind::GnuParallel),
            other => Err(format!("unknown launcher '{}'", other)),
        }
    }
}

/// Batch launching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSettings {
    /// Launcher used for every batch (default: pool)
    pub launcher: LauncherKind,
    /// GNU parallel executable (default: "parallel")
    pub parallel_command: String,
    /// Command-line length limit in bytes (default: 2097152)
    pub arg_max: usize,
    /// Headroom divisor of the batch sizing rule (default: 17)
    pub safety_divisor: usize,
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            launcher: LauncherKind::Pool,
            parallel_command: "parallel".to_string(),
            arg_max: 2_097_152,
            safety_divisor: 17,
        }
    }
}

/// General program settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Worker count when the run input does not set one (default: 4)
    pub default_threads: usize,
    /// Print level for file operations and verbose output (default: 1)
    /// 0 = quiet, 1 = normal, 2 = verbose
    pub print_level: u32,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            default_threads: 4,
            print_level: 1,
        }
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (default: "info")
    pub level: String,
    /// Also write `openhole_<label>.log` in the calculation root (default: false)
    pub file_logging: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging: false,
        }
    }
}

/// Cleanup configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSettings {
    /// Clean finished job directories (default: true)
    pub enabled: bool,
    /// Extra file extensions to keep, on top of the solver files
    pub preserve_extensions: Vec<String>,
    /// 0 = quiet, 1 = normal, 2 = verbose (default: 1)
    pub verbose: u32,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            preserve_extensions: Vec::new(),
            verbose: 1,
        }
    }
}

/// Loads and hands out program settings.
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
}

impl SettingsManager {
    /// Loads settings from the file hierarchy.
    ///
    /// Unreadable files are reported and skipped; the remaining layers still
    /// apply.
    pub fn load() -> Result<Self, ConfigError> {
        let (settings, source) = Self::load_from_files()?;
        info!("Configuration loaded from: {}", source);
        Ok(Self {
            settings,
            config_source: source,
        })
    }

    /// Wraps already built settings (used by tests and embedding code).
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            settings,
            config_source: "in-memory settings".to_string(),
        }
    }

    /// Returns the source of the highest-precedence layer that was applied.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Gets a reference to the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Gets the solver settings.
    pub fn solver(&self) -> &SolverSettings {
        &self.settings.solver
    }

    /// Gets the batch launching settings.
    pub fn parallel(&self) -> &ParallelSettings {
        &self.settings.parallel
    }

    /// Gets the general settings.
    pub fn general(&self) -> &GeneralSettings {
        &self.settings.general
    }

    /// Gets the logging settings.
    pub fn logging(&self) -> &LoggingSettings {
        &self.settings.logging
    }

    /// Gets the cleanup settings.
    pub fn cleanup(&self) -> &CleanupSettings {
        &self.settings.cleanup
    }

    fn load_from_files() -> Result<(Settings, String), ConfigError> {
        let mut settings = Settings::default();
        let mut config_source = "built-in defaults".to_string();

        let layers = [
            ("system", Self::get_system_config_path()),
            ("user", Self::get_user_config_path()),
            ("local", Some(PathBuf::from(SETTINGS_FILE))),
        ];

        for (layer, path) in layers {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            let applied = fs::read_to_string(&path)
                .map_err(ConfigError::from)
                .and_then(|content| settings.apply_ini(&content));
            match applied {
                Ok(()) => {
                    config_source = format!("{} config ({})", layer, path.display());
                    debug!("Loaded {} configuration from: {}", layer, path.display());
                }
                Err(e) => {
                    warn!(
                        "Failed to load {} config from {}: {}",
                        layer,
                        path.display(),
                        e
                    );
                }
            }
        }

        Ok((settings, config_source))
    }

    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/openhole").join(SETTINGS_FILE))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("openhole").join(SETTINGS_FILE))
        }
    }

    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("openhole")
                    .join(SETTINGS_FILE)
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("openhole").join(SETTINGS_FILE))
        }
    }

    /// Writes a commented settings template listing every option with its default.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use openhole::settings::SettingsManager;
    /// use std::path::Path;
    ///
    /// SettingsManager::create_template(Path::new("openhole_config.cfg")).unwrap();
    /// ```
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    fn generate_template_content() -> String {
        let solver = SolverSettings::default();
        let parallel = ParallelSettings::default();
        let general = GeneralSettings::default();
        let logging = LoggingSettings::default();
        let cleanup = CleanupSettings::default();
        format!(
            r#"# openhole settings file
#
# Settings are loaded in hierarchical order, local settings taking precedence:
#
# 1. Current working directory (./{file})
# 2. User config directory (~/.config/openhole/{file})
# 3. System config directory (/etc/openhole/{file})
# 4. Built-in defaults
#
# Missing sections or keys keep the value of the layer below.

[solver]
# Solver executable, run inside every job directory (default: mcdfgme)
command = {command}

# Wall-clock limit per job in seconds, 0 = no limit (default: 0)
# Only honoured by the pool launcher
timeout = {timeout}

# fatal   = kill the job and stop the run
# retry:N = kill the job and relaunch it up to N times
timeout_policy = {policy}

[parallel]
# pool         = built-in worker pool
# gnu-parallel = one GNU parallel call per sub-batch
launcher = {launcher}

# GNU parallel executable (default: parallel)
parallel_command = {parallel_command}

# Longest command line the operating system accepts, in bytes
arg_max = {arg_max}

# Batch sizing headroom: jobs per batch = n * arg_max / total_length / divisor
safety_divisor = {divisor}

[general]
# Concurrent solver runs when the run input sets no 'threads' (default: 4)
default_threads = {threads}

# 0 = quiet, 1 = normal, 2 = verbose
print_level = {print_level}

[logging]
# debug, info, warn, error (default: info)
level = {level}

# Also write openhole_<label>.log into the calculation root (default: false)
file_logging = {file_logging}

[cleanup]
# Remove scratch files from finished job directories (default: true)
enabled = {enabled}

# Extensions kept in addition to f05, f06, f09, dat and txt (comma-separated)
preserve_extensions = {preserve}

# 0 = quiet, 1 = summary, 2 = every file
verbose = {verbose}
"#,
            file = SETTINGS_FILE,
            command = solver.command,
            timeout = solver.timeout,
            policy = solver.timeout_policy,
            launcher = parallel.launcher,
            parallel_command = parallel.parallel_command,
            arg_max = parallel.arg_max,
            divisor = parallel.safety_divisor,
            threads = general.default_threads,
            print_level = general.print_level,
            level = logging.level,
            file_logging = logging.file_logging,
            enabled = cleanup.enabled,
            preserve = cleanup.preserve_extensions.join(","),
            verbose = cleanup.verbose,
        )
    }
}

impl Settings {
    /// Parses one INI layer on top of the built-in defaults.
    pub fn from_ini(content: &str) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        settings.apply_ini(content)?;
        Ok(settings)
    }

    /// Applies the keys present in `content`, leaving the others untouched.
    pub fn apply_ini(&mut self, content: &str) -> Result<(), ConfigError> {
        let mut ini = Ini::new();
        ini.read(content.to_string())
            .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;
        let map = ini.get_map_ref();

        if let Some(section) = map.get("solver") {
            self.apply_solver(section)?;
        }
        if let Some(section) = map.get("parallel") {
            self.apply_parallel(section)?;
        }
        if let Some(section) = map.get("general") {
            if let Some(v) = value(section, "default_threads") {
                self.general.default_threads = parse_value("default_threads", v)?;
            }
            if let Some(v) = value(section, "print_level") {
                self.general.print_level = parse_value("print_level", v)?;
            }
        }
        if let Some(section) = map.get("logging") {
            if let Some(v) = value(section, "level") {
                self.logging.level = v.to_string();
            }
            if let Some(v) = value(section, "file_logging") {
                self.logging.file_logging = parse_value("file_logging", v)?;
            }
        }
        if let Some(section) = map.get("cleanup") {
            if let Some(v) = value(section, "enabled") {
                self.cleanup.enabled = parse_value("enabled", v)?;
            }
            if let Some(v) = value(section, "preserve_extensions") {
                self.cleanup.preserve_extensions = v
                    .split(',')
                    .map(|s| s.trim().trim_start_matches('.').to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            if let Some(v) = value(section, "verbose") {
                self.cleanup.verbose = parse_value("verbose", v)?;
            }
        }
        Ok(())
    }

    fn apply_solver(&mut self, section: &Section) -> Result<(), ConfigError> {
        if let Some(v) = value(section, "command") {
            self.solver.command = v.to_string();
        }
        if let Some(v) = value(section, "timeout") {
            self.solver.timeout = parse_value("timeout", v)?;
        }
        if let Some(v) = value(section, "timeout_policy") {
            self.solver.timeout_policy = v.parse().map_err(ConfigError::InvalidValue)?;
        }
        Ok(())
    }

    fn apply_parallel(&mut self, section: &Section) -> Result<(), ConfigError> {
        if let Some(v) = value(section, "launcher") {
            self.parallel.launcher = v.parse().map_err(ConfigError::InvalidValue)?;
        }
        if let Some(v) = value(section, "parallel_command") {
            self.parallel.parallel_command = v.to_string();
        }
        if let Some(v) = value(section, "arg_max") {
            self.parallel.arg_max = parse_value("arg_max", v)?;
        }
        if let Some(v) = value(section, "safety_divisor") {
            let divisor: usize = parse_value("safety_divisor", v)?;
            if divisor == 0 {
                return Err(ConfigError::InvalidValue(
                    "safety_divisor must be at least 1".to_string(),
                ));
            }
            self.parallel.safety_divisor = divisor;
        }
        Ok(())
    }
}

fn value<'a>(section: &'a Section, key: &str) -> Option<&'a str> {
    match section.get(key) {
        Some(Some(v)) if !v.trim().is_empty() => Some(v.trim()),
        _ => None,
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue(format!("Invalid {} value: {}", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = Settings::from_ini("[solver]\ncommand = /opt/mcdfgme/bin/mdfgme\n").unwrap();
        assert_eq!(settings.solver.command, "/opt/mcdfgme/bin/mdfgme");
        assert_eq!(settings.parallel.arg_max, 2_097_152);
        assert_eq!(settings.parallel.safety_divisor, 17);
        assert!(settings.cleanup.enabled);
    }

    #[test]
    fn test_layers_override_only_present_keys() {
        let mut settings = Settings::from_ini("[general]\ndefault_threads = 8\n").unwrap();
        settings
            .apply_ini("[cleanup]\nenabled = false\npreserve_extensions = .f03, log\n")
            .unwrap();
        assert_eq!(settings.general.default_threads, 8);
        assert!(!settings.cleanup.enabled);
        assert_eq!(settings.cleanup.preserve_extensions, vec!["f03", "log"]);
    }

    #[test]
    fn test_timeout_and_launcher_values() {
        let settings = Settings::from_ini(
            "[solver]\ntimeout = 600\ntimeout_policy = retry:2\n[parallel]\nlauncher = gnu-parallel\n",
        )
        .unwrap();
        assert_eq!(settings.solver.timeout, 600);
        assert_eq!(settings.solver.timeout_policy, TimeoutPolicy::Retry(2));
        assert_eq!(settings.parallel.launcher, LauncherKind::GnuParallel);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Settings::from_ini("[parallel]\narg_max = lots\n").is_err());
        assert!(Settings::from_ini("[parallel]\nsafety_divisor = 0\n").is_err());
        assert!(Settings::from_ini("[solver]\ntimeout_policy = maybe\n").is_err());
    }

    #[test]
    fn test_template_parses_back_to_defaults() {
        let template = SettingsManager::generate_template_content();
        let settings = Settings::from_ini(&template).unwrap();
        assert_eq!(settings.solver.command, "mcdfgme");
        assert_eq!(settings.parallel.launcher, LauncherKind::Pool);
        assert_eq!(settings.general.default_threads, 4);
    }
}
