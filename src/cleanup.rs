//! Scratch-file cleanup for finished job directories.
//!
//! A solver run leaves scratch data behind: the contents of the `tmp/`
//! directory and assorted intermediate files. Thousands of state and
//! transition directories multiply that into a real disk-space problem, so
//! once a family or transition class is finished its job directories are
//! cleaned.
//!
//! # File Preservation Strategy
//!
//! ## Files Always Preserved
//! - **Input files** (`.f05`) and the companion file (`mdfgme.dat`)
//! - **Output files** (`.f06`)
//! - **Wavefunctions** (`.f09`), needed later by transition jobs
//! - **Records** (`.txt`), e.g. `failed_orbitals.txt`
//!
//! ## User-Configurable Extensions
//! - Extensions listed in `[cleanup] preserve_extensions` of
//!   `openhole_config.cfg`
//!
//! ## Always Deleted
//! - Everything inside `tmp/` (the directory itself is kept)
//! - Any other file not in the whitelist
//!
//! # Configuration
//!
//! ```ini
//! [cleanup]
//! enabled = true
//! # 0 = quiet, 1 = normal, 2 = verbose
//! verbose = 1
//! # preserve_extensions = f03,log
//! ```

use crate::naming::{COMPANION_FILE, INPUT_EXT, OUTPUT_EXT, SCRATCH_DIR, WAVEFUNCTION_EXT};
use crate::settings::Settings;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during cleanup operations.
#[derive(Error, Debug)]
pub enum CleanupError {
    /// I/O error during file operations
    #[error("IO error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Invalid path error
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Result type for cleanup operations
pub type Result<T> = std::result::Result<T, CleanupError>;

/// Extensions of the files a job directory must keep.
const ESSENTIAL_EXTENSIONS: [&str; 4] = [INPUT_EXT, OUTPUT_EXT, WAVEFUNCTION_EXT, "txt"];

/// Configuration for cleanup operations.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Enable automatic cleanup
    pub enabled: bool,

    /// File extensions to preserve (whitelist), without leading dots
    pub preserve_extensions: Vec<String>,

    /// Verbosity level for cleanup logging
    pub verbose: u32,

    /// Global print level from general settings (0=quiet, 1=normal, 2=verbose)
    pub print_level: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preserve_extensions: ESSENTIAL_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            verbose: 1,
            print_level: 1,
        }
    }
}

impl CleanupConfig {
    /// Creates a cleanup configuration from the program settings.
    ///
    /// The solver files are always whitelisted; user extensions are added on
    /// top.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut config = CleanupConfig {
            enabled: settings.cleanup.enabled,
            verbose: settings.cleanup.verbose,
            print_level: settings.general.print_level,
            ..CleanupConfig::default()
        };
        for ext in &settings.cleanup.preserve_extensions {
            if !config.preserve_extensions.contains(ext) {
                config.preserve_extensions.push(ext.clone());
            }
        }
        config
    }

    /// Checks if logging should occur based on print_level and verbose settings.
    ///
    /// - print_level 0 suppresses every cleanup message
    /// - print_level 1 defers to the cleanup `verbose` level
    /// - print_level 2 prints everything
    pub fn should_log(&self, min_verbose_level: u32) -> bool {
        if self.print_level == 0 {
            return false;
        }
        if self.print_level >= 2 {
            return true;
        }
        self.verbose >= min_verbose_level
    }
}

/// Counts of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Files and scratch entries removed
    pub deleted: usize,
    /// Whitelisted files kept
    pub preserved: usize,
    /// Removals that failed and were logged
    pub failed: usize,
}

impl CleanupStats {
    fn add(&mut self, other: CleanupStats) {
        self.deleted += other.deleted;
        self.preserved += other.preserved;
        self.failed += other.failed;
    }
}

/// Manages cleanup of job directories.
pub struct CleanupManager {
    config: CleanupConfig,
}

impl CleanupManager {
    /// Creates a manager with the given configuration.
    pub fn new(config: CleanupConfig) -> Self {
        Self { config }
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Whether a file in a job directory survives cleanup.
    pub fn should_preserve_file(&self, path: &Path) -> bool {
        let filename = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if filename == COMPANION_FILE {
            return true;
        }
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        !extension.is_empty()
            && self
                .config
                .preserve_extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(extension))
    }

    /// Cleans one job directory.
    ///
    /// Failures to delete single files are logged and counted, not returned.
    pub fn cleanup_directory(&self, directory: &Path) -> Result<CleanupStats> {
        let mut stats = CleanupStats::default();
        if !self.config.enabled {
            return Ok(stats);
        }
        if !directory.exists() {
            if self.config.should_log(2) {
                debug!("Directory does not exist, skipping: {}", directory.display());
            }
            return Ok(stats);
        }
        if !directory.is_dir() {
            return Err(CleanupError::InvalidPath(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        let scratch = directory.join(SCRATCH_DIR);
        if scratch.is_dir() {
            stats.add(self.remove_all(&scratch)?);
        }

        let entries = fs::read_dir(directory).map_err(|source| CleanupError::Io {
            path: directory.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };
            if path.is_dir() {
                continue;
            }
            if self.should_preserve_file(&path) {
                stats.preserved += 1;
                continue;
            }
            self.remove(&path, &mut stats);
        }

        if self.config.should_log(2) {
            debug!(
                "Cleaned {}: {} deleted, {} preserved",
                directory.display(),
                stats.deleted,
                stats.preserved
            );
        }
        Ok(stats)
    }

    /// Cleans a set of job directories and logs one summary.
    pub fn cleanup_directories<'p, I>(&self, what: &str, directories: I) -> Result<CleanupStats>
    where
        I: IntoIterator<Item = &'p PathBuf>,
    {
        let mut total = CleanupStats::default();
        if !self.config.enabled {
            if self.config.should_log(1) {
                info!("Cleanup is disabled, keeping scratch files of {}", what);
            }
            return Ok(total);
        }
        for directory in directories {
            total.add(self.cleanup_directory(directory)?);
        }
        if self.config.should_log(1) {
            info!(
                "Cleanup of {} completed: {} files deleted, {} files preserved",
                what, total.deleted, total.preserved
            );
        }
        if total.failed > 0 {
            warn!("Cleanup of {} could not delete {} files", what, total.failed);
        }
        Ok(total)
    }

    fn remove_all(&self, scratch: &Path) -> Result<CleanupStats> {
        let mut stats = CleanupStats::default();
        let entries = fs::read_dir(scratch).map_err(|source| CleanupError::Io {
            path: scratch.to_path_buf(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                match fs::remove_dir_all(&path) {
                    Ok(()) => stats.deleted += 1,
                    Err(e) => {
                        warn!("Failed to remove {}: {}", path.display(), e);
                        stats.failed += 1;
                    }
                }
            } else {
                self.remove(&path, &mut stats);
            }
        }
        Ok(stats)
    }

    fn remove(&self, path: &Path, stats: &mut CleanupStats) {
        match fs::remove_file(path) {
            Ok(()) => {
                stats.deleted += 1;
                if self.config.should_log(2) {
                    debug!("Cleaned up file: {}", path.display());
                }
            }
            Err(e) => {
                warn!("Failed to remove file {}: {}", path.display(), e);
                stats.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn create_test_cleanup_config() -> CleanupConfig {
        let mut config = CleanupConfig {
            verbose: 2,
            print_level: 2,
            ..CleanupConfig::default()
        };
        config.preserve_extensions.push("log".to_string());
        config
    }

    #[test]
    fn test_preserves_whitelist_files() {
        let manager = CleanupManager::new(create_test_cleanup_config());

        assert!(manager.should_preserve_file(Path::new("state_0_1_1.f05")));
        assert!(manager.should_preserve_file(Path::new("state_0_1_1.f06")));
        assert!(manager.should_preserve_file(Path::new("state_0_1_1.F09")));
        assert!(manager.should_preserve_file(Path::new("failed_orbitals.txt")));
        assert!(manager.should_preserve_file(Path::new("mdfgme.dat")));
        assert!(manager.should_preserve_file(Path::new("solver.log")));
    }

    #[test]
    fn test_deletes_non_whitelist_files() {
        let manager = CleanupManager::new(create_test_cleanup_config());

        assert!(!manager.should_preserve_file(Path::new("fort.12")));
        assert!(!manager.should_preserve_file(Path::new("other.dat")));
        assert!(!manager.should_preserve_file(Path::new("core")));
        assert!(!manager.should_preserve_file(Path::new("state.f03")));
    }

    #[test]
    fn test_cleanup_directory_clears_scratch() {
        let temp_dir = TempDir::new().unwrap();
        let dir_path = temp_dir.path().to_path_buf();
        fs::create_dir_all(dir_path.join("tmp/nested")).unwrap();

        let _ = File::create(dir_path.join("state_0_1_1.f06")).unwrap();
        let _ = File::create(dir_path.join("state_0_1_1.f09")).unwrap();
        let _ = File::create(dir_path.join("mdfgme.dat")).unwrap();
        let _ = File::create(dir_path.join("fort.7")).unwrap();
        let _ = File::create(dir_path.join("tmp/scratch.bin")).unwrap();
        let _ = File::create(dir_path.join("tmp/nested/more.bin")).unwrap();

        let manager = CleanupManager::new(create_test_cleanup_config());
        let stats = manager.cleanup_directory(&dir_path).unwrap();

        assert!(dir_path.join("state_0_1_1.f06").exists());
        assert!(dir_path.join("state_0_1_1.f09").exists());
        assert!(dir_path.join("mdfgme.dat").exists());
        assert!(!dir_path.join("fort.7").exists());
        assert!(dir_path.join("tmp").is_dir());
        assert!(!dir_path.join("tmp/scratch.bin").exists());
        assert!(!dir_path.join("tmp/nested").exists());
        assert_eq!(stats.deleted, 3);
        assert_eq!(stats.preserved, 3);
    }

    #[test]
    fn test_cleanup_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let dir_path = temp_dir.path().to_path_buf();
        let _ = File::create(dir_path.join("fort.7")).unwrap();

        let config = CleanupConfig {
            enabled: false,
            ..create_test_cleanup_config()
        };
        let manager = CleanupManager::new(config);
        let stats = manager
            .cleanup_directories("test", [dir_path.clone()].iter())
            .unwrap();
        assert_eq!(stats, CleanupStats::default());
        assert!(dir_path.join("fort.7").exists());
    }

    #[test]
    fn test_settings_extend_whitelist() {
        let mut settings = Settings::default();
        settings.cleanup.preserve_extensions = vec!["f03".to_string(), "f06".to_string()];
        settings.general.print_level = 0;
        let config = CleanupConfig::from_settings(&settings);
        assert_eq!(config.preserve_extensions.len(), ESSENTIAL_EXTENSIONS.len() + 1);
        assert!(!config.should_log(2));
        let manager = CleanupManager::new(config);
        assert!(manager.should_preserve_file(Path::new("x.f03")));
    }
}
