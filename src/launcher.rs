//! Process pools that run the solver over a batch of job directories.
//!
//! A [`Launcher`] receives the directories of one sub-batch and blocks until
//! every job finished. Two implementations exist:
//!
//! - [`PoolLauncher`]: a rayon worker pool of `threads` workers, each starting
//!   the solver with the job directory as working directory. Supports a
//!   per-job timeout with a fatal or retry policy.
//! - [`GnuParallelLauncher`]: a single `parallel -j N "cd {} && <solver>" :::
//!   <dirs>` invocation whose exit status decides the outcome of the batch.
//!
//! In both cases any failing job fails the whole batch. Individual exit codes
//! are not interpreted further; convergence is judged from the output files.

use crate::config::TimeoutPolicy;
use crate::settings::{LauncherKind, Settings};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors raised while running a batch.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// The solver or launcher command is empty
    #[error("Empty {0} command")]
    EmptyCommand(&'static str),
    /// A process could not be started
    #[error("Failed to start '{program}' in {dir}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Job directory
        dir: PathBuf,
        /// Underlying error
        source: io::Error,
    },
    /// Waiting on a process failed
    #[error("Failed to wait for job in {dir}: {source}")]
    Wait {
        /// Job directory
        dir: PathBuf,
        /// Underlying error
        source: io::Error,
    },
    /// A solver run exited unsuccessfully
    #[error("Solver run in {dir} failed with {status}")]
    JobFailed {
        /// Job directory
        dir: PathBuf,
        /// Exit status of the solver
        status: ExitStatus,
    },
    /// The GNU parallel invocation exited unsuccessfully
    #[error("{command} exited with {status}")]
    BatchFailed {
        /// Launcher program
        command: String,
        /// Exit status of the launcher
        status: ExitStatus,
    },
    /// A solver run exceeded the timeout on every attempt
    #[error("Solver run in {dir} exceeded {seconds:.1} s ({attempts} attempt(s))")]
    Timeout {
        /// Job directory
        dir: PathBuf,
        /// Limit per attempt
        seconds: f64,
        /// Attempts made
        attempts: u32,
    },
    /// The worker pool could not be built
    #[error("Failed to build worker pool: {0}")]
    Pool(String),
}

/// Result type for launches
pub type Result<T> = std::result::Result<T, LaunchError>;

/// Runs the solver over a batch of job directories.
pub trait Launcher: Send + Sync {
    /// Runs one job per directory and returns when all of them finished.
    fn launch(&self, dirs: &[PathBuf]) -> Result<()>;

    /// Length of the launcher's own command line, without the job paths.
    fn command_overhead(&self) -> usize;

    /// Short name used in log messages.
    fn name(&self) -> &str;
}

fn split_command(command: &str, what: &'static str) -> Result<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next().ok_or(LaunchError::EmptyCommand(what))?;
    Ok((program, parts.collect()))
}

/// Worker pool launching the solver directly.
#[derive(Debug, Clone)]
pub struct PoolLauncher {
    program: String,
    args: Vec<String>,
    threads: usize,
    timeout: Option<Duration>,
    policy: TimeoutPolicy,
}

impl PoolLauncher {
    /// Creates a pool running `solver` (program and arguments) on `threads` workers.
    pub fn new(solver: &str, threads: usize) -> Result<Self> {
        let (program, args) = split_command(solver, "solver")?;
        Ok(Self {
            program,
            args,
            threads: threads.max(1),
            timeout: None,
            policy: TimeoutPolicy::Fatal,
        })
    }

    /// Kills jobs running longer than `timeout` and applies `policy`.
    pub fn with_timeout(mut self, timeout: Duration, policy: TimeoutPolicy) -> Self {
        self.timeout = Some(timeout);
        self.policy = policy;
        self
    }

    fn run_job(&self, dir: &Path) -> Result<()> {
        let attempts = match self.policy {
            TimeoutPolicy::Fatal => 1,
            TimeoutPolicy::Retry(n) => n + 1,
        };

        for attempt in 1..=attempts {
            let mut child = Command::new(&self.program)
                .args(&self.args)
                .current_dir(dir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|source| LaunchError::Spawn {
                    program: self.program.clone(),
                    dir: dir.to_path_buf(),
                    source,
                })?;

            let status = wait_with_timeout(&mut child, self.timeout).map_err(|source| {
                LaunchError::Wait {
                    dir: dir.to_path_buf(),
                    source,
                }
            })?;

            match status {
                Some(status) if status.success() => {
                    debug!("Job finished in {}", dir.display());
                    return Ok(());
                }
                Some(status) => {
                    return Err(LaunchError::JobFailed {
                        dir: dir.to_path_buf(),
                        status,
                    })
                }
                None if attempt < attempts => {
                    warn!(
                        "Job in {} timed out, relaunching (attempt {} of {})",
                        dir.display(),
                        attempt + 1,
                        attempts
                    );
                }
                None => {}
            }
        }

        Err(LaunchError::Timeout {
            dir: dir.to_path_buf(),
            seconds: self.timeout.map(|t| t.as_secs_f64()).unwrap_or(0.0),
            attempts,
        })
    }
}

/// Waits for `child`, killing it once `timeout` elapsed.
///
/// Returns `None` when the process was killed.
fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> io::Result<Option<ExitStatus>> {
    let Some(limit) = timeout else {
        return child.wait().map(Some);
    };
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

impl Launcher for PoolLauncher {
    fn launch(&self, dirs: &[PathBuf]) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| LaunchError::Pool(e.to_string()))?;

        info!(
            "Launching {} solver runs on {} workers",
            dirs.len(),
            self.threads
        );
        pool.install(|| dirs.par_iter().try_for_each(|dir| self.run_job(dir)))
    }

    fn command_overhead(&self) -> usize {
        0
    }

    fn name(&self) -> &str {
        "pool"
    }
}

/// Launches each batch through GNU parallel.
#[derive(Debug, Clone)]
pub struct GnuParallelLauncher {
    parallel: String,
    solver: String,
    threads: usize,
}

impl GnuParallelLauncher {
    /// Creates a launcher calling `parallel` with `threads` jobs at a time.
    pub fn new(parallel: &str, solver: &str, threads: usize) -> Result<Self> {
        if parallel.trim().is_empty() {
            return Err(LaunchError::EmptyCommand("parallel"));
        }
        if solver.trim().is_empty() {
            return Err(LaunchError::EmptyCommand("solver"));
        }
        Ok(Self {
            parallel: parallel.trim().to_string(),
            solver: solver.trim().to_string(),
            threads: threads.max(1),
        })
    }

    fn fixed_args(&self) -> Vec<String> {
        vec![
            "-j".to_string(),
            self.threads.to_string(),
            format!("cd {{}} && {}", self.solver),
            ":::".to_string(),
        ]
    }

    /// Full argument vector for a batch (program excluded).
    pub fn arguments(&self, dirs: &[PathBuf]) -> Vec<String> {
        let mut args = self.fixed_args();
        args.extend(dirs.iter().map(|d| d.display().to_string()));
        args
    }
}

impl Launcher for GnuParallelLauncher {
    fn launch(&self, dirs: &[PathBuf]) -> Result<()> {
        info!(
            "Launching {} solver runs through {} -j {}",
            dirs.len(),
            self.parallel,
            self.threads
        );
        let (program, mut args) = split_command(&self.parallel, "parallel")?;
        args.extend(self.arguments(dirs));
        let status = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .status()
            .map_err(|source| LaunchError::Spawn {
                program: program.clone(),
                dir: PathBuf::from("."),
                source,
            })?;
        if !status.success() {
            return Err(LaunchError::BatchFailed {
                command: self.parallel.clone(),
                status,
            });
        }
        Ok(())
    }

    fn command_overhead(&self) -> usize {
        // program, fixed arguments and one separator each
        self.parallel.len() + self.fixed_args().iter().map(|a| a.len() + 1).sum::<usize>()
    }

    fn name(&self) -> &str {
        "gnu-parallel"
    }
}

/// Builds the launcher selected in the settings.
pub fn from_settings(settings: &Settings, solver: &str, threads: usize) -> Result<Box<dyn Launcher>> {
    match settings.parallel.launcher {
        LauncherKind::GnuParallel => {
            if settings.solver.timeout > 0 {
                warn!("The solver timeout is only honoured by the pool launcher");
            }
            Ok(Box::new(GnuParallelLauncher::new(
                &settings.parallel.parallel_command,
                solver,
                threads,
            )?))
        }
        LauncherKind::Pool => {
            let pool = PoolLauncher::new(solver, threads)?;
            Ok(Box::new(if settings.solver.timeout > 0 {
                pool.with_timeout(
                    Duration::from_secs(settings.solver.timeout),
                    settings.solver.timeout_policy,
                )
            } else {
                pool
            }))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job_dirs(root: &Path, n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let dir = root.join(format!("job_{}", i));
                std::fs::create_dir_all(&dir).unwrap();
                dir
            })
            .collect()
    }

    #[test]
    fn test_pool_runs_every_job_in_its_directory() {
        let root = TempDir::new().unwrap();
        let dirs = job_dirs(root.path(), 5);
        let launcher = PoolLauncher::new("touch done.f06", 2).unwrap();
        launcher.launch(&dirs).unwrap();
        for dir in &dirs {
            assert!(dir.join("done.f06").exists());
        }
    }

    #[test]
    fn test_pool_failure_is_fatal() {
        let root = TempDir::new().unwrap();
        let dirs = job_dirs(root.path(), 2);
        let launcher = PoolLauncher::new("false", 2).unwrap();
        assert!(matches!(
            launcher.launch(&dirs),
            Err(LaunchError::JobFailed { .. })
        ));
    }

    #[test]
    fn test_timeout_fatal() {
        let root = TempDir::new().unwrap();
        let dirs = job_dirs(root.path(), 1);
        let launcher = PoolLauncher::new("sleep 5", 1)
            .unwrap()
            .with_timeout(Duration::from_millis(200), TimeoutPolicy::Fatal);
        let started = Instant::now();
        match launcher.launch(&dirs) {
            Err(LaunchError::Timeout { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_timeout_retry_relaunches() {
        let root = TempDir::new().unwrap();
        let dirs = job_dirs(root.path(), 1);
        let launcher = PoolLauncher::new("sleep 5", 1)
            .unwrap()
            .with_timeout(Duration::from_millis(100), TimeoutPolicy::Retry(2));
        match launcher.launch(&dirs) {
            Err(LaunchError::Timeout { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected a timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_fast_job_beats_timeout() {
        let root = TempDir::new().unwrap();
        let dirs = job_dirs(root.path(), 3);
        let launcher = PoolLauncher::new("touch ok", 3)
            .unwrap()
            .with_timeout(Duration::from_secs(10), TimeoutPolicy::Fatal);
        launcher.launch(&dirs).unwrap();
        assert!(dirs.iter().all(|d| d.join("ok").exists()));
    }

    #[test]
    fn test_gnu_parallel_command_line() {
        let launcher = GnuParallelLauncher::new("parallel", "mcdfgme", 8).unwrap();
        let dirs = vec![PathBuf::from("/r/a"), PathBuf::from("/r/b")];
        assert_eq!(
            launcher.arguments(&dirs),
            vec!["-j", "8", "cd {} && mcdfgme", ":::", "/r/a", "/r/b"]
        );
        // "parallel" + " -j" + " 8" + " cd {} && mcdfgme" + " :::"
        assert_eq!(launcher.command_overhead(), 8 + 3 + 2 + 17 + 4);
    }

    #[test]
    fn test_empty_commands_are_rejected() {
        assert!(matches!(
            PoolLauncher::new("   ", 1),
            Err(LaunchError::EmptyCommand("solver"))
        ));
        assert!(GnuParallelLauncher::new("", "mcdfgme", 1).is_err());
    }
}
