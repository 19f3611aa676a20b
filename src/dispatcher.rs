//! Batch dispatch of solver jobs.
//!
//! A batch is an ordered list of [`Job`]s. Dispatching it:
//!
//! 1. prepares every job directory (directory, `tmp/`, rendered input,
//!    companion file),
//! 2. splits the batch into sub-batches whose launcher command line stays
//!    below `arg_max`,
//! 3. for each sub-batch: copies the staged wavefunctions in, runs the
//!    launcher, deletes the copies and appends the marker of the sub-batch's
//!    last job to the checkpoint log.
//!
//! The checkpoint line is written only after the whole sub-batch returned, so
//! the log never claims a job that did not run.
//!
//! # Batch sizing
//!
//! With `n` job paths of total length `L = sum(len) + n`:
//!
//! ```text
//! max_jobs = n * arg_max / L / safety_divisor   (at least 1)
//! ```
//!
//! `n < max_jobs` runs as a single batch, otherwise as chunks of `max_jobs`.
//! Chunks whose command line would still exceed `arg_max` are split further.

use crate::checkpoint;
use crate::launcher::{LaunchError, Launcher};
use crate::naming::{self, COMPANION_FILE, SCRATCH_DIR};
use log::{debug, error, info};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while dispatching a batch.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A job file could not be written, copied or removed
    #[error("IO error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// A file that must be staged into a job directory does not exist
    #[error("Missing staged file {path}: the sub-batch was not launched")]
    MissingStaged {
        /// Source path that was expected
        path: PathBuf,
    },
    /// The launcher failed; fatal for the run
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// A single job path does not fit the command-line limit
    #[error("Job path {path} needs {needed} bytes of command line, the limit is {arg_max}")]
    PathTooLong {
        /// Offending job path
        path: String,
        /// Command length with this path alone
        needed: usize,
        /// Configured limit
        arg_max: usize,
    },
}

type Result<T> = std::result::Result<T, DispatchError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DispatchError + '_ {
    move |source| DispatchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A file copied into a job directory for the duration of its sub-batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staged {
    /// Source, left untouched
    pub from: PathBuf,
    /// Copy inside the job directory
    pub to: PathBuf,
}

/// One solver job.
#[derive(Debug, Clone)]
pub struct Job {
    /// Working directory
    pub dir: PathBuf,
    /// Rendered solver input
    pub input: String,
    /// Line appended to the checkpoint log when this job ends a sub-batch
    pub marker: String,
    /// Files copied in before and removed after the sub-batch
    pub staged: Vec<Staged>,
}

impl Job {
    /// Job without staged files.
    pub fn new(dir: PathBuf, input: String, marker: String) -> Self {
        Self {
            dir,
            input,
            marker,
            staged: Vec::new(),
        }
    }
}

/// Command-line limits of the batch sizing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Longest command line accepted, in bytes
    pub arg_max: usize,
    /// Headroom divisor
    pub safety_divisor: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            arg_max: 2_097_152,
            safety_divisor: 17,
        }
    }
}

/// Jobs per sub-batch before the length check: `n * arg_max / L / divisor`.
pub fn max_jobs_per_batch(paths: &[String], limits: BatchLimits) -> usize {
    let n = paths.len();
    let total: usize = paths.iter().map(String::len).sum::<usize>() + n;
    if n == 0 || total == 0 {
        return 1;
    }
    let divisor = limits.safety_divisor.max(1);
    ((n as u128 * limits.arg_max as u128) / total as u128 / divisor as u128).max(1) as usize
}

/// Length of the launcher command for `paths`: overhead plus each path and a
/// separator.
pub fn command_length(overhead: usize, paths: &[String]) -> usize {
    overhead + paths.iter().map(|p| p.len() + 1).sum::<usize>()
}

/// Splits `paths` into consecutive sub-batches.
///
/// Every returned range yields a command of at most `limits.arg_max` bytes.
pub fn plan_batches(paths: &[String], limits: BatchLimits, overhead: usize) -> Result<Vec<Range<usize>>> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }
    for path in paths {
        let needed = command_length(overhead, std::slice::from_ref(path));
        if needed > limits.arg_max {
            return Err(DispatchError::PathTooLong {
                path: path.clone(),
                needed,
                arg_max: limits.arg_max,
            });
        }
    }

    let n = paths.len();
    let max_jobs = max_jobs_per_batch(paths, limits);
    let chunks: Vec<Range<usize>> = if n < max_jobs {
        vec![0..n]
    } else {
        (0..n)
            .step_by(max_jobs)
            .map(|start| start..(start + max_jobs).min(n))
            .collect()
    };

    let mut batches = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let mut start = chunk.start;
        let mut length = overhead;
        for i in chunk.clone() {
            let add = paths[i].len() + 1;
            if length + add > limits.arg_max && i > start {
                batches.push(start..i);
                start = i;
                length = overhead;
            }
            length += add;
        }
        batches.push(start..chunk.end);
    }
    Ok(batches)
}

/// Runs batches of jobs through a launcher.
pub struct Dispatcher<'a> {
    launcher: &'a dyn Launcher,
    limits: BatchLimits,
}

impl<'a> Dispatcher<'a> {
    /// Dispatcher running every sub-batch through `launcher`.
    pub fn new(launcher: &'a dyn Launcher, limits: BatchLimits) -> Self {
        Self { launcher, limits }
    }

    /// Creates the job directories and writes inputs and companion files.
    pub fn prepare(&self, jobs: &[Job]) -> Result<()> {
        for job in jobs {
            let scratch = job.dir.join(SCRATCH_DIR);
            fs::create_dir_all(&scratch).map_err(io_error(&scratch))?;

            let input_name = naming::input_name(&job.dir);
            let path = job.dir.join(&input_name);
            fs::write(&path, &job.input).map_err(io_error(&path))?;
            let companion = job.dir.join(COMPANION_FILE);
            fs::write(&companion, format!("mcdfgme input\n{}\n", input_name))
                .map_err(io_error(&companion))?;
        }
        Ok(())
    }

    /// Prepares and runs `jobs`, appending sub-batch markers to `checkpoint`.
    pub fn dispatch(&self, jobs: &[Job], checkpoint_log: Option<&Path>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        self.prepare(jobs)?;

        let paths: Vec<String> = jobs.iter().map(|j| j.dir.display().to_string()).collect();
        let batches = plan_batches(&paths, self.limits, self.launcher.command_overhead())?;
        info!(
            "Dispatching {} jobs in {} sub-batch(es) via {}",
            jobs.len(),
            batches.len(),
            self.launcher.name()
        );

        for (index, range) in batches.iter().enumerate() {
            let batch = &jobs[range.clone()];
            self.stage(batch)?;
            let dirs: Vec<PathBuf> = batch.iter().map(|j| j.dir.clone()).collect();
            let launched = self.launcher.launch(&dirs);
            let unstaged = self.unstage(batch);
            launched?;
            unstaged?;

            if let (Some(log), Some(last)) = (checkpoint_log, batch.last()) {
                checkpoint::append_line(log, &last.marker).map_err(io_error(log))?;
            }
            debug!(
                "Sub-batch {}/{} done ({} jobs)",
                index + 1,
                batches.len(),
                batch.len()
            );
        }
        Ok(())
    }

    /// Copies the staged files in. Every source is checked before the first
    /// copy, so a missing one leaves the sub-batch untouched.
    fn stage(&self, batch: &[Job]) -> Result<()> {
        let staged_files = || batch.iter().flat_map(|j| j.staged.iter());
        if let Some(missing) = staged_files().find(|staged| !staged.from.is_file()) {
            error!(
                "Cannot stage {} into {}",
                missing.from.display(),
                missing.to.display()
            );
            return Err(DispatchError::MissingStaged {
                path: missing.from.clone(),
            });
        }
        for staged in staged_files() {
            fs::copy(&staged.from, &staged.to).map_err(io_error(&staged.to))?;
        }
        Ok(())
    }

    fn unstage(&self, batch: &[Job]) -> Result<()> {
        for staged in batch.iter().flat_map(|j| j.staged.iter()) {
            if staged.to.exists() {
                fs::remove_file(&staged.to).map_err(io_error(&staged.to))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every launch and checks the staged files exist while it runs.
    struct Recorder {
        calls: Mutex<Vec<Vec<PathBuf>>>,
        overhead: usize,
    }

    impl Launcher for Recorder {
        fn launch(&self, dirs: &[PathBuf]) -> crate::launcher::Result<()> {
            for dir in dirs {
                let input = fs::read_to_string(dir.join(COMPANION_FILE)).unwrap();
                assert_eq!(input.lines().nth(1), Some(naming::input_name(dir).as_str()));
                if dir.ends_with("with_copy") {
                    assert!(dir.join("initial.f09").exists());
                }
            }
            self.calls.lock().unwrap().push(dirs.to_vec());
            Ok(())
        }

        fn command_overhead(&self) -> usize {
            self.overhead
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    fn paths(lengths: &[usize]) -> Vec<String> {
        lengths.iter().map(|&n| "x".repeat(n)).collect()
    }

    #[test]
    fn test_single_batch_when_small() {
        let p = paths(&[10; 20]);
        assert_eq!(plan_batches(&p, BatchLimits::default(), 0).unwrap(), vec![0..20]);
    }

    #[test]
    fn test_sizing_rule_splits_evenly() {
        // n = 10, L = 10 * 100, max = 10 * 1000 / 1000 / 1 = 10 -> not n < max
        let p = paths(&[99; 10]);
        let limits = BatchLimits {
            arg_max: 1000,
            safety_divisor: 1,
        };
        assert_eq!(max_jobs_per_batch(&p, limits), 10);
        let batches = plan_batches(&p, limits, 0).unwrap();
        assert_eq!(batches, vec![0..10]);

        let limits = BatchLimits {
            arg_max: 1000,
            safety_divisor: 3,
        };
        assert_eq!(max_jobs_per_batch(&p, limits), 3);
        assert_eq!(plan_batches(&p, limits, 0).unwrap(), vec![0..3, 3..6, 6..9, 9..10]);
    }

    #[test]
    fn test_overhead_forces_further_split() {
        let p = paths(&[9; 6]);
        let limits = BatchLimits {
            arg_max: 40,
            safety_divisor: 1,
        };
        // max_jobs = 6 * 40 / 60 = 4, but 15 + 4 * 10 > 40
        let batches = plan_batches(&p, limits, 15).unwrap();
        for range in &batches {
            assert!(command_length(15, &p[range.clone()]) <= 40);
        }
        assert_eq!(batches.iter().map(|r| r.len()).sum::<usize>(), 6);
    }

    #[test]
    fn test_path_longer_than_limit_is_an_error() {
        let p = paths(&[5, 50]);
        let limits = BatchLimits {
            arg_max: 40,
            safety_divisor: 1,
        };
        assert!(matches!(
            plan_batches(&p, limits, 0),
            Err(DispatchError::PathTooLong { .. })
        ));
    }

    #[test]
    fn test_dispatch_writes_jobs_stages_and_checkpoints() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("source.f09");
        fs::write(&source, "wavefunction").unwrap();
        let log = root.path().join("log.txt");

        let mut jobs: Vec<Job> = (0..5)
            .map(|i| {
                Job::new(
                    root.path().join(format!("job_{}", i)),
                    format!("input {}", i),
                    format!("0, 1, {}", i + 1),
                )
            })
            .collect();
        let copy_dir = root.path().join("with_copy");
        jobs.push(Job {
            dir: copy_dir.clone(),
            input: "transition".to_string(),
            marker: "last".to_string(),
            staged: vec![Staged {
                from: source.clone(),
                to: copy_dir.join("initial.f09"),
            }],
        });

        let recorder = Recorder {
            calls: Mutex::new(Vec::new()),
            overhead: 0,
        };
        let limits = BatchLimits {
            arg_max: 1 << 20,
            safety_divisor: 1 << 20,
        };
        Dispatcher::new(&recorder, limits).dispatch(&jobs, Some(&log)).unwrap();

        // max_jobs = 1, so one sub-batch per job
        assert_eq!(recorder.calls.lock().unwrap().len(), 6);
        assert_eq!(
            fs::read_to_string(&log).unwrap(),
            "0, 1, 1\n0, 1, 2\n0, 1, 3\n0, 1, 4\n0, 1, 5\nlast\n"
        );
        assert_eq!(
            fs::read_to_string(root.path().join("job_3/job_3.f05")).unwrap(),
            "input 3"
        );
        assert!(root.path().join("job_0").join(SCRATCH_DIR).is_dir());
        assert!(!copy_dir.join("initial.f09").exists());
        assert!(source.exists());
    }

    #[test]
    fn test_missing_staged_file_stops_the_sub_batch() {
        let root = TempDir::new().unwrap();
        let present = root.path().join("final_state.f09");
        fs::write(&present, "wavefunction").unwrap();
        let log = root.path().join("log.txt");

        let dir = root.path().join("pair");
        let job = Job {
            dir: dir.clone(),
            input: "transition".to_string(),
            marker: "0, 1, 1 => 1, 1, 1".to_string(),
            staged: vec![
                Staged {
                    from: present.clone(),
                    to: dir.join("final.f09"),
                },
                Staged {
                    from: root.path().join("never_written.f09"),
                    to: dir.join("initial.f09"),
                },
            ],
        };
        let recorder = Recorder {
            calls: Mutex::new(Vec::new()),
            overhead: 0,
        };

        let result = Dispatcher::new(&recorder, BatchLimits::default()).dispatch(&[job], Some(&log));
        match result {
            Err(DispatchError::MissingStaged { path }) => {
                assert_eq!(path, root.path().join("never_written.f09"))
            }
            other => panic!("expected MissingStaged, got {:?}", other),
        }
        assert!(recorder.calls.lock().unwrap().is_empty());
        assert!(!log.exists());
        assert!(!dir.join("final.f09").exists());
    }
}
