#![deny(missing_docs)]

//! openhole - resumable hole-state and transition-rate calculations
//!
//! openhole drives an external relativistic atomic structure solver
//! (MCDFGME-like) through the thousands of independent jobs needed to
//! describe the inner-shell vacancy states of an atom and their decays.
//!
//! # Overview
//!
//! A calculation runs in four stages:
//!
//! 1. **Discovery**: for every state family (one-hole, two-hole and,
//!    optionally, three-hole, shake-up and excitation) the electron
//!    configurations are enumerated and their jj levels listed as
//!    `(configuration, 2J, eigenvalue)` triples.
//! 2. **Refinement**: every level is calculated, and the ones whose solver
//!    output does not pass the convergence predicate are retried in up to
//!    four cycles, each with stronger solver settings. Levels still failing
//!    after the fourth cycle are listed for manual review.
//! 3. **Transitions**: levels are sorted by energy and every radiative
//!    (same family) and Auger (one family to the next) pair is calculated.
//! 4. **Aggregation**: rates are reduced to branching ratios, level widths,
//!    fluorescence yields and spectra.
//!
//! Every batch is checkpointed in plain-text logs. An interrupted run is
//! resumed by running the same input again; the logs are cross-checked and
//! the narrowest stage that is still incomplete is redone.
//!
//! # Quick Start
//!
//! ```no_run
//! use openhole::parser::parse_input;
//! use openhole::pipeline::RunContext;
//! use openhole::settings::SettingsManager;
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = parse_input(Path::new("neon.inp"))?;
//!     let settings = SettingsManager::load()?.settings().clone();
//!     let context = RunContext::prepare(config, settings, Path::new("."))?;
//!     let summary = context.run()?;
//!     println!("{} spectra", summary.spectra.len());
//!     Ok(())
//! }
//! ```
//!
//! # Input File Format
//!
//! ```text
//! atomic_number = 10
//! label = Ne
//! mode = auto
//! three_holes = false
//! threads = 8
//! ```
//!
//! # Modules
//!
//! - [`config`] - Run configuration, families and transition classes
//! - [`parser`] - Run-input and run-parameters files
//! - [`settings`] - Program settings (`openhole_config.cfg`)
//! - [`naming`] - Layout of the calculation tree
//! - [`state`] - States, convergence parameters and transitions
//! - [`enumerator`] - Configuration enumeration and jj level census
//! - [`template`] - Solver input templates
//! - [`launcher`] - Bounded process pools
//! - [`dispatcher`] - Batch planning and job preparation
//! - [`output`] - Solver output parsing
//! - [`cycle`] - Four-cycle refinement
//! - [`checkpoint`] - Checkpoint logs and resume decisions
//! - [`transitions`] - Transition pair enumeration and dispatch
//! - [`rates`] - Rate aggregation
//! - [`pipeline`] - The resumable run driver
//! - [`cleanup`] - Scratch-file cleanup
//! - [`validation`] - Configuration validation

/// Checkpoint logs and resume decisions
pub mod checkpoint;
/// Automated scratch-file cleanup for finished job directories
pub mod cleanup;
pub mod config;
pub mod cycle;
pub mod dispatcher;
pub mod enumerator;
pub mod launcher;
/// File naming of the calculation tree
pub mod naming;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod rates;
/// Configuration management system
pub mod settings;
pub mod state;
pub mod template;
pub mod transitions;
/// Run configuration validation
pub mod validation;

pub use config::Config;
pub use pipeline::{RunContext, RunError};
