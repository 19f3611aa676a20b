//! Aggregation of transition rates.
//!
//! Once every class is read back, the rates are reduced per initial level:
//!
//! - `total_rate_from_initial` of every transition is the sum of all rates
//!   leaving its initial level, over every class starting in that family;
//! - the natural width of a level is `total * ħ` (eV);
//! - the fluorescence yield of a vacancy shell is
//!   `Σ(2J+1)·R_rad / Σ(2J+1)·(R_rad + R_Auger)` over the levels of that shell;
//! - each class spectrum lists energy, relative intensity (`(2J+1)·R`,
//!   normalised to the strongest line), branching ratio and initial width.

use crate::config::{Family, TransitionClass, HBAR_EV_S};
use crate::naming::FileNaming;
use crate::state::{format_pair, QuantumNumbers, Transition};
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while writing results.
#[derive(Error, Debug)]
pub enum RatesError {
    /// A result file could not be written
    #[error("IO error on {path}: {source}")]
    Io {
        /// Result file
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// The summary could not be serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, RatesError>;

/// Transitions of a run, grouped by class.
pub type TransitionsByClass = BTreeMap<TransitionClass, Vec<Transition>>;

/// Decay rates and natural width of one initial level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelWidth {
    /// Family of the level
    pub family: Family,
    /// Level identity
    pub qn: QuantumNumbers,
    /// Vacancy label, e.g. `1s` or `2p3/2`
    pub shell_label: String,
    /// Sum of radiative rates (1/s)
    pub radiative_rate: f64,
    /// Sum of Auger rates (1/s)
    pub auger_rate: f64,
    /// Radiative plus Auger (1/s)
    pub total_rate: f64,
    /// Natural width `hbar * total_rate` (eV)
    pub width_ev: f64,
}

/// Fluorescence yield of one vacancy shell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShellYield {
    /// Family of the shell's levels
    pub family: Family,
    /// Vacancy label
    pub shell_label: String,
    /// Multiplicity-weighted radiative share of the total rate
    pub fluorescence_yield: f64,
}

/// One line of a class spectrum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrumLine {
    /// Initial level
    pub initial: QuantumNumbers,
    /// Final level
    pub final_state: QuantumNumbers,
    /// Vacancy label of the initial level
    pub initial_label: String,
    /// Vacancy label of the final level
    pub final_label: String,
    /// Transition energy (eV)
    pub energy: f64,
    /// Transition rate (1/s)
    pub rate: f64,
    /// `(2J+1) * rate` relative to the strongest line of the class
    pub intensity: f64,
    /// Share of the initial level's total rate
    pub branching_ratio: f64,
    /// Natural width of the initial level (eV)
    pub initial_width_ev: f64,
}

/// Lines of one transition class, in transition-log order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassSpectrum {
    /// Transition class
    pub class: TransitionClass,
    /// Its lines
    pub lines: Vec<SpectrumLine>,
}

/// Everything written to `results.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    /// Run label
    pub label: String,
    /// Nuclear charge Z
    pub atomic_number: u32,
    /// Every initial level with its width
    pub levels: Vec<LevelWidth>,
    /// Yields per vacancy shell
    pub yields: Vec<ShellYield>,
    /// One spectrum per transition class
    pub spectra: Vec<ClassSpectrum>,
}

fn level_key(class: TransitionClass, t: &Transition) -> (Family, QuantumNumbers) {
    (class.initial_family(), t.initial.qn)
}

/// Fills `total_rate_from_initial` of every transition.
pub fn apply_totals(transitions: &mut TransitionsByClass) {
    let mut totals: BTreeMap<(Family, QuantumNumbers), f64> = BTreeMap::new();
    for (class, list) in transitions.iter() {
        for t in list {
            *totals.entry(level_key(*class, t)).or_insert(0.0) += t.rate;
        }
    }
    for (class, list) in transitions.iter_mut() {
        for t in list.iter_mut() {
            t.total_rate_from_initial = totals.get(&level_key(*class, t)).copied().unwrap_or(0.0);
        }
    }
}

/// Radiative and Auger rates of every level with at least one transition.
pub fn level_widths(transitions: &TransitionsByClass) -> Vec<LevelWidth> {
    let mut levels: BTreeMap<(Family, QuantumNumbers), LevelWidth> = BTreeMap::new();
    for (class, list) in transitions {
        for t in list {
            let (family, qn) = level_key(*class, t);
            let level = levels.entry((family, qn)).or_insert_with(|| LevelWidth {
                family,
                qn,
                shell_label: t.initial.shell_label.clone(),
                radiative_rate: 0.0,
                auger_rate: 0.0,
                total_rate: 0.0,
                width_ev: 0.0,
            });
            if class.is_radiative() {
                level.radiative_rate += t.rate;
            } else {
                level.auger_rate += t.rate;
            }
        }
    }
    levels
        .into_values()
        .map(|mut level| {
            level.total_rate = level.radiative_rate + level.auger_rate;
            level.width_ev = level.total_rate * HBAR_EV_S;
            level
        })
        .collect()
}

/// Multiplicity-weighted fluorescence yield per vacancy shell.
pub fn fluorescence_yields(levels: &[LevelWidth]) -> Vec<ShellYield> {
    let mut shells: BTreeMap<(Family, &str), (f64, f64)> = BTreeMap::new();
    for level in levels {
        let weight = level.qn.multiplicity();
        let sums = shells
            .entry((level.family, level.shell_label.as_str()))
            .or_insert((0.0, 0.0));
        sums.0 += weight * level.radiative_rate;
        sums.1 += weight * level.total_rate;
    }
    shells
        .into_iter()
        .map(|((family, shell_label), (radiative, total))| ShellYield {
            family,
            shell_label: shell_label.to_string(),
            fluorescence_yield: if total > 0.0 { radiative / total } else { 0.0 },
        })
        .collect()
}

/// Line list of one class.
pub fn spectrum(class: TransitionClass, transitions: &[Transition], levels: &[LevelWidth]) -> Vec<SpectrumLine> {
    let widths: BTreeMap<QuantumNumbers, f64> = levels
        .iter()
        .filter(|l| l.family == class.initial_family())
        .map(|l| (l.qn, l.width_ev))
        .collect();
    let strength = |t: &Transition| t.initial.qn.multiplicity() * t.rate;
    let strongest = transitions.iter().map(strength).fold(0.0_f64, f64::max);

    transitions
        .iter()
        .map(|t| SpectrumLine {
            initial: t.initial.qn,
            final_state: t.final_state.qn,
            initial_label: t.initial.shell_label.clone(),
            final_label: t.final_state.shell_label.clone(),
            energy: t.energy,
            rate: t.rate,
            intensity: if strongest > 0.0 { strength(t) / strongest } else { 0.0 },
            branching_ratio: t.branching_ratio(),
            initial_width_ev: widths.get(&t.initial.qn).copied().unwrap_or(0.0),
        })
        .collect()
}

/// Reduces the transitions of a run into its summary.
pub fn summarize(label: &str, atomic_number: u32, transitions: &mut TransitionsByClass) -> Summary {
    apply_totals(transitions);
    let levels = level_widths(transitions);
    let yields = fluorescence_yields(&levels);
    let spectra = transitions
        .iter()
        .map(|(class, list)| ClassSpectrum {
            class: *class,
            lines: spectrum(*class, list, &levels),
        })
        .collect();
    Summary {
        label: label.to_string(),
        atomic_number,
        levels,
        yields,
        spectra,
    }
}

fn write(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RatesError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, text).map_err(|source| RatesError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes the spectra, widths, yields and JSON summary.
pub fn write_results(naming: &FileNaming, summary: &Summary) -> Result<()> {
    for spectrum in &summary.spectra {
        let mut text = String::from("# energy(eV)  intensity  branching_ratio  width(eV)  transition  labels\n");
        for line in &spectrum.lines {
            let _ = writeln!(
                text,
                "{:>14.6} {:>12.6e} {:>12.6e} {:>12.6e}  {}  {} -> {}",
                line.energy,
                line.intensity,
                line.branching_ratio,
                line.initial_width_ev,
                format_pair(&line.initial, &line.final_state),
                line.initial_label,
                line.final_label
            );
        }
        write(&naming.spectrum(spectrum.class), &text)?;
    }

    let mut widths = String::from("# family  i, jj, eigv  label  radiative(1/s)  auger(1/s)  total(1/s)  width(eV)\n");
    for level in &summary.levels {
        let _ = writeln!(
            widths,
            "{}  {}  {}  {:.6e}  {:.6e}  {:.6e}  {:.6e}",
            level.family,
            level.qn,
            level.shell_label,
            level.radiative_rate,
            level.auger_rate,
            level.total_rate,
            level.width_ev
        );
    }
    write(&naming.widths(), &widths)?;

    let mut yields = String::from("# family  shell  fluorescence_yield\n");
    for y in &summary.yields {
        let _ = writeln!(yields, "{}  {}  {:.6}", y.family, y.shell_label, y.fluorescence_yield);
    }
    write(&naming.yields(), &yields)?;

    write(&naming.results_json(), &serde_json::to_string_pretty(summary)?)?;
    info!("Results written to {}", naming.results_dir().display());
    Ok(())
}
