//! Enumeration of the electron configurations and levels of every family.
//!
//! Automatic mode starts from the neutral ground state, built by filling a
//! fixed 24-shell table in aufbau order, and removes or promotes electrons:
//!
//! - one hole: one electron removed from shell `i`
//! - two holes: a second electron removed from shell `j >= i`
//! - three holes: a third electron removed from shell `h >= j`
//! - shake-up: a two-hole configuration plus one electron promoted from shell
//!   `h >= j` to the first shell after `h` (aufbau order) that is not full
//! - excitation: the same promotion on top of a one-hole configuration (`h >= i`)
//!
//! Manual mode reads `configuration, label` lists instead. Either way the
//! electron counts of the families are cross-checked before anything runs.
//!
//! The levels of a configuration are counted in jj coupling: with `N(2M)`
//! the number of determinants of total projection `2M`, there are
//! `N(2J) - N(2J + 2)` levels of total angular momentum `2J`.

use crate::config::{Config, ConfigurationMode, Family};
use crate::state::QuantumNumbers;
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Number of shells in the shell table.
pub const SHELL_COUNT: usize = 24;

/// Shell table in the order configuration strings list shells: `(n, l, name)`.
pub const SHELLS: [(u32, u32, &str); SHELL_COUNT] = [
    (1, 0, "1s"),
    (2, 0, "2s"),
    (2, 1, "2p"),
    (3, 0, "3s"),
    (3, 1, "3p"),
    (3, 2, "3d"),
    (4, 0, "4s"),
    (4, 1, "4p"),
    (4, 2, "4d"),
    (4, 3, "4f"),
    (5, 0, "5s"),
    (5, 1, "5p"),
    (5, 2, "5d"),
    (5, 3, "5f"),
    (5, 4, "5g"),
    (6, 0, "6s"),
    (6, 1, "6p"),
    (6, 2, "6d"),
    (6, 3, "6f"),
    (6, 4, "6g"),
    (6, 5, "6h"),
    (7, 0, "7s"),
    (7, 1, "7p"),
    (7, 2, "7d"),
];

lazy_static! {
    /// Shell indices sorted by `n + l`, then `n`.
    static ref AUFBAU: Vec<usize> = {
        let mut order: Vec<usize> = (0..SHELL_COUNT).collect();
        order.sort_by_key(|&i| (SHELLS[i].0 + SHELLS[i].1, SHELLS[i].0));
        order
    };

    // "(2p)5", "(2p-)2" or "(3d+) 4"
    static ref SHELL_TOKEN_RE: Regex =
        Regex::new(r"\((\d+)([spdfgh])([+-]?)\)\s*(\d+)").unwrap();
}

/// Errors raised while building the configuration lists.
#[derive(Error, Debug)]
pub enum EnumerationError {
    /// I/O error while reading a configuration list
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A manual configuration list does not exist
    #[error("Configuration list not found: {0}")]
    MissingFile(PathBuf),
    /// A line of a configuration list could not be read
    #[error("{file}:{line}: {message}")]
    Malformed {
        /// Configuration list
        file: PathBuf,
        /// 1-based line number
        line: usize,
        /// What was wrong with the line
        message: String,
    },
    /// Configurations of one family carry different electron counts
    #[error("{family} configurations have inconsistent electron counts ({first} vs {other} in '{configuration}')")]
    InconsistentFamily {
        /// Family of the list
        family: Family,
        /// Electron count of the first configuration
        first: u32,
        /// Electron count of the offending configuration
        other: u32,
        /// The offending configuration
        configuration: String,
    },
    /// Two families do not differ by the expected number of electrons
    #[error("{family} states have {found} electrons, expected {expected} from the {reference} states")]
    FamilyMismatch {
        /// Family checked
        family: Family,
        /// Family the count is derived from
        reference: Family,
        /// Electron count found
        found: u32,
        /// Electron count required
        expected: u32,
    },
    /// The atom does not fit the shell table
    #[error("Atomic number {0} cannot be placed in the shell table")]
    UnsupportedAtom(u32),
    /// A family produced no configuration at all
    #[error("No {0} configurations")]
    Empty(Family),
}

type Result<T> = std::result::Result<T, EnumerationError>;

/// Shell capacity `2(2l + 1)`.
pub fn capacity(shell: usize) -> u32 {
    2 * (2 * SHELLS[shell].1 + 1)
}

/// Shell occupation numbers, indexed like [`SHELLS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupation([u32; SHELL_COUNT]);

impl Occupation {
    /// Neutral ground state of element `z`.
    pub fn ground_state(z: u32) -> Result<Self> {
        let mut occupation = [0u32; SHELL_COUNT];
        let mut remaining = z;
        for &shell in AUFBAU.iter() {
            if remaining == 0 {
                break;
            }
            let placed = remaining.min(capacity(shell));
            occupation[shell] = placed;
            remaining -= placed;
        }
        if z == 0 || remaining > 0 {
            return Err(EnumerationError::UnsupportedAtom(z));
        }
        Ok(Self(occupation))
    }

    /// Reads `(nl)q` tokens from a configuration string.
    ///
    /// Relativistic subshell tokens such as `(2p-)2` add to their shell.
    pub fn parse(configuration: &str) -> Option<Self> {
        let mut occupation = [0u32; SHELL_COUNT];
        let mut found = false;
        for caps in SHELL_TOKEN_RE.captures_iter(configuration) {
            let name = format!("{}{}", &caps[1], &caps[2]);
            let shell = SHELLS.iter().position(|(_, _, n)| *n == name)?;
            occupation[shell] += caps[4].parse::<u32>().ok()?;
            found = true;
        }
        if !found || (0..SHELL_COUNT).any(|s| occupation[s] > capacity(s)) {
            return None;
        }
        Some(Self(occupation))
    }

    /// Electrons in the configuration.
    pub fn electrons(&self) -> u32 {
        self.0.iter().sum()
    }

    /// Occupation of one shell.
    pub fn get(&self, shell: usize) -> u32 {
        self.0[shell]
    }

    fn removed(&self, shell: usize) -> Option<Self> {
        if self.0[shell] == 0 {
            return None;
        }
        let mut next = *self;
        next.0[shell] -= 1;
        Some(next)
    }

    /// Moves one electron from `donor` to the first non-full shell after it.
    fn promoted(&self, donor: usize) -> Option<(Self, usize)> {
        let mut next = self.removed(donor)?;
        let position = AUFBAU.iter().position(|&s| s == donor)?;
        let target = AUFBAU[position + 1..]
            .iter()
            .copied()
            .find(|&s| next.0[s] < capacity(s))?;
        next.0[target] += 1;
        Some((next, target))
    }

    /// Solver configuration string, e.g. `(1s)2 (2s)2 (2p)5`.
    pub fn to_configuration(&self) -> String {
        (0..SHELL_COUNT)
            .filter(|&s| self.0[s] > 0)
            .map(|s| format!("({}){}", SHELLS[s].2, self.0[s]))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Partially filled shells.
    fn open_shells(&self) -> impl Iterator<Item = usize> + '_ {
        (0..SHELL_COUNT).filter(move |&s| self.0[s] > 0 && self.0[s] < capacity(s))
    }
}

/// One electron configuration of a family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// String handed to the solver
    pub configuration: String,
    /// Vacancy label (`1s2p`, `1s2p_2p_3s`, ...)
    pub label: String,
    /// Occupation numbers
    pub occupation: Occupation,
}

impl Configuration {
    fn from_occupation(occupation: Occupation, label: String) -> Self {
        Self {
            configuration: occupation.to_configuration(),
            label,
            occupation,
        }
    }

    /// Electrons in the configuration.
    pub fn electrons(&self) -> u32 {
        self.occupation.electrons()
    }
}

/// Enumerates one family from the ground state of element `z`.
pub fn enumerate(z: u32, family: Family) -> Result<Vec<Configuration>> {
    let ground = Occupation::ground_state(z)?;
    let name = |s: usize| SHELLS[s].2;
    let mut configurations = Vec::new();

    match family {
        Family::OneHole => {
            for i in 0..SHELL_COUNT {
                if let Some(one) = ground.removed(i) {
                    configurations.push(Configuration::from_occupation(one, name(i).to_string()));
                }
            }
        }
        Family::TwoHole => {
            for (i, j, two) in two_holes(&ground) {
                configurations.push(Configuration::from_occupation(
                    two,
                    format!("{}{}", name(i), name(j)),
                ));
            }
        }
        Family::ThreeHole => {
            for (i, j, two) in two_holes(&ground) {
                for h in j..SHELL_COUNT {
                    if let Some(three) = two.removed(h) {
                        configurations.push(Configuration::from_occupation(
                            three,
                            format!("{}{}{}", name(i), name(j), name(h)),
                        ));
                    }
                }
            }
        }
        Family::ShakeUp => {
            for (i, j, two) in two_holes(&ground) {
                for h in j..SHELL_COUNT {
                    if let Some((shaken, target)) = two.promoted(h) {
                        configurations.push(Configuration::from_occupation(
                            shaken,
                            format!("{}{}_{}_{}", name(i), name(j), name(h), name(target)),
                        ));
                    }
                }
            }
        }
        Family::Excitation => {
            for i in 0..SHELL_COUNT {
                let Some(one) = ground.removed(i) else { continue };
                for h in i..SHELL_COUNT {
                    if let Some((excited, target)) = one.promoted(h) {
                        configurations.push(Configuration::from_occupation(
                            excited,
                            format!("{}_{}_{}", name(i), name(h), name(target)),
                        ));
                    }
                }
            }
        }
    }

    if configurations.is_empty() {
        return Err(EnumerationError::Empty(family));
    }
    debug!("Enumerated {} {} configurations", configurations.len(), family);
    Ok(configurations)
}

fn two_holes(ground: &Occupation) -> Vec<(usize, usize, Occupation)> {
    let mut pairs = Vec::new();
    for i in 0..SHELL_COUNT {
        let Some(one) = ground.removed(i) else { continue };
        for j in i..SHELL_COUNT {
            if let Some(two) = one.removed(j) {
                pairs.push((i, j, two));
            }
        }
    }
    pairs
}

/// Reads a manual `configuration, label` list.
///
/// Blank lines and lines starting with `#` are skipped.
pub fn read_configuration_file(path: &Path) -> Result<Vec<Configuration>> {
    if !path.exists() {
        return Err(EnumerationError::MissingFile(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    let mut configurations = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = |message: &str| EnumerationError::Malformed {
            file: path.to_path_buf(),
            line: index + 1,
            message: message.to_string(),
        };
        let (configuration, label) = line
            .rsplit_once(',')
            .ok_or_else(|| malformed("expected 'configuration, label'"))?;
        let occupation = Occupation::parse(configuration)
            .ok_or_else(|| malformed("unreadable configuration"))?;
        configurations.push(Configuration {
            configuration: configuration.trim().to_string(),
            label: label.trim().to_string(),
            occupation,
        });
    }

    Ok(configurations)
}

/// Builds the configuration lists of every family of a run and validates
/// their electron counts.
pub fn build_configurations(
    config: &Config,
    configurations_dir: &Path,
) -> Result<BTreeMap<Family, Vec<Configuration>>> {
    let mut families = BTreeMap::new();
    for family in config.families() {
        let list = match config.mode {
            ConfigurationMode::Automatic => enumerate(config.atomic_number, family)?,
            ConfigurationMode::Manual => {
                let list = read_configuration_file(&configurations_dir.join(family.csv_name()))?;
                if list.is_empty() {
                    return Err(EnumerationError::Empty(family));
                }
                list
            }
        };
        info!("{} configurations: {}", family, list.len());
        families.insert(family, list);
    }
    validate_electron_counts(&families)?;
    Ok(families)
}

/// Checks that every family has one electron count and that the families
/// are consistent with each other:
/// one-hole = two-hole + 1 = three-hole + 2, shake-up = two-hole,
/// excitation = one-hole.
pub fn validate_electron_counts(families: &BTreeMap<Family, Vec<Configuration>>) -> Result<()> {
    let mut counts = BTreeMap::new();
    for (family, list) in families {
        let Some(first) = list.first() else { continue };
        let expected = first.electrons();
        if let Some(bad) = list.iter().find(|c| c.electrons() != expected) {
            return Err(EnumerationError::InconsistentFamily {
                family: *family,
                first: expected,
                other: bad.electrons(),
                configuration: bad.configuration.clone(),
            });
        }
        counts.insert(*family, expected);
    }

    let Some(&one_hole) = counts.get(&Family::OneHole) else {
        return Ok(());
    };
    for (&family, &found) in &counts {
        // Offsets relative to the one-hole count
        let expected = (one_hole + 1).saturating_sub(family.removed_electrons());
        if found != expected {
            return Err(EnumerationError::FamilyMismatch {
                family,
                reference: Family::OneHole,
                found,
                expected,
            });
        }
    }
    Ok(())
}

/// Determinant counts by total `2M` for `q` electrons in one shell.
fn shell_projections(shell: usize, q: u32) -> BTreeMap<i32, u64> {
    let l = SHELLS[shell].1 as i32;
    let mut orbitals: Vec<i32> = Vec::new();
    for two_j in [2 * l - 1, 2 * l + 1] {
        if two_j < 0 {
            continue;
        }
        orbitals.extend((-two_j..=two_j).step_by(2));
    }

    // table[k] maps 2M to the number of k-electron subsets with that sum
    let q = q as usize;
    let mut table: Vec<BTreeMap<i32, u64>> = vec![BTreeMap::new(); q + 1];
    table[0].insert(0, 1);
    for two_m in orbitals {
        for k in (1..=q).rev() {
            let shifted: Vec<(i32, u64)> =
                table[k - 1].iter().map(|(m, n)| (m + two_m, *n)).collect();
            for (m, n) in shifted {
                *table[k].entry(m).or_insert(0) += n;
            }
        }
    }
    table.swap_remove(q)
}

fn convolve(a: &BTreeMap<i32, u64>, b: &BTreeMap<i32, u64>) -> BTreeMap<i32, u64> {
    let mut out = BTreeMap::new();
    for (ma, na) in a {
        for (mb, nb) in b {
            *out.entry(ma + mb).or_insert(0) += na * nb;
        }
    }
    out
}

/// Number of jj levels per `2J`, ascending in `2J`.
///
/// # Examples
///
/// ```
/// use openhole::enumerator::{jj_levels, Occupation};
///
/// // (1s)2 (2s)2 (2p)5: one level each with 2J = 1 and 2J = 3
/// let occupation = Occupation::parse("(1s)2 (2s)2 (2p)5").unwrap();
/// assert_eq!(jj_levels(&occupation), vec![(1, 1), (3, 1)]);
/// ```
pub fn jj_levels(occupation: &Occupation) -> Vec<(u32, u32)> {
    let mut projections: BTreeMap<i32, u64> = BTreeMap::from([(0, 1)]);
    for shell in occupation.open_shells() {
        projections = convolve(&projections, &shell_projections(shell, occupation.get(shell)));
    }

    let count = |two_m: i32| projections.get(&two_m).copied().unwrap_or(0);
    let max = projections.keys().next_back().copied().unwrap_or(0);
    let lowest = max.rem_euclid(2);

    let mut levels = Vec::new();
    let mut two_j = lowest;
    while two_j <= max {
        let n = count(two_j).saturating_sub(count(two_j + 2));
        if n > 0 {
            levels.push((two_j as u32, n as u32));
        }
        two_j += 2;
    }
    levels
}

/// Quantum numbers of every level of a family, in discovery order
/// (configuration, then `2J`, then eigenvalue).
pub fn discover(configurations: &[Configuration]) -> Vec<QuantumNumbers> {
    let mut states = Vec::new();
    for (shell, configuration) in configurations.iter().enumerate() {
        for (two_j, count) in jj_levels(&configuration.occupation) {
            for eigenvalue in 1..=count {
                states.push(QuantumNumbers::new(shell, two_j, eigenvalue));
            }
        }
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn labels(list: &[Configuration]) -> Vec<&str> {
        list.iter().map(|c| c.label.as_str()).collect()
    }

    #[test]
    fn test_ground_states() {
        assert_eq!(
            Occupation::ground_state(10).unwrap().to_configuration(),
            "(1s)2 (2s)2 (2p)6"
        );
        // 4s fills before 3d
        assert_eq!(
            Occupation::ground_state(20).unwrap().to_configuration(),
            "(1s)2 (2s)2 (2p)6 (3s)2 (3p)6 (4s)2"
        );
        assert_eq!(
            Occupation::ground_state(21).unwrap().to_configuration(),
            "(1s)2 (2s)2 (2p)6 (3s)2 (3p)6 (3d)1 (4s)2"
        );
        assert!(Occupation::ground_state(0).is_err());
    }

    #[test]
    fn test_neon_one_hole() {
        let list = enumerate(10, Family::OneHole).unwrap();
        assert_eq!(labels(&list), vec!["1s", "2s", "2p"]);
        assert_eq!(list[0].configuration, "(1s)1 (2s)2 (2p)6");
        assert_eq!(list[2].configuration, "(1s)2 (2s)2 (2p)5");
        assert!(list.iter().all(|c| c.electrons() == 9));
    }

    #[test]
    fn test_neon_two_and_three_holes() {
        let two = enumerate(10, Family::TwoHole).unwrap();
        assert_eq!(labels(&two), vec!["1s1s", "1s2s", "1s2p", "2s2s", "2s2p", "2p2p"]);
        assert_eq!(two[0].configuration, "(2s)2 (2p)6");

        let three = enumerate(10, Family::ThreeHole).unwrap();
        // 1s1s1s and 2s2s2s exceed the s capacity
        assert_eq!(three.len(), 8);
        assert_eq!(three[0].label, "1s1s2s");
        assert!(three.iter().all(|c| c.electrons() == 7));
    }

    #[test]
    fn test_shake_up_and_excitation_labels() {
        let shake = enumerate(10, Family::ShakeUp).unwrap();
        assert_eq!(shake[0].label, "1s1s_2s_3s");
        assert!(shake.iter().any(|c| c.label == "1s2p_2p_3s"));
        assert!(shake.iter().all(|c| c.electrons() == 8));

        let excitation = enumerate(10, Family::Excitation).unwrap();
        // the emptied 1s is skipped, 2s and 2p are full
        assert_eq!(excitation[0].label, "1s_1s_3s");
        assert_eq!(excitation[0].configuration, "(2s)2 (2p)6 (3s)1");
    }

    #[test]
    fn test_promotion_targets_next_open_shell() {
        let excitation = enumerate(10, Family::Excitation).unwrap();
        let one_s = excitation.iter().find(|c| c.label == "1s_2p_3s").unwrap();
        assert_eq!(one_s.configuration, "(1s)1 (2s)2 (2p)5 (3s)1");
        assert!(excitation.iter().all(|c| c.electrons() == 9));
    }

    #[test]
    fn test_jj_levels() {
        let p5 = Occupation::parse("(1s)2 (2s)2 (2p)5").unwrap();
        assert_eq!(jj_levels(&p5), vec![(1, 1), (3, 1)]);

        let s1 = Occupation::parse("(1s)1 (2s)2 (2p)6").unwrap();
        assert_eq!(jj_levels(&s1), vec![(1, 1)]);

        // p^4: 2J = 0 (x2), 2J = 2 (x1), 2J = 4 (x2), i.e. 3P, 1D, 1S
        let p4 = Occupation::parse("(2p)4").unwrap();
        assert_eq!(jj_levels(&p4), vec![(0, 2), (2, 1), (4, 2)]);

        // closed shells only
        let closed = Occupation::parse("(1s)2 (2s)2 (2p)6").unwrap();
        assert_eq!(jj_levels(&closed), vec![(0, 1)]);

        // two open s shells: 1s1 2s1 gives J = 0 and J = 1
        let ss = Occupation::parse("(1s)1 (2s)1").unwrap();
        assert_eq!(jj_levels(&ss), vec![(0, 1), (2, 1)]);
    }

    #[test]
    fn test_discovery_order() {
        let list = enumerate(10, Family::OneHole).unwrap();
        assert_eq!(
            discover(&list),
            vec![
                QuantumNumbers::new(0, 1, 1),
                QuantumNumbers::new(1, 1, 1),
                QuantumNumbers::new(2, 1, 1),
                QuantumNumbers::new(2, 3, 1),
            ]
        );
    }

    #[test]
    fn test_manual_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1hole.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "# configuration, label").unwrap();
        writeln!(file, "(1s)1 (2s)2 (2p)6, 1s").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "(1s)2 (2s)2 (2p-)1 (2p+)4, 2p").unwrap();

        let list = read_configuration_file(&path).unwrap();
        assert_eq!(labels(&list), vec!["1s", "2p"]);
        assert_eq!(list[1].electrons(), 9);

        assert!(matches!(
            read_configuration_file(&dir.path().join("2hole.csv")),
            Err(EnumerationError::MissingFile(_))
        ));
    }

    #[test]
    fn test_manual_file_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1hole.csv");
        fs::write(&path, "(1s)1 (2s)2 (2p)6 1s\n").unwrap();
        assert!(matches!(
            read_configuration_file(&path),
            Err(EnumerationError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn test_electron_count_validation() {
        let mut families = BTreeMap::new();
        families.insert(Family::OneHole, enumerate(10, Family::OneHole).unwrap());
        families.insert(Family::TwoHole, enumerate(10, Family::TwoHole).unwrap());
        families.insert(Family::ShakeUp, enumerate(10, Family::ShakeUp).unwrap());
        assert!(validate_electron_counts(&families).is_ok());

        families.insert(Family::ThreeHole, enumerate(10, Family::TwoHole).unwrap());
        assert!(matches!(
            validate_electron_counts(&families),
            Err(EnumerationError::FamilyMismatch {
                family: Family::ThreeHole,
                ..
            })
        ));

        let mut mixed = enumerate(10, Family::OneHole).unwrap();
        mixed.push(enumerate(10, Family::TwoHole).unwrap().remove(0));
        let mut families = BTreeMap::new();
        families.insert(Family::OneHole, mixed);
        assert!(matches!(
            validate_electron_counts(&families),
            Err(EnumerationError::InconsistentFamily { .. })
        ));
    }
}
