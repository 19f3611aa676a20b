//! Solver input templates.
//!
//! Inputs are rendered from plain-text templates containing `@NAME@` tokens.
//! The token set is closed ([`Token`]), every template kind declares the
//! tokens it must contain, and templates are checked when they are loaded, so
//! a broken user template fails the run before any job is written.
//!
//! Ten variants exist: five kinds ([`TemplateKind`]) times the nuclear-model
//! flag. Built-in variants are used unless the run input names a
//! `templates_dir`, in which case the files listed by
//! [`TemplateKind::file_name`] are read from it.

use crate::state::Endpoint;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"@[A-Z_]+@").unwrap();
}

/// Errors raised while loading or rendering templates.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// I/O error while reading a template
    #[error("IO error reading template {path}: {source}")]
    Io {
        /// Template file
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// A template lacks a token its kind requires
    #[error("Template '{template}' does not contain the required token {token}")]
    MissingToken {
        /// Template name
        template: String,
        /// Required token
        token: &'static str,
    },
    /// A template contains a token outside the token set
    #[error("Template '{template}' contains unknown token {token}")]
    UnknownToken {
        /// Template name
        template: String,
        /// Token text as found
        token: String,
    },
    /// A token allowed in the template was given no value for this kind
    #[error("Template '{template}' uses {token}, which a {kind} input does not provide")]
    UnusableToken {
        /// Template name
        template: String,
        /// Token without a value
        token: &'static str,
        /// `state` or `transition`
        kind: &'static str,
    },
}

type Result<T> = std::result::Result<T, TemplateError>;

/// Placeholder tokens understood by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// Nuclear charge
    AtomicNumber,
    /// State configuration
    Configuration,
    /// State `2J`
    TwoJ,
    /// State eigenvalue index
    Eigenvalue,
    /// Orbital override block
    FailedOrbitals,
    /// Initial state configuration
    InitialConfiguration,
    /// Initial state `2J`
    InitialTwoJ,
    /// Initial state eigenvalue index
    InitialEigenvalue,
    /// Staged initial wavefunction file
    InitialWavefunction,
    /// Final state configuration
    FinalConfiguration,
    /// Final state `2J`
    FinalTwoJ,
    /// Final state eigenvalue index
    FinalEigenvalue,
    /// Staged final wavefunction file
    FinalWavefunction,
}

impl Token {
    /// Every token, in template documentation order.
    pub const ALL: [Token; 13] = [
        Token::AtomicNumber,
        Token::Configuration,
        Token::TwoJ,
        Token::Eigenvalue,
        Token::FailedOrbitals,
        Token::InitialConfiguration,
        Token::InitialTwoJ,
        Token::InitialEigenvalue,
        Token::InitialWavefunction,
        Token::FinalConfiguration,
        Token::FinalTwoJ,
        Token::FinalEigenvalue,
        Token::FinalWavefunction,
    ];

    /// Literal text of the token.
    pub fn literal(self) -> &'static str {
        match self {
            Token::AtomicNumber => "@ZZ@",
            Token::Configuration => "@CONFIG@",
            Token::TwoJ => "@JJ@",
            Token::Eigenvalue => "@EIGV@",
            Token::FailedOrbitals => "@FAILED_ORBITALS@",
            Token::InitialConfiguration => "@INITIAL_CONFIG@",
            Token::InitialTwoJ => "@INITIAL_JJ@",
            Token::InitialEigenvalue => "@INITIAL_EIGV@",
            Token::InitialWavefunction => "@INITIAL_WF@",
            Token::FinalConfiguration => "@FINAL_CONFIG@",
            Token::FinalTwoJ => "@FINAL_JJ@",
            Token::FinalEigenvalue => "@FINAL_EIGV@",
            Token::FinalWavefunction => "@FINAL_WF@",
        }
    }

    fn from_literal(literal: &str) -> Option<Token> {
        Token::ALL.iter().copied().find(|t| t.literal() == literal)
    }
}

/// The five template kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    /// Cycle 1: default solver settings
    StateBase,
    /// Cycle 2: ten self-consistency steps
    StateTenSteps,
    /// Cycles 3 and 4: ten steps plus failing-orbital overrides
    StateOrbitals,
    /// Radiative transition between two states
    Radiative,
    /// Auger transition between two states
    Auger,
}

impl TemplateKind {
    /// Every template kind.
    pub const ALL: [TemplateKind; 5] = [
        TemplateKind::StateBase,
        TemplateKind::StateTenSteps,
        TemplateKind::StateOrbitals,
        TemplateKind::Radiative,
        TemplateKind::Auger,
    ];

    /// Template used for a refinement cycle (1-based).
    pub fn for_cycle(cycle: u8) -> TemplateKind {
        match cycle {
            0 | 1 => TemplateKind::StateBase,
            2 => TemplateKind::StateTenSteps,
            _ => TemplateKind::StateOrbitals,
        }
    }

    /// Template file name inside a `templates_dir`.
    pub fn file_name(self, nuclear: bool) -> String {
        let stem = match self {
            TemplateKind::StateBase => "state_base",
            TemplateKind::StateTenSteps => "state_10steps",
            TemplateKind::StateOrbitals => "state_10steps_orbitals",
            TemplateKind::Radiative => "transition_radiative",
            TemplateKind::Auger => "transition_auger",
        };
        if nuclear {
            format!("{}_nuc.f05", stem)
        } else {
            format!("{}.f05", stem)
        }
    }

    fn is_state(self) -> bool {
        matches!(
            self,
            TemplateKind::StateBase | TemplateKind::StateTenSteps | TemplateKind::StateOrbitals
        )
    }

    /// Tokens the template must contain.
    pub fn required_tokens(self) -> &'static [Token] {
        match self {
            TemplateKind::StateBase | TemplateKind::StateTenSteps => &[
                Token::AtomicNumber,
                Token::Configuration,
                Token::TwoJ,
                Token::Eigenvalue,
            ],
            TemplateKind::StateOrbitals => &[
                Token::AtomicNumber,
                Token::Configuration,
                Token::TwoJ,
                Token::Eigenvalue,
                Token::FailedOrbitals,
            ],
            TemplateKind::Radiative | TemplateKind::Auger => &[
                Token::AtomicNumber,
                Token::InitialConfiguration,
                Token::InitialTwoJ,
                Token::InitialEigenvalue,
                Token::InitialWavefunction,
                Token::FinalConfiguration,
                Token::FinalTwoJ,
                Token::FinalEigenvalue,
                Token::FinalWavefunction,
            ],
        }
    }

    fn input_name(self) -> &'static str {
        if self.is_state() {
            "state"
        } else {
            "transition"
        }
    }
}

/// Values for a state input.
#[derive(Debug, Clone)]
pub struct StateInput<'a> {
    /// Nuclear charge
    pub atomic_number: u32,
    /// Configuration text
    pub configuration: &'a str,
    /// Twice the total angular momentum
    pub two_j: u32,
    /// Eigenvalue index within the `2J` block
    pub eigenvalue: u32,
    /// Orbitals whose treatment is overridden (cycles 3 and 4)
    pub failed_orbitals: &'a [String],
}

impl StateInput<'_> {
    fn value(&self, token: Token) -> Option<String> {
        match token {
            Token::AtomicNumber => Some(self.atomic_number.to_string()),
            Token::Configuration => Some(self.configuration.to_string()),
            Token::TwoJ => Some(self.two_j.to_string()),
            Token::Eigenvalue => Some(self.eigenvalue.to_string()),
            Token::FailedOrbitals => Some(orbital_block(self.failed_orbitals)),
            Token::InitialConfiguration
            | Token::InitialTwoJ
            | Token::InitialEigenvalue
            | Token::InitialWavefunction
            | Token::FinalConfiguration
            | Token::FinalTwoJ
            | Token::FinalEigenvalue
            | Token::FinalWavefunction => None,
        }
    }
}

/// Values for a transition input.
#[derive(Debug, Clone)]
pub struct TransitionInput<'a> {
    /// Nuclear charge
    pub atomic_number: u32,
    /// Initial state
    pub initial: &'a Endpoint,
    /// Final state
    pub final_state: &'a Endpoint,
    /// Staged initial wavefunction file name inside the job directory
    pub initial_wavefunction: &'a str,
    /// Staged final wavefunction file name inside the job directory
    pub final_wavefunction: &'a str,
}

impl TransitionInput<'_> {
    fn value(&self, token: Token) -> Option<String> {
        match token {
            Token::AtomicNumber => Some(self.atomic_number.to_string()),
            Token::InitialConfiguration => Some(self.initial.configuration.clone()),
            Token::InitialTwoJ => Some(self.initial.qn.two_j.to_string()),
            Token::InitialEigenvalue => Some(self.initial.qn.eigenvalue.to_string()),
            Token::InitialWavefunction => Some(self.initial_wavefunction.to_string()),
            Token::FinalConfiguration => Some(self.final_state.configuration.clone()),
            Token::FinalTwoJ => Some(self.final_state.qn.two_j.to_string()),
            Token::FinalEigenvalue => Some(self.final_state.qn.eigenvalue.to_string()),
            Token::FinalWavefunction => Some(self.final_wavefunction.to_string()),
            Token::Configuration
            | Token::TwoJ
            | Token::Eigenvalue
            | Token::FailedOrbitals => None,
        }
    }
}

fn orbital_block(orbitals: &[String]) -> String {
    orbitals
        .iter()
        .map(|orbital| format!("orbital_override = {}", orbital))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A validated template.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    kind: TemplateKind,
    text: String,
    tokens: Vec<Token>,
}

impl Template {
    /// Validates `text` against the token schema of `kind`.
    pub fn new(name: &str, kind: TemplateKind, text: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        for found in TOKEN_RE.find_iter(text) {
            let token = Token::from_literal(found.as_str()).ok_or_else(|| {
                TemplateError::UnknownToken {
                    template: name.to_string(),
                    token: found.as_str().to_string(),
                }
            })?;
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
        for required in kind.required_tokens() {
            if !tokens.contains(required) {
                return Err(TemplateError::MissingToken {
                    template: name.to_string(),
                    token: required.literal(),
                });
            }
        }
        Ok(Self {
            name: name.to_string(),
            kind,
            text: text.to_string(),
            tokens,
        })
    }

    /// Template kind.
    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    fn render_with(&self, value: impl Fn(Token) -> Option<String>) -> Result<String> {
        let mut rendered = self.text.clone();
        for token in &self.tokens {
            let replacement = value(*token).ok_or_else(|| TemplateError::UnusableToken {
                template: self.name.clone(),
                token: token.literal(),
                kind: self.kind.input_name(),
            })?;
            rendered = rendered.replace(token.literal(), &replacement);
        }
        Ok(rendered)
    }
}

/// The five templates of one nuclear-model setting.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: HashMap<TemplateKind, Template>,
    nuclear: bool,
}

impl TemplateSet {
    /// Built-in templates.
    pub fn builtin(nuclear: bool) -> Result<Self> {
        let mut templates = HashMap::new();
        for kind in TemplateKind::ALL {
            let template = Template::new(&kind.file_name(nuclear), kind, &builtin_text(kind, nuclear))?;
            templates.insert(kind, template);
        }
        Ok(Self { templates, nuclear })
    }

    /// Reads and validates the five templates from `dir`.
    pub fn from_dir(dir: &Path, nuclear: bool) -> Result<Self> {
        let mut templates = HashMap::new();
        for kind in TemplateKind::ALL {
            let path = dir.join(kind.file_name(nuclear));
            let text = fs::read_to_string(&path).map_err(|source| TemplateError::Io {
                path: path.clone(),
                source,
            })?;
            debug!("Loaded template {}", path.display());
            templates.insert(kind, Template::new(&path.display().to_string(), kind, &text)?);
        }
        Ok(Self { templates, nuclear })
    }

    /// User templates when a directory is given, built-in ones otherwise.
    pub fn load(dir: Option<&Path>, nuclear: bool) -> Result<Self> {
        match dir {
            Some(dir) => Self::from_dir(dir, nuclear),
            None => Self::builtin(nuclear),
        }
    }

    /// Whether these are the nuclear-model variants.
    pub fn nuclear(&self) -> bool {
        self.nuclear
    }

    fn get(&self, kind: TemplateKind) -> &Template {
        // every constructor inserts all kinds
        &self.templates[&kind]
    }

    /// Renders a state input with the template of `kind`.
    pub fn render_state(&self, kind: TemplateKind, input: &StateInput<'_>) -> Result<String> {
        self.get(kind).render_with(|token| input.value(token))
    }

    /// Renders a transition input (radiative or Auger template).
    pub fn render_transition(&self, radiative: bool, input: &TransitionInput<'_>) -> Result<String> {
        let kind = if radiative {
            TemplateKind::Radiative
        } else {
            TemplateKind::Auger
        };
        self.get(kind).render_with(|token| input.value(token))
    }
}

fn builtin_text(kind: TemplateKind, nuclear: bool) -> String {
    let nucleus = if nuclear {
        "nuclear_model = fermi\nnuclear_recoil = yes\n"
    } else {
        "nuclear_model = point\n"
    };
    match kind {
        TemplateKind::StateBase | TemplateKind::StateTenSteps | TemplateKind::StateOrbitals => {
            let steps = match kind {
                TemplateKind::StateBase => "scf_steps = default\n",
                _ => "scf_steps = 10\nscf_damping = yes\n",
            };
            let overrides = if kind == TemplateKind::StateOrbitals {
                "@FAILED_ORBITALS@\n"
            } else {
                ""
            };
            format!(
                "mcdfgme state\n\
                 nuclear_charge = @ZZ@\n\
                 {nucleus}\
                 configuration = @CONFIG@\n\
                 total_2j = @JJ@\n\
                 eigenvalue = @EIGV@\n\
                 coupling = jj\n\
                 {steps}\
                 {overrides}\
                 breit = magnetic_retardation\n\
                 qed = self_energy vacuum_polarization\n\
                 write_wavefunction = yes\n\
                 scratch = tmp/\n"
            )
        }
        TemplateKind::Radiative | TemplateKind::Auger => {
            let transition = if kind == TemplateKind::Radiative {
                "transition = radiative\nmultipoles = all\n"
            } else {
                "transition = auger\ncontinuum = yes\n"
            };
            format!(
                "mcdfgme transition\n\
                 nuclear_charge = @ZZ@\n\
                 {nucleus}\
                 {transition}\
                 initial_configuration = @INITIAL_CONFIG@\n\
                 initial_2j = @INITIAL_JJ@\n\
                 initial_eigenvalue = @INITIAL_EIGV@\n\
                 initial_wavefunction = @INITIAL_WF@\n\
                 final_configuration = @FINAL_CONFIG@\n\
                 final_2j = @FINAL_JJ@\n\
                 final_eigenvalue = @FINAL_EIGV@\n\
                 final_wavefunction = @FINAL_WF@\n\
                 scratch = tmp/\n"
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::QuantumNumbers;
    use tempfile::TempDir;

    fn endpoint(shell: usize, two_j: u32, configuration: &str) -> Endpoint {
        Endpoint {
            qn: QuantumNumbers::new(shell, two_j, 1),
            shell_label: "2p".to_string(),
            configuration: configuration.to_string(),
            higher_config: String::new(),
            highest_percent: 0.0,
            total_energy: -100.0,
        }
    }

    #[test]
    fn test_all_builtin_variants_validate() {
        for nuclear in [false, true] {
            let set = TemplateSet::builtin(nuclear).unwrap();
            assert_eq!(set.nuclear(), nuclear);
        }
    }

    #[test]
    fn test_state_rendering_replaces_every_token() {
        let set = TemplateSet::builtin(false).unwrap();
        let orbitals = vec!["2p+".to_string(), "2s".to_string()];
        let input = StateInput {
            atomic_number: 10,
            configuration: "(1s)2 (2s)2 (2p)5",
            two_j: 3,
            eigenvalue: 1,
            failed_orbitals: &orbitals,
        };
        let text = set.render_state(TemplateKind::StateOrbitals, &input).unwrap();
        assert!(text.contains("nuclear_charge = 10"));
        assert!(text.contains("configuration = (1s)2 (2s)2 (2p)5"));
        assert!(text.contains("total_2j = 3"));
        assert!(text.contains("orbital_override = 2p+\norbital_override = 2s"));
        assert!(!TOKEN_RE.is_match(&text));

        let base = set.render_state(TemplateKind::StateBase, &input).unwrap();
        assert!(!base.contains("orbital_override"));
    }

    #[test]
    fn test_transition_rendering() {
        let set = TemplateSet::builtin(true).unwrap();
        let initial = endpoint(2, 3, "(1s)2 (2s)2 (2p)5");
        let final_state = endpoint(0, 1, "(1s)1 (2s)2 (2p)6");
        let input = TransitionInput {
            atomic_number: 10,
            initial: &initial,
            final_state: &final_state,
            initial_wavefunction: "initial.f09",
            final_wavefunction: "final.f09",
        };
        let text = set.render_transition(false, &input).unwrap();
        assert!(text.contains("transition = auger"));
        assert!(text.contains("nuclear_model = fermi"));
        assert!(text.contains("final_wavefunction = final.f09"));
        assert!(!TOKEN_RE.is_match(&text));
    }

    #[test]
    fn test_missing_and_unknown_tokens_fail_at_load() {
        assert!(matches!(
            Template::new("t", TemplateKind::StateBase, "@ZZ@ @CONFIG@ @JJ@"),
            Err(TemplateError::MissingToken { token: "@EIGV@", .. })
        ));
        assert!(matches!(
            Template::new("t", TemplateKind::StateBase, "@ZZ@ @CONFIG@ @JJ@ @EIGV@ @ZETA@"),
            Err(TemplateError::UnknownToken { .. })
        ));
    }

    #[test]
    fn test_token_from_wrong_kind_fails_at_render() {
        let template = Template::new(
            "t",
            TemplateKind::StateBase,
            "@ZZ@ @CONFIG@ @JJ@ @EIGV@ @FINAL_WF@",
        )
        .unwrap();
        let input = StateInput {
            atomic_number: 10,
            configuration: "(1s)1",
            two_j: 1,
            eigenvalue: 1,
            failed_orbitals: &[],
        };
        assert!(matches!(
            template.render_with(|t| input.value(t)),
            Err(TemplateError::UnusableToken { .. })
        ));
    }

    #[test]
    fn test_templates_dir() {
        let dir = TempDir::new().unwrap();
        for kind in TemplateKind::ALL {
            fs::write(dir.path().join(kind.file_name(false)), builtin_text(kind, false)).unwrap();
        }
        assert!(TemplateSet::from_dir(dir.path(), false).is_ok());
        assert!(matches!(
            TemplateSet::from_dir(dir.path(), true),
            Err(TemplateError::Io { .. })
        ));
    }
}
