use openhole::config::{ConfigurationMode, Family};
use openhole::parser::{create_input_template, parse_input, RunParameters};
use std::fs::File;
use std::io::Write;
use tempfile::TempDir;

#[test]
fn test_parse_run_input_file() {
    let input = r#"
# Neon, every optional family but excitation
atomic_number = 10
Mode = manual
configurations_dir = lists      # relative to the input
three_holes = yes
shake_up = on
energy_diff_threshold = 0.5
"#;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("neon_run.inp");
    let mut file = File::create(&path).unwrap();
    write!(file, "{}", input).unwrap();

    let config = parse_input(&path).unwrap();
    assert_eq!(config.label, "neon_run");
    assert_eq!(config.mode, ConfigurationMode::Manual);
    assert_eq!(config.configurations_dir, Some(dir.path().join("lists")));
    assert_eq!(config.thresholds.energy_diff, 0.5);
    assert_eq!(
        config.families(),
        vec![Family::OneHole, Family::TwoHole, Family::ThreeHole, Family::ShakeUp]
    );
    assert_eq!(config.transition_classes().len(), 5);
}

#[test]
fn test_generated_template_parses() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("argon.inp");
    create_input_template(&path).unwrap();

    let config = parse_input(&path).unwrap();
    assert_eq!(config.label, "argon");
    assert!(config.atomic_number > 0);

    let parameters = RunParameters::from_config(&config);
    let recorded = dir.path().join("run_parameters.txt");
    parameters.write(&recorded).unwrap();
    assert_eq!(RunParameters::read(&recorded).unwrap(), parameters);
}

#[test]
fn test_missing_input_file() {
    let dir = TempDir::new().unwrap();
    assert!(parse_input(&dir.path().join("absent.inp")).is_err());
}
