//! openhole command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Create a run-input template
//! openhole ci neon.inp
//!
//! # Create a settings template in the current directory
//! openhole ci openhole_config.cfg
//!
//! # Run (or resume) a calculation
//! openhole neon.inp
//!
//! # Show where an interrupted calculation would resume
//! openhole status neon.inp
//! ```
//!
//! The calculation tree is created next to the input file, in a directory
//! named after the run label.

use openhole::naming::FileNaming;
use openhole::parser;
use openhole::pipeline::{self, RunContext};
use openhole::settings::{SettingsManager, SETTINGS_FILE};
use std::env;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::process;
use std::str::FromStr;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        process::exit(1);
    }
    if args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(0);
    }

    let command = &args[1];
    match command.as_str() {
        "ci" => {
            if args.len() < 3 {
                eprintln!("Error: Missing file argument");
                eprintln!("Usage:");
                eprintln!("  {} ci <name>.inp            - Create run-input template", args[0]);
                eprintln!("  {} ci {}  - Create settings template", args[0], SETTINGS_FILE);
                process::exit(1);
            }
            init_console_logger(log::LevelFilter::Info);
            match run_create_template(Path::new(&args[2])) {
                Ok(()) => {
                    println!("✓ Template created successfully!");
                    println!("  Output file: {}", args[2]);
                }
                Err(e) => {
                    eprintln!("Error creating template: {}", e);
                    process::exit(1);
                }
            }
        }
        "status" => {
            if args.len() < 3 {
                eprintln!("Error: Missing input file");
                eprintln!("Usage: {} status <run.inp>", args[0]);
                process::exit(1);
            }
            init_console_logger(log::LevelFilter::Warn);
            match run_status(Path::new(&args[2])) {
                Ok(()) => {}
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(1);
                }
            }
        }
        _ => {
            if command.starts_with('-') {
                eprintln!("Error: Unknown command: {}", command);
                print_usage(&args[0]);
                process::exit(1);
            }
            match run_calculation(Path::new(command)) {
                Ok(()) => println!("\n****Calculation finished****"),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(1);
                }
            }
        }
    }
}

fn print_usage(program_name: &str) {
    eprintln!("openhole - resumable hole-state and transition-rate calculations");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  {} <run.inp>", program_name);
    eprintln!("                    Run or resume the calculation described by the input");
    eprintln!();
    eprintln!("  {} status <run.inp>", program_name);
    eprintln!("                    Print the resume decision without running anything");
    eprintln!();
    eprintln!("  {} ci <name>.inp", program_name);
    eprintln!("                    Create a template run-input file");
    eprintln!();
    eprintln!("  {} ci {}", program_name, SETTINGS_FILE);
    eprintln!("                    Create a settings template file");
}

fn init_console_logger(level: log::LevelFilter) {
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .target(env_logger::Target::Stdout)
        .format_timestamp_millis()
        .init();
}

/// Writes every log record to stdout and to the run log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        self.file.flush()
    }
}

fn run_create_template(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        return Err(format!(
            "{} already exists. Please remove it first or choose a different name.",
            path.display()
        )
        .into());
    }
    if path.file_name().and_then(|n| n.to_str()) == Some(SETTINGS_FILE) {
        SettingsManager::create_template(path)?;
    } else {
        parser::create_input_template(path)?;
    }
    Ok(())
}

fn input_parent(input_path: &Path) -> &Path {
    input_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn run_status(input_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = parser::parse_input(input_path)?;
    let label = config.label.clone();
    let decision = pipeline::status(config, input_parent(input_path))?;
    println!("Calculation '{}': {}", label, decision);
    Ok(())
}

fn run_calculation(input_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = parser::parse_input(input_path)?;
    let manager = SettingsManager::load()?;
    let settings = manager.settings().clone();
    let parent = input_parent(input_path);

    let level = log::LevelFilter::from_str(&settings.logging.level).unwrap_or(log::LevelFilter::Info);
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(level).format_timestamp_millis();
    let log_file = if settings.logging.file_logging {
        let naming = FileNaming::new(parent, &config.label);
        std::fs::create_dir_all(naming.root())?;
        let path = naming.log_file();
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
        Some(path)
    } else {
        builder.target(env_logger::Target::Stdout);
        None
    };
    builder.init();

    println!("****openhole: hole states and transition rates****");
    println!("            Version {}", env!("CARGO_PKG_VERSION"));
    println!("Settings: {}", manager.config_source());
    if let Some(path) = &log_file {
        println!("Log file: {}", path.display());
    }

    let context = RunContext::prepare(config, settings, parent)?;
    let summary = context.run()?;

    println!("\n****Summary for {} (Z = {})****", summary.label, summary.atomic_number);
    for shell in &summary.yields {
        println!(
            "  {:<10} {:<12} fluorescence yield {:.6}",
            shell.family.to_string(),
            shell.shell_label,
            shell.fluorescence_yield
        );
    }
    for spectrum in &summary.spectra {
        println!("  {:<16} {} line(s)", spectrum.class.to_string(), spectrum.lines.len());
    }
    println!("Results: {}", context.naming().results_dir().display());
    Ok(())
}
