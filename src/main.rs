//! oplmidi - Renders a MIDI file through the OPL3 voice allocator.
//!
//! The program plays a Standard MIDI File through one or more emulated
//! OPL3 chips and writes the resulting chip register activity to a text
//! log, one line per reset, register write or panning change.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- song.mid                       # built-in bank, 2 chips
//! cargo run -- song.mid --chips 4 -p -o song.log
//! cargo run -- song.mid --bank-file banks/demo.json --bank 1
//! ```

use anyhow::{Context, Result};
use oplmidi::config::EngineConfig;
use oplmidi::opl::topology::MELODIC_CHANNELS_PER_CHIP;
use oplmidi::{export_register_log, import_events, BankSet, EmulatorKind};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// Melodic channels per chip left over once five go to the percussion
/// section.
const MELODIC_CHANNELS_WITH_PERCUSSION: usize = 15;

/// Percussion channels per chip in percussion mode.
const PERCUSSION_CHANNELS_PER_CHIP: usize = 5;

/// Operators on one chip.
const OPERATORS_PER_CHIP: usize = 36;

/// Command-line options for the application.
struct CliOptions {
    /// MIDI file to play.
    midi_file: PathBuf,
    /// Where to write the register log.
    output: Option<PathBuf>,
    /// JSON engine configuration used as the starting point.
    config: Option<PathBuf>,
    /// JSON bank set replacing the built-in one.
    bank_file: Option<PathBuf>,
    bank: Option<usize>,
    chips: Option<usize>,
    four_ops: Option<usize>,
    emulator: Option<EmulatorKind>,
    percussion_mode: bool,
    high_tremolo: bool,
    high_vibrato: bool,
    scale_modulators: bool,
    no_full_pan: bool,
    allow_bank_switch: bool,
}

/// Prints an error with a pointer to `--help` and exits.
fn usage_error(message: &str) -> ! {
    eprintln!("Error: {}", message);
    eprintln!("Use --help for usage information");
    std::process::exit(1);
}

/// Returns the value following option `name`.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> &'a str {
    *i += 1;
    match args.get(*i) {
        Some(value) => value,
        None => usage_error(&format!("{} requires an argument", name)),
    }
}

/// Parses the value following option `name` as a number.
fn numeric_value(args: &[String], i: &mut usize, name: &str) -> usize {
    let value = option_value(args, i, name);
    value
        .parse()
        .unwrap_or_else(|_| usage_error(&format!("{} expects a number, got '{}'", name, value)))
}

fn print_help(program: &str) {
    eprintln!("oplmidi - MIDI to OPL3 FM renderer");
    eprintln!();
    eprintln!("Usage: {} <MIDI-FILE> [OPTIONS]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -o, --output PATH      Register log to write (default: <MIDI-FILE>.oplreg)");
    eprintln!("      --config PATH      Load engine settings from a JSON file");
    eprintln!("      --bank-file PATH   Load instrument banks from a JSON file");
    eprintln!("      --bank N           Select instrument bank N");
    eprintln!("      --chips N          Number of emulated OPL3 chips (1-100)");
    eprintln!("      --four-ops N       Number of four-operator channels (0-6 per chip)");
    eprintln!("  -p                     Enable adlib percussion instrument mode");
    eprintln!("  -t                     Enable tremolo amplification mode");
    eprintln!("  -v                     Enable vibrato amplification mode");
    eprintln!("  -s                     Enable scaling of modulator volumes");
    eprintln!("      --emu NAME         OPL emulator (dbopl, dboplv2, vintage, ym3812, ymf262)");
    eprintln!("      --no-full-pan      Disable smooth stereo panning");
    eprintln!("  -bs                    Allow bank switch (Bank LSB changes bank)");
    eprintln!("  -h, --help             Print this help message");
    eprintln!();
    eprintln!("When --four-ops is not given, a count suited to the bank is chosen.");
}

impl CliOptions {
    /// Parses command-line arguments.
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let program = args.first().map_or("oplmidi", String::as_str).to_string();
        let mut options = Self {
            midi_file: PathBuf::new(),
            output: None,
            config: None,
            bank_file: None,
            bank: None,
            chips: None,
            four_ops: None,
            emulator: None,
            percussion_mode: false,
            high_tremolo: false,
            high_vibrato: false,
            scale_modulators: false,
            no_full_pan: false,
            allow_bank_switch: false,
        };
        let mut midi_file: Option<PathBuf> = None;
        let mut i = 1;

        while i < args.len() {
            match args[i].as_str() {
                "--output" | "-o" => {
                    options.output = Some(PathBuf::from(option_value(&args, &mut i, "--output")))
                }
                "--config" => {
                    options.config = Some(PathBuf::from(option_value(&args, &mut i, "--config")))
                }
                "--bank-file" => {
                    options.bank_file =
                        Some(PathBuf::from(option_value(&args, &mut i, "--bank-file")))
                }
                "--bank" => options.bank = Some(numeric_value(&args, &mut i, "--bank")),
                "--chips" => options.chips = Some(numeric_value(&args, &mut i, "--chips")),
                "--four-ops" => {
                    options.four_ops = Some(numeric_value(&args, &mut i, "--four-ops"))
                }
                "--emu" => {
                    let name = option_value(&args, &mut i, "--emu");
                    match name.parse() {
                        Ok(kind) => options.emulator = Some(kind),
                        Err(e) => usage_error(&format!("{}", e)),
                    }
                }
                "-p" => options.percussion_mode = true,
                "-t" => options.high_tremolo = true,
                "-v" => options.high_vibrato = true,
                "-s" => options.scale_modulators = true,
                "--no-full-pan" => options.no_full_pan = true,
                "-bs" => options.allow_bank_switch = true,
                "--help" | "-h" => {
                    print_help(&program);
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    usage_error(&format!("Unknown option: {}", other))
                }
                other => {
                    if midi_file.is_some() {
                        usage_error(&format!("Unexpected argument: {}", other));
                    }
                    midi_file = Some(PathBuf::from(other));
                }
            }
            i += 1;
        }

        match midi_file {
            Some(path) => options.midi_file = path,
            None => {
                print_help(&program);
                std::process::exit(1);
            }
        }
        Ok(options)
    }

    /// Builds the engine configuration: the config file (or defaults) with
    /// command-line flags applied on top.
    fn engine_config(&self, banks: &BankSet) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(bank) = self.bank {
            config.bank = bank;
        }
        if let Some(chips) = self.chips {
            config.num_chips = chips;
        }
        if let Some(emulator) = self.emulator {
            config.emulator = emulator;
        }
        config.percussion_mode |= self.percussion_mode;
        config.high_tremolo |= self.high_tremolo;
        config.high_vibrato |= self.high_vibrato;
        config.scale_modulators |= self.scale_modulators;
        config.allow_bank_switch |= self.allow_bank_switch;
        if self.no_full_pan {
            config.full_pan = false;
        }
        match self.four_ops {
            Some(four_ops) => config.num_four_ops = four_ops,
            None if self.config.is_none() && config.bank < banks.len() => {
                config.num_four_ops = config.suggested_four_ops(banks);
            }
            None => {}
        }
        Ok(config)
    }

    fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.midi_file.with_extension("oplreg"))
    }
}

/// Prints the bank and channel layout summary.
fn print_setup(config: &EngineConfig, banks: &BankSet) {
    println!(
        "FM instrument bank {} '{}' selected.",
        config.bank,
        banks.bank_name(config.bank).unwrap_or("?")
    );
    let census = banks.four_op_census(config.bank);
    println!(
        "This bank has {}/{} four-op melodic instruments and {}/{} percussive ones.",
        census.melodic_four_op,
        census.melodic_total,
        census.percussion_four_op,
        census.percussion_total
    );

    let melodic = if config.percussion_mode {
        MELODIC_CHANNELS_WITH_PERCUSSION
    } else {
        MELODIC_CHANNELS_PER_CHIP
    };
    print!(
        "Simulating {} OPL3 chips for a total of {} operators.\n\
         Setting up the operators as {} four-op channels, {} dual-op channels",
        config.num_chips,
        config.num_chips * OPERATORS_PER_CHIP,
        config.num_four_ops,
        (melodic * config.num_chips).saturating_sub(config.num_four_ops * 2)
    );
    if config.percussion_mode {
        print!(
            ", {} percussion channels",
            config.num_chips * PERCUSSION_CHANNELS_PER_CHIP
        );
    }
    println!();
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let banks = match &cli.bank_file {
        Some(path) => BankSet::from_json_file(path)
            .with_context(|| format!("Failed to load bank file: {}", path.display()))?,
        None => BankSet::builtin().context("Failed to load built-in bank")?,
    };

    let config = cli.engine_config(&banks)?;
    config
        .validate(&banks)
        .context("Invalid engine configuration")?;
    print_setup(&config, &banks);

    let events = import_events(&cli.midi_file)
        .with_context(|| format!("Failed to import MIDI file: {}", cli.midi_file.display()))?;
    tracing::debug!(events = events.len(), "MIDI file loaded");

    let output = cli.output_path();
    let written = export_register_log(
        &events,
        config,
        Arc::new(banks),
        &output,
        Some(|progress: f32| {
            eprint!("\rRendering... {:>3}%", (progress * 100.0) as u32);
            let _ = std::io::stderr().flush();
        }),
    )?;
    eprintln!();
    println!("Wrote {} chip events to {}", written, output.display());

    Ok(())
}
