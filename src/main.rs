use clap::{Parser, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;

use fault_injector::prelude::*;

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "v0.1.0");

/// Command line parameter structure
///
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the target executable
    target: PathBuf,

    /// Arguments passed to the target
    #[arg(trailing_var_arg = true)]
    target_args: Vec<String>,

    /// Moment of injection
    #[arg(short, long, value_enum, default_value = "wall-time")]
    trigger: TriggerKind,

    /// Lower bound of the instruction-count window
    #[arg(long, default_value_t = 10_000)]
    min_instructions: u64,

    /// Upper bound (exclusive) of the instruction-count window
    #[arg(long, default_value_t = 60_000)]
    max_instructions: u64,

    /// Lower bound of the wall-time window, in microseconds
    #[arg(long, default_value_t = 10_000)]
    min_delay: u64,

    /// Upper bound (exclusive) of the wall-time window, in microseconds
    #[arg(long, default_value_t = 100_000)]
    max_delay: u64,

    /// Number of register slots eligible for corruption, counted from slot 0
    #[arg(short, long, default_value_t = 8)]
    registers: usize,

    /// Fixed RNG seed for a reproducible trial (default: time ^ pid)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Emit a machine-readable record (one line per field) instead of the summary
    #[arg(long, default_value_t = false)]
    machine: bool,
}

/// Injection strategies selectable from the command line
#[derive(ValueEnum, Clone, Copy, Debug)]
enum TriggerKind {
    /// Single-step a random number of instructions, then inject
    InstructionCount,
    /// Run freely for a random duration, stop asynchronously, then inject
    WallTime,
    /// Inject at the first stop, before the target's own code runs
    Immediate,
}

/// Program to inject single-bit register faults into a traced target process
///
fn main() -> Result<(), String> {
    let args = Args::parse();
    env_logger::init(); // Switch on with: RUST_LOG=debug cargo run

    if !args.machine {
        println!("--- Fault injection controller: {GIT_VERSION} ---\n");
    }

    let trigger = match args.trigger {
        TriggerKind::InstructionCount => {
            if args.min_instructions >= args.max_instructions {
                return Err("instruction window is empty (min >= max)".to_string());
            }
            TriggerConfig::InstructionCount {
                range: args.min_instructions..args.max_instructions,
            }
        }
        TriggerKind::WallTime => {
            if args.min_delay >= args.max_delay {
                return Err("delay window is empty (min >= max)".to_string());
            }
            TriggerConfig::WallTime {
                range_us: args.min_delay..args.max_delay,
            }
        }
        TriggerKind::Immediate => TriggerConfig::Immediate,
    };
    if args.registers == 0 || args.registers > REGISTER_FILE {
        return Err(format!(
            "register subset must be within 1..={REGISTER_FILE}"
        ));
    }

    let controller = Controller::new(TrialConfig {
        target: args.target.clone(),
        args: args.target_args,
        trigger,
        register_subset: args.registers,
        seed: args.seed,
    });

    let result = controller.run_trial().map_err(|error| error.to_string())?;

    if args.machine {
        print!("{}", result.machine_record());
        return Ok(());
    }

    println!("Target: {}", args.target.display());
    println!("Seed:   {}", result.seed);
    match &result.fault {
        Some(fault) => println!("Fault:  {}", format!("{fault}").red()),
        None => println!("Fault:  {}", "none (trigger did not fire)".yellow()),
    }
    let disposition = match result.disposition {
        Disposition::Exited(0) => "clean exit (code 0)".green(),
        Disposition::Exited(code) => format!("exit code {code}").yellow(),
        Disposition::Signaled(signal) => format!("terminated by {signal}").red(),
        Disposition::Inconclusive => "inconclusive".red(),
    };
    println!("Result: {disposition}");
    if let Some(error) = &result.error {
        println!("{} {error}", "Trial error:".red());
    }

    Ok(())
}
