use clap::{Parser, Subcommand};
use cowfork::emulated::MachineConfig;
use log::LevelFilter;

mod console;
mod scenarios;

use console::Console;

#[derive(Parser)]
#[command(name = "cowsim")]
#[command(about = "Runs copy-on-write fork scenarios on an emulated Polaris microkernel")]
struct Args {
    /// Frames available to the machine
    #[arg(long, default_value_t = MachineConfig::default().frames)]
    frames: usize,

    /// Processes that can exist at once
    #[arg(long, default_value_t = MachineConfig::default().processes)]
    processes: usize,

    /// Log more (-v for debug, -vv for every kernel call)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parent and child write the same page and must not see each other's data
    Isolation,
    /// Fork repeatedly from the newest child and check every generation's data
    Chain {
        /// Number of forks to chain
        #[arg(short, long, default_value_t = 3)]
        generations: usize,
    },
    /// Report frame usage across a fork, partial writes and child exit
    Census {
        /// Writable pages in the parent
        #[arg(short, long, default_value_t = 16)]
        pages: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    Console::init(match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });

    let config = MachineConfig {
        frames: args.frames,
        processes: args.processes,
    };
    log::info!(
        "machine has {} frames and room for {} processes",
        config.frames,
        config.processes
    );

    match args.command {
        Command::Isolation => scenarios::isolation(config)?,
        Command::Chain { generations } => scenarios::chain(config, generations)?,
        Command::Census { pages } => scenarios::census(config, pages)?,
    }

    log::info!("scenario passed");
    Ok(())
}
