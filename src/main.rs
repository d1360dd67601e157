use clap::{Parser, Subcommand};

use log::error;

mod show;

#[derive(Subcommand)]
enum Command {
    /// Print the flash descriptor region map
    Ifd {
        /// Path to the flash image
        file: String,
    },
    /// Print the AMD PSP firmware structures as JSON
    Amd {
        /// Path to the flash image
        file: String,
    },
    /// Print an Intel microcode update summary
    Ucode {
        /// Path to the microcode blob
        file: String,
    },
}

/// Inspect the metadata embedded in x86 platform firmware images
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Print decoded descriptor details in addition to the region map
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    // Show info-level progress unless RUST_LOG overrides it; the library
    // reports skipped directories and fallback scans at that level.
    let filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(filter).init();

    let cli = Cli::parse();
    let res = match cli.command {
        Command::Ifd { file } => show::ifd(&file, cli.verbose),
        Command::Amd { file } => show::amd(&file),
        Command::Ucode { file } => show::ucode(&file),
    };
    if let Err(e) = res {
        error!("{e}");
        std::process::exit(1);
    }
}
