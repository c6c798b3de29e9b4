//! Command-line flags shared by both binaries.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Path to the TOML config file. Missing file is an error; a present but
    /// empty file is valid and uses all compiled-in defaults.
    #[arg(long, short = 'c', env = "IL_CONFIG", default_value = "/etc/infoLogger.cfg")]
    pub config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn tracing_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
