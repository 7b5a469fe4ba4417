use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "romstatsd", version, about = "Opt-in anonymous usage reporting agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the reporting daemon until interrupted
    Run,
    /// Force one checkin cycle now, ignoring the cadence
    Once,
    /// Show consent state and checkin bookkeeping
    Status,
    /// Allow anonymous reporting
    OptIn,
    /// Disallow anonymous reporting
    OptOut,
}
