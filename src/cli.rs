use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "pipeline",
    about = "Template-based incremental build tool for computational projects",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect the project without building it
    Collect {
        /// Print the resolved project configuration
        #[arg(long)]
        configuration: bool,

        /// Print the processed task records
        #[arg(long)]
        tasks: bool,

        /// Print the known template names
        #[arg(long)]
        templates: bool,
    },

    /// Build the project
    Build {
        /// Number of parallel jobs
        #[arg(short = 'n', long)]
        n_jobs: Option<usize>,

        /// Schedule tasks by priority
        #[arg(long, default_value_t = false)]
        priority: bool,

        /// Re-run a failing Python task under the debugger (implies one job)
        #[arg(long, default_value_t = false)]
        debug: bool,
    },

    /// Delete the build directory
    Clean,
}
