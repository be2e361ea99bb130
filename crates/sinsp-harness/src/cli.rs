use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "plugin-harness")]
#[command(about = "Load a sinsp plugin library and drive it like the host engine would", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to run config file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Open a session on a source plugin and extract every field of every event
    Run {
        /// Source plugin library (.so/.dylib)
        #[arg(long)]
        library: PathBuf,
        /// Extra extractor plugin library; may be repeated
        #[arg(long = "extractor")]
        extractors: Vec<PathBuf>,
        /// Stop after this many events (overrides config)
        #[arg(long)]
        max_events: Option<u64>,
        /// Config string for the source's plugin_init (overrides config)
        #[arg(long)]
        init_config: Option<String>,
        /// Params string for plugin_open (overrides config)
        #[arg(long)]
        open_params: Option<String>,
        /// Use plugin_extract_str/u64 instead of the async extractor
        #[arg(long)]
        sync: bool,
        /// Also print each event rendered by plugin_event_to_string
        #[arg(long)]
        print_events: bool,
    },
    /// Print a plugin library's identity and declared fields as JSON
    Inspect {
        /// Plugin library (.so/.dylib)
        #[arg(long)]
        library: PathBuf,
    },
}
