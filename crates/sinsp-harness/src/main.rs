use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use sinsp_harness::cli::{Cli, Commands};
use sinsp_harness::config::{self, ExtractorConfig};
use sinsp_harness::loader::PluginLibrary;
use sinsp_harness::runner::{self, ExtractorLibrary};

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries results only
    sinsp_bridge::init_logging();

    let cli = Cli::parse();
    let mut config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            library,
            extractors,
            max_events,
            init_config,
            open_params,
            sync,
            print_events,
        } => {
            if let Some(max) = max_events {
                config.run.max_events = max;
            }
            if let Some(init_config) = init_config {
                config.source.init_config = init_config;
            }
            if let Some(params) = open_params {
                config.source.open_params = params;
            }
            if sync {
                config.run.async_extraction = false;
            }
            config.run.print_events |= print_events;
            config
                .extractors
                .extend(extractors.into_iter().map(|library: PathBuf| ExtractorConfig {
                    library,
                    init_config: String::new(),
                }));

            let source = PluginLibrary::load(&library)?;
            let extra = config
                .extractors
                .iter()
                .map(|x| PluginLibrary::load(&x.library))
                .collect::<Result<Vec<_>>>()?;
            let extra_specs: Vec<ExtractorLibrary<'_>> = extra
                .iter()
                .zip(&config.extractors)
                .map(|(lib, x)| ExtractorLibrary {
                    api: lib.api(),
                    init_config: &x.init_config,
                })
                .collect();

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let summary = runner::run(source.api(), &extra_specs, &config, &mut out)?;
            out.flush()?;
            eprintln!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Inspect { library } => {
            let lib = PluginLibrary::load(&library)?;
            let info = lib.api().describe()?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}
