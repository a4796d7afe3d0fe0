mod cli;
mod config_gen;
mod dispatch;
mod format;
mod table;

use clap::Parser;

use manifold_core::config::{self, ALL_SERVICES};

use cli::{Cli, Commands};
use config_gen::run_config_generate;
use dispatch::dispatch_command;

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle `config` early — no config file needed
    if let Commands::Config { dest } = &cli.command {
        if let Err(e) = run_config_generate(dest.as_deref()) {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        return;
    }

    // Resolve config file
    let source = match config::resolve_config_path(cli.config.as_deref()) {
        Some(s) => s,
        None => {
            eprintln!("Error: no configuration file found.");
            eprintln!("Searched:");
            for (path, level) in config::default_config_search_paths() {
                eprintln!("  {} ({})", path.display(), level);
            }
            eprintln!();
            eprintln!("Run `manifold config` to generate a starter config file.");
            std::process::exit(1);
        }
    };

    tracing::info!("Using config: {source}");

    let loaded = match config::load_config(source.path()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let orchestrator = match config::build_orchestrator(&loaded) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    // Validate --service before running anything
    let service = match cli.command.service() {
        Some(s) if s == ALL_SERVICES => None,
        Some(s) => {
            if !orchestrator.nicknames().contains(&s) {
                eprintln!("Error: no service named '{s}'");
                eprintln!("Configured services:");
                for nickname in orchestrator.nicknames() {
                    eprintln!("  {nickname}");
                }
                std::process::exit(1);
            }
            Some(s)
        }
        None => None,
    };

    if let Err(e) = dispatch_command(&cli.command, &orchestrator, service) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
