use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};
use commands::utils::{init_logging, load_engine_config};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let Args {
        command,
        config,
        state,
        verbose,
    } = Args::parse();

    init_logging(verbose);

    match command {
        Commands::Init {
            admin_password,
            force,
        } => commands::setup::init(config, state, admin_password, force),
        Commands::Run {
            profile,
            block_sites,
            block_apps,
        } => commands::run::run(
            load_engine_config(config, state)?,
            profile,
            block_sites,
            block_apps,
        ),
        Commands::Site { command } => {
            commands::policy::site(&load_engine_config(config, state)?, command)
        }
        Commands::App { command } => {
            commands::policy::app(&load_engine_config(config, state)?, command)
        }
        Commands::Internet { access } => {
            commands::policy::internet(&load_engine_config(config, state)?, access)
        }
        Commands::Profile { command } => {
            commands::profile::profile(&load_engine_config(config, state)?, command)
        }
        Commands::Admin { command } => {
            commands::profile::admin(&load_engine_config(config, state)?, command)
        }
        Commands::Status => commands::status::show(&load_engine_config(config, state)?),
    }
}
