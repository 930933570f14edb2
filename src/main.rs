#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod config;
mod directory;
mod filecache;
mod history;
mod listener;
mod logging;
mod render;
mod slack;

use crate::cli::{Cli, Commands, FilesCommand};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Listen {
            workspace,
            no_files,
        } => {
            let config = load(&workspace)?;
            listener::run(config, &workspace, no_files).await
        }
        Commands::History {
            workspace,
            channel,
            days,
        } => {
            let config = load(&workspace)?;
            history::run(config, &channel, days).await
        }
        Commands::Post {
            workspace,
            channel,
            message,
            file,
            thread,
            stdin,
            code,
        } => {
            let config = load(&workspace)?;
            let args = commands::PostArgs {
                message,
                file,
                thread,
                stdin,
                code,
            };
            commands::post(config, &channel, args).await
        }
        Commands::Channels { workspace, kind } => {
            let config = load(&workspace)?;
            commands::channels(config, kind).await
        }
        Commands::Users { workspace } => {
            let config = load(&workspace)?;
            commands::users(config).await
        }
        Commands::Files { workspace, command } => {
            // Loaded for validation and logging setup only; the cache
            // commands themselves need no tokens.
            let _config = load(&workspace)?;
            match command {
                FilesCommand::List => commands::files_list(&workspace).await,
            }
        }
    }
}

fn load(workspace: &str) -> Result<Arc<Config>> {
    let config = Config::load(workspace)?;
    logging::init_tracing(&config.logging.severity);
    Ok(Arc::new(config))
}
