use anyhow::Result;
use clap::Parser;

use kjarni_knnmt_cli::commands;
use kjarni_knnmt_cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    match cli.command {
        Commands::Info { path, format } => commands::info::run(&path, &format),

        Commands::Search {
            path,
            query,
            top_k,
            subset_path,
            format,
        } => commands::search::run(&path, &query, top_k, subset_path.as_deref(), &format),

        Commands::Config { knn, validate } => commands::config::run(&knn, validate),
    }
}
