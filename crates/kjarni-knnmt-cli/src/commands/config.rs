//! Resolve and print a knn configuration

use anyhow::Result;
use kjarni_knnmt::{KnnArgs, KnnConfig};

pub fn run(args: &KnnArgs, validate: bool) -> Result<()> {
    let config = resolve(args, validate)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// flags > config file > defaults, optionally checked for the configured mode.
pub fn resolve(args: &KnnArgs, validate: bool) -> Result<KnnConfig> {
    let config = args.resolve()?;
    if validate {
        let mode = config.validate()?;
        log::info!("Configuration is valid for mode {}", mode);
    }
    Ok(config)
}
