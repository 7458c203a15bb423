use std::path::{Path, PathBuf};

use crate::config::KnnConfig;
use crate::error::{KnnError, KnnResult};

pub const CONFIG_FILE_NAME: &str = "knnmt.toml";

/// Places searched for a configuration file, highest priority first:
/// ./knnmt.toml, then ~/.config/kjarni/knnmt.toml.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(".").join(CONFIG_FILE_NAME)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("kjarni").join(CONFIG_FILE_NAME));
    }
    paths
}

/// Load configuration with standard priority:
/// explicit file > ./knnmt.toml > ~/.config/kjarni/knnmt.toml > defaults
pub fn load_knn_config(explicit: Option<&Path>) -> KnnResult<KnnConfig> {
    if let Some(path) = explicit {
        return load_config_from_path(path);
    }
    load_first_existing(&config_search_paths())
}

/// Load the first configuration file that exists, or defaults.
pub fn load_first_existing(candidates: &[PathBuf]) -> KnnResult<KnnConfig> {
    for path in candidates {
        if let Some(config) = try_load_from_path(path)? {
            return Ok(config);
        }
    }
    Ok(KnnConfig::default())
}

/// Load from specific path.
pub fn load_config_from_path(path: &Path) -> KnnResult<KnnConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        KnnError::Configuration(format!("cannot read config file {:?}: {}", path, e))
    })?;
    let config: KnnConfig = toml::from_str(&contents).map_err(|e| {
        KnnError::Configuration(format!("invalid config file {:?}: {}", path, e))
    })?;
    log::debug!("Loaded knn configuration from {:?}", path);
    Ok(config)
}

fn try_load_from_path(path: &Path) -> KnnResult<Option<KnnConfig>> {
    if path.exists() {
        Ok(Some(load_config_from_path(path)?))
    } else {
        Ok(None)
    }
}
