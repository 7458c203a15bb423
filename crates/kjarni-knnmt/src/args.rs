//! Command-line flags for kNN decoding, meant to be flattened into a host CLI.

use std::path::PathBuf;

use clap::Args;

use crate::config::{KeyType, KnnConfig, KnnMode};
use crate::config_loader::load_knn_config;
use crate::error::KnnResult;

/// kNN decoding flags. Every field is optional so that unset flags fall back
/// to the configuration file and then to the defaults.
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct KnnArgs {
    /// Configuration file (default: ./knnmt.toml, then ~/.config/kjarni/knnmt.toml)
    #[arg(long)]
    pub knn_config: Option<PathBuf>,

    /// Mode: build_datastore, inference, ensemble_inference
    #[arg(long)]
    pub knn_mode: Option<String>,

    /// Datastore directory (parent source in ensemble inference)
    #[arg(long)]
    pub knn_datastore_path: Option<PathBuf>,

    /// Number of neighbours to retrieve [default: 8]
    #[arg(long)]
    pub knn_k: Option<usize>,

    /// Weight of the retrieval distribution [default: 0.25]
    #[arg(long)]
    pub knn_lambda: Option<f32>,

    /// Softmax temperature over neighbour distances [default: 10]
    #[arg(long)]
    pub knn_temperature: Option<f32>,

    /// Hidden state to store and query: decoder_output, last_ffn_input
    #[arg(long)]
    pub knn_keytype: Option<String>,

    /// File of datastore entry ids to restrict the index to
    #[arg(long)]
    pub subset_path: Option<PathBuf>,

    /// Child datastore for ensemble inference
    #[arg(long)]
    pub knn_child_datastore_path: Option<PathBuf>,

    /// Synonym datastore for ensemble inference
    #[arg(long)]
    pub knn_syn_datastore_path: Option<PathBuf>,

    /// Per-source weights (parent,child,synonym) [default: 0.2,0.05,0.05]
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub lambda_list: Option<Vec<f32>>,

    /// Per-source neighbour counts [default: 12,12,12]
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub knn_k_list: Option<Vec<usize>>,

    /// Per-source temperatures [default: 10,10,10]
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub knn_temperature_list: Option<Vec<f32>>,
}

impl KnnArgs {
    /// Resolve the final configuration: flags > config file > defaults.
    pub fn resolve(&self) -> KnnResult<KnnConfig> {
        let base = load_knn_config(self.knn_config.as_deref())?;
        self.apply_to(base)
    }

    /// Overlay the flags that were given on top of `config`.
    pub fn apply_to(&self, mut config: KnnConfig) -> KnnResult<KnnConfig> {
        if let Some(mode) = &self.knn_mode {
            config.mode = Some(mode.parse::<KnnMode>()?);
        }
        if let Some(key_type) = &self.knn_keytype {
            config.key_type = key_type.parse::<KeyType>()?;
        }
        if let Some(path) = &self.knn_datastore_path {
            config.datastore_path = Some(path.clone());
        }
        if let Some(path) = &self.subset_path {
            config.subset_path = Some(path.clone());
        }
        if let Some(path) = &self.knn_child_datastore_path {
            config.child_datastore_path = Some(path.clone());
        }
        if let Some(path) = &self.knn_syn_datastore_path {
            config.syn_datastore_path = Some(path.clone());
        }
        if let Some(k) = self.knn_k {
            config.k = k;
        }
        if let Some(lambda) = self.knn_lambda {
            config.lambda = lambda;
        }
        if let Some(temperature) = self.knn_temperature {
            config.temperature = temperature;
        }
        if let Some(list) = &self.lambda_list {
            config.lambda_list = list.clone();
        }
        if let Some(list) = &self.knn_k_list {
            config.k_list = list.clone();
        }
        if let Some(list) = &self.knn_temperature_list {
            config.temperature_list = list.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KnnError;
    use clap::Parser;
    use tempfile::TempDir;

    #[derive(Parser)]
    struct Host {
        #[command(flatten)]
        knn: KnnArgs,
    }

    fn parse(args: &[&str]) -> KnnArgs {
        Host::parse_from(std::iter::once("host").chain(args.iter().copied())).knn
    }

    #[test]
    fn test_flag_names() {
        let args = parse(&[
            "--knn-mode",
            "ensemble_inference",
            "--knn-datastore-path",
            "/data/parent",
            "--knn-child-datastore-path",
            "/data/child",
            "--knn-syn-datastore-path",
            "/data/syn",
            "--subset-path",
            "/data/subset.json",
            "--knn-keytype",
            "last_ffn_input",
            "--lambda-list",
            "0.3,0.1,0.1",
            "--knn-k-list",
            "4,6,8",
            "--knn-temperature-list",
            "1,2,3",
        ]);
        let config = args.apply_to(KnnConfig::default()).unwrap();
        assert_eq!(config.mode, Some(KnnMode::EnsembleInference));
        assert_eq!(config.key_type, KeyType::LastFfnInput);
        assert_eq!(config.lambda_list, vec![0.3, 0.1, 0.1]);
        assert_eq!(config.k_list, vec![4, 6, 8]);
        assert_eq!(config.temperature_list, vec![1.0, 2.0, 3.0]);
        assert_eq!(config.syn_datastore_path, Some(PathBuf::from("/data/syn")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_mode_flag() {
        let args = parse(&["--knn-mode", "retrieve"]);
        assert!(matches!(
            args.apply_to(KnnConfig::default()),
            Err(KnnError::Configuration(_))
        ));
    }

    #[test]
    fn test_flags_override_file_override_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("knnmt.toml");
        std::fs::write(
            &path,
            "mode = \"inference\"\ndatastore-path = \"/data/file\"\nk = 16\nlambda = 0.4\n",
        )
        .unwrap();

        let mut args = parse(&["--knn-k", "32"]);
        args.knn_config = Some(path);
        let config = args.resolve().unwrap();

        assert_eq!(config.k, 32);
        assert_eq!(config.lambda, 0.4);
        assert_eq!(config.temperature, 10.0);
        assert_eq!(config.datastore_path, Some(PathBuf::from("/data/file")));
        assert_eq!(config.mode, Some(KnnMode::Inference));
    }
}
