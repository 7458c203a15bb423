//! kNN decoding configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KnnError, KnnResult};

/// Weight sums above one by less than this are accepted.
const WEIGHT_TOLERANCE: f32 = 1e-5;

/// How the decoder uses its datastore(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnnMode {
    /// Persist hidden states and their target tokens.
    BuildDatastore,
    /// Retrieve from one datastore and blend with the base distribution.
    Inference,
    /// Retrieve from up to three datastores and blend all of them.
    EnsembleInference,
}

impl KnnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnnMode::BuildDatastore => "build_datastore",
            KnnMode::Inference => "inference",
            KnnMode::EnsembleInference => "ensemble_inference",
        }
    }
}

impl fmt::Display for KnnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KnnMode {
    type Err = KnnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build_datastore" => Ok(KnnMode::BuildDatastore),
            "inference" => Ok(KnnMode::Inference),
            "ensemble_inference" => Ok(KnnMode::EnsembleInference),
            other => Err(KnnError::Configuration(format!(
                "unknown knn mode '{}', expected build_datastore, inference or ensemble_inference",
                other
            ))),
        }
    }
}

/// Which hidden-state tensor is stored and queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Final decoder hidden state, before the output projection.
    #[default]
    DecoderOutput,
    /// Input of the last feed-forward block.
    LastFfnInput,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::DecoderOutput => "decoder_output",
            KeyType::LastFfnInput => "last_ffn_input",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = KnnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decoder_output" => Ok(KeyType::DecoderOutput),
            "last_ffn_input" => Ok(KeyType::LastFfnInput),
            other => Err(KnnError::Configuration(format!(
                "unknown knn key type '{}', expected decoder_output or last_ffn_input",
                other
            ))),
        }
    }
}

/// A retrieval source in ensemble inference. The discriminant indexes the
/// per-source lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceSlot {
    Parent = 0,
    Child = 1,
    Synonym = 2,
}

impl SourceSlot {
    pub const ALL: [SourceSlot; 3] = [SourceSlot::Parent, SourceSlot::Child, SourceSlot::Synonym];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            SourceSlot::Parent => "parent",
            SourceSlot::Child => "child",
            SourceSlot::Synonym => "synonym",
        }
    }
}

/// Full kNN configuration, as read from flags and `knnmt.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct KnnConfig {
    pub mode: Option<KnnMode>,
    pub datastore_path: Option<PathBuf>,
    pub k: usize,
    pub lambda: f32,
    pub temperature: f32,
    pub key_type: KeyType,
    pub subset_path: Option<PathBuf>,
    pub child_datastore_path: Option<PathBuf>,
    pub syn_datastore_path: Option<PathBuf>,
    pub lambda_list: Vec<f32>,
    pub k_list: Vec<usize>,
    pub temperature_list: Vec<f32>,
}

impl Default for KnnConfig {
    fn default() -> Self {
        Self {
            mode: None,
            datastore_path: None,
            k: 8,
            lambda: 0.25,
            temperature: 10.0,
            key_type: KeyType::DecoderOutput,
            subset_path: None,
            child_datastore_path: None,
            syn_datastore_path: None,
            lambda_list: vec![0.2, 0.05, 0.05],
            k_list: vec![12, 12, 12],
            temperature_list: vec![10.0, 10.0, 10.0],
        }
    }
}

fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

impl KnnConfig {
    /// The configured mode, or an error if none was given.
    pub fn mode(&self) -> KnnResult<KnnMode> {
        self.mode
            .ok_or_else(|| KnnError::Configuration("knn mode is not set".to_string()))
    }

    /// The primary datastore path, or an error if it is missing or empty.
    pub fn datastore_path(&self) -> KnnResult<&Path> {
        non_empty(&self.datastore_path).ok_or_else(|| {
            KnnError::Configuration("knn datastore path is required".to_string())
        })
    }

    pub fn subset_path(&self) -> Option<&Path> {
        non_empty(&self.subset_path)
    }

    /// Path for an ensemble source; child and synonym are enabled by a
    /// non-empty path.
    pub fn source_path(&self, slot: SourceSlot) -> Option<&Path> {
        match slot {
            SourceSlot::Parent => non_empty(&self.datastore_path),
            SourceSlot::Child => non_empty(&self.child_datastore_path),
            SourceSlot::Synonym => non_empty(&self.syn_datastore_path),
        }
    }

    /// Enabled ensemble sources in slot order.
    pub fn enabled_sources(&self) -> Vec<(SourceSlot, &Path)> {
        SourceSlot::ALL
            .iter()
            .filter_map(|&slot| self.source_path(slot).map(|p| (slot, p)))
            .collect()
    }

    /// Check the settings the configured mode depends on.
    pub fn validate(&self) -> KnnResult<KnnMode> {
        let mode = self.mode()?;
        self.datastore_path()?;

        match mode {
            KnnMode::BuildDatastore => {}
            KnnMode::Inference => {
                check_k(self.k, "knn-k")?;
                check_temperature(self.temperature, "knn-temperature")?;
                check_weights(&[self.lambda], "knn-lambda")?;
            }
            KnnMode::EnsembleInference => self.validate_ensemble()?,
        }
        Ok(mode)
    }

    fn validate_ensemble(&self) -> KnnResult<()> {
        let sources = self.enabled_sources();
        let needed = sources
            .iter()
            .map(|(slot, _)| slot.index() + 1)
            .max()
            .unwrap_or(1);

        for (name, len) in [
            ("lambda-list", self.lambda_list.len()),
            ("knn-k-list", self.k_list.len()),
            ("knn-temperature-list", self.temperature_list.len()),
        ] {
            if len < needed {
                return Err(KnnError::Configuration(format!(
                    "{} has {} entries but {} sources are addressed",
                    name, len, needed
                )));
            }
        }

        let mut weights = Vec::with_capacity(sources.len());
        for (slot, _) in &sources {
            let i = slot.index();
            check_k(self.k_list[i], "knn-k-list")?;
            check_temperature(self.temperature_list[i], "knn-temperature-list")?;
            weights.push(self.lambda_list[i]);
        }
        check_weights(&weights, "lambda-list")
    }
}

fn check_k(k: usize, name: &str) -> KnnResult<()> {
    if k == 0 {
        return Err(KnnError::Configuration(format!("{} must be at least 1", name)));
    }
    Ok(())
}

fn check_temperature(t: f32, name: &str) -> KnnResult<()> {
    if !(t.is_finite() && t > 0.0) {
        return Err(KnnError::Configuration(format!(
            "{} must be positive, got {}",
            name, t
        )));
    }
    Ok(())
}

/// Weights must be non-negative and leave a non-negative share for the base
/// distribution.
pub(crate) fn check_weights(weights: &[f32], name: &str) -> KnnResult<()> {
    if let Some(w) = weights.iter().find(|w| !(w.is_finite() && **w >= 0.0)) {
        return Err(KnnError::Configuration(format!(
            "{} weights must be non-negative, got {}",
            name, w
        )));
    }
    let total: f32 = weights.iter().sum();
    if total > 1.0 + WEIGHT_TOLERANCE {
        return Err(KnnError::Configuration(format!(
            "{} weights sum to {}, which exceeds 1",
            name, total
        )));
    }
    Ok(())
}
