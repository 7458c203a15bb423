//! Per-mode behaviour of the kNN decoder.

use std::path::Path;
use std::sync::Arc;

use kjarni_datastore::{read_subset_ids, Datastore, DatastoreField};
use ndarray::{Array3, ArrayView3};

use crate::combiner::{CombineExtra, Combiner};
use crate::config::{KnnConfig, KnnMode, SourceSlot};
use crate::decoder::context::{BuildContext, SharedDatastore};
use crate::decoder::DecoderOutput;
use crate::error::{KnnError, KnnResult};
use crate::retriever::{RetrievalResult, Retriever};

/// What the kNN side of `forward` did for one decoding step.
#[derive(Debug, Clone, PartialEq)]
pub enum KnnStep {
    /// Keys were appended to the build datastore.
    Appended { entries: usize },
    /// Neighbours from the single inference datastore.
    Retrieved(RetrievalResult),
    /// Neighbours from every enabled ensemble source, in slot order.
    Ensemble(Vec<(SourceSlot, RetrievalResult)>),
}

impl KnnStep {
    fn kind(&self) -> &'static str {
        match self {
            KnnStep::Appended { .. } => "an append step",
            KnnStep::Retrieved(_) => "a single-source retrieval",
            KnnStep::Ensemble(_) => "an ensemble retrieval",
        }
    }
}

/// The two mode-dependent halves of a decoding step.
pub trait KnnStrategy: Send + Sync {
    fn mode(&self) -> KnnMode;

    /// Persist or query with the step's keys `[batch, seq, hidden]`.
    fn produce_side_effects(&self, keys: ArrayView3<'_, f32>) -> KnnResult<KnnStep>;

    /// Blend the step's retrieval results into the base distribution.
    /// `None` means the base decoder's own normalization applies.
    fn finalize_probabilities(
        &self,
        output: &DecoderOutput,
        log_probs: bool,
    ) -> KnnResult<Option<(Array3<f32>, CombineExtra)>>;

    /// The writable datastore, in build mode.
    fn build_datastore(&self) -> Option<&SharedDatastore> {
        None
    }
}

/// Create the strategy for `config`'s mode.
pub fn strategy_for(
    config: &KnnConfig,
    vocab_size: usize,
    context: Option<&BuildContext>,
) -> KnnResult<Box<dyn KnnStrategy>> {
    let mode = config.validate()?;
    Ok(match mode {
        KnnMode::BuildDatastore => {
            let context = context.ok_or_else(|| {
                KnnError::Configuration(
                    "build_datastore mode needs a build context".to_string(),
                )
            })?;
            Box::new(BuildStrategy {
                store: context.datastore(config.datastore_path()?),
            })
        }
        KnnMode::Inference => {
            let datastore =
                open_for_inference(config.datastore_path()?, config.subset_path())?;
            Box::new(InferenceStrategy {
                retriever: Retriever::new(datastore, config.k)?,
                combiner: Combiner::new(config.lambda, config.temperature, vocab_size)?,
            })
        }
        KnnMode::EnsembleInference => {
            let mut sources = Vec::new();
            for (slot, path) in config.enabled_sources() {
                let i = slot.index();
                let subset = match slot {
                    SourceSlot::Parent => config.subset_path(),
                    _ => None,
                };
                let datastore = open_for_inference(path, subset)?;
                sources.push(EnsembleSource {
                    slot,
                    retriever: Retriever::new(datastore, config.k_list[i])?,
                    weight: config.lambda_list[i],
                    temperature: config.temperature_list[i],
                });
            }
            Box::new(EnsembleStrategy {
                sources,
                combiner: Combiner::new(
                    config.lambda_list[0],
                    config.temperature_list[0],
                    vocab_size,
                )?,
            })
        }
    })
}

/// Load the value table and attach the key index, optionally restricted to
/// the entry ids listed in `subset`.
pub fn open_for_inference(path: &Path, subset: Option<&Path>) -> KnnResult<Arc<Datastore>> {
    let mut datastore = Datastore::load(path, &[DatastoreField::Vals])?;
    match subset {
        Some(subset) => {
            let ids = read_subset_ids(subset)?;
            datastore.load_index_subset(&ids)?;
            log::info!(
                "Datastore {:?}: searching {} of {} entries from {:?}",
                path,
                ids.len(),
                datastore.len(),
                subset
            );
        }
        None => datastore.load_index()?,
    }
    Ok(Arc::new(datastore))
}

fn check_positions(
    output: &DecoderOutput,
    result: &RetrievalResult,
    probability_dim: usize,
) -> KnnResult<()> {
    if output.features_only {
        return Err(KnnError::Dimension(
            "cannot normalize hidden features; run forward without features_only".to_string(),
        ));
    }
    let (batch, seq, vocab) = output.scores.dim();
    if result.positions() != (batch, seq) {
        return Err(KnnError::Dimension(format!(
            "retrieval covers {:?} positions but scores cover ({}, {})",
            result.positions(),
            batch,
            seq
        )));
    }
    if vocab != probability_dim {
        return Err(KnnError::Dimension(format!(
            "scores have width {} but the vocabulary has {} entries",
            vocab, probability_dim
        )));
    }
    Ok(())
}

struct BuildStrategy {
    store: SharedDatastore,
}

impl KnnStrategy for BuildStrategy {
    fn mode(&self) -> KnnMode {
        KnnMode::BuildDatastore
    }

    fn produce_side_effects(&self, keys: ArrayView3<'_, f32>) -> KnnResult<KnnStep> {
        let entries = self.store.append_keys(keys)?;
        log::trace!("Appended {} keys to {:?}", entries, self.store.path());
        Ok(KnnStep::Appended { entries })
    }

    fn finalize_probabilities(
        &self,
        _output: &DecoderOutput,
        _log_probs: bool,
    ) -> KnnResult<Option<(Array3<f32>, CombineExtra)>> {
        Ok(None)
    }

    fn build_datastore(&self) -> Option<&SharedDatastore> {
        Some(&self.store)
    }
}

struct InferenceStrategy {
    retriever: Retriever,
    combiner: Combiner,
}

impl KnnStrategy for InferenceStrategy {
    fn mode(&self) -> KnnMode {
        KnnMode::Inference
    }

    fn produce_side_effects(&self, keys: ArrayView3<'_, f32>) -> KnnResult<KnnStep> {
        Ok(KnnStep::Retrieved(self.retriever.retrieve(keys)?))
    }

    fn finalize_probabilities(
        &self,
        output: &DecoderOutput,
        log_probs: bool,
    ) -> KnnResult<Option<(Array3<f32>, CombineExtra)>> {
        let result = match &output.knn {
            KnnStep::Retrieved(result) => result,
            other => {
                return Err(KnnError::StepOrder(format!(
                    "inference normalization needs a retrieval result, got {}",
                    other.kind()
                )))
            }
        };
        check_positions(output, result, self.combiner.probability_dim())?;

        let knn = self.combiner.knn_prob(result, None)?;
        let combined = self
            .combiner
            .combined_prob(knn.view(), output.scores.view(), log_probs)?;
        Ok(Some(combined))
    }
}

struct EnsembleSource {
    slot: SourceSlot,
    retriever: Retriever,
    weight: f32,
    temperature: f32,
}

struct EnsembleStrategy {
    sources: Vec<EnsembleSource>,
    combiner: Combiner,
}

impl KnnStrategy for EnsembleStrategy {
    fn mode(&self) -> KnnMode {
        KnnMode::EnsembleInference
    }

    fn produce_side_effects(&self, keys: ArrayView3<'_, f32>) -> KnnResult<KnnStep> {
        let results = self
            .sources
            .iter()
            .map(|source| {
                source
                    .retriever
                    .retrieve(keys)
                    .map(|result| (source.slot, result))
            })
            .collect::<KnnResult<Vec<_>>>()?;
        Ok(KnnStep::Ensemble(results))
    }

    fn finalize_probabilities(
        &self,
        output: &DecoderOutput,
        log_probs: bool,
    ) -> KnnResult<Option<(Array3<f32>, CombineExtra)>> {
        let results = match &output.knn {
            KnnStep::Ensemble(results) => results,
            other => {
                return Err(KnnError::StepOrder(format!(
                    "ensemble normalization needs ensemble retrieval results, got {}",
                    other.kind()
                )))
            }
        };

        let mut knns = Vec::with_capacity(self.sources.len());
        let mut weights = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let result = results
                .iter()
                .find(|(slot, _)| *slot == source.slot)
                .map(|(_, result)| result)
                .ok_or_else(|| {
                    KnnError::StepOrder(format!(
                        "no retrieval result for the {} source",
                        source.slot.name()
                    ))
                })?;
            check_positions(output, result, self.combiner.probability_dim())?;
            knns.push(self.combiner.knn_prob(result, Some(source.temperature))?);
            weights.push(source.weight);
        }

        let views: Vec<_> = knns.iter().map(|knn| knn.view()).collect();
        let combined = self.combiner.ensemble_combined_prob(
            &views,
            &weights,
            output.scores.view(),
            log_probs,
        )?;
        Ok(Some(combined))
    }
}
