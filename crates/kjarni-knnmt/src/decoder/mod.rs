//! A translation decoder augmented with k-nearest-neighbour retrieval.
//!
//! [`KnnDecoder`] wraps a [`CpuFeatureDecoder`] and splits every decoding step
//! in two:
//!
//! 1. [`KnnDecoder::forward`] runs the base decoder, then appends the step's
//!    hidden states to a datastore (build mode) or retrieves their nearest
//!    neighbours (inference modes). The outcome travels in
//!    [`DecoderOutput::knn`].
//! 2. [`KnnDecoder::get_normalized_probs`] consumes that outcome and blends
//!    the neighbour distribution(s) into the base distribution.
//!
//! ```ignore
//! let ctx = BuildContext::new();
//! let decoder = KnnDecoder::new(base, &config, Some(&ctx))?;
//! let store = ctx.datastore(config.datastore_path()?);
//!
//! for batch in batches {
//!     store.record_targets(&batch.target, pad_id)?;
//!     decoder.forward(&batch.prev_output_tokens, Some(&batch.encoder_out), None, &options)?;
//! }
//! ctx.finish()?;
//! ```

mod context;
mod strategy;
mod traits;


pub use context::{BuildContext, SharedDatastore};
pub use strategy::{open_for_inference, strategy_for, KnnStep, KnnStrategy};
pub use traits::{
    CpuFeatureDecoder, DecoderExtra, DecoderFeatures, EncoderOut, ForwardOptions,
    IncrementalState, LAST_FFN_INPUT,
};

use ndarray::{Array2, Array3};

use crate::args::KnnArgs;
use crate::combiner::CombineExtra;
use crate::config::{KeyType, KnnConfig, KnnMode};
use crate::error::{KnnError, KnnResult};

/// Output of one [`KnnDecoder::forward`] call.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// Vocabulary scores `[batch, seq, vocab]`, or the hidden features when
    /// `features_only` was requested.
    pub scores: Array3<f32>,
    pub features_only: bool,
    pub extra: DecoderExtra,
    /// What the kNN side did during this step.
    pub knn: KnnStep,
}

pub struct KnnDecoder<D: CpuFeatureDecoder> {
    base: D,
    key_type: KeyType,
    strategy: Box<dyn KnnStrategy>,
}

impl<D: CpuFeatureDecoder> KnnDecoder<D> {
    /// Wrap `base` for the mode in `config`. Build mode needs `context`, the
    /// other modes ignore it.
    pub fn new(base: D, config: &KnnConfig, context: Option<&BuildContext>) -> KnnResult<Self> {
        let strategy = strategy_for(config, base.vocab_size(), context)?;
        log::info!(
            "kNN decoder ready: mode {}, key type {}",
            strategy.mode(),
            config.key_type
        );
        Ok(Self {
            base,
            key_type: config.key_type,
            strategy,
        })
    }

    /// Resolve `args` against the configuration file and build the decoder.
    pub fn from_args(base: D, args: &KnnArgs, context: Option<&BuildContext>) -> KnnResult<Self> {
        let config = args.resolve()?;
        Self::new(base, &config, context)
    }

    pub fn mode(&self) -> KnnMode {
        self.strategy.mode()
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn base(&self) -> &D {
        &self.base
    }

    pub fn vocab_size(&self) -> usize {
        self.base.vocab_size()
    }

    /// The datastore this decoder appends to, in build mode.
    pub fn build_datastore(&self) -> Option<&SharedDatastore> {
        self.strategy.build_datastore()
    }

    /// Run the base decoder and the mode's kNN side effect.
    pub fn forward(
        &self,
        prev_output_tokens: &Array2<u32>,
        encoder_out: Option<&EncoderOut>,
        state: Option<&mut dyn IncrementalState>,
        options: &ForwardOptions,
    ) -> KnnResult<DecoderOutput> {
        let features = self
            .base
            .extract_features(prev_output_tokens, encoder_out, state, options)
            .map_err(KnnError::BaseDecoder)?;

        let keys = match self.key_type {
            KeyType::DecoderOutput => &features.hidden_states,
            KeyType::LastFfnInput => features.extra.last_ffn_input().ok_or_else(|| {
                KnnError::Configuration(format!(
                    "key type {} requested but the base decoder did not report it",
                    KeyType::LastFfnInput
                ))
            })?,
        };
        let knn = self.strategy.produce_side_effects(keys.view())?;

        let scores = if options.features_only {
            features.hidden_states
        } else {
            self.base
                .output_layer(&features.hidden_states)
                .map_err(KnnError::BaseDecoder)?
        };

        Ok(DecoderOutput {
            scores,
            features_only: options.features_only,
            extra: features.extra,
            knn,
        })
    }

    /// Normalized probabilities for `output`, blended with the step's
    /// retrieval results in the inference modes.
    pub fn get_normalized_probs(
        &self,
        output: &DecoderOutput,
        log_probs: bool,
    ) -> KnnResult<Array3<f32>> {
        self.get_normalized_probs_with_extra(output, log_probs)
            .map(|(probs, _)| probs)
    }

    /// Like [`KnnDecoder::get_normalized_probs`], also returning the base and
    /// linear combined distributions when retrieval was blended in.
    pub fn get_normalized_probs_with_extra(
        &self,
        output: &DecoderOutput,
        log_probs: bool,
    ) -> KnnResult<(Array3<f32>, Option<CombineExtra>)> {
        if let Some((probs, extra)) = self.strategy.finalize_probabilities(output, log_probs)? {
            return Ok((probs, Some(extra)));
        }
        let probs = self
            .base
            .get_normalized_probs(output.scores.view(), log_probs)
            .map_err(KnnError::BaseDecoder)?;
        Ok((probs, None))
    }
}
