//! The base translation decoder that kNN decoding wraps.

use std::any::Any;
use std::collections::HashMap;

use anyhow::Result;
use ndarray::{Array2, Array3, ArrayView3};

use crate::ops::{log_softmax, softmax};

/// Key under which a base decoder reports the last feed-forward input.
pub const LAST_FFN_INPUT: &str = "last_ffn_input";

/// A type-erased container for the base decoder's incremental state.
pub trait IncrementalState: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// Number of target positions already decoded.
    fn seq_length(&self) -> usize;
    /// Reorder cached hypotheses, e.g. after a beam search step.
    fn reorder(&mut self, new_order: &[usize]) -> Result<()>;
    fn clear(&mut self);
}

/// Encoder result consumed by the decoder's cross attention.
#[derive(Debug, Clone)]
pub struct EncoderOut {
    /// Shape: `[batch, src_len, hidden]`.
    pub hidden_states: Array3<f32>,
    /// `true` at source padding. Shape: `[batch, src_len]`.
    pub padding_mask: Option<Array2<bool>>,
}

/// Options forwarded to the base decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForwardOptions {
    /// Skip the output projection and return hidden features.
    pub features_only: bool,
    pub full_context_alignment: bool,
    pub alignment_layer: Option<usize>,
    pub alignment_heads: Option<usize>,
    pub return_all_hiddens: bool,
}

/// Auxiliary tensors produced alongside the features.
#[derive(Debug, Clone, Default)]
pub struct DecoderExtra {
    pub attention: Option<Array3<f32>>,
    pub inner_states: Vec<Array3<f32>>,
    /// Named tensors such as [`LAST_FFN_INPUT`].
    pub tensors: HashMap<String, Array3<f32>>,
}

impl DecoderExtra {
    pub fn last_ffn_input(&self) -> Option<&Array3<f32>> {
        self.tensors.get(LAST_FFN_INPUT)
    }
}

/// Hidden features for one decoding step.
#[derive(Debug, Clone)]
pub struct DecoderFeatures {
    /// Shape: `[batch, seq, hidden]`.
    pub hidden_states: Array3<f32>,
    pub extra: DecoderExtra,
}

/// A decoder that produces hidden features and projects them to the
/// vocabulary on the CPU.
pub trait CpuFeatureDecoder: Send + Sync {
    fn extract_features(
        &self,
        prev_output_tokens: &Array2<u32>,
        encoder_out: Option<&EncoderOut>,
        state: Option<&mut dyn IncrementalState>,
        options: &ForwardOptions,
    ) -> Result<DecoderFeatures>;

    /// `[batch, seq, hidden]` -> `[batch, seq, vocab]` scores.
    fn output_layer(&self, features: &Array3<f32>) -> Result<Array3<f32>>;

    /// Normalize scores over the vocabulary.
    fn get_normalized_probs(
        &self,
        scores: ArrayView3<'_, f32>,
        log_probs: bool,
    ) -> Result<Array3<f32>> {
        Ok(if log_probs {
            log_softmax(scores)
        } else {
            softmax(scores)
        })
    }

    fn vocab_size(&self) -> usize;
    fn hidden_size(&self) -> usize;
}
