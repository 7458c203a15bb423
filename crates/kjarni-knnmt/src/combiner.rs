//! Turns retrieved neighbours into a vocabulary distribution and blends it
//! with the base model's distribution.

use ndarray::{s, Array3, ArrayView3, Axis};

use crate::config::check_weights;
use crate::error::{KnnError, KnnResult};
use crate::ops::softmax;
use crate::retriever::RetrievalResult;

/// Intermediate distributions kept alongside the combined output.
#[derive(Debug, Clone)]
pub struct CombineExtra {
    /// Softmax of the base scores.
    pub neural_probs: Array3<f32>,
    /// Combined distribution in linear space.
    pub unlog_combined_probs: Array3<f32>,
}

#[derive(Debug, Clone)]
pub struct Combiner {
    lambda: f32,
    temperature: f32,
    probability_dim: usize,
}

impl Combiner {
    pub fn new(lambda: f32, temperature: f32, probability_dim: usize) -> KnnResult<Self> {
        check_weights(&[lambda], "knn lambda")?;
        check_temperature(temperature)?;
        if probability_dim == 0 {
            return Err(KnnError::Configuration(
                "probability dimension must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            lambda,
            temperature,
            probability_dim,
        })
    }

    pub fn lambda(&self) -> f32 {
        self.lambda
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn probability_dim(&self) -> usize {
        self.probability_dim
    }

    /// kNN distribution `[batch, seq, vocab]`: softmax of `-distance / T`
    /// over the neighbours, scatter-added onto their labels.
    ///
    /// `temperature` overrides the combiner's own for this call only.
    pub fn knn_prob(
        &self,
        result: &RetrievalResult,
        temperature: Option<f32>,
    ) -> KnnResult<Array3<f32>> {
        let temperature = temperature.unwrap_or(self.temperature);
        check_temperature(temperature)?;

        if result.distances.dim() != result.labels.dim() {
            return Err(KnnError::Dimension(format!(
                "labels {:?} and distances {:?} disagree",
                result.labels.dim(),
                result.distances.dim()
            )));
        }

        let (batch, seq) = result.positions();
        let vocab = self.probability_dim;
        let mut probs = Array3::<f32>::zeros((batch, seq, vocab));

        for b in 0..batch {
            for t in 0..seq {
                let labels = result.labels.slice(s![b, t, ..]);
                let distances = result.distances.slice(s![b, t, ..]);
                if labels.is_empty() {
                    continue;
                }

                let scaled: Vec<f32> = distances.iter().map(|&d| -d / temperature).collect();
                let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exps: Vec<f32> = scaled.iter().map(|&x| (x - max).exp()).collect();
                let total: f32 = exps.iter().sum();

                let mut row = probs.slice_mut(s![b, t, ..]);
                for (&label, &e) in labels.iter().zip(exps.iter()) {
                    let label = label as usize;
                    if label >= vocab {
                        return Err(KnnError::Dimension(format!(
                            "retrieved label {} is outside the vocabulary of {}",
                            label, vocab
                        )));
                    }
                    row[label] += e / total;
                }
            }
        }
        Ok(probs)
    }

    /// `(1 - lambda) * softmax(logits) + lambda * knn`, optionally in log space.
    pub fn combined_prob(
        &self,
        knn: ArrayView3<'_, f32>,
        logits: ArrayView3<'_, f32>,
        log_probs: bool,
    ) -> KnnResult<(Array3<f32>, CombineExtra)> {
        self.ensemble_combined_prob(&[knn], &[self.lambda], logits, log_probs)
    }

    /// `(1 - sum(w)) * softmax(logits) + sum(w_i * knn_i)`, optionally in log
    /// space.
    pub fn ensemble_combined_prob(
        &self,
        knns: &[ArrayView3<'_, f32>],
        weights: &[f32],
        logits: ArrayView3<'_, f32>,
        log_probs: bool,
    ) -> KnnResult<(Array3<f32>, CombineExtra)> {
        if knns.len() != weights.len() {
            return Err(KnnError::Configuration(format!(
                "{} knn distributions but {} weights",
                knns.len(),
                weights.len()
            )));
        }
        check_weights(weights, "ensemble")?;

        if logits.len_of(Axis(2)) != self.probability_dim {
            return Err(KnnError::Dimension(format!(
                "scores have width {} but the vocabulary has {} entries",
                logits.len_of(Axis(2)),
                self.probability_dim
            )));
        }
        for knn in knns {
            if knn.dim() != logits.dim() {
                return Err(KnnError::Dimension(format!(
                    "knn distribution {:?} does not match scores {:?}",
                    knn.dim(),
                    logits.dim()
                )));
            }
        }

        let neural_probs = softmax(logits);
        let base_weight = 1.0 - weights.iter().sum::<f32>();
        let mut combined = &neural_probs * base_weight;
        for (knn, &w) in knns.iter().zip(weights) {
            combined.scaled_add(w, knn);
        }

        let output = if log_probs {
            combined.mapv(f32::ln)
        } else {
            combined.clone()
        };

        Ok((
            output,
            CombineExtra {
                neural_probs,
                unlog_combined_probs: combined,
            },
        ))
    }
}

fn check_temperature(temperature: f32) -> KnnResult<()> {
    if !(temperature.is_finite() && temperature > 0.0) {
        return Err(KnnError::Configuration(format!(
            "temperature must be positive, got {}",
            temperature
        )));
    }
    Ok(())
}
