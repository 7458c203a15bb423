//! Tensor helpers shared by the combiner and the decoder.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};

use crate::error::{KnnError, KnnResult};

/// Softmax over the last axis.
pub fn softmax(scores: ArrayView3<'_, f32>) -> Array3<f32> {
    let mut out = scores.to_owned();
    for mut row in out.lanes_mut(Axis(2)) {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
    out
}

/// Log-softmax over the last axis.
pub fn log_softmax(scores: ArrayView3<'_, f32>) -> Array3<f32> {
    let mut out = scores.to_owned();
    for mut row in out.lanes_mut(Axis(2)) {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let log_sum = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
        row.mapv_inplace(|x| x - log_sum);
    }
    out
}

/// `true` wherever `tokens` is not `pad_id`.
pub fn non_pad_mask(tokens: ArrayView2<'_, u32>, pad_id: u32) -> Array2<bool> {
    tokens.mapv(|t| t != pad_id)
}

/// Gather the `[batch, seq, hidden]` rows whose mask entry is set, in
/// row-major order.
pub fn select_keys_with_pad_mask(
    keys: ArrayView3<'_, f32>,
    mask: ArrayView2<'_, bool>,
) -> KnnResult<Array2<f32>> {
    let (batch, seq, hidden) = keys.dim();
    if mask.dim() != (batch, seq) {
        return Err(KnnError::Dimension(format!(
            "pad mask has shape {:?} but keys have shape [{}, {}, {}]",
            mask.dim(),
            batch,
            seq,
            hidden
        )));
    }

    let count = mask.iter().filter(|&&m| m).count();
    let mut selected = Array2::<f32>::zeros((count, hidden));
    let positions = mask
        .indexed_iter()
        .filter(|(_, keep)| **keep)
        .map(|((b, s), _)| (b, s));
    for (mut dst, (b, s)) in selected.outer_iter_mut().zip(positions) {
        dst.assign(&keys.slice(s![b, s, ..]));
    }
    Ok(selected)
}
