//! Conditional denoising score-matching objective.
//!
//! The estimator never needs the true density: perturb the data with a known
//! Gaussian kernel and regress the model's score field against the kernel's
//! analytic score `-(x~ - x) / sigma^2`.
//!
//! Conditioning on the label segment goes through a separately-tracked
//! `(H*W, nSeg)` weight matrix: the column indexed by each sample's label
//! multiplies the shared network's score field per pixel, broadcast across
//! channels. The exact combination rule is a hyperparameter choice; this
//! multiplicative form is the one used throughout the crate.

use candle::{Result, Tensor};

use crate::dsm::net::ScoreModel;

/// Shift labels so the smallest value maps to index 0. Must be applied
/// before any final-layer indexing; label sets like {3, 5} would otherwise
/// index past the matrix.
pub fn shift_labels(y: &Tensor) -> Result<Tensor> {
    let values = y.to_vec1::<u32>()?;
    let min = values.iter().copied().min().unwrap_or(0);
    let n = values.len();
    let shifted: Vec<u32> = values.into_iter().map(|v| v - min).collect();
    Tensor::from_vec(shifted, (n,), y.device())
}

/// Conditional DSM loss with freshly sampled perturbation noise.
pub fn conditional_dsm<M: ScoreModel>(
    net: &M,
    x: &Tensor,
    y: &Tensor,
    final_layer: &Tensor,
    sigma: f64,
) -> Result<Tensor> {
    let noise = x.randn_like(0.0, sigma)?;
    conditional_dsm_with_noise(net, x, y, final_layer, sigma, &noise)
}

/// Same objective with the perturbation passed in explicitly (deterministic;
/// used by the tests).
pub fn conditional_dsm_with_noise<M: ScoreModel>(
    net: &M,
    x: &Tensor,
    y: &Tensor,
    final_layer: &Tensor,
    sigma: f64,
    noise: &Tensor,
) -> Result<Tensor> {
    let perturbed = x.add(noise)?;
    // Score of the Gaussian perturbation kernel.
    let target = x.sub(&perturbed)?.affine(1.0 / (sigma * sigma), 0.0)?;
    let raw = net.score(&perturbed)?;
    let (b, c, h, w) = raw.dims4()?;
    let weights = final_layer.t()?.contiguous()?.index_select(y, 0)?;
    let pred = raw
        .reshape((b, c, h * w))?
        .broadcast_mul(&weights.reshape((b, 1, h * w))?)?;
    let target = target.reshape((b, c, h * w))?;
    pred.sub(&target)?
        .sqr()?
        .sum(2)?
        .sum(1)?
        .mean(0)?
        .affine(0.5 * sigma * sigma, 0.0)
}
