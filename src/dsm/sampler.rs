//! Langevin dynamics over a learned score field.

use candle::{Result, Tensor};
use tracing::debug;

use crate::dsm::net::ScoreModel;

/// Draw samples by iterated noisy score ascent:
/// `x <- x + step_lr * score(x) + N(0, 2 * step_lr)`.
///
/// Each iteration records a clamped-to-[0, 1] snapshot of the state *before*
/// the update, so the returned trajectory exposes the whole annealing path
/// rather than just the final sample. No gradients are tracked. The mean and
/// max absolute score component are logged per step; a blow-up there is the
/// usual sign of an unstable score field.
pub fn langevin_dynamics<M: ScoreModel>(
    x0: &Tensor,
    scorenet: &M,
    n_steps: usize,
    step_lr: f64,
) -> Result<Vec<Tensor>> {
    let mut x = x0.clone();
    let mut snapshots = Vec::with_capacity(n_steps);
    for step in 0..n_steps {
        snapshots.push(x.clamp(0.0, 1.0)?);
        let noise = x.randn_like(0.0, (2.0 * step_lr).sqrt())?;
        let grad = scorenet.score(&x)?.detach();
        let abs = grad.abs()?;
        let grad_mean = abs.mean_all()?.to_scalar::<f32>()?;
        let grad_max = abs.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        debug!(step, grad_mean, grad_max, "langevin step");
        x = x.detach().add(&grad.affine(step_lr, 0.0)?)?.add(&noise)?;
    }
    Ok(snapshots)
}
