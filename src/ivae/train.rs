//! iVAE training loop.
//!
//! Minimizes the negative ELBO with Adam over a shuffled batch stream. The
//! iteration counter advances per batch and training hard-stops the first
//! time it reaches the configured budget, so the final epoch may be partial.
//! NaN losses are not intercepted; divergence halts the run with the
//! underlying numerical error.

use candle::{Result, Tensor};
use candle_nn::Optimizer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::data::PairedDataset;
use crate::device::select_device;
use crate::error::ConfigError;
use crate::ivae::model::{GaussianParams, Ivae, IvaeForward};
use crate::optim::{Adam, ParamsAdam};

#[derive(Clone, Debug)]
pub struct IvaeConfig {
    pub batch_size: usize,
    pub max_iter: usize,
    pub seed: u64,
    pub n_layers: usize,
    pub hidden_dim: usize,
    pub learning_rate: f64,
    /// Defaults to the auxiliary dimension when unset.
    pub latent_dim: Option<usize>,
    /// Batch the final full-dataset forward pass to bound memory; `None`
    /// runs it in one shot.
    pub final_pass_batch: Option<usize>,
    pub use_accelerator: bool,
}

impl IvaeConfig {
    /// Reject values that would stall the batch stream or the training loop.
    pub fn validate(&self, n_samples: usize) -> std::result::Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be positive"));
        }
        if self.max_iter == 0 {
            return Err(ConfigError::invalid("max_iter", "must be positive"));
        }
        if self.n_layers == 0 {
            return Err(ConfigError::invalid("n_layers", "must be positive"));
        }
        if self.hidden_dim == 0 {
            return Err(ConfigError::invalid("hidden_dim", "must be positive"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(ConfigError::invalid("learning_rate", "must be positive"));
        }
        if self.final_pass_batch == Some(0) {
            return Err(ConfigError::invalid("final_pass_batch", "must be positive when set"));
        }
        if n_samples == 0 {
            return Err(ConfigError::invalid("x", "dataset is empty"));
        }
        Ok(())
    }
}

impl Default for IvaeConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            max_iter: 70_000,
            seed: 0,
            n_layers: 3,
            hidden_dim: 20,
            learning_rate: 1e-3,
            latent_dim: None,
            final_pass_batch: None,
            use_accelerator: false,
        }
    }
}

/// Reduce the learning rate by a fixed factor once the monitored metric has
/// failed to improve for `patience` consecutive epochs.
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    best: Option<f64>,
    epochs_without_improvement: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize) -> Self {
        Self {
            factor,
            patience,
            best: None,
            epochs_without_improvement: 0,
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Record one epoch-level metric; returns true when the rate should be
    /// reduced now.
    pub fn step(&mut self, metric: f64) -> bool {
        match self.best {
            Some(best) if metric >= best => {
                self.epochs_without_improvement += 1;
                if self.epochs_without_improvement >= self.patience {
                    self.epochs_without_improvement = 0;
                    return true;
                }
                false
            }
            _ => {
                self.best = Some(metric);
                self.epochs_without_improvement = 0;
                false
            }
        }
    }
}

/// Final parameter sets extracted over the whole dataset.
pub struct IvaeParams {
    pub decoder: GaussianParams,
    pub encoder: GaussianParams,
    pub prior: GaussianParams,
}

pub struct IvaeFit {
    /// Latent codes for every dataset row.
    pub z: Tensor,
    pub model: Ivae,
    pub params: IvaeParams,
}

impl std::fmt::Debug for IvaeFit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IvaeFit").field("z", &self.z).finish_non_exhaustive()
    }
}

/// Fit an iVAE on the observation matrix `x` (N x D) conditioned on the
/// auxiliary matrix `u` (N x K).
pub fn train_ivae(x: &Tensor, u: &Tensor, config: &IvaeConfig) -> Result<IvaeFit> {
    config.validate(x.dim(0)?).map_err(candle::Error::wrap)?;
    let device = select_device(config.use_accelerator)?;
    device.set_seed(config.seed)?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let dataset = PairedDataset::new(&x.to_device(&device)?, &u.to_device(&device)?)?;
    let latent_dim = config.latent_dim.unwrap_or(dataset.aux_dim());
    let model = Ivae::new(
        dataset.data_dim(),
        latent_dim,
        dataset.aux_dim(),
        config.n_layers,
        config.hidden_dim,
        &device,
    )?;
    let mut optimizer = Adam::new(
        model.parameters(),
        ParamsAdam {
            lr: config.learning_rate,
            ..Default::default()
        },
    )?;
    let mut scheduler = ReduceLrOnPlateau::new(0.1, 3);

    info!(
        n = dataset.len(),
        data_dim = dataset.data_dim(),
        aux_dim = dataset.aux_dim(),
        latent_dim,
        max_iter = config.max_iter,
        "training iVAE"
    );

    let mut it = 0;
    let mut epoch = 0;
    'training: while it < config.max_iter {
        epoch += 1;
        let mut epoch_loss = 0f64;
        let mut n_batches = 0usize;
        for batch in dataset.shuffled_batches(config.batch_size, &mut rng)? {
            it += 1;
            let (elbo, _z) = model.elbo(&batch.x, &batch.u)?;
            let loss = elbo.neg()?;
            optimizer.backward_step(&loss)?;
            epoch_loss += loss.to_scalar::<f32>()? as f64;
            n_batches += 1;
            if it >= config.max_iter {
                break 'training;
            }
        }
        let epoch_loss = epoch_loss / n_batches as f64;
        debug!(epoch, it, loss = epoch_loss, "epoch finished");
        if scheduler.step(epoch_loss) {
            let lr = optimizer.learning_rate() * scheduler.factor();
            optimizer.set_learning_rate(lr);
            info!(epoch, lr, "plateau detected, reducing learning rate");
        }
    }

    let (xt, ut) = dataset.tensors();
    let fwd = match config.final_pass_batch {
        None => model.forward(xt, ut)?,
        Some(batch) => forward_batched(&model, xt, ut, batch)?,
    };
    Ok(IvaeFit {
        z: fwd.z,
        params: IvaeParams {
            decoder: fwd.decoder,
            encoder: fwd.encoder,
            prior: fwd.prior,
        },
        model,
    })
}

fn forward_batched(model: &Ivae, x: &Tensor, u: &Tensor, batch: usize) -> Result<IvaeForward> {
    let n = x.dim(0)?;
    let mut parts = Vec::with_capacity(n.div_ceil(batch));
    let mut start = 0;
    while start < n {
        let len = batch.min(n - start);
        parts.push(model.forward(&x.narrow(0, start, len)?, &u.narrow(0, start, len)?)?);
        start += len;
    }
    let cat = |field: fn(&IvaeForward) -> &Tensor| -> Result<Tensor> {
        let rows: Vec<&Tensor> = parts.iter().map(field).collect();
        Tensor::cat(&rows, 0)
    };
    Ok(IvaeForward {
        decoder: GaussianParams {
            mean: cat(|f| &f.decoder.mean)?,
            logvar: cat(|f| &f.decoder.logvar)?,
        },
        encoder: GaussianParams {
            mean: cat(|f| &f.encoder.mean)?,
            logvar: cat(|f| &f.encoder.logvar)?,
        },
        z: cat(|f| &f.z)?,
        prior: GaussianParams {
            mean: cat(|f| &f.prior.mean)?,
            logvar: cat(|f| &f.prior.logvar)?,
        },
    })
}
