//! Identifiable VAE model and variational objective.
//!
//! The generative model is p(x|z) p(z|u) with an inference model q(z|x, u).
//! All three component distributions are diagonal Gaussians parameterized by
//! MLP pairs (mean, log-variance). Conditioning the prior on the auxiliary
//! variable u is what makes the latent factorization identifiable.

use std::f64::consts::PI;

use candle::{DType, Device, Result, Tensor, Var};
use candle_nn::{linear, ops, Linear, Module, VarBuilder, VarMap};

/// Log-variances are clamped to this symmetric range before `exp`.
/// [-10, 10] keeps variances within [4.5e-5, 2.2e4].
const LOGVAR_CLAMP: f64 = 10.0;

const LRELU_SLOPE: f64 = 0.1;

/// Sample z = mean + exp(0.5 logvar) * eps with eps ~ N(0, I). The sample
/// stays differentiable with respect to mean and logvar.
pub fn reparameterize(mean: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    let eps = mean.randn_like(0.0, 1.0)?;
    mean.add(&logvar.affine(0.5, 0.0)?.exp()?.mul(&eps)?)
}

/// Per-sample diagonal-Gaussian log-density, summed over the feature axis:
/// `-0.5 * sum(ln 2pi + logvar + (x - mean)^2 / exp(logvar))`.
pub fn gaussian_log_prob(x: &Tensor, mean: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    let logvar = logvar.clamp(-LOGVAR_CLAMP, LOGVAR_CLAMP)?;
    let ln_2pi = (2.0 * PI).ln();
    x.sub(mean)?
        .sqr()?
        .div(&logvar.exp()?)?
        .add(&logvar)?
        .affine(-0.5, -0.5 * ln_2pi)?
        .sum(1)
}

/// Per-sample closed-form KL(q || p) between diagonal Gaussians:
/// `0.5 * sum(lp - lq + (exp(lq) + (mq - mp)^2) / exp(lp) - 1)`.
pub fn gaussian_kl(
    mean_q: &Tensor,
    logvar_q: &Tensor,
    mean_p: &Tensor,
    logvar_p: &Tensor,
) -> Result<Tensor> {
    let lq = logvar_q.clamp(-LOGVAR_CLAMP, LOGVAR_CLAMP)?;
    let lp = logvar_p.clamp(-LOGVAR_CLAMP, LOGVAR_CLAMP)?;
    let ratio = lq.exp()?.add(&mean_q.sub(mean_p)?.sqr()?)?.div(&lp.exp()?)?;
    lp.sub(&lq)?.add(&ratio)?.affine(0.5, -0.5)?.sum(1)
}

/// Plain MLP with leaky-ReLU activations between layers.
struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    fn new(
        in_dim: usize,
        hidden_dim: usize,
        out_dim: usize,
        n_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if n_layers == 0 {
            candle::bail!("MLP needs at least one layer");
        }
        let mut layers = Vec::with_capacity(n_layers);
        if n_layers == 1 {
            layers.push(linear(in_dim, out_dim, vb.pp("l0"))?);
        } else {
            layers.push(linear(in_dim, hidden_dim, vb.pp("l0"))?);
            for i in 1..n_layers - 1 {
                layers.push(linear(hidden_dim, hidden_dim, vb.pp(format!("l{i}")))?);
            }
            layers.push(linear(hidden_dim, out_dim, vb.pp(format!("l{}", n_layers - 1)))?);
        }
        Ok(Self { layers })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i < last {
                xs = ops::leaky_relu(&xs, LRELU_SLOPE)?;
            }
        }
        Ok(xs)
    }
}

/// Mean and log-variance of a diagonal Gaussian, one row per sample.
pub struct GaussianParams {
    pub mean: Tensor,
    pub logvar: Tensor,
}

/// Everything a full forward pass exposes for downstream inspection.
pub struct IvaeForward {
    pub decoder: GaussianParams,
    pub encoder: GaussianParams,
    pub z: Tensor,
    pub prior: GaussianParams,
}

pub struct Ivae {
    decoder_mean: Mlp,
    decoder_logvar: Mlp,
    encoder_mean: Mlp,
    encoder_logvar: Mlp,
    prior_mean: Mlp,
    prior_logvar: Mlp,
    varmap: VarMap,
    latent_dim: usize,
}

impl Ivae {
    pub fn new(
        data_dim: usize,
        latent_dim: usize,
        aux_dim: usize,
        n_layers: usize,
        hidden_dim: usize,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let decoder_mean = Mlp::new(latent_dim, hidden_dim, data_dim, n_layers, vb.pp("f"))?;
        let decoder_logvar = Mlp::new(latent_dim, hidden_dim, data_dim, n_layers, vb.pp("f_lv"))?;
        let encoder_mean = Mlp::new(data_dim + aux_dim, hidden_dim, latent_dim, n_layers, vb.pp("g"))?;
        let encoder_logvar =
            Mlp::new(data_dim + aux_dim, hidden_dim, latent_dim, n_layers, vb.pp("g_lv"))?;
        let prior_mean = Mlp::new(aux_dim, hidden_dim, latent_dim, n_layers, vb.pp("pz"))?;
        let prior_logvar = Mlp::new(aux_dim, hidden_dim, latent_dim, n_layers, vb.pp("pz_lv"))?;
        Ok(Self {
            decoder_mean,
            decoder_logvar,
            encoder_mean,
            encoder_logvar,
            prior_mean,
            prior_logvar,
            varmap,
            latent_dim,
        })
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Trainable variables in name order, so optimizer state stays positional
    /// across process restarts.
    pub fn parameters(&self) -> Vec<Var> {
        let vars = self.varmap.data().lock().unwrap();
        let mut names: Vec<&String> = vars.keys().collect();
        names.sort();
        names.iter().map(|name| vars[*name].clone()).collect()
    }

    fn encode(&self, x: &Tensor, u: &Tensor) -> Result<GaussianParams> {
        let xu = Tensor::cat(&[x, u], 1)?;
        Ok(GaussianParams {
            mean: self.encoder_mean.forward(&xu)?,
            logvar: self.encoder_logvar.forward(&xu)?,
        })
    }

    fn decode(&self, z: &Tensor) -> Result<GaussianParams> {
        Ok(GaussianParams {
            mean: self.decoder_mean.forward(z)?,
            logvar: self.decoder_logvar.forward(z)?,
        })
    }

    fn prior(&self, u: &Tensor) -> Result<GaussianParams> {
        Ok(GaussianParams {
            mean: self.prior_mean.forward(u)?,
            logvar: self.prior_logvar.forward(u)?,
        })
    }

    /// Batch-mean evidence lower bound and the reparameterized latent sample
    /// it was computed from.
    pub fn elbo(&self, x: &Tensor, u: &Tensor) -> Result<(Tensor, Tensor)> {
        let posterior = self.encode(x, u)?;
        let z = reparameterize(&posterior.mean, &posterior.logvar)?;
        let likelihood = self.decode(&z)?;
        let prior = self.prior(u)?;
        let recon = gaussian_log_prob(x, &likelihood.mean, &likelihood.logvar)?;
        let kl = gaussian_kl(&posterior.mean, &posterior.logvar, &prior.mean, &prior.logvar)?;
        let elbo = recon.sub(&kl)?.mean(0)?;
        Ok((elbo, z))
    }

    /// Full forward pass returning decoder, encoder, and prior parameters
    /// plus the sampled latent codes.
    pub fn forward(&self, x: &Tensor, u: &Tensor) -> Result<IvaeForward> {
        let encoder = self.encode(x, u)?;
        let z = reparameterize(&encoder.mean, &encoder.logvar)?;
        let decoder = self.decode(&z)?;
        let prior = self.prior(u)?;
        Ok(IvaeForward {
            decoder,
            encoder,
            z,
            prior,
        })
    }
}
