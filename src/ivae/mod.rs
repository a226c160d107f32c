//! Identifiable VAE: model, objective, and training loop.

pub mod model;
pub mod train;

pub use model::{gaussian_kl, gaussian_log_prob, reparameterize, GaussianParams, Ivae, IvaeForward};
pub use train::{train_ivae, IvaeConfig, IvaeFit, IvaeParams, ReduceLrOnPlateau};
