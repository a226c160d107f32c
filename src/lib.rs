//! Research training pipelines for identifiable generative models on Candle.
//!
//! Two pipelines are provided: an identifiable variational autoencoder (iVAE)
//! fitted against auxiliary side information, and a conditional denoising
//! score-matching (DSM) trainer for an energy-based image model together with
//! the Langevin sampler that draws images from the learned score field.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod dsm;
pub mod error;
pub mod ivae;
pub mod optim;

pub use config::{Config, DatasetKind, OptimizerKind, RunArgs};
pub use dsm::runner::DsmRunner;
pub use dsm::sampler::langevin_dynamics;
pub use error::ConfigError;
pub use ivae::train::{train_ivae, IvaeConfig, IvaeFit};

pub use candle::{Device, Result, Tensor};
