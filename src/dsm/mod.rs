//! Conditional denoising score matching: score network, objective, training
//! runner, and Langevin sampler.

pub mod loss;
pub mod net;
pub mod runner;
pub mod sampler;

pub use loss::{conditional_dsm, conditional_dsm_with_noise, shift_labels};
pub use net::{DilatedScoreNet, ScoreModel};
pub use runner::DsmRunner;
pub use sampler::langevin_dynamics;
