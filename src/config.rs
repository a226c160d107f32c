//! Experiment configuration.
//!
//! The reference experiments drove everything off a dynamic attribute-style
//! config; here the same knobs are explicit structs with closed enums for the
//! dataset and optimizer choices, validated eagerly at construction.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The closed set of dataset variants the DSM trainer understands.
///
/// The `*TransferBaseline` variants train on a fixed-size subset of the test
/// split restricted to the held-out labels; they exist to produce baseline
/// loss curves for transfer-learning comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetKind {
    Mnist,
    Cifar10,
    FashionMnist,
    MnistTransferBaseline,
    Cifar10TransferBaseline,
    FashionMnistTransferBaseline,
}

impl DatasetKind {
    pub fn base(&self) -> BaseDataset {
        match self {
            Self::Mnist | Self::MnistTransferBaseline => BaseDataset::Mnist,
            Self::Cifar10 | Self::Cifar10TransferBaseline => BaseDataset::Cifar10,
            Self::FashionMnist | Self::FashionMnistTransferBaseline => BaseDataset::FashionMnist,
        }
    }

    pub fn is_transfer_baseline(&self) -> bool {
        matches!(
            self,
            Self::MnistTransferBaseline
                | Self::Cifar10TransferBaseline
                | Self::FashionMnistTransferBaseline
        )
    }
}

impl FromStr for DatasetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "MNIST" => Ok(Self::Mnist),
            "CIFAR10" => Ok(Self::Cifar10),
            "FashionMNIST" => Ok(Self::FashionMnist),
            "MNIST_transferBaseline" => Ok(Self::MnistTransferBaseline),
            "CIFAR10_transferBaseline" => Ok(Self::Cifar10TransferBaseline),
            "FashionMNIST_transferBaseline" => Ok(Self::FashionMnistTransferBaseline),
            _ => Err(ConfigError::UnknownDataset(s.to_string())),
        }
    }
}

/// Underlying image corpus behind a [`DatasetKind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseDataset {
    Mnist,
    Cifar10,
    FashionMnist,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "Adam" => Ok(Self::Adam),
            "SGD" => Ok(Self::Sgd),
            _ => Err(ConfigError::UnknownOptimizer(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    pub dataset: DatasetKind,
    pub image_size: usize,
    pub channels: usize,
    pub logit_transform: bool,
    pub random_flip: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimConfig {
    pub optimizer: OptimizerKind,
    pub lr: f64,
    pub weight_decay: f64,
    pub beta1: f64,
    pub amsgrad: bool,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::Adam,
            lr: 1e-3,
            weight_decay: 0.0,
            beta1: 0.9,
            amsgrad: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub n_epochs: usize,
    /// Total iteration budget; training hard-stops here, possibly mid-epoch.
    pub n_iters: usize,
    /// Checkpoint every this many steps.
    pub snapshot_freq: usize,
}

/// Full DSM experiment configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub data: DataConfig,
    /// Number of label segments conditioned on (nSeg).
    pub n_labels: usize,
    pub optim: OptimConfig,
    pub training: TrainingConfig,
}

impl Config {
    /// Build a validated configuration. Every constraint is checked here so
    /// nothing fails lazily at first use.
    pub fn new(
        data: DataConfig,
        n_labels: usize,
        optim: OptimConfig,
        training: TrainingConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            data,
            n_labels,
            optim,
            training,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.image_size == 0 {
            return Err(ConfigError::invalid("data.image_size", "must be positive"));
        }
        if self.data.channels != 1 && self.data.channels != 3 {
            return Err(ConfigError::invalid(
                "data.channels",
                format!("must be 1 or 3, got {}", self.data.channels),
            ));
        }
        if self.n_labels == 0 || self.n_labels > 10 {
            return Err(ConfigError::invalid(
                "n_labels",
                format!("must be in 1..=10, got {}", self.n_labels),
            ));
        }
        if self.optim.lr <= 0.0 {
            return Err(ConfigError::invalid("optim.lr", "must be positive"));
        }
        if !(0.0..1.0).contains(&self.optim.beta1) {
            return Err(ConfigError::invalid("optim.beta1", "must be in [0, 1)"));
        }
        if self.training.batch_size == 0 {
            return Err(ConfigError::invalid(
                "training.batch_size",
                "must be positive",
            ));
        }
        if self.training.n_iters == 0 {
            return Err(ConfigError::invalid("training.n_iters", "must be positive"));
        }
        if self.training.snapshot_freq == 0 {
            return Err(ConfigError::invalid(
                "training.snapshot_freq",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Per-run arguments kept outside the experiment config proper.
#[derive(Clone, Debug)]
pub struct RunArgs {
    /// Root run directory; dataset files live under `<run_dir>/datasets`.
    pub run_dir: PathBuf,
    /// Directory receiving checkpoints and loss logs.
    pub log_dir: PathBuf,
    /// Directory receiving Langevin sample tensors.
    pub image_folder: PathBuf,
    pub seed: u64,
    /// Subset size for the transfer-baseline variants; ignored otherwise.
    pub subset_size: usize,
    pub use_accelerator: bool,
}
