//! Dataset adapters.
//!
//! Both trainers consume whole tensors held in memory and slice shuffled
//! batches out of them with `index_select`/`narrow`. Shuffling is driven by a
//! caller-owned seeded rng so a fixed seed reproduces the exact batch stream.

use std::path::Path;

use candle::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

use crate::config::{BaseDataset, DatasetKind};

/// Paired observation/auxiliary rows for the iVAE.
pub struct PairedDataset {
    x: Tensor,
    u: Tensor,
    n: usize,
    data_dim: usize,
    aux_dim: usize,
}

pub struct PairedBatch {
    pub x: Tensor,
    pub u: Tensor,
}

impl PairedDataset {
    /// Wrap an N x D observation matrix and its N x K auxiliary matrix.
    pub fn new(x: &Tensor, u: &Tensor) -> Result<Self> {
        let (n, data_dim) = x.dims2()?;
        let (n_u, aux_dim) = u.dims2()?;
        if n != n_u {
            candle::bail!("X has {n} rows but U has {n_u}");
        }
        Ok(Self {
            x: x.to_dtype(DType::F32)?,
            u: u.to_dtype(DType::F32)?,
            n,
            data_dim,
            aux_dim,
        })
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn data_dim(&self) -> usize {
        self.data_dim
    }

    pub fn aux_dim(&self) -> usize {
        self.aux_dim
    }

    pub fn tensors(&self) -> (&Tensor, &Tensor) {
        (&self.x, &self.u)
    }

    /// One epoch of batches over a fresh row permutation. The final partial
    /// batch is kept.
    pub fn shuffled_batches(&self, batch_size: usize, rng: &mut StdRng) -> Result<Vec<PairedBatch>> {
        if batch_size == 0 {
            candle::bail!("batch size must be positive")
        }
        let (xs, us) = {
            let perm = permutation(self.n, self.x.device(), rng)?;
            (
                self.x.index_select(&perm, 0)?,
                self.u.index_select(&perm, 0)?,
            )
        };
        let mut batches = Vec::with_capacity(self.n.div_ceil(batch_size));
        let mut start = 0;
        while start < self.n {
            let len = batch_size.min(self.n - start);
            batches.push(PairedBatch {
                x: xs.narrow(0, start, len)?,
                u: us.narrow(0, start, len)?,
            });
            start += len;
        }
        Ok(batches)
    }
}

/// An image corpus with integer labels, held as (N, C, H, W) f32 in [0, 1]
/// plus an N-length u32 label vector.
#[derive(Clone)]
pub struct LabeledImages {
    pub images: Tensor,
    pub labels: Tensor,
}

pub struct LabeledBatch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl LabeledImages {
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self> {
        let n = images.dim(0)?;
        let n_labels = labels.dims1()?;
        if n != n_labels {
            candle::bail!("{n} images but {n_labels} labels");
        }
        Ok(Self {
            images,
            labels: labels.to_dtype(DType::U32)?,
        })
    }

    pub fn len(&self) -> Result<usize> {
        self.images.dim(0)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Keep only the samples whose label satisfies the predicate. This is the
    /// collation-time filter that trains on a label subset without touching
    /// the dataset itself.
    pub fn retain_labels(&self, keep: impl Fn(u32) -> bool) -> Result<Self> {
        let labels = self.labels.to_vec1::<u32>()?;
        let idx: Vec<u32> = labels
            .iter()
            .enumerate()
            .filter(|(_, &y)| keep(y))
            .map(|(i, _)| i as u32)
            .collect();
        let kept = idx.len();
        let idx = Tensor::from_vec(idx, (kept,), self.images.device())?;
        Ok(Self {
            images: self.images.index_select(&idx, 0)?,
            labels: self.labels.index_select(&idx, 0)?,
        })
    }

    /// First `n` samples, like a fixed-range subset of the source split.
    pub fn take(&self, n: usize) -> Result<Self> {
        let n = n.min(self.len()?);
        Ok(Self {
            images: self.images.narrow(0, 0, n)?,
            labels: self.labels.narrow(0, 0, n)?,
        })
    }

    /// One epoch of batches over a fresh sample permutation.
    pub fn shuffled_batches(
        &self,
        batch_size: usize,
        drop_last: bool,
        rng: &mut StdRng,
    ) -> Result<Vec<LabeledBatch>> {
        if batch_size == 0 {
            candle::bail!("batch size must be positive")
        }
        let n = self.len()?;
        let perm = permutation(n, self.images.device(), rng)?;
        let images = self.images.index_select(&perm, 0)?;
        let labels = self.labels.index_select(&perm, 0)?;
        let mut batches = Vec::with_capacity(n.div_ceil(batch_size));
        let mut start = 0;
        while start < n {
            let len = batch_size.min(n - start);
            if drop_last && len < batch_size {
                break;
            }
            batches.push(LabeledBatch {
                images: images.narrow(0, start, len)?,
                labels: labels.narrow(0, start, len)?,
            });
            start += len;
        }
        Ok(batches)
    }
}

fn permutation(n: usize, device: &Device, rng: &mut StdRng) -> Result<Tensor> {
    let mut idx: Vec<u32> = (0..n as u32).collect();
    idx.shuffle(rng);
    Tensor::from_vec(idx, (n,), device)
}

/// Which labels a training run keeps.
#[derive(Clone, Copy, Debug)]
pub enum LabelFilter {
    /// Labels in `[0, n_seg)`.
    FirstN(u32),
    /// Labels in `[n_seg, n_total)` -- the complement used by the
    /// transfer-baseline runs.
    Complement { n_seg: u32, n_total: u32 },
}

impl LabelFilter {
    pub fn keeps(&self, label: u32) -> bool {
        match *self {
            Self::FirstN(n) => label < n,
            Self::Complement { n_seg, n_total } => label >= n_seg && label < n_total,
        }
    }
}

/// A dataset variant resolved into a normalized source: which corpus, which
/// split, an optional fixed-size subset, and the label filter to apply.
#[derive(Clone, Copy, Debug)]
pub struct DataSource {
    pub base: BaseDataset,
    pub train_split: bool,
    pub subset: Option<usize>,
    pub filter: LabelFilter,
}

/// Resolve a [`DatasetKind`] once, up front, so the training loop never
/// branches on dataset names again.
pub fn resolve_dataset(kind: DatasetKind, n_seg: usize, subset_size: usize) -> DataSource {
    let n_seg = n_seg as u32;
    if kind.is_transfer_baseline() {
        DataSource {
            base: kind.base(),
            train_split: false,
            subset: Some(subset_size),
            filter: LabelFilter::Complement { n_seg, n_total: 10 },
        }
    } else {
        DataSource {
            base: kind.base(),
            train_split: true,
            subset: None,
            filter: LabelFilter::FirstN(n_seg),
        }
    }
}

impl DataSource {
    /// Load the corpus, normalize it to (N, C, H, W), and apply the subset
    /// and label filter. Download/caching is delegated to `candle-datasets`.
    pub fn load(
        &self,
        run_dir: &Path,
        image_size: usize,
        channels: usize,
        device: &Device,
    ) -> Result<LabeledImages> {
        let raw = match self.base {
            BaseDataset::Mnist => candle_datasets::vision::mnist::load()?,
            BaseDataset::Cifar10 => {
                candle_datasets::vision::cifar::load_dir(run_dir.join("datasets/cifar10"))?
            }
            // FashionMNIST ships in the same IDX layout as MNIST.
            BaseDataset::FashionMnist => {
                candle_datasets::vision::mnist::load_dir(run_dir.join("datasets/fashion_mnist"))?
            }
        };
        let (images, labels) = if self.train_split {
            (raw.train_images, raw.train_labels)
        } else {
            (raw.test_images, raw.test_labels)
        };
        let n = images.dim(0)?;
        let expected = n * channels * image_size * image_size;
        if images.elem_count() != expected {
            candle::bail!(
                "dataset shape {:?} does not match {channels}x{image_size}x{image_size} images",
                images.shape()
            );
        }
        let images = images
            .reshape((n, channels, image_size, image_size))?
            .to_dtype(DType::F32)?
            .to_device(device)?;
        let labels = labels.to_dtype(DType::U32)?.to_device(device)?;
        let mut data = LabeledImages::new(images, labels)?;
        if let Some(subset) = self.subset {
            data = data.take(subset)?;
        }
        let filter = self.filter;
        let data = data.retain_labels(|y| filter.keeps(y))?;
        info!(
            samples = data.len()?,
            base = ?self.base,
            train_split = self.train_split,
            "loaded dataset"
        );
        Ok(data)
    }
}

/// Add uniform sub-pixel noise so intensities can be modeled by a continuous
/// density: `x * 255/256 + U[0, 1)/256`.
pub fn dequantize(x: &Tensor) -> Result<Tensor> {
    let noise = x.rand_like(0.0, 1.0)?;
    x.affine(255.0 / 256.0, 0.0)?
        .add(&noise.affine(1.0 / 256.0, 0.0)?)
}

/// Biased logit transform mapping [0, 1] intensities to an unbounded domain:
/// `logit(lam + (1 - 2 lam) x)`.
pub fn logit_transform(x: &Tensor, lam: f64) -> Result<Tensor> {
    let x = x.affine(1.0 - 2.0 * lam, lam)?;
    x.log()?.sub(&x.affine(-1.0, 1.0)?.log()?)
}

/// Reverse the width axis of a (N, C, H, W) batch with probability 1/2.
pub fn random_horizontal_flip(x: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    if !rng.random_bool(0.5) {
        return Ok(x.clone());
    }
    let w = x.dim(3)?;
    let rev: Vec<u32> = (0..w as u32).rev().collect();
    let rev = Tensor::from_vec(rev, (w,), x.device())?;
    x.index_select(&rev, 3)
}
