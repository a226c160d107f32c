//! Conditional DSM experiment runner.
//!
//! `train` resolves the configured dataset variant once, filters it down to
//! the requested label segments, and drives the score network plus the
//! label-indexed final layer through the DSM objective, checkpointing on a
//! fixed step cadence. `test` restores the latest checkpoint and runs the
//! Langevin sampler from pure noise, persisting one snapshot per step.

use std::fs;

use candle::{DType, Device, Result, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::checkpoint::{
    load_final_layer, save_final_layer, save_loss_log, save_samples, Checkpoint,
};
use crate::config::{Config, RunArgs};
use crate::data::{
    dequantize, logit_transform, random_horizontal_flip, resolve_dataset, LabeledImages,
};
use crate::device::select_device;
use crate::dsm::loss::{conditional_dsm, shift_labels};
use crate::dsm::net::DilatedScoreNet;
use crate::dsm::sampler::langevin_dynamics;
use crate::optim::AnyOptimizer;

/// Noise scale of the DSM perturbation kernel.
const SIGMA: f64 = 0.01;
/// Bias of the logit transform.
const LOGIT_LAM: f64 = 1e-6;
/// Feature width of the score network.
const SCORE_FEATURES: usize = 32;
/// Langevin schedule used by `test`.
const SAMPLE_BATCH: usize = 100;
const SAMPLE_STEPS: usize = 1000;
const SAMPLE_STEP_LR: f64 = 2e-5;

pub struct DsmRunner {
    args: RunArgs,
    config: Config,
    device: Device,
}

impl DsmRunner {
    /// Validates the configuration eagerly; an unknown or inconsistent value
    /// fails here, not at first use.
    pub fn new(args: RunArgs, config: Config) -> Result<Self> {
        config.validate().map_err(candle::Error::wrap)?;
        let device = select_device(args.use_accelerator)?;
        info!(n_labels = config.n_labels, "conditional DSM runner");
        Ok(Self {
            args,
            config,
            device,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load and filter the configured dataset, then train on it. Returns the
    /// per-step losses.
    pub fn train(&self) -> Result<Vec<f32>> {
        let source = resolve_dataset(
            self.config.data.dataset,
            self.config.n_labels,
            self.args.subset_size,
        );
        let data = source.load(
            &self.args.run_dir,
            self.config.data.image_size,
            self.config.data.channels,
            &self.device,
        )?;
        self.train_on(&data)
    }

    /// Train on an already-materialized corpus. Split out from [`train`] so
    /// synthetic in-memory datasets can be driven through the same loop.
    pub fn train_on(&self, data: &LabeledImages) -> Result<Vec<f32>> {
        self.run(data, false)
    }

    /// Continue a previous run: restores the network, the final layer and the
    /// optimizer moments from the latest checkpoint in `log_dir`, then trains
    /// until the iteration budget. Returns only the losses of the new steps.
    pub fn resume(&self) -> Result<Vec<f32>> {
        let source = resolve_dataset(
            self.config.data.dataset,
            self.config.n_labels,
            self.args.subset_size,
        );
        let data = source.load(
            &self.args.run_dir,
            self.config.data.image_size,
            self.config.data.channels,
            &self.device,
        )?;
        self.resume_on(&data)
    }

    /// In-memory counterpart of [`resume`].
    pub fn resume_on(&self, data: &LabeledImages) -> Result<Vec<f32>> {
        self.run(data, true)
    }

    fn run(&self, data: &LabeledImages, resume: bool) -> Result<Vec<f32>> {
        self.device.set_seed(self.args.seed)?;
        let mut rng = StdRng::seed_from_u64(self.args.seed);

        let image_size = self.config.data.image_size;
        let net = DilatedScoreNet::new(self.config.data.channels, SCORE_FEATURES, &self.device)?;
        // The final layer is label-indexed, so it lives outside the network's
        // own parameter set but joins the same optimizer.
        let final_layer = Var::ones(
            (image_size * image_size, self.config.n_labels),
            DType::F32,
            &self.device,
        )?;
        let mut params = net.parameters();
        params.push(final_layer.clone());
        let mut optimizer = AnyOptimizer::from_config(&self.config.optim, params)?;

        let transfer_baseline = self.config.data.dataset.is_transfer_baseline();
        let mut step = 0usize;
        if resume {
            let checkpoint =
                Checkpoint::load(&self.args.log_dir.join("checkpoint.safetensors"), &self.device)?;
            checkpoint.restore_varmap(net.varmap())?;
            final_layer.set(&load_final_layer(&self.args.log_dir, &self.device)?)?;
            optimizer.load_state(&checkpoint.opt)?;
            // Adam records its step counter in the state; without it the step
            // numbering restarts and old numbered checkpoints get rewritten.
            if let Some(t) = checkpoint.opt.get("t") {
                step = t.to_dtype(DType::F32)?.to_scalar::<f32>()? as usize;
            }
            info!(step, "resumed from checkpoint");
        }
        let mut losses = Vec::new();
        if step >= self.config.training.n_iters {
            info!(step, "iteration budget already reached");
            return Ok(losses);
        }
        'training: for epoch in 0..self.config.training.n_epochs {
            let batches =
                data.shuffled_batches(self.config.training.batch_size, transfer_baseline, &mut rng)?;
            for batch in batches {
                step += 1;
                let mut x = dequantize(&batch.images)?;
                if self.config.data.logit_transform {
                    x = logit_transform(&x, LOGIT_LAM)?;
                }
                if self.config.data.random_flip {
                    x = random_horizontal_flip(&x, &mut rng)?;
                }
                let y = shift_labels(&batch.labels)?;
                let loss = conditional_dsm(&net, &x, &y, final_layer.as_tensor(), SIGMA)?;
                optimizer.backward_step(&loss)?;
                let loss_val = loss.to_scalar::<f32>()?;
                debug!(step, epoch, loss = loss_val, "dsm step");
                losses.push(loss_val);

                if step % self.config.training.snapshot_freq == 0 {
                    self.write_snapshot(step, &net, &optimizer, &final_layer, &losses)?;
                }
                if step >= self.config.training.n_iters {
                    break 'training;
                }
            }
        }
        info!(steps = step, "dsm training finished");
        Ok(losses)
    }

    fn write_snapshot(
        &self,
        step: usize,
        net: &DilatedScoreNet,
        optimizer: &AnyOptimizer,
        final_layer: &Var,
        losses: &[f32],
    ) -> Result<()> {
        let checkpoint = Checkpoint::from_parts(net.varmap(), optimizer.state()?);
        checkpoint.save(&self.args.log_dir.join(format!("checkpoint_{step}.safetensors")))?;
        checkpoint.save(&self.args.log_dir.join("checkpoint.safetensors"))?;
        save_final_layer(final_layer.as_tensor(), &self.args.log_dir)?;
        if self.config.data.dataset.is_transfer_baseline() {
            save_loss_log(losses, &self.args.log_dir, self.args.subset_size, self.args.seed)?;
        }
        info!(step, "wrote checkpoint");
        Ok(())
    }

    /// Restore the latest checkpoint and sample images from pure noise with
    /// Langevin dynamics, persisting one snapshot tensor per step.
    pub fn test(&self) -> Result<()> {
        let checkpoint =
            Checkpoint::load(&self.args.log_dir.join("checkpoint.safetensors"), &self.device)?;
        let net = DilatedScoreNet::new(self.config.data.channels, SCORE_FEATURES, &self.device)?;
        checkpoint.restore_varmap(net.varmap())?;

        self.device.set_seed(self.args.seed)?;
        let image_size = self.config.data.image_size;
        let x0 = Tensor::rand(
            0f32,
            1f32,
            (SAMPLE_BATCH, self.config.data.channels, image_size, image_size),
            &self.device,
        )?;
        let snapshots = langevin_dynamics(&x0, &net, SAMPLE_STEPS, SAMPLE_STEP_LR)?;

        fs::create_dir_all(&self.args.image_folder).map_err(candle::Error::wrap)?;
        for (i, snapshot) in snapshots.into_iter().enumerate() {
            let sample = if self.config.data.logit_transform {
                candle_nn::ops::sigmoid(&snapshot)?
            } else {
                snapshot
            };
            save_samples(&sample, &self.args.image_folder, i)?;
        }
        Ok(())
    }
}
