// Trains the conditional DSM model on the first 8 MNIST digit classes, then
// samples images from the learned score field with Langevin dynamics.

use anyhow::Result;
use candle_ebm::config::{Config, DataConfig, OptimConfig, RunArgs, TrainingConfig};
use candle_ebm::{DatasetKind, DsmRunner};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::new(
        DataConfig {
            dataset: DatasetKind::Mnist,
            image_size: 28,
            channels: 1,
            logit_transform: false,
            random_flip: false,
        },
        8,
        OptimConfig::default(),
        TrainingConfig {
            batch_size: 128,
            n_epochs: 500,
            n_iters: 5000,
            snapshot_freq: 500,
        },
    )?;
    let args = RunArgs {
        run_dir: "run".into(),
        log_dir: "run/logs".into(),
        image_folder: "run/samples".into(),
        seed: 0,
        subset_size: 0,
        use_accelerator: true,
    };

    let runner = DsmRunner::new(args, config)?;
    let losses = runner.train()?;
    println!("trained for {} steps, final loss {:?}", losses.len(), losses.last());

    runner.test()?;
    println!("wrote Langevin samples to run/samples");
    Ok(())
}
