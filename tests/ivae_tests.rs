use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_ebm::data::PairedDataset;
use candle_ebm::ivae::{gaussian_kl, reparameterize, train_ivae, IvaeConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const LN_2PI: f64 = 1.8378770664093453;

fn gaussian_log_density(z: f64, mean: f64, logvar: f64) -> f64 {
    -0.5 * (LN_2PI + logvar + (z - mean).powi(2) / logvar.exp())
}

#[test]
fn closed_form_kl_matches_numerical_integration() -> Result<()> {
    let device = Device::Cpu;
    let cases = [
        (0.0f64, 0.0f64, 0.0f64, 0.0f64),
        (0.3, -0.5, -0.7, 0.4),
        (1.2, 0.8, 0.0, -1.0),
        (-0.4, -2.0, 0.9, 1.5),
    ];
    for (mq, lq, mp, lp) in cases {
        let scalar = |v: f64| Tensor::new(&[[v as f32]], &device);
        let kl = gaussian_kl(&scalar(mq)?, &scalar(lq)?, &scalar(mp)?, &scalar(lp)?)?
            .to_vec1::<f32>()?[0] as f64;

        // Integrate q(z) log(q(z)/p(z)) on a grid wide enough to cover both
        // distributions.
        let sq = (lq.exp()).sqrt();
        let sp = (lp.exp()).sqrt();
        let lo = (mq - 10.0 * sq).min(mp - 10.0 * sp);
        let hi = (mq + 10.0 * sq).max(mp + 10.0 * sp);
        let n = 200_000;
        let h = (hi - lo) / n as f64;
        let mut acc = 0.0;
        for i in 0..n {
            let z = lo + (i as f64 + 0.5) * h;
            let log_q = gaussian_log_density(z, mq, lq);
            let log_p = gaussian_log_density(z, mp, lp);
            acc += h * log_q.exp() * (log_q - log_p);
        }
        assert!(
            (kl - acc).abs() < 1e-3,
            "closed form {kl} vs integrated {acc} for case ({mq}, {lq}, {mp}, {lp})"
        );
    }
    Ok(())
}

#[test]
fn reparameterization_statistics() -> Result<()> {
    let device = Device::Cpu;
    device.set_seed(1)?;
    let n = 200_000;
    let mean = Tensor::full(1.5f32, (n, 1), &device)?;
    let logvar = Tensor::full(0.25f32.ln(), (n, 1), &device)?;
    let z = reparameterize(&mean, &logvar)?.flatten_all()?.to_vec1::<f32>()?;

    let emp_mean = z.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let emp_var =
        z.iter().map(|&v| (v as f64 - emp_mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    assert!((emp_mean - 1.5).abs() < 0.02, "empirical mean {emp_mean}");
    assert!((emp_var - 0.25).abs() < 0.02, "empirical variance {emp_var}");
    Ok(())
}

/// Two well-separated 2-D Gaussian clusters with a one-hot auxiliary matrix.
fn two_cluster_data(n_per: usize, seed: u64, device: &Device) -> Result<(Tensor, Tensor, Vec<usize>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let centers = [(-2.0f32, -2.0f32), (2.0, 2.0)];
    let mut xs = Vec::with_capacity(n_per * 2 * 2);
    let mut us = Vec::with_capacity(n_per * 2 * 2);
    let mut labels = Vec::with_capacity(n_per * 2);
    for (label, (cx, cy)) in centers.into_iter().enumerate() {
        for _ in 0..n_per {
            // Box-Muller transform.
            let u1: f32 = rng.random::<f32>().max(1e-7);
            let u2: f32 = rng.random();
            let r = (-2.0 * u1.ln()).sqrt() * 0.3;
            let theta = 2.0 * std::f32::consts::PI * u2;
            xs.push(cx + r * theta.cos());
            xs.push(cy + r * theta.sin());
            us.push(if label == 0 { 1.0 } else { 0.0 });
            us.push(if label == 1 { 1.0 } else { 0.0 });
            labels.push(label);
        }
    }
    let n = n_per * 2;
    Ok((
        Tensor::from_vec(xs, (n, 2), device)?,
        Tensor::from_vec(us, (n, 2), device)?,
        labels,
    ))
}

#[test]
fn training_is_reproducible_for_a_fixed_seed() -> Result<()> {
    let device = Device::Cpu;
    let (x, u, _) = two_cluster_data(64, 3, &device)?;
    let config = IvaeConfig {
        batch_size: 32,
        max_iter: 50,
        seed: 7,
        ..Default::default()
    };
    let fit_a = train_ivae(&x, &u, &config)?;
    let fit_b = train_ivae(&x, &u, &config)?;
    let za = fit_a.z.flatten_all()?.to_vec1::<f32>()?;
    let zb = fit_b.z.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(za.len(), zb.len());
    for (a, b) in za.iter().zip(zb.iter()) {
        assert!((a - b).abs() < 1e-6, "latents diverged: {a} vs {b}");
    }
    Ok(())
}

fn silhouette(points: &[Vec<f32>], labels: &[usize]) -> f64 {
    let dist = |a: &[f32], b: &[f32]| -> f64 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| ((x - y) as f64).powi(2))
            .sum::<f64>()
            .sqrt()
    };
    let n = points.len();
    let mut total = 0.0;
    for i in 0..n {
        let mut same = Vec::new();
        let mut other = Vec::new();
        for j in 0..n {
            if i == j {
                continue;
            }
            let d = dist(&points[i], &points[j]);
            if labels[i] == labels[j] {
                same.push(d);
            } else {
                other.push(d);
            }
        }
        let a = same.iter().sum::<f64>() / same.len() as f64;
        let b = other.iter().sum::<f64>() / other.len() as f64;
        total += (b - a) / a.max(b);
    }
    total / n as f64
}

#[test]
fn latents_cluster_by_auxiliary_label() -> Result<()> {
    let device = Device::Cpu;
    let (x, u, labels) = two_cluster_data(200, 11, &device)?;
    let config = IvaeConfig {
        batch_size: 64,
        max_iter: 500,
        seed: 0,
        ..Default::default()
    };
    let fit = train_ivae(&x, &u, &config)?;
    let z = fit.z.to_vec2::<f32>()?;
    let score = silhouette(&z, &labels);
    assert!(score > 0.5, "silhouette score {score} too low");
    Ok(())
}

/// Degenerate sizes must fail up front instead of stalling the batch stream
/// or the training loop.
#[test]
fn degenerate_training_configs_fail_eagerly() -> Result<()> {
    let device = Device::Cpu;
    let (x, u, _) = two_cluster_data(8, 0, &device)?;

    let bad = IvaeConfig {
        batch_size: 0,
        ..Default::default()
    };
    let err = train_ivae(&x, &u, &bad).unwrap_err();
    assert!(err.to_string().contains("batch_size"), "{err}");

    let bad = IvaeConfig {
        max_iter: 1,
        final_pass_batch: Some(0),
        ..Default::default()
    };
    assert!(train_ivae(&x, &u, &bad).is_err());

    let empty_x = Tensor::zeros((0, 2), DType::F32, &device)?;
    let empty_u = Tensor::zeros((0, 2), DType::F32, &device)?;
    assert!(train_ivae(&empty_x, &empty_u, &IvaeConfig::default()).is_err());

    // The batch stream itself rejects a zero batch size.
    let dataset = PairedDataset::new(&x, &u)?;
    let mut rng = StdRng::seed_from_u64(0);
    assert!(dataset.shuffled_batches(0, &mut rng).is_err());
    Ok(())
}
