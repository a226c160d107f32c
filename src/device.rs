//! Execution-context selection.
//!
//! The device is chosen exactly once, at startup, and threaded explicitly
//! into every component that allocates tensors. There is no per-call
//! CPU/accelerator dispatch anywhere else in the crate.

use candle::{Device, Result};
use tracing::info;

/// Pick the accelerator when requested and available, otherwise the CPU.
pub fn select_device(use_accelerator: bool) -> Result<Device> {
    let device = if use_accelerator {
        Device::cuda_if_available(0)?
    } else {
        Device::Cpu
    };
    info!(?device, "selected execution device");
    Ok(device)
}
