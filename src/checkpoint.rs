//! Checkpoint persistence.
//!
//! A checkpoint is the ordered two-part record {network state, optimizer
//! state}, stored in a single safetensors file under `net.` and `opt.` key
//! prefixes. Files are written to a temporary sibling and renamed into place
//! so a crash mid-write never leaves a truncated checkpoint behind. The
//! label-indexed final-layer matrix has its own lifecycle and is persisted
//! separately, both as a raw tensor file and as a JSON object.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle::{Device, Result, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

const NET_PREFIX: &str = "net.";
const OPT_PREFIX: &str = "opt.";

pub struct Checkpoint {
    pub net: HashMap<String, Tensor>,
    pub opt: HashMap<String, Tensor>,
}

impl Checkpoint {
    /// Snapshot the network variables and optimizer state tensors.
    pub fn from_parts(varmap: &VarMap, opt_state: Vec<(String, Tensor)>) -> Self {
        let net = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        let opt = opt_state.into_iter().collect();
        Self { net, opt }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = HashMap::with_capacity(self.net.len() + self.opt.len());
        for (name, tensor) in &self.net {
            tensors.insert(format!("{NET_PREFIX}{name}"), tensor.clone());
        }
        for (name, tensor) in &self.opt {
            tensors.insert(format!("{OPT_PREFIX}{name}"), tensor.clone());
        }
        atomic_save(&tensors, path)
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let tensors = candle::safetensors::load(path, device)?;
        let mut net = HashMap::new();
        let mut opt = HashMap::new();
        for (name, tensor) in tensors {
            if let Some(name) = name.strip_prefix(NET_PREFIX) {
                net.insert(name.to_string(), tensor);
            } else if let Some(name) = name.strip_prefix(OPT_PREFIX) {
                opt.insert(name.to_string(), tensor);
            } else {
                candle::bail!("unexpected checkpoint key {name:?} in {path:?}");
            }
        }
        Ok(Self { net, opt })
    }

    /// Copy the stored network state into an existing variable map.
    pub fn restore_varmap(&self, varmap: &VarMap) -> Result<()> {
        let vars = varmap.data().lock().unwrap();
        for (name, var) in vars.iter() {
            match self.net.get(name) {
                Some(tensor) => var.set(&tensor.to_device(var.device())?)?,
                None => candle::bail!("checkpoint is missing network tensor {name:?}"),
            }
        }
        Ok(())
    }
}

fn atomic_save(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(candle::Error::wrap)?;
    }
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    candle::safetensors::save(tensors, &tmp)?;
    fs::rename(&tmp, path).map_err(candle::Error::wrap)
}

#[derive(Serialize, Deserialize)]
struct FinalLayerRecord {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Persist the final-layer weights as `final_layer.safetensors` plus a
/// `final_layer.json` twin for consumers without a safetensors reader.
pub fn save_final_layer(weights: &Tensor, dir: &Path) -> Result<()> {
    let mut tensors = HashMap::new();
    tensors.insert("final_layer".to_string(), weights.clone());
    atomic_save(&tensors, &dir.join("final_layer.safetensors"))?;

    let record = FinalLayerRecord {
        shape: weights.dims().to_vec(),
        data: weights.flatten_all()?.to_vec1::<f32>()?,
    };
    let json = serde_json::to_string(&record).map_err(candle::Error::wrap)?;
    fs::write(dir.join("final_layer.json"), json).map_err(candle::Error::wrap)
}

pub fn load_final_layer(dir: &Path, device: &Device) -> Result<Tensor> {
    let tensors = candle::safetensors::load(dir.join("final_layer.safetensors"), device)?;
    match tensors.get("final_layer") {
        Some(tensor) => Ok(tensor.clone()),
        None => candle::bail!("final_layer.safetensors has no final_layer tensor"),
    }
}

/// Per-step loss log for the transfer-baseline runs, keyed by subset size and
/// seed in the file name.
pub fn save_loss_log(losses: &[f32], dir: &Path, subset_size: usize, seed: u64) -> Result<()> {
    fs::create_dir_all(dir).map_err(candle::Error::wrap)?;
    let path = dir.join(format!("baseline_size{subset_size}_seed{seed}.json"));
    let json = serde_json::to_string(losses).map_err(candle::Error::wrap)?;
    fs::write(path, json).map_err(candle::Error::wrap)
}

/// One Langevin snapshot, reshaped to image form, per file.
pub fn save_samples(samples: &Tensor, dir: &Path, step: usize) -> Result<()> {
    let mut tensors = HashMap::new();
    tensors.insert("samples".to_string(), samples.clone());
    atomic_save(&tensors, &dir.join(format!("samples_{step}.safetensors")))
}
