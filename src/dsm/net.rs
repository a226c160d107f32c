//! Dilated convolutional score network.
//!
//! Maps a (N, C, H, W) batch to a score field of the same shape. The body is
//! a stack of residual 3x3 blocks whose dilation widens then narrows again,
//! so every output pixel sees a large receptive field without any loss of
//! resolution (padding always equals the dilation).

use candle::{DType, Device, Result, Tensor, Var};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder, VarMap};

/// Anything that evaluates a score field for a batch of images. The Langevin
/// sampler and the DSM objective are both generic over this.
pub trait ScoreModel {
    fn score(&self, x: &Tensor) -> Result<Tensor>;
}

const DILATIONS: [usize; 5] = [1, 2, 4, 2, 1];

pub struct DilatedScoreNet {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
    varmap: VarMap,
}

impl DilatedScoreNet {
    pub fn new(channels: usize, features: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let cfg = |dilation: usize| Conv2dConfig {
            padding: dilation,
            dilation,
            ..Default::default()
        };
        let conv_in = conv2d(channels, features, 3, cfg(1), vb.pp("in"))?;
        let mut blocks = Vec::with_capacity(DILATIONS.len());
        for (i, dilation) in DILATIONS.into_iter().enumerate() {
            blocks.push(conv2d(features, features, 3, cfg(dilation), vb.pp(format!("b{i}")))?);
        }
        let conv_out = conv2d(features, channels, 3, cfg(1), vb.pp("out"))?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
            varmap,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Trainable variables in name order (positional optimizer state relies
    /// on a stable ordering).
    pub fn parameters(&self) -> Vec<Var> {
        let vars = self.varmap.data().lock().unwrap();
        let mut names: Vec<&String> = vars.keys().collect();
        names.sort();
        names.iter().map(|name| vars[*name].clone()).collect()
    }
}

impl Module for DilatedScoreNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = self.conv_in.forward(xs)?;
        for block in &self.blocks {
            xs = xs.add(&block.forward(&xs.elu(1.0)?)?)?;
        }
        self.conv_out.forward(&xs.elu(1.0)?)
    }
}

impl ScoreModel for DilatedScoreNet {
    fn score(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }
}
