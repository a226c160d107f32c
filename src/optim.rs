//! Optimizers with exportable state.
//!
//! Checkpoints hold the optimizer moments next to the network weights, so
//! both optimizers here keep their per-variable state as plain tensors that
//! can be dumped into and restored from a safetensors map. Variable order is
//! positional: callers must rebuild the optimizer over the same variable list
//! (same order) before restoring.

use std::collections::HashMap;

use candle::backprop::GradStore;
use candle::{Device, Result, Tensor, Var};
use candle_nn::Optimizer;

use crate::config::{OptimConfig, OptimizerKind};

#[derive(Clone, Debug)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    pub amsgrad: bool,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            amsgrad: false,
        }
    }
}

struct VarAdam {
    var: Var,
    m: Tensor,
    v: Tensor,
    v_max: Option<Tensor>,
}

/// Adam with L2 weight decay and optional AMSGrad.
pub struct Adam {
    vars: Vec<VarAdam>,
    params: ParamsAdam,
    t: usize,
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let vars = vars
            .into_iter()
            .map(|var| {
                let m = Tensor::zeros(var.shape(), var.dtype(), var.device())?;
                let v = m.clone();
                let v_max = if params.amsgrad { Some(m.clone()) } else { None };
                Ok(VarAdam { var, m, v, v_max })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, params, t: 0 })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.t += 1;
        let b1 = self.params.beta1;
        let b2 = self.params.beta2;
        let wd = self.params.weight_decay;
        // Bias corrections are folded into the scalar factors below.
        let bc1 = 1.0 - b1.powi(self.t as i32);
        let bc2 = 1.0 - b2.powi(self.t as i32);
        for s in self.vars.iter_mut() {
            let Some(grad) = grads.get(&s.var) else {
                continue;
            };
            let grad = if wd > 0.0 {
                grad.add(&s.var.as_tensor().affine(wd, 0.0)?)?
            } else {
                grad.clone()
            };
            s.m = s.m.affine(b1, 0.0)?.add(&grad.affine(1.0 - b1, 0.0)?)?;
            s.v = s.v.affine(b2, 0.0)?.add(&grad.sqr()?.affine(1.0 - b2, 0.0)?)?;
            let v_eff = match &s.v_max {
                Some(v_max) => {
                    let v_max = v_max.maximum(&s.v)?;
                    s.v_max = Some(v_max.clone());
                    v_max
                }
                None => s.v.clone(),
            };
            let denom = v_eff.affine(1.0 / bc2, 0.0)?.sqrt()?.affine(1.0, self.params.eps)?;
            let delta = s.m.div(&denom)?.affine(self.params.lr / bc1, 0.0)?;
            s.var.set(&s.var.as_tensor().sub(&delta)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

impl Adam {
    pub fn state(&self) -> Result<Vec<(String, Tensor)>> {
        let mut out = vec![("t".to_string(), Tensor::new(self.t as f32, &Device::Cpu)?)];
        for (i, s) in self.vars.iter().enumerate() {
            out.push((format!("m.{i}"), s.m.clone()));
            out.push((format!("v.{i}"), s.v.clone()));
            if let Some(v_max) = &s.v_max {
                out.push((format!("v_max.{i}"), v_max.clone()));
            }
        }
        Ok(out)
    }

    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        if let Some(t) = state.get("t") {
            self.t = t.to_dtype(candle::DType::F32)?.to_scalar::<f32>()? as usize;
        }
        for (i, s) in self.vars.iter_mut().enumerate() {
            if let Some(m) = state.get(&format!("m.{i}")) {
                s.m = m.to_device(s.var.device())?;
            }
            if let Some(v) = state.get(&format!("v.{i}")) {
                s.v = v.to_device(s.var.device())?;
            }
            if let Some(v_max) = state.get(&format!("v_max.{i}")) {
                s.v_max = Some(v_max.to_device(s.var.device())?);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            momentum: 0.9,
            weight_decay: 0.0,
        }
    }
}

struct VarSgd {
    var: Var,
    buf: Option<Tensor>,
}

/// Stochastic gradient descent with classical momentum.
pub struct Sgd {
    vars: Vec<VarSgd>,
    params: ParamsSgd,
}

impl Optimizer for Sgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let vars = vars.into_iter().map(|var| VarSgd { var, buf: None }).collect();
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let wd = self.params.weight_decay;
        let momentum = self.params.momentum;
        for s in self.vars.iter_mut() {
            let Some(grad) = grads.get(&s.var) else {
                continue;
            };
            let grad = if wd > 0.0 {
                grad.add(&s.var.as_tensor().affine(wd, 0.0)?)?
            } else {
                grad.clone()
            };
            let update = if momentum > 0.0 {
                let buf = match &s.buf {
                    Some(buf) => buf.affine(momentum, 0.0)?.add(&grad)?,
                    None => grad,
                };
                s.buf = Some(buf.clone());
                buf
            } else {
                grad
            };
            s.var
                .set(&s.var.as_tensor().sub(&update.affine(self.params.lr, 0.0)?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

impl Sgd {
    pub fn state(&self) -> Result<Vec<(String, Tensor)>> {
        let mut out = Vec::new();
        for (i, s) in self.vars.iter().enumerate() {
            if let Some(buf) = &s.buf {
                out.push((format!("buf.{i}"), buf.clone()));
            }
        }
        Ok(out)
    }

    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for (i, s) in self.vars.iter_mut().enumerate() {
            if let Some(buf) = state.get(&format!("buf.{i}")) {
                s.buf = Some(buf.to_device(s.var.device())?);
            }
        }
        Ok(())
    }
}

/// Optimizer chosen from the experiment config.
pub enum AnyOptimizer {
    Adam(Adam),
    Sgd(Sgd),
}

impl AnyOptimizer {
    pub fn from_config(config: &OptimConfig, vars: Vec<Var>) -> Result<Self> {
        match config.optimizer {
            OptimizerKind::Adam => Ok(Self::Adam(Adam::new(
                vars,
                ParamsAdam {
                    lr: config.lr,
                    beta1: config.beta1,
                    weight_decay: config.weight_decay,
                    amsgrad: config.amsgrad,
                    ..Default::default()
                },
            )?)),
            OptimizerKind::Sgd => Ok(Self::Sgd(Sgd::new(
                vars,
                ParamsSgd {
                    lr: config.lr,
                    momentum: 0.9,
                    weight_decay: config.weight_decay,
                },
            )?)),
        }
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            Self::Adam(opt) => opt.backward_step(loss),
            Self::Sgd(opt) => opt.backward_step(loss),
        }
    }

    pub fn state(&self) -> Result<Vec<(String, Tensor)>> {
        match self {
            Self::Adam(opt) => opt.state(),
            Self::Sgd(opt) => opt.state(),
        }
    }

    pub fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        match self {
            Self::Adam(opt) => opt.load_state(state),
            Self::Sgd(opt) => opt.load_state(state),
        }
    }
}
