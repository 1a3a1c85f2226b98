//! Linear projection with an optional trainable low-rank branch

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{init::Init, Dropout, Linear, VarBuilder};

use super::LoraConfig;

/// Prefix under which adapter tensors are stored
pub const ADAPTER_PREFIX: &str = "base_model.model";

/// Key of the `A` or `B` matrix of the adapter on `module_path`
/// (e.g. `model.layers.0.self_attn.q_proj`).
pub fn adapter_key(module_path: &str, matrix: &str) -> String {
    format!("{ADAPTER_PREFIX}.{module_path}.{matrix}.weight")
}

struct LoraBranch {
    /// `r × in`
    a: Tensor,
    /// `out × r`
    b: Tensor,
    scale: f64,
    dropout: Dropout,
}

/// A frozen linear layer, optionally augmented with `scale · B(A(dropout(x)))`.
///
/// Adapter matrices are f32 `Var`s owned by the `VarMap` behind `lora_vb`;
/// the branch runs in f32 and is cast back to the base layer's dtype.
pub struct LoraLinear {
    base: Linear,
    branch: Option<LoraBranch>,
}

impl LoraLinear {
    /// Wrap `base`, creating adapter variables when `name` is targeted.
    ///
    /// `A` uses a uniform init with bound `1/sqrt(in)` and `B` starts at zero,
    /// so a fresh adapter leaves the layer output unchanged.
    pub fn new(base: Linear, name: &str, config: &LoraConfig, lora_vb: VarBuilder) -> Result<Self> {
        if !config.targets(name) {
            return Ok(Self { base, branch: None });
        }

        let (out_dim, in_dim) = base.weight().dims2()?;
        let bound = 1.0 / (in_dim as f64).sqrt();
        let a = lora_vb.pp("lora_A").get_with_hints(
            (config.r, in_dim),
            "weight",
            Init::Uniform { lo: -bound, up: bound },
        )?;
        let b = lora_vb
            .pp("lora_B")
            .get_with_hints((out_dim, config.r), "weight", Init::Const(0.0))?;

        Ok(Self {
            base,
            branch: Some(LoraBranch {
                a,
                b,
                scale: config.scaling(),
                dropout: Dropout::new(config.lora_dropout),
            }),
        })
    }

    pub fn has_adapter(&self) -> bool {
        self.branch.is_some()
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.base.forward(xs)?;
        let Some(branch) = &self.branch else {
            return Ok(out);
        };

        let h = branch.dropout.forward(&xs.to_dtype(DType::F32)?, train)?;
        let h = h
            .broadcast_matmul(&branch.a.t()?)?
            .broadcast_matmul(&branch.b.t()?)?;
        let h = (h * branch.scale)?.to_dtype(out.dtype())?;
        out + h
    }

    /// Base weight with the adapter folded in: `W + scale · B·A`
    pub fn merged_weight(&self) -> Result<Tensor> {
        let weight = self.base.weight();
        match &self.branch {
            None => Ok(weight.clone()),
            Some(branch) => merge_delta(weight, &branch.a, &branch.b, branch.scale),
        }
    }
}

impl Module for LoraLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, false)
    }
}

/// `weight + scale · b·a`, computed in f32 and returned in `weight`'s dtype
pub fn merge_delta(weight: &Tensor, a: &Tensor, b: &Tensor, scale: f64) -> Result<Tensor> {
    let dtype = weight.dtype();
    let delta = (b.to_dtype(DType::F32)?.matmul(&a.to_dtype(DType::F32)?)? * scale)?;
    (weight.to_dtype(DType::F32)? + delta.to_device(weight.device())?)?.to_dtype(dtype)
}
