//! Qwen2 decoder with LoRA-wrappable projections
//!
//! The forward pass is built only from primitive tensor ops so gradients flow
//! from the loss back to the adapter matrices. Base weights are memory-mapped
//! and never tracked; only the adapter `Var`s receive gradients. There is no
//! KV cache: this model is for training, generation uses the stock
//! `candle_transformers` implementation on merged weights.

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Activation, Embedding, Linear, VarBuilder};
use candle_transformers::models::qwen2::Config;

use crate::lora::{LoraConfig, LoraLinear};

struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self { weight: vb.get(size, "weight")?, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(mean + self.eps)?.sqrt()?)?;
        x.to_dtype(dtype)?.broadcast_mul(&self.weight)
    }
}

/// Precomputed rotary tables, `[max_seq_len, head_dim / 2]`
struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(cfg: &Config, max_seq_len: usize, dtype: DType, device: &Device) -> Result<Self> {
        let head_dim = cfg.hidden_size / cfg.num_attention_heads;
        let max_seq_len = max_seq_len.min(cfg.max_position_embeddings);

        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / cfg.rope_theta.powf(i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    /// Rotate `[batch, heads, seq, head_dim]` by position
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _h, seq_len, head_dim) = x.dims4()?;
        let half = head_dim / 2;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        let cos = self.cos.narrow(0, 0, seq_len)?;

        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let rotated_x1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let rotated_x2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
        Tensor::cat(&[rotated_x1, rotated_x2], D::Minus1)
    }
}

struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    hidden_size: usize,
}

impl Attention {
    fn new(cfg: &Config, lora: &LoraConfig, vb: VarBuilder, lora_vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let head_dim = hidden / cfg.num_attention_heads;
        let kv_dim = cfg.num_key_value_heads * head_dim;

        let proj = |name: &str, out_dim: usize, bias: bool| -> Result<LoraLinear> {
            let base = if bias {
                candle_nn::linear(hidden, out_dim, vb.pp(name))?
            } else {
                candle_nn::linear_no_bias(hidden, out_dim, vb.pp(name))?
            };
            LoraLinear::new(base, name, lora, lora_vb.pp(name))
        };

        Ok(Self {
            q_proj: proj("q_proj", cfg.num_attention_heads * head_dim, true)?,
            k_proj: proj("k_proj", kv_dim, true)?,
            v_proj: proj("v_proj", kv_dim, true)?,
            o_proj: proj("o_proj", hidden, false)?,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads,
            head_dim,
            hidden_size: hidden,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        rotary: &RotaryEmbedding,
        mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (b, s, _) = xs.dims3()?;

        let heads = |t: Tensor, n: usize| -> Result<Tensor> {
            t.reshape((b, s, n, self.head_dim))?.transpose(1, 2)?.contiguous()
        };
        let q = heads(self.q_proj.forward_t(xs, train)?, self.num_heads)?;
        let k = heads(self.k_proj.forward_t(xs, train)?, self.num_kv_heads)?;
        let v = heads(self.v_proj.forward_t(xs, train)?, self.num_kv_heads)?;

        let q = rotary.apply(&q)?;
        let k = rotary.apply(&k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? * scale)?.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?
            .to_dtype(v.dtype())?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, s, self.hidden_size))?;
        self.o_proj.forward_t(&out, train)
    }
}

struct Mlp {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
    act: Activation,
}

impl Mlp {
    fn new(cfg: &Config, lora: &LoraConfig, vb: VarBuilder, lora_vb: VarBuilder) -> Result<Self> {
        let (hidden, inter) = (cfg.hidden_size, cfg.intermediate_size);
        let proj = |name: &str, in_dim: usize, out_dim: usize| -> Result<LoraLinear> {
            let base = candle_nn::linear_no_bias(in_dim, out_dim, vb.pp(name))?;
            LoraLinear::new(base, name, lora, lora_vb.pp(name))
        };
        Ok(Self {
            gate_proj: proj("gate_proj", hidden, inter)?,
            up_proj: proj("up_proj", hidden, inter)?,
            down_proj: proj("down_proj", inter, hidden)?,
            act: cfg.hidden_act,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let gate = self.act.forward(&self.gate_proj.forward_t(xs, train)?)?;
        let up = self.up_proj.forward_t(xs, train)?;
        self.down_proj.forward_t(&(gate * up)?, train)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(cfg: &Config, lora: &LoraConfig, vb: VarBuilder, lora_vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(cfg, lora, vb.pp("self_attn"), lora_vb.pp("self_attn"))?,
            mlp: Mlp::new(cfg, lora, vb.pp("mlp"), lora_vb.pp("mlp"))?,
            input_layernorm: RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RmsNorm::new(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(&self, xs: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor, train: bool) -> Result<Tensor> {
        let residual = xs;
        let h = self.input_layernorm.forward(xs)?;
        let h = (self.self_attn.forward(&h, rotary, mask, train)? + residual)?;
        let residual = &h;
        let out = self.mlp.forward_t(&self.post_attention_layernorm.forward(&h)?, train)?;
        out + residual
    }
}

/// Qwen2 causal language model with trainable adapters
pub struct Qwen2ForTraining {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    max_seq_len: usize,
    dtype: DType,
    device: Device,
}

impl Qwen2ForTraining {
    /// Build the model.
    ///
    /// `vb` resolves base checkpoint tensors (`model.layers.{i}...`); adapter
    /// variables are created through `lora_vb` under the same module paths.
    pub fn new(
        cfg: &Config,
        lora: &LoraConfig,
        max_seq_len: usize,
        vb: VarBuilder,
        lora_vb: VarBuilder,
    ) -> Result<Self> {
        let dtype = vb.dtype();
        let device = vb.device().clone();
        let vb_m = vb.pp("model");
        let lora_m = lora_vb.pp("model");

        let embed_tokens = candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb_m.pp("embed_tokens"))?;

        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(DecoderLayer::new(
                cfg,
                lora,
                vb_m.pp("layers").pp(i),
                lora_m.pp("layers").pp(i),
            )?);
        }

        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };

        let max_seq_len = max_seq_len.min(cfg.max_position_embeddings);
        let rotary = RotaryEmbedding::new(cfg, max_seq_len, dtype, &device)?;

        let adapted = layers
            .iter()
            .flat_map(|l| {
                let (a, m) = (&l.self_attn, &l.mlp);
                [&a.q_proj, &a.k_proj, &a.v_proj, &a.o_proj, &m.gate_proj, &m.up_proj, &m.down_proj]
            })
            .filter(|p| p.has_adapter())
            .count();
        tracing::debug!("Built Qwen2 with {} layers, {} adapted projections", layers.len(), adapted);

        Ok(Self { embed_tokens, layers, norm, lm_head, rotary, max_seq_len, dtype, device })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Logits for every position, `[batch, seq, vocab]` in f32.
    ///
    /// Sequences are right padded, so the causal mask alone keeps real tokens
    /// from attending to padding.
    pub fn forward_t(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_seq_len {
            candle_core::bail!("sequence length {seq_len} exceeds {}", self.max_seq_len);
        }

        let mask = causal_mask(seq_len, self.dtype, &self.device)?;
        let mut xs = self.embed_tokens.forward(input_ids)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &self.rotary, &mask, train)?;
        }
        self.norm.forward(&xs)?.apply(&self.lm_head)?.to_dtype(DType::F32)
    }
}

fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_slice(&mask, (seq_len, seq_len), device)?.to_dtype(dtype)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::lora::ADAPTER_PREFIX;
    use candle_nn::{Optimizer, VarMap};
    use std::collections::HashMap;

    pub(crate) fn tiny_config() -> Config {
        serde_json::from_value(serde_json::json!({
            "vocab_size": 32,
            "hidden_size": 16,
            "intermediate_size": 32,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "max_position_embeddings": 64,
            "sliding_window": 64,
            "max_window_layers": 2,
            "tie_word_embeddings": false,
            "rope_theta": 10000.0,
            "rms_norm_eps": 1e-6,
            "use_sliding_window": false,
            "hidden_act": "silu"
        }))
        .unwrap()
    }

    /// Random base weights for [`tiny_config`]
    pub(crate) fn tiny_weights(cfg: &Config, device: &Device) -> HashMap<String, Tensor> {
        let mut weights = HashMap::new();
        let mut put = |name: String, shape: &[usize]| {
            let t = (Tensor::randn(0f32, 1.0, shape, device).unwrap() * 0.1).unwrap();
            weights.insert(name, t);
        };
        let h = cfg.hidden_size;
        let kv = cfg.num_key_value_heads * (h / cfg.num_attention_heads);
        put("model.embed_tokens.weight".into(), &[cfg.vocab_size, h]);
        put("lm_head.weight".into(), &[cfg.vocab_size, h]);
        put("model.norm.weight".into(), &[h]);
        for i in 0..cfg.num_hidden_layers {
            let p = format!("model.layers.{i}");
            put(format!("{p}.self_attn.q_proj.weight"), &[h, h]);
            put(format!("{p}.self_attn.q_proj.bias"), &[h]);
            put(format!("{p}.self_attn.k_proj.weight"), &[kv, h]);
            put(format!("{p}.self_attn.k_proj.bias"), &[kv]);
            put(format!("{p}.self_attn.v_proj.weight"), &[kv, h]);
            put(format!("{p}.self_attn.v_proj.bias"), &[kv]);
            put(format!("{p}.self_attn.o_proj.weight"), &[h, h]);
            put(format!("{p}.mlp.gate_proj.weight"), &[cfg.intermediate_size, h]);
            put(format!("{p}.mlp.up_proj.weight"), &[cfg.intermediate_size, h]);
            put(format!("{p}.mlp.down_proj.weight"), &[h, cfg.intermediate_size]);
            put(format!("{p}.input_layernorm.weight"), &[h]);
            put(format!("{p}.post_attention_layernorm.weight"), &[h]);
        }
        weights
    }

    fn build(varmap: &VarMap) -> Qwen2ForTraining {
        let device = Device::Cpu;
        let cfg = tiny_config();
        let vb = VarBuilder::from_tensors(tiny_weights(&cfg, &device), DType::F32, &device);
        let lora_vb = VarBuilder::from_varmap(varmap, DType::F32, &device).pp(ADAPTER_PREFIX);
        Qwen2ForTraining::new(&cfg, &LoraConfig::default(), 16, vb, lora_vb).unwrap()
    }

    #[test]
    fn test_adapter_variables_follow_module_paths() {
        let varmap = VarMap::new();
        build(&varmap);

        let data = varmap.data().lock().unwrap();
        assert_eq!(data.len(), 2 * 2 * 2);
        assert!(data.contains_key("base_model.model.model.layers.1.self_attn.v_proj.lora_A.weight"));
        assert!(!data.keys().any(|k| k.contains("k_proj")));
    }

    #[test]
    fn test_forward_shape_and_causality() {
        let varmap = VarMap::new();
        let model = build(&varmap);

        let ids = Tensor::new(&[[1u32, 5, 7, 9, 2, 2]], &Device::Cpu).unwrap();
        let logits = model.forward_t(&ids, false).unwrap();
        assert_eq!(logits.dims(), &[1, 6, 32]);

        // Changing a later token leaves earlier positions untouched.
        let other = Tensor::new(&[[1u32, 5, 7, 3, 3, 3]], &Device::Cpu).unwrap();
        let other_logits = model.forward_t(&other, false).unwrap();
        let prefix = |t: &Tensor| t.narrow(1, 0, 3).unwrap();
        let diff = (prefix(&logits) - prefix(&other_logits)).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn test_rejects_overlong_input() {
        let varmap = VarMap::new();
        let model = build(&varmap);
        let ids = Tensor::zeros((1, 17), DType::U32, &Device::Cpu).unwrap();
        assert!(model.forward_t(&ids, false).is_err());
    }

    #[test]
    fn test_gradients_reach_adapters() {
        let varmap = VarMap::new();
        let model = build(&varmap);

        let ids = Tensor::new(&[[1u32, 5, 7, 9]], &Device::Cpu).unwrap();
        let loss = model.forward_t(&ids, true).unwrap().sqr().unwrap().mean_all().unwrap();
        let grads = loss.backward().unwrap();

        let vars = varmap.all_vars();
        assert!(vars.iter().all(|v| grads.get(v.as_tensor()).is_some()));

        let mut opt = candle_nn::SGD::new(vars, 0.1).unwrap();
        opt.step(&grads).unwrap();
    }
}
