//! LoRA (Low-Rank Adaptation) weight loading and fusion
//!
//! LoRA specializes a pretrained model with small adapter weights merged into
//! the base weights: W' = W + (alpha/rank) * strength * (up @ down)
//!
//! Adapters are read from safetensors files in either the kohya layout
//! (`lora_unet_down_blocks_0_..._to_q.lora_down.weight` + `.alpha`) or the
//! PEFT/diffusers layout (`unet.down_blocks.0....to_q.lora_A.weight`), and
//! fused into a UNet weight map before the model is built.

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Individual LoRA weight pair for a single layer
#[derive(Debug)]
pub struct LoraWeight {
    /// Module path this weight applies to, with `.`/`_` folded (see [`module_key`])
    pub layer_name: String,
    /// Down projection (A) [rank, in_features] or [rank, in, kh, kw]
    pub lora_down: Tensor,
    /// Up projection (B) [out_features, rank] or [out, rank, 1, 1]
    pub lora_up: Tensor,
    /// Alpha scaling factor (defaults to rank if not specified)
    pub alpha: f32,
    pub rank: usize,
}

impl LoraWeight {
    pub fn scale(&self, strength: f32) -> f32 {
        self.alpha / self.rank as f32 * strength
    }

    /// Full-rank delta `up @ down`, reshaped to `shape` (conv kernels included)
    pub fn delta(&self, shape: &[usize]) -> Result<Tensor> {
        let up = self.lora_up.to_dtype(DType::F32)?.flatten_from(1)?;
        let down = self.lora_down.to_dtype(DType::F32)?.flatten_from(1)?;
        let delta = up.matmul(&down)?;
        let expected: usize = shape.iter().product();
        if delta.elem_count() != expected {
            return Err(Error::LoraShape {
                layer: self.layer_name.clone(),
                target: String::new(),
                delta: delta.dims().to_vec(),
                weight: shape.to_vec(),
            });
        }
        Ok(delta.reshape(shape)?)
    }
}

/// LoRA adapter containing all weights for one fine-tune
#[derive(Debug)]
pub struct LoraAdapter {
    /// Adapter name the weights are attached under
    pub name: String,
    /// Weight pairs keyed by folded module path
    pub weights: HashMap<String, LoraWeight>,
}

/// Outcome of fusing an adapter into a weight map
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FuseReport {
    pub fused: usize,
    /// Layers with no counterpart in the weight map (e.g. text-encoder LoRAs)
    pub skipped: Vec<String>,
}

impl LoraAdapter {
    /// Load a LoRA adapter from a safetensors file
    pub fn load<P: AsRef<Path>>(
        path: P,
        name: impl Into<String>,
        device: &Device,
        dtype: DType,
    ) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let name = name.into();
        info!(path = %path.display(), adapter = %name, "Loading LoRA adapter");

        let file_data = std::fs::read(path)?;
        let tensors = SafeTensors::deserialize(&file_data)?;
        let adapter = Self::from_safetensors(&tensors, name, device, dtype)?;

        info!(
            path = %path.display(),
            weight_pairs = adapter.weight_count(),
            "✓ LoRA adapter loaded"
        );
        Ok(Arc::new(adapter))
    }

    pub fn from_safetensors(
        tensors: &SafeTensors,
        name: String,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let mut alpha_values: HashMap<String, f32> = HashMap::new();
        let mut down_tensors: HashMap<String, Tensor> = HashMap::new();
        let mut up_tensors: HashMap<String, Tensor> = HashMap::new();

        // First pass: collect all tensors and alphas
        for (key, _) in tensors.tensors() {
            if let Some(base_name) = key.strip_suffix(".alpha") {
                let alpha = load_tensor_from_safetensors(tensors, &key, &Device::Cpu, DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?
                    .first()
                    .copied();
                match alpha {
                    Some(alpha) => {
                        alpha_values.insert(module_key(base_name), alpha);
                    }
                    None => warn!(key = %key, "Empty LoRA alpha tensor"),
                }
            } else if key.contains(".lora_down.") || key.contains(".lora_A.") {
                let tensor = load_tensor_from_safetensors(tensors, &key, device, dtype)?;
                down_tensors.insert(module_key(&extract_lora_base_name(&key)), tensor);
            } else if key.contains(".lora_up.") || key.contains(".lora_B.") {
                let tensor = load_tensor_from_safetensors(tensors, &key, device, dtype)?;
                up_tensors.insert(module_key(&extract_lora_base_name(&key)), tensor);
            }
        }

        // Second pass: pair up the weights
        let mut weights = HashMap::new();
        for (layer_name, lora_down) in down_tensors {
            let Some(lora_up) = up_tensors.remove(&layer_name) else {
                warn!(layer = %layer_name, "LoRA down tensor without matching up tensor");
                continue;
            };
            let rank = lora_down.dims()[0];
            let alpha = alpha_values.get(&layer_name).copied().unwrap_or(rank as f32);
            debug!(layer = %layer_name, rank, alpha, "Loaded LoRA weight pair");

            weights.insert(
                layer_name.clone(),
                LoraWeight {
                    layer_name,
                    lora_down,
                    lora_up,
                    alpha,
                    rank,
                },
            );
        }

        for layer_name in up_tensors.keys() {
            warn!(layer = %layer_name, "LoRA up tensor without matching down tensor");
        }

        Ok(Self { name, weights })
    }

    pub fn weight_count(&self) -> usize {
        self.weights.len()
    }

    /// Merge every matching layer into `base` in place
    ///
    /// The merge is computed in f32 and stored back in each weight's own dtype.
    pub fn fuse_into(&self, base: &mut HashMap<String, Tensor>, strength: f32) -> Result<FuseReport> {
        let index: HashMap<String, String> = base
            .keys()
            .filter_map(|key| {
                key.strip_suffix(".weight")
                    .map(|module| (module_key(module), key.clone()))
            })
            .collect();

        let mut report = FuseReport::default();
        for (layer_name, lora) in &self.weights {
            let Some(target) = index.get(layer_name) else {
                report.skipped.push(layer_name.clone());
                continue;
            };
            let Some(weight) = base.get(target) else {
                report.skipped.push(layer_name.clone());
                continue;
            };

            let delta = lora.delta(weight.dims()).map_err(|err| match err {
                Error::LoraShape { layer, delta, weight, .. } => Error::LoraShape {
                    layer,
                    target: target.clone(),
                    delta,
                    weight,
                },
                other => other,
            })?;
            let delta = delta.to_device(weight.device())?;
            let merged = (weight.to_dtype(DType::F32)? + (delta * lora.scale(strength) as f64)?)?
                .to_dtype(weight.dtype())?;

            debug!(layer = %layer_name, target = %target, scale = lora.scale(strength), "Fused LoRA layer");
            base.insert(target.clone(), merged);
            report.fused += 1;
        }

        if !report.skipped.is_empty() {
            debug!(skipped = report.skipped.len(), "LoRA layers without a target weight");
        }
        info!(
            adapter = %self.name,
            fused = report.fused,
            skipped = report.skipped.len(),
            "✓ LoRA fused into base weights"
        );
        Ok(report)
    }
}

/// Load a tensor from safetensors and convert to target dtype
fn load_tensor_from_safetensors(
    tensors: &SafeTensors,
    key: &str,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let view = tensors.tensor(key)?;
    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Tensor::from_vec(floats, shape.as_slice(), device)?
        }
        safetensors::Dtype::F16 => {
            let halfs: Vec<half::f16> = data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(halfs, shape.as_slice(), device)?
        }
        safetensors::Dtype::BF16 => {
            let bhalfs: Vec<half::bf16> = data
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(bhalfs, shape.as_slice(), device)?
        }
        other => {
            return Err(Error::Unsupported(format!(
                "LoRA tensor `{key}` has dtype {other:?}"
            )))
        }
    };

    if tensor.dtype() != dtype {
        Ok(tensor.to_dtype(dtype)?)
    } else {
        Ok(tensor)
    }
}

/// Extract the module path from a LoRA key
/// e.g. "lora_unet_mid_block_attentions_0_proj_in.lora_down.weight" -> "lora_unet_mid_block_attentions_0_proj_in"
fn extract_lora_base_name(key: &str) -> String {
    let key = key.strip_suffix(".weight").unwrap_or(key);
    for marker in [".lora_down", ".lora_up", ".lora_A", ".lora_B"] {
        if let Some(pos) = key.rfind(marker) {
            return key[..pos].to_string();
        }
    }
    key.to_string()
}

/// Fold a module path into the separator-free form both LoRA layouts share
///
/// kohya flattens `down_blocks.0.attentions.0.to_q` into
/// `lora_unet_down_blocks_0_attentions_0_to_q`, which cannot be split back
/// unambiguously, so both sides are folded to underscores instead.
pub fn module_key(path: &str) -> String {
    let mut path = path;
    for prefix in ["lora_unet_", "unet.", "base_model.model."] {
        if let Some(rest) = path.strip_prefix(prefix) {
            path = rest;
        }
    }
    path.replace('.', "_")
}
