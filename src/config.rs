//! Process-wide pipeline configuration
//!
//! A [`PipelineConfig`] is built once at startup (usually from CLI flags or
//! environment variables) and never changes afterwards.

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Result;

/// Stable Diffusion 1.5 fine-tune used as the base model
pub const BASE_MODEL_ID: &str = "wavymulder/Analog-Diffusion";
/// Latent-consistency LoRA distilled for SD 1.5
pub const LCM_LORA_ID: &str = "latent-consistency/lcm-lora-sdv1-5";
/// Name the LCM LoRA is attached under
pub const LORA_ADAPTER_NAME: &str = "lcm";
/// Tiny autoencoder replacing the KL decoder when enabled
pub const TINY_VAE_ID: &str = "madebyollin/taesd";
/// CLIP tokenizer matching the SD 1.5 text encoder
pub const TOKENIZER_ID: &str = "openai/clip-vit-base-patch32";
pub const SAFETY_CHECKER_ID: &str = "CompVis/stable-diffusion-safety-checker";
pub const FEATURE_EXTRACTOR_ID: &str = "openai/clip-vit-base-patch32";

/// Hub repository names of every pretrained artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIds {
    pub base_model: String,
    pub lcm_lora: String,
    pub lora_adapter_name: String,
    pub tiny_vae: String,
    pub tokenizer: String,
    pub safety_checker: String,
    pub feature_extractor: String,
}

impl Default for ModelIds {
    fn default() -> Self {
        Self {
            base_model: BASE_MODEL_ID.to_string(),
            lcm_lora: LCM_LORA_ID.to_string(),
            lora_adapter_name: LORA_ADAPTER_NAME.to_string(),
            tiny_vae: TINY_VAE_ID.to_string(),
            tokenizer: TOKENIZER_ID.to_string(),
            safety_checker: SAFETY_CHECKER_ID.to_string(),
            feature_extractor: FEATURE_EXTRACTOR_ID.to_string(),
        }
    }
}

/// Compute target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSpec {
    /// CUDA if available, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    pub fn resolve(&self) -> Result<Device> {
        let device = match *self {
            Self::Auto => {
                if candle_core::utils::cuda_is_available() {
                    Device::new_cuda(0)?
                } else if candle_core::utils::metal_is_available() {
                    Device::new_metal(0)?
                } else {
                    Device::Cpu
                }
            }
            Self::Cpu => Device::Cpu,
            Self::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            Self::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }
}

impl FromStr for DeviceSpec {
    type Err = String;

    /// Accepts `auto`, `cpu`, `cuda`, `cuda:N`, `metal`, `mps`, `metal:N`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| format!("invalid device ordinal in `{s}`"))?;
                (kind.to_string(), ordinal)
            }
            None => (s.clone(), 0),
        };
        match kind.as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(ordinal)),
            "metal" | "mps" => Ok(Self::Metal(ordinal)),
            other => Err(format!(
                "unknown device `{other}` (expected auto, cpu, cuda[:N] or metal[:N])"
            )),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(i) => write!(f, "cuda:{i}"),
            Self::Metal(i) => write!(f, "metal:{i}"),
        }
    }
}

/// Numeric precision of the model weights and activations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// F16 on accelerators, F32 on CPU
    #[default]
    Auto,
    F32,
    F16,
    Bf16,
}

impl Precision {
    pub fn dtype(&self, device: &Device) -> DType {
        match self {
            Self::Auto if device.is_cpu() => DType::F32,
            Self::Auto => DType::F16,
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "f32" | "fp32" | "float32" => Ok(Self::F32),
            "f16" | "fp16" | "float16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            other => Err(format!("unknown precision `{other}` (expected auto, f32, f16 or bf16)")),
        }
    }
}

/// Everything needed to assemble the generation pipeline
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub device: DeviceSpec,
    pub precision: Precision,
    /// Replace the KL decoder with the tiny autoencoder
    pub use_tiny_vae: bool,
    /// Pay first-call costs at startup with a warm-up inference
    pub compile_for_throughput: bool,
    /// Build the UNet with fused (flash) attention kernels
    pub use_fused_attention_backend: bool,
    /// Parse prompts with weighting syntax into precomputed embeddings
    pub use_structured_prompt_weighting: bool,
    pub models: ModelIds,
}

/// Unified-memory targets share host memory, layout tuning does not apply there
pub fn is_unified_memory(device: &Device) -> bool {
    device.is_metal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_spec() {
        assert_eq!("auto".parse::<DeviceSpec>().unwrap(), DeviceSpec::Auto);
        assert_eq!("CPU".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
        assert_eq!("cuda".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(0));
        assert_eq!("cuda:2".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(2));
        assert_eq!("mps".parse::<DeviceSpec>().unwrap(), DeviceSpec::Metal(0));
        assert!("tpu".parse::<DeviceSpec>().is_err());
        assert!("cuda:x".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn test_device_spec_display_roundtrip() {
        for spec in [DeviceSpec::Cpu, DeviceSpec::Cuda(1), DeviceSpec::Metal(0)] {
            assert_eq!(spec.to_string().parse::<DeviceSpec>().unwrap(), spec);
        }
    }

    #[test]
    fn test_precision_on_cpu() {
        let cpu = Device::Cpu;
        assert_eq!(Precision::Auto.dtype(&cpu), DType::F32);
        assert_eq!(Precision::F16.dtype(&cpu), DType::F16);
        assert_eq!("bfloat16".parse::<Precision>().unwrap(), Precision::Bf16);
        assert!(!is_unified_memory(&cpu));
    }

    #[test]
    fn test_default_config_uses_known_models() {
        let config = PipelineConfig::default();
        assert_eq!(config.models.base_model, "wavymulder/Analog-Diffusion");
        assert_eq!(config.models.lora_adapter_name, "lcm");
        assert!(!config.use_tiny_vae);
        assert!(!config.use_structured_prompt_weighting);
    }

    #[test]
    fn test_config_deserializes_partial_json() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"use_tiny_vae": true, "device": "cpu"}"#).unwrap();
        assert!(config.use_tiny_vae);
        assert_eq!(config.device, DeviceSpec::Cpu);
        assert_eq!(config.models, ModelIds::default());
    }
}
