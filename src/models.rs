//! Model loading for the SD 1.5 pipeline components
//!
//! - CLIP tokenizer + text encoder (prompt conditioning)
//! - UNet denoiser, built from the base model's `unet/config.json`
//! - latent decoder: the base KL autoencoder or the tiny autoencoder

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{self, clip, unet_2d, vae};
use image::RgbImage;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::error::{self, Error, Result};
use crate::taesd::TinyDecoder;

/// CLIP context length, including start and end tokens
pub const CLIP_MAX_LENGTH: usize = 77;
/// Latent scaling of the SD 1.5 KL autoencoder
pub const KL_SCALING_FACTOR: f64 = 0.18215;
/// Spatial downsampling between pixels and latents
pub const VAE_SCALE_FACTOR: usize = 8;

/// Load every tensor of a safetensors file onto `device`
pub fn load_tensors<P: AsRef<Path>>(path: P, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, device)?;
    debug!(path = %path.display(), tensor_count = tensors.len(), "Loaded weights");
    Ok(tensors)
}

fn mmap_var_builder<'a>(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'a>> {
    // SAFETY: the weight files are immutable once downloaded into the cache
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? };
    Ok(vb)
}

// ============================================================================
// Tokenizer and text encoder
// ============================================================================

/// CLIP BPE tokenizer producing fixed 77-token windows
pub struct ClipTokenizer {
    tokenizer: Tokenizer,
    bos_id: u32,
    eos_id: u32,
    pad_id: u32,
}

impl ClipTokenizer {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading CLIP tokenizer");
        let tokenizer = Tokenizer::from_file(path).map_err(Error::tokenizer)?;
        Self::new(tokenizer)
    }

    /// Wrap a tokenizer whose vocabulary contains the CLIP special tokens
    ///
    /// Padding and truncation configured in the tokenizer file are disabled;
    /// windows are assembled here instead.
    pub fn new(mut tokenizer: Tokenizer) -> Result<Self> {
        let special = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| Error::Tokenizer(format!("vocabulary has no `{token}` token")))
        };
        let bos_id = special("<|startoftext|>")?;
        let eos_id = special("<|endoftext|>")?;

        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(None)
            .map_err(Error::tokenizer)?;

        Ok(Self {
            tokenizer,
            bos_id,
            eos_id,
            // SD 1.5 pads with the end token
            pad_id: eos_id,
        })
    }

    /// Content token ids, without start/end tokens, never truncated
    pub fn token_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, false).map_err(Error::tokenizer)?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Content tokens that fit in one window
    pub fn max_content_tokens(&self) -> usize {
        CLIP_MAX_LENGTH - 2
    }

    /// `<start> ids.. <end> <pad>..`, truncating content to fit 77 tokens
    pub fn window(&self, ids: &[u32]) -> Vec<u32> {
        let ids = &ids[..ids.len().min(self.max_content_tokens())];
        let mut window = Vec::with_capacity(CLIP_MAX_LENGTH);
        window.push(self.bos_id);
        window.extend_from_slice(ids);
        window.push(self.eos_id);
        window.resize(CLIP_MAX_LENGTH, self.pad_id);
        window
    }
}

/// Tokenizer and text encoder turning prompts into UNet conditioning
pub struct TextConditioner {
    tokenizer: ClipTokenizer,
    encoder: Box<dyn Module + Send + Sync>,
    device: Device,
}

impl TextConditioner {
    pub fn new(tokenizer: ClipTokenizer, encoder: Box<dyn Module + Send + Sync>, device: Device) -> Self {
        Self {
            tokenizer,
            encoder,
            device,
        }
    }

    /// Load the SD 1.5 CLIP text transformer
    pub fn load<P: AsRef<Path>>(
        weights: P,
        tokenizer: ClipTokenizer,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weights = weights.as_ref();
        info!(path = %weights.display(), "Loading CLIP text encoder");

        let vb = mmap_var_builder(weights, dtype, device)?;
        let config = clip::Config::v1_5();
        let model = clip::ClipTextTransformer::new(vb, &config)?;

        info!("✓ CLIP text encoder loaded");
        Ok(Self::new(tokenizer, Box::new(model), device.clone()))
    }

    pub fn tokenizer(&self) -> &ClipTokenizer {
        &self.tokenizer
    }

    /// Encode one window of content tokens to [1, 77, hidden]
    pub fn encode_window(&self, ids: &[u32]) -> Result<Tensor> {
        let window = self.tokenizer.window(ids);
        let tokens = Tensor::new(window.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.encoder.forward(&tokens)?)
    }

    /// Encode a prompt to [1, 77, hidden], truncating past 75 tokens
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let ids = self.tokenizer.token_ids(prompt)?;
        if ids.len() > self.tokenizer.max_content_tokens() {
            debug!(
                tokens = ids.len(),
                kept = self.tokenizer.max_content_tokens(),
                "Prompt truncated to the CLIP context"
            );
        }
        self.encode_window(&ids)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

// ============================================================================
// UNet
// ============================================================================

/// Noise predictor driven by the scheduler
pub trait Denoiser: Send + Sync {
    fn forward(&self, latents: &Tensor, timestep: f64, encoder_hidden_states: &Tensor)
        -> candle_core::Result<Tensor>;
}

impl Denoiser for unet_2d::UNet2DConditionModel {
    fn forward(
        &self,
        latents: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
    ) -> candle_core::Result<Tensor> {
        unet_2d::UNet2DConditionModel::forward(self, latents, timestep, encoder_hidden_states)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum HeadDim {
    Shared(usize),
    PerBlock(Vec<usize>),
}

/// The parts of a diffusers `unet/config.json` candle's UNet needs
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct UNetConfigFile {
    pub in_channels: usize,
    pub out_channels: usize,
    pub block_out_channels: Vec<usize>,
    pub down_block_types: Vec<String>,
    pub layers_per_block: usize,
    pub attention_head_dim: HeadDim,
    pub cross_attention_dim: usize,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub center_input_sample: bool,
    pub downsample_padding: usize,
    pub mid_block_scale_factor: f64,
    pub use_linear_projection: bool,
}

impl Default for UNetConfigFile {
    /// Stable Diffusion 1.5
    fn default() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            block_out_channels: vec![320, 640, 1280, 1280],
            down_block_types: vec![
                "CrossAttnDownBlock2D".to_string(),
                "CrossAttnDownBlock2D".to_string(),
                "CrossAttnDownBlock2D".to_string(),
                "DownBlock2D".to_string(),
            ],
            layers_per_block: 2,
            attention_head_dim: HeadDim::Shared(8),
            cross_attention_dim: 768,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            flip_sin_to_cos: true,
            freq_shift: 0.0,
            center_input_sample: false,
            downsample_padding: 1,
            mid_block_scale_factor: 1.0,
            use_linear_projection: false,
        }
    }
}

impl UNetConfigFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        error::read_json(path)
    }

    pub fn to_candle(&self) -> Result<unet_2d::UNet2DConditionModelConfig> {
        if self.down_block_types.len() != self.block_out_channels.len() {
            return Err(Error::Unsupported(format!(
                "{} down blocks for {} block widths",
                self.down_block_types.len(),
                self.block_out_channels.len()
            )));
        }
        let blocks = self
            .block_out_channels
            .iter()
            .zip(&self.down_block_types)
            .enumerate()
            .map(|(i, (&out_channels, kind))| {
                let attention_head_dim = match &self.attention_head_dim {
                    HeadDim::Shared(dim) => *dim,
                    HeadDim::PerBlock(dims) => dims.get(i).copied().unwrap_or(8),
                };
                unet_2d::BlockConfig {
                    out_channels,
                    use_cross_attn: kind.starts_with("CrossAttn").then_some(1),
                    attention_head_dim,
                }
            })
            .collect();

        Ok(unet_2d::UNet2DConditionModelConfig {
            center_input_sample: self.center_input_sample,
            flip_sin_to_cos: self.flip_sin_to_cos,
            freq_shift: self.freq_shift,
            blocks,
            layers_per_block: self.layers_per_block,
            downsample_padding: self.downsample_padding,
            mid_block_scale_factor: self.mid_block_scale_factor,
            norm_num_groups: self.norm_num_groups,
            norm_eps: self.norm_eps,
            cross_attention_dim: self.cross_attention_dim,
            sliced_attention_size: None,
            use_linear_projection: self.use_linear_projection,
        })
    }
}

/// Build the UNet from an (already LoRA-fused) weight map
pub fn build_unet(
    weights: HashMap<String, Tensor>,
    config: &UNetConfigFile,
    use_flash_attn: bool,
    device: &Device,
    dtype: DType,
) -> Result<unet_2d::UNet2DConditionModel> {
    info!(
        tensors = weights.len(),
        dtype = ?dtype,
        flash_attn = use_flash_attn,
        "Building UNet"
    );
    let vb = VarBuilder::from_tensors(weights, dtype, device);
    let unet = unet_2d::UNet2DConditionModel::new(
        vb,
        config.in_channels,
        config.out_channels,
        use_flash_attn,
        config.to_candle()?,
    )?;
    info!("✓ UNet built");
    Ok(unet)
}

// ============================================================================
// Latent decoders
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    AutoencoderKl,
    Tiny,
}

/// Image decoder selected at construction
pub enum LatentDecoder {
    AutoencoderKl(vae::AutoEncoderKL),
    Tiny(TinyDecoder),
}

impl LatentDecoder {
    /// Load the base model's KL autoencoder
    pub fn load_kl<P: AsRef<Path>>(weights: P, device: &Device, dtype: DType) -> Result<Self> {
        let weights = weights.as_ref();
        info!(path = %weights.display(), "Loading KL autoencoder");
        let sd_config = stable_diffusion::StableDiffusionConfig::v1_5(None, None, None);
        let vae = sd_config.build_vae(weights, device, dtype)?;
        info!("✓ KL autoencoder loaded");
        Ok(Self::AutoencoderKl(vae))
    }

    /// Load the tiny autoencoder decoder
    pub fn load_tiny<P: AsRef<Path>>(weights: P, device: &Device, dtype: DType) -> Result<Self> {
        let weights = weights.as_ref();
        info!(path = %weights.display(), "Loading tiny autoencoder");
        let vb = mmap_var_builder(weights, dtype, device)?;
        let decoder = TinyDecoder::new(vb.pp("decoder"), &Default::default())?;
        info!("✓ Tiny autoencoder loaded");
        Ok(Self::Tiny(decoder))
    }

    pub fn kind(&self) -> DecoderKind {
        match self {
            Self::AutoencoderKl(_) => DecoderKind::AutoencoderKl,
            Self::Tiny(_) => DecoderKind::Tiny,
        }
    }

    pub fn scaling_factor(&self) -> f64 {
        match self {
            Self::AutoencoderKl(_) => KL_SCALING_FACTOR,
            Self::Tiny(_) => 1.0,
        }
    }

    /// Decode latents [B, 4, H/8, W/8] to images [B, 3, H, W] in [-1, 1]
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents / self.scaling_factor())?;
        let image = match self {
            Self::AutoencoderKl(vae) => vae.decode(&latents)?,
            Self::Tiny(decoder) => decoder.decode(&latents)?,
        };
        Ok(image)
    }
}

/// Convert a decoded [3, H, W] tensor in [-1, 1] to an 8-bit RGB image
pub fn tensor_to_rgb_image(image: &Tensor) -> Result<RgbImage> {
    let (channels, height, width) = image.dims3()?;
    if channels != 3 {
        return Err(Error::Unsupported(format!("{channels}-channel decoder output")));
    }

    let image = ((image.to_dtype(DType::F32)? / 2.0)? + 0.5)?.clamp(0f32, 1f32)?;
    let image = (image * 255.0)?.round()?.to_dtype(DType::U8)?;

    let pixels: Vec<u8> = image
        .to_device(&Device::Cpu)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1()?;

    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::Unsupported("decoded buffer does not match image size".to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<unk>": 0, "<|startoftext|>": 1, "<|endoftext|>": 2, "a": 3, "red": 4, "cube": 5},
            "unk_token": "<unk>"
        }
    }"#;

    pub(crate) fn tokenizer() -> ClipTokenizer {
        let tokenizer: Tokenizer = TEST_TOKENIZER.parse().unwrap();
        ClipTokenizer::new(tokenizer).unwrap()
    }

    /// Text conditioner whose "encoder" embeds token `i` as `[i, 1]`
    pub(crate) fn embedding_conditioner() -> TextConditioner {
        let table: Vec<f32> = (0..6).flat_map(|i| [i as f32, 1.0]).collect();
        let table = Tensor::from_vec(table, (6, 2), &Device::Cpu).unwrap();
        let encoder = candle_nn::Embedding::new(table, 2);
        TextConditioner::new(tokenizer(), Box::new(encoder), Device::Cpu)
    }

    #[test]
    fn test_window_layout() {
        let tokenizer = tokenizer();
        let ids = tokenizer.token_ids("a red cube").unwrap();
        assert_eq!(ids, vec![3, 4, 5]);

        let window = tokenizer.window(&ids);
        assert_eq!(window.len(), CLIP_MAX_LENGTH);
        assert_eq!(&window[..5], &[1, 3, 4, 5, 2]);
        assert!(window[5..].iter().all(|&id| id == 2));
    }

    #[test]
    fn test_window_truncates_long_prompts() {
        let tokenizer = tokenizer();
        let ids = vec![4u32; 100];
        let window = tokenizer.window(&ids);
        assert_eq!(window.len(), CLIP_MAX_LENGTH);
        assert_eq!(window[0], 1);
        assert_eq!(window[CLIP_MAX_LENGTH - 1], 2);
        assert_eq!(window.iter().filter(|&&id| id == 4).count(), 75);
    }

    #[test]
    fn test_empty_prompt_window() {
        let tokenizer = tokenizer();
        assert!(tokenizer.token_ids("").unwrap().is_empty());
        let window = tokenizer.window(&[]);
        assert_eq!(&window[..2], &[1, 2]);
    }

    #[test]
    fn test_tokenizer_requires_clip_specials() {
        let json = TEST_TOKENIZER.replace("<|startoftext|>", "<s>");
        let tokenizer: Tokenizer = json.parse().unwrap();
        assert!(matches!(ClipTokenizer::new(tokenizer), Err(Error::Tokenizer(_))));
    }

    #[test]
    fn test_encode_shape() -> Result<()> {
        let text = embedding_conditioner();
        let emb = text.encode("a red cube")?;
        assert_eq!(emb.dims(), &[1, CLIP_MAX_LENGTH, 2]);
        let first: Vec<f32> = emb.squeeze(0)?.get(2)?.to_vec1()?;
        assert_eq!(first, vec![4.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_sd15_unet_config() {
        let config = UNetConfigFile::default().to_candle().unwrap();
        assert_eq!(config.blocks.len(), 4);
        assert_eq!(config.blocks[0].out_channels, 320);
        assert_eq!(config.blocks[0].use_cross_attn, Some(1));
        assert_eq!(config.blocks[3].use_cross_attn, None);
        assert_eq!(config.cross_attention_dim, 768);
    }

    #[test]
    fn test_unet_config_file_with_per_block_heads() {
        let file: UNetConfigFile = serde_json::from_str(
            r#"{
                "_class_name": "UNet2DConditionModel",
                "attention_head_dim": [5, 10, 20, 20],
                "block_out_channels": [320, 640, 1280, 1280],
                "cross_attention_dim": 1024,
                "use_linear_projection": true
            }"#,
        )
        .unwrap();
        let config = file.to_candle().unwrap();
        assert_eq!(config.blocks[1].attention_head_dim, 10);
        assert!(config.use_linear_projection);
        assert_eq!(file.in_channels, 4);
    }

    #[test]
    fn test_tensor_to_rgb_image() -> Result<()> {
        // red channel at +1, green at -1, blue at 0
        let red = Tensor::ones((1, 2, 2), DType::F32, &Device::Cpu)?;
        let green = red.neg()?;
        let blue = red.zeros_like()?;
        let image = Tensor::cat(&[red, green, blue], 0)?;

        let rgb = tensor_to_rgb_image(&image)?;
        assert_eq!(rgb.dimensions(), (2, 2));
        assert_eq!(rgb.get_pixel(1, 1).0, [255, 0, 128]);
        Ok(())
    }
}
