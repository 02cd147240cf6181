//! LCM + LoRA text-to-image pipeline
//!
//! This module orchestrates the complete generation workflow:
//! 1. Encode prompt (CLIP, or weighted embeddings when prompt weighting is on)
//! 2. Denoise with the LoRA-fused UNet under the LCM scheduler
//! 3. Decode latents with the KL or tiny autoencoder
//! 4. Convert to an 8-bit RGB image

use candle_core::{DType, Device, IndexOp, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{is_unified_memory, PipelineConfig};
use crate::download::PipelineArtifacts;
use crate::error::{Error, Result};
use crate::lora::LoraAdapter;
use crate::models::{
    build_unet, load_tensors, tensor_to_rgb_image, ClipTokenizer, DecoderKind, Denoiser,
    LatentDecoder, TextConditioner, UNetConfigFile, VAE_SCALE_FACTOR,
};
use crate::params::GenerationParameters;
use crate::scheduler::{seeded_randn, LcmScheduler, LcmSchedulerConfig};
use crate::weighting::PromptWeighting;
use image::RgbImage;

/// LCM LoRA strength; the adapter is fused at full weight
const LORA_STRENGTH: f32 = 1.0;

/// What the UNet is conditioned on for one request
enum Conditioning<'a> {
    Text(&'a str),
    Embeds(Tensor),
}

/// Already-built parts of a pipeline
pub struct PipelineComponents {
    pub text: TextConditioner,
    pub unet: Box<dyn Denoiser>,
    pub decoder: LatentDecoder,
    pub scheduler_config: LcmSchedulerConfig,
    pub device: Device,
    pub dtype: DType,
    pub use_structured_prompt_weighting: bool,
}

/// Assembled text-to-image model, read-only after construction
pub struct LcmLoraPipeline {
    text: Arc<TextConditioner>,
    weighting: Option<PromptWeighting>,
    unet: Box<dyn Denoiser>,
    decoder: LatentDecoder,
    scheduler_config: LcmSchedulerConfig,
    device: Device,
    dtype: DType,
}

impl LcmLoraPipeline {
    /// Load and assemble every component described by `config`
    pub fn load(config: &PipelineConfig, artifacts: &PipelineArtifacts) -> Result<Self> {
        info!("Initializing LCM LoRA txt2img pipeline");

        let device = config.device.resolve()?;
        let dtype = config.precision.dtype(&device);
        info!(device = ?device, dtype = ?dtype, "Target selected");

        if config.use_fused_attention_backend && !cfg!(feature = "flash-attn") {
            return Err(Error::Unsupported(
                "fused attention requires building with the `flash-attn` feature".to_string(),
            ));
        }

        // Step 1: tokenizer and text encoder
        let tokenizer = ClipTokenizer::from_file(&artifacts.tokenizer)?;
        let text = TextConditioner::load(&artifacts.text_encoder_weights, tokenizer, &device, dtype)?;

        // Step 2: decoder
        let decoder_weights = artifacts.decoder_weights(config.use_tiny_vae)?;
        let decoder = if config.use_tiny_vae {
            LatentDecoder::load_tiny(decoder_weights, &device, dtype)?
        } else {
            LatentDecoder::load_kl(decoder_weights, &device, dtype)?
        };

        // Step 3: scheduler derived from the base model's own config
        let scheduler_config = LcmSchedulerConfig::from_base_config(&artifacts.scheduler_config)?;
        debug!(config = ?scheduler_config, "LCM scheduler config");

        // Step 4: LCM LoRA fused into the UNet weights
        let lora = LoraAdapter::load(
            &artifacts.lora_weights,
            config.models.lora_adapter_name.as_str(),
            &device,
            DType::F32,
        )?;
        let mut unet_weights = load_tensors(&artifacts.unet_weights, &device)?;
        let report = lora.fuse_into(&mut unet_weights, LORA_STRENGTH)?;
        if report.fused == 0 {
            return Err(Error::Unsupported(format!(
                "adapter `{}` matched no UNet weight",
                lora.name
            )));
        }

        // Step 5: UNet
        let unet_config = UNetConfigFile::from_file(&artifacts.unet_config)?;
        let unet = build_unet(
            unet_weights,
            &unet_config,
            config.use_fused_attention_backend,
            &device,
            dtype,
        )?;

        if !is_unified_memory(&device) {
            info!("Kernels run on contiguous NCHW buffers, no layout conversion applied");
        }

        let mut pipeline = Self::from_components(PipelineComponents {
            text,
            unet: Box::new(unet),
            decoder,
            scheduler_config,
            device,
            dtype,
            use_structured_prompt_weighting: false,
        });

        if config.compile_for_throughput {
            pipeline.warmup()?;
        }

        if config.use_structured_prompt_weighting {
            pipeline.weighting = Some(PromptWeighting::new(pipeline.text.clone()));
            info!("✓ Prompt weighting enabled");
        }

        info!("✓ Pipeline initialized successfully");
        Ok(pipeline)
    }

    pub fn from_components(components: PipelineComponents) -> Self {
        let text = Arc::new(components.text);
        let weighting = components
            .use_structured_prompt_weighting
            .then(|| PromptWeighting::new(text.clone()));
        Self {
            text,
            weighting,
            unet: components.unet,
            decoder: components.decoder,
            scheduler_config: components.scheduler_config,
            device: components.device,
            dtype: components.dtype,
        }
    }

    /// One throw-away inference so first-call costs are paid up front
    pub fn warmup(&self) -> Result<()> {
        info!("Running warm-up inference");
        let params = GenerationParameters::new("warmup", 0)
            .with_steps(1)
            .with_guidance_scale(8.0);
        self.predict(&params)?;
        info!("✓ Warm-up complete");
        Ok(())
    }

    /// Generate one image for `params`
    ///
    /// Identical parameters on the same handle produce identical images.
    pub fn predict(&self, params: &GenerationParameters) -> Result<RgbImage> {
        params.validate()?;
        let scheduler = LcmScheduler::new(self.scheduler_config.clone(), params.steps)?;
        let use_guidance = params.guidance_scale > 1.0;

        info!(
            prompt_preview = %params.prompt.chars().take(50).collect::<String>(),
            steps = params.steps,
            size = format!("{}x{}", params.width, params.height),
            seed = params.seed,
            guidance = params.guidance_scale,
            "Starting generation"
        );

        let conditioning = match &self.weighting {
            Some(weighting) => Conditioning::Embeds(weighting.embed(&params.prompt)?),
            None => Conditioning::Text(&params.prompt),
        };
        let context = self.context(conditioning, use_guidance)?;
        debug!(shape = ?context.dims(), "Conditioning");

        let mut rng = StdRng::seed_from_u64(params.seed);
        let latent_shape = (
            1,
            4,
            params.height / VAE_SCALE_FACTOR,
            params.width / VAE_SCALE_FACTOR,
        );
        let mut latents = (seeded_randn(&mut rng, latent_shape, &self.device, self.dtype)?
            * scheduler.init_noise_sigma())?;

        let total = scheduler.timesteps().len();
        for (i, &timestep) in scheduler.timesteps().iter().enumerate() {
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep);

            let noise_pred = self.unet.forward(&model_input, timestep as f64, &context)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, i, &latents, &mut rng)?.prev_sample;
            debug!(step = i + 1, total, timestep, "Denoising progress");
        }

        let image = self.decoder.decode(&latents)?;
        let image = tensor_to_rgb_image(&image.i(0)?)?;

        info!(size = format!("{}x{}", image.width(), image.height()), "✓ Generation complete!");
        Ok(image)
    }

    /// UNet conditioning, `[uncond, cond]` stacked when guidance is on
    fn context(&self, conditioning: Conditioning<'_>, use_guidance: bool) -> Result<Tensor> {
        let context = match conditioning {
            Conditioning::Text(prompt) => {
                let cond = self.text.encode(prompt)?;
                if use_guidance {
                    let uncond = self.text.encode("")?;
                    Tensor::cat(&[uncond, cond], 0)?
                } else {
                    cond
                }
            }
            Conditioning::Embeds(cond) => match (&self.weighting, use_guidance) {
                (Some(weighting), true) => {
                    let uncond = weighting.embed("")?;
                    let (cond, uncond) = weighting.pad_pair(cond, uncond)?;
                    Tensor::cat(&[uncond, cond], 0)?
                }
                _ => cond,
            },
        };
        Ok(context.to_dtype(self.dtype)?)
    }

    pub fn decoder_kind(&self) -> DecoderKind {
        self.decoder.kind()
    }

    pub fn has_prompt_weighting(&self) -> bool {
        self.weighting.is_some()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
