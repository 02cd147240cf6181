//! Model downloader for HuggingFace Hub
//!
//! This module fetches every pretrained artifact the two adapters need:
//! - SD 1.5 base model: UNet, KL autoencoder, CLIP text encoder, scheduler config
//! - LCM LoRA adapter weights
//! - tiny autoencoder (optional)
//! - CLIP tokenizer
//! - safety checker weights and the CLIP image preprocessor config
//!
//! Files are cached by `hf-hub`; repeated calls resolve to the cached copies.

use hf_hub::api::tokio::{Api, ApiRepo};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{ModelIds, PipelineConfig};
use crate::error::{Error, Result};

/// Model downloader that caches models using HuggingFace Hub
pub struct ModelDownloader {
    api: Api,
    models: ModelIds,
}

impl ModelDownloader {
    /// Create a new model downloader
    ///
    /// Uses HF_TOKEN environment variable if set for gated models
    pub fn new(models: ModelIds) -> Result<Self> {
        let api = Api::new()?;
        Ok(Self { api, models })
    }

    pub fn with_api(api: Api, models: ModelIds) -> Self {
        Self { api, models }
    }

    fn repo(&self, id: &str) -> ApiRepo {
        self.api.repo(hf_hub::Repo::model(id.to_string()))
    }

    /// Download everything the generation pipeline needs for `config`
    ///
    /// The tiny autoencoder is only fetched when the config enables it.
    pub async fn download_pipeline(&self, config: &PipelineConfig) -> Result<PipelineArtifacts> {
        info!(base_model = %self.models.base_model, "Downloading txt2img pipeline models");

        let (base, lora_weights, tokenizer, tiny_vae) = tokio::try_join!(
            self.download_base_model(),
            self.download_lcm_lora(),
            self.download_tokenizer(),
            self.download_tiny_vae_if(config.use_tiny_vae),
        )?;

        info!("✓ Pipeline models downloaded successfully!");

        Ok(PipelineArtifacts {
            unet_config: base.unet_config,
            unet_weights: base.unet_weights,
            vae_weights: base.vae_weights,
            text_encoder_weights: base.text_encoder_weights,
            scheduler_config: base.scheduler_config,
            lora_weights,
            tokenizer,
            tiny_vae,
        })
    }

    /// Download the base SD 1.5 model components
    pub async fn download_base_model(&self) -> Result<BaseModelFiles> {
        info!("Downloading base model ({})", self.models.base_model);
        let repo = self.repo(&self.models.base_model);

        let unet_config = repo.get("unet/config.json").await?;
        let scheduler_config = repo.get("scheduler/scheduler_config.json").await?;
        let unet_weights = fetch_weights(
            &repo,
            "unet/diffusion_pytorch_model.safetensors",
            "unet/diffusion_pytorch_model.bin",
        )
        .await?;
        let vae_weights = fetch_weights(
            &repo,
            "vae/diffusion_pytorch_model.safetensors",
            "vae/diffusion_pytorch_model.bin",
        )
        .await?;
        let text_encoder_weights = fetch_weights(
            &repo,
            "text_encoder/model.safetensors",
            "text_encoder/pytorch_model.bin",
        )
        .await?;

        info!("  ✓ Base model downloaded: {}", unet_weights.display());
        Ok(BaseModelFiles {
            unet_config,
            unet_weights,
            vae_weights,
            text_encoder_weights,
            scheduler_config,
        })
    }

    /// Download the LCM LoRA adapter (~130MB)
    pub async fn download_lcm_lora(&self) -> Result<PathBuf> {
        info!("Downloading LCM LoRA ({})", self.models.lcm_lora);
        let path = self
            .repo(&self.models.lcm_lora)
            .get("pytorch_lora_weights.safetensors")
            .await?;
        info!("  ✓ LCM LoRA downloaded: {}", path.display());
        Ok(path)
    }

    /// Download the tiny autoencoder (~10MB)
    pub async fn download_tiny_vae(&self) -> Result<PathBuf> {
        info!("Downloading tiny autoencoder ({})", self.models.tiny_vae);
        let path = self
            .repo(&self.models.tiny_vae)
            .get("diffusion_pytorch_model.safetensors")
            .await?;
        info!("  ✓ Tiny autoencoder downloaded: {}", path.display());
        Ok(path)
    }

    async fn download_tiny_vae_if(&self, wanted: bool) -> Result<Option<PathBuf>> {
        if wanted {
            self.download_tiny_vae().await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Download the CLIP tokenizer (~2MB)
    pub async fn download_tokenizer(&self) -> Result<PathBuf> {
        info!("Downloading CLIP tokenizer ({})", self.models.tokenizer);
        let path = self.repo(&self.models.tokenizer).get("tokenizer.json").await?;
        info!("  ✓ Tokenizer downloaded: {}", path.display());
        Ok(path)
    }

    /// Download the safety checker and its image preprocessor config (~1.2GB)
    pub async fn download_safety_checker(&self) -> Result<SafetyArtifacts> {
        info!("Downloading safety checker ({})", self.models.safety_checker);
        let repo = self.repo(&self.models.safety_checker);

        let (config, weights, preprocessor_config) = tokio::try_join!(
            async { Ok::<_, Error>(repo.get("config.json").await?) },
            fetch_weights(&repo, "model.safetensors", "pytorch_model.bin"),
            async {
                let path = self
                    .repo(&self.models.feature_extractor)
                    .get("preprocessor_config.json")
                    .await?;
                Ok::<_, Error>(path)
            },
        )?;

        info!("  ✓ Safety checker downloaded: {}", weights.display());
        Ok(SafetyArtifacts {
            config,
            weights,
            preprocessor_config,
        })
    }
}

/// Fetch `safetensors`, falling back to a PyTorch `bin` converted once on disk
async fn fetch_weights(repo: &ApiRepo, safetensors: &str, bin: &str) -> Result<PathBuf> {
    match repo.get(safetensors).await {
        Ok(path) => Ok(path),
        Err(err) => {
            debug!(file = safetensors, error = %err, "No safetensors weights, trying PyTorch");
            let bin_path = repo.get(bin).await?;
            convert_pickle(&bin_path)
        }
    }
}

/// Convert a PyTorch pickle checkpoint to safetensors next to it
pub fn convert_pickle(bin_path: &Path) -> Result<PathBuf> {
    let target = bin_path.with_extension("safetensors");
    if target.exists() {
        return Ok(target);
    }

    info!(path = %bin_path.display(), "Converting PyTorch weights to safetensors");
    let tensors: HashMap<String, candle_core::Tensor> =
        candle_core::pickle::read_all(bin_path)?.into_iter().collect();
    candle_core::safetensors::save(&tensors, &target)?;
    info!(tensors = tensors.len(), "  ✓ Converted: {}", target.display());
    Ok(target)
}

pub struct BaseModelFiles {
    pub unet_config: PathBuf,
    pub unet_weights: PathBuf,
    pub vae_weights: PathBuf,
    pub text_encoder_weights: PathBuf,
    pub scheduler_config: PathBuf,
}

/// Paths to every file the generation pipeline loads
#[derive(Debug, Clone)]
pub struct PipelineArtifacts {
    pub unet_config: PathBuf,
    pub unet_weights: PathBuf,
    pub vae_weights: PathBuf,
    pub text_encoder_weights: PathBuf,
    pub scheduler_config: PathBuf,
    pub lora_weights: PathBuf,
    pub tokenizer: PathBuf,
    /// Present when the tiny autoencoder was requested
    pub tiny_vae: Option<PathBuf>,
}

impl PipelineArtifacts {
    /// Decoder weights for the chosen decoder
    pub fn decoder_weights(&self, use_tiny_vae: bool) -> Result<&Path> {
        if use_tiny_vae {
            self.tiny_vae
                .as_deref()
                .ok_or(Error::MissingArtifact("tiny autoencoder weights"))
        } else {
            Ok(&self.vae_weights)
        }
    }
}

/// Paths to the safety checker files
#[derive(Debug, Clone)]
pub struct SafetyArtifacts {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub preprocessor_config: PathBuf,
}
