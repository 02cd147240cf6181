//! Safety checker
//!
//! Embeds images with a CLIP ViT-L/14 vision tower and its projection, then
//! scores them against the concept reference (see [`crate::concepts`]).
//! A single image yields a single flag, a batch yields one flag per image in
//! input order.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};
use candle_transformers::models::clip::text_model::Activation;
use candle_transformers::models::clip::vision_model::{ClipVisionConfig, ClipVisionTransformer};
use image::RgbImage;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

use crate::concepts::{ConceptReference, ConceptScore, ScoringMode};
use crate::download::SafetyArtifacts;
use crate::error::{self, Error, Result};
use crate::preprocess::ClipImageProcessorConfig;

/// `vision_config` of the checker's `config.json` (defaults: ViT-L/14)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VisionConfigFile {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub hidden_act: String,
}

impl Default for VisionConfigFile {
    fn default() -> Self {
        Self {
            hidden_size: 1024,
            intermediate_size: 4096,
            num_hidden_layers: 24,
            num_attention_heads: 16,
            num_channels: 3,
            image_size: 224,
            patch_size: 14,
            hidden_act: "quick_gelu".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SafetyCheckerConfig {
    pub projection_dim: usize,
    pub vision_config: VisionConfigFile,
}

impl Default for SafetyCheckerConfig {
    fn default() -> Self {
        Self {
            projection_dim: 768,
            vision_config: VisionConfigFile::default(),
        }
    }
}

impl SafetyCheckerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        error::read_json(path)
    }

    pub fn vision(&self) -> Result<ClipVisionConfig> {
        let v = &self.vision_config;
        if v.hidden_act != "quick_gelu" {
            return Err(Error::Unsupported(format!(
                "vision activation `{}`",
                v.hidden_act
            )));
        }
        Ok(ClipVisionConfig {
            embed_dim: v.hidden_size,
            activation: Activation::QuickGelu,
            intermediate_size: v.intermediate_size,
            num_hidden_layers: v.num_hidden_layers,
            num_attention_heads: v.num_attention_heads,
            projection_dim: self.projection_dim,
            num_channels: v.num_channels,
            image_size: v.image_size,
            patch_size: v.patch_size,
        })
    }
}

/// One image or a batch of images, keeping flag arity in the type
pub trait ImageBatch {
    /// `bool` for one image, `Vec<bool>` for a batch
    type Flags;

    fn images(&self) -> &[RgbImage];
    fn images_mut(&mut self) -> &mut [RgbImage];
    fn wrap_flags(flags: Vec<bool>) -> Result<Self::Flags>;
}

impl ImageBatch for RgbImage {
    type Flags = bool;

    fn images(&self) -> &[RgbImage] {
        std::slice::from_ref(self)
    }

    fn images_mut(&mut self) -> &mut [RgbImage] {
        std::slice::from_mut(self)
    }

    fn wrap_flags(flags: Vec<bool>) -> Result<bool> {
        match flags.as_slice() {
            [flag] => Ok(*flag),
            _ => Err(Error::ArityMismatch {
                expected: 1,
                actual: flags.len(),
            }),
        }
    }
}

impl ImageBatch for Vec<RgbImage> {
    type Flags = Vec<bool>;

    fn images(&self) -> &[RgbImage] {
        self
    }

    fn images_mut(&mut self) -> &mut [RgbImage] {
        self
    }

    fn wrap_flags(flags: Vec<bool>) -> Result<Vec<bool>> {
        Ok(flags)
    }
}

/// The checker always runs in full precision
pub const CHECKER_DTYPE: DType = DType::F32;

pub struct SafetyChecker {
    vision: ClipVisionTransformer,
    projection: Linear,
    concepts: ConceptReference,
    processor: ClipImageProcessorConfig,
    device: Device,
    dtype: DType,
}

impl SafetyChecker {
    /// Load the checker weights, concept reference and preprocessor
    pub fn load(device: &Device, artifacts: &SafetyArtifacts) -> Result<Self> {
        info!(path = %artifacts.weights.display(), "Loading safety checker");

        let config = SafetyCheckerConfig::from_file(&artifacts.config)?;
        let processor = ClipImageProcessorConfig::from_file(&artifacts.preprocessor_config)?;
        let dtype = CHECKER_DTYPE;

        // SAFETY: the weight files are immutable once downloaded into the cache
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&artifacts.weights], dtype, device)?
        };
        let checker = Self::new(vb, &config, processor, device)?;

        info!("✓ Safety checker loaded");
        Ok(checker)
    }

    /// Build from a var builder at the checker root
    pub fn new(
        vb: VarBuilder,
        config: &SafetyCheckerConfig,
        processor: ClipImageProcessorConfig,
        device: &Device,
    ) -> Result<Self> {
        let vision_config = config.vision()?;
        let vision = ClipVisionTransformer::new(vb.pp("vision_model").pp("vision_model"), &vision_config)?;
        let projection = linear_no_bias(
            vision_config.embed_dim,
            config.projection_dim,
            vb.pp("visual_projection"),
        )?;
        let concepts = ConceptReference::load(&vb, config.projection_dim)?;
        debug!(concepts = concepts.concept_count()?, "Concept reference loaded");

        Ok(Self {
            vision,
            projection,
            concepts,
            processor,
            device: device.clone(),
            dtype: vb.dtype(),
        })
    }

    /// Swap the concept reference, keeping the vision tower
    pub fn with_concepts(mut self, concepts: ConceptReference) -> Self {
        self.concepts = concepts;
        self
    }

    /// Projected CLIP embeddings [N, projection_dim]
    pub fn image_embeddings(&self, images: &[RgbImage]) -> Result<Tensor> {
        let pixels = self
            .processor
            .preprocess(images, &self.device)?
            .to_dtype(self.dtype)?;
        let pooled = self.vision.forward(&pixels)?;
        Ok(self.projection.forward(&pooled)?)
    }

    /// Full per-image scores, for inspection
    pub fn scores(&self, images: &[RgbImage]) -> Result<Vec<ConceptScore>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let embeds = self.image_embeddings(images)?;
        self.concepts.score_per_image(&embeds)
    }

    fn flags(&self, images: &[RgbImage], mode: ScoringMode) -> Result<Vec<bool>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let embeds = self.image_embeddings(images)?;
        let flags = self.concepts.flags(&embeds, mode)?;
        if flags.len() != images.len() {
            return Err(Error::ArityMismatch {
                expected: images.len(),
                actual: flags.len(),
            });
        }
        debug!(
            images = images.len(),
            flagged = flags.iter().filter(|f| **f).count(),
            mode = ?mode,
            "Safety check"
        );
        Ok(flags)
    }

    /// Flag images, returning them untouched alongside the flags
    pub fn classify<I: ImageBatch>(&self, images: I) -> Result<(I, I::Flags)> {
        self.classify_with(images, ScoringMode::PerImage)
    }

    pub fn classify_with<I: ImageBatch>(&self, images: I, mode: ScoringMode) -> Result<(I, I::Flags)> {
        let flags = self.flags(images.images(), mode)?;
        Ok((images, I::wrap_flags(flags)?))
    }

    /// Flag images with batched scoring and black out the flagged ones
    pub fn classify_and_redact<I: ImageBatch>(&self, mut images: I) -> Result<(I, I::Flags)> {
        let flags = self.flags(images.images(), ScoringMode::Batched)?;
        for (image, &flagged) in images.images_mut().iter_mut().zip(&flags) {
            if flagged {
                *image = RgbImage::new(image.width(), image.height());
            }
        }
        Ok((images, I::wrap_flags(flags)?))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}
