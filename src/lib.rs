//! LCM + LoRA text-to-image with a CLIP safety checker
//!
//! Two adapters over pretrained Stable Diffusion 1.5 components, built on
//! the Candle ML framework:
//!
//! - **Generation**: an SD 1.5 fine-tune with the latent-consistency LoRA
//!   fused in, sampled in a handful of LCM steps
//! - **Safety checking**: CLIP image embeddings scored against unsafe-concept
//!   embeddings with a two-tier threshold scheme
//!
//! ## Features
//!
//! - **Fast sampling**: 4 LCM steps by default, guidance optional
//! - **Tiny autoencoder**: optional TAESD decoder for cheaper decoding
//! - **Prompt weighting**: `(word)1.3`, `word++`, `(words)-` syntax
//! - **Reproducible**: host-side seeded noise, identical on every device
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lcm_lora_txt2img::config::PipelineConfig;
//! use lcm_lora_txt2img::download::ModelDownloader;
//! use lcm_lora_txt2img::params::GenerationParameters;
//! use lcm_lora_txt2img::pipeline::LcmLoraPipeline;
//! use lcm_lora_txt2img::safety::SafetyChecker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::default();
//!     let downloader = ModelDownloader::new(config.models.clone())?;
//!     let artifacts = downloader.download_pipeline(&config).await?;
//!
//!     let pipeline = LcmLoraPipeline::load(&config, &artifacts)?;
//!     let image = pipeline.predict(&GenerationParameters::new("a red cube", 42))?;
//!
//!     let checker = SafetyChecker::load(pipeline.device(), &downloader.download_safety_checker().await?)?;
//!     let (image, flagged) = checker.classify(image)?;
//!     if !flagged {
//!         image.save("cube.png")?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod concepts;
pub mod config;
pub mod download;
pub mod error;
pub mod info;
pub mod lora;
pub mod models;
pub mod params;
pub mod pipeline;
pub mod preprocess;
pub mod safety;
pub mod scheduler;
pub mod taesd;
pub mod weighting;

pub use concepts::ScoringMode;
pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use params::GenerationParameters;
pub use pipeline::LcmLoraPipeline;
pub use safety::{ImageBatch, SafetyChecker};
