//! CLI entry point for the LCM + LoRA text-to-image pipeline

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lcm_lora_txt2img::config::{DeviceSpec, PipelineConfig, Precision};
use lcm_lora_txt2img::download::ModelDownloader;
use lcm_lora_txt2img::info::PipelineInfo;
use lcm_lora_txt2img::params::{self, GenerationParameters};
use lcm_lora_txt2img::pipeline::LcmLoraPipeline;
use lcm_lora_txt2img::safety::SafetyChecker;
use lcm_lora_txt2img::ScoringMode;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lcm-lora-txt2img")]
#[command(version = "0.1.0")]
#[command(about = "LCM + LoRA text-to-image with a CLIP safety checker", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Process-wide pipeline options
#[derive(Args, Clone)]
struct PipelineArgs {
    /// Compute target: auto, cpu, cuda[:N], metal[:N]
    #[arg(long, env = "DEVICE", default_value = "auto")]
    device: DeviceSpec,

    /// Weight precision: auto, f32, f16, bf16
    #[arg(long, env = "PRECISION", default_value = "auto")]
    precision: Precision,

    /// Decode with the tiny autoencoder instead of the KL autoencoder
    #[arg(long, env = "TAESD")]
    taesd: bool,

    /// Run a warm-up inference at startup
    #[arg(long, env = "COMPILE")]
    compile: bool,

    /// Use fused (flash) attention; needs the `flash-attn` feature
    #[arg(long, env = "FUSED_ATTENTION")]
    fused_attention: bool,

    /// Parse prompt weighting syntax, e.g. `(red)1.3 cube++`
    #[arg(long, env = "PROMPT_WEIGHTING")]
    prompt_weighting: bool,
}

impl PipelineArgs {
    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            device: self.device,
            precision: self.precision,
            use_tiny_vae: self.taesd,
            compile_for_throughput: self.compile,
            use_fused_attention_backend: self.fused_attention,
            use_structured_prompt_weighting: self.prompt_weighting,
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Download required models (~4GB, plus ~1.2GB for the safety checker)
    ///
    /// Downloads from HuggingFace Hub:
    /// - wavymulder/Analog-Diffusion (SD 1.5 fine-tune)
    /// - latent-consistency/lcm-lora-sdv1-5
    /// - madebyollin/taesd (with --taesd)
    /// - CompVis/stable-diffusion-safety-checker (with --safety-checker)
    Download {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Also download the safety checker
        #[arg(long)]
        safety_checker: bool,
    },

    /// Generate an image from a text prompt
    Generate {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Text prompt
        #[arg(short, long, default_value = params::DEFAULT_PROMPT)]
        prompt: String,

        /// Random seed for reproducibility
        #[arg(long, default_value_t = params::DEFAULT_SEED)]
        seed: u64,

        /// Denoising steps (2-15 recommended)
        #[arg(long, default_value_t = params::DEFAULT_STEPS)]
        steps: usize,

        /// Guidance scale; classifier-free guidance runs above 1.0
        #[arg(long, default_value_t = params::DEFAULT_GUIDANCE_SCALE)]
        guidance_scale: f64,

        /// Output PNG path
        #[arg(short, long, default_value = "output.png")]
        output: PathBuf,

        /// Run the safety checker and black out flagged output
        #[arg(long)]
        safety_check: bool,
    },

    /// Run the safety checker on existing images
    Check {
        /// Images to check
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Compute target: auto, cpu, cuda[:N], metal[:N]
        #[arg(long, env = "DEVICE", default_value = "auto")]
        device: DeviceSpec,

        /// Scoring: per-image (rounded) or batched (raw margins)
        #[arg(long, default_value = "per-image")]
        mode: ScoringMode,

        /// Write black copies of flagged images next to them (always batched scoring)
        #[arg(long, conflicts_with = "mode")]
        redact: bool,
    },

    /// Print pipeline metadata, input schema and default config as JSON
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Download {
            pipeline,
            safety_checker,
        } => {
            let config = pipeline.config();
            let downloader = ModelDownloader::new(config.models.clone())?;
            let artifacts = downloader.download_pipeline(&config).await?;

            println!();
            println!("✓ Pipeline models downloaded successfully!");
            println!();
            println!("Model locations:");
            println!("  UNet:   {}", artifacts.unet_weights.display());
            println!("  VAE:    {}", artifacts.vae_weights.display());
            println!("  Text:   {}", artifacts.text_encoder_weights.display());
            println!("  LoRA:   {}", artifacts.lora_weights.display());
            if let Some(tiny_vae) = &artifacts.tiny_vae {
                println!("  TAESD:  {}", tiny_vae.display());
            }

            if safety_checker {
                let safety = downloader.download_safety_checker().await?;
                println!("  Safety: {}", safety.weights.display());
            }
            println!();
        }

        Commands::Generate {
            pipeline,
            prompt,
            seed,
            steps,
            guidance_scale,
            output,
            safety_check,
        } => {
            let config = pipeline.config();
            let downloader = ModelDownloader::new(config.models.clone())?;
            let artifacts = downloader.download_pipeline(&config).await?;
            let pipeline = LcmLoraPipeline::load(&config, &artifacts)?;

            let params = GenerationParameters::new(prompt, seed)
                .with_steps(steps)
                .with_guidance_scale(guidance_scale);
            let mut image = pipeline.predict(&params)?;

            if safety_check {
                let safety = downloader.download_safety_checker().await?;
                let checker = SafetyChecker::load(pipeline.device(), &safety)?;
                let (checked, flagged) = checker.classify_and_redact(image)?;
                if flagged {
                    eprintln!("⚠️  Output flagged by the safety checker, saving a black image");
                }
                image = checked;
            }

            image
                .save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("✓ Saved {}", output.display());
        }

        Commands::Check {
            images,
            device,
            mode,
            redact,
        } => {
            let loaded = images
                .iter()
                .map(|path| {
                    image::open(path)
                        .map(|image| image.to_rgb8())
                        .with_context(|| format!("Failed to read {}", path.display()))
                })
                .collect::<Result<Vec<_>>>()?;

            let downloader = ModelDownloader::new(Default::default())?;
            let safety = downloader.download_safety_checker().await?;
            let checker = SafetyChecker::load(&device.resolve()?, &safety)?;

            let (checked, flags) = if redact {
                checker.classify_and_redact(loaded)?
            } else {
                checker.classify_with(loaded, mode)?
            };
            info!(checked = flags.len(), "✓ Safety check complete");

            for ((path, image), flagged) in images.iter().zip(&checked).zip(&flags) {
                println!("{}\t{}", if *flagged { "FLAGGED" } else { "ok" }, path.display());
                if redact && *flagged {
                    let target = path.with_extension("redacted.png");
                    image.save(&target)?;
                    println!("  → {}", target.display());
                }
            }
        }

        Commands::Info => {
            let report = serde_json::json!({
                "info": PipelineInfo::default(),
                "input_schema": params::input_schema(),
                "config": PipelineConfig::default(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_rejects_explicit_mode() {
        let parsed = Cli::try_parse_from(["txt2img", "check", "a.png", "--redact", "--mode", "per-image"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from(["txt2img", "check", "a.png", "--redact"]).unwrap();
        assert!(matches!(parsed.command, Commands::Check { redact: true, .. }));

        let parsed = Cli::try_parse_from(["txt2img", "check", "a.png", "--mode", "batched"]).unwrap();
        assert!(matches!(
            parsed.command,
            Commands::Check { mode: ScoringMode::Batched, redact: false, .. }
        ));
    }
}
