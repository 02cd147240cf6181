//! Latent Consistency Model scheduler
//!
//! Multi-step consistency sampling: at every step the model prediction is
//! turned into an estimate of the clean latent with the consistency boundary
//! scalings, and (except on the last step) re-noised to the next timestep.
//!
//! The configuration is derived from the base model's own
//! `scheduler_config.json`; keys the LCM scheduler does not know are ignored
//! and LCM-only keys fall back to their defaults.

use candle_core::{DType, Device, Result, Shape, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::Deserialize;
use std::path::Path;

use crate::error::{self, Error};

/// sigma_data of the consistency parameterization
const SIGMA_DATA: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredcosCapV2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    Sample,
    VPrediction,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LcmSchedulerConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    /// Length of the schedule the consistency model was distilled on
    pub original_inference_steps: usize,
    pub set_alpha_to_one: bool,
    pub prediction_type: PredictionType,
    pub clip_sample: bool,
    pub clip_sample_range: f64,
    pub timestep_scaling: f64,
}

impl Default for LcmSchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            original_inference_steps: 50,
            set_alpha_to_one: true,
            prediction_type: PredictionType::Epsilon,
            clip_sample: false,
            clip_sample_range: 1.0,
            timestep_scaling: 10.0,
        }
    }
}

impl LcmSchedulerConfig {
    /// Derive an LCM configuration from another scheduler's config file
    pub fn from_base_config(path: &Path) -> error::Result<Self> {
        error::read_json(path)
    }
}

/// Result of one scheduler step
#[derive(Debug)]
pub struct LcmStepOutput {
    /// Sample to feed the next step
    pub prev_sample: Tensor,
    /// Consistency estimate of the clean latent
    pub denoised: Tensor,
}

#[derive(Debug, Clone)]
pub struct LcmScheduler {
    config: LcmSchedulerConfig,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    timesteps: Vec<usize>,
}

impl LcmScheduler {
    pub fn new(config: LcmSchedulerConfig, num_inference_steps: usize) -> error::Result<Self> {
        let original_steps = config.original_inference_steps;
        if num_inference_steps == 0 || num_inference_steps > original_steps {
            return Err(Error::invalid(
                "steps",
                format!("{num_inference_steps} is outside 1..={original_steps} for this scheduler"),
            ));
        }
        if original_steps == 0 || original_steps > config.num_train_timesteps {
            return Err(Error::Unsupported(format!(
                "original_inference_steps {original_steps} with {} train timesteps",
                config.num_train_timesteps
            )));
        }

        let betas = betas(&config);
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut acc = 1.0;
        for beta in &betas {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };

        // Sub-sample the distillation schedule [k-1, 2k-1, ..] from the top
        let k = config.num_train_timesteps / original_steps;
        let origin: Vec<usize> = (1..=original_steps).rev().map(|i| i * k - 1).collect();
        let timesteps = (0..num_inference_steps)
            .map(|i| origin[i * origin.len() / num_inference_steps])
            .collect();

        Ok(Self {
            config,
            alphas_cumprod,
            final_alpha_cumprod,
            timesteps,
        })
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    /// LCM does not rescale model inputs
    pub fn scale_model_input(&self, sample: Tensor, _timestep: usize) -> Tensor {
        sample
    }

    pub fn config(&self) -> &LcmSchedulerConfig {
        &self.config
    }

    /// Boundary-condition scalings `(c_skip, c_out)` for a timestep
    pub fn boundary_scalings(&self, timestep: usize) -> (f64, f64) {
        let scaled = timestep as f64 * self.config.timestep_scaling;
        let denom = scaled * scaled + SIGMA_DATA * SIGMA_DATA;
        (SIGMA_DATA * SIGMA_DATA / denom, scaled / denom.sqrt())
    }

    /// Advance from `timesteps()[step_index]`; fresh noise is drawn from `rng`
    /// on every step but the last.
    pub fn step<R: Rng>(
        &self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
        rng: &mut R,
    ) -> Result<LcmStepOutput> {
        let timestep = self.timesteps[step_index];
        let prev_timestep = self.timesteps.get(step_index + 1).copied();

        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev = match prev_timestep {
            Some(t) => self.alphas_cumprod[t],
            None => self.final_alpha_cumprod,
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let (c_skip, c_out) = self.boundary_scalings(timestep);

        let predicted_original = match self.config.prediction_type {
            PredictionType::Epsilon => {
                ((sample - (model_output * beta_prod_t.sqrt())?)? / alpha_prod_t.sqrt())?
            }
            PredictionType::Sample => model_output.clone(),
            PredictionType::VPrediction => {
                ((sample * alpha_prod_t.sqrt())? - (model_output * beta_prod_t.sqrt())?)?
            }
        };
        let predicted_original = if self.config.clip_sample {
            let range = self.config.clip_sample_range;
            predicted_original.clamp(-range, range)?
        } else {
            predicted_original
        };

        let denoised = ((predicted_original * c_out)? + (sample * c_skip)?)?;

        let prev_sample = if prev_timestep.is_some() {
            let noise = seeded_randn(rng, model_output.shape(), model_output.device(), model_output.dtype())?;
            ((&denoised * alpha_prod_t_prev.sqrt())? + (noise * beta_prod_t_prev.sqrt())?)?
        } else {
            denoised.clone()
        };

        Ok(LcmStepOutput {
            prev_sample,
            denoised,
        })
    }
}

fn betas(config: &LcmSchedulerConfig) -> Vec<f64> {
    let n = config.num_train_timesteps;
    let lerp = |start: f64, end: f64, i: usize| {
        if n == 1 {
            start
        } else {
            start + (end - start) * i as f64 / (n - 1) as f64
        }
    };
    match config.beta_schedule {
        BetaSchedule::Linear => (0..n)
            .map(|i| lerp(config.beta_start, config.beta_end, i))
            .collect(),
        BetaSchedule::ScaledLinear => (0..n)
            .map(|i| lerp(config.beta_start.sqrt(), config.beta_end.sqrt(), i).powi(2))
            .collect(),
        BetaSchedule::SquaredcosCapV2 => {
            let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
            (0..n)
                .map(|i| {
                    let t1 = i as f64 / n as f64;
                    let t2 = (i + 1) as f64 / n as f64;
                    (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                })
                .collect()
        }
    }
}

/// Standard-normal tensor drawn on the host so a seed reproduces on any device
pub fn seeded_randn<R: Rng, S: Into<Shape>>(
    rng: &mut R,
    shape: S,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Tensor::from_vec(data, shape, &Device::Cpu)?
        .to_device(device)?
        .to_dtype(dtype)
}
