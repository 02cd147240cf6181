//! Small stand-in models shared by the integration tests

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, VarBuilder, VarMap};
use lcm_lora_txt2img::concepts::ConceptReference;
use lcm_lora_txt2img::models::{ClipTokenizer, Denoiser, LatentDecoder, TextConditioner};
use lcm_lora_txt2img::params::GenerationParameters;
use lcm_lora_txt2img::pipeline::{LcmLoraPipeline, PipelineComponents};
use lcm_lora_txt2img::preprocess::{ClipImageProcessorConfig, SizeSpec};
use lcm_lora_txt2img::safety::{SafetyChecker, SafetyCheckerConfig, VisionConfigFile};
use lcm_lora_txt2img::scheduler::LcmSchedulerConfig;
use lcm_lora_txt2img::taesd::{TinyDecoder, TinyDecoderConfig};
use tokenizers::Tokenizer;

pub const PROJECTION_DIM: usize = 4;

const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": {"type": "Lowercase"},
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {
            "<unk>": 0, "<|startoftext|>": 1, "<|endoftext|>": 2,
            "a": 3, "red": 4, "cube": 5, "blue": 6, "sphere": 7
        },
        "unk_token": "<unk>"
    }
}"#;

const HIDDEN: usize = 4;
const VOCAB: usize = 8;

/// Predicts noise as a damped sample shifted by the conditioning mean, so
/// every part of the conditioning reaches the image
pub struct ConditioningShift;

impl Denoiser for ConditioningShift {
    fn forward(
        &self,
        latents: &Tensor,
        _timestep: f64,
        encoder_hidden_states: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let batch = latents.dim(0)?;
        let shift = encoder_hidden_states
            .flatten_from(1)?
            .mean_keepdim(1)?
            .reshape((batch, 1, 1, 1))?
            .to_dtype(latents.dtype())?;
        (latents * 0.5)?.broadcast_add(&shift)
    }
}

pub fn text_conditioner() -> TextConditioner {
    let tokenizer: Tokenizer = TOKENIZER_JSON.parse().unwrap();
    let tokenizer = ClipTokenizer::new(tokenizer).unwrap();
    let table: Vec<f32> = (0..VOCAB * HIDDEN)
        .map(|i| ((i * 7919) % 17) as f32 / 17.0 - 0.5)
        .collect();
    let table = Tensor::from_vec(table, (VOCAB, HIDDEN), &Device::Cpu).unwrap();
    TextConditioner::new(tokenizer, Box::new(Embedding::new(table, HIDDEN)), Device::Cpu)
}

pub fn pipeline(prompt_weighting: bool) -> LcmLoraPipeline {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let decoder = TinyDecoder::new(
        vb,
        &TinyDecoderConfig {
            block_out_channels: vec![4, 4, 4, 4],
            num_blocks: vec![1, 1, 1, 1],
            ..Default::default()
        },
    )
    .unwrap();

    LcmLoraPipeline::from_components(PipelineComponents {
        text: text_conditioner(),
        unet: Box::new(ConditioningShift),
        decoder: LatentDecoder::Tiny(decoder),
        scheduler_config: LcmSchedulerConfig::default(),
        device: Device::Cpu,
        dtype: DType::F32,
        use_structured_prompt_weighting: prompt_weighting,
    })
}

pub fn small(prompt: &str, seed: u64) -> GenerationParameters {
    GenerationParameters {
        width: 64,
        height: 64,
        ..GenerationParameters::new(prompt, seed)
    }
}

pub fn tiny_config() -> SafetyCheckerConfig {
    SafetyCheckerConfig {
        projection_dim: PROJECTION_DIM,
        vision_config: VisionConfigFile {
            hidden_size: 8,
            intermediate_size: 16,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            num_channels: 3,
            image_size: 4,
            patch_size: 2,
            hidden_act: "quick_gelu".to_string(),
        },
    }
}

pub fn tiny_processor() -> ClipImageProcessorConfig {
    ClipImageProcessorConfig {
        size: SizeSpec::ShortestEdge { shortest_edge: 4 },
        crop_size: SizeSpec::Square(4),
        ..Default::default()
    }
}

pub fn checker() -> SafetyChecker {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let checker = SafetyChecker::new(vb, &tiny_config(), tiny_processor(), &Device::Cpu).unwrap();
    // nothing reaches a threshold of 2 on cosine similarity
    checker.with_concepts(uniform_reference(2.0))
}

pub fn uniform_reference(threshold: f32) -> ConceptReference {
    let ones = |n: usize| Tensor::ones((n, PROJECTION_DIM), DType::F32, &Device::Cpu).unwrap();
    let thresholds = |n: usize| Tensor::full(threshold, n, &Device::Cpu).unwrap();
    ConceptReference::new(ones(17), thresholds(17), ones(3), thresholds(3)).unwrap()
}

/// A single concept along `direction`, all special-care concepts out of reach
pub fn reference_along(direction: &Tensor, threshold: f32) -> ConceptReference {
    let special = Tensor::ones((3, PROJECTION_DIM), DType::F32, &Device::Cpu).unwrap();
    ConceptReference::new(
        direction.reshape((1, PROJECTION_DIM)).unwrap(),
        Tensor::new(&[threshold], &Device::Cpu).unwrap(),
        special,
        Tensor::new(&[2f32, 2.0, 2.0], &Device::Cpu).unwrap(),
    )
    .unwrap()
}
