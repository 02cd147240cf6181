//! Tiny autoencoder decoder (TAESD)
//!
//! A distilled, convolution-only replacement for the SD 1.5 KL decoder.
//! The module layout follows the diffusers `DecoderTiny` checkpoint so the
//! `decoder.layers.{n}` tensor names load directly.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, conv2d_no_bias, Conv2d, Conv2dConfig, VarBuilder};

#[derive(Debug, Clone, PartialEq)]
pub struct TinyDecoderConfig {
    pub latent_channels: usize,
    pub out_channels: usize,
    pub block_out_channels: Vec<usize>,
    pub num_blocks: Vec<usize>,
    pub upsampling_scaling_factor: usize,
}

impl Default for TinyDecoderConfig {
    fn default() -> Self {
        Self {
            latent_channels: 4,
            out_channels: 3,
            block_out_channels: vec![64, 64, 64, 64],
            num_blocks: vec![3, 3, 3, 1],
            upsampling_scaling_factor: 2,
        }
    }
}

fn padded() -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        ..Default::default()
    }
}

/// conv-relu-conv-relu-conv with a residual skip, fused by relu
#[derive(Debug, Clone)]
struct TinyBlock {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    skip: Option<Conv2d>,
}

impl TinyBlock {
    fn new(vb: VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        let conv = vb.pp("conv");
        let conv1 = conv2d(in_channels, out_channels, 3, padded(), conv.pp("0"))?;
        let conv2 = conv2d(out_channels, out_channels, 3, padded(), conv.pp("2"))?;
        let conv3 = conv2d(out_channels, out_channels, 3, padded(), conv.pp("4"))?;
        let skip = if in_channels != out_channels {
            Some(conv2d_no_bias(in_channels, out_channels, 1, Default::default(), vb.pp("skip"))?)
        } else {
            None
        };
        Ok(Self {
            conv1,
            conv2,
            conv3,
            skip,
        })
    }
}

impl Module for TinyBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.conv1.forward(xs)?.relu()?;
        let h = self.conv2.forward(&h)?.relu()?;
        let h = self.conv3.forward(&h)?;
        let skip = match &self.skip {
            Some(skip) => skip.forward(xs)?,
            None => xs.clone(),
        };
        (h + skip)?.relu()
    }
}

#[derive(Debug, Clone)]
enum Layer {
    Conv(Conv2d),
    Relu,
    Block(TinyBlock),
    Upsample(usize),
}

impl Module for Layer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Conv(conv) => conv.forward(xs),
            Self::Relu => xs.relu(),
            Self::Block(block) => block.forward(xs),
            Self::Upsample(factor) => {
                let (_, _, h, w) = xs.dims4()?;
                xs.upsample_nearest2d(h * factor, w * factor)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TinyDecoder {
    layers: Vec<Layer>,
}

impl TinyDecoder {
    /// `vb` points at the decoder root (`decoder` in the TAESD checkpoint)
    pub fn new(vb: VarBuilder, config: &TinyDecoderConfig) -> Result<Self> {
        if config.block_out_channels.len() != config.num_blocks.len()
            || config.block_out_channels.is_empty()
        {
            candle_core::bail!(
                "tiny decoder needs one width per stage, got {:?} for {:?}",
                config.block_out_channels,
                config.num_blocks
            );
        }

        let vb = vb.pp("layers");
        let mut layers = Vec::new();
        let first = config.block_out_channels[0];
        layers.push(Layer::Conv(conv2d(config.latent_channels, first, 3, padded(), vb.pp(0))?));
        layers.push(Layer::Relu);

        let stages = config.num_blocks.len();
        for (i, (&channels, &blocks)) in config
            .block_out_channels
            .iter()
            .zip(&config.num_blocks)
            .enumerate()
        {
            let final_stage = i + 1 == stages;
            for _ in 0..blocks {
                let block = TinyBlock::new(vb.pp(layers.len()), channels, channels)?;
                layers.push(Layer::Block(block));
            }
            if !final_stage {
                layers.push(Layer::Upsample(config.upsampling_scaling_factor));
            }
            let index = layers.len();
            let conv = if final_stage {
                conv2d(channels, config.out_channels, 3, padded(), vb.pp(index))?
            } else {
                conv2d_no_bias(channels, channels, 3, padded(), vb.pp(index))?
            };
            layers.push(Layer::Conv(conv));
        }

        Ok(Self { layers })
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Latents [B, 4, h, w] to images [B, 3, 8h, 8w] in roughly [-1, 1]
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        // soft clamp to (-3, 3)
        let mut xs = ((latents / 3.0)?.tanh()? * 3.0)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        (xs * 2.0)? - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> TinyDecoderConfig {
        TinyDecoderConfig {
            block_out_channels: vec![4, 4, 4, 4],
            num_blocks: vec![1, 1, 1, 1],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_layout_matches_checkpoint() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let decoder = TinyDecoder::new(vb, &TinyDecoderConfig::default())?;
        // conv, relu, 3 stages of (blocks, upsample, conv), final block + conv
        assert_eq!(decoder.layer_count(), 19);
        assert!(matches!(decoder.layers[5], Layer::Upsample(2)));
        assert!(matches!(decoder.layers[17], Layer::Block(_)));
        Ok(())
    }

    #[test]
    fn test_decode_upsamples_by_eight() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let decoder = TinyDecoder::new(vb, &tiny_config())?;

        let latents = Tensor::randn(0f32, 1.0, (2, 4, 3, 5), &Device::Cpu)?;
        let image = decoder.decode(&latents)?;
        assert_eq!(image.dims(), &[2, 3, 24, 40]);
        Ok(())
    }

    #[test]
    fn test_zero_weights_decode_to_black() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let decoder = TinyDecoder::new(vb, &tiny_config())?;
        let latents = Tensor::ones((1, 4, 1, 1), DType::F32, &Device::Cpu)?;
        let image: Vec<f32> = decoder.decode(&latents)?.flatten_all()?.to_vec1()?;
        assert!(image.iter().all(|&v| v == -1.0));
        Ok(())
    }

    #[test]
    fn test_rejects_mismatched_stages() {
        let config = TinyDecoderConfig {
            num_blocks: vec![1, 1],
            ..tiny_config()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(TinyDecoder::new(vb, &config).is_err());
    }
}
