//! CLIP image preprocessing for the safety checker

use candle_core::{Device, Tensor};
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Deserialize;
use std::path::Path;

use crate::error::{self, Result};

pub const CLIP_IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// `size` / `crop_size` as written by both old and new processor configs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Square(u32),
    ShortestEdge { shortest_edge: u32 },
    Exact { height: u32, width: u32 },
}

/// `preprocessor_config.json` of a CLIP image processor
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClipImageProcessorConfig {
    pub do_resize: bool,
    pub size: SizeSpec,
    /// PIL resampling filter id
    pub resample: u8,
    pub do_center_crop: bool,
    pub crop_size: SizeSpec,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for ClipImageProcessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: SizeSpec::ShortestEdge { shortest_edge: 224 },
            resample: 3,
            do_center_crop: true,
            crop_size: SizeSpec::Exact {
                height: 224,
                width: 224,
            },
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: CLIP_IMAGE_MEAN,
            image_std: CLIP_IMAGE_STD,
        }
    }
}

impl ClipImageProcessorConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        error::read_json(path)
    }

    fn filter(&self) -> FilterType {
        match self.resample {
            0 => FilterType::Nearest,
            1 => FilterType::Lanczos3,
            2 => FilterType::Triangle,
            _ => FilterType::CatmullRom,
        }
    }

    /// Output (height, width) after resize and crop
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        let (w, h) = if self.do_resize {
            resized_dims(self.size, width, height)
        } else {
            (width, height)
        };
        if self.do_center_crop {
            let (crop_w, crop_h) = crop_dims(self.crop_size);
            (crop_h, crop_w)
        } else {
            (h, w)
        }
    }

    fn prepare(&self, image: &RgbImage) -> RgbImage {
        let mut image = if self.do_resize {
            let (w, h) = resized_dims(self.size, image.width(), image.height());
            if (w, h) == image.dimensions() {
                image.clone()
            } else {
                imageops::resize(image, w, h, self.filter())
            }
        } else {
            image.clone()
        };

        if self.do_center_crop {
            let (crop_w, crop_h) = crop_dims(self.crop_size);
            if image.width() < crop_w || image.height() < crop_h {
                // pad on the bottom/right, as the crop window would overhang
                let mut padded = RgbImage::new(image.width().max(crop_w), image.height().max(crop_h));
                imageops::replace(&mut padded, &image, 0, 0);
                image = padded;
            }
            let left = (image.width() - crop_w) / 2;
            let top = (image.height() - crop_h) / 2;
            image = imageops::crop_imm(&image, left, top, crop_w, crop_h).to_image();
        }
        image
    }

    /// Preprocess a batch into a normalized `[N, 3, H, W]` f32 tensor
    ///
    /// All images must share one output size (always true with center crop).
    pub fn preprocess(&self, images: &[RgbImage], device: &Device) -> Result<Tensor> {
        let scale = if self.do_rescale { self.rescale_factor } else { 1.0 };
        let mut batch = Vec::with_capacity(images.len());
        for image in images {
            let image = self.prepare(image);
            let (width, height) = image.dimensions();
            let plane = (width * height) as usize;

            let mut chw = vec![0f32; 3 * plane];
            for (i, pixel) in image.pixels().enumerate() {
                for c in 0..3 {
                    let mut v = pixel.0[c] as f32 * scale;
                    if self.do_normalize {
                        v = (v - self.image_mean[c]) / self.image_std[c];
                    }
                    chw[c * plane + i] = v;
                }
            }
            batch.push(Tensor::from_vec(chw, (3, height as usize, width as usize), device)?);
        }
        Ok(Tensor::stack(&batch, 0)?)
    }
}

fn resized_dims(size: SizeSpec, width: u32, height: u32) -> (u32, u32) {
    match size {
        SizeSpec::Exact { height, width } => (width, height),
        SizeSpec::Square(target) | SizeSpec::ShortestEdge { shortest_edge: target } => {
            let (short, long) = if width <= height {
                (width, height)
            } else {
                (height, width)
            };
            let scaled_long = (target as u64 * long as u64 / short.max(1) as u64) as u32;
            if width <= height {
                (target, scaled_long)
            } else {
                (scaled_long, target)
            }
        }
    }
}

fn crop_dims(size: SizeSpec) -> (u32, u32) {
    match size {
        SizeSpec::Square(s) | SizeSpec::ShortestEdge { shortest_edge: s } => (s, s),
        SizeSpec::Exact { height, width } => (width, height),
    }
}
