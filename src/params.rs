//! Per-request generation parameters and their UI schema

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

pub const DEFAULT_PROMPT: &str =
    "Analog style photograph of young Harrison Ford as Han Solo, star wars behind the scenes";
pub const DEFAULT_SEED: u64 = 8638236174640251;
pub const DEFAULT_STEPS: usize = 4;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 0.2;
/// Output size the LCM LoRA was distilled for
pub const IMAGE_SIZE: usize = 512;

/// One text-to-image request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParameters {
    pub prompt: String,
    pub seed: u64,
    /// Denoising steps, 2..=15 in the UI
    pub steps: usize,
    /// Conditioning strength, 0..=4 in the UI
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            seed: DEFAULT_SEED,
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            width: IMAGE_SIZE,
            height: IMAGE_SIZE,
        }
    }
}

impl GenerationParameters {
    pub fn new(prompt: impl Into<String>, seed: u64) -> Self {
        Self {
            prompt: prompt.into(),
            seed,
            ..Default::default()
        }
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    /// Check the constraints the model itself cannot run without.
    ///
    /// The UI bounds in [`input_schema`] are enforced by the caller.
    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            return Err(Error::invalid("steps", "at least one denoising step is required"));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(Error::invalid(
                "guidance_scale",
                format!("{} is not a finite non-negative number", self.guidance_scale),
            ));
        }
        for (field, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value % 8 != 0 {
                return Err(Error::invalid(
                    field,
                    format!("{value} must be a positive multiple of 8"),
                ));
            }
        }
        Ok(())
    }
}

/// UI description of one tunable field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSchema {
    pub id: &'static str,
    pub title: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub default: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    /// Widget hint for the frontend (`textarea`, `seed`, `range`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub hide: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

impl FieldSchema {
    fn new(id: &'static str, title: &'static str, kind: &'static str, default: Value) -> Self {
        Self {
            id,
            title,
            kind,
            default,
            min: None,
            max: None,
            step: None,
            field: None,
            hide: false,
            disabled: false,
        }
    }

    fn bounds(mut self, min: f64, max: Option<f64>) -> Self {
        self.min = Some(min);
        self.max = max;
        self
    }
}

/// Field descriptors in display order
pub fn input_fields() -> Vec<FieldSchema> {
    let defaults = GenerationParameters::default();
    vec![
        FieldSchema {
            field: Some("textarea"),
            ..FieldSchema::new("prompt", "Prompt", "string", json!(defaults.prompt))
        },
        FieldSchema {
            field: Some("seed"),
            hide: true,
            ..FieldSchema::new("seed", "Seed", "integer", json!(defaults.seed)).bounds(0.0, None)
        },
        FieldSchema {
            field: Some("range"),
            hide: true,
            ..FieldSchema::new("steps", "Steps", "integer", json!(defaults.steps))
                .bounds(2.0, Some(15.0))
        },
        FieldSchema {
            hide: true,
            disabled: true,
            ..FieldSchema::new("width", "Width", "integer", json!(defaults.width))
                .bounds(IMAGE_SIZE as f64, Some(IMAGE_SIZE as f64))
        },
        FieldSchema {
            hide: true,
            disabled: true,
            ..FieldSchema::new("height", "Height", "integer", json!(defaults.height))
                .bounds(IMAGE_SIZE as f64, Some(IMAGE_SIZE as f64))
        },
        FieldSchema {
            step: Some(0.001),
            field: Some("range"),
            hide: true,
            ..FieldSchema::new(
                "guidance_scale",
                "Guidance Scale",
                "number",
                json!(defaults.guidance_scale),
            )
            .bounds(0.0, Some(4.0))
        },
    ]
}

/// JSON schema of [`GenerationParameters`] as consumed by the frontend
pub fn input_schema() -> Value {
    let mut properties = Map::new();
    for field in input_fields() {
        let value = serde_json::to_value(&field).unwrap_or(Value::Null);
        properties.insert(field.id.to_string(), value);
    }
    json!({
        "title": "InputParams",
        "type": "object",
        "properties": properties,
    })
}
