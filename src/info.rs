//! Static description of the pipeline for the frontend

use serde::Serialize;

const PAGE_CONTENT: &str = r#"
<h1 class="text-3xl font-bold">Real-Time Latent Consistency Model SDv1.5</h1>
<h3 class="text-xl font-bold">Text-to-Image LCM + LoRa</h3>
<p class="text-sm">
    This demo showcases
    <a
    href="https://huggingface.co/blog/lcm_lora"
    target="_blank"
    class="text-blue-500 underline hover:no-underline">LCM LoRA</a>
    text-to-image generation running on
    <a
    href="https://github.com/huggingface/candle"
    target="_blank"
    class="text-blue-500 underline hover:no-underline">Candle</a>, featuring
    <a
    href="https://huggingface.co/wavymulder/Analog-Diffusion"
    target="_blank"
    class="text-blue-500 underline hover:no-underline">Analog-Diffusion</a>.
</p>
<p class="text-sm text-gray-500">
    Change the prompt to generate different images. With prompt weighting
    enabled, <code>(word)1.3</code>, <code>word++</code> and
    <code>(words)--</code> adjust how strongly each part is followed.
</p>
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineInfo {
    /// Identifier the frontend keys the pipeline on
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    /// What the frontend should collect from the user
    pub input_mode: &'static str,
    pub page_content: &'static str,
}

impl Default for PipelineInfo {
    fn default() -> Self {
        Self {
            name: "controlnet",
            title: "Text-to-Image LCM + LoRa",
            description: "Generates an image from a text prompt",
            input_mode: "text",
            page_content: PAGE_CONTENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_serializes() {
        let value = serde_json::to_value(PipelineInfo::default()).unwrap();
        assert_eq!(value["name"], "controlnet");
        assert_eq!(value["input_mode"], "text");
        assert!(value["page_content"].as_str().unwrap().contains("<h1"));
    }
}
