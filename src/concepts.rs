//! Concept scoring against the safety checker's reference embeddings
//!
//! Every image embedding is compared (cosine similarity) against 17 general
//! concept embeddings and 3 special-care embeddings, each with its own
//! threshold. A positive special-care margin makes the general check
//! stricter by [`SPECIAL_CARE_ADJUSTMENT`].

use candle_core::{DType, Tensor, D};
use candle_nn::VarBuilder;

use crate::error::Result;

pub const CONCEPT_COUNT: usize = 17;
pub const SPECIAL_CARE_COUNT: usize = 3;
pub const SPECIAL_CARE_ADJUSTMENT: f64 = 0.01;

/// How margins become flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoringMode {
    /// Scores rounded to 3 decimals, the adjustment applies to every concept
    /// scored after the first positive special-care margin
    #[default]
    PerImage,
    /// Raw margins on the whole batch; the adjustment applies to all general
    /// concepts when any special-care margin is positive
    Batched,
}

impl std::str::FromStr for ScoringMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "per-image" | "per_image" => Ok(Self::PerImage),
            "batched" => Ok(Self::Batched),
            other => Err(format!("unknown scoring mode `{other}` (expected per-image or batched)")),
        }
    }
}

/// Round to 3 decimals on the exact binary value of `x`
///
/// `0.0125` is stored slightly above the tie and rounds up to `0.013`.
/// Decimal formatting is exact, scaling by 1000 first is not.
pub fn round3(x: f64) -> f64 {
    format!("{x:.3}").parse().unwrap_or(x)
}

/// Pairwise cosine similarity of the rows of `a` [N, D] and `b` [M, D]
pub fn cosine_similarity(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    let normalize = |x: &Tensor| -> candle_core::Result<Tensor> {
        let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.clamp(1e-12f32, f32::MAX)?;
        x.broadcast_div(&norm)
    };
    let a = normalize(&a.to_dtype(DType::F32)?)?;
    let b = normalize(&b.to_dtype(DType::F32)?)?;
    a.matmul(&b.t()?)
}

/// Scores of a single image
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConceptScore {
    pub special_scores: Vec<f64>,
    /// `(index, score)` of every positive special-care margin
    pub special_care: Vec<(usize, f64)>,
    pub concept_scores: Vec<f64>,
    /// Indices of general concepts with a positive margin
    pub bad_concepts: Vec<usize>,
}

impl ConceptScore {
    /// Score one image from its similarities, in concept order
    pub fn evaluate(
        special_cos: &[f32],
        special_thresholds: &[f32],
        concept_cos: &[f32],
        concept_thresholds: &[f32],
    ) -> Self {
        let mut score = Self::default();
        let mut adjustment = 0.0;

        for (idx, (&cos, &threshold)) in special_cos.iter().zip(special_thresholds).enumerate() {
            let s = round3(cos as f64 - threshold as f64 + adjustment);
            score.special_scores.push(s);
            if s > 0.0 {
                score.special_care.push((idx, s));
                adjustment = SPECIAL_CARE_ADJUSTMENT;
            }
        }

        for (idx, (&cos, &threshold)) in concept_cos.iter().zip(concept_thresholds).enumerate() {
            let c = round3(cos as f64 - threshold as f64 + adjustment);
            score.concept_scores.push(c);
            if c > 0.0 {
                score.bad_concepts.push(idx);
            }
        }
        score
    }

    pub fn is_flagged(&self) -> bool {
        !self.bad_concepts.is_empty()
    }
}

/// Reference embeddings and thresholds, read-only after load
#[derive(Debug, Clone)]
pub struct ConceptReference {
    concept_embeds: Tensor,
    concept_thresholds: Tensor,
    special_embeds: Tensor,
    special_thresholds: Tensor,
}

impl ConceptReference {
    /// Load from the checker root (`concept_embeds`, `special_care_embeds`, ...)
    pub fn load(vb: &VarBuilder, projection_dim: usize) -> Result<Self> {
        Self::new(
            vb.get((CONCEPT_COUNT, projection_dim), "concept_embeds")?,
            vb.get(CONCEPT_COUNT, "concept_embeds_weights")?,
            vb.get((SPECIAL_CARE_COUNT, projection_dim), "special_care_embeds")?,
            vb.get(SPECIAL_CARE_COUNT, "special_care_embeds_weights")?,
        )
    }

    pub fn new(
        concept_embeds: Tensor,
        concept_thresholds: Tensor,
        special_embeds: Tensor,
        special_thresholds: Tensor,
    ) -> Result<Self> {
        Ok(Self {
            concept_embeds: concept_embeds.to_dtype(DType::F32)?,
            concept_thresholds: concept_thresholds.to_dtype(DType::F32)?,
            special_embeds: special_embeds.to_dtype(DType::F32)?,
            special_thresholds: special_thresholds.to_dtype(DType::F32)?,
        })
    }

    pub fn concept_count(&self) -> Result<usize> {
        Ok(self.concept_embeds.dim(0)?)
    }

    /// Full per-image scores for image embeddings [N, D]
    pub fn score_per_image(&self, image_embeds: &Tensor) -> Result<Vec<ConceptScore>> {
        let special_cos: Vec<Vec<f32>> =
            cosine_similarity(image_embeds, &self.special_embeds)?.to_vec2()?;
        let concept_cos: Vec<Vec<f32>> =
            cosine_similarity(image_embeds, &self.concept_embeds)?.to_vec2()?;
        let special_thresholds: Vec<f32> = self.special_thresholds.to_vec1()?;
        let concept_thresholds: Vec<f32> = self.concept_thresholds.to_vec1()?;

        Ok(special_cos
            .iter()
            .zip(&concept_cos)
            .map(|(special, concept)| {
                ConceptScore::evaluate(special, &special_thresholds, concept, &concept_thresholds)
            })
            .collect())
    }

    /// Flags from unrounded margins computed on the whole batch
    pub fn flag_batched(&self, image_embeds: &Tensor) -> Result<Vec<bool>> {
        let special_scores = cosine_similarity(image_embeds, &self.special_embeds)?
            .broadcast_sub(&self.special_thresholds)?;
        let special_care = special_scores.gt(0f32)?.max(D::Minus1)?.to_dtype(DType::F32)?;
        let adjustment = (special_care * SPECIAL_CARE_ADJUSTMENT)?.unsqueeze(1)?;

        let concept_scores = cosine_similarity(image_embeds, &self.concept_embeds)?
            .broadcast_sub(&self.concept_thresholds)?
            .broadcast_add(&adjustment)?;
        let flagged: Vec<u8> = concept_scores.gt(0f32)?.max(D::Minus1)?.to_vec1()?;
        Ok(flagged.into_iter().map(|f| f != 0).collect())
    }

    pub fn flags(&self, image_embeds: &Tensor, mode: ScoringMode) -> Result<Vec<bool>> {
        match mode {
            ScoringMode::PerImage => Ok(self
                .score_per_image(image_embeds)?
                .iter()
                .map(ConceptScore::is_flagged)
                .collect()),
            ScoringMode::Batched => self.flag_batched(image_embeds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t1(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    fn rows(values: &[[f32; 2]]) -> Tensor {
        Tensor::from_vec(values.concat(), (values.len(), 2), &Device::Cpu).unwrap()
    }

    /// one general concept along x, specials along x with configurable thresholds
    fn reference(concept_threshold: f32, special_thresholds: &[f32]) -> ConceptReference {
        let specials = vec![[1.0, 0.0]; special_thresholds.len()];
        ConceptReference::new(
            rows(&[[1.0, 0.0]]),
            t1(&[concept_threshold]),
            rows(&specials),
            t1(special_thresholds),
        )
        .unwrap()
    }

    #[test]
    fn test_round3_uses_exact_binary_value() {
        assert_eq!(round3(0.0125), 0.013);
        assert_eq!(round3(0.0005), 0.001);
        assert_eq!(round3(-0.0004), 0.0);
        assert_eq!(round3(0.1004), 0.1);
        assert_eq!(round3(2.675), 2.675);
        assert_eq!(round3(-0.0125), -0.013);
    }

    #[test]
    fn test_half_thousandth_margin_is_flagged() {
        let score = ConceptScore::evaluate(&[0.0], &[1.5], &[0.0005], &[0.0]);
        assert_eq!(score.concept_scores, vec![0.001]);
        assert!(score.is_flagged());
    }

    #[test]
    fn test_cosine_similarity() -> Result<()> {
        let a = rows(&[[3.0, 0.0], [0.0, 0.0]]);
        let b = rows(&[[1.0, 0.0], [1.0, 1.0]]);
        let sim: Vec<Vec<f32>> = cosine_similarity(&a, &b)?.to_vec2()?;
        assert!((sim[0][0] - 1.0).abs() < 1e-6);
        assert!((sim[0][1] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        // zero vectors are similar to nothing
        assert_eq!(sim[1], vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_special_care_tightens_general_check() -> Result<()> {
        let embeds = rows(&[[1.0, 0.0]]);

        // margin -0.005 alone is safe
        let calm = reference(1.005, &[1.5]);
        let score = &calm.score_per_image(&embeds)?[0];
        assert_eq!(score.concept_scores, vec![-0.005]);
        assert!(!score.is_flagged());

        // a positive special-care margin adds 0.01 and flips it
        let careful = reference(1.005, &[0.9]);
        let score = &careful.score_per_image(&embeds)?[0];
        assert_eq!(score.special_care, vec![(0, 0.1)]);
        assert_eq!(score.concept_scores, vec![0.005]);
        assert_eq!(score.bad_concepts, vec![0]);
        assert_eq!(careful.flags(&embeds, ScoringMode::Batched)?, vec![true]);
        Ok(())
    }

    #[test]
    fn test_adjustment_applies_to_later_specials_only() -> Result<()> {
        let reference = reference(2.0, &[1.005, 0.9, 1.005]);
        let score = &reference.score_per_image(&rows(&[[1.0, 0.0]]))?[0];
        assert_eq!(score.special_scores, vec![-0.005, 0.1, 0.005]);
        assert_eq!(score.special_care, vec![(1, 0.1), (2, 0.005)]);
        assert!(!score.is_flagged());
        Ok(())
    }

    #[test]
    fn test_rounding_divergence_between_modes() -> Result<()> {
        // margin of 0.0004 rounds to zero per image but stays positive batched
        let reference = reference(0.9996, &[1.5]);
        let embeds = rows(&[[1.0, 0.0]]);
        assert_eq!(reference.flags(&embeds, ScoringMode::PerImage)?, vec![false]);
        assert_eq!(reference.flags(&embeds, ScoringMode::Batched)?, vec![true]);
        Ok(())
    }

    #[test]
    fn test_batch_order_and_length() -> Result<()> {
        let reference = reference(0.5, &[1.5]);
        let embeds = rows(&[[0.0, 1.0], [1.0, 0.0], [1.0, 1.0]]);
        for mode in [ScoringMode::PerImage, ScoringMode::Batched] {
            assert_eq!(reference.flags(&embeds, mode)?, vec![false, true, true]);
        }
        Ok(())
    }

    #[test]
    fn test_parse_scoring_mode() {
        assert_eq!("batched".parse::<ScoringMode>().unwrap(), ScoringMode::Batched);
        assert_eq!("per-image".parse::<ScoringMode>().unwrap(), ScoringMode::PerImage);
        assert!("strict".parse::<ScoringMode>().is_err());
    }
}
