//! Structured prompt weighting
//!
//! Syntax:
//! - `(text)1.3` scales `text` by 1.3
//! - `word+` / `(text)++` multiply by 1.1 per `+`, `-` multiplies by 0.9
//! - bare `(text)` only groups; nested groups multiply
//! - `\(`, `\)`, `\+`, `\-` are literal
//!
//! A weight is applied per token by moving its embedding away from (or
//! towards) the empty-prompt embedding: `empty + (z - empty) * w`.
//! Prompts longer than one CLIP window are encoded in 77-token windows and
//! concatenated along the sequence axis.

use candle_core::Tensor;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::models::{TextConditioner, CLIP_MAX_LENGTH};

const UPWEIGHT: f64 = 1.1;
const DOWNWEIGHT: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct PromptFragment {
    pub text: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Group(Vec<Node>, f64),
}

/// Split a prompt into weighted fragments
///
/// Adjacent fragments with the same weight are merged. Unbalanced
/// parentheses are kept as literal text.
pub fn parse_weighted_prompt(prompt: &str) -> Vec<PromptFragment> {
    let chars: Vec<char> = prompt.chars().collect();
    let mut pos = 0;
    let nodes = parse_sequence(&chars, &mut pos, false);

    let mut fragments: Vec<PromptFragment> = Vec::new();
    flatten(&nodes, 1.0, &mut fragments);
    fragments
}

fn flatten(nodes: &[Node], weight: f64, out: &mut Vec<PromptFragment>) {
    for node in nodes {
        match node {
            Node::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                match out.last_mut() {
                    Some(last) if last.weight == weight => {
                        last.text.push(' ');
                        last.text.push_str(text);
                    }
                    _ => out.push(PromptFragment {
                        text: text.to_string(),
                        weight,
                    }),
                }
            }
            Node::Group(children, w) => flatten(children, weight * w, out),
        }
    }
}

fn parse_sequence(chars: &[char], pos: &mut usize, in_group: bool) -> Vec<Node> {
    let mut nodes = Vec::new();
    let mut text = String::new();

    while *pos < chars.len() {
        let c = chars[*pos];
        match c {
            '\\' if *pos + 1 < chars.len() => {
                text.push(chars[*pos + 1]);
                *pos += 2;
            }
            '(' if has_closing_paren(chars, *pos + 1) => {
                *pos += 1;
                flush(&mut text, &mut nodes);
                let children = parse_sequence(chars, pos, true);
                // consume ')'
                *pos += 1;
                let weight = parse_weight_suffix(chars, pos).unwrap_or(1.0);
                nodes.push(Node::Group(children, weight));
            }
            ')' if in_group => break,
            '+' | '-' if ends_in_word(&text) => match plus_minus_run(chars, *pos) {
                Some((weight, len)) => {
                    let word = split_last_word(&mut text);
                    flush(&mut text, &mut nodes);
                    nodes.push(Node::Group(vec![Node::Text(word)], weight));
                    *pos += len;
                }
                None => {
                    text.push(c);
                    *pos += 1;
                }
            },
            _ => {
                text.push(c);
                *pos += 1;
            }
        }
    }

    flush(&mut text, &mut nodes);
    nodes
}

fn flush(text: &mut String, nodes: &mut Vec<Node>) {
    if !text.is_empty() {
        nodes.push(Node::Text(std::mem::take(text)));
    }
}

fn has_closing_paren(chars: &[char], mut pos: usize) -> bool {
    let mut depth = 0usize;
    while pos < chars.len() {
        match chars[pos] {
            '\\' => pos += 1,
            '(' => depth += 1,
            ')' if depth == 0 => return true,
            ')' => depth -= 1,
            _ => {}
        }
        pos += 1;
    }
    false
}

fn ends_in_word(text: &str) -> bool {
    text.chars().last().is_some_and(|c| !c.is_whitespace())
}

fn split_last_word(text: &mut String) -> String {
    let start = text
        .rfind(char::is_whitespace)
        .map(|i| i + text[i..].chars().next().map_or(1, char::len_utf8))
        .unwrap_or(0);
    text.split_off(start)
}

/// A `+`/`-` run counts as a weight only when it ends the word
fn plus_minus_run(chars: &[char], start: usize) -> Option<(f64, usize)> {
    let len = chars[start..]
        .iter()
        .take_while(|c| matches!(c, '+' | '-'))
        .count();
    match chars.get(start + len) {
        None => {}
        Some(c) if c.is_whitespace() || matches!(c, ')' | ',' | '.') => {}
        Some(_) => return None,
    }
    Some((run_weight(&chars[start..start + len]), len))
}

fn run_weight(run: &[char]) -> f64 {
    run.iter().fold(1.0, |w, c| match c {
        '+' => w * UPWEIGHT,
        _ => w * DOWNWEIGHT,
    })
}

fn parse_weight_suffix(chars: &[char], pos: &mut usize) -> Option<f64> {
    let start = *pos;
    let numeric = number_len(chars, start);
    if numeric > 0 {
        let literal: String = chars[start..start + numeric].iter().collect();
        let weight = literal.parse::<f64>().ok()?;
        *pos += numeric;
        return Some(weight);
    }
    let (weight, len) = plus_minus_run(chars, start).filter(|(_, len)| *len > 0)?;
    *pos += len;
    Some(weight)
}

/// Length of `digits[.digits]` at `start`; a `.` counts only before a digit
fn number_len(chars: &[char], start: usize) -> usize {
    let digits = |from: usize| {
        chars[from.min(chars.len())..]
            .iter()
            .take_while(|c| c.is_ascii_digit())
            .count()
    };
    let int = digits(start);
    let dot = start + int;
    if chars.get(dot) == Some(&'.') {
        let frac = digits(dot + 1);
        if frac > 0 {
            return int + 1 + frac;
        }
    }
    int
}

/// Turns weighted prompts into conditioning embeddings
pub struct PromptWeighting {
    text: Arc<TextConditioner>,
    truncate_long_prompts: bool,
}

impl PromptWeighting {
    /// Long prompts are windowed, not truncated
    pub fn new(text: Arc<TextConditioner>) -> Self {
        Self {
            text,
            truncate_long_prompts: false,
        }
    }

    pub fn with_truncation(mut self, truncate: bool) -> Self {
        self.truncate_long_prompts = truncate;
        self
    }

    /// Empty-prompt embedding, [1, 77, hidden]
    pub fn empty_window(&self) -> Result<Tensor> {
        self.text.encode_window(&[])
    }

    /// Weighted embedding of `prompt`, [1, 77 * windows, hidden]
    pub fn embed(&self, prompt: &str) -> Result<Tensor> {
        let tokenizer = self.text.tokenizer();
        let mut ids = Vec::new();
        let mut weights = Vec::new();
        for fragment in parse_weighted_prompt(prompt) {
            let fragment_ids = tokenizer.token_ids(&fragment.text)?;
            weights.extend(std::iter::repeat(fragment.weight).take(fragment_ids.len()));
            ids.extend(fragment_ids);
        }

        let per_window = tokenizer.max_content_tokens();
        if self.truncate_long_prompts {
            ids.truncate(per_window);
            weights.truncate(per_window);
        }

        let empty = self.empty_window()?;
        if ids.is_empty() {
            return Ok(empty);
        }

        let windows = ids
            .chunks(per_window)
            .zip(weights.chunks(per_window))
            .map(|(ids, weights)| self.weighted_window(ids, weights, &empty))
            .collect::<Result<Vec<_>>>()?;
        debug!(tokens = ids.len(), windows = windows.len(), "Weighted prompt encoded");
        Ok(Tensor::cat(&windows, 1)?)
    }

    fn weighted_window(&self, ids: &[u32], weights: &[f64], empty: &Tensor) -> Result<Tensor> {
        let z = self.text.encode_window(ids)?;
        if weights.iter().all(|&w| w == 1.0) {
            return Ok(z);
        }

        // start token at 0, content from 1, end and padding unweighted
        let mut per_position = vec![1f32; CLIP_MAX_LENGTH];
        for (slot, &w) in per_position[1..].iter_mut().zip(weights) {
            *slot = w as f32;
        }
        let scale = Tensor::from_vec(per_position, (1, CLIP_MAX_LENGTH, 1), z.device())?
            .to_dtype(z.dtype())?;

        let delta = (&z - empty)?.broadcast_mul(&scale)?;
        Ok((empty + delta)?)
    }

    /// Pad the shorter of two embeddings with empty windows so both have the
    /// same sequence length
    pub fn pad_pair(&self, cond: Tensor, uncond: Tensor) -> Result<(Tensor, Tensor)> {
        let (cond_len, uncond_len) = (cond.dim(1)?, uncond.dim(1)?);
        if cond_len == uncond_len {
            return Ok((cond, uncond));
        }
        let empty = self.empty_window()?.to_dtype(cond.dtype())?;
        let pad = |emb: Tensor, missing: usize| -> Result<Tensor> {
            let mut parts = vec![emb];
            parts.extend(std::iter::repeat(empty.clone()).take(missing / CLIP_MAX_LENGTH));
            Ok(Tensor::cat(&parts, 1)?)
        };
        if cond_len < uncond_len {
            Ok((pad(cond, uncond_len - cond_len)?, uncond))
        } else {
            let uncond = pad(uncond, cond_len - uncond_len)?;
            Ok((cond, uncond))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::embedding_conditioner;

    fn fragments(prompt: &str) -> Vec<(String, f64)> {
        parse_weighted_prompt(prompt)
            .into_iter()
            .map(|f| (f.text, f.weight))
            .collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_explicit_weight() {
        assert_eq!(
            fragments("a (red)1.5 cube"),
            vec![
                ("a".to_string(), 1.0),
                ("red".to_string(), 1.5),
                ("cube".to_string(), 1.0),
            ]
        );
        assert_eq!(
            fragments("a (red)1.5. cube"),
            vec![
                ("a".to_string(), 1.0),
                ("red".to_string(), 1.5),
                (". cube".to_string(), 1.0),
            ]
        );
        assert_eq!(fragments("(red).5, cube")[0], ("red".to_string(), 0.5));
        assert_eq!(fragments("(red)2."), vec![("red".to_string(), 2.0), (".".to_string(), 1.0)]);
    }

    #[test]
    fn test_plus_minus_runs() {
        let f = fragments("a ball++");
        assert_eq!(f[1].0, "ball");
        assert!(approx(f[1].1, 1.21));

        let f = fragments("(dark forest)- at night");
        assert_eq!(f[0].0, "dark forest");
        assert!(approx(f[0].1, 0.9));
        assert_eq!(f[1], ("at night".to_string(), 1.0));
    }

    #[test]
    fn test_nested_groups_multiply() {
        let f = fragments("((a)1.5 b)2");
        assert_eq!(f.len(), 2);
        assert_eq!(f[0].0, "a");
        assert!(approx(f[0].1, 3.0));
        assert_eq!(f[1], ("b".to_string(), 2.0));
    }

    #[test]
    fn test_literals() {
        assert_eq!(fragments("sci-fi city"), vec![("sci-fi city".to_string(), 1.0)]);
        assert_eq!(fragments("a - b"), vec![("a - b".to_string(), 1.0)]);
        assert_eq!(fragments(r"\(red\)1.5"), vec![("(red)1.5".to_string(), 1.0)]);
        assert_eq!(fragments("(unclosed red"), vec![("(unclosed red".to_string(), 1.0)]);
        assert_eq!(fragments("(plain) group"), vec![("plain group".to_string(), 1.0)]);
        assert!(fragments("").is_empty());
    }

    #[test]
    fn test_unit_weight_matches_plain_encoding() -> Result<()> {
        let text = Arc::new(embedding_conditioner());
        let weighting = PromptWeighting::new(text.clone());
        let weighted: Vec<f32> = weighting.embed("a red cube")?.flatten_all()?.to_vec1()?;
        let plain: Vec<f32> = text.encode("a red cube")?.flatten_all()?.to_vec1()?;
        assert_eq!(weighted, plain);
        Ok(())
    }

    #[test]
    fn test_weight_scales_away_from_empty() -> Result<()> {
        let weighting = PromptWeighting::new(Arc::new(embedding_conditioner()));
        let emb = weighting.embed("(red)2")?.squeeze(0)?;
        // empty[1] is the end token (id 2), z[1] is "red" (id 4)
        let red: Vec<f32> = emb.get(1)?.to_vec1()?;
        assert_eq!(red, vec![2.0 + (4.0 - 2.0) * 2.0, 1.0]);
        // position 2 is the end token in both
        let end: Vec<f32> = emb.get(2)?.to_vec1()?;
        assert_eq!(end, vec![2.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_long_prompts_are_windowed() -> Result<()> {
        let weighting = PromptWeighting::new(Arc::new(embedding_conditioner()));
        let prompt = vec!["red"; 100].join(" ");
        let cond = weighting.embed(&prompt)?;
        assert_eq!(cond.dims(), &[1, 2 * CLIP_MAX_LENGTH, 2]);

        let uncond = weighting.embed("")?;
        assert_eq!(uncond.dims(), &[1, CLIP_MAX_LENGTH, 2]);

        let (cond, uncond) = weighting.pad_pair(cond, uncond)?;
        assert_eq!(cond.dims(), uncond.dims());

        let truncating = PromptWeighting::new(Arc::new(embedding_conditioner())).with_truncation(true);
        assert_eq!(truncating.embed(&prompt)?.dim(1)?, CLIP_MAX_LENGTH);
        Ok(())
    }
}
