//! Generation quality metrics
//!
//! ROUGE-1/2/L F-scores (scaled to 0-100) and sentence BLEU-4 with
//! geometric-sequence smoothing, averaged over a set of predictions.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::data::{ChatTokenizer, IGNORE_INDEX};
use crate::error::Result;

/// Mean scores over a prediction set
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    /// Unigram ROUGE F, 0-100
    #[serde(rename = "rouge-1")]
    pub rouge_1: f64,
    /// Bigram ROUGE F, 0-100
    #[serde(rename = "rouge-2")]
    pub rouge_2: f64,
    /// LCS-based ROUGE F, 0-100
    #[serde(rename = "rouge-l")]
    pub rouge_l: f64,
    /// Smoothed sentence BLEU, 0-1
    #[serde(rename = "bleu-4")]
    pub bleu_4: f64,
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF
        | 0x3400..=0x4DBF
        | 0x20000..=0x2A6DF
        | 0xF900..=0xFAFF
        | 0x3040..=0x30FF
        | 0xAC00..=0xD7AF
    )
}

/// Split text into word tokens.
///
/// CJK characters and punctuation become single-character tokens, runs of
/// other alphanumerics form words, whitespace separates.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    for c in text.chars() {
        if c.is_alphanumeric() && !is_cjk(c) {
            word.push(c);
            continue;
        }
        if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
        if !c.is_whitespace() {
            tokens.push(c.to_string());
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

fn ngrams(tokens: &[String], n: usize) -> Vec<&[String]> {
    if n == 0 || tokens.len() < n {
        return Vec::new();
    }
    tokens.windows(n).collect()
}

fn f_score(overlap: usize, hyp: usize, reference: usize) -> f64 {
    if hyp == 0 || reference == 0 {
        return 0.0;
    }
    let precision = overlap as f64 / hyp as f64;
    let recall = overlap as f64 / reference as f64;
    2.0 * precision * recall / (precision + recall + 1e-8)
}

/// ROUGE-N F-score over distinct n-grams
pub fn rouge_n(hypothesis: &[String], reference: &[String], n: usize) -> f64 {
    let hyp: HashSet<&[String]> = ngrams(hypothesis, n).into_iter().collect();
    let reference: HashSet<&[String]> = ngrams(reference, n).into_iter().collect();
    let overlap = hyp.intersection(&reference).count();
    f_score(overlap, hyp.len(), reference.len())
}

fn lcs_len(a: &[String], b: &[String]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// ROUGE-L F-score (LCS based, beta = P / R)
pub fn rouge_l(hypothesis: &[String], reference: &[String]) -> f64 {
    if hypothesis.is_empty() || reference.is_empty() {
        return 0.0;
    }
    let lcs = lcs_len(hypothesis, reference) as f64;
    let precision = lcs / hypothesis.len() as f64;
    let recall = lcs / reference.len() as f64;
    let beta = precision / (recall + 1e-12);
    let num = (1.0 + beta * beta) * recall * precision;
    let denom = recall + beta * beta * precision;
    if denom == 0.0 {
        0.0
    } else {
        num / (denom + 1e-8)
    }
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    for gram in ngrams(tokens, n) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    counts
}

/// Sentence BLEU-4 against a single reference.
///
/// Orders without any match get precision `1 / (2^k * total)`, where `k`
/// counts the zero-match orders seen so far.
pub fn bleu_4(hypothesis: &[String], reference: &[String]) -> f64 {
    if hypothesis.is_empty() {
        return 0.0;
    }

    let mut precisions = Vec::with_capacity(4);
    let mut smoothing_exp = 1;
    for n in 1..=4 {
        let hyp_counts = ngram_counts(hypothesis, n);
        let ref_counts = ngram_counts(reference, n);
        let matches: usize = hyp_counts
            .iter()
            .map(|(gram, &count)| count.min(ref_counts.get(gram).copied().unwrap_or(0)))
            .sum();
        let total = hypothesis.len().saturating_sub(n - 1).max(1);

        if n == 1 && matches == 0 {
            return 0.0;
        }
        if matches == 0 {
            precisions.push(1.0 / (2f64.powi(smoothing_exp) * total as f64));
            smoothing_exp += 1;
        } else {
            precisions.push(matches as f64 / total as f64);
        }
    }

    let c = hypothesis.len() as f64;
    let r = reference.len() as f64;
    let brevity_penalty = if c > r { 1.0 } else { (1.0 - r / c).exp() };

    let log_sum: f64 = precisions.iter().map(|p| 0.25 * p.ln()).sum();
    brevity_penalty * log_sum.exp()
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn to_token_ids(ids: &[i64], pad_token_id: u32) -> Vec<u32> {
    ids.iter()
        .filter_map(|&id| {
            if id == IGNORE_INDEX {
                Some(pad_token_id)
            } else {
                u32::try_from(id).ok()
            }
        })
        .collect()
}

/// Score generated ids against reference ids.
///
/// `-100` entries are mapped to the pad id before decoding with special
/// tokens skipped.
pub fn compute_metrics(
    predictions: &[Vec<i64>],
    labels: &[Vec<i64>],
    tokenizer: &dyn ChatTokenizer,
) -> Result<GenerationMetrics> {
    let pad = tokenizer.pad_token_id();
    let mut sums = GenerationMetrics::default();
    let mut count = 0usize;

    for (pred_ids, label_ids) in predictions.iter().zip(labels) {
        let pred_text = tokenizer.decode(&to_token_ids(pred_ids, pad), true)?;
        let label_text = tokenizer.decode(&to_token_ids(label_ids, pad), true)?;
        let pred_tokens = tokenize(pred_text.trim());
        let label_tokens = tokenize(label_text.trim());

        sums.rouge_1 += round4(rouge_n(&pred_tokens, &label_tokens, 1) * 100.0);
        sums.rouge_2 += round4(rouge_n(&pred_tokens, &label_tokens, 2) * 100.0);
        sums.rouge_l += round4(rouge_l(&pred_tokens, &label_tokens) * 100.0);
        sums.bleu_4 += bleu_4(&pred_tokens, &label_tokens);
        count += 1;
    }

    if count == 0 {
        return Ok(sums);
    }
    let n = count as f64;
    Ok(GenerationMetrics {
        rouge_1: sums.rouge_1 / n,
        rouge_2: sums.rouge_2 / n,
        rouge_l: sums.rouge_l / n,
        bleu_4: sums.bleu_4 / n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::mock_data::MockTokenizer;
    use approx::assert_relative_eq;

    fn toks(text: &str) -> Vec<String> {
        tokenize(text)
    }

    #[test]
    fn test_tokenize_mixed_text() {
        assert_eq!(toks("Hello, world!"), vec!["Hello", ",", "world", "!"]);
        assert_eq!(toks("我爱 Rust"), vec!["我", "爱", "Rust"]);
        assert!(toks("   ").is_empty());
    }

    #[test]
    fn test_identical_texts_score_max() {
        let t = toks("the cat sat on the mat");
        assert_relative_eq!(rouge_n(&t, &t, 1), 1.0, epsilon = 1e-6);
        assert_relative_eq!(rouge_n(&t, &t, 2), 1.0, epsilon = 1e-6);
        assert_relative_eq!(rouge_l(&t, &t), 1.0, epsilon = 1e-6);
        assert_relative_eq!(bleu_4(&t, &t), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_disjoint_texts_score_zero() {
        let a = toks("alpha beta");
        let b = toks("gamma delta");
        assert_eq!(rouge_n(&a, &b, 1), 0.0);
        assert_eq!(rouge_l(&a, &b), 0.0);
        assert_eq!(bleu_4(&a, &b), 0.0);
    }

    #[test]
    fn test_rouge_partial_overlap() {
        let hyp = toks("the cat sat");
        let reference = toks("the cat ran away");
        // unigrams: 2 shared of 3 and 4 -> P=2/3 R=1/2
        let expected = 2.0 * (2.0 / 3.0) * 0.5 / (2.0 / 3.0 + 0.5);
        assert_relative_eq!(rouge_n(&hyp, &reference, 1), expected, epsilon = 1e-6);
        assert_relative_eq!(lcs_len(&hyp, &reference) as f64, 2.0);
    }

    #[test]
    fn test_bleu_smoothing_on_short_match() {
        let hyp = toks("a b c");
        let reference = toks("a b c");
        // p1=p2=p3=1, p4 has no 4-grams -> 1/(2*1)
        let expected = (0.25 * 0.5f64.ln()).exp();
        assert_relative_eq!(bleu_4(&hyp, &reference), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_compute_metrics_maps_ignore_index() {
        let tokenizer = MockTokenizer::new();
        let ids: Vec<i64> = ["the", "cat", "sat", "on", "the", "mat"]
            .iter()
            .map(|w| tokenizer.id_of(w) as i64)
            .collect();
        let mut labels = ids.clone();
        labels.push(IGNORE_INDEX);

        let metrics = compute_metrics(&[ids], &[labels], &tokenizer).unwrap();
        assert_relative_eq!(metrics.rouge_1, 100.0, epsilon = 1e-3);
        assert_relative_eq!(metrics.rouge_l, 100.0, epsilon = 1e-3);
        assert_relative_eq!(metrics.bleu_4, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_metrics_serialize_with_dashed_keys() {
        let json = serde_json::to_value(GenerationMetrics::default()).unwrap();
        assert!(json.get("rouge-1").is_some());
        assert!(json.get("bleu-4").is_some());
    }
}
