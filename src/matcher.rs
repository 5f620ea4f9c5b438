//! Top-k text-to-image matching over a labelled candidate pool.
//!
//! Candidates arrive in batches. Each batch is scored against the query by a
//! [`BatchScorer`], softmax-normalized on its own, and appended to one score
//! vector in candidate order. Probabilities from different batches are never
//! renormalized against each other.

use std::cell::RefCell;
use std::cmp::Ordering;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::embeddings::{cosine_similarity, TextEncoder};
use crate::records::CaptionEntry;

/// Number of matches kept per query.
pub const DEFAULT_TOP_K: usize = 5;
/// CLIP's learned temperature.
pub const DEFAULT_LOGIT_SCALE: f32 = 100.0;

/// Scores one batch of candidates against a text query.
pub trait BatchScorer<C> {
    /// Returns exactly one logit per candidate, in batch order.
    fn score_batch(&self, query: &str, batch: &[C]) -> Result<Vec<f32>>;
}

/// Candidate carrying a label that identifies the ground truth.
pub trait Labelled {
    /// Identifier compared against the expected answer.
    fn label(&self) -> &str;
}

/// Image from the candidate pool with its precomputed embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedImage {
    /// Image file name.
    pub name: String,
    /// Image embedding.
    pub embedding: Vec<f32>,
}

impl Labelled for EmbeddedImage {
    fn label(&self) -> &str {
        &self.name
    }
}

/// Ranking of a whole candidate pool for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedMatches {
    /// Index of the highest score; the first one wins on ties.
    pub best: usize,
    /// Per-batch softmax probabilities in candidate order.
    pub scores: Vec<f32>,
    /// Indices of the top-k candidates by descending score.
    pub top: Vec<usize>,
}

/// Softmax with the maximum subtracted for numerical stability.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&x| x / sum).collect()
}

/// Index of the largest score under `f32::total_cmp`; the earliest index
/// wins on ties.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in scores.iter().enumerate() {
        match best {
            Some((_, current)) if score.total_cmp(&current) != Ordering::Greater => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Indices of the `k` largest scores in descending order, using the same
/// ordering as [`argmax`]. The sort is stable, so equal scores keep candidate
/// order.
pub fn top_k_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order.truncate(k);
    order
}

/// Ranks every candidate yielded by `batches` against `query`.
///
/// Returns `None` when the pool is empty.
pub fn rank_candidates<'b, C, I, S>(
    query: &str,
    batches: I,
    scorer: &S,
    k: usize,
) -> Result<Option<RankedMatches>>
where
    C: 'b,
    I: IntoIterator<Item = &'b [C]>,
    S: BatchScorer<C> + ?Sized,
{
    let mut scores = Vec::new();
    for (batch_idx, batch) in batches.into_iter().enumerate() {
        if batch.is_empty() {
            continue;
        }
        let logits = scorer
            .score_batch(query, batch)
            .with_context(|| format!("failed to score batch {batch_idx}"))?;
        anyhow::ensure!(
            logits.len() == batch.len(),
            "scorer returned {} logits for a batch of {}",
            logits.len(),
            batch.len()
        );
        if let Some(pos) = logits.iter().position(|l| !l.is_finite()) {
            anyhow::bail!(
                "scorer returned non-finite logit {} for candidate {} of batch {}",
                logits[pos],
                pos,
                batch_idx
            );
        }
        scores.extend(softmax(&logits));
    }
    let Some(best) = argmax(&scores) else {
        return Ok(None);
    };
    let top = top_k_indices(&scores, k);
    Ok(Some(RankedMatches { best, scores, top }))
}

/// Scores images by scaled cosine similarity to the embedded query.
///
/// The query embedding is computed once and reused for every batch of the
/// same query.
pub struct EmbeddingScorer<'a, E: ?Sized> {
    encoder: &'a E,
    logit_scale: f32,
    cached: RefCell<Option<(String, Vec<f32>)>>,
}

impl<'a, E: TextEncoder + ?Sized> EmbeddingScorer<'a, E> {
    /// Scorer with the default CLIP logit scale.
    pub fn new(encoder: &'a E) -> Self {
        Self::with_logit_scale(encoder, DEFAULT_LOGIT_SCALE)
    }

    /// Scorer with a custom logit scale.
    pub fn with_logit_scale(encoder: &'a E, logit_scale: f32) -> Self {
        Self {
            encoder,
            logit_scale,
            cached: RefCell::new(None),
        }
    }

    fn query_embedding(&self, query: &str) -> Result<Vec<f32>> {
        if let Some((cached_query, embedding)) = self.cached.borrow().as_ref() {
            if cached_query == query {
                return Ok(embedding.clone());
            }
        }
        let embedding = self
            .encoder
            .encode_text(query)
            .context("failed to embed query text")?;
        *self.cached.borrow_mut() = Some((query.to_string(), embedding.clone()));
        Ok(embedding)
    }
}

impl<E: TextEncoder + ?Sized> BatchScorer<EmbeddedImage> for EmbeddingScorer<'_, E> {
    fn score_batch(&self, query: &str, batch: &[EmbeddedImage]) -> Result<Vec<f32>> {
        let text = self.query_embedding(query)?;
        batch
            .iter()
            .map(|image| -> Result<f32> {
                anyhow::ensure!(
                    image.embedding.len() == text.len(),
                    "image {} has embedding dimension {}, query has {}",
                    image.name,
                    image.embedding.len(),
                    text.len()
                );
                Ok(self.logit_scale * cosine_similarity(&text, &image.embedding))
            })
            .collect()
    }
}

/// Outcome of one evaluation query.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CaseOutcome {
    /// Expected image.
    pub image: String,
    /// Query caption.
    pub caption: String,
    /// Label of the best match.
    pub predicted: String,
    /// Labels of the top-k matches, best first.
    pub top_k: Vec<String>,
    /// Expected image found anywhere in the top-k.
    pub hit: bool,
    /// Expected image ranked first.
    pub top1_hit: bool,
}

/// Aggregate evaluation result; serialized as `test_results.json`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvalReport {
    /// Top-k hit rate over evaluated cases.
    pub accuracy: f64,
    /// Rank-1 hit rate over evaluated cases.
    pub top1_accuracy: f64,
    /// Cases with a top-k hit.
    pub hits: usize,
    /// Cases evaluated.
    pub total: usize,
    /// Matches kept per query.
    pub k: usize,
    /// Per-case detail.
    pub cases: Vec<CaseOutcome>,
}

/// Runs every case's caption against `pool` in batches of `batch_size` and
/// counts a hit when the case's image file name is among the top `k`.
pub fn evaluate<C, S>(
    cases: &[CaptionEntry],
    pool: &[C],
    scorer: &S,
    batch_size: usize,
    k: usize,
) -> Result<EvalReport>
where
    C: Labelled,
    S: BatchScorer<C> + ?Sized,
{
    anyhow::ensure!(batch_size > 0, "batch size must be positive");
    let mut outcomes = Vec::with_capacity(cases.len());
    for case in cases {
        let Some(ranked) = rank_candidates(&case.caption, pool.chunks(batch_size), scorer, k)?
        else {
            debug!(image = %case.image, "empty candidate pool; case skipped");
            continue;
        };
        let expected = file_name(&case.image);
        let top_k: Vec<String> = ranked
            .top
            .iter()
            .map(|&idx| pool[idx].label().to_string())
            .collect();
        let predicted = pool[ranked.best].label().to_string();
        let hit = top_k.iter().any(|label| file_name(label) == expected);
        let top1_hit = file_name(&predicted) == expected;
        debug!(image = %case.image, %predicted, hit, "case ranked");
        outcomes.push(CaseOutcome {
            image: case.image.clone(),
            caption: case.caption.clone(),
            predicted,
            top_k,
            hit,
            top1_hit,
        });
    }

    let total = outcomes.len();
    let hits = outcomes.iter().filter(|o| o.hit).count();
    let top1 = outcomes.iter().filter(|o| o.top1_hit).count();
    let rate = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };
    let report = EvalReport {
        accuracy: rate(hits),
        top1_accuracy: rate(top1),
        hits,
        total,
        k,
        cases: outcomes,
    };
    info!(
        accuracy = report.accuracy,
        top1_accuracy = report.top1_accuracy,
        total,
        "evaluation finished"
    );
    Ok(report)
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}
