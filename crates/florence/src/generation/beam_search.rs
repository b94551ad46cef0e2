use super::{
    log_softmax, LogitsProcessorList, MaxLength, SearchParams, Seq2SeqDecoder, StoppingCriterion,
};
use anyhow::{bail, Context};
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    score: f32,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    beam: usize,
    token: u32,
    score: f32,
}

/// Higher score first, ties broken by beam index and then token id.
fn rank_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.beam.cmp(&b.beam))
        .then(a.token.cmp(&b.token))
}

/// The best `k` finite candidates extending one beam.
fn top_candidates(beam: usize, beam_score: f32, scores: &[f32], k: usize) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = scores
        .iter()
        .enumerate()
        .map(|(token, &score)| Candidate {
            beam,
            token: token as u32,
            score: score + beam_score,
        })
        .filter(|c| c.score.is_finite())
        .collect();

    if candidates.len() > k && k > 0 {
        candidates.select_nth_unstable_by(k - 1, rank_candidates);
        candidates.truncate(k);
    }
    candidates
}

/// Finished sequences of a beam search, keeping the `num_beams` best.
#[derive(Debug, Clone)]
pub struct BeamHypotheses {
    num_beams: usize,
    length_penalty: f32,
    early_stopping: bool,
    hypotheses: Vec<(f32, Vec<u32>)>,
    worst_score: f32,
}

impl BeamHypotheses {
    pub fn new(num_beams: usize, length_penalty: f32, early_stopping: bool) -> Self {
        Self {
            num_beams,
            length_penalty,
            early_stopping,
            hypotheses: Vec::with_capacity(num_beams + 1),
            worst_score: f32::INFINITY,
        }
    }

    pub fn len(&self) -> usize {
        self.hypotheses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hypotheses.is_empty()
    }

    fn normalize(&self, sum_logprobs: f32, length: usize) -> f32 {
        sum_logprobs / (length.max(1) as f32).powf(self.length_penalty)
    }

    /// `length` is the sequence length without the closing eos.
    pub fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32, length: usize) {
        let score = self.normalize(sum_logprobs, length);
        if self.hypotheses.len() >= self.num_beams && score <= self.worst_score {
            return;
        }

        self.hypotheses.push((score, tokens));
        if self.hypotheses.len() > self.num_beams {
            if let Some(worst) = self
                .hypotheses
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.0.total_cmp(&b.0))
                .map(|(idx, _)| idx)
            {
                self.hypotheses.remove(worst);
            }
        }

        self.worst_score = self
            .hypotheses
            .iter()
            .map(|(score, _)| *score)
            .fold(f32::INFINITY, f32::min);
    }

    /// Whether no running beam can still beat the kept hypotheses.
    pub fn is_done(&self, best_sum_logprobs: f32, cur_len: usize) -> bool {
        if self.hypotheses.len() < self.num_beams {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        self.worst_score >= self.normalize(best_sum_logprobs, cur_len)
    }

    pub fn best(self) -> Option<(f32, Vec<u32>)> {
        self.hypotheses
            .into_iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
    }
}

/// Beams cut off by the max length. Their length leaves out the decoder start
/// token, matching what eos-closed hypotheses are scored on.
fn add_unfinished(hypotheses: &mut BeamHypotheses, beams: Vec<Beam>) {
    for beam in beams {
        let length = beam.tokens.len().saturating_sub(1);
        hypotheses.add(beam.tokens, beam.score, length);
    }
}

/// Deterministic beam search. Every step runs the decoder once over all live
/// beams, so the batch size is at most `num_beams`.
pub fn beam_search(
    decoder: &mut impl Seq2SeqDecoder,
    params: &SearchParams,
) -> anyhow::Result<Vec<u32>> {
    let num_beams = params.num_beams;
    let processors = LogitsProcessorList::from_params(params);
    let max_length = MaxLength::new(params.max_length);
    let mut hypotheses =
        BeamHypotheses::new(num_beams, params.length_penalty, params.early_stopping);

    let mut beams = vec![Beam {
        tokens: vec![params.decoder_start_token_id],
        score: 0.0,
    }];
    let mut done = false;

    while beams
        .first()
        .is_some_and(|b| !max_length.should_stop(&b.tokens))
    {
        let cur_len = beams[0].tokens.len();
        let sequences: Vec<Vec<u32>> = beams.iter().map(|b| b.tokens.clone()).collect();

        let logits = decoder.next_token_logits(&sequences)?;
        if logits.nrows() != beams.len() {
            bail!(
                "decoder returned {} rows for {} beams",
                logits.nrows(),
                beams.len()
            );
        }

        let mut candidates = Vec::with_capacity(beams.len() * 2 * num_beams);
        for (idx, beam) in beams.iter().enumerate() {
            let mut scores = log_softmax(logits.row(idx)).to_vec();
            processors.process(&beam.tokens, &mut scores);
            candidates.extend(top_candidates(idx, beam.score, &scores, 2 * num_beams));
        }
        candidates.sort_by(rank_candidates);
        candidates.truncate(2 * num_beams);

        let best_score = candidates.first().map(|c| c.score);

        let mut next_beams = Vec::with_capacity(num_beams);
        for (rank, candidate) in candidates.iter().enumerate() {
            let parent = &beams[candidate.beam].tokens;

            if candidate.token == params.eos_token_id {
                if rank >= num_beams {
                    continue;
                }
                let mut tokens = parent.clone();
                tokens.push(candidate.token);
                hypotheses.add(tokens, candidate.score, cur_len);
            } else {
                let mut tokens = parent.clone();
                tokens.push(candidate.token);
                next_beams.push(Beam {
                    tokens,
                    score: candidate.score,
                });
            }

            if next_beams.len() == num_beams {
                break;
            }
        }

        if let Some(best_score) = best_score {
            done = hypotheses.is_done(best_score, cur_len);
        }

        beams = next_beams;
        if done {
            break;
        }
    }

    if !done {
        add_unfinished(&mut hypotheses, beams);
    }

    debug!("beam search finished with {} hypotheses", hypotheses.len());
    let (score, tokens) = hypotheses.best().context("beam search found no hypothesis")?;
    debug!(score, length = tokens.len(), "best hypothesis");

    Ok(tokens)
}
