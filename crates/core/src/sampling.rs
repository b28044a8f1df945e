//! Token sampling over full-vocabulary logits.

use candle_core::{DType, Result, Tensor, D};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Per-batch sampling parameters. Greedy sampling ignores everything here.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            seed: None,
        }
    }
}

/// Turns `[seqs, vocab]` logits into one token id per sequence.
pub trait Sampler: Send + Sync {
    fn sample(&self, logits: &Tensor, params: &SamplingParams) -> Result<Vec<u32>>;
}

/// Argmax over the vocabulary.
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn sample(&self, logits: &Tensor, _params: &SamplingParams) -> Result<Vec<u32>> {
        logits.argmax(D::Minus1)?.to_vec1::<u32>()
    }
}

/// Temperature sampling from the softmax distribution.
pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn sample(&self, logits: &Tensor, params: &SamplingParams) -> Result<Vec<u32>> {
        if params.temperature <= 0.0 {
            return GreedySampler.sample(logits, params);
        }
        let scaled = (logits.to_dtype(DType::F32)? / params.temperature as f64)?;
        let probs = candle_nn::ops::softmax(&scaled, D::Minus1)?.to_vec2::<f32>()?;

        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut tokens = Vec::with_capacity(probs.len());
        for row in &probs {
            let draw: f32 = rng.gen();
            let mut acc = 0.0;
            let mut picked = row.len() as u32 - 1;
            for (id, &p) in row.iter().enumerate() {
                acc += p;
                if draw < acc {
                    picked = id as u32;
                    break;
                }
            }
            tokens.push(picked);
        }
        Ok(tokens)
    }
}
