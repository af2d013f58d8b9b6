//! Sampler chain: top-k, then top-p, then temperature, then a seeded draw

use crate::config::SamplingParams;
use crate::runtime::{RuntimeError, TokenId};
use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};

pub struct SamplerChain {
    params: SamplingParams,
    processor: LogitsProcessor,
    masked: Vec<f32>,
}

impl SamplerChain {
    pub fn new(params: SamplingParams) -> Self {
        let processor = LogitsProcessor::from_sampling(
            params.seed,
            Sampling::All {
                temperature: params.temperature,
            },
        );
        Self {
            params,
            processor,
            masked: Vec::new(),
        }
    }

    /// Indices that survive top-k and then top-p, highest logit first
    fn candidates(&self, logits: &[f32]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..logits.len()).collect();
        let by_logit_desc = |a: &usize, b: &usize| logits[*b].total_cmp(&logits[*a]);

        let k = self.params.top_k.clamp(1, logits.len());
        if k < order.len() {
            order.select_nth_unstable_by(k - 1, by_logit_desc);
            order.truncate(k);
        }
        order.sort_unstable_by(by_logit_desc);

        let max = logits[order[0]];
        let weights: Vec<f64> = order
            .iter()
            .map(|&i| f64::from(logits[i] - max).exp())
            .collect();
        let total: f64 = weights.iter().sum();

        let mut cumulative = 0.0;
        let mut keep = order.len();
        for (n, w) in weights.iter().enumerate() {
            cumulative += w / total;
            if cumulative >= self.params.top_p {
                keep = n + 1;
                break;
            }
        }
        order.truncate(keep.max(1));
        order
    }

    /// Draw the next token from the logits of the last position
    pub fn sample(&mut self, logits: &[f32]) -> Result<TokenId, RuntimeError> {
        if logits.is_empty() {
            return Err(RuntimeError::Other("no logits to sample from".to_string()));
        }

        let keep = self.candidates(logits);
        self.masked.clear();
        self.masked.resize(logits.len(), f32::NEG_INFINITY);
        for i in keep {
            self.masked[i] = logits[i];
        }

        let tensor = Tensor::new(self.masked.as_slice(), &Device::Cpu)
            .map_err(|e| RuntimeError::Other(e.to_string()))?;
        self.processor
            .sample(&tensor)
            .map_err(|e| RuntimeError::Other(format!("sampling failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(top_k: usize, top_p: f64) -> SamplingParams {
        SamplingParams {
            top_k,
            top_p,
            ..SamplingParams::default()
        }
    }

    #[test]
    fn test_top_k_limits_candidates() {
        let chain = SamplerChain::new(params(2, 1.0));
        let keep = chain.candidates(&[0.1, 3.0, 2.0, 1.0]);
        assert_eq!(keep, vec![1, 2]);
    }

    #[test]
    fn test_top_p_keeps_dominant_token_only() {
        let chain = SamplerChain::new(params(40, 0.9));
        let keep = chain.candidates(&[0.0, 20.0, 0.0, 0.0]);
        assert_eq!(keep, vec![1]);
    }

    #[test]
    fn test_peaked_logits_sample_peak() {
        let mut chain = SamplerChain::new(SamplingParams::default());
        let mut logits = vec![0.0; 16];
        logits[7] = 50.0;
        for _ in 0..5 {
            assert_eq!(chain.sample(&logits).unwrap(), 7);
        }
    }

    #[test]
    fn test_same_seed_same_draws() {
        let logits: Vec<f32> = (0..32).map(|i| (i % 5) as f32 * 0.3).collect();
        let draw = || {
            let mut chain = SamplerChain::new(SamplingParams::default());
            (0..8).map(|_| chain.sample(&logits).unwrap()).collect::<Vec<_>>()
        };
        assert_eq!(draw(), draw());
    }

    #[test]
    fn test_empty_logits_error() {
        let mut chain = SamplerChain::new(SamplingParams::default());
        assert!(chain.sample(&[]).is_err());
    }
}
