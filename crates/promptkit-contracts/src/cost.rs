use serde::{Deserialize, Serialize};

/// Token and dollar accounting for a single provider call, or the running
/// total across a conversation. Invariant (enforced by callers, not by this
/// type): the total across a conversation is monotonically increasing and
/// equals the sum of per-call costs, each computed as
/// `input_tokens * input_rate + output_tokens * output_rate` for the
/// `(provider_id, model_id)` pair that produced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostInfo {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl CostInfo {
    pub fn new(input_tokens: u64, output_tokens: u64, cached_tokens: u64, cost_usd: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cached_tokens,
            estimated_cost_usd: cost_usd,
        }
    }

    pub fn add(&mut self, other: &CostInfo) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.estimated_cost_usd += other.estimated_cost_usd;
    }
}

impl std::ops::Add for CostInfo {
    type Output = CostInfo;

    fn add(mut self, rhs: CostInfo) -> CostInfo {
        self.add(&rhs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_monotonic() {
        let mut total = CostInfo::default();
        total.add(&CostInfo::new(10, 5, 0, 0.01));
        total.add(&CostInfo::new(20, 8, 2, 0.02));
        assert_eq!(total.input_tokens, 30);
        assert_eq!(total.output_tokens, 13);
        assert_eq!(total.cached_tokens, 2);
        assert!((total.estimated_cost_usd - 0.03).abs() < f64::EPSILON);
    }
}
