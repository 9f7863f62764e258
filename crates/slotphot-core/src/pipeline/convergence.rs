use std::fmt;

use crate::stats::nan_median;

/// Decides when the deep detection loop has done enough rounds.
pub trait ConvergencePolicy: Send + Sync + fmt::Debug {
    /// `history` holds one goodness-of-fit vector per completed round.
    fn should_stop(&self, history: &[Vec<f64>]) -> bool;

    /// Upper bound on the number of rounds.
    fn max_rounds(&self) -> usize;
}

/// Median of the finite values of one round.
pub fn round_gof(gof: &[f64]) -> f64 {
    nan_median(gof.iter().copied().filter(|v| v.is_finite()))
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FixedRounds(pub usize);

impl ConvergencePolicy for FixedRounds {
    fn should_stop(&self, history: &[Vec<f64>]) -> bool {
        history.len() >= self.0
    }

    fn max_rounds(&self) -> usize {
        self.0
    }
}

/// Stop when the median round gof has changed by less than `epsilon`
/// (relative) for `patience` consecutive rounds, or after `max_rounds`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GofStabilized {
    pub epsilon: f64,
    pub patience: usize,
    pub max_rounds: usize,
}

impl ConvergencePolicy for GofStabilized {
    fn should_stop(&self, history: &[Vec<f64>]) -> bool {
        if history.len() >= self.max_rounds {
            return true;
        }
        let medians: Vec<f64> = history.iter().map(|g| round_gof(g)).collect();
        let stable = medians
            .windows(2)
            .rev()
            .take_while(|w| {
                let (prev, cur) = (w[0], w[1]);
                prev.is_finite()
                    && cur.is_finite()
                    && prev != 0.0
                    && ((cur - prev) / prev).abs() < self.epsilon
            })
            .count();
        self.patience > 0 && stable >= self.patience
    }

    fn max_rounds(&self) -> usize {
        self.max_rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gof_stabilized_needs_patience() {
        let policy = GofStabilized {
            epsilon: 1e-3,
            patience: 2,
            max_rounds: 10,
        };
        let h = vec![vec![2.0], vec![1.5], vec![1.5001]];
        assert!(!policy.should_stop(&h));
        let h = vec![vec![2.0], vec![1.5], vec![1.5001], vec![1.5002]];
        assert!(policy.should_stop(&h));
        let h = vec![vec![f64::NAN], vec![f64::NAN], vec![f64::NAN]];
        assert!(!policy.should_stop(&h));
    }

    #[test]
    fn test_fixed_rounds() {
        let policy = FixedRounds(2);
        assert!(!policy.should_stop(&[vec![1.0]]));
        assert!(policy.should_stop(&[vec![1.0], vec![1.0]]));
    }
}
