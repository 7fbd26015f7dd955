use crate::model::TestStatus;

/// What the reward function sees for one (change, test) observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RewardContext {
    /// Normalized impact score the test was given before it ran; 0 when the
    /// test was not predicted at all.
    pub predicted: f64,
    pub status: TestStatus,
    /// Consecutive passes including this one; 0 after a failure.
    pub pass_streak: u32,
}

/// Maps an observed outcome to a signed reward. Positive rewards raise future
/// scores for the pair, negative rewards lower them.
pub trait RewardFunction: Send + Sync {
    fn reward(&self, ctx: &RewardContext) -> f64;
}

/// Rewards missed failures and penalizes persistent over-selection.
///
/// - a failing test that was predicted below `low` earns `1 - predicted`
/// - a test predicted at or above `high` that has now passed
///   `consistent_pass_runs` times in a row earns `-predicted`
/// - everything else earns 0
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdReward {
    pub low: f64,
    pub high: f64,
    pub consistent_pass_runs: u32,
}

impl RewardFunction for ThresholdReward {
    fn reward(&self, ctx: &RewardContext) -> f64 {
        match ctx.status {
            TestStatus::Failed if ctx.predicted < self.low => 1.0 - ctx.predicted,
            TestStatus::Passed
                if ctx.predicted >= self.high && ctx.pass_streak >= self.consistent_pass_runs.max(1) =>
            {
                -ctx.predicted
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REWARD: ThresholdReward = ThresholdReward {
        low: 0.3,
        high: 0.7,
        consistent_pass_runs: 3,
    };

    fn ctx(predicted: f64, status: TestStatus, pass_streak: u32) -> RewardContext {
        RewardContext {
            predicted,
            status,
            pass_streak,
        }
    }

    #[test]
    fn missed_failure_is_rewarded() {
        assert!((REWARD.reward(&ctx(0.1, TestStatus::Failed, 0)) - 0.9).abs() < 1e-12);
        assert_eq!(REWARD.reward(&ctx(0.0, TestStatus::Failed, 0)), 1.0);
    }

    #[test]
    fn expected_failure_is_neutral() {
        assert_eq!(REWARD.reward(&ctx(0.8, TestStatus::Failed, 0)), 0.0);
        assert_eq!(REWARD.reward(&ctx(0.3, TestStatus::Failed, 0)), 0.0);
    }

    #[test]
    fn over_selection_needs_consistent_passes() {
        assert_eq!(REWARD.reward(&ctx(0.9, TestStatus::Passed, 1)), 0.0);
        assert_eq!(REWARD.reward(&ctx(0.9, TestStatus::Passed, 2)), 0.0);
        assert_eq!(REWARD.reward(&ctx(0.9, TestStatus::Passed, 3)), -0.9);
        assert_eq!(REWARD.reward(&ctx(0.5, TestStatus::Passed, 10)), 0.0);
    }

    #[test]
    fn skipped_is_neutral() {
        assert_eq!(REWARD.reward(&ctx(0.0, TestStatus::Skipped, 0)), 0.0);
    }
}
