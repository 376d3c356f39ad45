//! Retry/backoff controller.
//!
//! Consumes the error kind an executor assigned; never reclassifies.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use clinflow_core::{ErrorKind, Stage};

/// Per-stage retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = run once).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self::default()
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// `retry_count` is the number of retries already spent on the stage.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// `base * 2^retry_count * jitter`, capped at `max_delay`.
    pub fn delay_for_retry(&self, retry_count: u32, jitter: f64) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(retry_count.min(62) as i32);
        let delay_ms = (base_ms * exp * jitter).min(max_ms).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Retry policies for every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePolicies {
    pub preprocess: RetryPolicy,
    pub retrieve: RetryPolicy,
    pub infer: RetryPolicy,
    pub qc: RetryPolicy,
    pub compose: RetryPolicy,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self::with_delays(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl StagePolicies {
    /// Default ceilings: retrieve 3, infer 2, everything else 0.
    pub fn with_delays(base_delay: Duration, max_delay: Duration) -> Self {
        let policy = |max_retries| RetryPolicy::exponential(max_retries, base_delay, max_delay);
        Self {
            preprocess: policy(0),
            retrieve: policy(3),
            infer: policy(2),
            qc: policy(0),
            compose: policy(0),
        }
    }

    pub fn for_stage(&self, stage: Stage) -> &RetryPolicy {
        match stage {
            Stage::Preprocess => &self.preprocess,
            Stage::Retrieve => &self.retrieve,
            Stage::Infer => &self.infer,
            Stage::Qc => &self.qc,
            Stage::Compose => &self.compose,
        }
    }

    pub fn for_stage_mut(&mut self, stage: Stage) -> &mut RetryPolicy {
        match stage {
            Stage::Preprocess => &mut self.preprocess,
            Stage::Retrieve => &mut self.retrieve,
            Stage::Infer => &mut self.infer,
            Stage::Qc => &mut self.qc,
            Stage::Compose => &mut self.compose,
        }
    }
}

/// Source of the backoff jitter factor, uniform in `[0.5, 1.5)`.
pub trait JitterSource: Send + Sync {
    fn factor(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn factor(&self) -> f64 {
        rand::thread_rng().gen_range(0.5..1.5)
    }
}

/// Constant factor, for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn factor(&self) -> f64 {
        self.0
    }
}

/// What to do with a failed stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the same stage again after `delay`.
    Retry { delay: Duration },
    /// Stop in `failed` and route to human review.
    Fail,
    /// Stop and promote to the DLQ. `exhausted` marks a spent retry budget.
    DeadLetter { exhausted: bool },
}

#[derive(Clone)]
pub struct RetryController {
    policies: StagePolicies,
    jitter: Arc<dyn JitterSource>,
}

impl core::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryController")
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

impl RetryController {
    pub fn new(policies: StagePolicies) -> Self {
        Self {
            policies,
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn policies(&self) -> &StagePolicies {
        &self.policies
    }

    pub fn decide(&self, stage: Stage, kind: ErrorKind, retry_count: u32) -> Decision {
        match kind {
            ErrorKind::Transient => {
                let policy = self.policies.for_stage(stage);
                if policy.should_retry(retry_count) {
                    Decision::Retry {
                        delay: policy.delay_for_retry(retry_count, self.jitter.factor()),
                    }
                } else {
                    Decision::DeadLetter { exhausted: true }
                }
            }
            ErrorKind::Business => Decision::Fail,
            ErrorKind::Fatal => Decision::DeadLetter { exhausted: false },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_retries, Duration::from_millis(100), Duration::from_secs(10))
    }

    #[test]
    fn delays_double_per_retry() {
        let p = policy(5);
        assert_eq!(p.delay_for_retry(0, 1.0), Duration::from_millis(100));
        assert_eq!(p.delay_for_retry(1, 1.0), Duration::from_millis(200));
        assert_eq!(p.delay_for_retry(2, 1.0), Duration::from_millis(400));
        assert_eq!(p.delay_for_retry(3, 0.5), Duration::from_millis(400));
        assert_eq!(p.delay_for_retry(20, 1.0), Duration::from_secs(10));
    }

    #[test]
    fn max_two_means_three_runs() {
        let controller = RetryController::new(StagePolicies {
            infer: policy(2),
            ..StagePolicies::default()
        })
        .with_jitter(Arc::new(FixedJitter(1.0)));

        assert!(matches!(
            controller.decide(Stage::Infer, ErrorKind::Transient, 0),
            Decision::Retry { .. }
        ));
        assert!(matches!(
            controller.decide(Stage::Infer, ErrorKind::Transient, 1),
            Decision::Retry { .. }
        ));
        assert_eq!(
            controller.decide(Stage::Infer, ErrorKind::Transient, 2),
            Decision::DeadLetter { exhausted: true }
        );
    }

    #[test]
    fn business_and_fatal_never_retry() {
        let controller = RetryController::new(StagePolicies::default());
        assert_eq!(controller.decide(Stage::Retrieve, ErrorKind::Business, 0), Decision::Fail);
        assert_eq!(
            controller.decide(Stage::Retrieve, ErrorKind::Fatal, 0),
            Decision::DeadLetter { exhausted: false }
        );
    }

    #[test]
    fn random_jitter_stays_in_range() {
        for _ in 0..1000 {
            let f = RandomJitter.factor();
            assert!((0.5..1.5).contains(&f));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn prop_delay_within_jitter_envelope(
            retry_count in 0u32..40,
            base_ms in 0u64..5_000,
            max_ms in 0u64..120_000,
            jitter in 0.5f64..1.5,
        ) {
            let p = RetryPolicy::exponential(10, Duration::from_millis(base_ms), Duration::from_millis(max_ms));
            let delay = p.delay_for_retry(retry_count, jitter).as_millis() as f64;
            let nominal = base_ms as f64 * 2_f64.powi(retry_count as i32);

            prop_assert!(delay <= max_ms as f64);
            prop_assert!(delay >= (nominal * 0.5).min(max_ms as f64).floor() - 1.0);
            prop_assert!(delay <= nominal * 1.5 + 1.0);
        }

        #[test]
        fn prop_retry_count_never_exceeds_ceiling(max_retries in 0u32..10, failures in 0u32..30) {
            let controller = RetryController::new(StagePolicies {
                retrieve: RetryPolicy::exponential(max_retries, Duration::ZERO, Duration::ZERO),
                ..StagePolicies::default()
            });

            let mut retry_count = 0u32;
            let mut dead = false;
            for _ in 0..failures {
                match controller.decide(Stage::Retrieve, ErrorKind::Transient, retry_count) {
                    Decision::Retry { .. } => retry_count += 1,
                    Decision::DeadLetter { exhausted } => {
                        prop_assert!(exhausted);
                        dead = true;
                        break;
                    }
                    Decision::Fail => prop_assert!(false, "transient never fails fast"),
                }
                prop_assert!(retry_count <= max_retries);
            }
            prop_assert_eq!(dead, failures > max_retries);
        }
    }
}
