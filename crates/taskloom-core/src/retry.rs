//! Retry delay computation for the per-node retry policies.

use std::time::Duration;

use rand::Rng;

use crate::graph::{RetryConfig, RetryStrategy};

/// Compute the delay before retry attempt `attempt` (0-indexed).
///
/// Exponential backoff is capped at `max_delay_seconds` and optionally
/// jittered by a uniform factor in `[0.5, 1.5)`. Adaptive ramps linearly
/// and is bounded by the same cap so it stays monotone in `attempt`.
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let seconds = match config.strategy {
        RetryStrategy::Fixed => config.initial_delay_seconds,
        RetryStrategy::Linear => config.initial_delay_seconds * (attempt as f64 + 1.0),
        RetryStrategy::ExponentialBackoff => {
            let raw =
                config.initial_delay_seconds * config.backoff_multiplier.powi(attempt as i32);
            let capped = raw.min(config.max_delay_seconds);
            if config.jitter {
                capped * rand::thread_rng().gen_range(0.5..1.5)
            } else {
                capped
            }
        }
        RetryStrategy::Fibonacci => config.initial_delay_seconds * fibonacci(attempt) as f64,
        RetryStrategy::Adaptive => (config.initial_delay_seconds * (attempt as f64 + 1.0))
            .min(config.max_delay_seconds),
    };

    Duration::from_secs_f64(seconds.max(0.0))
}

/// fib(0) = fib(1) = 1.
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: RetryStrategy, jitter: bool) -> RetryConfig {
        RetryConfig {
            max_retries: 5,
            strategy,
            initial_delay_seconds: 0.1,
            max_delay_seconds: 60.0,
            backoff_multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn fixed_is_constant() {
        let cfg = config(RetryStrategy::Fixed, false);
        for attempt in 0..4 {
            assert_eq!(retry_delay(&cfg, attempt), Duration::from_secs_f64(0.1));
        }
    }

    #[test]
    fn linear_grows_with_attempt() {
        let cfg = config(RetryStrategy::Linear, false);
        assert_eq!(retry_delay(&cfg, 0), Duration::from_secs_f64(0.1));
        assert_eq!(retry_delay(&cfg, 2), Duration::from_secs_f64(0.1 * 3.0));
    }

    #[test]
    fn exponential_without_jitter_is_exact() {
        let cfg = config(RetryStrategy::ExponentialBackoff, false);
        assert_eq!(retry_delay(&cfg, 0), Duration::from_secs_f64(0.1));
        assert_eq!(retry_delay(&cfg, 1), Duration::from_secs_f64(0.2));
        assert_eq!(retry_delay(&cfg, 3), Duration::from_secs_f64(0.8));
    }

    #[test]
    fn exponential_is_capped() {
        let mut cfg = config(RetryStrategy::ExponentialBackoff, false);
        cfg.initial_delay_seconds = 10.0;
        cfg.max_delay_seconds = 15.0;
        assert_eq!(retry_delay(&cfg, 4), Duration::from_secs_f64(15.0));
    }

    #[test]
    fn exponential_jitter_stays_in_band() {
        let cfg = config(RetryStrategy::ExponentialBackoff, true);
        for _ in 0..100 {
            let delay = retry_delay(&cfg, 1).as_secs_f64();
            assert!((0.1..0.3).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn fibonacci_sequence() {
        let cfg = config(RetryStrategy::Fibonacci, false);
        let expected = [1.0, 1.0, 2.0, 3.0, 5.0, 8.0];
        for (attempt, factor) in expected.iter().enumerate() {
            assert_eq!(
                retry_delay(&cfg, attempt as u32),
                Duration::from_secs_f64(0.1 * factor)
            );
        }
    }

    #[test]
    fn adaptive_is_monotone_and_bounded() {
        let cfg = config(RetryStrategy::Adaptive, false);
        let mut previous = Duration::ZERO;
        for attempt in 0..1000 {
            let delay = retry_delay(&cfg, attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs_f64(cfg.max_delay_seconds));
            previous = delay;
        }
    }
}
