//! Backoff and error classification for failed source or destination calls

use std::time::Duration;

use rand::Rng;

/// Backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_backoff: Duration,
    /// Upper bound before jitter
    pub max_backoff: Duration,
    /// Growth factor per consecutive failure
    pub backoff_multiplier: f64,
    /// Fraction of the delay applied as +/- jitter (0.0 disables it)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Un-jittered backoff for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Consecutive-failure tracker producing jittered delays.
///
/// Owned by the watcher loop; reset after a fully successful iteration.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current failure, then advance the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let base = self.config.backoff_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.apply_jitter(base)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn apply_jitter(&self, base: Duration) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }
}

/// What a failed destination submission says about trying again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RPC or network trouble
    Transient,
    /// Fee or nonce contention; the fillers rebuild the transaction next time
    Contention,
    /// Wallet balance, minter role or pause state. Holds until an operator
    /// steps in, then the same mint succeeds.
    Operational,
    /// The event itself can never be minted
    Permanent,
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

/// Checked in order, first match wins
const ERROR_PATTERNS: &[(ErrorClass, &[&str])] = &[
    (
        ErrorClass::Permanent,
        &[
            "invalid recipient",
            "invalid amount",
            "zero amount",
            "unsupported asset",
        ],
    ),
    (
        ErrorClass::Operational,
        &[
            "insufficient funds",
            "unauthorized",
            "accesscontrol",
            "missing role",
            "paused",
            "reverted",
        ],
    ),
    (
        ErrorClass::Contention,
        &[
            "underpriced",
            "replacement transaction",
            "max fee per gas less than",
            "nonce too low",
            "nonce too high",
            "already known",
        ],
    ),
    (
        ErrorClass::Transient,
        &[
            "timeout",
            "timed out",
            "connection",
            "network",
            "rate limit",
            "too many requests",
            "bad gateway",
            "service unavailable",
            "temporarily unavailable",
        ],
    ),
];

/// Classify a dispatcher error message
pub fn classify_error(message: &str) -> ErrorClass {
    let message = message.to_lowercase();
    ERROR_PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| message.contains(needle)))
        .map(|(class, _)| *class)
        .unwrap_or(ErrorClass::Unknown)
}
