use std::{
    cmp::{max, min},
    time::Duration,
};

use secrecy::SecretString;

/// The hosted payments API.
pub const DEFAULT_API_URL: &str = "https://voltageapi.com/v1";
pub const DEFAULT_MAX_RETRIES: usize = 30;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(2000);

/// Upper bound for a single [`Backoff::Exponential`] wait.
const MAXIMUM_WAIT: Duration = Duration::from_secs(32);
const EXP_BASE: u32 = 2;

/// Where the payments backend lives and how we authenticate to it.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// e.g. "https://voltageapi.com/v1". A trailing slash is ignored.
    pub api_url: String,
    /// Sent on every request in the `x-api-key` header.
    pub api_key: SecretString,
    pub organization_id: String,
    pub environment_id: String,
}

impl BackendConfig {
    /// `{api_url}/organizations/{org}/environments/{env}`
    fn environment_url(&self) -> String {
        let api_url = self.api_url.trim_end_matches('/');
        let org = &self.organization_id;
        let env = &self.environment_id;
        format!("{api_url}/organizations/{org}/environments/{env}")
    }

    /// The collection endpoint which payments are created at.
    pub fn payments_url(&self) -> String {
        format!("{}/payments", self.environment_url())
    }

    /// The endpoint at which a single payment is fetched.
    pub fn payment_url(&self, id: impl std::fmt::Display) -> String {
        format!("{}/payments/{id}", self.environment_url())
    }

    pub fn wallet_url(&self, wallet_id: &str) -> String {
        format!("{}/wallets/{wallet_id}", self.environment_url())
    }
}

/// How the time between two attempts evolves.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Backoff {
    /// Always wait `retry_delay`.
    #[default]
    Fixed,
    /// Wait `retry_delay`, then double it per attempt, capped at 32 seconds
    /// or `retry_delay`, whichever is longer.
    /// The number of attempts is the same as with [`Backoff::Fixed`].
    Exponential,
}

/// Bounds every retry and poll loop in this crate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RetryConfig {
    /// Transport-level requests are retried up to this many times, and poll
    /// loops fetch up to this many times.
    pub max_retries: usize,
    /// The (initial) wait between two attempts.
    pub retry_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    /// An infinite iterator of the waits between consecutive attempts.
    /// Callers bound the number of attempts themselves.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let retry_delay = self.retry_delay;
        let backoff = self.backoff;
        (0u32..).map(move |index| match backoff {
            Backoff::Fixed => retry_delay,
            Backoff::Exponential => {
                let factor = EXP_BASE.saturating_pow(index);
                let capped =
                    min(retry_delay.saturating_mul(factor), MAXIMUM_WAIT);
                max(capped, retry_delay)
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn urls_ignore_trailing_slash() {
        let config = BackendConfig {
            api_url: "https://voltageapi.com/v1/".to_owned(),
            api_key: SecretString::new("key".to_owned()),
            organization_id: "org".to_owned(),
            environment_id: "env".to_owned(),
        };
        assert_eq!(
            config.payments_url(),
            "https://voltageapi.com/v1/organizations/org/environments/env/payments",
        );
        assert_eq!(
            config.payment_url("abc"),
            "https://voltageapi.com/v1/organizations/org/environments/env/payments/abc",
        );
        assert_eq!(
            config.wallet_url("w1"),
            "https://voltageapi.com/v1/organizations/org/environments/env/wallets/w1",
        );
    }

    #[test]
    fn fixed_delays_never_change() {
        let retry = RetryConfig::default();
        assert!(retry.delays().take(100).all(|d| d == DEFAULT_RETRY_DELAY));
    }

    #[test]
    fn exponential_delays_are_capped() {
        let retry = RetryConfig {
            max_retries: 10,
            retry_delay: Duration::from_millis(500),
            backoff: Backoff::Exponential,
        };
        let delays = retry.delays().take(8).collect::<Vec<_>>();
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert_eq!(delays[6], MAXIMUM_WAIT);
        assert_eq!(delays[7], MAXIMUM_WAIT);

        // No overflow far into the sequence
        assert_eq!(retry.delays().nth(200), Some(MAXIMUM_WAIT));
    }

    #[test]
    fn exponential_never_waits_less_than_retry_delay() {
        let retry = RetryConfig {
            max_retries: 5,
            retry_delay: Duration::from_secs(40),
            backoff: Backoff::Exponential,
        };
        assert!(
            retry
                .delays()
                .take(5)
                .all(|delay| delay == Duration::from_secs(40))
        );
    }
}
