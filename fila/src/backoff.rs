//! Backoff strategies used for job retries and for backend connection retries.
//!
//! All of the constructors and configuration functions are `const`, so strategies can be declared
//! as constants and shared by every backend.
//!
//! # Example
//!
//! ```
//! use chrono::TimeDelta;
//! use fila::backoff::{BackoffStrategy, Strategy};
//!
//! let strategy =
//!     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(60));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(5), TimeDelta::seconds(32));
//! assert_eq!(strategy.backoff(6), TimeDelta::seconds(60));
//! ```

use chrono::TimeDelta;

/// The retry backoff applied by the table-backed queue: `min(2^k · 1s, 60s)` for the k-th failed
/// attempt.
pub const RETRY_BACKOFF: BackoffStrategy<Exponential> =
    BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(60));

/// The retry backoff applied by the broker queue: `2s · 2^(k-1)`, uncapped.
pub const BROKER_RETRY_BACKOFF: BackoffStrategy<Exponential> =
    BackoffStrategy::exponential(TimeDelta::seconds(2));

/// The delay between attempts to connect to a backend: 50ms per attempt capped at 2s.
pub const CONNECT_BACKOFF: BackoffStrategy<Linear> =
    BackoffStrategy::linear(TimeDelta::milliseconds(50)).with_max(TimeDelta::seconds(2));

/// Maps the number of a failed attempt, starting at 1, to the delay before the next one.
pub trait Strategy {
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// `base · 2^(k-1)`, saturating instead of overflowing. Built with
/// [`BackoffStrategy::exponential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let exponent = u32::from(attempt.max(1) - 1);
        let mut milliseconds = 2_i64
            .checked_pow(exponent)
            .and_then(|factor| self.base.num_milliseconds().checked_mul(factor))
            .unwrap_or(i64::MAX);
        if let Some(max) = self.max {
            milliseconds = milliseconds.min(max.num_milliseconds());
        }
        TimeDelta::try_milliseconds(milliseconds).unwrap_or(TimeDelta::MAX)
    }
}

/// `factor · k`. Built with [`BackoffStrategy::linear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.factor * attempt.into();
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        backoff
    }
}

/// A [`Strategy`] with an optional floor and ceiling.
///
/// # Example
///
/// ```
/// use chrono::TimeDelta;
/// use fila::backoff::{BackoffStrategy, Strategy};
///
/// let strategy = BackoffStrategy::linear(TimeDelta::milliseconds(50))
///     .with_max(TimeDelta::seconds(2))
///     .with_min(TimeDelta::milliseconds(100));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::milliseconds(100));
/// assert_eq!(strategy.backoff(3), TimeDelta::milliseconds(150));
/// assert_eq!(strategy.backoff(100), TimeDelta::seconds(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    min: TimeDelta,
}

impl BackoffStrategy<Exponential> {
    /// Delays doubling from `base`.
    ///
    /// # Example
    ///
    /// ```
    /// use chrono::TimeDelta;
    /// use fila::backoff::{BackoffStrategy, Strategy};
    ///
    /// let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(500))
    ///     .with_max(TimeDelta::seconds(3));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::milliseconds(500));
    /// assert_eq!(strategy.backoff(3), TimeDelta::seconds(2));
    /// assert_eq!(strategy.backoff(4), TimeDelta::seconds(3));
    /// ```
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Never wait longer than `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Linear> {
    /// Delays growing by `factor` per attempt.
    ///
    /// # Example
    ///
    /// ```
    /// use chrono::TimeDelta;
    /// use fila::backoff::{BackoffStrategy, Strategy};
    ///
    /// let strategy =
    ///     BackoffStrategy::linear(TimeDelta::milliseconds(250)).with_max(TimeDelta::seconds(1));
    ///
    /// assert_eq!(strategy.backoff(2), TimeDelta::milliseconds(500));
    /// assert_eq!(strategy.backoff(9), TimeDelta::seconds(1));
    /// ```
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Linear { factor, max: None })
    }

    /// Cap at `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            min: TimeDelta::zero(),
        }
    }

    /// Never wait less than `min`.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        self.strategy.backoff(attempt).max(self.min)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retry_backoff_matches_closed_form() {
        for k in 1..=10_u16 {
            let expected = (2_i64.pow(u32::from(k)) * 1000).min(60_000);
            assert_eq!(
                RETRY_BACKOFF.backoff(k),
                TimeDelta::milliseconds(expected),
                "attempt {k}"
            );
        }
    }

    #[test]
    fn broker_backoff_starts_at_two_seconds() {
        assert_eq!(BROKER_RETRY_BACKOFF.backoff(1), TimeDelta::seconds(2));
        assert_eq!(BROKER_RETRY_BACKOFF.backoff(2), TimeDelta::seconds(4));
        assert_eq!(BROKER_RETRY_BACKOFF.backoff(3), TimeDelta::seconds(8));
    }

    #[test]
    fn exponential_backoff_saturates() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2));

        assert_eq!(strategy.backoff(u16::MAX), TimeDelta::MAX);
        assert_eq!(strategy.backoff(0), TimeDelta::seconds(2));
    }

    #[test]
    fn exponential_backoff_with_max() {
        let max = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(max);

        for i in 6..100 {
            assert_eq!(strategy.backoff(i), max);
        }
    }

    #[test]
    fn linear_backoff() {
        let delay = TimeDelta::milliseconds(50);
        let strategy = BackoffStrategy::linear(delay);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), delay * i.into());
        }
    }

    #[test]
    fn connect_backoff_is_capped() {
        assert_eq!(CONNECT_BACKOFF.backoff(1), TimeDelta::milliseconds(50));
        assert_eq!(CONNECT_BACKOFF.backoff(3), TimeDelta::milliseconds(150));
        assert_eq!(CONNECT_BACKOFF.backoff(1000), TimeDelta::seconds(2));
    }

    #[test]
    fn backoff_respects_min() {
        let strategy =
            BackoffStrategy::linear(TimeDelta::seconds(1)).with_min(TimeDelta::seconds(5));

        assert_eq!(strategy.backoff(1), TimeDelta::seconds(5));
        assert_eq!(strategy.backoff(6), TimeDelta::seconds(6));
    }
}
