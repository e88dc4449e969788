//! Runtime configuration (§6: "Configuration (enumerated)").
//!
//! `RunnerOptions` is built programmatically by the embedding host — parsing
//! a connection string or a CLI surface is explicitly out of scope (§1) and
//! lives one layer up. [`RunnerOptions::from_env`] is ambient test/example
//! plumbing, not a reintroduction of that surface: it exists so tests and
//! the scenario harness in `tests/` don't need to hand-write every field.

use std::time::Duration;

use anyhow::{Context, Result};

/// Tunable knobs for one Lease Manager instance (§6).
///
/// `LeaseUnits`/`CleanupUnits` from the distilled design (database date-math
/// granularity) collapse to plain [`Duration`]s here — see DESIGN.md for why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Max rows per handler invocation; also the divisor the Scale Monitor
    /// uses for per-worker capacity (§4.4 step 8).
    pub batch_size: i64,
    /// Sleep between poll ticks while [`crate::lease::WorkerState::CheckingForChanges`].
    pub polling_interval: Duration,
    /// Lease validity window; the renew task re-stamps at half this cadence.
    pub lease_interval: Duration,
    /// Renewals before the handler is declared wedged and cancelled (§4.3).
    pub max_lease_renewal_count: u32,
    /// Acquisitions before a change is poison-quarantined (I4).
    pub max_dequeue_count: i32,
    /// Interval between `WorkerBatchSizes` housekeeping passes (§4.3, I5).
    pub cleanup_interval: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            polling_interval: Duration::from_secs(5),
            lease_interval: Duration::from_secs(60),
            max_lease_renewal_count: 10,
            max_dequeue_count: 5,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RunnerOptions {
    pub fn builder() -> RunnerOptionsBuilder {
        RunnerOptionsBuilder::default()
    }

    /// Half of `lease_interval`, the renewal task's cadence (§4.3 item 2).
    pub fn renewal_cadence(&self) -> Duration {
        self.lease_interval / 2
    }

    /// Load options from environment variables, falling back to
    /// [`RunnerOptions::default`] for anything unset. Intended for examples
    /// and integration tests, not for the production CLI surface (out of
    /// scope per §1).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Ok(Self {
            batch_size: env_or("CHANGETRACK_BATCH_SIZE", defaults.batch_size)?,
            polling_interval: env_duration_secs(
                "CHANGETRACK_POLLING_INTERVAL_SECS",
                defaults.polling_interval,
            )?,
            lease_interval: env_duration_secs(
                "CHANGETRACK_LEASE_INTERVAL_SECS",
                defaults.lease_interval,
            )?,
            max_lease_renewal_count: env_or(
                "CHANGETRACK_MAX_LEASE_RENEWAL_COUNT",
                defaults.max_lease_renewal_count,
            )?,
            max_dequeue_count: env_or(
                "CHANGETRACK_MAX_DEQUEUE_COUNT",
                defaults.max_dequeue_count,
            )?,
            cleanup_interval: env_duration_secs(
                "CHANGETRACK_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval,
            )?,
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be valid: {e}"))
            .with_context(|| format!("parsing {key}")),
        Err(_) => Ok(default),
    }
}

fn env_duration_secs(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("{key} must be an integer number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

/// Builder for [`RunnerOptions`], following the `with_*` consuming-builder
/// convention used throughout this stack.
#[derive(Debug, Default)]
pub struct RunnerOptionsBuilder {
    opts: OptionalOverrides,
}

#[derive(Debug, Default)]
struct OptionalOverrides {
    batch_size: Option<i64>,
    polling_interval: Option<Duration>,
    lease_interval: Option<Duration>,
    max_lease_renewal_count: Option<u32>,
    max_dequeue_count: Option<i32>,
    cleanup_interval: Option<Duration>,
}

impl RunnerOptionsBuilder {
    pub fn batch_size(mut self, v: i64) -> Self {
        self.opts.batch_size = Some(v);
        self
    }

    pub fn polling_interval(mut self, v: Duration) -> Self {
        self.opts.polling_interval = Some(v);
        self
    }

    pub fn lease_interval(mut self, v: Duration) -> Self {
        self.opts.lease_interval = Some(v);
        self
    }

    pub fn max_lease_renewal_count(mut self, v: u32) -> Self {
        self.opts.max_lease_renewal_count = Some(v);
        self
    }

    pub fn max_dequeue_count(mut self, v: i32) -> Self {
        self.opts.max_dequeue_count = Some(v);
        self
    }

    pub fn cleanup_interval(mut self, v: Duration) -> Self {
        self.opts.cleanup_interval = Some(v);
        self
    }

    pub fn build(self) -> RunnerOptions {
        let defaults = RunnerOptions::default();
        RunnerOptions {
            batch_size: self.opts.batch_size.unwrap_or(defaults.batch_size),
            polling_interval: self.opts.polling_interval.unwrap_or(defaults.polling_interval),
            lease_interval: self.opts.lease_interval.unwrap_or(defaults.lease_interval),
            max_lease_renewal_count: self
                .opts
                .max_lease_renewal_count
                .unwrap_or(defaults.max_lease_renewal_count),
            max_dequeue_count: self.opts.max_dequeue_count.unwrap_or(defaults.max_dequeue_count),
            cleanup_interval: self.opts.cleanup_interval.unwrap_or(defaults.cleanup_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_renewal_cadence_is_half_lease_interval() {
        let opts = RunnerOptions::default();
        assert_eq!(opts.renewal_cadence(), opts.lease_interval / 2);
    }

    #[test]
    fn builder_overrides_only_what_is_set() {
        let opts = RunnerOptions::builder().batch_size(50).build();
        assert_eq!(opts.batch_size, 50);
        assert_eq!(opts.lease_interval, RunnerOptions::default().lease_interval);
    }
}
