//! Engine configuration types

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Target request rate (tickets per second) as a function of elapsed run time
pub type RateFn = Arc<dyn Fn(Duration) -> f64 + Send + Sync>;

/// Shape of the target request rate over a run
///
/// Text forms accepted by [`FromStr`]:
///
/// | Form | Meaning |
/// |---|---|
/// | `flood` | no rate limit, tickets as fast as workers take them |
/// | `steady:<rps>` or `<rps>` | constant rate |
/// | `ramp:<from>:<to>` | linear from `from` to `to` over the run |
/// | `spike:<base>:<peak>:<start%>:<end%>` | `peak` inside the window, `base` elsewhere |
/// | `trickle:<per_min>` | constant rate given per minute |
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateProfile {
    /// No rate limit
    #[default]
    Flood,
    /// Constant requests per second
    Steady {
        /// Requests per second
        rps: f64,
    },
    /// Linear ramp across the run
    Ramp {
        /// Starting rate
        from: f64,
        /// Final rate
        to: f64,
    },
    /// Burst window inside an otherwise constant rate
    Spike {
        /// Rate outside the window
        base: f64,
        /// Rate inside the window
        peak: f64,
        /// Window start as a fraction of the run (0.0..=1.0)
        start: f64,
        /// Window end as a fraction of the run (0.0..=1.0)
        end: f64,
    },
    /// Constant requests per minute
    Trickle {
        /// Requests per minute
        per_min: f64,
    },
}

impl RateProfile {
    /// Target rate at `elapsed` into a run of length `total`.
    ///
    /// `None` means unlimited.
    pub fn rate_at(&self, elapsed: Duration, total: Duration) -> Option<f64> {
        let progress = if total.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0)
        };

        match *self {
            RateProfile::Flood => None,
            RateProfile::Steady { rps } => Some(rps),
            RateProfile::Ramp { from, to } => Some(from + (to - from) * progress),
            RateProfile::Spike {
                base,
                peak,
                start,
                end,
            } => {
                if progress >= start && progress < end {
                    Some(peak)
                } else {
                    Some(base)
                }
            }
            RateProfile::Trickle { per_min } => Some(per_min / 60.0),
        }
    }

    /// Rate function for a run of length `total`; `None` for [`RateProfile::Flood`]
    pub fn into_rate_fn(self, total: Duration) -> Option<RateFn> {
        if self == RateProfile::Flood {
            return None;
        }
        Some(Arc::new(move |elapsed| {
            self.rate_at(elapsed, total).unwrap_or(0.0)
        }))
    }

    /// Check every parameter is finite and in range
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rates = match *self {
            RateProfile::Flood => vec![],
            RateProfile::Steady { rps } => vec![rps],
            RateProfile::Ramp { from, to } => vec![from, to],
            RateProfile::Spike { base, peak, .. } => vec![base, peak],
            RateProfile::Trickle { per_min } => vec![per_min],
        };

        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(ConfigError::InvalidRate(format!(
                "{self}: rates must be finite and non-negative"
            )));
        }
        if rates.iter().all(|r| *r == 0.0) && *self != RateProfile::Flood {
            return Err(ConfigError::InvalidRate(format!(
                "{self}: at least one rate must be positive"
            )));
        }
        if let RateProfile::Spike { start, end, .. } = *self {
            if !(0.0..=1.0).contains(&start) || !(0.0..=1.0).contains(&end) || start >= end {
                return Err(ConfigError::InvalidRate(format!(
                    "{self}: spike window must satisfy 0 <= start < end <= 100"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for RateProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateProfile::Flood => write!(f, "flood"),
            RateProfile::Steady { rps } => write!(f, "steady:{rps}"),
            RateProfile::Ramp { from, to } => write!(f, "ramp:{from}:{to}"),
            RateProfile::Spike {
                base,
                peak,
                start,
                end,
            } => write!(f, "spike:{base}:{peak}:{}:{}", start * 100.0, end * 100.0),
            RateProfile::Trickle { per_min } => write!(f, "trickle:{per_min}"),
        }
    }
}

impl FromStr for RateProfile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut parts = s.split(':');
        let kind = parts.next().unwrap_or_default().to_ascii_lowercase();
        let args: Vec<f64> = parts
            .map(|p| {
                p.trim()
                    .parse::<f64>()
                    .map_err(|_| ConfigError::InvalidRate(format!("{s}: '{p}' is not a number")))
            })
            .collect::<Result<_, _>>()?;

        let arity = |n: usize| {
            if args.len() == n {
                Ok(())
            } else {
                Err(ConfigError::InvalidRate(format!(
                    "{s}: '{kind}' takes {n} argument(s), got {}",
                    args.len()
                )))
            }
        };

        let profile = match kind.as_str() {
            "flood" => {
                arity(0)?;
                RateProfile::Flood
            }
            "steady" => {
                arity(1)?;
                RateProfile::Steady { rps: args[0] }
            }
            "ramp" => {
                arity(2)?;
                RateProfile::Ramp {
                    from: args[0],
                    to: args[1],
                }
            }
            "spike" => {
                arity(4)?;
                RateProfile::Spike {
                    base: args[0],
                    peak: args[1],
                    start: args[2] / 100.0,
                    end: args[3] / 100.0,
                }
            }
            "trickle" => {
                arity(1)?;
                RateProfile::Trickle { per_min: args[0] }
            }
            other => match other.parse::<f64>() {
                Ok(rps) if args.is_empty() => RateProfile::Steady { rps },
                _ => {
                    return Err(ConfigError::InvalidRate(format!(
                        "{s}: unknown profile (expected flood, steady, ramp, spike or trickle)"
                    )))
                }
            },
        };

        profile.validate()?;
        Ok(profile)
    }
}

/// Engine configuration
///
/// Controls the worker pool size, run length, rate shape and monitor cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent simulated users
    pub workers: usize,

    /// Wall-clock length of the run
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// Target request rate over the run
    pub rate: RateProfile,

    /// How often the monitor logs and publishes a snapshot
    #[serde(with = "duration_secs")]
    pub monitor_interval: Duration,

    /// Ticket queue capacity; 0 means one slot per worker
    pub queue_capacity: usize,

    /// Rate limiter tick
    #[serde(with = "duration_secs")]
    pub tick_interval: Duration,

    /// Account ids available to personas that require auth
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            duration: Duration::from_secs(60),
            rate: RateProfile::Flood,
            monitor_interval: Duration::from_secs(10),
            queue_capacity: 0,
            tick_interval: Duration::from_millis(50),
            accounts: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Create a config with the given worker count
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Set the run duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the rate profile
    pub fn with_rate(mut self, rate: RateProfile) -> Self {
        self.rate = rate;
        self
    }

    /// Set the monitor interval
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Set the ticket queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the rate limiter tick
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the account ids
    pub fn with_accounts(mut self, accounts: Vec<String>) -> Self {
        self.accounts = accounts;
        self
    }

    /// Effective ticket queue capacity
    pub fn effective_queue_capacity(&self) -> usize {
        if self.queue_capacity == 0 {
            self.workers.max(1)
        } else {
            self.queue_capacity
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidWorkers(
                "worker count must be at least 1".into(),
            ));
        }

        if self.duration.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "duration must be positive".into(),
            ));
        }

        if self.monitor_interval.is_zero() {
            return Err(ConfigError::InvalidInterval(
                "monitor interval must be positive".into(),
            ));
        }

        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidInterval(
                "tick interval must be positive".into(),
            ));
        }

        self.rate.validate()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid worker count
    #[error("Invalid worker count: {0}")]
    InvalidWorkers(String),

    /// Invalid run duration
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// Invalid rate profile
    #[error("Invalid rate profile: {0}")]
    InvalidRate(String),

    /// Invalid monitor or tick interval
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}
