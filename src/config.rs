//! Runtime configuration of the emulated device.

use crate::simulator::{CounterSource, RandomCounterSource};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Size in bytes of the counter region handed to each session.
pub const COUNTER_REGION_SIZE: usize = 1024 * 1024;

/// Constructs a fresh counter source for every new session.
pub type SourceFactory = Arc<dyn Fn() -> std::io::Result<Box<dyn CounterSource>> + Send + Sync>;

/// What to do when a caller mapping cannot be locked into memory.
///
/// Locking is subject to `RLIMIT_MEMLOCK`, which is often smaller than a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPolicy {
    /// Fail the mapping if it cannot be pinned.
    Required,
    /// Log the failure and hand out an unpinned mapping.
    BestEffort,
}

impl std::str::FromStr for PinPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "required" => Ok(PinPolicy::Required),
            "best-effort" | "best_effort" => Ok(PinPolicy::BestEffort),
            other => Err(Error::InvalidConfig(format!(
                "unknown pin policy `{}`",
                other
            ))),
        }
    }
}

/// Configuration consumed by [`DriverState::initialize`](crate::DriverState::initialize).
#[derive(Clone)]
pub struct DriverConfig {
    /// Size of each session's region.
    ///
    /// Defaults to [`COUNTER_REGION_SIZE`].
    region_size: usize,
    /// Pause between two simulated counter writes.
    ///
    /// Defaults to 1ms.
    write_period: Duration,
    /// How long a close waits for the simulator task to exit.
    ///
    /// Defaults to 1s.
    stop_timeout: Duration,
    /// Pinning behaviour of caller mappings.
    ///
    /// Defaults to `PinPolicy::BestEffort`.
    pin_policy: PinPolicy,
    /// Upper bound on concurrently open sessions.
    ///
    /// Defaults to `u8::MAX`.
    max_sessions: u8,
    /// Producer of simulated counter writes.
    ///
    /// Defaults to `RandomCounterSource`.
    source: SourceFactory,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            region_size: COUNTER_REGION_SIZE,
            write_period: Duration::from_millis(1),
            stop_timeout: Duration::from_secs(1),
            pin_policy: PinPolicy::BestEffort,
            max_sessions: u8::MAX,
            source: Arc::new(|| -> std::io::Result<Box<dyn CounterSource>> {
                Ok(Box::new(RandomCounterSource::from_os_rng()?))
            }),
        }
    }
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConfig")
            .field("region_size", &self.region_size)
            .field("write_period", &self.write_period)
            .field("stop_timeout", &self.stop_timeout)
            .field("pin_policy", &self.pin_policy)
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

macro_rules! builder_pattern {
    ($(#[$outer:meta])* $name: ident => $var_name: ident : $var_type: ty) => {
        $(#[$outer])*
        pub fn $name(mut self, $var_name: $var_type) -> Self {
            self.$var_name = $var_name;
            self
        }
    };
}

/// Read an optional environment variable.
fn env_lookup(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl DriverConfig {
    /// Build a configuration from the defaults overridden by `KDRIVER_*` environment variables.
    ///
    /// * `KDRIVER_WRITE_PERIOD_US` - pause between simulated writes in microseconds.
    /// * `KDRIVER_STOP_TIMEOUT_MS` - task stop timeout in milliseconds.
    /// * `KDRIVER_PIN` - `required` or `best-effort`.
    pub fn from_env() -> Result<Self> {
        DriverConfig::from_lookup(env_lookup)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<Option<String>>,
    {
        let mut config = DriverConfig::default();
        if let Some(us) = lookup("KDRIVER_WRITE_PERIOD_US")? {
            config.write_period = Duration::from_micros(us.trim().parse()?);
        }
        if let Some(ms) = lookup("KDRIVER_STOP_TIMEOUT_MS")? {
            config.stop_timeout = Duration::from_millis(ms.trim().parse()?);
        }
        if let Some(pin) = lookup("KDRIVER_PIN")? {
            config.pin_policy = pin.parse()?;
        }
        Ok(config)
    }

    /// Check that regions of this configuration can be allocated and mapped.
    pub(crate) fn validate(&self, page_size: usize) -> Result<()> {
        if self.region_size == 0 || self.region_size % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "region size {} must be non-zero and even",
                self.region_size
            )));
        }
        if self.region_size % page_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "region size {} is not a multiple of the page size {}",
                self.region_size, page_size
            )));
        }
        if self.write_period == Duration::from_secs(0) {
            return Err(Error::InvalidConfig("write period must be non-zero".into()));
        }
        if self.stop_timeout == Duration::from_secs(0) {
            return Err(Error::InvalidConfig("stop timeout must be non-zero".into()));
        }
        if self.max_sessions == 0 {
            return Err(Error::InvalidConfig("at least one session must be allowed".into()));
        }
        Ok(())
    }

    builder_pattern!(
        /// Set the size of each session's region.
        set_region_size => region_size: usize
    );

    builder_pattern!(
        /// Set the pause between simulated counter writes.
        set_write_period => write_period: Duration
    );

    builder_pattern!(
        /// Set how long a close waits for the simulator task.
        set_stop_timeout => stop_timeout: Duration
    );

    builder_pattern!(
        /// Set the pinning behaviour of caller mappings.
        set_pin_policy => pin_policy: PinPolicy
    );

    builder_pattern!(
        /// Set the maximum number of concurrently open sessions.
        set_max_sessions => max_sessions: u8
    );

    /// Use `factory` to build the counter source of every new session.
    pub fn set_counter_source<F, S>(self, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: CounterSource + 'static,
    {
        self.try_set_counter_source(move || Ok(factory()))
    }

    /// Use the fallible `factory` to build the counter source of every new session.
    ///
    /// An error fails the open that asked for the source.
    pub fn try_set_counter_source<F, S>(mut self, factory: F) -> Self
    where
        F: Fn() -> std::io::Result<S> + Send + Sync + 'static,
        S: CounterSource + 'static,
    {
        self.source = Arc::new(move || -> std::io::Result<Box<dyn CounterSource>> {
            Ok(Box::new(factory()?))
        });
        self
    }

    /// Size of each session's region.
    #[inline]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Pause between simulated counter writes.
    #[inline]
    pub fn write_period(&self) -> Duration {
        self.write_period
    }

    /// How long a close waits for the simulator task.
    #[inline]
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Pinning behaviour of caller mappings.
    #[inline]
    pub fn pin_policy(&self) -> PinPolicy {
        self.pin_policy
    }

    /// Maximum number of concurrently open sessions.
    #[inline]
    pub fn max_sessions(&self) -> u8 {
        self.max_sessions
    }

    pub(crate) fn new_source(&self) -> std::io::Result<Box<dyn CounterSource>> {
        (self.source)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(vars: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Result<Option<String>> {
        move |name: &str| Ok(vars.get(name).map(|v| String::from(*v)))
    }

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.region_size(), COUNTER_REGION_SIZE);
        assert_eq!(config.write_period(), Duration::from_millis(1));
        assert_eq!(config.pin_policy(), PinPolicy::BestEffort);
        assert_eq!(config.max_sessions(), u8::MAX);
        assert!(config.validate(4096).is_ok());
    }

    #[test]
    fn test_overrides_from_lookup() -> Result<()> {
        let mut vars = HashMap::new();
        vars.insert("KDRIVER_WRITE_PERIOD_US", "250");
        vars.insert("KDRIVER_STOP_TIMEOUT_MS", " 20 ");
        vars.insert("KDRIVER_PIN", "Required");
        let config = DriverConfig::from_lookup(lookup_in(vars))?;
        assert_eq!(config.write_period(), Duration::from_micros(250));
        assert_eq!(config.stop_timeout(), Duration::from_millis(20));
        assert_eq!(config.pin_policy(), PinPolicy::Required);
        Ok(())
    }

    #[test]
    fn test_malformed_overrides() {
        let mut vars = HashMap::new();
        vars.insert("KDRIVER_WRITE_PERIOD_US", "fast");
        match DriverConfig::from_lookup(lookup_in(vars)) {
            Err(Error::ParseInt(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }

        let mut vars = HashMap::new();
        vars.insert("KDRIVER_PIN", "sometimes");
        match DriverConfig::from_lookup(lookup_in(vars)) {
            Err(Error::InvalidConfig(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_zero_stop_timeout_from_lookup_is_rejected() -> Result<()> {
        let mut vars = HashMap::new();
        vars.insert("KDRIVER_STOP_TIMEOUT_MS", "0");
        let config = DriverConfig::from_lookup(lookup_in(vars))?;
        match config.validate(4096) {
            Err(Error::InvalidConfig(_)) => Ok(()),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        assert!(DriverConfig::default()
            .set_region_size(0)
            .validate(4096)
            .is_err());
        assert!(DriverConfig::default()
            .set_region_size(4096 + 2)
            .validate(4096)
            .is_err());
        assert!(DriverConfig::default()
            .set_write_period(Duration::from_secs(0))
            .validate(4096)
            .is_err());
        assert!(DriverConfig::default()
            .set_stop_timeout(Duration::from_secs(0))
            .validate(4096)
            .is_err());
        assert!(DriverConfig::default()
            .set_max_sessions(0)
            .validate(4096)
            .is_err());
        assert!(DriverConfig::default()
            .set_region_size(2 * 4096)
            .validate(4096)
            .is_ok());
    }
}
