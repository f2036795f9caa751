//! Runtime Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `BRASS_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `BRASS_OPCODE_BUDGET` | Opcodes a fiber runs before yielding | 1024 |
//! | `BRASS_AWAIT_CHILDREN` | Scope close awaits interrupted children ("true"/"false") | true |
//! | `BRASS_CLOCK` | Timer clock (system/virtual) | system |
//! | `BRASS_DEFAULT_TIMEOUT_MS` | Default timeout in milliseconds (0 = none) | 0 |
//! | `BRASS_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `BRASS_LIFECYCLE_EVENTS` | Log fiber and scope lifecycle events | false |
//! | `BRASS_SUBSCRIBER_CAPACITY` | Event bus buffer per subscriber | 1024 |
//! | `BRASS_RECENT_EVENTS` | Events kept by the registry | 200 |
//!
//! # Example
//!
//! ```rust,ignore
//! use brass_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .opcode_budget(256)
//!     .await_children(false)
//!     .build()?;
//! ```

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default opcode budget per scheduler turn.
pub const DEFAULT_OPCODE_BUDGET: usize = 1024;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level, accepting names, short aliases and digits.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// True when a message at `level` passes this threshold.
    pub fn allows(&self, level: LogLevel) -> bool {
        level != LogLevel::Off && level <= *self
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::parse(s).ok_or_else(|| ConfigError::InvalidValue {
            field: "log.level".into(),
            message: format!("unknown log level '{}'", s),
        })
    }
}

/// Time source for timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// Wall-clock time; idle waits put the thread to sleep.
    #[default]
    System,
    /// Virtual time; when nothing is runnable the clock jumps to the next
    /// timer deadline.
    Virtual,
}

impl ClockMode {
    /// Parse "system" or "virtual".
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "system" | "real" | "wall" => Some(ClockMode::System),
            "virtual" | "test" | "manual" => Some(ClockMode::Virtual),
            _ => None,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Opcodes a fiber may evaluate before yielding to the queue.
    /// Default: 1024.
    pub opcode_budget: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            opcode_budget: DEFAULT_OPCODE_BUDGET,
        }
    }
}

/// Scope configuration.
#[derive(Debug, Clone)]
pub struct ScopeConfig {
    /// Whether closing a scope waits for its interrupted children to
    /// terminate before reporting closed.
    /// Default: true.
    pub await_children: bool,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            await_children: true,
        }
    }
}

/// Clock configuration.
#[derive(Debug, Clone, Default)]
pub struct ClockConfig {
    /// Time source.
    /// Default: system.
    pub mode: ClockMode,
}

/// Timeout configuration.
#[derive(Debug, Clone, Default)]
pub struct TimeoutConfig {
    /// Default timeout applied by `Runtime::with_default_timeout`.
    /// None means no timeout (default).
    pub default_timeout: Option<Duration>,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Log every fiber and scope lifecycle event at debug level.
    /// Default: false.
    pub lifecycle_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            lifecycle_events: false,
        }
    }
}

/// Observability sink configuration.
#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Ring buffer size per event bus subscriber.
    /// Default: 1024.
    pub subscriber_capacity: usize,

    /// Events kept by the registry for dumps.
    /// Default: 200.
    pub recent_events: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 1024,
            recent_events: 200,
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Scope configuration.
    pub scope: ScopeConfig,

    /// Clock configuration.
    pub clock: ClockConfig,

    /// Timeout configuration.
    pub timeout: TimeoutConfig,

    /// Logging configuration.
    pub log: LogConfig,

    /// Observability sink configuration.
    pub events: EventConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or invalid keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("BRASS_OPCODE_BUDGET") {
            if val > 0 {
                config.scheduler.opcode_budget = val;
            }
        }

        if let Some(val) = parse_env_bool("BRASS_AWAIT_CHILDREN") {
            config.scope.await_children = val;
        }

        if let Ok(val) = env::var("BRASS_CLOCK") {
            if let Some(mode) = ClockMode::parse(&val) {
                config.clock.mode = mode;
            }
        }

        if let Some(val) = parse_env_usize("BRASS_DEFAULT_TIMEOUT_MS") {
            config.timeout.default_timeout = if val > 0 {
                Some(Duration::from_millis(val as u64))
            } else {
                None
            };
        }

        if let Ok(val) = env::var("BRASS_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        if let Some(val) = parse_env_bool("BRASS_LIFECYCLE_EVENTS") {
            config.log.lifecycle_events = val;
        }

        if let Some(val) = parse_env_usize("BRASS_SUBSCRIBER_CAPACITY") {
            if val > 0 {
                config.events.subscriber_capacity = val;
            }
        }

        if let Some(val) = parse_env_usize("BRASS_RECENT_EVENTS") {
            config.events.recent_events = val;
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.opcode_budget == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.opcode_budget".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.events.subscriber_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "events.subscriber_capacity".into(),
                message: "must be at least 1".into(),
            });
        }

        if let Some(timeout) = self.timeout.default_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "timeout.default_timeout".into(),
                    message: "use None instead of a zero timeout".into(),
                });
            }
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParse {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the opcode budget per scheduler turn.
    pub fn opcode_budget(mut self, budget: usize) -> Self {
        self.config.scheduler.opcode_budget = budget;
        self
    }

    /// Choose whether scope close awaits interrupted children.
    pub fn await_children(mut self, enabled: bool) -> Self {
        self.config.scope.await_children = enabled;
        self
    }

    /// Set the clock mode.
    pub fn clock(mut self, mode: ClockMode) -> Self {
        self.config.clock.mode = mode;
        self
    }

    /// Set the default timeout.
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout.default_timeout = timeout;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Enable or disable lifecycle event logging.
    pub fn lifecycle_events(mut self, enabled: bool) -> Self {
        self.config.log.lifecycle_events = enabled;
        self
    }

    /// Set the event bus buffer size per subscriber.
    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.config.events.subscriber_capacity = capacity;
        self
    }

    /// Set how many events the registry keeps.
    pub fn recent_events(mut self, count: usize) -> Self {
        self.config.events.recent_events = count;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.scheduler.opcode_budget, 1024);
        assert!(config.scope.await_children);
        assert_eq!(config.clock.mode, ClockMode::System);
        assert!(config.timeout.default_timeout.is_none());
        assert_eq!(config.log.level, LogLevel::Info);
        assert_eq!(config.events.subscriber_capacity, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .opcode_budget(64)
            .await_children(false)
            .clock(ClockMode::Virtual)
            .default_timeout(Some(Duration::from_secs(30)))
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();

        assert_eq!(config.scheduler.opcode_budget, 64);
        assert!(!config.scope.await_children);
        assert_eq!(config.clock.mode, ClockMode::Virtual);
        assert_eq!(config.timeout.default_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_builder_validation() {
        assert!(RuntimeConfig::builder().opcode_budget(0).build().is_err());
        assert!(RuntimeConfig::builder().subscriber_capacity(0).build().is_err());
        assert!(RuntimeConfig::builder()
            .default_timeout(Some(Duration::ZERO))
            .build()
            .is_err());
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = RuntimeConfig::builder().opcode_budget(0).build_unchecked();
        assert_eq!(config.scheduler.opcode_budget, 0);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::parse("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("invalid"), None);
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!("5".parse::<LogLevel>(), Ok(LogLevel::Trace));
    }

    #[test]
    fn test_log_level_allows() {
        assert!(LogLevel::Info.allows(LogLevel::Warn));
        assert!(LogLevel::Info.allows(LogLevel::Info));
        assert!(!LogLevel::Info.allows(LogLevel::Debug));
        assert!(!LogLevel::Trace.allows(LogLevel::Off));
        assert!(!LogLevel::Off.allows(LogLevel::Error));
    }

    #[test]
    fn test_clock_mode_parse() {
        assert_eq!(ClockMode::parse("Virtual"), Some(ClockMode::Virtual));
        assert_eq!(ClockMode::parse("system"), Some(ClockMode::System));
        assert_eq!(ClockMode::parse("sundial"), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "scheduler.opcode_budget".into(),
            message: "must be positive".into(),
        };
        assert!(err.to_string().contains("scheduler.opcode_budget"));
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var("BRASS_OPCODE_BUDGET");
        env::remove_var("BRASS_SUBSCRIBER_CAPACITY");

        let config = RuntimeConfig::from_env();
        assert_eq!(config.scheduler.opcode_budget, DEFAULT_OPCODE_BUDGET);
        assert_eq!(config.events.subscriber_capacity, 1024);
    }
}
