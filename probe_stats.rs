//! # Probe Stats - Statistics Collection & Aggregation Engine
//!
//! The sampling core of an application-server monitoring console. It
//! periodically reads numeric statistics from the server's subsystems, keeps a
//! bounded history per named metric, derives smoothed and ranked chart series
//! on demand, and fires threshold alerts.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              PROBE STATS ENGINE                              │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  SCHEDULER → COLLECTORS (write) → METRIC STORE → LISTENERS (alerts)         │
//! │                                        ↓                                    │
//! │                         SERIES PROVIDERS → HTTP API / CLI                   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded history**: fixed-capacity ring per concrete metric name
//! - **Pluggable sources**: one async trait per server subsystem
//! - **Fault isolation**: a failing or hung collector never stalls a cycle
//! - **Edge-triggered alerts**: one notification per threshold crossing
//! - **Chart series**: raw template views and moving-average top-K rankings

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::any::Any;
use std::borrow::Cow;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Async Runtime Imports
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Imports
// ----------------------------------------------------------------------------
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Serialization Imports
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling Imports
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing Imports
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Configuration, CLI & Misc Imports
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use ordered_float::OrderedFloat;
use regex::Regex;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

// ----------------------------------------------------------------------------
// Metrics, Networking & System Imports
// ----------------------------------------------------------------------------
use axum::extract::{Path as AxumPath, Query as AxumQuery, State as AxumState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry as PrometheusRegistry, TextEncoder,
};
use reqwest::Client as HttpClient;
use sysinfo::System as SysInfoSystem;
use tower_http::trace::TraceLayer;

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "probe-stats";
pub const ENGINE_FULL_NAME: &str = "Probe Statistics Engine";

// ----------------------------------------------------------------------------
// Storage
// ----------------------------------------------------------------------------

/// Samples kept per concrete metric name unless configured otherwise
pub const DEFAULT_SERIES_CAPACITY: usize = 120;

/// Upper bound accepted for `storage.capacity`
pub const MAX_SERIES_CAPACITY: usize = 100_000;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default sampling interval (seconds)
pub const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 30;

/// Smallest sampling interval the scheduler accepts (milliseconds)
pub const MIN_COLLECTION_INTERVAL_MS: u64 = 100;

/// Default bound on a single subsystem query (seconds)
pub const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 5;

/// Default bound on a single notification dispatch (seconds)
pub const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 10;

/// Grace period for the in-flight cycle on shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Series & Alerts
// ----------------------------------------------------------------------------

/// Moving average window of the built-in ranked providers
pub const DEFAULT_MOVING_AVG_WINDOW: usize = 10;

/// Number of series a ranked provider returns by default
pub const DEFAULT_TOP_SERIES: usize = 4;

/// Default alert threshold as a fraction of the pool maximum
pub const DEFAULT_ALERT_THRESHOLD: f64 = 0.9;

/// Consecutive failures before a collector is reported as failed
pub const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;

// ----------------------------------------------------------------------------
// Naming
// ----------------------------------------------------------------------------

/// Positional placeholder substituted with an instance key
pub const PLACEHOLDER: &str = "{0}";

/// Instance key used for an application deployed at the root context
pub const ROOT_CONTEXT_KEY: &str = "/";

/// Instance key of the aggregate memory pool
pub const TOTAL_POOL_KEY: &str = "Total";

// ----------------------------------------------------------------------------
// Outputs
// ----------------------------------------------------------------------------

pub const DEFAULT_HTTP_LISTEN: &str = "127.0.0.1:8090";
pub const DEFAULT_SUBJECT_PREFIX: &str = "[probe-stats]";
pub const DEFAULT_CONFIG_PATH: &str = "probe-stats.toml";
pub const ENV_PREFIX: &str = "PROBE_";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

static CLOCK_ANCHOR: Lazy<(Instant, i64)> = Lazy::new(|| {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (Instant::now(), wall.as_nanos() as i64)
});

/// High-precision timestamp in nanoseconds since Unix epoch.
/// Using i64 allows representing times from ~1677 to ~2262.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Get the current timestamp with nanosecond precision.
    /// Wall-clock time at first use plus monotonic elapsed time, so
    /// successive readings never decrease when the system clock is stepped.
    #[inline]
    pub fn now() -> Self {
        let (anchor, epoch_nanos) = *CLOCK_ANCHOR;
        Self(epoch_nanos.saturating_add(anchor.elapsed().as_nanos() as i64))
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Calculate duration between two timestamps (zero if `earlier` is later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    /// Fractional seconds elapsed since `earlier`
    #[inline]
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        self.duration_since(earlier).as_secs_f64()
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    /// Convert to chrono DateTime<Utc>
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.as_secs(), (self.0 % 1_000_000_000) as u32).unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or_default())
    }
}

// ----------------------------------------------------------------------------
// 3.2 Sample - One Observation of a Named Metric
// ----------------------------------------------------------------------------

/// A single `(timestamp, value)` observation. Integer counters are stored as
/// `f64` like every other value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl Sample {
    #[inline]
    pub const fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }

    #[inline]
    pub fn now(value: f64) -> Self {
        Self::new(Timestamp::now(), value)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Metric Name Templates
// ----------------------------------------------------------------------------

static PLACEHOLDER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[^}]*\}").expect("placeholder token pattern is valid"));

/// Whether a metric name still carries the `{0}` placeholder
#[inline]
pub fn is_templated(name: &str) -> bool {
    name.contains(PLACEHOLDER)
}

/// Substitute `key` into every `{0}` of `template`.
///
/// Names without a placeholder are returned as-is (the key is ignored); a
/// templated name without a key cannot be resolved.
pub fn resolve_name<'a>(template: &'a str, key: Option<&str>) -> StorageResult<Cow<'a, str>> {
    if !is_templated(template) {
        return Ok(Cow::Borrowed(template));
    }
    match key {
        Some(key) => Ok(Cow::Owned(template.replace(PLACEHOLDER, key))),
        None => Err(StorageError::UnresolvedPlaceholder {
            template: template.to_string(),
        }),
    }
}

/// Check a configured metric template: dot-separated, no blanks, no empty
/// segments, and `{0}` as the only placeholder token.
pub fn validate_template(template: &str) -> Result<(), ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidTemplate {
        template: template.to_string(),
        message: message.to_string(),
    };

    if template.is_empty() {
        return Err(invalid("template is empty"));
    }
    if template.chars().any(char::is_whitespace) {
        return Err(invalid("template contains whitespace"));
    }
    if template.split('.').any(str::is_empty) {
        return Err(invalid("template has an empty segment"));
    }
    if let Some(token) = PLACEHOLDER_TOKEN
        .find_iter(template)
        .find(|m| m.as_str() != PLACEHOLDER)
    {
        return Err(invalid(&format!("unsupported placeholder '{}'", token.as_str())));
    }
    if template.replace(PLACEHOLDER, "").contains(['{', '}']) {
        return Err(invalid("unbalanced placeholder braces"));
    }
    Ok(())
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Self-metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProbeError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProbeError::Config(_) => false,
            ProbeError::Collector(e) => e.is_recoverable(),
            ProbeError::Storage(_) => true,
            ProbeError::Listener(_) => true,
            ProbeError::Notify(_) => true,
            ProbeError::Provider(_) => true,
            ProbeError::Metrics(_) => false,
            ProbeError::Io(_) => false,
            ProbeError::Internal(_) => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ProbeError::Config(_) => "config",
            ProbeError::Collector(_) => "collector",
            ProbeError::Storage(_) => "storage",
            ProbeError::Listener(_) => "listener",
            ProbeError::Notify(_) => "notify",
            ProbeError::Provider(_) => "provider",
            ProbeError::Metrics(_) => "metrics",
            ProbeError::Io(_) => "io",
            ProbeError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid metric template '{template}': {message}")]
    InvalidTemplate { template: String, message: String },

    #[error("Duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("Validation failed for [{section}]: {message}")]
    ValidationFailed { section: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        ConfigError::ParseError {
            message: message.into(),
        }
    }

    /// Wrap `validator` derive errors for a config section
    pub fn validation(section: impl Into<String>, errors: ValidationErrors) -> Self {
        ConfigError::ValidationFailed {
            section: section.into(),
            message: errors.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Source Errors
// ----------------------------------------------------------------------------

/// Failure reported by a subsystem adapter. Always recoverable: the cycle
/// carries on without that subsystem's samples.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("{subsystem} is unavailable: {message}")]
    Unavailable { subsystem: String, message: String },

    #[error("{subsystem} returned invalid data: {message}")]
    InvalidData { subsystem: String, message: String },
}

impl SourceError {
    pub fn unavailable(subsystem: impl Into<String>, message: impl Into<String>) -> Self {
        SourceError::Unavailable {
            subsystem: subsystem.into(),
            message: message.into(),
        }
    }

    pub fn invalid_data(subsystem: impl Into<String>, message: impl Into<String>) -> Self {
        SourceError::InvalidData {
            subsystem: subsystem.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Collector Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Collector '{collector}' could not query its source: {error}")]
    Source {
        collector: String,
        #[source]
        error: SourceError,
    },

    #[error("Collector '{collector}' timed out after {timeout_ms}ms querying {subsystem}")]
    Timeout {
        collector: String,
        subsystem: String,
        timeout_ms: u64,
    },

    #[error("Collector '{collector}' failed to record a sample: {error}")]
    Record {
        collector: String,
        #[source]
        error: StorageError,
    },

    #[error("Collector '{collector}' panicked: {message}")]
    Panicked { collector: String, message: String },
}

impl CollectorError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            CollectorError::Source { .. } => true,
            CollectorError::Timeout { .. } => true,
            CollectorError::Record { .. } => true,
            CollectorError::Panicked { .. } => true,
        }
    }

    pub fn collector(&self) -> &str {
        match self {
            CollectorError::Source { collector, .. }
            | CollectorError::Timeout { collector, .. }
            | CollectorError::Record { collector, .. }
            | CollectorError::Panicked { collector, .. } => collector,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Storage Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Metric name '{template}' has a placeholder but no instance key was given")]
    UnresolvedPlaceholder { template: String },

    #[error("Sample for '{name}' at {attempted} is older than the latest sample at {last}")]
    OutOfOrder {
        name: String,
        last: Timestamp,
        attempted: Timestamp,
    },
}

// ----------------------------------------------------------------------------
// 4.6 Listener & Notification Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Listener '{listener}' failed: {message}")]
    Failed { listener: String, message: String },

    #[error("Listener '{listener}' panicked: {message}")]
    Panicked { listener: String, message: String },
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification delivery failed: {message}")]
    Delivery { message: String },

    #[error("Notification endpoint rejected the request with status {status}")]
    Rejected { status: u16 },

    #[error("Notification timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ----------------------------------------------------------------------------
// 4.7 Provider Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Unknown series provider '{name}'")]
    UnknownProvider { name: String },

    #[error("Series provider '{provider}' needs an instance key")]
    MissingInstanceKey { provider: String },
}

// ----------------------------------------------------------------------------
// 4.8 Result Type Aliases
// ----------------------------------------------------------------------------

pub type ProbeResult<T> = Result<T, ProbeError>;
pub type SourceResult<T> = Result<T, SourceError>;
pub type CollectorResult<T> = Result<T, CollectorError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type ListenerResult<T> = Result<T, ListenerError>;
pub type NotifyResult<T> = Result<T, NotifyError>;
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Extract a readable message from a caught panic payload
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file merged with PROBE_-prefixed environment variables (`__` separates
// nesting, e.g. PROBE_STORAGE__CAPACITY=240). Validated once at startup;
// configuration errors are the only fatal error class.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Engine Configuration
// ----------------------------------------------------------------------------

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: GeneralConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub collectors: CollectorsConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Memory-pool threshold rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<AlertRuleConfig>,

    /// Chart series catalogue; a configured list replaces the built-in one
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: GeneralConfig::default(),
            storage: StorageConfig::default(),
            collectors: CollectorsConfig::default(),
            notifier: NotifierConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
            alerts: Vec::new(),
            providers: default_providers(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: EngineConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::parse_error(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| ConfigError::parse_error(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Engine
        if self.engine.instance_name.trim().is_empty() {
            return Err(ConfigError::invalid_value(
                "engine.instance_name",
                "must not be empty",
            ));
        }
        if self.engine.interval < Duration::from_millis(MIN_COLLECTION_INTERVAL_MS) {
            return Err(ConfigError::invalid_value(
                "engine.interval",
                format!("must be at least {}ms", MIN_COLLECTION_INTERVAL_MS),
            ));
        }

        // Storage
        self.storage
            .validate()
            .map_err(|e| ConfigError::validation("storage", e))?;

        // Collectors
        if self.collectors.source_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "collectors.source_timeout",
                "must be greater than zero",
            ));
        }

        // Alerts
        let mut pools = HashSet::new();
        for (index, rule) in self.alerts.iter().enumerate() {
            rule.validate()
                .map_err(|e| ConfigError::validation(format!("alerts[{}]", index), e))?;
            if rule.threshold <= 0.0 {
                return Err(ConfigError::invalid_value(
                    format!("alerts[{}].threshold", index),
                    "must be in (0, 1]",
                ));
            }
            if !pools.insert(rule.pool.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "alert pool",
                    name: rule.pool.clone(),
                });
            }
        }

        self.notifier.validate_settings()?;
        validate_providers(&self.providers)?;

        // HTTP
        if self.http.enabled {
            self.http.listen_addr()?;
        }

        // Logging
        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "json") {
            return Err(ConfigError::invalid_value(
                "logging.format",
                "must be one of: pretty, compact, json",
            ));
        }

        Ok(())
    }

    /// Generate a default configuration file content
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::from("# Failed to generate config"))
    }
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name reported in notifications and the status endpoint
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Time between two sampling cycles
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How long shutdown waits for the in-flight cycle
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            interval: default_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    ENGINE_NAME.to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(DEFAULT_COLLECTION_INTERVAL_SECS)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Storage Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StorageConfig {
    /// Samples kept per concrete metric name
    #[serde(default = "default_capacity")]
    #[validate(range(min = 1, max = 100000))]
    pub capacity: usize,

    /// Drop names not written during the last N cycles. Unset keeps every
    /// name for the life of the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1))]
    pub stale_after_cycles: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            stale_after_cycles: None,
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_SERIES_CAPACITY
}

// ----------------------------------------------------------------------------
// 5.4 Collector Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorsConfig {
    /// Bound on every subsystem query
    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub source_timeout: Duration,

    #[serde(default = "default_true")]
    pub connector: bool,

    #[serde(default = "default_true")]
    pub cluster: bool,

    #[serde(default = "default_true")]
    pub runtime: bool,

    #[serde(default = "default_true")]
    pub memory: bool,

    #[serde(default = "default_true")]
    pub datasource: bool,

    #[serde(default)]
    pub app: AppCollectorConfig,
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            source_timeout: default_source_timeout(),
            connector: true,
            cluster: true,
            runtime: true,
            memory: true,
            datasource: true,
            app: AppCollectorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppCollectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Instance keys of applications whose statistics are skipped
    /// (`/` for the root application)
    #[serde(default)]
    pub ignored_contexts: Vec<String>,
}

impl Default for AppCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ignored_contexts: Vec::new(),
        }
    }
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(DEFAULT_SOURCE_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.5 Alert & Notifier Configuration
// ----------------------------------------------------------------------------

/// One memory-pool threshold rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AlertRuleConfig {
    /// Pool instance key as written by the memory collector
    #[validate(length(min = 1))]
    pub pool: String,

    /// Fraction of the pool maximum, in (0, 1]
    #[serde(default = "default_alert_threshold")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub threshold: f64,

    /// Also send a "back to normal" notification when usage drops below
    #[serde(default)]
    pub notify_on_recovery: bool,
}

impl AlertRuleConfig {
    pub fn new(pool: impl Into<String>, threshold: f64) -> Self {
        Self {
            pool: pool.into(),
            threshold,
            notify_on_recovery: false,
        }
    }

    pub fn with_recovery(mut self) -> Self {
        self.notify_on_recovery = true;
        self
    }
}

fn default_alert_threshold() -> f64 {
    DEFAULT_ALERT_THRESHOLD
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    #[default]
    Log,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub kind: NotifierKind,

    /// Webhook endpoint (required for `kind = "webhook"`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// Bound on a single dispatch
    #[serde(default = "default_notify_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            kind: NotifierKind::Log,
            url: None,
            subject_prefix: default_subject_prefix(),
            timeout: default_notify_timeout(),
        }
    }
}

impl NotifierConfig {
    fn validate_settings(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "notifier.timeout",
                "must be greater than zero",
            ));
        }
        if self.kind == NotifierKind::Webhook {
            match self.url.as_deref() {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => {
                    return Err(ConfigError::invalid_value(
                        "notifier.url",
                        format!("'{}' is not an http(s) URL", url),
                    ))
                }
                None => {
                    return Err(ConfigError::invalid_value(
                        "notifier.url",
                        "required when notifier.kind is 'webhook'",
                    ))
                }
            }
        }
        Ok(())
    }
}

fn default_subject_prefix() -> String {
    DEFAULT_SUBJECT_PREFIX.to_string()
}

fn default_notify_timeout() -> Duration {
    Duration::from_secs(DEFAULT_NOTIFY_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.6 Series Provider Configuration
// ----------------------------------------------------------------------------

/// Static definition of a chart series provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderSpec {
    /// Fixed list of metric templates, resolved with the request's key
    Standard { name: String, templates: Vec<String> },

    /// Every name under `prefix`, smoothed and ranked
    Multiple {
        name: String,
        prefix: String,
        #[serde(default = "default_window")]
        window: usize,
        #[serde(default = "default_top")]
        top: usize,
    },
}

impl ProviderSpec {
    pub fn standard(name: &str, templates: &[&str]) -> Self {
        ProviderSpec::Standard {
            name: name.to_string(),
            templates: templates.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn multiple(name: &str, prefix: &str, window: usize, top: usize) -> Self {
        ProviderSpec::Multiple {
            name: name.to_string(),
            prefix: prefix.to_string(),
            window,
            top,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ProviderSpec::Standard { name, .. } | ProviderSpec::Multiple { name, .. } => name,
        }
    }
}

fn default_window() -> usize {
    DEFAULT_MOVING_AVG_WINDOW
}

fn default_top() -> usize {
    DEFAULT_TOP_SERIES
}

/// Built-in chart catalogue of the monitoring console
pub fn default_providers() -> Vec<ProviderSpec> {
    vec![
        ProviderSpec::standard("cl_traffic", &["cluster.sent", "cluster.received"]),
        ProviderSpec::standard("cl_request", &["cluster.req.sent", "cluster.req.received"]),
        ProviderSpec::standard(
            "connector",
            &["stat.connector.{0}.requests", "stat.connector.{0}.errors"],
        ),
        ProviderSpec::standard(
            "traffic",
            &["stat.connector.{0}.sent", "stat.connector.{0}.received"],
        ),
        ProviderSpec::standard("connector_proc_time", &["stat.connector.{0}.proc_time"]),
        ProviderSpec::standard("memory_usage", &["memory.pool.{0}"]),
        ProviderSpec::standard("os_memory", &["os.memory.physical", "os.memory.committed"]),
        ProviderSpec::standard("swap_usage", &["os.memory.swap"]),
        ProviderSpec::standard("cpu_usage", &["os.cpu"]),
        ProviderSpec::standard("fd_usage", &["os.fd.open", "os.fd.max"]),
        ProviderSpec::standard("app_req", &["app.requests.{0}", "app.errors.{0}"]),
        ProviderSpec::standard("app_avg_proc_time", &["app.avg_proc_time.{0}"]),
        ProviderSpec::standard("total_avg_proc_time", &["total.avg_proc_time"]),
        ProviderSpec::standard("total_req", &["total.requests", "total.errors"]),
        ProviderSpec::standard("datasource_usage", &["ds.est.{0}", "ds.busy.{0}"]),
        ProviderSpec::multiple(
            "all_app_avg_proc_time",
            "app.avg_proc_time.",
            DEFAULT_MOVING_AVG_WINDOW,
            DEFAULT_TOP_SERIES,
        ),
        ProviderSpec::multiple(
            "all_app_req",
            "app.requests.",
            DEFAULT_MOVING_AVG_WINDOW,
            DEFAULT_TOP_SERIES,
        ),
    ]
}

fn validate_providers(providers: &[ProviderSpec]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for spec in providers {
        let name = spec.name();
        if name.trim().is_empty() {
            return Err(ConfigError::invalid_value("providers.name", "must not be empty"));
        }
        if !names.insert(name) {
            return Err(ConfigError::Duplicate {
                kind: "provider",
                name: name.to_string(),
            });
        }

        match spec {
            ProviderSpec::Standard { templates, .. } => {
                if templates.is_empty() {
                    return Err(ConfigError::invalid_value(
                        format!("providers.{}.templates", name),
                        "must list at least one template",
                    ));
                }
                for template in templates {
                    validate_template(template)?;
                }
            }
            ProviderSpec::Multiple {
                prefix, window, top, ..
            } => {
                if prefix.is_empty() || prefix.contains(['{', '}']) {
                    return Err(ConfigError::invalid_value(
                        format!("providers.{}.prefix", name),
                        "must be a non-empty name prefix without placeholders",
                    ));
                }
                if *window == 0 {
                    return Err(ConfigError::invalid_value(
                        format!("providers.{}.window", name),
                        "must be at least 1",
                    ));
                }
                if *top == 0 {
                    return Err(ConfigError::invalid_value(
                        format!("providers.{}.top", name),
                        "must be at least 1",
                    ));
                }
            }
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// 5.7 HTTP & Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_http_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_http_listen(),
        }
    }
}

impl HttpConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e| ConfigError::invalid_value("http.listen", format!("{}", e)))
    }
}

fn default_http_listen() -> String {
    DEFAULT_HTTP_LISTEN.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level directive; RUST_LOG takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// pretty | compact | json
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    /// Daily rolling log file; stdout when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration.
///
/// Returns the writer guard of the file appender; it must be held for the
/// life of the process or buffered lines are lost.
pub fn init_logging(config: &LoggingConfig) -> ProbeResult<Option<WorkerGuard>> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let (writer, guard, ansi) = match &config.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| ProbeError::Internal(format!("Invalid log file path: {}", path.display())))?;
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), None, config.colors),
    };

    let result = match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_names(true),
            )
            .try_init(),
        "compact" => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            )
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_thread_names(true),
            )
            .try_init(),
    };
    result.map_err(|e| ProbeError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "probe::engine",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

// ============================================================================
// SECTION 7: SELF-METRICS
// ============================================================================

/// Prometheus instruments describing the engine itself. Owned by the engine
/// context in a private registry so tests and embedders never collide.
pub struct EngineMetrics {
    registry: PrometheusRegistry,
    pub cycles: IntCounter,
    pub cycle_duration: Histogram,
    pub collector_failures: IntCounterVec,
    pub listener_failures: IntCounterVec,
    pub alerts: IntCounterVec,
    pub series_tracked: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> ProbeResult<Self> {
        let registry = PrometheusRegistry::new();

        let cycles = IntCounter::new(
            "probe_collection_cycles_total",
            "Completed collection cycles",
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "probe_cycle_duration_seconds",
                "Wall time of one collection cycle",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let collector_failures = IntCounterVec::new(
            Opts::new("probe_collector_failures_total", "Failed collector runs"),
            &["collector"],
        )?;
        let listener_failures = IntCounterVec::new(
            Opts::new("probe_listener_failures_total", "Failed listener invocations"),
            &["listener"],
        )?;
        let alerts = IntCounterVec::new(
            Opts::new("probe_alerts_total", "Threshold crossings per memory pool"),
            &["pool"],
        )?;
        let series_tracked = IntGauge::new("probe_series_tracked", "Concrete metric names in the store")?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(collector_failures.clone()))?;
        registry.register(Box::new(listener_failures.clone()))?;
        registry.register(Box::new(alerts.clone()))?;
        registry.register(Box::new(series_tracked.clone()))?;

        Ok(Self {
            registry,
            cycles,
            cycle_duration,
            collector_failures,
            listener_failures,
            alerts,
            series_tracked,
        })
    }

    /// Render every instrument in the text exposition format
    pub fn render(&self) -> ProbeResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ProbeError::Internal(format!("Non UTF-8 metrics output: {}", e)))
    }
}

impl Debug for EngineMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("cycles", &self.cycles.get())
            .field("series_tracked", &self.series_tracked.get())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 8: METRIC STORE
// ============================================================================
// Named, bounded time-series storage. One ring per concrete metric name,
// created lazily on the first sample. Per-shard locking makes every append
// atomic for readers: a reader sees a series either before or after a
// record, never in between. Reads always hand out owned snapshots.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Time Series Ring
// ----------------------------------------------------------------------------

/// Fixed-capacity ring of samples for one concrete metric name.
/// Timestamps are non-decreasing from oldest to newest.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    samples: VecDeque<Sample>,
    capacity: NonZeroUsize,
    /// Store cycle of the most recent append
    last_cycle: u64,
    total_written: u64,
}

impl TimeSeries {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.get()),
            capacity,
            last_cycle: 0,
            total_written: 0,
        }
    }

    /// Append at the tail, evicting the oldest sample once full.
    /// Returns the latest timestamp when `sample` would go backwards in time.
    fn push(&mut self, sample: Sample, cycle: u64) -> Result<(), Timestamp> {
        if let Some(last) = self.samples.back() {
            if sample.timestamp < last.timestamp {
                return Err(last.timestamp);
            }
        }
        if self.samples.len() == self.capacity.get() {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.last_cycle = cycle;
        self.total_written += 1;
        Ok(())
    }

    #[inline]
    pub fn latest(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    /// Owned copy, oldest first
    pub fn to_vec(&self) -> Vec<Sample> {
        self.samples.iter().copied().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    #[inline]
    pub fn last_cycle(&self) -> u64 {
        self.last_cycle
    }

    /// Samples ever appended, including evicted ones
    #[inline]
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}

// ----------------------------------------------------------------------------
// 8.2 Metric Store
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct MetricStore {
    series: DashMap<CompactString, TimeSeries>,
    capacity: NonZeroUsize,
    cycle: AtomicU64,
    total_records: AtomicU64,
}

/// Point-in-time summary of the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub series: usize,
    pub samples: usize,
    pub capacity: usize,
    pub cycle: u64,
    pub total_records: u64,
}

impl MetricStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            series: DashMap::new(),
            capacity,
            cycle: AtomicU64::new(0),
            total_records: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(config.capacity)
            .ok_or_else(|| ConfigError::invalid_value("storage.capacity", "must be at least 1"))?;
        Ok(Self::new(capacity))
    }

    /// Append one sample to the series named by `name` (with `key`
    /// substituted into its placeholder). Unknown names create a series.
    pub fn record(&self, name: &str, key: Option<&str>, value: f64, timestamp: Timestamp) -> StorageResult<()> {
        let resolved = resolve_name(name, key)?;
        let cycle = self.cycle.load(AtomicOrdering::Acquire);

        let mut series = self
            .series
            .entry(CompactString::from(resolved.as_ref()))
            .or_insert_with(|| TimeSeries::new(self.capacity));
        series
            .push(Sample::new(timestamp, value), cycle)
            .map_err(|last| StorageError::OutOfOrder {
                name: resolved.to_string(),
                last,
                attempted: timestamp,
            })?;
        drop(series);

        self.total_records.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    /// Most recent sample of a concrete name
    pub fn latest(&self, name: &str) -> Option<Sample> {
        self.series.get(name).and_then(|series| series.latest())
    }

    /// Snapshot of a concrete name's history, oldest first; empty when the
    /// name is unknown
    pub fn history(&self, name: &str) -> Vec<Sample> {
        self.series
            .get(name)
            .map(|series| series.to_vec())
            .unwrap_or_default()
    }

    /// Concrete names starting with `prefix`, in lexicographic order
    pub fn names_with_prefix(&self, prefix: &str) -> BTreeSet<CompactString> {
        self.series
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect()
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.series.contains_key(name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.series.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    #[inline]
    pub fn current_cycle(&self) -> u64 {
        self.cycle.load(AtomicOrdering::Acquire)
    }

    /// Advance the cycle counter; appends made afterwards are stamped with
    /// the returned cycle number
    pub fn begin_cycle(&self) -> u64 {
        self.cycle.fetch_add(1, AtomicOrdering::AcqRel) + 1
    }

    /// Remove names that received no sample during the last `max_idle`
    /// cycles. Returns how many names were dropped.
    pub fn evict_stale(&self, max_idle: u64) -> usize {
        let now = self.current_cycle();
        let before = self.series.len();
        self.series
            .retain(|_, series| now.saturating_sub(series.last_cycle()) < max_idle);
        let evicted = before.saturating_sub(self.series.len());
        if evicted > 0 {
            debug!(target: "probe::store", evicted, cycle = now, "Evicted stale series");
        }
        evicted
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            series: self.series.len(),
            samples: self.series.iter().map(|entry| entry.len()).sum(),
            capacity: self.capacity.get(),
            cycle: self.current_cycle(),
            total_records: self.total_records.load(AtomicOrdering::Relaxed),
        }
    }
}

// ============================================================================
// SECTION 9: PHASE 1 TESTS
// ============================================================================

#[cfg(test)]
mod phase1_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;
    use test_case::test_case;

    fn store(capacity: usize) -> MetricStore {
        MetricStore::new(NonZeroUsize::new(capacity).unwrap())
    }

    fn values(samples: &[Sample]) -> Vec<f64> {
        samples.iter().map(|s| s.value).collect()
    }

    #[test]
    fn test_timestamp_conversions() {
        let ts = Timestamp::from_secs(90);
        assert_eq!(ts.as_millis(), 90_000);
        assert_eq!(ts.as_nanos(), 90_000_000_000);
        assert_eq!(Timestamp::from_millis(1_500).as_secs(), 1);
        assert_eq!(ts.seconds_since(Timestamp::from_secs(88)), 2.0);
        assert_eq!(Timestamp::from_secs(1).duration_since(ts), Duration::ZERO);
        assert_eq!(ts.to_string(), "1970-01-01T00:01:30.000Z");
    }

    #[test]
    fn test_timestamp_now_never_decreases() {
        let mut previous = Timestamp::now();
        for _ in 0..10_000 {
            let current = Timestamp::now();
            assert!(current >= previous);
            previous = current;
        }
        // Anchored to the wall clock
        let wall = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let drift = (wall.as_nanos() as i64 - previous.as_nanos()).abs();
        assert!(drift < 5_000_000_000, "drift {}ns", drift);
    }

    #[rstest]
    #[case("os.cpu", None, "os.cpu")]
    #[case("os.cpu", Some("ignored"), "os.cpu")]
    #[case("memory.pool.{0}", Some("Eden Space"), "memory.pool.Eden Space")]
    #[case("a.{0}.b.{0}", Some("x"), "a.x.b.x")]
    fn test_resolve_name(#[case] template: &str, #[case] key: Option<&str>, #[case] expected: &str) {
        assert_eq!(resolve_name(template, key).unwrap(), expected);
    }

    #[test]
    fn test_resolve_name_requires_key() {
        let err = resolve_name("ds.est.{0}", None).unwrap_err();
        assert_eq!(
            err,
            StorageError::UnresolvedPlaceholder {
                template: "ds.est.{0}".to_string()
            }
        );
    }

    #[test_case("stat.connector.{0}.requests" ; "templated")]
    #[test_case("cluster.sent" ; "plain")]
    fn test_valid_templates(template: &str) {
        assert!(validate_template(template).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("app.{1}" ; "wrong index")]
    #[test_case("app.{name}" ; "named placeholder")]
    #[test_case("app..requests" ; "empty segment")]
    #[test_case("app.requests " ; "whitespace")]
    #[test_case("app.{0" ; "unbalanced")]
    fn test_invalid_templates(template: &str) {
        assert!(matches!(
            validate_template(template),
            Err(ConfigError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn test_record_evicts_oldest_past_capacity() {
        let store = store(3);
        for i in 1..=5 {
            store
                .record("os.cpu", None, i as f64, Timestamp::from_secs(i))
                .unwrap();
        }

        let history = store.history("os.cpu");
        assert_eq!(values(&history), vec![3.0, 4.0, 5.0]);
        assert_eq!(history[0].timestamp, Timestamp::from_secs(3));
        assert_eq!(store.latest("os.cpu"), Some(Sample::new(Timestamp::from_secs(5), 5.0)));
        assert_eq!(store.stats().total_records, 5);
    }

    #[test]
    fn test_unknown_names_are_empty() {
        let store = store(4);
        assert!(store.history("nope").is_empty());
        assert_eq!(store.latest("nope"), None);
        assert!(store.names_with_prefix("nope").is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_out_of_order_sample_rejected() {
        let store = store(4);
        store.record("os.cpu", None, 1.0, Timestamp::from_secs(10)).unwrap();
        store.record("os.cpu", None, 2.0, Timestamp::from_secs(10)).unwrap();

        let err = store
            .record("os.cpu", None, 3.0, Timestamp::from_secs(9))
            .unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrder { ref name, .. } if name == "os.cpu"));
        assert_eq!(values(&store.history("os.cpu")), vec![1.0, 2.0]);
    }

    #[test]
    fn test_templated_record_without_key_leaves_store_unchanged() {
        let store = store(4);
        assert!(store
            .record("memory.pool.{0}", None, 1.0, Timestamp::from_secs(1))
            .is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_instance_keys_are_independent_series() {
        let store = store(4);
        store
            .record("stat.connector.{0}.requests", Some("http-8080"), 1.0, Timestamp::from_secs(1))
            .unwrap();
        store
            .record("stat.connector.{0}.requests", Some("ajp-8009"), 7.0, Timestamp::from_secs(1))
            .unwrap();
        store
            .record("stat.connector.{0}.requests", Some("http-8080"), 2.0, Timestamp::from_secs(2))
            .unwrap();

        assert_eq!(values(&store.history("stat.connector.http-8080.requests")), vec![1.0, 2.0]);
        assert_eq!(values(&store.history("stat.connector.ajp-8009.requests")), vec![7.0]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_names_with_prefix_is_exact_and_ordered() {
        let store = store(2);
        let ts = Timestamp::from_secs(1);
        for name in ["app.requests.zeta", "app.requests.alpha", "app.requests_total", "app.errors.alpha"] {
            store.record(name, None, 1.0, ts).unwrap();
        }

        let names: Vec<String> = store
            .names_with_prefix("app.requests.")
            .into_iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(names, vec!["app.requests.alpha", "app.requests.zeta"]);
    }

    #[test]
    fn test_evict_stale_drops_idle_names() {
        let store = store(2);
        store.begin_cycle();
        store.record("a", None, 1.0, Timestamp::from_secs(1)).unwrap();
        store.record("b", None, 1.0, Timestamp::from_secs(1)).unwrap();

        store.begin_cycle();
        store.record("a", None, 2.0, Timestamp::from_secs(2)).unwrap();
        assert_eq!(store.evict_stale(2), 0);

        store.begin_cycle();
        store.record("a", None, 3.0, Timestamp::from_secs(3)).unwrap();
        assert_eq!(store.evict_stale(2), 1);
        assert!(store.contains("a"));
        assert!(!store.contains("b"));
    }

    #[test]
    fn test_history_under_concurrent_readers() {
        let store = Arc::new(store(16));
        let writes = 2_000;

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..writes {
                        let history = store.history("os.cpu");
                        assert!(history.len() <= 16);
                        // Always a contiguous run of consecutive writes
                        for pair in history.windows(2) {
                            assert_eq!(pair[1].value, pair[0].value + 1.0);
                            assert!(pair[1].timestamp >= pair[0].timestamp);
                        }
                    }
                })
            })
            .collect();

        for i in 0..writes {
            let ts = Timestamp::from_millis(i);
            store.record("os.cpu", None, i as f64, ts).unwrap();
            assert_eq!(store.history("os.cpu").last(), Some(&Sample::new(ts, i as f64)));
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }

    proptest! {
        #[test]
        fn prop_series_keeps_last_min_capacity_samples(
            capacity in 1usize..32,
            input in proptest::collection::vec(-1.0e6f64..1.0e6, 0..100),
        ) {
            let store = store(capacity);
            for (i, value) in input.iter().enumerate() {
                store.record("series", None, *value, Timestamp::from_millis(i as i64)).unwrap();
            }

            let history = store.history("series");
            let keep = input.len().min(capacity);
            prop_assert!(history.len() <= capacity);
            prop_assert_eq!(values(&history), input[input.len() - keep..].to_vec());
        }
    }
}

// ============================================================================
// SECTION 10: SUBSYSTEM SOURCE CONTRACTS
// ============================================================================
// The only seam to the monitored server. Each source is one async query that
// returns a point-in-time snapshot; counters are cumulative since server
// start and are turned into rates by the collectors.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Snapshots
// ----------------------------------------------------------------------------

/// One connector's cumulative counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSnapshot {
    /// Connector name, used as the instance key
    pub name: String,
    /// Requests served
    pub request_count: u64,
    /// Requests that failed
    pub error_count: u64,
    /// Bytes written to clients
    pub bytes_sent: u64,
    /// Bytes read from clients
    pub bytes_received: u64,
    /// Total request processing time in milliseconds
    pub processing_time_ms: u64,
}

/// Cumulative cluster replication traffic
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Bytes sent to cluster members
    pub bytes_sent: u64,
    /// Bytes received from cluster members
    pub bytes_received: u64,
    /// Replication messages sent
    pub requests_sent: u64,
    /// Replication messages received
    pub requests_received: u64,
}

/// One deployed application's cumulative counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSnapshot {
    /// Context path; empty for the root application
    pub context: String,
    /// Requests served
    pub request_count: u64,
    /// Requests that failed
    pub error_count: u64,
    /// Total request processing time in milliseconds
    pub processing_time_ms: u64,
}

/// Point-in-time usage of one memory pool, in bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPoolSnapshot {
    /// Pool name, used as the instance key
    pub name: String,
    /// Bytes in use
    pub used: u64,
    /// Bytes reserved from the OS
    pub committed: u64,
    /// Upper bound, when the pool has one
    pub max: Option<u64>,
}

/// Connection counts of one datasource pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasourceSnapshot {
    /// Datasource name, used as the instance key
    pub name: String,
    /// Open connections
    pub established: u32,
    /// Connections checked out
    pub busy: u32,
}

/// Host and process figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    /// Global CPU usage, 0-100; absent when the host cannot report it
    pub cpu_percent: Option<f64>,
    /// Physical memory in use, in bytes
    pub physical_used: u64,
    /// Virtual memory of this process, in bytes
    pub committed_virtual: u64,
    /// Swap in use, in bytes
    pub swap_used: u64,
    /// Open file descriptors of this process
    pub open_fds: Option<u64>,
    /// File descriptor limit of this process
    pub max_fds: Option<u64>,
}

// ----------------------------------------------------------------------------
// 10.2 Source Traits
// ----------------------------------------------------------------------------

#[async_trait]
pub trait ConnectorSource: Send + Sync {
    async fn connectors(&self) -> SourceResult<Vec<ConnectorSnapshot>>;
}

/// `None` when the server is not clustered
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn cluster(&self) -> SourceResult<Option<ClusterSnapshot>>;
}

#[async_trait]
pub trait ApplicationSource: Send + Sync {
    async fn applications(&self) -> SourceResult<Vec<ApplicationSnapshot>>;
}

#[async_trait]
pub trait MemorySource: Send + Sync {
    async fn memory_pools(&self) -> SourceResult<Vec<MemoryPoolSnapshot>>;
}

#[async_trait]
pub trait DatasourceSource: Send + Sync {
    async fn datasources(&self) -> SourceResult<Vec<DatasourceSnapshot>>;
}

#[async_trait]
pub trait RuntimeSource: Send + Sync {
    async fn runtime(&self) -> SourceResult<RuntimeSnapshot>;
}

// ----------------------------------------------------------------------------
// 10.3 Source Set
// ----------------------------------------------------------------------------

/// Adapters available to this process. A missing adapter simply means the
/// matching collector is not registered.
#[derive(Clone, Default)]
pub struct Sources {
    pub connectors: Option<Arc<dyn ConnectorSource>>,
    pub cluster: Option<Arc<dyn ClusterSource>>,
    pub applications: Option<Arc<dyn ApplicationSource>>,
    pub memory: Option<Arc<dyn MemorySource>>,
    pub datasources: Option<Arc<dyn DatasourceSource>>,
    pub runtime: Option<Arc<dyn RuntimeSource>>,
}

impl Sources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connectors(mut self, source: Arc<dyn ConnectorSource>) -> Self {
        self.connectors = Some(source);
        self
    }

    pub fn with_cluster(mut self, source: Arc<dyn ClusterSource>) -> Self {
        self.cluster = Some(source);
        self
    }

    pub fn with_applications(mut self, source: Arc<dyn ApplicationSource>) -> Self {
        self.applications = Some(source);
        self
    }

    pub fn with_memory(mut self, source: Arc<dyn MemorySource>) -> Self {
        self.memory = Some(source);
        self
    }

    pub fn with_datasources(mut self, source: Arc<dyn DatasourceSource>) -> Self {
        self.datasources = Some(source);
        self
    }

    pub fn with_runtime(mut self, source: Arc<dyn RuntimeSource>) -> Self {
        self.runtime = Some(source);
        self
    }
}

impl Debug for Sources {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sources")
            .field("connectors", &self.connectors.is_some())
            .field("cluster", &self.cluster.is_some())
            .field("applications", &self.applications.is_some())
            .field("memory", &self.memory.is_some())
            .field("datasources", &self.datasources.is_some())
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}

// ============================================================================
// SECTION 11: COLLECTOR TRAIT & FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Collector Trait
// ----------------------------------------------------------------------------

/// A collector reads one subsystem and writes its samples into the store.
/// Called once per cycle, in registration order, from the scheduler task.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Unique collector name
    fn name(&self) -> &str;

    fn collector_type(&self) -> CollectorType;

    /// Query the subsystem and record this cycle's samples.
    /// Returns the number of samples written.
    async fn collect(&self, store: &MetricStore) -> CollectorResult<usize>;

    /// Samples the store refused since start; those series were skipped
    /// while the rest of the cycle went on
    fn rejected_samples(&self) -> u64 {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorType {
    Connector,
    Cluster,
    Application,
    Memory,
    Datasource,
    Runtime,
    Custom,
}

impl Display for CollectorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CollectorType::Connector => write!(f, "connector"),
            CollectorType::Cluster => write!(f, "cluster"),
            CollectorType::Application => write!(f, "app"),
            CollectorType::Memory => write!(f, "memory"),
            CollectorType::Datasource => write!(f, "datasource"),
            CollectorType::Runtime => write!(f, "runtime"),
            CollectorType::Custom => write!(f, "custom"),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 Collector Health & Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorStatus {
    Healthy,
    Degraded,
    Failed,
    Unknown,
}

/// Collector health information
#[derive(Debug, Clone, Serialize)]
pub struct CollectorHealth {
    /// Current health status
    pub status: CollectorStatus,
    /// Last successful collection
    pub last_success: Option<Timestamp>,
    /// Last failed collection
    pub last_error: Option<Timestamp>,
    /// Error message of the last failure
    pub last_error_message: Option<String>,
    /// Failures since the last success
    pub consecutive_failures: u32,
}

impl Default for CollectorHealth {
    fn default() -> Self {
        Self {
            status: CollectorStatus::Unknown,
            last_success: None,
            last_error: None,
            last_error_message: None,
            consecutive_failures: 0,
        }
    }
}

/// Collector statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    /// Total collection runs
    pub runs: u64,
    /// Samples written by successful runs
    pub samples_recorded: u64,
    /// Samples refused by the store
    pub samples_rejected: u64,
    /// Failed runs (errors, timeouts, panics)
    pub errors: u64,
    /// Average run duration in microseconds
    pub avg_duration_us: u64,
    /// Longest run in microseconds
    pub max_duration_us: u64,
}

/// Per-collector bookkeeping kept by the registry
#[derive(Debug, Default)]
struct CollectorTracker {
    health: RwLock<CollectorHealth>,
    runs: AtomicU64,
    samples: AtomicU64,
    errors: AtomicU64,
    total_duration_us: AtomicU64,
    max_duration_us: AtomicU64,
}

impl CollectorTracker {
    fn record_duration(&self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        self.runs.fetch_add(1, AtomicOrdering::Relaxed);
        self.total_duration_us.fetch_add(micros, AtomicOrdering::Relaxed);
        self.max_duration_us.fetch_max(micros, AtomicOrdering::Relaxed);
    }

    fn record_success(&self, duration: Duration, samples: usize) {
        self.record_duration(duration);
        self.samples.fetch_add(samples as u64, AtomicOrdering::Relaxed);

        let mut health = self.health.write();
        health.status = CollectorStatus::Healthy;
        health.last_success = Some(Timestamp::now());
        health.consecutive_failures = 0;
    }

    fn record_error(&self, duration: Duration, message: String) {
        self.record_duration(duration);
        self.errors.fetch_add(1, AtomicOrdering::Relaxed);

        let mut health = self.health.write();
        health.consecutive_failures += 1;
        health.last_error = Some(Timestamp::now());
        health.last_error_message = Some(message);
        health.status = if health.consecutive_failures >= CONSECUTIVE_FAILURE_THRESHOLD {
            CollectorStatus::Failed
        } else {
            CollectorStatus::Degraded
        };
    }

    fn health(&self) -> CollectorHealth {
        self.health.read().clone()
    }

    fn stats(&self) -> CollectorStats {
        let runs = self.runs.load(AtomicOrdering::Relaxed);
        let total = self.total_duration_us.load(AtomicOrdering::Relaxed);
        CollectorStats {
            runs,
            samples_recorded: self.samples.load(AtomicOrdering::Relaxed),
            samples_rejected: 0,
            errors: self.errors.load(AtomicOrdering::Relaxed),
            avg_duration_us: if runs > 0 { total / runs } else { 0 },
            max_duration_us: self.max_duration_us.load(AtomicOrdering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.3 Base Collector Implementation
// ----------------------------------------------------------------------------

/// Shared plumbing for the subsystem collectors: bounded source queries and
/// error mapping on record.
#[derive(Debug)]
pub struct BaseCollector {
    name: String,
    collector_type: CollectorType,
    source_timeout: Duration,
    rejected: AtomicU64,
}

impl BaseCollector {
    pub fn new(name: impl Into<String>, collector_type: CollectorType, source_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            collector_type,
            source_timeout,
            rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rejected_samples(&self) -> u64 {
        self.rejected.load(AtomicOrdering::Relaxed)
    }

    /// Absorb a per-series failure so the remaining instances still get
    /// recorded. Returns the number of samples that landed (0 or 1).
    pub fn settle(&self, result: CollectorResult<()>) -> usize {
        match result {
            Ok(()) => 1,
            Err(error) => {
                self.rejected.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(
                    target: "probe::collector",
                    collector = %self.name,
                    error = %error,
                    "Sample skipped"
                );
                0
            }
        }
    }

    pub fn collector_type(&self) -> CollectorType {
        self.collector_type
    }

    /// Run one source query under the configured timeout
    pub async fn query<T, F>(&self, subsystem: &str, request: F) -> CollectorResult<T>
    where
        F: Future<Output = SourceResult<T>> + Send,
    {
        match timeout(self.source_timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(CollectorError::Source {
                collector: self.name.clone(),
                error,
            }),
            Err(_) => Err(CollectorError::Timeout {
                collector: self.name.clone(),
                subsystem: subsystem.to_string(),
                timeout_ms: self.source_timeout.as_millis() as u64,
            }),
        }
    }

    pub fn record(
        &self,
        store: &MetricStore,
        name: &str,
        key: Option<&str>,
        value: f64,
        at: Timestamp,
    ) -> CollectorResult<()> {
        store
            .record(name, key, value, at)
            .map_err(|error| self.storage_error(error))
    }

    /// Record the per-second rate of a cumulative counter. The counter
    /// baseline only advances once the sample is stored.
    pub fn record_rate(
        &self,
        store: &MetricStore,
        deltas: &DeltaTracker,
        name: &str,
        key: Option<&str>,
        counter: u64,
        at: Timestamp,
    ) -> CollectorResult<()> {
        let concrete = resolve_name(name, key).map_err(|error| self.storage_error(error))?;
        let rate = deltas.peek(&concrete, counter as f64, at).per_second();
        self.record(store, &concrete, None, rate, at)?;
        deltas.commit(&concrete, counter as f64, at);
        Ok(())
    }

    fn storage_error(&self, error: StorageError) -> CollectorError {
        CollectorError::Record {
            collector: self.name.clone(),
            error,
        }
    }
}

// ----------------------------------------------------------------------------
// 11.4 Delta Statistics
// ----------------------------------------------------------------------------

/// Change of a cumulative counter between two observations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delta {
    pub amount: f64,
    pub elapsed_secs: f64,
}

impl Delta {
    const ZERO: Delta = Delta {
        amount: 0.0,
        elapsed_secs: 0.0,
    };

    pub fn per_second(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.amount / self.elapsed_secs
        } else {
            0.0
        }
    }
}

/// Remembers the previous value of each cumulative counter.
///
/// The first observation of a name yields a zero delta. A counter that went
/// backwards (server restart) also yields zero and becomes the new baseline.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    previous: Mutex<HashMap<CompactString, (Timestamp, f64)>>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta against the stored baseline, which then moves to `value`
    pub fn observe(&self, name: &str, value: f64, at: Timestamp) -> Delta {
        let delta = self.peek(name, value, at);
        self.commit(name, value, at);
        delta
    }

    /// Delta against the stored baseline without moving it
    pub fn peek(&self, name: &str, value: f64, at: Timestamp) -> Delta {
        match self.previous.lock().get(name) {
            Some(&(then, before)) if value >= before => Delta {
                amount: value - before,
                elapsed_secs: at.seconds_since(then),
            },
            _ => Delta::ZERO,
        }
    }

    pub fn commit(&self, name: &str, value: f64, at: Timestamp) {
        self.previous
            .lock()
            .insert(CompactString::from(name), (at, value));
    }

    /// Forget counters not observed at or after `cutoff`
    pub fn prune_before(&self, cutoff: Timestamp) {
        self.previous.lock().retain(|_, (seen, _)| *seen >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.previous.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.lock().is_empty()
    }
}

// ----------------------------------------------------------------------------
// 11.5 Collector Registry
// ----------------------------------------------------------------------------

/// Result of one collector run within a cycle
#[derive(Debug, Clone, Serialize)]
pub struct CollectorOutcome {
    pub collector: String,
    pub samples: usize,
    pub error: Option<String>,
    pub duration_us: u64,
}

impl CollectorOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

struct RegisteredCollector {
    collector: Arc<dyn Collector>,
    tracker: CollectorTracker,
}

/// Ordered collector list; registration order is execution order
#[derive(Default)]
pub struct CollectorRegistry {
    entries: Vec<RegisteredCollector>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the standard collector set for the available sources
    pub fn from_sources(config: &CollectorsConfig, sources: &Sources) -> Self {
        let mut registry = Self::new();
        let source_timeout = config.source_timeout;

        if let (true, Some(source)) = (config.connector, &sources.connectors) {
            registry.register(ConnectorCollector::new(source.clone(), source_timeout));
        }
        if let (true, Some(source)) = (config.cluster, &sources.cluster) {
            registry.register(ClusterCollector::new(source.clone(), source_timeout));
        }
        if let (true, Some(source)) = (config.runtime, &sources.runtime) {
            registry.register(RuntimeCollector::new(source.clone(), source_timeout));
        }
        if let (true, Some(source)) = (config.app.enabled, &sources.applications) {
            registry.register(AppCollector::new(
                source.clone(),
                source_timeout,
                config.app.ignored_contexts.clone(),
            ));
        }
        if let (true, Some(source)) = (config.memory, &sources.memory) {
            registry.register(MemoryCollector::new(source.clone(), source_timeout));
        }
        if let (true, Some(source)) = (config.datasource, &sources.datasources) {
            registry.register(DatasourceCollector::new(source.clone(), source_timeout));
        }

        info!(
            target: "probe::collectors",
            collectors = ?registry.names(),
            "Collector registry built"
        );
        registry
    }

    /// Append a collector. Returns `false` (and ignores it) when the name
    /// is already taken.
    pub fn register<C: Collector + 'static>(&mut self, collector: C) -> bool {
        self.register_arc(Arc::new(collector))
    }

    pub fn register_arc(&mut self, collector: Arc<dyn Collector>) -> bool {
        if self.entries.iter().any(|e| e.collector.name() == collector.name()) {
            warn!(
                target: "probe::collectors",
                collector = collector.name(),
                "Collector already registered, ignoring duplicate"
            );
            return false;
        }
        self.entries.push(RegisteredCollector {
            collector,
            tracker: CollectorTracker::default(),
        });
        true
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.collector.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn health(&self) -> BTreeMap<String, CollectorHealth> {
        self.entries
            .iter()
            .map(|e| (e.collector.name().to_string(), e.tracker.health()))
            .collect()
    }

    pub fn stats(&self) -> BTreeMap<String, CollectorStats> {
        self.entries
            .iter()
            .map(|e| {
                let mut stats = e.tracker.stats();
                stats.samples_rejected = e.collector.rejected_samples();
                (e.collector.name().to_string(), stats)
            })
            .collect()
    }

    /// Run every collector in order. A failure, timeout or panic is logged
    /// and counted; the remaining collectors still run.
    pub async fn collect_all(&self, store: &MetricStore, metrics: &EngineMetrics) -> Vec<CollectorOutcome> {
        let mut outcomes = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let name = entry.collector.name();
            let started = Instant::now();

            let result = match AssertUnwindSafe(entry.collector.collect(store))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(CollectorError::Panicked {
                    collector: name.to_string(),
                    message: panic_message(&*payload),
                }),
            };
            let elapsed = started.elapsed();

            let outcome = match result {
                Ok(samples) => {
                    entry.tracker.record_success(elapsed, samples);
                    trace!(
                        target: "probe::collectors",
                        collector = name,
                        samples,
                        duration_us = elapsed.as_micros() as u64,
                        "Collection complete"
                    );
                    CollectorOutcome {
                        collector: name.to_string(),
                        samples,
                        error: None,
                        duration_us: elapsed.as_micros() as u64,
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    entry.tracker.record_error(elapsed, message.clone());
                    metrics.collector_failures.with_label_values(&[name]).inc();
                    warn!(
                        target: "probe::collectors",
                        collector = name,
                        error = %message,
                        "Collection failed, continuing with remaining collectors"
                    );
                    CollectorOutcome {
                        collector: name.to_string(),
                        samples: 0,
                        error: Some(message),
                        duration_us: elapsed.as_micros() as u64,
                    }
                }
            };
            outcomes.push(outcome);
        }

        outcomes
    }
}

impl Debug for CollectorRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("collectors", &self.names())
            .finish()
    }
}

// ============================================================================
// SECTION 12: SUBSYSTEM COLLECTORS
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Connector Collector
// ----------------------------------------------------------------------------

/// Per-connector request, error, traffic and processing-time rates
pub struct ConnectorCollector {
    base: BaseCollector,
    source: Arc<dyn ConnectorSource>,
    deltas: DeltaTracker,
}

impl ConnectorCollector {
    pub fn new(source: Arc<dyn ConnectorSource>, source_timeout: Duration) -> Self {
        Self {
            base: BaseCollector::new("connector", CollectorType::Connector, source_timeout),
            source,
            deltas: DeltaTracker::new(),
        }
    }
}

#[async_trait]
impl Collector for ConnectorCollector {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn collector_type(&self) -> CollectorType {
        self.base.collector_type()
    }

    fn rejected_samples(&self) -> u64 {
        self.base.rejected_samples()
    }

    async fn collect(&self, store: &MetricStore) -> CollectorResult<usize> {
        let connectors = self.base.query("connectors", self.source.connectors()).await?;
        let now = Timestamp::now();
        let mut recorded = 0;

        for connector in &connectors {
            let key = Some(connector.name.as_str());
            let counters: [(&str, u64); 5] = [
                ("stat.connector.{0}.requests", connector.request_count),
                ("stat.connector.{0}.errors", connector.error_count),
                ("stat.connector.{0}.sent", connector.bytes_sent),
                ("stat.connector.{0}.received", connector.bytes_received),
                ("stat.connector.{0}.proc_time", connector.processing_time_ms),
            ];
            for (name, counter) in counters {
                recorded += self
                    .base
                    .settle(self.base.record_rate(store, &self.deltas, name, key, counter, now));
            }
        }

        self.deltas.prune_before(now);
        Ok(recorded)
    }
}

// ----------------------------------------------------------------------------
// 12.2 Cluster Collector
// ----------------------------------------------------------------------------

pub struct ClusterCollector {
    base: BaseCollector,
    source: Arc<dyn ClusterSource>,
    deltas: DeltaTracker,
}

impl ClusterCollector {
    pub fn new(source: Arc<dyn ClusterSource>, source_timeout: Duration) -> Self {
        Self {
            base: BaseCollector::new("cluster", CollectorType::Cluster, source_timeout),
            source,
            deltas: DeltaTracker::new(),
        }
    }
}

#[async_trait]
impl Collector for ClusterCollector {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn collector_type(&self) -> CollectorType {
        self.base.collector_type()
    }

    fn rejected_samples(&self) -> u64 {
        self.base.rejected_samples()
    }

    async fn collect(&self, store: &MetricStore) -> CollectorResult<usize> {
        let Some(cluster) = self.base.query("cluster", self.source.cluster()).await? else {
            return Ok(0);
        };
        let now = Timestamp::now();

        let counters: [(&str, u64); 4] = [
            ("cluster.sent", cluster.bytes_sent),
            ("cluster.received", cluster.bytes_received),
            ("cluster.req.sent", cluster.requests_sent),
            ("cluster.req.received", cluster.requests_received),
        ];
        let recorded: usize = counters
            .iter()
            .map(|&(name, counter)| {
                self.base
                    .settle(self.base.record_rate(store, &self.deltas, name, None, counter, now))
            })
            .sum();
        Ok(recorded)
    }
}

// ----------------------------------------------------------------------------
// 12.3 Application Collector
// ----------------------------------------------------------------------------

/// Per-application request/error rates and average processing time, plus
/// the same figures summed over all applications
pub struct AppCollector {
    base: BaseCollector,
    source: Arc<dyn ApplicationSource>,
    ignored_contexts: HashSet<String>,
    deltas: DeltaTracker,
}

impl AppCollector {
    pub fn new(source: Arc<dyn ApplicationSource>, source_timeout: Duration, ignored_contexts: Vec<String>) -> Self {
        Self {
            base: BaseCollector::new("app", CollectorType::Application, source_timeout),
            source,
            ignored_contexts: ignored_contexts.into_iter().collect(),
            deltas: DeltaTracker::new(),
        }
    }

    /// Instance key of an application context
    pub fn context_key(context: &str) -> &str {
        if context.is_empty() {
            ROOT_CONTEXT_KEY
        } else {
            context
        }
    }

    /// Request rate, error rate and average processing time of one group.
    /// Returns the number of samples stored.
    fn record_group(
        &self,
        store: &MetricStore,
        names: [&str; 3],
        key: Option<&str>,
        requests: u64,
        errors: u64,
        processing_ms: u64,
        now: Timestamp,
    ) -> usize {
        let [requests_name, errors_name, avg_name] = names;
        let concrete = |name: &str| {
            resolve_name(name, key)
                .map(Cow::into_owned)
                .map_err(|e| self.base.storage_error(e))
        };
        let keys = concrete(requests_name).and_then(|requests| concrete(avg_name).map(|avg| (requests, avg)));
        let (requests_key, avg_key) = match keys {
            Ok(keys) => keys,
            Err(error) => return self.base.settle(Err(error)),
        };

        let request_delta = self.deltas.peek(&requests_key, requests as f64, now);
        let proc_delta = self.deltas.peek(&avg_key, processing_ms as f64, now);
        let avg_proc_time = if request_delta.amount > 0.0 {
            proc_delta.amount / request_delta.amount
        } else {
            0.0
        };

        let requests_result = self
            .base
            .record(store, &requests_key, None, request_delta.per_second(), now);
        let avg_result = self.base.record(store, &avg_key, None, avg_proc_time, now);
        // Baselines advance only once both samples are stored
        if requests_result.is_ok() && avg_result.is_ok() {
            self.deltas.commit(&requests_key, requests as f64, now);
            self.deltas.commit(&avg_key, processing_ms as f64, now);
        }

        self.base.settle(requests_result)
            + self
                .base
                .settle(self.base.record_rate(store, &self.deltas, errors_name, key, errors, now))
            + self.base.settle(avg_result)
    }
}

#[async_trait]
impl Collector for AppCollector {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn collector_type(&self) -> CollectorType {
        self.base.collector_type()
    }

    fn rejected_samples(&self) -> u64 {
        self.base.rejected_samples()
    }

    async fn collect(&self, store: &MetricStore) -> CollectorResult<usize> {
        let applications = self
            .base
            .query("applications", self.source.applications())
            .await?;
        let now = Timestamp::now();
        let mut recorded = 0;
        let (mut total_requests, mut total_errors, mut total_proc) = (0u64, 0u64, 0u64);

        for app in &applications {
            let key = Self::context_key(&app.context);
            if self.ignored_contexts.contains(key) {
                continue;
            }
            recorded += self.record_group(
                store,
                ["app.requests.{0}", "app.errors.{0}", "app.avg_proc_time.{0}"],
                Some(key),
                app.request_count,
                app.error_count,
                app.processing_time_ms,
                now,
            );

            total_requests = total_requests.saturating_add(app.request_count);
            total_errors = total_errors.saturating_add(app.error_count);
            total_proc = total_proc.saturating_add(app.processing_time_ms);
        }

        recorded += self.record_group(
            store,
            ["total.requests", "total.errors", "total.avg_proc_time"],
            None,
            total_requests,
            total_errors,
            total_proc,
            now,
        );

        self.deltas.prune_before(now);
        Ok(recorded)
    }
}

// ----------------------------------------------------------------------------
// 12.4 Memory Pool Collector
// ----------------------------------------------------------------------------

/// Used bytes per memory pool (`memory.pool.{0}`) and the pool ceiling
/// (`memory.max.{0}`), including a `Total` pseudo-pool
pub struct MemoryCollector {
    base: BaseCollector,
    source: Arc<dyn MemorySource>,
}

impl MemoryCollector {
    pub fn new(source: Arc<dyn MemorySource>, source_timeout: Duration) -> Self {
        Self {
            base: BaseCollector::new("memory", CollectorType::Memory, source_timeout),
            source,
        }
    }
}

#[async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn collector_type(&self) -> CollectorType {
        self.base.collector_type()
    }

    fn rejected_samples(&self) -> u64 {
        self.base.rejected_samples()
    }

    async fn collect(&self, store: &MetricStore) -> CollectorResult<usize> {
        let pools = self.base.query("memory pools", self.source.memory_pools()).await?;
        let now = Timestamp::now();
        let (mut total_used, mut total_max) = (0u64, 0u64);
        let mut recorded = 0;

        for pool in &pools {
            // The aggregate owns the `Total` key
            if pool.name == TOTAL_POOL_KEY {
                let error = SourceError::invalid_data(
                    "memory pools",
                    format!("pool name '{}' is reserved for the aggregate", TOTAL_POOL_KEY),
                );
                self.base.settle(Err(CollectorError::Source {
                    collector: self.base.name().to_string(),
                    error,
                }));
                continue;
            }

            let max = pool.max.unwrap_or(pool.committed);
            let key = Some(pool.name.as_str());
            recorded += self
                .base
                .settle(self.base.record(store, "memory.pool.{0}", key, pool.used as f64, now));
            recorded += self
                .base
                .settle(self.base.record(store, "memory.max.{0}", key, max as f64, now));
            total_used = total_used.saturating_add(pool.used);
            total_max = total_max.saturating_add(max);
        }

        let total = Some(TOTAL_POOL_KEY);
        recorded += self
            .base
            .settle(self.base.record(store, "memory.pool.{0}", total, total_used as f64, now));
        recorded += self
            .base
            .settle(self.base.record(store, "memory.max.{0}", total, total_max as f64, now));

        Ok(recorded)
    }
}

// ----------------------------------------------------------------------------
// 12.5 Datasource Collector
// ----------------------------------------------------------------------------

pub struct DatasourceCollector {
    base: BaseCollector,
    source: Arc<dyn DatasourceSource>,
}

impl DatasourceCollector {
    pub fn new(source: Arc<dyn DatasourceSource>, source_timeout: Duration) -> Self {
        Self {
            base: BaseCollector::new("datasource", CollectorType::Datasource, source_timeout),
            source,
        }
    }
}

#[async_trait]
impl Collector for DatasourceCollector {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn collector_type(&self) -> CollectorType {
        self.base.collector_type()
    }

    fn rejected_samples(&self) -> u64 {
        self.base.rejected_samples()
    }

    async fn collect(&self, store: &MetricStore) -> CollectorResult<usize> {
        let datasources = self.base.query("datasources", self.source.datasources()).await?;
        let now = Timestamp::now();

        let mut recorded = 0;
        for ds in &datasources {
            let key = Some(ds.name.as_str());
            recorded += self
                .base
                .settle(self.base.record(store, "ds.est.{0}", key, f64::from(ds.established), now));
            recorded += self
                .base
                .settle(self.base.record(store, "ds.busy.{0}", key, f64::from(ds.busy), now));
        }
        Ok(recorded)
    }
}

// ----------------------------------------------------------------------------
// 12.6 Runtime Collector
// ----------------------------------------------------------------------------

pub struct RuntimeCollector {
    base: BaseCollector,
    source: Arc<dyn RuntimeSource>,
}

impl RuntimeCollector {
    pub fn new(source: Arc<dyn RuntimeSource>, source_timeout: Duration) -> Self {
        Self {
            base: BaseCollector::new("runtime", CollectorType::Runtime, source_timeout),
            source,
        }
    }
}

#[async_trait]
impl Collector for RuntimeCollector {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn collector_type(&self) -> CollectorType {
        self.base.collector_type()
    }

    fn rejected_samples(&self) -> u64 {
        self.base.rejected_samples()
    }

    async fn collect(&self, store: &MetricStore) -> CollectorResult<usize> {
        let runtime = self.base.query("runtime", self.source.runtime()).await?;
        let now = Timestamp::now();

        let mut values: SmallVec<[(&str, f64); 6]> = SmallVec::new();
        if let Some(cpu) = runtime.cpu_percent {
            values.push(("os.cpu", cpu));
        }
        values.push(("os.memory.physical", runtime.physical_used as f64));
        values.push(("os.memory.committed", runtime.committed_virtual as f64));
        values.push(("os.memory.swap", runtime.swap_used as f64));
        if let Some(open) = runtime.open_fds {
            values.push(("os.fd.open", open as f64));
        }
        if let Some(max) = runtime.max_fds {
            values.push(("os.fd.max", max as f64));
        }

        let recorded: usize = values
            .iter()
            .map(|&(name, value)| self.base.settle(self.base.record(store, name, None, value, now)))
            .sum();
        Ok(recorded)
    }
}

// ============================================================================
// SECTION 13: HOST SOURCES
// ============================================================================
// sysinfo-backed sources so the binary produces data on its own. Embedders
// supply their own adapters for the application server.
// ============================================================================

/// Host CPU, memory, swap and file-descriptor usage of this process
pub struct HostRuntimeSource {
    system: Mutex<SysInfoSystem>,
}

impl HostRuntimeSource {
    pub fn new() -> Self {
        let mut system = SysInfoSystem::new();
        // CPU usage is computed between two refreshes
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
        }
    }

    fn snapshot(&self) -> RuntimeSnapshot {
        let mut system = self.system.lock();
        system.refresh_cpu();
        system.refresh_memory();

        let committed_virtual = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| {
                system.refresh_process(pid);
                system.process(pid).map(|process| process.virtual_memory())
            })
            .unwrap_or(0);

        RuntimeSnapshot {
            cpu_percent: Some(f64::from(system.global_cpu_info().cpu_usage())),
            physical_used: system.used_memory(),
            committed_virtual,
            swap_used: system.used_swap(),
            open_fds: open_file_descriptors(),
            max_fds: max_file_descriptors(),
        }
    }
}

impl Default for HostRuntimeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeSource for HostRuntimeSource {
    async fn runtime(&self) -> SourceResult<RuntimeSnapshot> {
        Ok(self.snapshot())
    }
}

#[cfg(target_os = "linux")]
fn open_file_descriptors() -> Option<u64> {
    fs::read_dir("/proc/self/fd")
        .ok()
        .map(|entries| entries.count() as u64)
}

#[cfg(not(target_os = "linux"))]
fn open_file_descriptors() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn max_file_descriptors() -> Option<u64> {
    let limits = fs::read_to_string("/proc/self/limits").ok()?;
    parse_max_open_files(&limits)
}

#[cfg(not(target_os = "linux"))]
fn max_file_descriptors() -> Option<u64> {
    None
}

/// Soft "Max open files" limit from a `/proc/<pid>/limits` table
fn parse_max_open_files(limits: &str) -> Option<u64> {
    limits
        .lines()
        .find(|line| line.starts_with("Max open files"))
        .and_then(|line| line.split_whitespace().nth(3))
        .and_then(|soft| soft.parse().ok())
}

/// Physical memory and swap exposed as the `ram` and `swap` pools
pub struct HostMemorySource {
    system: Mutex<SysInfoSystem>,
}

impl HostMemorySource {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(SysInfoSystem::new()),
        }
    }

    fn snapshot(&self) -> Vec<MemoryPoolSnapshot> {
        let mut system = self.system.lock();
        system.refresh_memory();

        let total_swap = system.total_swap();
        vec![
            MemoryPoolSnapshot {
                name: "ram".to_string(),
                used: system.used_memory(),
                committed: system.total_memory(),
                max: Some(system.total_memory()),
            },
            MemoryPoolSnapshot {
                name: "swap".to_string(),
                used: system.used_swap(),
                committed: total_swap,
                max: (total_swap > 0).then_some(total_swap),
            },
        ]
    }
}

impl Default for HostMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemorySource for HostMemorySource {
    async fn memory_pools(&self) -> SourceResult<Vec<MemoryPoolSnapshot>> {
        Ok(self.snapshot())
    }
}

/// Sources backed by the local host
pub fn host_sources() -> Sources {
    Sources::new()
        .with_runtime(Arc::new(HostRuntimeSource::new()))
        .with_memory(Arc::new(HostMemorySource::new()))
}

// ============================================================================
// SECTION 14: LISTENERS & NOTIFICATION
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Notifier Trait & Implementations
// ----------------------------------------------------------------------------

/// Outbound notification channel. One attempt per call; callers never retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> NotifyResult<()>;
}

/// Writes notifications to the log as structured warnings
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> NotifyResult<()> {
        warn!(target: "probe::alerts", subject, body, "Alert notification");
        Ok(())
    }
}

/// POSTs `{subject, body, instance, timestamp}` as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: HttpClient,
    url: String,
    instance: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, instance: impl Into<String>, request_timeout: Duration) -> NotifyResult<Self> {
        let client = HttpClient::builder()
            .timeout(request_timeout)
            .user_agent(format!("{}/{}", ENGINE_NAME, ENGINE_VERSION))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            instance: instance.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, body: &str) -> NotifyResult<()> {
        let payload = json!({
            "subject": subject,
            "body": body,
            "instance": self.instance,
            "timestamp": Timestamp::now().to_datetime().to_rfc3339(),
        });

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
            });
        }

        debug!(target: "probe::alerts", url = %self.url, %status, "Webhook notification delivered");
        Ok(())
    }
}

/// Build the notifier selected by configuration
pub fn build_notifier(config: &NotifierConfig, instance: &str) -> ProbeResult<Arc<dyn Notifier>> {
    match config.kind {
        NotifierKind::Log => Ok(Arc::new(LogNotifier)),
        NotifierKind::Webhook => {
            let url = config
                .url
                .clone()
                .ok_or_else(|| ConfigError::invalid_value("notifier.url", "required for webhook notifier"))?;
            Ok(Arc::new(WebhookNotifier::new(url, instance, config.timeout)?))
        }
    }
}

// ----------------------------------------------------------------------------
// 14.2 Listener Trait
// ----------------------------------------------------------------------------

/// Identifies the cycle a listener is invoked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleInfo {
    pub cycle: u64,
    pub started_at: Timestamp,
}

/// Cycle-completion hook. Runs in the scheduler task after every collector
/// of the cycle has finished; it reads the store but never writes it.
#[async_trait]
pub trait Listener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_cycle_complete(&self, store: &MetricStore, cycle: &CycleInfo) -> ListenerResult<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerOutcome {
    pub listener: String,
    pub error: Option<String>,
    pub duration_us: u64,
}

/// Ordered listener list
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn Listener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<L: Listener + 'static>(&mut self, listener: L) {
        self.listeners.push(Arc::new(listener));
    }

    pub fn register_arc(&mut self, listener: Arc<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn names(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Invoke every listener in order; failures and panics are logged and
    /// the rest still run
    pub async fn notify_all(&self, store: &MetricStore, cycle: &CycleInfo, metrics: &EngineMetrics) -> Vec<ListenerOutcome> {
        let mut outcomes = Vec::with_capacity(self.listeners.len());

        for listener in &self.listeners {
            let name = listener.name();
            let started = Instant::now();

            let result = match AssertUnwindSafe(listener.on_cycle_complete(store, cycle))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(ListenerError::Panicked {
                    listener: name.to_string(),
                    message: panic_message(&*payload),
                }),
            };

            let error = result.err().map(|e| {
                metrics.listener_failures.with_label_values(&[name]).inc();
                warn!(
                    target: "probe::scheduler",
                    listener = name,
                    cycle = cycle.cycle,
                    error = %e,
                    "Listener failed, continuing with remaining listeners"
                );
                e.to_string()
            });

            outcomes.push(ListenerOutcome {
                listener: name.to_string(),
                error,
                duration_us: started.elapsed().as_micros() as u64,
            });
        }

        outcomes
    }
}

impl Debug for ListenerRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.names())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 14.3 Memory Pool Threshold Alert
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Usage went from below to at-or-above the threshold
    Crossed,
    /// Usage went back below the threshold
    Recovered,
}

/// One threshold transition, ready to be turned into a notification
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub kind: AlertKind,
    pub pool: String,
    pub used: f64,
    pub max: f64,
    pub usage: f64,
    pub threshold: f64,
    pub cycle: u64,
    pub timestamp: Timestamp,
}

impl AlertEvent {
    pub fn subject(&self, prefix: &str) -> String {
        match self.kind {
            AlertKind::Crossed => format!(
                "{} Memory pool '{}' is at {:.1}% (threshold {:.1}%)",
                prefix,
                self.pool,
                self.usage * 100.0,
                self.threshold * 100.0
            ),
            AlertKind::Recovered => format!(
                "{} Memory pool '{}' is back to normal at {:.1}%",
                prefix,
                self.pool,
                self.usage * 100.0
            ),
        }
    }

    pub fn body(&self, instance: &str) -> String {
        format!(
            "Instance:  {}\nPool:      {}\nUsed:      {} bytes\nMax:       {} bytes\nUsage:     {:.2}%\nThreshold: {:.2}%\nCycle:     {}\nTime:      {}\nAlert id:  {}",
            instance,
            self.pool,
            self.used,
            self.max,
            self.usage * 100.0,
            self.threshold * 100.0,
            self.cycle,
            self.timestamp,
            self.id
        )
    }
}

/// Edge-triggered memory-pool usage alert.
///
/// Each rule notifies once when `used / max` reaches its threshold and stays
/// silent until a later cycle observes usage below it again. Cycles without
/// data for the pool leave the rule's state untouched.
pub struct MemoryPoolAlertListener {
    rules: Vec<AlertRuleConfig>,
    above: Mutex<HashMap<String, bool>>,
    notifier: Arc<dyn Notifier>,
    subject_prefix: String,
    instance: String,
    notify_timeout: Duration,
    metrics: Option<Arc<EngineMetrics>>,
}

impl MemoryPoolAlertListener {
    pub fn new(rules: Vec<AlertRuleConfig>, notifier: Arc<dyn Notifier>, config: &NotifierConfig, instance: impl Into<String>) -> Self {
        Self {
            rules,
            above: Mutex::new(HashMap::new()),
            notifier,
            subject_prefix: config.subject_prefix.clone(),
            instance: instance.into(),
            notify_timeout: config.timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Whether the pool's rule currently sits above its threshold
    pub fn is_above(&self, pool: &str) -> bool {
        self.above.lock().get(pool).copied().unwrap_or(false)
    }

    /// Update every rule's state from the store and return the transitions
    /// that need a notification
    fn evaluate(&self, store: &MetricStore, cycle: &CycleInfo) -> Vec<AlertEvent> {
        let mut above = self.above.lock();
        let mut events = Vec::new();

        for rule in &self.rules {
            let key = Some(rule.pool.as_str());
            let used = resolve_name("memory.pool.{0}", key)
                .ok()
                .and_then(|name| store.latest(&name));
            let max = resolve_name("memory.max.{0}", key)
                .ok()
                .and_then(|name| store.latest(&name));

            let (Some(used), Some(max)) = (used, max) else {
                trace!(target: "probe::alerts", pool = %rule.pool, "No data for pool, rule skipped");
                continue;
            };
            if max.value <= 0.0 {
                trace!(target: "probe::alerts", pool = %rule.pool, "Pool has no maximum, rule skipped");
                continue;
            }

            let usage = used.value / max.value;
            let is_above = usage >= rule.threshold;
            let was_above = above.insert(rule.pool.clone(), is_above).unwrap_or(false);

            let kind = match (was_above, is_above) {
                (false, true) => AlertKind::Crossed,
                (true, false) if rule.notify_on_recovery => AlertKind::Recovered,
                _ => continue,
            };
            events.push(AlertEvent {
                id: Uuid::new_v4(),
                kind,
                pool: rule.pool.clone(),
                used: used.value,
                max: max.value,
                usage,
                threshold: rule.threshold,
                cycle: cycle.cycle,
                timestamp: used.timestamp,
            });
        }

        events
    }

    async fn dispatch(&self, event: &AlertEvent) {
        let subject = event.subject(&self.subject_prefix);
        let body = event.body(&self.instance);

        match timeout(self.notify_timeout, self.notifier.notify(&subject, &body)).await {
            Ok(Ok(())) => info!(
                target: "probe::alerts",
                pool = %event.pool,
                kind = ?event.kind,
                usage = event.usage,
                "Alert notification sent"
            ),
            Ok(Err(e)) => warn!(
                target: "probe::alerts",
                pool = %event.pool,
                error = %e,
                "Alert notification failed, not retried"
            ),
            Err(_) => warn!(
                target: "probe::alerts",
                pool = %event.pool,
                timeout_ms = self.notify_timeout.as_millis() as u64,
                "Alert notification timed out, not retried"
            ),
        }
    }
}

#[async_trait]
impl Listener for MemoryPoolAlertListener {
    fn name(&self) -> &str {
        "memory_pool_alert"
    }

    async fn on_cycle_complete(&self, store: &MetricStore, cycle: &CycleInfo) -> ListenerResult<()> {
        let events = self.evaluate(store, cycle);

        for event in &events {
            if event.kind == AlertKind::Crossed {
                if let Some(metrics) = &self.metrics {
                    metrics.alerts.with_label_values(&[event.pool.as_str()]).inc();
                }
            }
            self.dispatch(event).await;
        }
        Ok(())
    }
}

// ============================================================================
// SECTION 15: SERIES PROVIDERS
// ============================================================================
// Read-side views for charting. A provider turns the current store contents
// into labeled series on demand; it holds no state of its own.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Series Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledSeries {
    pub label: String,
    pub points: Vec<Sample>,
}

impl LabeledSeries {
    pub fn new(label: impl Into<String>, points: Vec<Sample>) -> Self {
        Self {
            label: label.into(),
            points,
        }
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }
}

/// Per-request parameters of a series lookup
#[derive(Debug, Clone, Copy, Default)]
pub struct SeriesQuery<'a> {
    /// Instance key substituted into templated names
    pub key: Option<&'a str>,
    /// Overrides the top-K of ranked providers; zero means "use configured"
    pub top: Option<usize>,
}

impl<'a> SeriesQuery<'a> {
    pub fn keyed(key: &'a str) -> Self {
        Self {
            key: Some(key),
            top: None,
        }
    }

    pub fn with_top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }
}

pub trait SeriesProvider: Send + Sync {
    fn name(&self) -> &str;

    /// "standard" or "multiple"
    fn kind(&self) -> &'static str;

    fn resolve(&self, store: &MetricStore, query: &SeriesQuery<'_>) -> ProviderResult<Vec<LabeledSeries>>;
}

// ----------------------------------------------------------------------------
// 15.2 Moving Average
// ----------------------------------------------------------------------------

pub struct MovingAverageCalculator;

impl MovingAverageCalculator {
    /// Causal trailing mean: point `i` averages the last `min(window, i + 1)`
    /// raw values, keeping the raw timestamp.
    pub fn trailing(points: &[Sample], window: usize) -> Vec<Sample> {
        let window = window.max(1);
        points
            .iter()
            .enumerate()
            .map(|(i, point)| {
                let start = (i + 1).saturating_sub(window);
                let slice = &points[start..=i];
                let mean = slice.iter().map(|p| p.value).sum::<f64>() / slice.len() as f64;
                Sample::new(point.timestamp, mean)
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// 15.3 Standard Provider
// ----------------------------------------------------------------------------

/// Raw history of a fixed list of names, in declaration order
#[derive(Debug, Clone)]
pub struct StandardSeriesProvider {
    name: String,
    templates: Vec<String>,
}

impl StandardSeriesProvider {
    pub fn new(name: impl Into<String>, templates: Vec<String>) -> Self {
        Self {
            name: name.into(),
            templates,
        }
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    pub fn needs_key(&self) -> bool {
        self.templates.iter().any(|t| is_templated(t))
    }
}

impl SeriesProvider for StandardSeriesProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "standard"
    }

    fn resolve(&self, store: &MetricStore, query: &SeriesQuery<'_>) -> ProviderResult<Vec<LabeledSeries>> {
        self.templates
            .iter()
            .map(|template| -> ProviderResult<LabeledSeries> {
                let name = resolve_name(template, query.key).map_err(|_| ProviderError::MissingInstanceKey {
                    provider: self.name.clone(),
                })?;
                let points = store.history(&name);
                Ok(LabeledSeries::new(name.into_owned(), points))
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// 15.4 Multiple Provider
// ----------------------------------------------------------------------------

/// Every name under a prefix, smoothed with a trailing moving average and
/// ranked by its latest smoothed value. Labels are the instance keys.
#[derive(Debug, Clone)]
pub struct MultipleSeriesProvider {
    name: String,
    prefix: String,
    window: usize,
    top: usize,
}

impl MultipleSeriesProvider {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, window: usize, top: usize) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            window: window.max(1),
            top: top.max(1),
        }
    }
}

impl SeriesProvider for MultipleSeriesProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "multiple"
    }

    fn resolve(&self, store: &MetricStore, query: &SeriesQuery<'_>) -> ProviderResult<Vec<LabeledSeries>> {
        let top = query.top.filter(|&top| top > 0).unwrap_or(self.top);

        // Names arrive in lexicographic order; the stable sort keeps it for ties
        let mut ranked: Vec<(OrderedFloat<f64>, LabeledSeries)> = store
            .names_with_prefix(&self.prefix)
            .into_iter()
            .filter_map(|name| {
                let smoothed = MovingAverageCalculator::trailing(&store.history(&name), self.window);
                let latest = smoothed.last()?.value;
                let label = &name.as_str()[self.prefix.len()..];
                Some((OrderedFloat(latest), LabeledSeries::new(label, smoothed)))
            })
            .collect();

        ranked.sort_by_key(|(latest, _)| Reverse(*latest));
        ranked.truncate(top);

        Ok(ranked.into_iter().map(|(_, series)| series).collect())
    }
}

// ----------------------------------------------------------------------------
// 15.5 Provider Registry
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub kind: &'static str,
}

/// Name → provider lookup built once from configuration
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn SeriesProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: &[ProviderSpec]) -> Result<Self, ConfigError> {
        validate_providers(specs)?;

        let mut registry = Self::new();
        for spec in specs {
            let provider: Arc<dyn SeriesProvider> = match spec {
                ProviderSpec::Standard { name, templates } => {
                    Arc::new(StandardSeriesProvider::new(name.clone(), templates.clone()))
                }
                ProviderSpec::Multiple {
                    name,
                    prefix,
                    window,
                    top,
                } => Arc::new(MultipleSeriesProvider::new(name.clone(), prefix.clone(), *window, *top)),
            };
            registry.register(provider)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn SeriesProvider>) -> Result<(), ConfigError> {
        let name = provider.name().to_string();
        if self.providers.contains_key(&name) {
            return Err(ConfigError::Duplicate { kind: "provider", name });
        }
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SeriesProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .values()
            .map(|p| ProviderInfo {
                name: p.name().to_string(),
                kind: p.kind(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Look up `name` and resolve it against the store
    pub fn resolve(&self, name: &str, store: &MetricStore, query: &SeriesQuery<'_>) -> ProviderResult<Vec<LabeledSeries>> {
        let provider = self.providers.get(name).ok_or_else(|| ProviderError::UnknownProvider {
            name: name.to_string(),
        })?;
        provider.resolve(store, query)
    }
}

impl Debug for ProviderRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// SECTION 16: SCHEDULER & ENGINE CONTEXT
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Stats Context
// ----------------------------------------------------------------------------

/// Everything the engine's tasks share: configuration, the store, the
/// provider catalogue and self-metrics. Built once, passed around by `Arc`.
#[derive(Debug)]
pub struct StatsContext {
    pub config: Arc<EngineConfig>,
    pub store: MetricStore,
    pub providers: ProviderRegistry,
    pub metrics: Arc<EngineMetrics>,
}

impl StatsContext {
    pub fn new(config: EngineConfig) -> ProbeResult<Self> {
        config.validate()?;
        let store = MetricStore::from_config(&config.storage)?;
        let providers = ProviderRegistry::from_specs(&config.providers)?;
        let metrics = Arc::new(EngineMetrics::new()?);

        Ok(Self {
            config: Arc::new(config),
            store,
            providers,
            metrics,
        })
    }
}

// ----------------------------------------------------------------------------
// 16.2 Scheduler State & Cycle Reports
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Idle,
    Sampling,
    Notifying,
}

impl SchedulerState {
    pub fn is_running(&self) -> bool {
        !matches!(self, SchedulerState::Stopped)
    }
}

impl Display for SchedulerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Stopped => write!(f, "stopped"),
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Sampling => write!(f, "sampling"),
            SchedulerState::Notifying => write!(f, "notifying"),
        }
    }
}

const PHASE_IDLE: u8 = 0;
const PHASE_SAMPLING: u8 = 1;
const PHASE_NOTIFYING: u8 = 2;

/// What happened during one cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: Timestamp,
    pub duration_us: u64,
    pub collectors: Vec<CollectorOutcome>,
    pub listeners: Vec<ListenerOutcome>,
    pub evicted: usize,
    pub series: usize,
}

impl CycleReport {
    pub fn failed_collectors(&self) -> usize {
        self.collectors.iter().filter(|o| !o.is_success()).count()
    }

    pub fn failed_listeners(&self) -> usize {
        self.listeners.iter().filter(|o| o.error.is_some()).count()
    }
}

// ----------------------------------------------------------------------------
// 16.3 Scheduler
// ----------------------------------------------------------------------------

struct SchedulerCore {
    context: Arc<StatsContext>,
    collectors: CollectorRegistry,
    listeners: ListenerRegistry,
    running: std::sync::atomic::AtomicBool,
    phase: AtomicU8,
    last_report: ArcSwapOption<CycleReport>,
    /// Serializes cycles so the store keeps a single writer
    cycle_lock: tokio::sync::Mutex<()>,
}

impl SchedulerCore {
    fn state(&self) -> SchedulerState {
        match self.phase.load(AtomicOrdering::Acquire) {
            PHASE_SAMPLING => SchedulerState::Sampling,
            PHASE_NOTIFYING => SchedulerState::Notifying,
            _ if self.running.load(AtomicOrdering::Acquire) => SchedulerState::Idle,
            _ => SchedulerState::Stopped,
        }
    }

    fn set_phase(&self, phase: u8) {
        self.phase.store(phase, AtomicOrdering::Release);
    }

    /// One tick: collectors in order, then listeners, then the optional
    /// stale-series pass
    async fn run_cycle(&self) -> Arc<CycleReport> {
        let _serial = self.cycle_lock.lock().await;

        let started = Instant::now();
        let started_at = Timestamp::now();
        let context = &self.context;
        let store = &context.store;
        let metrics = &context.metrics;
        let cycle = store.begin_cycle();

        self.set_phase(PHASE_SAMPLING);
        let collectors = self.collectors.collect_all(store, metrics).await;

        self.set_phase(PHASE_NOTIFYING);
        let info = CycleInfo { cycle, started_at };
        let listeners = self.listeners.notify_all(store, &info, metrics).await;

        let evicted = context
            .config
            .storage
            .stale_after_cycles
            .map(|max_idle| store.evict_stale(max_idle))
            .unwrap_or(0);

        let elapsed = started.elapsed();
        metrics.cycles.inc();
        metrics.cycle_duration.observe(elapsed.as_secs_f64());
        metrics.series_tracked.set(store.len() as i64);

        let report = Arc::new(CycleReport {
            cycle,
            started_at,
            duration_us: elapsed.as_micros() as u64,
            collectors,
            listeners,
            evicted,
            series: store.len(),
        });

        debug!(
            target: "probe::scheduler",
            cycle,
            duration_ms = elapsed.as_millis() as u64,
            failed_collectors = report.failed_collectors(),
            failed_listeners = report.failed_listeners(),
            evicted,
            series = report.series,
            "Cycle complete"
        );

        self.last_report.store(Some(report.clone()));
        self.set_phase(PHASE_IDLE);
        report
    }

    async fn run_loop(self: Arc<Self>, period: Duration, token: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Cancellation is only observed between ticks; a started cycle
            // always runs to completion.
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_cycle().await;
        }

        debug!(target: "probe::scheduler", "Scheduler loop exited");
    }
}

struct RunningTask {
    token: CancellationToken,
    handle: TokioJoinHandle<()>,
}

/// Drives collection cycles at a fixed interval.
///
/// `start` spawns the periodic task; `stop` cancels it and waits for an
/// in-flight cycle to finish, so no cycle begins after `stop` returns. Both
/// may be called repeatedly.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    period: Duration,
    task: Mutex<Option<RunningTask>>,
}

impl Scheduler {
    pub fn new(context: Arc<StatsContext>, collectors: CollectorRegistry, listeners: ListenerRegistry) -> Self {
        let period = context.config.engine.interval;
        Self {
            core: Arc::new(SchedulerCore {
                context,
                collectors,
                listeners,
                running: std::sync::atomic::AtomicBool::new(false),
                phase: AtomicU8::new(PHASE_IDLE),
                last_report: ArcSwapOption::empty(),
                cycle_lock: tokio::sync::Mutex::new(()),
            }),
            period,
            task: Mutex::new(None),
        }
    }

    /// Begin periodic execution. Returns `false` if already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock();
        if task.is_some() {
            debug!(target: "probe::scheduler", "Scheduler already running");
            return false;
        }

        let token = CancellationToken::new();
        self.core.running.store(true, AtomicOrdering::Release);
        let handle = tokio::spawn(self.core.clone().run_loop(self.period, token.clone()));
        *task = Some(RunningTask { token, handle });

        info!(
            target: "probe::scheduler",
            interval = %humantime::format_duration(self.period),
            collectors = self.core.collectors.len(),
            listeners = self.core.listeners.len(),
            "Scheduler started"
        );
        true
    }

    /// Stop periodic execution, waiting for the in-flight cycle.
    /// Returns `false` if the scheduler was not running.
    pub async fn stop(&self) -> bool {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return false;
        };

        task.token.cancel();
        // The in-flight cycle still reports its own phase until it finishes
        self.core.running.store(false, AtomicOrdering::Release);
        if let Err(e) = task.handle.await {
            error!(target: "probe::scheduler", error = %e, "Scheduler task ended abnormally");
        }

        info!(target: "probe::scheduler", "Scheduler stopped");
        true
    }

    /// Run exactly one cycle in the caller's task
    pub async fn run_cycle(&self) -> Arc<CycleReport> {
        self.core.run_cycle().await
    }

    pub fn state(&self) -> SchedulerState {
        self.core.state()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn last_report(&self) -> Option<Arc<CycleReport>> {
        self.core.last_report.load_full()
    }

    pub fn context(&self) -> &Arc<StatsContext> {
        &self.core.context
    }

    pub fn collectors(&self) -> &CollectorRegistry {
        &self.core.collectors
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.core.listeners
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.token.cancel();
        }
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("period", &self.period)
            .field("collectors", &self.core.collectors)
            .field("listeners", &self.core.listeners)
            .finish()
    }
}

// ============================================================================
// SECTION 17: PHASE 2 TESTS
// ============================================================================


// ============================================================================
// SECTION 18: ENGINE
// ============================================================================

/// The assembled engine: context, scheduler and the HTTP surface
pub struct Engine {
    context: Arc<StatsContext>,
    scheduler: Arc<Scheduler>,
    started_at: Timestamp,
}

impl Engine {
    /// Build an engine from configuration and the server's subsystem sources.
    /// Registers the memory-pool alert when rules are configured.
    pub fn new(config: EngineConfig, sources: Sources) -> ProbeResult<Self> {
        let context = Arc::new(StatsContext::new(config)?);
        let config = context.config.clone();

        let collectors = CollectorRegistry::from_sources(&config.collectors, &sources);

        let mut listeners = ListenerRegistry::new();
        if !config.alerts.is_empty() {
            let instance = config.engine.instance_name.as_str();
            let notifier = build_notifier(&config.notifier, instance)?;
            listeners.register(
                MemoryPoolAlertListener::new(config.alerts.clone(), notifier, &config.notifier, instance)
                    .with_metrics(context.metrics.clone()),
            );
        }

        Ok(Self::with_registries(context, collectors, listeners))
    }

    pub fn with_registries(
        context: Arc<StatsContext>,
        collectors: CollectorRegistry,
        listeners: ListenerRegistry,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(context.clone(), collectors, listeners));
        Self {
            context,
            scheduler,
            started_at: Timestamp::now(),
        }
    }

    pub fn context(&self) -> &Arc<StatsContext> {
        &self.context
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            context: self.context.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    /// Run until SIGINT/SIGTERM, then stop the scheduler within the
    /// configured grace period
    pub async fn run(&self) -> ProbeResult<()> {
        let config = self.context.config.clone();

        info!(
            target: "probe::engine",
            version = ENGINE_VERSION,
            instance = %config.engine.instance_name,
            interval = %humantime::format_duration(config.engine.interval),
            capacity = config.storage.capacity,
            collectors = ?self.scheduler.collectors().names(),
            listeners = ?self.scheduler.listeners().names(),
            providers = self.context.providers.len(),
            "Starting engine"
        );

        self.scheduler.start();

        let http_shutdown = CancellationToken::new();
        let http_task = if config.http.enabled {
            let addr = config.http.listen_addr()?;
            let state = self.api_state();
            let token = http_shutdown.clone();
            Some(tokio::spawn(async move { serve_http(addr, state, token).await }))
        } else {
            None
        };

        shutdown_signal().await;
        info!(target: "probe::engine", "Shutdown signal received");

        let grace = config.engine.shutdown_timeout;
        if timeout(grace, self.scheduler.stop()).await.is_err() {
            warn!(
                target: "probe::engine",
                grace_ms = grace.as_millis() as u64,
                "In-flight cycle did not finish within the shutdown timeout"
            );
        }

        http_shutdown.cancel();
        if let Some(task) = http_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(target: "probe::http", error = %e, "HTTP server failed"),
                Err(e) => error!(target: "probe::http", error = %e, "HTTP server task ended abnormally"),
            }
        }

        info!(
            target: "probe::engine",
            uptime_secs = Timestamp::now().seconds_since(self.started_at),
            cycles = self.context.store.current_cycle(),
            "Engine stopped"
        );
        Ok(())
    }
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("instance", &self.context.config.engine.instance_name)
            .field("scheduler", &self.scheduler)
            .field("started_at", &self.started_at)
            .finish()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: "probe::engine", error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(target: "probe::engine", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// ============================================================================
// SECTION 19: HTTP API
// ============================================================================
// Read-only JSON surface for charting clients plus the Prometheus scrape
// endpoint for the engine's own health.
// ============================================================================

#[derive(Debug, Clone)]
pub struct ApiState {
    pub context: Arc<StatsContext>,
    pub scheduler: Arc<Scheduler>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SeriesParams {
    pub key: Option<String>,
    pub top: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SeriesResponse {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub series: Vec<LabeledSeries>,
}

impl IntoResponse for ProbeError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProbeError::Provider(ProviderError::UnknownProvider { .. }) => StatusCode::NOT_FOUND,
            ProbeError::Provider(ProviderError::MissingInstanceKey { .. }) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.to_string(),
            "category": self.category(),
        }));
        (status, body).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/providers", get(providers_handler))
        .route("/api/series/:provider", get(series_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(AxumState(state): AxumState<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": ENGINE_VERSION,
        "scheduler": state.scheduler.state(),
    }))
}

async fn status_handler(AxumState(state): AxumState<ApiState>) -> Json<serde_json::Value> {
    let scheduler = &state.scheduler;
    Json(json!({
        "instance": state.context.config.engine.instance_name,
        "version": ENGINE_VERSION,
        "scheduler": scheduler.state(),
        "store": state.context.store.stats(),
        "collectors": scheduler.collectors().health(),
        "collector_stats": scheduler.collectors().stats(),
        "listeners": scheduler.listeners().names(),
        "last_cycle": scheduler.last_report(),
    }))
}

async fn providers_handler(AxumState(state): AxumState<ApiState>) -> Json<Vec<ProviderInfo>> {
    Json(state.context.providers.list())
}

async fn series_handler(
    AxumState(state): AxumState<ApiState>,
    AxumPath(provider): AxumPath<String>,
    AxumQuery(params): AxumQuery<SeriesParams>,
) -> Result<Json<SeriesResponse>, ProbeError> {
    let query = SeriesQuery {
        key: params.key.as_deref(),
        top: params.top,
    };
    let series = state
        .context
        .providers
        .resolve(&provider, &state.context.store, &query)?;

    Ok(Json(SeriesResponse {
        provider,
        key: params.key,
        series,
    }))
}

async fn metrics_handler(AxumState(state): AxumState<ApiState>) -> Result<impl IntoResponse, ProbeError> {
    let body = state.context.metrics.render()?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

/// Serve the API until `shutdown` is cancelled
pub async fn serve_http(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> ProbeResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "probe::http", addr = %addr, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!(target: "probe::http", "HTTP API stopped");
    Ok(())
}

// ============================================================================
// SECTION 20: COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 20.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Probe Stats CLI
#[derive(Parser, Debug)]
#[command(
    name = "probe-stats",
    version,
    about = "Statistics sampling and chart-series engine for application servers",
    long_about = "Probe Stats periodically samples application-server subsystems, keeps a \
                  bounded history per metric, serves smoothed and ranked chart series and \
                  raises memory-pool threshold alerts."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "PROBE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PROBE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the sampling engine and HTTP API (default)
    Run,

    /// Validate the configuration file
    Validate {
        /// Print the parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print a default configuration
    GenerateConfig {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the configured series providers
    Providers,

    /// Sample the local host for a few cycles and print one provider's series
    Sample {
        /// Series provider to resolve
        #[arg(short, long)]
        provider: String,

        /// Instance key for templated providers
        #[arg(short, long)]
        key: Option<String>,

        /// Number of cycles to run
        #[arg(short = 'n', long, default_value_t = 3)]
        cycles: u32,

        /// Pause between cycles
        #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
        pause: Duration,
    },

    /// Show version information
    Version,
}

// ----------------------------------------------------------------------------
// 20.2 Command Handlers
// ----------------------------------------------------------------------------

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!("Binary: {}", ENGINE_NAME);
}

fn handle_generate_config(output: Option<&Path>) -> ProbeResult<()> {
    let content = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &content)?;
            println!("✅ Configuration written to {}", path.display());
        }
        None => println!("{}", content),
    }
    Ok(())
}

fn handle_validate(config_path: &Path, verbose: bool) -> ProbeResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.engine.instance_name);
            println!("  • Collection interval: {}", humantime::format_duration(config.engine.interval));
            println!("  • History capacity: {}", config.storage.capacity);
            match config.storage.stale_after_cycles {
                Some(cycles) => println!("  • Stale series evicted after {} cycles", cycles),
                None => println!("  • Stale series retained"),
            }
            println!("  • Alert rules: {}", config.alerts.len());
            println!("  • Series providers: {}", config.providers.len());
            println!("  • Collectors enabled:");
            let collectors = &config.collectors;
            if collectors.connector { println!("    - Connectors"); }
            if collectors.cluster { println!("    - Cluster"); }
            if collectors.runtime { println!("    - Runtime"); }
            if collectors.app.enabled { println!("    - Applications"); }
            if collectors.memory { println!("    - Memory pools"); }
            if collectors.datasource { println!("    - Datasources"); }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(ProbeError::Config(e))
        }
    }
}

fn handle_providers(config: &EngineConfig) {
    println!("📈 Series providers ({}):", config.providers.len());
    for spec in &config.providers {
        match spec {
            ProviderSpec::Standard { name, templates } => {
                println!("  • {} [standard]: {}", name, templates.join(", "));
            }
            ProviderSpec::Multiple {
                name,
                prefix,
                window,
                top,
            } => {
                println!("  • {} [multiple]: {}* (window {}, top {})", name, prefix, window, top);
            }
        }
    }
}

async fn handle_sample(
    config: EngineConfig,
    provider: &str,
    key: Option<&str>,
    cycles: u32,
    pause: Duration,
) -> ProbeResult<()> {
    let engine = Engine::new(config, host_sources())?;
    let scheduler = engine.scheduler();

    for i in 0..cycles.max(1) {
        if i > 0 {
            sleep(pause).await;
        }
        let report = scheduler.run_cycle().await;
        info!(
            target: "probe::engine",
            cycle = report.cycle,
            series = report.series,
            failed_collectors = report.failed_collectors(),
            "Sampled"
        );
    }

    let context = engine.context();
    let query = SeriesQuery { key, top: None };
    let series = context.providers.resolve(provider, &context.store, &query)?;
    let response = SeriesResponse {
        provider: provider.to_string(),
        key: key.map(str::to_string),
        series,
    };

    let rendered = serde_json::to_string_pretty(&response)
        .map_err(|e| ProbeError::Internal(format!("Failed to render series: {}", e)))?;
    println!("{}", rendered);
    Ok(())
}

// ============================================================================
// SECTION 21: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging or a loaded configuration
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let mut config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }

    // Dropping the guard flushes the file appender
    let _log_guard = init_logging(&config.logging)?;

    if !config_found {
        warn!(
            target: "probe::engine",
            path = %cli.config.display(),
            "Config file not found, using defaults"
        );
    }
    info!(target: "probe::engine", "{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    match cli.command {
        Some(Commands::Providers) => handle_providers(&config),
        Some(Commands::Sample {
            provider,
            key,
            cycles,
            pause,
        }) => handle_sample(config, &provider, key.as_deref(), cycles, pause).await?,
        Some(Commands::Run) | None => {
            let engine = Engine::new(config, host_sources())?;
            engine.run().await?;
        }
        Some(Commands::Version) | Some(Commands::GenerateConfig { .. }) | Some(Commands::Validate { .. }) => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 22: PHASE 3 TESTS
// ============================================================================

#[cfg(test)]
mod phase3_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tower::ServiceExt;

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.interval, Duration::from_secs(DEFAULT_COLLECTION_INTERVAL_SECS));
        assert_eq!(config.storage.capacity, DEFAULT_SERIES_CAPACITY);
        assert_eq!(config.storage.stale_after_cycles, None);
        assert_eq!(config.providers.len(), 17);
        assert!(config.alerts.is_empty());
    }

    #[test]
    fn test_generated_config_parses_back() {
        let generated = EngineConfig::generate_default_config();
        let parsed = EngineConfig::from_toml_str(&generated).unwrap();

        assert_eq!(parsed.providers, default_providers());
        assert_eq!(parsed.engine.interval, EngineConfig::default().engine.interval);
    }

    #[test]
    fn test_config_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [engine]
            instance_name = "node-a"
            interval = "5s"

            [storage]
            capacity = 10
            stale_after_cycles = 3

            [collectors.app]
            ignored_contexts = ["probe"]

            [[alerts]]
            pool = "Heap"
            threshold = 0.75
            notify_on_recovery = true

            [[providers]]
            kind = "standard"
            name = "heap"
            templates = ["memory.pool.{0}", "memory.max.{0}"]

            [[providers]]
            kind = "multiple"
            name = "busiest"
            prefix = "app.requests."
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.instance_name, "node-a");
        assert_eq!(config.engine.interval, Duration::from_secs(5));
        assert_eq!(config.storage.capacity, 10);
        assert_eq!(config.storage.stale_after_cycles, Some(3));
        assert_eq!(config.collectors.app.ignored_contexts, vec!["probe".to_string()]);
        assert!(config.alerts[0].notify_on_recovery);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(
            config.providers[1],
            ProviderSpec::multiple("busiest", "app.requests.", DEFAULT_MOVING_AVG_WINDOW, DEFAULT_TOP_SERIES)
        );
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let mut config = EngineConfig::default();
        config.storage.capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed { .. })));

        let mut config = EngineConfig::default();
        config.engine.interval = Duration::from_millis(10);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));

        let mut config = EngineConfig::default();
        config.alerts.push(AlertRuleConfig::new("Heap", 0.0));
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.alerts.push(AlertRuleConfig::new("Heap", 1.5));
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.alerts.push(AlertRuleConfig::new("Heap", 0.8));
        config.alerts.push(AlertRuleConfig::new("Heap", 0.9));
        assert!(matches!(config.validate(), Err(ConfigError::Duplicate { .. })));

        let mut config = EngineConfig::default();
        config.notifier.kind = NotifierKind::Webhook;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_bad_providers() {
        let mut config = EngineConfig::default();
        config.providers = vec![ProviderSpec::standard("broken", &["a.{1}"])];
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTemplate { .. })));

        let mut config = EngineConfig::default();
        config.providers = vec![
            ProviderSpec::standard("dup", &["a"]),
            ProviderSpec::multiple("dup", "b.", 3, 2),
        ];
        assert!(matches!(config.validate(), Err(ConfigError::Duplicate { .. })));
    }

    #[test]
    fn test_config_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[engine]\ninstance_name = \"from-file\"\n\n[storage]\ncapacity = 42").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.engine.instance_name, "from-file");
        assert_eq!(config.storage.capacity, 42);
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");

        assert!(matches!(
            EngineConfig::load(&missing),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_parse_max_open_files() {
        let limits = "Limit                     Soft Limit           Hard Limit           Units     \n\
                      Max cpu time              unlimited            unlimited            seconds   \n\
                      Max open files            1024                 524288               files     \n";
        assert_eq!(parse_max_open_files(limits), Some(1024));
        assert_eq!(parse_max_open_files("Max open files unlimited unlimited files"), None);
        assert_eq!(parse_max_open_files(""), None);
    }

    // ------------------------------------------------------------------------
    // HTTP API
    // ------------------------------------------------------------------------

    fn api_state() -> ApiState {
        let mut config = EngineConfig::default();
        config.http.enabled = false;
        let context = Arc::new(StatsContext::new(config).unwrap());

        let store = &context.store;
        for (i, value) in [1.0, 2.0, 3.0].iter().enumerate() {
            let ts = Timestamp::from_secs(i as i64);
            store.record("app.requests.{0}", Some("shop"), *value, ts).unwrap();
            store.record("app.requests.{0}", Some("blog"), *value * 2.0, ts).unwrap();
            store.record("app.errors.{0}", Some("shop"), 0.0, ts).unwrap();
        }

        let scheduler = Arc::new(Scheduler::new(
            context.clone(),
            CollectorRegistry::new(),
            ListenerRegistry::new(),
        ));
        ApiState { context, scheduler }
    }

    async fn get_json(state: ApiState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, body) = get_json(api_state(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["scheduler"], "stopped");
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (status, body) = get_json(api_state(), "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"]["series"], 3);
        assert!(body["last_cycle"].is_null());
    }

    #[tokio::test]
    async fn test_providers_endpoint() {
        let (status, body) = get_json(api_state(), "/api/providers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(|a| a.len()), Some(17));
    }

    #[tokio::test]
    async fn test_standard_series_endpoint() {
        let (status, body) = get_json(api_state(), "/api/series/app_req?key=shop").await;
        assert_eq!(status, StatusCode::OK);

        let response: SeriesResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.key.as_deref(), Some("shop"));
        let labels: Vec<&str> = response.series.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["app.requests.shop", "app.errors.shop"]);
        assert_eq!(response.series[0].values(), vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_multiple_series_endpoint_with_top() {
        let (status, body) = get_json(api_state(), "/api/series/all_app_req?top=1").await;
        assert_eq!(status, StatusCode::OK);

        let response: SeriesResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.series.len(), 1);
        assert_eq!(response.series[0].label, "blog");
    }

    #[tokio::test]
    async fn test_series_endpoint_errors() {
        let (status, body) = get_json(api_state(), "/api/series/app_req").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["category"], "provider");

        let (status, _) = get_json(api_state(), "/api/series/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = api_state();
        state.scheduler.run_cycle().await;

        let response = router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("probe_collection_cycles_total 1"));
        assert!(text.contains("probe_series_tracked 3"));
    }

    // ------------------------------------------------------------------------
    // CLI
    // ------------------------------------------------------------------------

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_sample_command() {
        let cli = Cli::try_parse_from([
            "probe-stats",
            "--config",
            "custom.toml",
            "sample",
            "--provider",
            "cpu_usage",
            "-n",
            "2",
            "--pause",
            "250ms",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        match cli.command {
            Some(Commands::Sample {
                provider,
                key,
                cycles,
                pause,
            }) => {
                assert_eq!(provider, "cpu_usage");
                assert_eq!(key, None);
                assert_eq!(cycles, 2);
                assert_eq!(pause, Duration::from_millis(250));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
