//! Configuration records shared across the runtime.
//!
//! Every record has a `Partial` form with all-optional fields. Layers of
//! partial configs (CLI over profile over global over provider defaults)
//! are merged with [`RateLimitConfig::resolve`] and friends: later layers
//! take precedence, unset fields fall through.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Proactive rate-limit configuration. Absent limits are unenforced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
    #[serde(default)]
    pub tokens_per_day: Option<u64>,
    /// Fraction of each limit actually usable, to stay clear of server 429s.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
}

fn default_true() -> bool {
    true
}
fn default_safety_margin() -> f64 {
    0.9
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: None,
            tokens_per_minute: None,
            tokens_per_day: None,
            safety_margin: default_safety_margin(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartialRateLimitConfig {
    pub enabled: Option<bool>,
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u64>,
    pub tokens_per_day: Option<u64>,
    pub safety_margin: Option<f64>,
}

impl RateLimitConfig {
    pub fn overlay(mut self, layer: &PartialRateLimitConfig) -> Self {
        if let Some(v) = layer.enabled {
            self.enabled = v;
        }
        if let Some(v) = layer.requests_per_minute {
            self.requests_per_minute = Some(v);
        }
        if let Some(v) = layer.tokens_per_minute {
            self.tokens_per_minute = Some(v);
        }
        if let Some(v) = layer.tokens_per_day {
            self.tokens_per_day = Some(v);
        }
        if let Some(v) = layer.safety_margin {
            self.safety_margin = v;
        }
        self
    }

    /// Merge layers in increasing precedence over the defaults.
    pub fn resolve(layers: &[PartialRateLimitConfig]) -> Self {
        layers.iter().fold(Self::default(), Self::overlay)
    }
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

/// Retry behavior for provider calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_min_timeout")]
    pub min_timeout_ms: u64,
    #[serde(default = "default_max_timeout")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_true")]
    pub randomize: bool,
    #[serde(default = "default_true")]
    pub respect_retry_after: bool,
    #[serde(default = "default_max_retry_after")]
    pub max_retry_after_ms: u64,
}

fn default_retries() -> u32 {
    3
}
fn default_min_timeout() -> u64 {
    1000
}
fn default_max_timeout() -> u64 {
    30_000
}
fn default_factor() -> f64 {
    2.0
}
fn default_max_retry_after() -> u64 {
    120_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retries: default_retries(),
            min_timeout_ms: default_min_timeout(),
            max_timeout_ms: default_max_timeout(),
            factor: default_factor(),
            randomize: true,
            respect_retry_after: true,
            max_retry_after_ms: default_max_retry_after(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartialRetryConfig {
    pub enabled: Option<bool>,
    pub retries: Option<u32>,
    pub min_timeout_ms: Option<u64>,
    pub max_timeout_ms: Option<u64>,
    pub factor: Option<f64>,
    pub randomize: Option<bool>,
    pub respect_retry_after: Option<bool>,
    pub max_retry_after_ms: Option<u64>,
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            retries: 0,
            ..Default::default()
        }
    }

    pub fn overlay(mut self, layer: &PartialRetryConfig) -> Self {
        if let Some(v) = layer.enabled {
            self.enabled = v;
        }
        if let Some(v) = layer.retries {
            self.retries = v;
        }
        if let Some(v) = layer.min_timeout_ms {
            self.min_timeout_ms = v;
        }
        if let Some(v) = layer.max_timeout_ms {
            self.max_timeout_ms = v;
        }
        if let Some(v) = layer.factor {
            self.factor = v;
        }
        if let Some(v) = layer.randomize {
            self.randomize = v;
        }
        if let Some(v) = layer.respect_retry_after {
            self.respect_retry_after = v;
        }
        if let Some(v) = layer.max_retry_after_ms {
            self.max_retry_after_ms = v;
        }
        self
    }

    pub fn resolve(layers: &[PartialRetryConfig]) -> Self {
        layers.iter().fold(Self::default(), Self::overlay)
    }
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

/// History-rewrite strategy selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactionStrategyKind {
    SlidingWindow,
    Summarization,
    Hybrid,
}

/// Context compaction configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_strategy")]
    pub strategy: CompactionStrategyKind,
    /// Percentage of the context window that triggers a compaction.
    #[serde(default = "default_trigger")]
    pub trigger_threshold_percent: f64,
    /// Percentage of the context window to compact down to.
    #[serde(default = "default_target")]
    pub target_percent: f64,
    /// Trailing turns that always survive a compaction.
    #[serde(default = "default_preserve")]
    pub preserve_recent_turns: usize,
    #[serde(default)]
    pub summarization_prompt: Option<String>,
    #[serde(default)]
    pub summarization_model: Option<String>,
}

fn default_strategy() -> CompactionStrategyKind {
    CompactionStrategyKind::SlidingWindow
}
fn default_trigger() -> f64 {
    80.0
}
fn default_target() -> f64 {
    50.0
}
fn default_preserve() -> usize {
    2
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: default_strategy(),
            trigger_threshold_percent: default_trigger(),
            target_percent: default_target(),
            preserve_recent_turns: default_preserve(),
            summarization_prompt: None,
            summarization_model: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartialCompactionConfig {
    pub enabled: Option<bool>,
    pub strategy: Option<CompactionStrategyKind>,
    pub trigger_threshold_percent: Option<f64>,
    pub target_percent: Option<f64>,
    pub preserve_recent_turns: Option<usize>,
    pub summarization_prompt: Option<String>,
    pub summarization_model: Option<String>,
}

impl CompactionConfig {
    pub fn overlay(mut self, layer: &PartialCompactionConfig) -> Self {
        if let Some(v) = layer.enabled {
            self.enabled = v;
        }
        if let Some(v) = layer.strategy {
            self.strategy = v;
        }
        if let Some(v) = layer.trigger_threshold_percent {
            self.trigger_threshold_percent = v;
        }
        if let Some(v) = layer.target_percent {
            self.target_percent = v;
        }
        if let Some(v) = layer.preserve_recent_turns {
            self.preserve_recent_turns = v;
        }
        if let Some(ref v) = layer.summarization_prompt {
            self.summarization_prompt = Some(v.clone());
        }
        if let Some(ref v) = layer.summarization_model {
            self.summarization_model = Some(v.clone());
        }
        self
    }

    pub fn resolve(layers: &[PartialCompactionConfig]) -> Self {
        layers.iter().fold(Self::default(), Self::overlay)
    }
}
