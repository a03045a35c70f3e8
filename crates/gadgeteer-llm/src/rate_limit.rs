//! Proactive rate limiting: sliding-window RPM/TPM/TPD tracking with
//! reservation semantics.
//!
//! The limiter never errors; it only produces delays. A caller waits out
//! `required_delay`, then claims a slot with `reserve_request` *before* the
//! outbound call, so N concurrent sub-agents sharing one limiter cannot all
//! observe zero usage and pile through together. `acquire` does both steps
//! under one lock.

use chrono::{NaiveDate, Utc};
use gadgeteer_core::RateLimitConfig;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);

/// Which configured limit is currently forcing a delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitKind {
    RequestsPerMinute,
    TokensPerMinute,
    TokensPerDay,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestsPerMinute => write!(f, "rpm"),
            Self::TokensPerMinute => write!(f, "tpm"),
            Self::TokensPerDay => write!(f, "tpd"),
        }
    }
}

/// Point-in-time snapshot of limiter state.
#[derive(Clone, Debug)]
pub struct RateLimitStats {
    pub requests_last_minute: usize,
    pub tokens_last_minute: u64,
    pub tokens_today: u64,
    pub pending_reservations: u32,
    pub triggering: Vec<LimitKind>,
}

struct WindowState {
    request_timestamps: VecDeque<Instant>,
    token_usage: VecDeque<(Instant, u64)>,
    daily_tokens: u64,
    day: NaiveDate,
    pending_reservations: u32,
}

impl WindowState {
    fn prune(&mut self, now: Instant) {
        while self
            .request_timestamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            self.request_timestamps.pop_front();
        }
        while self
            .token_usage
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) >= WINDOW)
        {
            self.token_usage.pop_front();
        }
    }

    fn roll_day(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.day {
            self.day = today;
            self.daily_tokens = 0;
        }
    }

    fn window_tokens(&self) -> u64 {
        self.token_usage.iter().map(|(_, n)| n).sum()
    }
}

/// Sliding-window rate limiter, shared by an agent and all its sub-agents.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(WindowState {
                request_timestamps: VecDeque::new(),
                token_usage: VecDeque::new(),
                daily_tokens: 0,
                day: Utc::now().date_naive(),
                pending_reservations: 0,
            }),
        }
    }

    /// Unlimited limiter (every delay is zero).
    pub fn unlimited() -> Self {
        Self::new(RateLimitConfig {
            enabled: false,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn effective(&self, limit: u64) -> f64 {
        limit as f64 * self.config.safety_margin
    }

    /// Smallest wait after which every enabled window admits one more call.
    pub fn required_delay(&self) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.required_delay_locked(&mut state, Instant::now())
    }

    fn required_delay_locked(&self, state: &mut WindowState, now: Instant) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }
        state.prune(now);
        state.roll_day();

        let mut delay = Duration::ZERO;

        if let Some(rpm) = self.config.requests_per_minute {
            let effective = self.effective(rpm as u64);
            let count = state.request_timestamps.len();
            if (count as f64) >= effective {
                // Expire the oldest k entries so the remainder drops below
                // the effective limit; wait until the k-th oldest ages out.
                let k = (count as f64 - effective).floor() as usize + 1;
                if let Some(ts) = state.request_timestamps.get(k - 1) {
                    let age = now.duration_since(*ts);
                    delay = delay.max(WINDOW.saturating_sub(age));
                }
            }
        }

        if let Some(tpm) = self.config.tokens_per_minute {
            let effective = self.effective(tpm);
            let total = state.window_tokens();
            if (total as f64) >= effective {
                let mut freed = 0u64;
                for (ts, tokens) in state.token_usage.iter() {
                    freed += tokens;
                    if ((total - freed) as f64) < effective {
                        let age = now.duration_since(*ts);
                        delay = delay.max(WINDOW.saturating_sub(age));
                        break;
                    }
                }
            }
        }

        if let Some(tpd) = self.config.tokens_per_day {
            let effective = self.effective(tpd);
            if (state.daily_tokens as f64) >= effective {
                delay = delay.max(until_utc_midnight());
            }
        }

        delay
    }

    /// Claim a slot. Call after waiting out `required_delay` and before the
    /// outbound request.
    pub fn reserve_request(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.request_timestamps.push_back(Instant::now());
        state.pending_reservations += 1;
    }

    /// Record actual token usage once the call completes. Consumes an
    /// outstanding reservation when one exists; otherwise counts the request
    /// here (callers that never reserve still get tracked).
    pub fn record_usage(&self, input_tokens: u64, output_tokens: u64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        state.roll_day();

        if state.pending_reservations > 0 {
            state.pending_reservations -= 1;
        } else {
            state.request_timestamps.push_back(now);
        }

        let tokens = input_tokens + output_tokens;
        state.token_usage.push_back((now, tokens));
        state.daily_tokens += tokens;
    }

    /// Wait out the current delay and reserve a slot. The check and the
    /// reservation happen under one lock, so concurrent callers serialize.
    pub async fn acquire(&self) {
        loop {
            let delay = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let delay = self.required_delay_locked(&mut state, Instant::now());
                if delay.is_zero() {
                    state.request_timestamps.push_back(Instant::now());
                    state.pending_reservations += 1;
                    return;
                }
                delay
            };
            debug!(delay_ms = delay.as_millis() as u64, "rate limit delay");
            tokio::time::sleep(delay).await;
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        state.prune(now);
        state.roll_day();

        let mut triggering = Vec::new();
        if let Some(rpm) = self.config.requests_per_minute {
            if state.request_timestamps.len() as f64 >= self.effective(rpm as u64) {
                triggering.push(LimitKind::RequestsPerMinute);
            }
        }
        if let Some(tpm) = self.config.tokens_per_minute {
            if state.window_tokens() as f64 >= self.effective(tpm) {
                triggering.push(LimitKind::TokensPerMinute);
            }
        }
        if let Some(tpd) = self.config.tokens_per_day {
            if state.daily_tokens as f64 >= self.effective(tpd) {
                triggering.push(LimitKind::TokensPerDay);
            }
        }

        RateLimitStats {
            requests_last_minute: state.request_timestamps.len(),
            tokens_last_minute: state.window_tokens(),
            tokens_today: state.daily_tokens,
            pending_reservations: state.pending_reservations,
            triggering,
        }
    }
}

/// Time left until the next UTC midnight.
fn until_utc_midnight() -> Duration {
    let now = Utc::now();
    let tomorrow = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc());
    match tomorrow {
        Some(midnight) => (midnight - now).to_std().unwrap_or(Duration::ZERO),
        None => Duration::ZERO,
    }
}
