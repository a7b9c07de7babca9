//! Client-side rolling-window rate limiter for outbound completion
//! requests.
//!
//! The window shrinks when the server throttles us and never grows back
//! on its own; recovery is an explicit `reset`. Waiters sleep until the
//! oldest stamp ages out, so admission order is fair under contention.

use crate::config::RateLimitConfig;
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Floor the adaptive rate never drops below.
const MIN_RATE: u32 = 10;
/// Multiplier applied after each server-side throttle event.
const SHRINK_FACTOR: f64 = 0.8;
/// Wait applied when a 429 carries no usable Retry-After.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

struct Window {
    rate: u32,
    stamps: VecDeque<Instant>,
}

pub struct RateController {
    configured_rate: u32,
    period: Duration,
    window: Mutex<Window>,
}

impl RateController {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            configured_rate: config.requests_per_period,
            period: config.period(),
            window: Mutex::new(Window {
                rate: config.requests_per_period,
                stamps: VecDeque::new(),
            }),
        }
    }

    /// Wait for a request slot under the current rate. The lock is never
    /// held across a sleep.
    pub async fn acquire(&self) {
        loop {
            let wait_until = {
                let mut window = self.window.lock().await;
                prune(&mut window.stamps, self.period);
                if (window.stamps.len() as u32) < window.rate {
                    window.stamps.push_back(Instant::now());
                    return;
                }
                match window.stamps.front() {
                    Some(oldest) => *oldest + self.period,
                    // Unreachable with a validated config (rate >= 1),
                    // but don't hang if it ever happens.
                    None => Instant::now(),
                }
            };
            tokio::time::sleep_until(wait_until).await;
        }
    }

    /// Handle a server-side 429: wait out the hint (or a 1 s default),
    /// then shrink the rate to `max(10, trunc(rate * 0.8))` and rebuild
    /// the window. The rate only recovers via [`reset`](Self::reset).
    pub async fn on_rate_limited(&self, retry_after: Option<Duration>) {
        let wait = retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
        tracing::warn!(
            wait_secs = wait.as_secs_f64(),
            "completion API throttled us, backing off"
        );
        tokio::time::sleep(wait).await;

        let mut window = self.window.lock().await;
        let previous = window.rate;
        window.rate = ((f64::from(window.rate) * SHRINK_FACTOR) as u32).max(MIN_RATE);
        window.stamps.clear();
        if window.rate != previous {
            tracing::info!(
                previous,
                current = window.rate,
                period_secs = self.period.as_secs(),
                "request rate reduced"
            );
        }
    }

    /// Restore the configured rate and clear the window.
    pub async fn reset(&self) {
        let mut window = self.window.lock().await;
        window.rate = self.configured_rate;
        window.stamps.clear();
        tracing::info!(rate = window.rate, "request rate reset");
    }

    pub async fn current_rate(&self) -> u32 {
        self.window.lock().await.rate
    }

    /// Free slots right now, for the status report.
    pub async fn available(&self) -> u32 {
        let mut window = self.window.lock().await;
        prune(&mut window.stamps, self.period);
        window.rate.saturating_sub(window.stamps.len() as u32)
    }

    pub fn configured_rate(&self) -> u32 {
        self.configured_rate
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

fn prune(stamps: &mut VecDeque<Instant>, period: Duration) {
    while stamps.front().is_some_and(|stamp| stamp.elapsed() >= period) {
        stamps.pop_front();
    }
}
