//! Client-side request pacing for the web session.
//!
//! Enforces both a minimum gap between requests and a per-minute cap, so the
//! session looks like a person rather than a bot.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct PacerState {
    last_request: Option<Instant>,
    recent_requests: VecDeque<Instant>,
}

/// Request pacer shared by every concurrent scraper call.
///
/// Waiters queue on the inner lock, so they leave one at a time.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    max_per_minute: usize,
    state: Mutex<PacerState>,
}

impl Pacer {
    /// Create a new pacer. A non-positive rate disables the per-second gap.
    pub fn new(max_per_second: f64, max_per_minute: u32) -> Self {
        let min_interval = if max_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / max_per_second)
        } else {
            Duration::ZERO
        };

        Self {
            min_interval,
            max_per_minute: max_per_minute.max(1) as usize,
            state: Mutex::new(PacerState {
                last_request: None,
                recent_requests: VecDeque::with_capacity(max_per_minute as usize),
            }),
        }
    }

    /// Wait until a request may be sent, then record it.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        while state
            .recent_requests
            .front()
            .is_some_and(|&t| now.duration_since(t) >= MINUTE)
        {
            state.recent_requests.pop_front();
        }

        if state.recent_requests.len() >= self.max_per_minute {
            if let Some(&oldest) = state.recent_requests.front() {
                let wait_time = MINUTE.saturating_sub(now.duration_since(oldest));
                tracing::debug!(
                    wait_ms = wait_time.as_millis(),
                    "Pacing: waiting for per-minute limit"
                );
                sleep(wait_time).await;
                state.recent_requests.pop_front();
            }
        }

        if let Some(last) = state.last_request {
            let elapsed = Instant::now().duration_since(last);
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                tracing::debug!(
                    wait_ms = wait_time.as_millis(),
                    "Pacing: waiting for per-second limit"
                );
                sleep(wait_time).await;
            }
        }

        let request_time = Instant::now();
        state.last_request = Some(request_time);
        state.recent_requests.push_back(request_time);
    }

    /// Requests recorded in the last minute.
    pub async fn current_minute_count(&self) -> usize {
        let state = self.state.lock().await;
        let now = Instant::now();
        state
            .recent_requests
            .iter()
            .filter(|&&t| now.duration_since(t) < MINUTE)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pacer_per_second() {
        let pacer = Pacer::new(2.0, 50);
        let start = Instant::now();

        for _ in 0..3 {
            pacer.acquire().await;
        }

        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_per_minute() {
        let pacer = Pacer::new(100.0, 3);
        let start = Instant::now();

        for _ in 0..3 {
            pacer.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        pacer.acquire().await;
        assert!(start.elapsed() >= MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_minute_count() {
        let pacer = Pacer::new(100.0, 50);
        assert_eq!(pacer.current_minute_count().await, 0);
        pacer.acquire().await;
        pacer.acquire().await;
        assert_eq!(pacer.current_minute_count().await, 2);

        tokio::time::advance(MINUTE).await;
        assert_eq!(pacer.current_minute_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_rate_disables_gap() {
        let pacer = Pacer::new(0.0, 50);
        let start = Instant::now();
        for _ in 0..5 {
            pacer.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
