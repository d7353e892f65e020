//! Per-client admission algorithms.
//!
//! All three keep one entry per client identity in a `DashMap`, so clients
//! only contend with themselves. Entries are created on first sight and
//! never expire; the proxy has no client eviction.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::security::rate_limit::AdmissionControl;

#[derive(Debug)]
struct WindowCounter {
    count: u32,
    window_end: Instant,
}

/// Fixed window: at most `limit` requests per client per window. The
/// window starts at the client's first request after the previous one
/// ended.
#[derive(Debug)]
pub struct FixedWindow {
    limit: u32,
    window: Duration,
    clients: DashMap<String, WindowCounter>,
}

impl FixedWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            clients: DashMap::new(),
        }
    }
}

impl AdmissionControl for FixedWindow {
    fn allow(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .clients
            .entry(client.to_string())
            .or_insert_with(|| WindowCounter {
                count: 0,
                window_end: now + self.window,
            });

        if now > entry.window_end {
            entry.count = 0;
            entry.window_end = now + self.window;
        }

        if entry.count >= self.limit {
            return false;
        }
        entry.count += 1;
        true
    }

    fn algorithm(&self) -> &'static str {
        "fixed_window"
    }
}

/// Sliding window log: at most `limit` admitted requests per client within
/// any trailing `window`.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: u32,
    window: Duration,
    clients: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            clients: DashMap::new(),
        }
    }
}

impl AdmissionControl for SlidingWindow {
    fn allow(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut log = self.clients.entry(client.to_string()).or_default();

        // Timestamps exactly at the window start still count.
        while log
            .front()
            .is_some_and(|&ts| now.saturating_duration_since(ts) > self.window)
        {
            log.pop_front();
        }

        if log.len() >= self.limit as usize {
            return false;
        }
        log.push_back(now);
        true
    }

    fn algorithm(&self) -> &'static str {
        "sliding_window"
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: starts full at `capacity`, refills continuously at
/// `tokens_per_window / window`, one token per request.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    clients: DashMap<String, Bucket>,
}

impl TokenBucket {
    pub fn new(capacity: u32, tokens_per_window: u32, window: Duration) -> Self {
        let secs = window.as_secs_f64();
        let refill_per_sec = if secs > 0.0 {
            f64::from(tokens_per_window) / secs
        } else {
            0.0
        };
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            clients: DashMap::new(),
        }
    }
}

impl AdmissionControl for TokenBucket {
    fn allow(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut bucket = self.clients.entry(client.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }

    fn algorithm(&self) -> &'static str {
        "token_bucket"
    }
}
