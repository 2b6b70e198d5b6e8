//! Request spacing for the Discogs API.
//!
//! Discogs allows 60 authenticated requests per minute. The limiter keeps at
//! least `interval` between requests and doubles it (up to a cap) whenever
//! the server answers 429, settling back after a run of successes.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

pub struct RateLimiter {
    name: &'static str,
    last_request: Option<Instant>,
    interval: Duration,
    base_interval: Duration,
    max_interval: Duration,
    successes: u32,
}

/// Consecutive successes needed before the interval is halved again.
const SUCCESSES_TO_RELAX: u32 = 10;

impl RateLimiter {
    pub fn new(name: &'static str, base_interval: Duration) -> Self {
        RateLimiter {
            name,
            last_request: None,
            interval: base_interval,
            base_interval,
            max_interval: base_interval * 16,
            successes: 0,
        }
    }

    /// Discogs limits: 60 req/min with OAuth, 25 req/min anonymous.
    pub fn discogs(authenticated: bool) -> Self {
        let millis = if authenticated { 1000 } else { 2500 };
        Self::new("Discogs", Duration::from_millis(millis))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until the next request may be sent. Call before every request.
    pub fn wait(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.interval {
                let pause = self.interval - elapsed;
                debug!("[{}] waiting {:.1}s before next request", self.name, pause.as_secs_f64());
                thread::sleep(pause);
            }
        }
        self.last_request = Some(Instant::now());
    }

    pub fn success(&mut self) {
        self.successes += 1;
        if self.successes >= SUCCESSES_TO_RELAX && self.interval > self.base_interval {
            self.interval = (self.interval / 2).max(self.base_interval);
            self.successes = 0;
            debug!("[{}] interval relaxed to {:.1}s", self.name, self.interval.as_secs_f64());
        }
    }

    /// The server asked us to slow down.
    pub fn throttled(&mut self) {
        self.interval = (self.interval * 2).min(self.max_interval);
        self.successes = 0;
        warn!("[{}] rate limited, interval now {:.1}s", self.name, self.interval.as_secs_f64());
    }
}
