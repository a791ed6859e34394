/*
 * rate.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, a resource-fetching engine.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Sliding throughput window.

use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Bytes received within a window that halves once it grows past one second.
#[derive(Debug, Clone)]
pub struct RateWindow {
    start: Instant,
    bytes: u64,
}

impl RateWindow {
    pub fn new(now: Instant) -> Self {
        Self { start: now, bytes: 0 }
    }

    pub fn reset(&mut self, now: Instant) {
        self.start = now;
        self.bytes = 0;
    }

    pub fn record(&mut self, n: usize, now: Instant) {
        self.slide(now);
        self.bytes += n as u64;
    }

    fn slide(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.start);
        if elapsed > WINDOW {
            self.bytes /= 2;
            self.start = now - elapsed / 2;
        }
    }

    /// `1000 * bytes / window_ms`.
    pub fn bytes_per_sec(&mut self, now: Instant) -> u64 {
        self.slide(now);
        let ms = now.saturating_duration_since(self.start).as_millis().max(1) as u64;
        self.bytes.saturating_mul(1000) / ms
    }

    /// How long to wait for the rate to fall back to `cap`.
    pub fn delay_for(&mut self, cap: u64, now: Instant) -> Duration {
        let rate = self.bytes_per_sec(now);
        if cap == 0 || rate <= cap {
            return Duration::ZERO;
        }
        let ms = now.saturating_duration_since(self.start).as_millis().max(1) as u64;
        // Time until bytes / (ms + wait) == cap.
        let target_ms = self.bytes.saturating_mul(1000) / cap;
        Duration::from_millis(target_ms.saturating_sub(ms).clamp(1, 1000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_over_window() {
        let t0 = Instant::now();
        let mut w = RateWindow::new(t0);
        w.record(5000, t0 + Duration::from_millis(100));
        assert_eq!(w.bytes_per_sec(t0 + Duration::from_millis(500)), 10_000);
    }

    #[test]
    fn window_halves_after_a_second() {
        let t0 = Instant::now();
        let mut w = RateWindow::new(t0);
        w.record(10_000, t0);
        let r = w.bytes_per_sec(t0 + Duration::from_millis(2000));
        assert_eq!(r, 5000);
    }

    #[test]
    fn delay_when_over_cap() {
        let t0 = Instant::now();
        let mut w = RateWindow::new(t0);
        w.record(2000, t0);
        let d = w.delay_for(1000, t0 + Duration::from_millis(500));
        assert_eq!(d, Duration::from_millis(1000));
        assert_eq!(w.delay_for(0, t0 + Duration::from_millis(500)), Duration::ZERO);
    }
}
