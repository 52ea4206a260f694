use std::collections::VecDeque;
use std::time::Instant;

use serde::Deserialize;

/// Capacity of the inter-share interval window.
const WINDOW_CAPACITY: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct VarDiffOptions {
    /// Desired average seconds between shares.
    #[serde(default = "default_target_time")]
    pub target_time: f64,
    /// Seconds between retargets.
    #[serde(default = "default_retarget_time")]
    pub retarget_time: f64,
    /// Allowed deviation from target_time before retargeting, in percent.
    #[serde(default = "default_variance_percent")]
    pub variance_percent: f64,
    pub min_diff: f64,
    /// When absent, max(min_diff, network difficulty) is used.
    #[serde(default)]
    pub max_diff: Option<f64>,
}

fn default_target_time() -> f64 {
    15.0
}

fn default_retarget_time() -> f64 {
    90.0
}

fn default_variance_percent() -> f64 {
    30.0
}

impl Default for VarDiffOptions {
    fn default() -> Self {
        Self {
            target_time: default_target_time(),
            retarget_time: default_retarget_time(),
            variance_percent: default_variance_percent(),
            min_diff: 0.01,
            max_diff: None,
        }
    }
}

/// Per-connection retargeting state: a sliding window of inter-share
/// intervals plus the timestamps of the last share and the last retarget.
#[derive(Debug, Default)]
pub struct VarDiffContext {
    last_ts: Option<Instant>,
    last_retarget_ts: Option<Instant>,
    window: VecDeque<f64>,
}

impl VarDiffContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the context one observation and maybe compute a new difficulty.
    ///
    /// Called with `is_submission = true` on every share and periodically with
    /// `false` so idle miners drift back down. Returns `Some(new_difficulty)`
    /// only when a retarget actually changes the value; the caller queues it
    /// and applies it at the next job notify.
    pub fn update(
        &mut self,
        now: Instant,
        current_difficulty: f64,
        options: &VarDiffOptions,
        network_difficulty: f64,
        is_submission: bool,
    ) -> Option<f64> {
        let (last_ts, last_retarget_ts) = match (self.last_ts, self.last_retarget_ts) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                self.last_ts = Some(now);
                self.last_retarget_ts = Some(now);
                self.window.clear();
                return None;
            }
        };

        let since_last = now.saturating_duration_since(last_ts).as_secs_f64();
        let sum: f64 = self.window.iter().sum();
        let avg = (sum + since_last) / (self.window.len() as f64 + 1.0);

        if is_submission {
            if self.window.len() == WINDOW_CAPACITY {
                self.window.pop_front();
            }
            self.window.push_back(since_last);
            self.last_ts = Some(now);
        }

        let t_min = options.target_time * (1.0 - options.variance_percent / 100.0);
        let t_max = options.target_time * (1.0 + options.variance_percent / 100.0);

        let since_retarget = now.saturating_duration_since(last_retarget_ts).as_secs_f64();
        if since_retarget < options.retarget_time || (t_min <= avg && avg <= t_max) {
            return None;
        }

        let max_diff = options
            .max_diff
            .unwrap_or_else(|| options.min_diff.max(network_difficulty));
        let new_diff = (current_difficulty * options.target_time / avg)
            .clamp(options.min_diff, max_diff.max(options.min_diff));

        if new_diff == current_difficulty {
            return None;
        }

        self.last_retarget_ts = Some(now);
        self.window.clear();
        Some(new_diff)
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn opts() -> VarDiffOptions {
        VarDiffOptions {
            target_time: 15.0,
            retarget_time: 90.0,
            variance_percent: 30.0,
            min_diff: 0.01,
            max_diff: None,
        }
    }

    #[test]
    fn first_call_never_retargets() {
        let mut ctx = VarDiffContext::new();
        let now = Instant::now();
        assert_eq!(ctx.update(now, 16.0, &opts(), 1e6, true), None);
    }

    #[test]
    fn no_retarget_within_retarget_time() {
        let mut ctx = VarDiffContext::new();
        let start = Instant::now();
        ctx.update(start, 16.0, &opts(), 1e6, true);
        // Ten fast shares, but the retarget window has not elapsed.
        for i in 1..=10u64 {
            let out = ctx.update(start + Duration::from_secs(i), 16.0, &opts(), 1e6, true);
            assert_eq!(out, None);
        }
    }

    #[test]
    fn fast_shares_triple_difficulty() {
        // Buffer of 10 intervals averaging 5s against a 15s target.
        let mut ctx = VarDiffContext::new();
        let start = Instant::now();
        ctx.update(start, 100.0, &opts(), 1e6, true);
        let mut t = start;
        for _ in 0..17 {
            t += Duration::from_secs(5);
            assert_eq!(ctx.update(t, 100.0, &opts(), 1e6, true), None);
        }
        // 90s elapsed since the last retarget; one more share at the same pace.
        t += Duration::from_secs(5);
        let out = ctx.update(t, 100.0, &opts(), 1e6, true);
        let new_diff = out.expect("retarget expected");
        assert!((new_diff - 300.0).abs() < 1e-6, "got {new_diff}");
        // Window cleared on retarget.
        assert_eq!(ctx.window_len(), 0);
    }

    #[test]
    fn slow_shares_lower_difficulty_and_clamp_to_min() {
        let o = VarDiffOptions {
            min_diff: 8.0,
            ..opts()
        };
        let mut ctx = VarDiffContext::new();
        let start = Instant::now();
        ctx.update(start, 16.0, &o, 1e6, true);
        let out = ctx.update(start + Duration::from_secs(600), 16.0, &o, 1e6, true);
        // 16 * 15/600 = 0.4, clamped to min 8.
        assert_eq!(out, Some(8.0));
    }

    #[test]
    fn max_diff_defaults_to_network_difficulty() {
        let mut ctx = VarDiffContext::new();
        let start = Instant::now();
        ctx.update(start, 100.0, &opts(), 150.0, true);
        let mut t = start;
        for _ in 0..17 {
            t += Duration::from_secs(5);
            ctx.update(t, 100.0, &opts(), 150.0, true);
        }
        t += Duration::from_secs(5);
        let out = ctx.update(t, 100.0, &opts(), 150.0, true);
        // 3x retarget would be 300, clamped at the network difficulty.
        assert_eq!(out, Some(150.0));
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let mut ctx = VarDiffContext::new();
        let start = Instant::now();
        let mut t = start;
        // In-band pace (15s) so no retarget clears the window.
        for _ in 0..50 {
            ctx.update(t, 16.0, &opts(), 1e6, true);
            assert!(ctx.window_len() <= WINDOW_CAPACITY);
            t += Duration::from_secs(15);
        }
    }

    #[test]
    fn idle_check_does_not_grow_window() {
        let mut ctx = VarDiffContext::new();
        let start = Instant::now();
        ctx.update(start, 16.0, &opts(), 1e6, true);
        ctx.update(start + Duration::from_secs(30), 16.0, &opts(), 1e6, false);
        assert_eq!(ctx.window_len(), 0);
    }
}
