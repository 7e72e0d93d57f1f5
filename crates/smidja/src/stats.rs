//! Training throughput tracking.

use std::time::{Duration, Instant};

/// Times one optimizer step and reports token throughput.
///
/// All timing uses `Instant` (monotonic, fast); no allocations after
/// construction.
#[derive(Debug)]
pub struct StepTimer {
    start: Instant,
}

impl StepTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Tokens per second for a step that consumed `tokens` tokens.
    pub fn tokens_per_sec(&self, tokens: usize) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            tokens as f64 / secs
        } else {
            0.0
        }
    }
}

/// Running totals across a whole training run.
#[derive(Debug, Default)]
pub struct RunStats {
    pub steps: usize,
    pub tokens: usize,
    total_time: Duration,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_step(&mut self, tokens: usize, elapsed: Duration) {
        self.steps += 1;
        self.tokens += tokens;
        self.total_time += elapsed;
    }

    pub fn average_tokens_per_sec(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs > 0.0 {
            self.tokens as f64 / secs
        } else {
            0.0
        }
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} steps, {} tokens @ {:.1} tok/s",
            self.steps,
            self.tokens,
            self.average_tokens_per_sec()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_step_timer_throughput() {
        let timer = StepTimer::start();
        sleep(Duration::from_millis(50));
        let tps = timer.tokens_per_sec(1000);
        // Roughly 20k t/s (1000 tokens / 0.05s)
        assert!(tps > 2_000.0 && tps < 40_000.0, "tps was {}", tps);
        assert!(timer.elapsed_ms() >= 50.0);
    }

    #[test]
    fn test_run_stats_accumulate() {
        let mut stats = RunStats::new();
        stats.record_step(100, Duration::from_millis(10));
        stats.record_step(100, Duration::from_millis(10));

        assert_eq!(stats.steps, 2);
        assert_eq!(stats.tokens, 200);
        let tps = stats.average_tokens_per_sec();
        assert!(tps > 5_000.0 && tps < 20_000.0, "tps was {}", tps);
        assert!(stats.summary_line().contains("2 steps"));
    }
}
