//! Phi accrual failure detector
//!
//! Keeps a bounded window of heartbeat inter-arrival times and turns the time
//! since the last heartbeat into a suspicion level using a logistic
//! approximation of the normal CDF.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct PhiAccrualFailureDetector {
    window_size: usize,
    min_samples: usize,
    min_std_deviation_millis: f64,
    intervals: VecDeque<f64>,
    sum: f64,
    sum_squares: f64,
    last_updated: Instant,
}

impl PhiAccrualFailureDetector {
    /// Create a detector whose clock starts now
    pub fn new(window_size: usize, min_samples: usize, min_std_deviation: Duration) -> Self {
        Self::starting_at(window_size, min_samples, min_std_deviation, Instant::now())
    }

    pub fn starting_at(
        window_size: usize,
        min_samples: usize,
        min_std_deviation: Duration,
        start: Instant,
    ) -> Self {
        Self {
            window_size: window_size.max(1),
            min_samples,
            min_std_deviation_millis: min_std_deviation.as_secs_f64() * 1000.0,
            intervals: VecDeque::with_capacity(window_size.min(1024)),
            sum: 0.0,
            sum_squares: 0.0,
            last_updated: start,
        }
    }

    /// Record a heartbeat arriving now
    pub fn report(&mut self) {
        self.report_at(Instant::now());
    }

    pub fn report_at(&mut self, arrival: Instant) {
        let interval = arrival.saturating_duration_since(self.last_updated).as_secs_f64() * 1000.0;

        while self.intervals.len() >= self.window_size {
            if let Some(oldest) = self.intervals.pop_front() {
                self.sum -= oldest;
                self.sum_squares -= oldest * oldest;
            }
        }
        self.intervals.push_back(interval);
        self.sum += interval;
        self.sum_squares += interval * interval;
        self.last_updated = arrival;
    }

    /// Time of the last heartbeat, or of creation if none arrived yet
    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    pub fn samples(&self) -> usize {
        self.intervals.len()
    }

    /// Average inter-arrival time over the window
    pub fn mean_interval(&self) -> Option<Duration> {
        if self.intervals.is_empty() {
            return None;
        }
        Some(Duration::from_secs_f64(self.mean() / 1000.0))
    }

    fn mean(&self) -> f64 {
        self.sum / self.intervals.len() as f64
    }

    fn std_deviation(&self) -> f64 {
        let mean = self.mean();
        (self.sum_squares / self.intervals.len() as f64 - mean * mean)
            .max(0.0)
            .sqrt()
    }

    /// Suspicion level now
    pub fn phi(&self) -> f64 {
        self.phi_at(Instant::now())
    }

    /// Suspicion level at `now`; zero until enough samples were collected
    pub fn phi_at(&self, now: Instant) -> f64 {
        if self.intervals.is_empty() || self.intervals.len() < self.min_samples {
            return 0.0;
        }

        let elapsed = now.saturating_duration_since(self.last_updated).as_secs_f64() * 1000.0;
        let mean = self.mean();
        let std_deviation = self.std_deviation().max(self.min_std_deviation_millis);

        let y = (elapsed - mean) / std_deviation;
        let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
        if elapsed > mean {
            -(e / (1.0 + e)).log10()
        } else {
            -(1.0 - 1.0 / (1.0 + e)).log10()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(start: Instant) -> PhiAccrualFailureDetector {
        PhiAccrualFailureDetector::starting_at(1024, 10, Duration::from_millis(50), start)
    }

    fn feed(detector: &mut PhiAccrualFailureDetector, start: Instant, count: u64) -> Instant {
        let mut at = start;
        for _ in 0..count {
            at += Duration::from_secs(1);
            detector.report_at(at);
        }
        at
    }

    #[test]
    fn test_zero_until_min_samples() {
        let start = Instant::now();
        let mut detector = detector(start);
        let last = feed(&mut detector, start, 9);

        assert_eq!(detector.samples(), 9);
        assert_eq!(detector.phi_at(last + Duration::from_secs(60)), 0.0);
    }

    #[test]
    fn test_phi_grows_with_silence() {
        let start = Instant::now();
        let mut detector = detector(start);
        let last = feed(&mut detector, start, 20);

        let on_time = detector.phi_at(last + Duration::from_secs(1));
        let late = detector.phi_at(last + Duration::from_millis(1200));
        let very_late = detector.phi_at(last + Duration::from_secs(3));

        assert!(on_time < 1.0, "phi on schedule was {}", on_time);
        assert!(late > on_time);
        assert!(very_late > 10.0, "phi after 3s was {}", very_late);
    }

    #[test]
    fn test_window_is_bounded() {
        let start = Instant::now();
        let mut detector = PhiAccrualFailureDetector::starting_at(
            5,
            1,
            Duration::from_millis(50),
            start,
        );
        let last = feed(&mut detector, start, 50);

        assert_eq!(detector.samples(), 5);
        assert_eq!(detector.last_updated(), last);
        assert_eq!(detector.mean_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_irregular_heartbeats_are_tolerated() {
        let start = Instant::now();
        let mut regular = detector(start);
        let mut irregular = detector(start);

        let last_regular = feed(&mut regular, start, 20);
        let mut at = start;
        for i in 0..20u64 {
            at += Duration::from_millis(500 + (i % 2) * 1000);
            irregular.report_at(at);
        }

        let silence = Duration::from_millis(2500);
        assert!(irregular.phi_at(at + silence) < regular.phi_at(last_regular + silence));
    }
}
