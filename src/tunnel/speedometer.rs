use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::Traffic;

const WINDOW: Duration = Duration::from_secs(10);

/// Rolling send/receive speed derived from cumulative traffic samples.
///
/// The tunnel feeds this once per second; readers get bytes-per-second over
/// the retained window.
#[derive(Debug, Default)]
pub struct Speedometer {
    samples: Mutex<VecDeque<(Instant, Traffic)>>,
}

impl Speedometer {
    pub fn sample(&self, traffic: Traffic) {
        let mut samples = self.samples.lock().expect("speedometer poisoned");
        let now = Instant::now();
        samples.push_back((now, traffic));
        while let Some((t, _)) = samples.front() {
            if now.duration_since(*t) > WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the window; zero until two samples exist.
    pub fn speed(&self) -> Traffic {
        let samples = self.samples.lock().expect("speedometer poisoned");
        let (Some((t0, first)), Some((t1, last))) = (samples.front(), samples.back()) else {
            return Traffic::default();
        };
        let elapsed = t1.duration_since(*t0).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return Traffic::default();
        }
        Traffic {
            sent: ((last.sent.saturating_sub(first.sent)) as f64 / elapsed) as u64,
            received: ((last.received.saturating_sub(first.received)) as f64 / elapsed) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_needs_two_samples() {
        let s = Speedometer::default();
        assert_eq!(s.speed(), Traffic::default());
        s.sample(Traffic::new(100, 0));
        assert_eq!(s.speed(), Traffic::default());
    }

    #[tokio::test(start_paused = true)]
    async fn speed_reflects_delta_over_time() {
        let s = Speedometer::default();
        s.sample(Traffic::new(0, 0));
        tokio::time::advance(Duration::from_secs(2)).await;
        s.sample(Traffic::new(2000, 4000));

        let speed = s.speed();
        // Paused time advances exactly; real clocks may skew slightly.
        assert!(speed.sent >= 900 && speed.sent <= 1100, "{speed:?}");
        assert!(speed.received >= 1800 && speed.received <= 2200, "{speed:?}");
    }
}
