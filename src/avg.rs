use std::time::Duration;

/// A running average accumulator with warm-up bias correction.
///
/// Early samples are given progressively smaller gains until the inverted
/// gain is reached, so the first few samples don't dominate the mean. The
/// accumulator works in 1/64 fixed point to avoid both float conversions
/// and integer truncation bias.
///
/// Ported from libtorrent: https://blog.libtorrent.org/2014/09/running-averages/
#[derive(Debug)]
pub struct SlidingAvg {
    /// The current mean, in 1/64 fixed point.
    mean: i64,
    /// The average deviation, in 1/64 fixed point.
    deviation: i64,
    /// The number of samples received, saturating at `inverted_gain`.
    sample_count: usize,
    /// How many initial samples get a higher gain than the steady state.
    inverted_gain: usize,
}

impl SlidingAvg {
    pub fn new(inverted_gain: usize) -> Self {
        SlidingAvg {
            mean: 0,
            deviation: 0,
            sample_count: 0,
            inverted_gain,
        }
    }

    pub fn update(&mut self, sample: i64) {
        let sample = sample * 64;

        let deviation = if self.sample_count > 0 {
            (self.mean - sample).abs()
        } else {
            0
        };

        if self.sample_count < self.inverted_gain {
            self.sample_count += 1;
        }

        self.mean += (sample - self.mean) / self.sample_count as i64;

        if self.sample_count > 1 {
            self.deviation +=
                (deviation - self.deviation) / (self.sample_count - 1) as i64;
        }
    }

    pub fn mean(&self) -> i64 {
        if self.sample_count == 0 {
            0
        } else {
            (self.mean + 32) / 64
        }
    }

    pub fn deviation(&self) -> i64 {
        if self.sample_count == 0 {
            0
        } else {
            (self.deviation + 32) / 64
        }
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }
}

impl Default for SlidingAvg {
    /// Creates a sliding average with an inverted gain of 20.
    fn default() -> Self {
        Self::new(20)
    }
}

/// A [`SlidingAvg`] over [`Duration`] samples, kept internally in
/// milliseconds. Used for request round-trip times.
#[derive(Debug, Default)]
pub struct SlidingDurationAvg(SlidingAvg);

impl SlidingDurationAvg {
    pub fn new(inverted_gain: usize) -> Self {
        SlidingDurationAvg(SlidingAvg::new(inverted_gain))
    }

    pub fn update(&mut self, sample: Duration) {
        let ms = sample.as_millis().min(i64::MAX as u128) as i64;
        self.0.update(ms);
    }

    pub fn mean(&self) -> Duration {
        Duration::from_millis(self.0.mean() as u64)
    }

    pub fn deviation(&self) -> Duration {
        Duration::from_millis(self.0.deviation() as u64)
    }

    pub fn sample_count(&self) -> usize {
        self.0.sample_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_is_the_mean() {
        let mut a = SlidingAvg::new(4);
        a.update(10);
        assert_eq!(a.mean(), 10);
        assert_eq!(a.sample_count(), 1);
    }

    #[test]
    fn test_gain_decreases_until_inverted_gain() {
        let mut a = SlidingAvg::new(4);
        for (sample, expected_mean) in
            [(10, 10), (15, 13), (20, 15), (19, 16), (20, 17)]
        {
            a.update(sample);
            assert_eq!(a.mean(), expected_mean);
        }
        // the sample count saturates at the inverted gain
        assert_eq!(a.sample_count(), 4);

        // a large outlier only moves the mean by (sample - mean) / 4
        a.update(117);
        assert_eq!(a.mean(), 42);
    }

    #[test]
    fn test_duration_units_round_trip() {
        let mut a = SlidingDurationAvg::default();
        let sample = Duration::from_secs(10);
        a.update(sample);
        assert_eq!(a.mean(), sample);
    }
}
