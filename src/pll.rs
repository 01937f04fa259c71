//! Software PLL for producer sample-rate drift.
//!
//! The producer's callback cadence drifts against the wall clock. The PLL
//! measures the delivered sample rate over a window and outputs a bounded
//! correction in ppm; the sender turns that into occasional whole-sample
//! adjustments of the RTP timestamp advance.

use crate::error::PllError;

/// Proportional gain
const KP: f64 = 0.1;
/// Integral gain
const KI: f64 = 0.01;
/// Anti-windup clamp for the integral term
const INTEGRAL_LIMIT: f64 = 100.0;
/// Output clamp in ppm
const CORRECTION_LIMIT_PPM: f64 = 50.0;

/// PI controller over windowed rate measurements
#[derive(Debug, Clone)]
pub struct SoftwarePll {
    /// Nominal sample rate in Hz
    target_rate: f64,
    /// Measurement window in seconds
    window_s: f64,
    /// Rate measured over the last complete window
    measured_rate: f64,
    /// Proportional error from the last window (ppm)
    error_ppm: f64,
    /// Integral term (ppm * s), clamped
    integral: f64,
    window_start_ns: u64,
    window_samples: u64,
    last_timestamp_ns: u64,
    total_samples: u64,
    primed: bool,
}

impl SoftwarePll {
    /// Create a PLL tracking `target_rate` Hz over windows of `window_s` seconds
    pub fn new(target_rate: f64, window_s: f64) -> Result<Self, PllError> {
        if !(target_rate.is_finite() && target_rate > 0.0) {
            return Err(PllError::InvalidTargetRate);
        }
        if !(window_s.is_finite() && window_s > 0.0) {
            return Err(PllError::InvalidWindow);
        }

        Ok(Self {
            target_rate,
            window_s,
            measured_rate: target_rate,
            error_ppm: 0.0,
            integral: 0.0,
            window_start_ns: 0,
            window_samples: 0,
            last_timestamp_ns: 0,
            total_samples: 0,
            primed: false,
        })
    }

    /// Record that `samples` were produced at monotonic time `timestamp_ns`.
    ///
    /// The first call only opens the window. Each time the window reaches its
    /// configured duration the rate, error and integral are recomputed and a
    /// new window starts. Zero-sample updates are ignored.
    pub fn update(&mut self, timestamp_ns: u64, samples: usize) {
        if samples == 0 {
            return;
        }
        let samples = samples as u64;

        if !self.primed {
            self.window_start_ns = timestamp_ns;
            self.last_timestamp_ns = timestamp_ns;
            // Samples delivered at the opening instant belong before the window
            self.window_samples = 0;
            self.total_samples = samples;
            self.primed = true;
            return;
        }

        self.window_samples += samples;
        self.total_samples += samples;

        let window_dt_s = timestamp_ns.saturating_sub(self.window_start_ns) as f64 * 1e-9;
        if window_dt_s >= self.window_s && window_dt_s > 0.0 {
            let measured = self.window_samples as f64 / window_dt_s;
            let error_ppm = (measured - self.target_rate) / self.target_rate * 1e6;

            self.error_ppm = error_ppm;
            self.integral =
                (self.integral + error_ppm * window_dt_s).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);
            self.measured_rate = measured;

            self.window_start_ns = timestamp_ns;
            self.window_samples = 0;
        }

        self.last_timestamp_ns = timestamp_ns;
    }

    /// Correction in ppm, sign-inverted so a fast producer slows the timestamp advance
    pub fn correction_ppm(&self) -> f64 {
        if !self.primed {
            return 0.0;
        }
        let output = KP * self.error_ppm + KI * self.integral;
        -output.clamp(-CORRECTION_LIMIT_PPM, CORRECTION_LIMIT_PPM)
    }

    /// Forget all measurements. The next update primes a new window.
    pub fn reset(&mut self) {
        self.error_ppm = 0.0;
        self.integral = 0.0;
        self.window_samples = 0;
        self.total_samples = 0;
        self.measured_rate = self.target_rate;
        self.primed = false;
    }

    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    pub fn measured_rate(&self) -> f64 {
        self.measured_rate
    }

    pub fn error_ppm(&self) -> f64 {
        self.error_ppm
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Total samples observed since the last reset
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }
}

/// Turns a ppm correction into whole-sample timestamp adjustments.
///
/// Fractional corrections accumulate across packets; once the running sum
/// reaches one sample in either direction the rounded whole part is released.
/// Corrections of 1 ppm or less are treated as noise and ignored.
#[derive(Debug, Clone, Default)]
pub struct CorrectionAccumulator {
    accumulated: f64,
}

impl CorrectionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one packet's worth of correction, returning whole samples to apply now
    pub fn accumulate(&mut self, samples_per_packet: usize, correction_ppm: f64) -> i32 {
        if correction_ppm.abs() <= 1.0 {
            return 0;
        }

        self.accumulated += samples_per_packet as f64 * correction_ppm * 1e-6;
        if self.accumulated.abs() < 1.0 {
            return 0;
        }

        let whole = self.accumulated.round();
        self.accumulated -= whole;
        whole as i32
    }

    /// Fraction still pending
    pub fn pending(&self) -> f64 {
        self.accumulated
    }

    pub fn reset(&mut self) {
        self.accumulated = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed packets of `spp` samples produced at `actual_rate` for `seconds`
    fn drive(pll: &mut SoftwarePll, spp: usize, actual_rate: f64, seconds: f64) -> Vec<f64> {
        let packets = (seconds * actual_rate / spp as f64) as usize;
        let mut corrections = Vec::with_capacity(packets);
        for i in 0..packets {
            let t_ns = (i as f64 * spp as f64 / actual_rate * 1e9) as u64;
            pll.update(t_ns, spp);
            corrections.push(pll.correction_ppm());
        }
        corrections
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert_eq!(SoftwarePll::new(0.0, 1.0).unwrap_err(), PllError::InvalidTargetRate);
        assert_eq!(SoftwarePll::new(48000.0, 0.0).unwrap_err(), PllError::InvalidWindow);
        assert_eq!(SoftwarePll::new(48000.0, f64::NAN).unwrap_err(), PllError::InvalidWindow);
    }

    #[test]
    fn test_first_update_only_primes() {
        let mut pll = SoftwarePll::new(48000.0, 1.0).unwrap();
        assert!(!pll.is_primed());
        assert_eq!(pll.correction_ppm(), 0.0);

        pll.update(1_000, 48);
        assert!(pll.is_primed());
        assert_eq!(pll.correction_ppm(), 0.0);
        assert_eq!(pll.measured_rate(), 48000.0);

        // Zero-sample updates are ignored
        pll.update(2_000, 0);
        assert_eq!(pll.total_samples(), 48);
    }

    #[test]
    fn test_on_rate_producer_needs_no_correction() {
        let mut pll = SoftwarePll::new(48000.0, 0.5).unwrap();
        drive(&mut pll, 48, 48000.0, 3.0);
        assert!(pll.error_ppm().abs() < 5.0, "error {}", pll.error_ppm());
        assert!(pll.correction_ppm().abs() < 1.0);
    }

    #[test]
    fn test_fast_producer_gets_negative_correction() {
        // +500 ppm bias
        let mut pll = SoftwarePll::new(48000.0, 1.0).unwrap();
        let corrections = drive(&mut pll, 48, 48000.0 * 1.0005, 5.0);

        assert!(pll.error_ppm() > 400.0, "error {}", pll.error_ppm());
        let last = *corrections.last().unwrap();
        assert!(last < 0.0);
        assert!(last >= -CORRECTION_LIMIT_PPM);
        assert!(pll.integral() <= INTEGRAL_LIMIT);
    }

    #[test]
    fn test_slow_producer_gets_positive_correction() {
        let mut pll = SoftwarePll::new(48000.0, 1.0).unwrap();
        drive(&mut pll, 48, 48000.0 * 0.9995, 5.0);
        assert!(pll.correction_ppm() > 0.0);
        assert!(pll.integral() >= -INTEGRAL_LIMIT);
    }

    #[test]
    fn test_integral_never_exceeds_clamp() {
        let mut pll = SoftwarePll::new(48000.0, 0.25).unwrap();
        // Extreme bias over many windows
        let mut t_ns = 0u64;
        for _ in 0..20_000 {
            pll.update(t_ns, 480);
            t_ns += 5_000_000;
            assert!(pll.integral().abs() <= INTEGRAL_LIMIT);
            assert!(pll.correction_ppm().abs() <= CORRECTION_LIMIT_PPM);
        }
        assert_eq!(pll.integral(), INTEGRAL_LIMIT);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut pll = SoftwarePll::new(48000.0, 1.0).unwrap();
        drive(&mut pll, 48, 48000.0 * 1.0005, 3.0);
        pll.reset();
        assert!(!pll.is_primed());
        assert_eq!(pll.integral(), 0.0);
        assert_eq!(pll.correction_ppm(), 0.0);
        assert_eq!(pll.measured_rate(), 48000.0);
    }

    #[test]
    fn test_accumulator_ignores_small_corrections() {
        let mut acc = CorrectionAccumulator::new();
        for _ in 0..1_000_000 {
            assert_eq!(acc.accumulate(48, 0.9), 0);
        }
        assert_eq!(acc.pending(), 0.0);
    }

    #[test]
    fn test_accumulator_releases_whole_samples() {
        let mut acc = CorrectionAccumulator::new();
        // -50 ppm at 48 samples per packet: 0.0024 samples per packet
        let mut applied = 0i32;
        let mut packets = 0;
        while applied == 0 {
            applied = acc.accumulate(48, -50.0);
            packets += 1;
        }
        assert_eq!(applied, -1);
        assert!((416..=418).contains(&packets), "took {} packets", packets);
        assert!(acc.pending().abs() < 1.0);
    }
}
