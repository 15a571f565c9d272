/*!
 * Exponential Moving Average
 * Smooths noisy samples so a single spike cannot trigger an action
 */

use serde::{Deserialize, Serialize};

/// EMA with a warm-up period
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ema {
    alpha: f64,
    window: u32,
    value: Option<f64>,
    samples: u32,
}

impl Ema {
    /// Smoothing factor `2 / (window + 1)`
    pub fn from_window(window: u32) -> Self {
        let window = window.max(1);
        Self {
            alpha: 2.0 / (f64::from(window) + 1.0),
            window,
            value: None,
            samples: 0,
        }
    }

    /// Fold a sample in and return the new average. Non-finite samples are ignored.
    pub fn update(&mut self, sample: f64) -> Option<f64> {
        if !sample.is_finite() {
            return self.value;
        }
        let next = match self.value {
            Some(prev) => prev + self.alpha * (sample - prev),
            None => sample,
        };
        self.value = Some(next);
        self.samples = self.samples.saturating_add(1);
        self.value
    }

    #[inline]
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// True once a full window of samples has been observed
    #[inline]
    pub fn is_warm(&self) -> bool {
        self.samples >= self.window
    }

    /// The average, but only once warm
    #[inline]
    pub fn settled(&self) -> Option<f64> {
        if self.is_warm() {
            self.value
        } else {
            None
        }
    }

    #[inline]
    pub fn samples(&self) -> u32 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpha_from_window() {
        let mut ema = Ema::from_window(3);
        ema.update(0.0);
        // alpha = 0.5
        assert_eq!(ema.update(10.0), Some(5.0));
    }

    #[test]
    fn test_single_spike_is_damped() {
        let mut ema = Ema::from_window(5);
        for _ in 0..5 {
            ema.update(40.0);
        }
        // alpha = 1/3: one spike moves the average a third of the way
        let after_spike = ema.update(100.0).unwrap();
        assert!((after_spike - 60.0).abs() < 1e-9, "spike leaked through: {}", after_spike);
        assert!(after_spike < 70.0);
    }

    #[test]
    fn test_warm_up() {
        let mut ema = Ema::from_window(3);
        ema.update(1.0);
        ema.update(1.0);
        assert!(ema.settled().is_none());
        ema.update(1.0);
        assert_eq!(ema.settled(), Some(1.0));
    }

    #[test]
    fn test_ignores_nan() {
        let mut ema = Ema::from_window(3);
        ema.update(10.0);
        assert_eq!(ema.update(f64::NAN), Some(10.0));
        assert_eq!(ema.samples(), 1);
    }
}
