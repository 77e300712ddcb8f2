//! First-order IIR low-pass used to smooth accel/mag before the UKF.
use crate::math::sqrt;

/// out ← out + k·(in − out). The first sample passes straight through.
#[derive(Clone, Copy, Debug)]
pub struct LowPassFilter {
    factor: f32,
    last_output: f32,
    initialized: bool,
}

impl LowPassFilter {
    /// `factor` is clamped to [0, 1]; 1 disables smoothing.
    pub fn new(factor: f32) -> Self {
        Self {
            factor: factor.clamp(0.0, 1.0),
            last_output: 0.0,
            initialized: false,
        }
    }

    /// PT1 equivalent for a cutoff frequency at a given sample rate.
    pub fn from_cutoff(cutoff_hz: f32, sample_hz: f32) -> Self {
        let dt = 1.0 / sample_hz;
        let rc = 1.0 / (2.0 * core::f32::consts::PI * cutoff_hz);
        Self::new(dt / (rc + dt))
    }

    pub fn filter(&mut self, input: f32) -> f32 {
        if !self.initialized {
            self.last_output = input;
            self.initialized = true;
        } else {
            self.last_output += self.factor * (input - self.last_output);
        }
        self.last_output
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }

    pub fn value(&self) -> Option<f32> {
        self.initialized.then_some(self.last_output)
    }

    pub fn reset(&mut self) {
        self.initialized = false;
    }
}

/// Three independent channels sharing one factor.
#[derive(Clone, Copy, Debug)]
pub struct Vector3Lpf {
    axes: [LowPassFilter; 3],
}

impl Vector3Lpf {
    pub fn new(factor: f32) -> Self {
        Self {
            axes: [LowPassFilter::new(factor); 3],
        }
    }

    pub fn filter(&mut self, input: [f32; 3]) -> [f32; 3] {
        [
            self.axes[0].filter(input[0]),
            self.axes[1].filter(input[1]),
            self.axes[2].filter(input[2]),
        ]
    }

    pub fn reset(&mut self) {
        for axis in self.axes.iter_mut() {
            axis.reset();
        }
    }

    /// Vector magnitude of the last output, if any sample has been seen.
    pub fn magnitude(&self) -> Option<f32> {
        let mut sum_sq = 0.0f32;
        for axis in self.axes.iter() {
            let v = axis.value()?;
            sum_sq += v * v;
        }
        Some(sqrt(sum_sq))
    }
}
