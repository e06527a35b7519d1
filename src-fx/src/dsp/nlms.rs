// ============================================================================
// NLMS adaptive filter
// ============================================================================
//
// Normalized least-mean-squares echo estimator. The far-end reference is
// filtered by an adaptive FIR whose output is subtracted from the near-end
// signal; the residual drives the weight update.

const REGULARIZATION: f32 = 1e-6;

/// Single-channel NLMS canceller
pub struct Nlms {
    weights: Vec<f32>,
    /// Reference history stored twice so the newest `taps` samples are contiguous
    history: Vec<f32>,
    pos: usize,
    step: f32,
}

impl Nlms {
    /// # Arguments
    /// * `taps` - Length of the modelled echo path in samples (at least 1)
    /// * `step` - Adaptation step size in (0, 2)
    pub fn new(taps: usize, step: f32) -> Self {
        let taps = taps.max(1);
        Self {
            weights: vec![0.0; taps],
            history: vec![0.0; 2 * taps],
            pos: 0,
            step: step.clamp(1e-4, 1.99),
        }
    }

    pub fn taps(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Forget the adapted echo path and the reference history
    pub fn reset(&mut self) {
        self.weights.fill(0.0);
        self.history.fill(0.0);
        self.pos = 0;
    }

    /// Remove the echo of `far` from `near` in place
    pub fn process(&mut self, near: &mut [f32], far: &[f32]) {
        let taps = self.weights.len();
        for (d, &x) in near.iter_mut().zip(far) {
            self.pos = if self.pos == 0 { taps - 1 } else { self.pos - 1 };
            self.history[self.pos] = x;
            self.history[self.pos + taps] = x;

            let window = &self.history[self.pos..self.pos + taps];
            let (estimate, energy) = window
                .iter()
                .zip(&self.weights)
                .fold((0.0_f32, 0.0_f32), |(y, e), (&xv, &w)| (y + w * xv, e + xv * xv));

            let error = *d - estimate;
            let gain = self.step * error / (energy + REGULARIZATION);
            for (w, &xv) in self.weights.iter_mut().zip(window) {
                *w += gain * xv;
            }
            *d = error;
        }
    }
}
