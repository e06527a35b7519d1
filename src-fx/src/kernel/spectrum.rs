// ============================================================================
// Kernel magnitude spectrum
// ============================================================================
//
// Display data for a loaded kernel: power spectrum of each direct channel
// on a linear and a logarithmic frequency axis, normalized to [0, 1].

use super::Kernel;
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

/// Spectrum of one kernel on `points` frequencies
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelSpectrum {
    pub linear_freqs: Vec<f64>,
    pub linear_left: Vec<f64>,
    pub linear_right: Vec<f64>,
    pub log_freqs: Vec<f64>,
    pub log_left: Vec<f64>,
    pub log_right: Vec<f64>,
}

fn hann(signal: &mut [f64]) {
    let n = signal.len();
    if n < 2 {
        return;
    }
    let denom = (n - 1) as f64;
    for (i, s) in signal.iter_mut().enumerate() {
        let w = 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / denom).cos());
        *s *= w;
    }
}

/// Power spectrum bins `0..=n/2`, scaled by 1/bins²
fn power_spectrum(channel: &[f32]) -> Vec<f64> {
    if channel.len() < 2 {
        return Vec::new();
    }
    let mut windowed: Vec<f64> = channel.iter().map(|&s| s as f64).collect();
    hann(&mut windowed);

    let mut buf: Vec<Complex<f64>> = windowed.iter().map(|&s| Complex::new(s, 0.0)).collect();
    let fft = FftPlanner::<f64>::new().plan_fft_forward(buf.len());
    fft.process(&mut buf);

    let bins = buf.len() / 2 + 1;
    let scale = (bins * bins) as f64;
    buf[..bins].iter().map(|c| c.norm_sqr() / scale).collect()
}

fn linspace(start: f64, end: f64, points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (points - 1) as f64;
            (0..points).map(|i| start + step * i as f64).collect()
        }
    }
}

fn logspace(start: f64, end: f64, points: usize) -> Vec<f64> {
    linspace(start.log10(), end.log10(), points)
        .into_iter()
        .map(|e| 10f64.powf(e))
        .collect()
}

/// Linear interpolation of (xs, ys) at `at`, clamped to the end values
fn interpolate(xs: &[f64], ys: &[f64], at: &[f64]) -> Vec<f64> {
    at.iter()
        .map(|&x| {
            let idx = xs.partition_point(|&v| v < x);
            if idx == 0 {
                ys[0]
            } else if idx >= xs.len() {
                ys[ys.len() - 1]
            } else {
                let (x0, x1) = (xs[idx - 1], xs[idx]);
                let (y0, y1) = (ys[idx - 1], ys[idx]);
                if x1 == x0 {
                    y0
                } else {
                    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
                }
            }
        })
        .collect()
}

fn min_max_normalize(values: &mut [f64]) {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max > min {
        for v in values.iter_mut() {
            *v = (*v - min) / (max - min);
        }
    }
}

impl KernelSpectrum {
    /// Compute the spectrum of the direct channels
    ///
    /// Returns `None` for kernels too short to analyse or with unequal
    /// channel lengths.
    pub fn compute(kernel: &Kernel, points: usize) -> Option<Self> {
        if points == 0 || kernel.rate == 0 || kernel.left.len() != kernel.right.len() {
            return None;
        }
        let mut left = power_spectrum(&kernel.left);
        let mut right = power_spectrum(&kernel.right);
        // DC bin dropped as well, the log axis cannot start at 0 Hz
        if left.len() < 3 {
            return None;
        }
        left.remove(0);
        right.remove(0);

        let bins = left.len() + 1;
        let freqs: Vec<f64> = (1..bins)
            .map(|n| 0.5 * kernel.rate as f64 * n as f64 / bins as f64)
            .collect();
        let (f_min, f_max) = (freqs[0], freqs[freqs.len() - 1]);

        let linear_freqs = linspace(f_min, f_max, points);
        let log_freqs = logspace(f_min, f_max, points);

        let mut spectrum = Self {
            linear_left: interpolate(&freqs, &left, &linear_freqs),
            linear_right: interpolate(&freqs, &right, &linear_freqs),
            log_left: interpolate(&freqs, &left, &log_freqs),
            log_right: interpolate(&freqs, &right, &log_freqs),
            linear_freqs,
            log_freqs,
        };
        for values in [
            &mut spectrum.linear_left,
            &mut spectrum.linear_right,
            &mut spectrum.log_left,
            &mut spectrum.log_right,
        ] {
            min_max_normalize(values);
        }
        log::debug!(
            "kernel '{}' spectrum: {} bins, {:.1} Hz to {:.1} Hz",
            kernel.name,
            bins,
            f_min,
            f_max
        );
        Some(spectrum)
    }

    /// Frequency with the highest value on the linear axis, left channel
    pub fn peak_frequency(&self) -> Option<f64> {
        self.linear_left
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| self.linear_freqs[i])
    }
}
