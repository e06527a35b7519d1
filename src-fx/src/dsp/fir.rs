// ============================================================================
// Windowed-sinc FIR kernels
// ============================================================================
//
// Linear-phase lowpass, highpass and bandpass kernels with a Blackman
// window. All kernels have M + 1 taps with M even so the centre tap sits at
// index M/2.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Response shape of a FIR kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[default]
    Lowpass,
    Highpass,
    Bandpass,
}

/// Longest kernel the filter will build, about 1.4 s at 48 kHz
pub const MAX_KERNEL_ORDER: usize = 65536;

/// Filter order M for a transition band, rounded up to even
///
/// # Arguments
/// * `transition_hz` - Width of the transition band
/// * `rate` - Sample rate
pub fn kernel_order(transition_hz: f32, rate: u32) -> usize {
    // 4 / (transition / rate), kept exact for integer ratios
    let m = (4.0 * rate as f64 / transition_hz.max(1e-3) as f64)
        .max(8.0)
        .ceil() as usize;
    if m % 2 == 0 { m } else { m + 1 }
}

fn blackman(n: usize, m: usize) -> f64 {
    let x = n as f64 / m as f64;
    0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
}

fn windowed_sinc(cutoff_hz: f32, rate: u32, m: usize) -> Vec<f64> {
    let fc = (cutoff_hz as f64 / rate as f64).clamp(0.0, 0.5);
    let half = (m / 2) as f64;
    let mut h: Vec<f64> = (0..=m)
        .map(|n| {
            let x = n as f64 - half;
            let sinc = if x == 0.0 {
                2.0 * fc
            } else {
                (2.0 * PI * fc * x).sin() / (PI * x)
            };
            sinc * blackman(n, m)
        })
        .collect();

    let sum: f64 = h.iter().sum();
    if sum > 0.0 {
        for v in &mut h {
            *v /= sum;
        }
    }
    h
}

/// Negate every tap and add one at the centre
fn spectral_inversion(h: &mut [f64]) {
    for v in h.iter_mut() {
        *v = -*v;
    }
    let centre = (h.len() - 1) / 2;
    h[centre] += 1.0;
}

fn to_f32(h: Vec<f64>) -> Vec<f32> {
    h.into_iter().map(|v| v as f32).collect()
}

/// Lowpass kernel with unit DC gain
pub fn lowpass(cutoff_hz: f32, transition_hz: f32, rate: u32) -> Vec<f32> {
    to_f32(windowed_sinc(cutoff_hz, rate, kernel_order(transition_hz, rate)))
}

/// Highpass kernel, spectral inversion of the lowpass
pub fn highpass(cutoff_hz: f32, transition_hz: f32, rate: u32) -> Vec<f32> {
    let mut h = windowed_sinc(cutoff_hz, rate, kernel_order(transition_hz, rate));
    spectral_inversion(&mut h);
    to_f32(h)
}

/// Bandpass kernel passing `low_hz..high_hz`
///
/// Built as the spectral inversion of the band-reject sum
/// `lowpass(low_hz) + highpass(high_hz)`.
pub fn bandpass(low_hz: f32, high_hz: f32, transition_hz: f32, rate: u32) -> Vec<f32> {
    let m = kernel_order(transition_hz, rate);
    let low = windowed_sinc(low_hz, rate, m);
    let mut high = windowed_sinc(high_hz, rate, m);
    spectral_inversion(&mut high);

    let mut reject: Vec<f64> = low.iter().zip(&high).map(|(a, b)| a + b).collect();
    spectral_inversion(&mut reject);
    to_f32(reject)
}

/// Kernel for a filter mode
///
/// `low_hz` is the cutoff of a lowpass or highpass; bandpass uses both edges.
pub fn design(mode: FilterMode, low_hz: f32, high_hz: f32, transition_hz: f32, rate: u32) -> Vec<f32> {
    match mode {
        FilterMode::Lowpass => lowpass(low_hz, transition_hz, rate),
        FilterMode::Highpass => highpass(low_hz, transition_hz, rate),
        FilterMode::Bandpass => bandpass(low_hz, high_hz, transition_hz, rate),
    }
}
