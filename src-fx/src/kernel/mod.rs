// ============================================================================
// Convolution kernels
// ============================================================================
//
// A kernel is a stereo impulse response: two direct paths (left→left and
// right→right) and, for true-stereo kernels, two cross paths (left→right and
// right→left). Kernels are replaced wholesale; nothing mutates a kernel that
// an engine is already using.

use crate::error::KernelError;
use rayon::prelude::*;
use std::path::PathBuf;

pub mod manager;
pub mod resample;
pub mod spatial;
pub mod spectrum;
pub mod wav;

pub use manager::KernelManager;
pub use spatial::{SpatialDataset, SpatialSelection, SpatialSource};
pub use spectrum::KernelSpectrum;

/// Peaks at or below this are treated as silence by [`Kernel::normalize`]
pub const NORMALIZE_THRESHOLD: f32 = 1e-6;

/// Which measurement of a spatial dataset produced a kernel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialMetadata {
    pub azimuth: f32,
    pub elevation: f32,
    pub radius: f32,
    /// Unknown for SOFA files, where libmysofa picks the measurement
    pub measurement_index: Option<usize>,
}

/// Summary published when a kernel is loaded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelInfo {
    pub rate: u32,
    pub samples: usize,
    pub duration: f32,
    pub channels: u16,
}

/// Impulse response with per-path channel buffers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Kernel {
    pub name: String,
    pub path: Option<PathBuf>,
    pub rate: u32,
    /// Rate of the source file before any resampling
    pub original_rate: u32,
    /// left → left
    pub left: Vec<f32>,
    /// right → right
    pub right: Vec<f32>,
    /// left → right, empty unless true-stereo
    pub left_to_right: Vec<f32>,
    /// right → left, empty unless true-stereo
    pub right_to_left: Vec<f32>,
    pub spatial: Option<SpatialMetadata>,
}

impl Kernel {
    pub fn stereo(name: impl Into<String>, rate: u32, left: Vec<f32>, right: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            rate,
            original_rate: rate,
            left,
            right,
            ..Default::default()
        }
    }

    pub fn true_stereo(
        name: impl Into<String>,
        rate: u32,
        left: Vec<f32>,
        left_to_right: Vec<f32>,
        right_to_left: Vec<f32>,
        right: Vec<f32>,
    ) -> Self {
        Self {
            left_to_right,
            right_to_left,
            ..Self::stereo(name, rate, left, right)
        }
    }

    /// Build from de-interleaved file channels
    ///
    /// 1 channel is duplicated to both ears, 2 channels are left/right and
    /// 4 channels are L→L, L→R, R→L, R→R.
    pub fn from_channels(
        name: impl Into<String>,
        rate: u32,
        mut channels: Vec<Vec<f32>>,
    ) -> Result<Self, KernelError> {
        match channels.len() {
            1 => {
                let mono = channels.remove(0);
                Ok(Self::stereo(name, rate, mono.clone(), mono))
            }
            2 => {
                let right = channels.remove(1);
                let left = channels.remove(0);
                Ok(Self::stereo(name, rate, left, right))
            }
            4 => {
                let right = channels.remove(3);
                let right_to_left = channels.remove(2);
                let left_to_right = channels.remove(1);
                let left = channels.remove(0);
                Ok(Self::true_stereo(
                    name,
                    rate,
                    left,
                    left_to_right,
                    right_to_left,
                    right,
                ))
            }
            n => Err(KernelError::UnsupportedChannels(n as u16)),
        }
    }

    pub fn is_true_stereo(&self) -> bool {
        !self.left_to_right.is_empty() || !self.right_to_left.is_empty()
    }

    pub fn channel_count(&self) -> u16 {
        if self.is_true_stereo() { 4 } else { 2 }
    }

    /// Samples per channel
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    /// Channels in file order
    pub fn channels(&self) -> Vec<&[f32]> {
        if self.is_true_stereo() {
            vec![
                self.left.as_slice(),
                self.left_to_right.as_slice(),
                self.right_to_left.as_slice(),
                self.right.as_slice(),
            ]
        } else {
            vec![self.left.as_slice(), self.right.as_slice()]
        }
    }

    pub fn channels_mut(&mut self) -> Vec<&mut Vec<f32>> {
        if self.is_true_stereo() {
            vec![
                &mut self.left,
                &mut self.left_to_right,
                &mut self.right_to_left,
                &mut self.right,
            ]
        } else {
            vec![&mut self.left, &mut self.right]
        }
    }

    /// Check rate, lengths and sample values
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.rate == 0 {
            return Err(KernelError::Invalid("sample rate is zero".to_string()));
        }
        if self.left.is_empty() || self.right.is_empty() {
            return Err(KernelError::Invalid("empty channel".to_string()));
        }
        let len = self.left.len();
        let expected = if self.is_true_stereo() { 4 } else { 2 };
        let channels = self.channels();
        debug_assert_eq!(channels.len(), expected);
        for (i, ch) in channels.iter().enumerate() {
            if ch.len() != len {
                return Err(KernelError::Invalid(format!(
                    "channel {} has {} samples, expected {}",
                    i,
                    ch.len(),
                    len
                )));
            }
            if let Some(pos) = ch.iter().position(|s| !s.is_finite()) {
                return Err(KernelError::Invalid(format!(
                    "channel {} has a non-finite sample at {}",
                    i, pos
                )));
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Duration in seconds, measured from the first to the last sample
    pub fn duration(&self) -> f32 {
        if self.rate == 0 || self.left.is_empty() {
            0.0
        } else {
            (self.left.len() - 1) as f32 / self.rate as f32
        }
    }

    pub fn info(&self) -> KernelInfo {
        KernelInfo {
            rate: self.rate,
            samples: self.len(),
            duration: self.duration(),
            channels: self.channel_count(),
        }
    }

    /// Peak absolute sample across all channels
    pub fn peak(&self) -> f32 {
        self.channels()
            .iter()
            .flat_map(|ch| ch.iter())
            .fold(0.0_f32, |acc, s| acc.max(s.abs()))
    }

    /// Scale every channel so the peak becomes 1.0
    ///
    /// Kernels whose peak is at or below [`NORMALIZE_THRESHOLD`] are left
    /// untouched. Returns true when the kernel was scaled.
    pub fn normalize(&mut self) -> bool {
        let peak = self.peak();
        if peak <= NORMALIZE_THRESHOLD {
            return false;
        }
        for ch in self.channels_mut() {
            for s in ch.iter_mut() {
                *s /= peak;
            }
        }
        true
    }

    /// Stereo width synthesis
    ///
    /// `width_percent` is in [0, 200]; 100 leaves the kernel unchanged.
    /// With `w = width/100` and `x = (1 - w)/(1 + w)`:
    /// `L' = L + x·R`, `R' = R + x·L`. True-stereo kernels apply the same
    /// mix to their cross pair.
    pub fn apply_width(&mut self, width_percent: f32) {
        let w = width_percent.clamp(0.0, 200.0) * 0.01;
        let x = (1.0 - w) / (1.0 + w);
        if x == 0.0 {
            return;
        }
        mix_pair(&mut self.left, &mut self.right, x);
        if self.is_true_stereo() {
            mix_pair(&mut self.left_to_right, &mut self.right_to_left, x);
        }
    }
}

fn mix_pair(a: &mut [f32], b: &mut [f32], x: f32) {
    for (l, r) in a.iter_mut().zip(b.iter_mut()) {
        let (l0, r0) = (*l, *r);
        *l = l0 + x * r0;
        *r = r0 + x * l0;
    }
}

/// Full linear convolution, `a.len() + b.len() - 1` samples
///
/// Direct time-domain form, only used off the realtime path.
pub fn direct_convolution(a: &[f32], b: &[f32]) -> Vec<f32> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let len = a.len() + b.len() - 1;
    let mut out = vec![0.0_f32; len];
    out.par_iter_mut().enumerate().for_each(|(n, y)| {
        let k_min = n.saturating_sub(b.len() - 1);
        let k_max = n.min(a.len() - 1);
        let mut acc = 0.0_f64;
        for k in k_min..=k_max {
            acc += a[k] as f64 * b[n - k] as f64;
        }
        *y = acc as f32;
    });
    out
}

/// Sum of convolutions, skipping terms with an empty operand
fn convolve_sum(terms: &[(&[f32], &[f32])]) -> Vec<f32> {
    let mut out: Vec<f32> = Vec::new();
    for (a, b) in terms {
        let y = direct_convolution(a, b);
        if y.is_empty() {
            continue;
        }
        if out.len() < y.len() {
            out.resize(y.len(), 0.0);
        }
        for (o, v) in out.iter_mut().zip(&y) {
            *o += v;
        }
    }
    out
}

/// Cascade `first` then `second` into one kernel
///
/// Both kernels must already share a rate. Stereo kernels combine path by
/// path; when either is true-stereo the path matrices are composed.
pub fn combine(first: &Kernel, second: &Kernel, name: &str) -> Result<Kernel, KernelError> {
    first.validate()?;
    second.validate()?;
    if first.rate != second.rate {
        return Err(KernelError::Invalid(format!(
            "rates differ: {} vs {}",
            first.rate, second.rate
        )));
    }

    let (a, b) = (first, second);
    let left = convolve_sum(&[
        (b.left.as_slice(), a.left.as_slice()),
        (b.right_to_left.as_slice(), a.left_to_right.as_slice()),
    ]);
    let right = convolve_sum(&[
        (b.right.as_slice(), a.right.as_slice()),
        (b.left_to_right.as_slice(), a.right_to_left.as_slice()),
    ]);

    let mut combined = if a.is_true_stereo() || b.is_true_stereo() {
        let left_to_right = convolve_sum(&[
            (b.left_to_right.as_slice(), a.left.as_slice()),
            (b.right.as_slice(), a.left_to_right.as_slice()),
        ]);
        let right_to_left = convolve_sum(&[
            (b.left.as_slice(), a.right_to_left.as_slice()),
            (b.right_to_left.as_slice(), a.right.as_slice()),
        ]);
        let len = left.len();
        let pad = |mut v: Vec<f32>| {
            v.resize(len, 0.0);
            v
        };
        Kernel::true_stereo(
            name,
            a.rate,
            left,
            pad(left_to_right),
            pad(right_to_left),
            right,
        )
    } else {
        Kernel::stereo(name, a.rate, left, right)
    };
    combined.original_rate = a.rate;
    combined.validate()?;
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_kernel() -> Kernel {
        Kernel::stereo("k", 48000, vec![0.5, -2.0, 0.25], vec![1.0, 0.0, -0.5])
    }

    #[test]
    fn test_from_channels_layouts() {
        let mono = Kernel::from_channels("m", 44100, vec![vec![1.0, 2.0]]).unwrap();
        assert_eq!(mono.left, mono.right);
        assert!(!mono.is_true_stereo());

        let ts = Kernel::from_channels(
            "t",
            44100,
            vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]],
        )
        .unwrap();
        assert_eq!(ts.left, vec![1.0]);
        assert_eq!(ts.left_to_right, vec![2.0]);
        assert_eq!(ts.right_to_left, vec![3.0]);
        assert_eq!(ts.right, vec![4.0]);
        assert_eq!(ts.channel_count(), 4);

        assert!(matches!(
            Kernel::from_channels("x", 44100, vec![vec![1.0]; 3]),
            Err(KernelError::UnsupportedChannels(3))
        ));
    }

    #[test]
    fn test_validation() {
        assert!(sample_kernel().is_valid());
        assert!(!Kernel::default().is_valid());

        let mut k = sample_kernel();
        k.right.pop();
        assert!(!k.is_valid());

        let mut k = sample_kernel();
        k.left[1] = f32::NAN;
        assert!(!k.is_valid());

        let mut k = sample_kernel();
        k.rate = 0;
        assert!(!k.is_valid());

        let mut k = sample_kernel();
        k.left_to_right = vec![0.0; 3];
        k.right_to_left = vec![f32::INFINITY, 0.0, 0.0];
        assert!(!k.is_valid());
    }

    #[test]
    fn test_normalize_peak_and_idempotence() {
        let mut k = sample_kernel();
        assert!(k.normalize());
        assert_eq!(k.peak(), 1.0);
        let once = k.clone();
        k.normalize();
        assert_eq!(k, once);
    }

    #[test]
    fn test_normalize_skips_silence() {
        let mut k = Kernel::stereo("s", 48000, vec![1e-7; 4], vec![0.0; 4]);
        assert!(!k.normalize());
        assert_eq!(k.left, vec![1e-7; 4]);
    }

    #[test]
    fn test_width_identity_and_zero() {
        let mut k = sample_kernel();
        let orig = k.clone();
        k.apply_width(100.0);
        assert_eq!(k, orig);

        k.apply_width(0.0);
        for i in 0..orig.len() {
            let sum = orig.left[i] + orig.right[i];
            assert_eq!(k.left[i], sum);
            assert_eq!(k.right[i], sum);
        }
    }

    #[test]
    fn test_duration() {
        let k = Kernel::stereo("d", 48000, vec![0.0; 48001], vec![0.0; 48001]);
        assert!((k.duration() - 1.0).abs() < 1e-6);
        assert_eq!(Kernel::default().duration(), 0.0);
    }

    #[test]
    fn test_direct_convolution_full_length() {
        let y = direct_convolution(&[1.0, 2.0, 3.0], &[1.0, 1.0]);
        assert_eq!(y, vec![1.0, 3.0, 5.0, 3.0]);
        assert!(direct_convolution(&[], &[1.0]).is_empty());
    }

    #[test]
    fn test_combine_stereo_pairwise() {
        let a = Kernel::stereo("a", 48000, vec![1.0, 1.0], vec![2.0, 0.0]);
        let b = Kernel::stereo("b", 48000, vec![1.0, -1.0], vec![0.5, 0.5]);
        let c = combine(&a, &b, "ab").unwrap();
        assert_eq!(c.left, vec![1.0, 0.0, -1.0]);
        assert_eq!(c.right, vec![1.0, 1.0, 0.0]);
        assert!(!c.is_true_stereo());
    }

    #[test]
    fn test_combine_true_stereo_composes_paths() {
        // a: pure swap of channels, b: identity
        let a = Kernel::true_stereo("a", 48000, vec![0.0], vec![1.0], vec![1.0], vec![0.0]);
        let b = Kernel::stereo("b", 48000, vec![1.0], vec![1.0]);
        let c = combine(&a, &b, "ab").unwrap();
        assert!(c.is_true_stereo());
        assert_eq!(c.left, vec![0.0]);
        assert_eq!(c.left_to_right, vec![1.0]);
        assert_eq!(c.right_to_left, vec![1.0]);
        assert_eq!(c.right, vec![0.0]);
    }

    #[test]
    fn test_combine_rejects_rate_mismatch() {
        let a = sample_kernel();
        let mut b = sample_kernel();
        b.rate = 44100;
        assert!(combine(&a, &b, "x").is_err());
    }
}
