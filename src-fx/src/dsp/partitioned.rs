// ============================================================================
// Partitioned Convolution Engine
// ============================================================================
//
// Uniformly partitioned overlap-save convolution. The impulse response of
// each path is cut into partitions of B samples, each transformed once with
// an FFT of size 2B. Every block the input spectrum is pushed into a
// frequency-domain delay line and multiplied against all partitions.
//
// Everything is sized at construction; `process` does not allocate.

use crate::error::EngineError;
use crate::kernel::Kernel;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Number of input and output channels
pub const CHANNELS: usize = 2;

/// One convolution path from an input channel to an output channel
pub struct PathSpec<'a> {
    pub input: usize,
    pub output: usize,
    pub impulse: &'a [f32],
}

struct Path {
    input: usize,
    output: usize,
    partitions: Vec<Vec<Complex<f32>>>,
}

struct DelayLine {
    /// Previous and current input block, 2B samples
    window: Vec<f32>,
    spectra: Vec<Vec<Complex<f32>>>,
    head: usize,
}

/// Stereo partitioned convolution engine
pub struct PartitionedConvolver {
    blocksize: usize,
    fft_size: usize,
    n_partitions: usize,
    impulse_len: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex<f32>>,
    lines: Vec<DelayLine>,
    paths: Vec<Path>,
    accum: Vec<Complex<f32>>,
}

impl PartitionedConvolver {
    /// Build an engine for a stereo (2 paths) or true-stereo (4 paths) kernel
    pub fn from_kernel(kernel: &Kernel, blocksize: usize) -> Result<Self, EngineError> {
        let mut paths = vec![
            PathSpec {
                input: 0,
                output: 0,
                impulse: &kernel.left,
            },
            PathSpec {
                input: 1,
                output: 1,
                impulse: &kernel.right,
            },
        ];
        if kernel.is_true_stereo() {
            paths.push(PathSpec {
                input: 0,
                output: 1,
                impulse: &kernel.left_to_right,
            });
            paths.push(PathSpec {
                input: 1,
                output: 0,
                impulse: &kernel.right_to_left,
            });
        }
        Self::new(&paths, blocksize)
    }

    /// Build an engine from explicit paths
    ///
    /// # Arguments
    /// * `paths` - Input/output channel pairs (0 = left, 1 = right) with their impulse responses
    /// * `blocksize` - Samples per `process` call
    pub fn new(paths: &[PathSpec<'_>], blocksize: usize) -> Result<Self, EngineError> {
        if blocksize == 0 {
            return Err(EngineError::InvalidBlockSize);
        }
        let impulse_len = paths.iter().map(|p| p.impulse.len()).max().unwrap_or(0);
        if impulse_len == 0 {
            return Err(EngineError::EmptyKernel);
        }
        if let Some(p) = paths
            .iter()
            .find(|p| p.input >= CHANNELS || p.output >= CHANNELS)
        {
            return Err(EngineError::InvalidChannel(p.input.max(p.output)));
        }

        let fft_size = 2 * blocksize;
        let n_partitions = impulse_len.div_ceil(blocksize);

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let ifft = planner.plan_fft_inverse(fft_size);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());
        let mut scratch = vec![Complex::default(); scratch_len];

        let paths = paths
            .iter()
            .map(|spec| {
                let partitions = (0..n_partitions)
                    .map(|p| {
                        let mut buf = vec![Complex::default(); fft_size];
                        let start = (p * blocksize).min(spec.impulse.len());
                        let end = ((p + 1) * blocksize).min(spec.impulse.len());
                        for (dst, &src) in buf.iter_mut().zip(&spec.impulse[start..end]) {
                            dst.re = src;
                        }
                        fft.process_with_scratch(&mut buf, &mut scratch);
                        buf
                    })
                    .collect();
                Path {
                    input: spec.input,
                    output: spec.output,
                    partitions,
                }
            })
            .collect();

        let lines = (0..CHANNELS)
            .map(|_| DelayLine {
                window: vec![0.0; fft_size],
                spectra: vec![vec![Complex::default(); fft_size]; n_partitions],
                head: 0,
            })
            .collect();

        Ok(Self {
            blocksize,
            fft_size,
            n_partitions,
            impulse_len,
            fft,
            ifft,
            scratch,
            lines,
            paths,
            accum: vec![Complex::default(); fft_size],
        })
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn partitions(&self) -> usize {
        self.n_partitions
    }

    pub fn impulse_len(&self) -> usize {
        self.impulse_len
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// Clear the input history
    pub fn reset(&mut self) {
        for line in &mut self.lines {
            line.window.fill(0.0);
            for spectrum in &mut line.spectra {
                spectrum.fill(Complex::default());
            }
            line.head = 0;
        }
    }

    /// Convolve one block in place
    ///
    /// Both buffers must hold exactly `blocksize` samples.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) -> Result<(), EngineError> {
        let b = self.blocksize;
        for len in [left.len(), right.len()] {
            if len != b {
                return Err(EngineError::SizeMismatch {
                    expected: b,
                    got: len,
                });
            }
        }

        // push the new block into each delay line
        for (ch, input) in [&*left, &*right].into_iter().enumerate() {
            let line = &mut self.lines[ch];
            line.head = (line.head + 1) % self.n_partitions;
            line.window.copy_within(b.., 0);
            line.window[b..].copy_from_slice(input);

            let spectrum = &mut line.spectra[line.head];
            for (dst, &src) in spectrum.iter_mut().zip(&line.window) {
                *dst = Complex::new(src, 0.0);
            }
            self.fft.process_with_scratch(spectrum, &mut self.scratch);
        }

        let scale = 1.0 / self.fft_size as f32;
        for (ch, output) in [left, right].into_iter().enumerate() {
            self.accum.fill(Complex::default());
            let mut used = false;
            for path in self.paths.iter().filter(|p| p.output == ch) {
                used = true;
                let line = &self.lines[path.input];
                for (p, partition) in path.partitions.iter().enumerate() {
                    let idx = (line.head + self.n_partitions - p) % self.n_partitions;
                    let x = &line.spectra[idx];
                    for ((acc, xv), hv) in self.accum.iter_mut().zip(x).zip(partition) {
                        *acc += xv * hv;
                    }
                }
            }
            if !used {
                output.fill(0.0);
                continue;
            }
            self.ifft
                .process_with_scratch(&mut self.accum, &mut self.scratch);
            for (o, v) in output.iter_mut().zip(&self.accum[b..]) {
                *o = v.re * scale;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::direct_convolution;

    fn run_blocks(engine: &mut PartitionedConvolver, left: &[f32], right: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let b = engine.blocksize();
        let mut out_l = Vec::new();
        let mut out_r = Vec::new();
        for (cl, cr) in left.chunks(b).zip(right.chunks(b)) {
            let mut l = cl.to_vec();
            let mut r = cr.to_vec();
            engine.process(&mut l, &mut r).unwrap();
            out_l.extend(l);
            out_r.extend(r);
        }
        (out_l, out_r)
    }

    fn signal(len: usize, seed: u32) -> Vec<f32> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                ((x >> 16) & 0x7fff) as f32 / 16384.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_matches_direct_convolution() {
        let h_left = signal(300, 1);
        let h_right = signal(300, 2);
        let kernel = Kernel::stereo("t", 48000, h_left.clone(), h_right.clone());
        let mut engine = PartitionedConvolver::from_kernel(&kernel, 64).unwrap();
        assert_eq!(engine.partitions(), 5);

        let x_left = signal(640, 3);
        let x_right = signal(640, 4);
        let (yl, yr) = run_blocks(&mut engine, &x_left, &x_right);

        let el = direct_convolution(&x_left, &h_left);
        let er = direct_convolution(&x_right, &h_right);
        for i in 0..640 {
            assert!((yl[i] - el[i]).abs() < 1e-3, "left {i}: {} vs {}", yl[i], el[i]);
            assert!((yr[i] - er[i]).abs() < 1e-3, "right {i}: {} vs {}", yr[i], er[i]);
        }
    }

    #[test]
    fn test_true_stereo_cross_paths() {
        let n = 16;
        let mut ll = vec![0.0; n];
        let mut rr = vec![0.0; n];
        let mut lr = vec![0.0; n];
        let mut rl = vec![0.0; n];
        ll[0] = 1.0;
        rr[0] = 1.0;
        lr[3] = 0.5;
        rl[5] = 0.25;
        let kernel = Kernel::true_stereo("ts", 48000, ll, lr, rl, rr);
        let mut engine = PartitionedConvolver::from_kernel(&kernel, 8).unwrap();
        assert_eq!(engine.path_count(), 4);

        let mut left = vec![0.0; 8];
        let mut right = vec![0.0; 8];
        left[0] = 1.0;
        engine.process(&mut left, &mut right).unwrap();
        assert!((left[0] - 1.0).abs() < 1e-5);
        assert!((right[3] - 0.5).abs() < 1e-5);
        assert!(right[0].abs() < 1e-5);

        let mut left = vec![0.0; 8];
        let mut right = vec![0.0; 8];
        right[0] = 1.0;
        engine.process(&mut left, &mut right).unwrap();
        assert!((left[5] - 0.25).abs() < 1e-5);
        assert!((right[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_rejects_wrong_block_size() {
        let kernel = Kernel::stereo("t", 48000, vec![1.0; 4], vec![1.0; 4]);
        let mut engine = PartitionedConvolver::from_kernel(&kernel, 8).unwrap();
        let mut l = vec![0.0; 4];
        let mut r = vec![0.0; 4];
        assert_eq!(
            engine.process(&mut l, &mut r),
            Err(EngineError::SizeMismatch {
                expected: 8,
                got: 4
            })
        );
    }

    #[test]
    fn test_rejects_empty_kernel() {
        let err = PartitionedConvolver::new(&[], 64).err();
        assert_eq!(err, Some(EngineError::EmptyKernel));
        let h = [1.0_f32];
        let err = PartitionedConvolver::new(
            &[PathSpec {
                input: 0,
                output: 0,
                impulse: &h,
            }],
            0,
        )
        .err();
        assert_eq!(err, Some(EngineError::InvalidBlockSize));
    }
}
