// ============================================================================
// Block Adapter
// ============================================================================
//
// Runs an algorithm with a native frame size B inside a host callback of N
// samples. Input goes through per-channel FIFOs, the algorithm consumes exact
// B-sample blocks and its output is emitted in order. When the output FIFO
// cannot cover a host block the missing samples are written as leading zeros
// and counted as latency.

use crate::util::gcd;
use std::collections::VecDeque;

/// One algorithm frame; `left`/`right` are processed in place
pub struct Block<'a> {
    pub left: &'a mut [f32],
    pub right: &'a mut [f32],
    /// Reference signal, empty when the adapter has no probe channels
    pub probe_left: &'a [f32],
    pub probe_right: &'a [f32],
}

/// FIFO adapter between the host period and an algorithm block size
pub struct BlockAdapter {
    blocksize: usize,
    with_probe: bool,

    in_left: VecDeque<f32>,
    in_right: VecDeque<f32>,
    in_probe_left: VecDeque<f32>,
    in_probe_right: VecDeque<f32>,
    out_left: VecDeque<f32>,
    out_right: VecDeque<f32>,

    block_left: Vec<f32>,
    block_right: Vec<f32>,
    block_probe_left: Vec<f32>,
    block_probe_right: Vec<f32>,

    /// Synthetic zeros emitted ahead of processed audio since the last clear
    latency_n_frames: usize,
    latency_dirty: bool,
    primed: bool,
    runs: u64,
}

impl BlockAdapter {
    /// Create an adapter
    ///
    /// # Arguments
    /// * `blocksize` - Algorithm frame size B (must be > 0)
    /// * `max_period` - Largest host period expected; queues are preallocated for it
    /// * `with_probe` - Also queue a stereo reference signal
    pub fn new(blocksize: usize, max_period: usize, with_probe: bool) -> Self {
        let blocksize = blocksize.max(1);
        let capacity = 2 * (blocksize + max_period);
        let probe_capacity = if with_probe { capacity } else { 0 };
        let probe_block = if with_probe { blocksize } else { 0 };
        Self {
            blocksize,
            with_probe,
            in_left: VecDeque::with_capacity(capacity),
            in_right: VecDeque::with_capacity(capacity),
            in_probe_left: VecDeque::with_capacity(probe_capacity),
            in_probe_right: VecDeque::with_capacity(probe_capacity),
            out_left: VecDeque::with_capacity(capacity),
            out_right: VecDeque::with_capacity(capacity),
            block_left: vec![0.0; blocksize],
            block_right: vec![0.0; blocksize],
            block_probe_left: vec![0.0; probe_block],
            block_probe_right: vec![0.0; probe_block],
            latency_n_frames: 0,
            latency_dirty: false,
            primed: false,
            runs: 0,
        }
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn latency_frames(&self) -> usize {
        self.latency_n_frames
    }

    pub fn latency_seconds(&self, rate: u32) -> f32 {
        if rate == 0 {
            0.0
        } else {
            self.latency_n_frames as f32 / rate as f32
        }
    }

    /// Number of algorithm runs since construction
    pub fn runs(&self) -> u64 {
        self.runs
    }

    /// Returns the new latency once after each change
    pub fn take_latency_change(&mut self) -> Option<usize> {
        if self.latency_dirty {
            self.latency_dirty = false;
            Some(self.latency_n_frames)
        } else {
            None
        }
    }

    /// Drop every queued sample; the next block primes the queues again
    pub fn clear(&mut self) {
        self.in_left.clear();
        self.in_right.clear();
        self.in_probe_left.clear();
        self.in_probe_right.clear();
        self.out_left.clear();
        self.out_right.clear();
        self.primed = false;
        self.set_latency(0);
    }

    fn set_latency(&mut self, frames: usize) {
        if frames != self.latency_n_frames {
            self.latency_n_frames = frames;
            self.latency_dirty = true;
        }
    }

    /// Steady-state fill of the output queue for a constant period `n`
    fn fill_for_period(&self, n: usize) -> usize {
        self.blocksize - gcd(n, self.blocksize)
    }

    /// Process one host block in place
    ///
    /// `left` and `right` must have the same length. `probe` is ignored when
    /// the adapter was built without probe channels, and zero-filled when
    /// missing on an adapter that has them.
    pub fn process<F>(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        probe: Option<(&[f32], &[f32])>,
        mut algorithm: F,
    ) where
        F: FnMut(Block<'_>),
    {
        let n = left.len().min(right.len());
        if n == 0 {
            return;
        }
        let b = self.blocksize;

        if !self.primed {
            let fill = self.fill_for_period(n);
            self.out_left.extend(std::iter::repeat_n(0.0, fill));
            self.out_right.extend(std::iter::repeat_n(0.0, fill));
            self.set_latency(fill);
            self.primed = true;
        }

        self.in_left.extend(&left[..n]);
        self.in_right.extend(&right[..n]);
        if self.with_probe {
            match probe {
                Some((pl, pr)) if pl.len() >= n && pr.len() >= n => {
                    self.in_probe_left.extend(&pl[..n]);
                    self.in_probe_right.extend(&pr[..n]);
                }
                _ => {
                    self.in_probe_left.extend(std::iter::repeat_n(0.0, n));
                    self.in_probe_right.extend(std::iter::repeat_n(0.0, n));
                }
            }
        }

        while self.in_left.len() >= b {
            fill_from(&mut self.block_left, &mut self.in_left);
            fill_from(&mut self.block_right, &mut self.in_right);
            if self.with_probe {
                fill_from(&mut self.block_probe_left, &mut self.in_probe_left);
                fill_from(&mut self.block_probe_right, &mut self.in_probe_right);
            }

            algorithm(Block {
                left: &mut self.block_left,
                right: &mut self.block_right,
                probe_left: &self.block_probe_left,
                probe_right: &self.block_probe_right,
            });
            self.runs += 1;

            self.out_left.extend(&self.block_left);
            self.out_right.extend(&self.block_right);
        }

        if self.out_left.len() >= n {
            drain_into(&mut left[..n], &mut self.out_left);
            drain_into(&mut right[..n], &mut self.out_right);
        } else {
            // underrun: leading zeros, then everything we have
            let offset = n - self.out_left.len();
            left[..offset].fill(0.0);
            right[..offset].fill(0.0);
            drain_into(&mut left[offset..n], &mut self.out_left);
            drain_into(&mut right[offset..n], &mut self.out_right);
            self.set_latency(self.latency_n_frames + offset);
        }
    }
}

fn fill_from(dst: &mut [f32], src: &mut VecDeque<f32>) {
    let len = dst.len();
    for (d, s) in dst.iter_mut().zip(src.drain(..len)) {
        *d = s;
    }
}

fn drain_into(dst: &mut [f32], src: &mut VecDeque<f32>) {
    let count = dst.len().min(src.len());
    for (d, s) in dst.iter_mut().zip(src.drain(..count)) {
        *d = s;
    }
}
