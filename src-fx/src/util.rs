// ============================================================================
// Small helpers shared by plugins and the kernel engine
// ============================================================================

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Convert dB to linear gain
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert linear gain to dB
#[inline]
pub fn linear_to_db(linear: f32) -> f32 {
    20.0 * linear.log10()
}

/// Greatest common divisor
pub fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Largest power of two that is `<= n` (returns 0 for 0)
pub fn previous_power_of_two(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1usize << (usize::BITS - 1 - n.leading_zeros())
    }
}

/// Internal block size used by FFT-sized engines for a given host period
///
/// Power-of-two periods are used as they are. Other periods shrink to the
/// largest power of two below them; periods of 2 or less are kept.
pub fn block_size_for_period(n_samples: usize) -> usize {
    if n_samples <= 2 || n_samples.is_power_of_two() {
        n_samples
    } else {
        previous_power_of_two(n_samples)
    }
}

/// Multiply every sample by `gain`, skipping the work at unity
#[inline]
pub fn apply_gain(buffer: &mut [f32], gain: f32) {
    if gain != 1.0 {
        for s in buffer.iter_mut() {
            *s *= gain;
        }
    }
}

/// Recursive search for a file named `filename` under `root`
///
/// `max_depth` counts directory levels below `root` (0 only looks at `root`
/// itself). Entries are visited in name order so the result is stable.
pub fn search_filename(root: &Path, filename: &str, max_depth: usize) -> Option<PathBuf> {
    let mut entries: Vec<_> = std::fs::read_dir(root).ok()?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    let mut subdirs = Vec::new();
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if entry.file_name().to_str() == Some(filename) {
            return Some(path);
        }
    }

    if max_depth == 0 {
        return None;
    }
    subdirs
        .iter()
        .find_map(|dir| search_filename(dir, filename, max_depth - 1))
}

/// Gate for diagnostics that may fire on every realtime block
///
/// The first call to [`LogOnce::first`] returns true, later calls return
/// false until [`LogOnce::rearm`].
#[derive(Debug, Default)]
pub struct LogOnce {
    fired: AtomicBool,
}

impl LogOnce {
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn first(&self) -> bool {
        !self.fired.swap(true, Ordering::Relaxed)
    }

    pub fn rearm(&self) {
        self.fired.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_conversions() {
        assert!((db_to_linear(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_linear(-6.0) - 0.501).abs() < 1e-3);
        assert!((linear_to_db(0.5) + 6.02).abs() < 1e-2);
    }

    #[test]
    fn test_block_size_for_period() {
        assert_eq!(block_size_for_period(1024), 1024);
        assert_eq!(block_size_for_period(1000), 512);
        assert_eq!(block_size_for_period(441), 256);
        assert_eq!(block_size_for_period(3), 2);
        assert_eq!(block_size_for_period(2), 2);
        assert_eq!(block_size_for_period(1), 1);
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(256, 1024), 256);
        assert_eq!(gcd(300, 256), 4);
        assert_eq!(gcd(7, 0), 7);
    }

    #[test]
    fn test_search_filename_respects_depth() {
        let tmp = tempfile::tempdir().unwrap();
        let deep = tmp.path().join("a").join("b").join("c").join("d");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("room.irs"), b"").unwrap();
        std::fs::write(tmp.path().join("a").join("hall.irs"), b"").unwrap();

        assert!(search_filename(tmp.path(), "hall.irs", 1).is_some());
        assert!(search_filename(tmp.path(), "hall.irs", 0).is_none());
        assert!(search_filename(tmp.path(), "room.irs", 3).is_none());
        assert!(search_filename(tmp.path(), "room.irs", 4).is_some());
    }

    #[test]
    fn test_log_once() {
        let gate = LogOnce::new();
        assert!(gate.first());
        assert!(!gate.first());
        gate.rearm();
        assert!(gate.first());
    }
}
