// ============================================================================
// WAV container I/O for kernel files
// ============================================================================

use crate::error::KernelError;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

/// De-interleaved file contents
#[derive(Debug, Clone)]
pub struct WavData {
    pub rate: u32,
    pub channels: Vec<Vec<f32>>,
}

/// Read every channel of a WAV file as f32
///
/// Integer formats are scaled to [-1, 1).
pub fn read_channels(path: &Path) -> Result<WavData, KernelError> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let n_channels = spec.channels as usize;
    if n_channels == 0 {
        return Err(KernelError::UnsupportedChannels(0));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()?
        }
    };

    let frames = interleaved.len() / n_channels;
    let mut channels = vec![Vec::with_capacity(frames); n_channels];
    for frame in interleaved.chunks_exact(n_channels) {
        for (ch, &s) in channels.iter_mut().zip(frame) {
            ch.push(s);
        }
    }

    Ok(WavData {
        rate: spec.sample_rate,
        channels,
    })
}

/// Number of channels and frames without decoding the samples
pub fn probe(path: &Path) -> Result<(u16, u32), KernelError> {
    let reader = WavReader::open(path)?;
    Ok((reader.spec().channels, reader.duration()))
}

/// Write equal-length channels as interleaved 32-bit float
pub fn write_channels(path: &Path, rate: u32, channels: &[&[f32]]) -> Result<(), KernelError> {
    if channels.is_empty() {
        return Err(KernelError::UnsupportedChannels(0));
    }
    let frames = channels[0].len();
    if channels.iter().any(|c| c.len() != frames) {
        return Err(KernelError::Invalid(
            "channels must have equal length".to_string(),
        ));
    }

    let spec = WavSpec {
        channels: channels.len() as u16,
        sample_rate: rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for i in 0..frames {
        for ch in channels {
            writer.write_sample(ch[i])?;
        }
    }
    writer.finalize()?;
    Ok(())
}
