// ============================================================================
// Kernel resampling
// ============================================================================
//
// Off-line sinc resampling with rubato. Each channel gets its own resampler
// since resampler state is per stream.

use super::Kernel;
use crate::error::KernelError;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

fn create_resampler(
    input_rate: u32,
    output_rate: u32,
    chunk_size: usize,
) -> Result<SincFixedIn<f32>, KernelError> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    SincFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        2.0,
        params,
        chunk_size,
        1,
    )
    .map_err(|e| KernelError::Resample(format!("failed to create resampler: {e}")))
}

/// Resample one channel from `input_rate` to `output_rate`
///
/// The output is aligned with the input (resampler delay removed) and holds
/// `ceil(len * output_rate / input_rate)` samples.
pub fn resample_channel(
    input: &[f32],
    input_rate: u32,
    output_rate: u32,
) -> Result<Vec<f32>, KernelError> {
    if input_rate == 0 || output_rate == 0 {
        return Err(KernelError::Resample(format!(
            "invalid rates {input_rate} -> {output_rate}"
        )));
    }
    if input_rate == output_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let expected =
        (input.len() as f64 * output_rate as f64 / input_rate as f64).ceil() as usize;
    let mut resampler = create_resampler(input_rate, output_rate, input.len())?;
    let delay = resampler.output_delay();

    let mut output = resampler
        .process(&[input], None)
        .map_err(|e| KernelError::Resample(e.to_string()))?
        .remove(0);

    // flush the filter tail until the delayed signal is complete
    while output.len() < expected + delay {
        let tail = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| KernelError::Resample(e.to_string()))?
            .remove(0);
        if tail.is_empty() {
            break;
        }
        output.extend_from_slice(&tail);
    }

    output.drain(..delay.min(output.len()));
    output.resize(expected, 0.0);
    Ok(output)
}

/// Resample every channel of a kernel to `target_rate`
///
/// `original_rate` is preserved; `rate` becomes `target_rate`.
pub fn resample_kernel(kernel: &Kernel, target_rate: u32) -> Result<Kernel, KernelError> {
    if kernel.rate == target_rate {
        return Ok(kernel.clone());
    }
    let from = kernel.rate;
    let mut out = kernel.clone();
    for ch in out.channels_mut() {
        *ch = resample_channel(ch, from, target_rate)?;
    }
    out.rate = target_rate;
    log::debug!(
        "kernel '{}' resampled {} Hz -> {} Hz ({} -> {} samples)",
        kernel.name,
        from,
        target_rate,
        kernel.len(),
        out.len()
    );
    Ok(out)
}
