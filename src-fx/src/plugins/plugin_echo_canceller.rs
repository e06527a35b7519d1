// ============================================================================
// Echo Canceller Plugin - NLMS against the probe signal
// ============================================================================
//
// The probe ports carry the far-end reference (what the speakers play). Each
// channel runs its own NLMS filter in fixed frames of `frame_size_ms`, which
// is usually not a power of two, so the block adapter carries the period
// mismatch.

use super::plugin::{
    AudioBuffers, CommonSettings, Effect, EffectSettings, Notice, PluginInfo, Reaction,
    StreamFormat,
};
use crate::dsp::{BlockAdapter, Nlms};
use crate::error::{EngineError, PluginError};
use serde::{Deserialize, Serialize};

/// Configuration parameters for the echo canceller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoCancellerSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    /// Processing frame in milliseconds
    pub frame_size_ms: u32,
    /// Longest echo path modelled, in milliseconds
    pub filter_length_ms: u32,
    /// NLMS step size in (0, 2)
    pub step: f32,
}

impl Default for EchoCancellerSettings {
    fn default() -> Self {
        Self {
            common: CommonSettings::default(),
            frame_size_ms: 10,
            filter_length_ms: 20,
            step: 0.5,
        }
    }
}

impl EffectSettings for EchoCancellerSettings {
    fn common(&self) -> &CommonSettings {
        &self.common
    }
}

fn ms_to_frames(ms: u32, rate: u32) -> usize {
    (rate as u64 * ms as u64 / 1000) as usize
}

pub struct EchoJob {
    settings: EchoCancellerSettings,
    rate: u32,
    max_period: usize,
}

pub struct EchoEngine {
    adapter: BlockAdapter,
    left: Nlms,
    right: Nlms,
}

pub struct EchoCanceller {
    max_period: usize,
    settings: EchoCancellerSettings,
    engine: Option<EchoEngine>,
    notice: Option<Notice>,
}

impl EchoCanceller {
    pub fn new(max_period: usize) -> Self {
        Self {
            max_period,
            settings: EchoCancellerSettings::default(),
            engine: None,
            notice: None,
        }
    }

    /// Frame size of the engine in use
    pub fn blocksize(&self) -> Option<usize> {
        self.engine.as_ref().map(|e| e.adapter.blocksize())
    }
}

impl Effect for EchoCanceller {
    type Settings = EchoCancellerSettings;
    type Job = EchoJob;
    type Resources = EchoEngine;

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "Echo Canceller".to_string(),
            version: "1.0.0".to_string(),
            author: "rtfx".to_string(),
            description: "Adaptive acoustic echo cancellation against a reference signal"
                .to_string(),
        }
    }

    fn uses_probe(&self) -> bool {
        true
    }

    fn prepare(&mut self, format: StreamFormat) -> Option<EchoJob> {
        Some(EchoJob {
            settings: self.settings.clone(),
            rate: format.rate,
            max_period: self.max_period,
        })
    }

    fn build(job: EchoJob) -> Result<EchoEngine, PluginError> {
        let s = &job.settings;
        let blocksize = ms_to_frames(s.frame_size_ms, job.rate);
        let taps = ms_to_frames(s.filter_length_ms, job.rate);
        if blocksize == 0 || taps == 0 {
            return Err(PluginError::Parameter(format!(
                "frame of {} ms and filter of {} ms are empty at {} Hz",
                s.frame_size_ms, s.filter_length_ms, job.rate
            )));
        }
        if !(s.step > 0.0 && s.step < 2.0) {
            return Err(PluginError::Parameter(format!(
                "step {} outside (0, 2)",
                s.step
            )));
        }
        log::debug!(
            "echo canceller: frame {} samples, {} taps at {} Hz",
            blocksize,
            taps,
            job.rate
        );
        Ok(EchoEngine {
            adapter: BlockAdapter::new(blocksize, job.max_period, true),
            left: Nlms::new(taps, s.step),
            right: Nlms::new(taps, s.step),
        })
    }

    fn install(&mut self, resources: EchoEngine) -> Option<EchoEngine> {
        self.engine.replace(resources)
    }

    fn build_failed(&mut self, error: &PluginError) {
        log::warn!("echo canceller not rebuilt, passing audio through: {}", error);
        self.notice = Some(Notice::EngineFailed(error.to_string()));
    }

    fn apply_settings(&mut self, settings: &EchoCancellerSettings, _key: &str) -> Reaction {
        let old = std::mem::replace(&mut self.settings, settings.clone());
        let changed = old.frame_size_ms != settings.frame_size_ms
            || old.filter_length_ms != settings.filter_length_ms
            || old.step != settings.step;
        if changed {
            Reaction::Rebuild
        } else {
            Reaction::None
        }
    }

    fn process(&mut self, buffers: AudioBuffers<'_>) -> Result<(), EngineError> {
        let Some(EchoEngine {
            adapter,
            left,
            right,
        }) = self.engine.as_mut()
        else {
            return Ok(());
        };
        adapter.process(buffers.left, buffers.right, buffers.probe, |block| {
            left.process(block.left, block.probe_left);
            right.process(block.right, block.probe_right);
        });
        Ok(())
    }

    fn clear_data(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.adapter.clear();
            engine.left.reset();
            engine.right.reset();
        }
    }

    fn latency_frames(&self) -> usize {
        self.engine
            .as_ref()
            .map_or(0, |e| e.adapter.latency_frames())
    }

    fn take_latency_change(&mut self) -> Option<usize> {
        self.engine.as_mut()?.adapter.take_latency_change()
    }

    fn take_notice(&mut self) -> Option<Notice> {
        self.notice.take()
    }

    fn release(&mut self) -> Option<EchoEngine> {
        self.engine.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const FORMAT: StreamFormat = StreamFormat {
        rate: 16000,
        n_samples: 128,
    };

    fn built() -> EchoCanceller {
        let mut canceller = EchoCanceller::new(1024);
        canceller.apply_settings(&EchoCancellerSettings::default(), "*");
        let engine = EchoCanceller::build(canceller.prepare(FORMAT).unwrap()).unwrap();
        canceller.install(engine);
        canceller
    }

    #[test]
    fn test_frame_is_not_power_of_two() {
        let canceller = built();
        assert_eq!(canceller.blocksize(), Some(160));
    }

    #[test]
    fn test_echo_is_removed() {
        let mut canceller = built();
        let mut rng = StdRng::seed_from_u64(7);
        let far: Vec<f32> = (0..32_000).map(|_| rng.random_range(-1.0..1.0)).collect();
        // echo path: 0.5 after 40 samples, -0.2 after 90
        let echo: Vec<f32> = (0..far.len())
            .map(|n| {
                let a = if n >= 40 { 0.5 * far[n - 40] } else { 0.0 };
                let b = if n >= 90 { -0.2 * far[n - 90] } else { 0.0 };
                a + b
            })
            .collect();

        let mut out = Vec::with_capacity(echo.len());
        for (near, probe) in echo.chunks(128).zip(far.chunks(128)) {
            let mut left = near.to_vec();
            let mut right = near.to_vec();
            canceller
                .process(AudioBuffers {
                    left: &mut left,
                    right: &mut right,
                    probe: Some((probe, probe)),
                })
                .unwrap();
            assert_eq!(left, right);
            out.extend(left);
        }

        // 160 - gcd(128, 160)
        assert_eq!(canceller.latency_frames(), 128);
        let tail = out.len() - 1600..out.len();
        let echo_energy: f32 = echo[tail.clone()].iter().map(|v| v * v).sum();
        let residual: f32 = out[tail].iter().map(|v| v * v).sum();
        assert!(residual < echo_energy * 1e-2, "{residual} vs {echo_energy}");
    }

    #[test]
    fn test_invalid_step_rejected() {
        let mut canceller = EchoCanceller::new(1024);
        let settings = EchoCancellerSettings {
            step: 2.5,
            ..Default::default()
        };
        assert_eq!(canceller.apply_settings(&settings, "step"), Reaction::Rebuild);
        let Err(err) = EchoCanceller::build(canceller.prepare(FORMAT).unwrap()) else {
            panic!("step above 2 was accepted");
        };
        assert!(matches!(err, PluginError::Parameter(_)));
    }

    #[test]
    fn test_uses_probe_ports() {
        assert!(EchoCanceller::new(256).uses_probe());
    }
}
