// ============================================================================
// FIR Filter Plugin - linear-phase lowpass / highpass / bandpass
// ============================================================================

use super::plugin::{
    AudioBuffers, CommonSettings, Effect, EffectSettings, Notice, PluginInfo, Reaction,
    StreamFormat,
};
use crate::dsp::fir::{self, FilterMode};
use crate::dsp::{BlockAdapter, PartitionedConvolver, PathSpec};
use crate::error::{EngineError, PluginError};
use crate::util::block_size_for_period;
use serde::{Deserialize, Serialize};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration parameters for the FIR filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    pub mode: FilterMode,
    /// Cutoff in Hz; lower edge for bandpass
    pub frequency: f32,
    /// Upper edge in Hz, bandpass only
    pub high_frequency: f32,
    /// Transition band in Hz, sets the kernel length
    pub transition_band: f32,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            common: CommonSettings::default(),
            mode: FilterMode::Lowpass,
            frequency: 1000.0,
            high_frequency: 4000.0,
            transition_band: 200.0,
        }
    }
}

impl EffectSettings for FilterSettings {
    fn common(&self) -> &CommonSettings {
        &self.common
    }
}

impl FilterSettings {
    /// Check edges against the Nyquist frequency of `rate`
    pub fn validate(&self, rate: u32) -> Result<(), PluginError> {
        let nyquist = rate as f32 / 2.0;
        if !(self.transition_band > 0.0) {
            return Err(PluginError::Parameter(format!(
                "transition band must be positive, got {}",
                self.transition_band
            )));
        }
        let order = fir::kernel_order(self.transition_band, rate);
        if order > fir::MAX_KERNEL_ORDER {
            return Err(PluginError::Parameter(format!(
                "transition band {} Hz needs {} taps, limit is {}",
                self.transition_band,
                order + 1,
                fir::MAX_KERNEL_ORDER + 1
            )));
        }
        let edges = match self.mode {
            FilterMode::Bandpass => vec![self.frequency, self.high_frequency],
            _ => vec![self.frequency],
        };
        if let Some(f) = edges.iter().find(|f| !(**f > 0.0 && **f < nyquist)) {
            return Err(PluginError::Parameter(format!(
                "frequency {} Hz outside (0, {}) Hz",
                f, nyquist
            )));
        }
        if self.mode == FilterMode::Bandpass && self.frequency >= self.high_frequency {
            return Err(PluginError::Parameter(format!(
                "bandpass edges out of order: {} Hz >= {} Hz",
                self.frequency, self.high_frequency
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Deferred state
// ============================================================================

pub struct FilterJob {
    settings: FilterSettings,
    rate: u32,
    blocksize: usize,
    max_period: usize,
}

pub struct FilterEngine {
    convolver: PartitionedConvolver,
    adapter: BlockAdapter,
    taps: usize,
}

// ============================================================================
// Plugin Implementation
// ============================================================================

/// Windowed-sinc FIR run through the partitioned engine
pub struct FirFilter {
    max_period: usize,
    settings: FilterSettings,
    engine: Option<FilterEngine>,
    notice: Option<Notice>,
}

impl FirFilter {
    pub fn new(max_period: usize) -> Self {
        Self {
            max_period,
            settings: FilterSettings::default(),
            engine: None,
            notice: None,
        }
    }

    /// Kernel length of the engine in use
    pub fn taps(&self) -> Option<usize> {
        self.engine.as_ref().map(|e| e.taps)
    }
}

impl Effect for FirFilter {
    type Settings = FilterSettings;
    type Job = FilterJob;
    type Resources = FilterEngine;

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "FIR Filter".to_string(),
            version: "1.0.0".to_string(),
            author: "rtfx".to_string(),
            description: "Linear-phase windowed-sinc lowpass, highpass and bandpass".to_string(),
        }
    }

    fn prepare(&mut self, format: StreamFormat) -> Option<FilterJob> {
        Some(FilterJob {
            settings: self.settings.clone(),
            rate: format.rate,
            blocksize: block_size_for_period(format.n_samples),
            max_period: self.max_period,
        })
    }

    fn build(job: FilterJob) -> Result<FilterEngine, PluginError> {
        let s = &job.settings;
        s.validate(job.rate)?;
        let kernel = fir::design(
            s.mode,
            s.frequency,
            s.high_frequency,
            s.transition_band,
            job.rate,
        );
        let paths = [
            PathSpec {
                input: 0,
                output: 0,
                impulse: &kernel,
            },
            PathSpec {
                input: 1,
                output: 1,
                impulse: &kernel,
            },
        ];
        let convolver = PartitionedConvolver::new(&paths, job.blocksize)?;
        log::debug!(
            "{:?} filter: {} taps at {} Hz, block {}",
            s.mode,
            kernel.len(),
            job.rate,
            job.blocksize
        );
        Ok(FilterEngine {
            convolver,
            adapter: BlockAdapter::new(job.blocksize, job.max_period, false),
            taps: kernel.len(),
        })
    }

    fn install(&mut self, resources: FilterEngine) -> Option<FilterEngine> {
        self.engine.replace(resources)
    }

    fn build_failed(&mut self, error: &PluginError) {
        log::warn!("filter not rebuilt, passing audio through: {}", error);
        self.notice = Some(Notice::EngineFailed(error.to_string()));
    }

    fn apply_settings(&mut self, settings: &FilterSettings, _key: &str) -> Reaction {
        let old = std::mem::replace(&mut self.settings, settings.clone());
        let changed = old.mode != settings.mode
            || old.frequency != settings.frequency
            || old.high_frequency != settings.high_frequency
            || old.transition_band != settings.transition_band;
        if changed {
            Reaction::Rebuild
        } else {
            Reaction::None
        }
    }

    fn process(&mut self, buffers: AudioBuffers<'_>) -> Result<(), EngineError> {
        let Some(FilterEngine {
            convolver, adapter, ..
        }) = self.engine.as_mut()
        else {
            return Ok(());
        };

        let mut result = Ok(());
        adapter.process(buffers.left, buffers.right, None, |block| {
            if result.is_ok() {
                result = convolver.process(block.left, block.right);
            }
        });
        result
    }

    fn clear_data(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.adapter.clear();
            engine.convolver.reset();
        }
    }

    /// Adapter delay plus the group delay of the linear-phase kernel
    fn latency_frames(&self) -> usize {
        self.engine
            .as_ref()
            .map_or(0, |e| e.adapter.latency_frames() + e.taps / 2)
    }

    fn take_latency_change(&mut self) -> Option<usize> {
        let engine = self.engine.as_mut()?;
        let taps = engine.taps;
        engine.adapter.take_latency_change().map(|f| f + taps / 2)
    }

    fn take_notice(&mut self) -> Option<Notice> {
        self.notice.take()
    }

    fn release(&mut self) -> Option<FilterEngine> {
        self.engine.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: StreamFormat = StreamFormat {
        rate: 48000,
        n_samples: 64,
    };

    fn built(settings: FilterSettings) -> FirFilter {
        let mut filter = FirFilter::new(1024);
        filter.apply_settings(&settings, "*");
        let engine = FirFilter::build(filter.prepare(FORMAT).unwrap()).unwrap();
        filter.install(engine);
        filter
    }

    /// Feed a constant signal for `periods` host periods, return the last output sample
    fn settle(filter: &mut FirFilter, value: f32, periods: usize) -> f32 {
        let mut last = 0.0;
        for _ in 0..periods {
            let mut left = vec![value; 64];
            let mut right = vec![value; 64];
            filter
                .process(AudioBuffers {
                    left: &mut left,
                    right: &mut right,
                    probe: None,
                })
                .unwrap();
            assert_eq!(left, right);
            last = left[63];
        }
        last
    }

    fn fast(mode: FilterMode) -> FilterSettings {
        FilterSettings {
            mode,
            transition_band: 2000.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_lowpass_passes_dc() {
        let mut filter = built(fast(FilterMode::Lowpass));
        assert_eq!(filter.taps(), Some(97));
        let out = settle(&mut filter, 1.0, 4);
        assert!((out - 1.0).abs() < 1e-3, "dc gain {}", out);
        assert_eq!(filter.latency_frames(), 48);
    }

    #[test]
    fn test_highpass_blocks_dc() {
        let mut filter = built(fast(FilterMode::Highpass));
        let out = settle(&mut filter, 1.0, 4);
        assert!(out.abs() < 1e-3, "dc leak {}", out);
    }

    #[test]
    fn test_invalid_edges_rejected() {
        let bad = FilterSettings {
            mode: FilterMode::Bandpass,
            frequency: 5000.0,
            high_frequency: 1000.0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(48000), Err(PluginError::Parameter(_))));

        let narrow = FilterSettings {
            transition_band: 0.01,
            ..Default::default()
        };
        assert!(matches!(narrow.validate(48000), Err(PluginError::Parameter(_))));
        let widest = FilterSettings {
            transition_band: 4.0 * 48000.0 / fir::MAX_KERNEL_ORDER as f32,
            ..Default::default()
        };
        assert!(widest.validate(48000).is_ok());

        let above_nyquist = FilterSettings {
            frequency: 30000.0,
            ..Default::default()
        };
        let mut filter = FirFilter::new(1024);
        filter.apply_settings(&above_nyquist, "*");
        let Err(err) = FirFilter::build(filter.prepare(FORMAT).unwrap()) else {
            panic!("cutoff above Nyquist was accepted");
        };
        filter.build_failed(&err);
        assert!(matches!(filter.take_notice(), Some(Notice::EngineFailed(_))));
        assert!(filter.taps().is_none());
    }

    #[test]
    fn test_setting_changes() {
        let mut filter = FirFilter::new(1024);
        let mut s = FilterSettings::default();
        assert_eq!(filter.apply_settings(&s, "*"), Reaction::None);
        s.frequency = 2000.0;
        assert_eq!(filter.apply_settings(&s, "frequency"), Reaction::Rebuild);
        s.common.bypass = true;
        assert_eq!(filter.apply_settings(&s, "bypass"), Reaction::None);
    }

    #[test]
    fn test_mode_from_json() {
        let s: FilterSettings =
            serde_json::from_value(serde_json::json!({ "mode": "bandpass", "frequency": 300.0 }))
                .unwrap();
        assert_eq!(s.mode, FilterMode::Bandpass);
        assert_eq!(s.high_frequency, 4000.0);
    }
}
