// ============================================================================
// Convolver Plugin - impulse-response convolution
// ============================================================================
//
// Kernel loading, resampling and engine construction happen in `build` on the
// worker. The loaded and resampled kernel is cached so width and autogain
// changes rebuild the engine without touching disk.

use super::plugin::{
    AudioBuffers, CommonSettings, Effect, EffectSettings, Notice, PluginInfo, Reaction,
    StreamFormat,
};
use crate::dsp::{BlockAdapter, PartitionedConvolver};
use crate::error::{EngineError, KernelError, PluginError};
use crate::kernel::resample::resample_kernel;
use crate::kernel::{Kernel, KernelInfo, KernelManager, KernelSpectrum, SpatialSelection};
use crate::util::block_size_for_period;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration parameters for the convolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolverSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    /// Kernel file stem, searched as `.irs` then `.sofa`
    pub kernel_name: String,
    /// Stereo width in percent, 0 to 200
    pub ir_width: f32,
    /// Normalize the kernel peak to 1.0
    pub autogain: bool,
    /// Direction used for spatial datasets
    #[serde(flatten)]
    pub spatial: SpatialSelection,
}

impl Default for ConvolverSettings {
    fn default() -> Self {
        Self {
            common: CommonSettings::default(),
            kernel_name: String::new(),
            ir_width: 100.0,
            autogain: true,
            spatial: SpatialSelection::default(),
        }
    }
}

impl EffectSettings for ConvolverSettings {
    fn common(&self) -> &CommonSettings {
        &self.common
    }
}

// ============================================================================
// Deferred state
// ============================================================================

/// Kernel as loaded from disk and resampled to the stream rate
#[derive(Debug)]
pub struct CachedKernel {
    pub name: String,
    pub rate: u32,
    pub selection: SpatialSelection,
    pub kernel: Kernel,
}

impl CachedKernel {
    fn matches(&self, name: &str, rate: u32, selection: &SpatialSelection) -> bool {
        self.name == name && self.rate == rate && self.selection == *selection
    }
}

/// Snapshot taken under the data lock for a rebuild
pub struct ConvolverJob {
    kernels: Arc<KernelManager>,
    name: String,
    selection: SpatialSelection,
    rate: u32,
    blocksize: usize,
    max_period: usize,
    width: f32,
    autogain: bool,
    cached: Option<Arc<CachedKernel>>,
}

/// Engine and adapter sized for one rate and period
pub struct ConvolverEngine {
    source: Arc<CachedKernel>,
    convolver: PartitionedConvolver,
    adapter: BlockAdapter,
    info: KernelInfo,
}

impl ConvolverEngine {
    pub fn blocksize(&self) -> usize {
        self.convolver.blocksize()
    }

    pub fn info(&self) -> KernelInfo {
        self.info
    }
}

// ============================================================================
// Plugin Implementation
// ============================================================================

pub struct Convolver {
    kernels: Arc<KernelManager>,
    max_period: usize,
    settings: ConvolverSettings,
    cache: Option<Arc<CachedKernel>>,
    engine: Option<ConvolverEngine>,
    load_failed: bool,
    engine_failed: bool,
    notice: Option<Notice>,
}

impl Convolver {
    /// # Arguments
    /// * `kernels` - Kernel storage for this pipeline direction
    /// * `max_period` - Largest host period the adapter preallocates for
    pub fn new(kernels: Arc<KernelManager>, max_period: usize) -> Self {
        Self {
            kernels,
            max_period,
            settings: ConvolverSettings::default(),
            cache: None,
            engine: None,
            load_failed: false,
            engine_failed: false,
            notice: None,
        }
    }

    /// The configured kernel could not be loaded
    pub fn load_failed(&self) -> bool {
        self.load_failed
    }

    /// Summary of the kernel in use
    pub fn kernel_info(&self) -> Option<KernelInfo> {
        self.engine.as_ref().map(ConvolverEngine::info)
    }

    pub fn engine(&self) -> Option<&ConvolverEngine> {
        self.engine.as_ref()
    }

    /// Spectrum of the cached kernel, before width and autogain
    pub fn kernel_spectrum(&self, points: usize) -> Option<KernelSpectrum> {
        KernelSpectrum::compute(&self.cache.as_ref()?.kernel, points)
    }

    fn acquire(job: &ConvolverJob) -> Result<Arc<CachedKernel>, PluginError> {
        if let Some(cached) = &job.cached
            && cached.matches(&job.name, job.rate, &job.selection)
        {
            return Ok(Arc::clone(cached));
        }

        let loaded = job.kernels.load_spatial(&job.name, &job.selection);
        if !loaded.is_valid() {
            // load_spatial already logged why
            return Err(KernelError::NotFound(job.name.clone()).into());
        }
        let kernel = resample_kernel(&loaded, job.rate)?;
        Ok(Arc::new(CachedKernel {
            name: job.name.clone(),
            rate: job.rate,
            selection: job.selection,
            kernel,
        }))
    }
}

impl Effect for Convolver {
    type Settings = ConvolverSettings;
    type Job = ConvolverJob;
    type Resources = ConvolverEngine;

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: "Convolver".to_string(),
            version: "1.0.0".to_string(),
            author: "rtfx".to_string(),
            description: "Stereo and true-stereo impulse response convolution".to_string(),
        }
    }

    fn prepare(&mut self, format: StreamFormat) -> Option<ConvolverJob> {
        Some(ConvolverJob {
            kernels: Arc::clone(&self.kernels),
            name: self.settings.kernel_name.clone(),
            selection: self.settings.spatial,
            rate: format.rate,
            blocksize: block_size_for_period(format.n_samples),
            max_period: self.max_period,
            width: self.settings.ir_width,
            autogain: self.settings.autogain,
            cached: self.cache.clone(),
        })
    }

    fn build(job: ConvolverJob) -> Result<ConvolverEngine, PluginError> {
        let source = Self::acquire(&job)?;

        let mut kernel = source.kernel.clone();
        kernel.apply_width(job.width);
        if job.autogain {
            kernel.normalize();
        }

        let convolver = PartitionedConvolver::from_kernel(&kernel, job.blocksize)?;
        let adapter = BlockAdapter::new(job.blocksize, job.max_period, false);
        log::debug!(
            "convolver engine for '{}': block {} with {} partitions, {} paths",
            job.name,
            job.blocksize,
            convolver.partitions(),
            convolver.path_count()
        );
        Ok(ConvolverEngine {
            info: kernel.info(),
            source,
            convolver,
            adapter,
        })
    }

    fn install(&mut self, resources: ConvolverEngine) -> Option<ConvolverEngine> {
        let new_kernel = self
            .cache
            .as_ref()
            .is_none_or(|c| !Arc::ptr_eq(c, &resources.source));
        if new_kernel || self.load_failed {
            self.notice = Some(Notice::KernelLoaded(resources.info));
        }
        self.cache = Some(Arc::clone(&resources.source));
        self.load_failed = false;
        self.engine_failed = false;
        self.engine.replace(resources)
    }

    fn build_failed(&mut self, error: &PluginError) {
        self.engine_failed = true;
        match error {
            PluginError::Kernel(_) => {
                self.load_failed = true;
                self.cache = None;
                self.notice = Some(Notice::KernelLoadFailed(self.settings.kernel_name.clone()));
            }
            e => self.notice = Some(Notice::EngineFailed(e.to_string())),
        }
    }

    fn apply_settings(&mut self, settings: &ConvolverSettings, _key: &str) -> Reaction {
        let old = std::mem::replace(&mut self.settings, settings.clone());
        let kernel_changed =
            old.kernel_name != settings.kernel_name || old.spatial != settings.spatial;
        let shaping_changed = old.ir_width != settings.ir_width || old.autogain != settings.autogain;
        if kernel_changed || shaping_changed {
            Reaction::Rebuild
        } else {
            Reaction::None
        }
    }

    fn process(&mut self, buffers: AudioBuffers<'_>) -> Result<(), EngineError> {
        let Some(ConvolverEngine {
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

    fn latency_frames(&self) -> usize {
        match &self.engine {
            Some(engine) if !self.engine_failed => engine.adapter.latency_frames(),
            _ => 0,
        }
    }

    fn take_latency_change(&mut self) -> Option<usize> {
        self.engine.as_mut()?.adapter.take_latency_change()
    }

    fn take_notice(&mut self) -> Option<Notice> {
        self.notice.take()
    }

    fn release(&mut self) -> Option<ConvolverEngine> {
        self.cache = None;
        self.engine.take()
    }
}
