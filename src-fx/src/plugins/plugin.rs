// ============================================================================
// Plugin Trait Definition
// ============================================================================

use crate::error::{EngineError, GraphError, PluginError};
use crate::graph::{FilterHandle, FilterState, NodeId, PipelineType};
use crate::kernel::KernelInfo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Information about a plugin
#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// Plugin name
    pub name: String,
    /// Plugin version
    pub version: String,
    /// Plugin author
    pub author: String,
    /// Plugin description
    pub description: String,
}

/// Negotiated stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFormat {
    /// Sample rate in Hz
    pub rate: u32,
    /// Samples per channel in one host period
    pub n_samples: usize,
}

impl StreamFormat {
    pub fn is_valid(&self) -> bool {
        self.rate > 0 && self.n_samples > 0
    }
}

/// Notifications published by plugins
///
/// Sent from the worker thread, never from the realtime path.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    /// DSP state is built and in use
    Ready { tag: String },
    /// Processing latency changed and was pushed to the graph
    LatencyChanged { tag: String, seconds: f32 },
    /// A kernel was loaded and installed
    KernelLoaded { tag: String, info: KernelInfo },
    /// The configured kernel could not be used; the plugin passes audio through
    KernelLoadFailed { tag: String, name: String },
    /// The processing engine failed; the plugin passes audio through until rebuilt
    EngineFailed { tag: String, reason: String },
}

/// Effect-level notice, turned into a [`PluginEvent`] by the node
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    KernelLoaded(KernelInfo),
    KernelLoadFailed(String),
    EngineFailed(String),
}

impl Notice {
    pub(crate) fn into_event(self, tag: &str) -> PluginEvent {
        let tag = tag.to_string();
        match self {
            Notice::KernelLoaded(info) => PluginEvent::KernelLoaded { tag, info },
            Notice::KernelLoadFailed(name) => PluginEvent::KernelLoadFailed { tag, name },
            Notice::EngineFailed(reason) => PluginEvent::EngineFailed { tag, reason },
        }
    }
}

/// Settings shared by every plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonSettings {
    pub bypass: bool,
    pub input_gain_db: f32,
    pub output_gain_db: f32,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            bypass: false,
            input_gain_db: 0.0,
            output_gain_db: 0.0,
        }
    }
}

/// Per-effect settings type, deserialized from a chain entry's parameters
pub trait EffectSettings:
    Clone + Default + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn common(&self) -> &CommonSettings;
}

/// What a settings change requires from the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Cached values were updated in place
    None,
    /// DSP state must be rebuilt on the worker
    Rebuild,
    /// Queues and engine history must be flushed
    Clear,
}

/// Buffers handed to an effect, processed in place
pub struct AudioBuffers<'a> {
    pub left: &'a mut [f32],
    pub right: &'a mut [f32],
    /// Reference signal for effects with probe ports
    pub probe: Option<(&'a [f32], &'a [f32])>,
}

/// DSP half of a plugin
///
/// The node owns the effect behind its data lock. Heavy state is produced in
/// three steps: [`Effect::prepare`] snapshots what is needed under the lock,
/// [`Effect::build`] runs on the worker without the lock, and
/// [`Effect::install`] swaps the result in under the lock.
pub trait Effect: Send + 'static {
    type Settings: EffectSettings;
    /// Snapshot taken for a rebuild
    type Job: Send + 'static;
    /// State built off the realtime path
    type Resources: Send + 'static;

    fn info(&self) -> PluginInfo;

    /// Whether the effect needs the probe port pair
    fn uses_probe(&self) -> bool {
        false
    }

    /// Format changed; cheap, may run on the realtime thread
    fn invalidate(&mut self, format: StreamFormat) {
        let _ = format;
    }

    /// Snapshot for a rebuild; `None` means nothing to build
    fn prepare(&mut self, format: StreamFormat) -> Option<Self::Job>;

    /// Build resources; runs on the worker with no lock held
    fn build(job: Self::Job) -> Result<Self::Resources, PluginError>;

    /// Swap in freshly built resources, returning the retired ones
    fn install(&mut self, resources: Self::Resources) -> Option<Self::Resources>;

    /// A rebuild failed; the node keeps passing audio through
    fn build_failed(&mut self, error: &PluginError) {
        let _ = error;
    }

    /// Settings changed; runs on the thread that changed them, under the lock
    fn apply_settings(&mut self, settings: &Self::Settings, key: &str) -> Reaction;

    /// Realtime processing, in place, `left.len() == right.len()`
    fn process(&mut self, buffers: AudioBuffers<'_>) -> Result<(), EngineError>;

    /// Flush queues and history without rebuilding
    fn clear_data(&mut self) {}

    fn latency_frames(&self) -> usize {
        0
    }

    /// New latency once after each change
    fn take_latency_change(&mut self) -> Option<usize> {
        None
    }

    /// Pending notice for the event channel
    fn take_notice(&mut self) -> Option<Notice> {
        None
    }

    /// Give up all built resources (on shutdown)
    fn release(&mut self) -> Option<Self::Resources>;
}

/// Object-safe interface of a plugin instance
pub trait Plugin: Send + Sync {
    fn info(&self) -> PluginInfo;

    /// Stable name, unique within a pipeline
    fn tag(&self) -> &str;

    fn pipeline_type(&self) -> PipelineType;

    /// Rate or period changed: drop readiness and schedule a rebuild
    fn setup(&self);

    /// Realtime entry point; missing buffers are substituted
    fn process(
        &self,
        left_in: Option<&[f32]>,
        right_in: Option<&[f32]>,
        left_out: Option<&mut [f32]>,
        right_out: Option<&mut [f32]>,
    );

    /// Realtime entry point with a reference signal
    fn process_with_probe(
        &self,
        left_in: Option<&[f32]>,
        right_in: Option<&[f32]>,
        left_out: Option<&mut [f32]>,
        right_out: Option<&mut [f32]>,
        probe_left: Option<&[f32]>,
        probe_right: Option<&[f32]>,
    );

    /// Restore default settings
    fn reset(&self);

    /// Flush queued audio and engine history
    fn clear_data(&self);

    fn latency_seconds(&self) -> f32;

    /// Register with the graph and wait until the node is visible
    fn connect(&self) -> Result<(), GraphError>;

    /// Deactivate, remove the listener and wait for `Unconnected`
    fn disconnect(&self) -> Result<(), GraphError>;

    fn set_active(&self, active: bool) -> Result<(), GraphError>;

    fn node_id(&self) -> Option<NodeId>;

    fn state(&self) -> FilterState;

    fn is_ready(&self) -> bool;

    fn is_bypassed(&self) -> bool;

    fn filter_handle(&self) -> Option<FilterHandle>;

    fn has_probe(&self) -> bool;

    /// Replace all settings from a JSON object
    fn set_parameters(&self, parameters: &serde_json::Value) -> Result<(), PluginError>;

    /// Current settings as JSON
    fn parameters(&self) -> serde_json::Value;

    /// Disconnect and release DSP resources; the instance is unusable afterwards
    fn shutdown(&self);
}
