pub mod config;
pub use config::{HostConfig, PluginConfig};

pub mod error;
pub use error::{ConfigError, EngineError, GraphError, KernelError, PluginError};

pub mod dsp;
pub use dsp::{BlockAdapter, FilterMode, Nlms, PartitionedConvolver};

pub mod graph;
pub use graph::{
    AudioGraph, FilterHandle, FilterState, GraphOptions, LocalGraph, Pipeline, PipelineDriver,
    PipelineType, ProcessCycle, ProcessHandler, StreamEndpoint,
};

pub mod kernel;
pub use kernel::{
    Kernel, KernelInfo, KernelManager, KernelSpectrum, SpatialDataset, SpatialSelection,
    SpatialSource,
};

pub mod plugins;
pub use plugins::{
    CommonSettings, Convolver, ConvolverSettings, EchoCanceller, EchoCancellerSettings, Effect,
    EffectKind, FilterSettings, FirFilter, Gain, GainSettings, Plugin, PluginContext, PluginEvent,
    PluginInfo, PluginNode,
};

pub mod settings;
pub use settings::Settings;

pub mod util;

pub mod worker;
pub use worker::{Worker, WorkerHandle};
