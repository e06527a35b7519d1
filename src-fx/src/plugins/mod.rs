// ============================================================================
// Effect Plugin System
// ============================================================================
//
// Every plugin is a `PluginNode<E>`: an `Effect` (the DSP) bound to the audio
// graph, the worker and a reactive settings object. Pipelines only see the
// object-safe `Plugin` trait.
//
// Architecture:
// - Effect trait: realtime processing plus deferred build of heavy state
// - PluginNode: buffer substitution, gains, bypass, rebuilds, latency
// - EffectKind: closed set of effects, resolved once when a chain is built
//
// Example usage:
// ```ignore
// let ctx = PluginContext::new(graph, worker.handle(), kernels, PipelineType::Output, &config);
// let plugin = EffectKind::Convolver.instantiate(&PluginConfig::new("convolver", params), &ctx)?;
// plugin.connect()?;
// plugin.set_active(true)?;
// ```

mod base;
mod kind;
mod node;
mod plugin;
mod plugin_convolver;
mod plugin_echo_canceller;
mod plugin_filter;
mod plugin_gain;

pub use kind::{DEFAULT_RATE, EffectKind, PluginContext};
pub use node::PluginNode;
pub use plugin::{
    AudioBuffers, CommonSettings, Effect, EffectSettings, Notice, Plugin, PluginEvent, PluginInfo,
    Reaction, StreamFormat,
};

pub use plugin_convolver::{Convolver, ConvolverSettings};
pub use plugin_echo_canceller::{EchoCanceller, EchoCancellerSettings};
pub use plugin_filter::{FilterSettings, FirFilter};
pub use plugin_gain::{Gain, GainSettings};
