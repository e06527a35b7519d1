// ============================================================================
// Plugin factory
// ============================================================================

use super::node::PluginNode;
use super::plugin::{EffectSettings, Plugin, PluginEvent};
use super::plugin_convolver::Convolver;
use super::plugin_echo_canceller::EchoCanceller;
use super::plugin_filter::FirFilter;
use super::plugin_gain::Gain;
use crate::config::{HostConfig, PluginConfig};
use crate::error::PluginError;
use crate::graph::{AudioGraph, PipelineType};
use crate::kernel::KernelManager;
use crate::worker::WorkerHandle;
use crossbeam::channel::Sender;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Sample rate assumed until the graph reports one
pub const DEFAULT_RATE: u32 = 48000;

/// Collaborators handed to every plugin of a pipeline
#[derive(Clone)]
pub struct PluginContext {
    pub graph: Arc<dyn AudioGraph>,
    pub worker: WorkerHandle,
    pub kernels: Arc<KernelManager>,
    pub events: Option<Sender<PluginEvent>>,
    pub pipeline: PipelineType,
    pub rate: u32,
    pub max_period: usize,
    pub connect_retries: u32,
    pub connect_retry_interval: Duration,
}

impl PluginContext {
    pub fn new(
        graph: Arc<dyn AudioGraph>,
        worker: WorkerHandle,
        kernels: Arc<KernelManager>,
        pipeline: PipelineType,
        config: &HostConfig,
    ) -> Self {
        Self {
            graph,
            worker,
            kernels,
            events: None,
            pipeline,
            rate: DEFAULT_RATE,
            max_period: config.max_period,
            connect_retries: config.connect_retries,
            connect_retry_interval: config.connect_retry_interval(),
        }
    }

    pub fn with_events(mut self, events: Sender<PluginEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }
}

/// Closed set of effects a chain entry can name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Convolver,
    Filter,
    EchoCanceller,
    Gain,
}

impl EffectKind {
    pub const ALL: [EffectKind; 4] = [
        EffectKind::Convolver,
        EffectKind::Filter,
        EffectKind::EchoCanceller,
        EffectKind::Gain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::Convolver => "convolver",
            EffectKind::Filter => "filter",
            EffectKind::EchoCanceller => "echo_canceller",
            EffectKind::Gain => "gain",
        }
    }

    /// Build a plugin instance for a chain entry
    pub fn instantiate(
        &self,
        config: &PluginConfig,
        ctx: &PluginContext,
    ) -> Result<Arc<dyn Plugin>, PluginError> {
        let tag = config.tag();
        let plugin: Arc<dyn Plugin> = match self {
            EffectKind::Convolver => PluginNode::new(
                Convolver::new(Arc::clone(&ctx.kernels), ctx.max_period),
                parse_settings(tag, &config.parameters)?,
                tag,
                ctx,
            ),
            EffectKind::Filter => PluginNode::new(
                FirFilter::new(ctx.max_period),
                parse_settings(tag, &config.parameters)?,
                tag,
                ctx,
            ),
            EffectKind::EchoCanceller => PluginNode::new(
                EchoCanceller::new(ctx.max_period),
                parse_settings(tag, &config.parameters)?,
                tag,
                ctx,
            ),
            EffectKind::Gain => {
                PluginNode::new(Gain::new(), parse_settings(tag, &config.parameters)?, tag, ctx)
            }
        };
        log::debug!(
            "created {} plugin '{}' on the {} pipeline",
            self,
            tag,
            ctx.pipeline.as_str()
        );
        Ok(plugin)
    }
}

fn parse_settings<S: EffectSettings>(tag: &str, parameters: &serde_json::Value) -> Result<S, PluginError> {
    serde_json::from_value(parameters.clone()).map_err(|source| PluginError::Parameters {
        plugin: tag.to_string(),
        source,
    })
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EffectKind {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EffectKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| PluginError::UnknownPlugin(s.to_string()))
    }
}
