// ============================================================================
// Pipeline - ordered plugin chain for one direction
// ============================================================================
//
// Control threads add, remove and reorder plugins; the realtime thread runs
// the chain once per host period through `AudioGraph::dispatch`. A new order
// is staged and adopted by the realtime thread at the start of the next
// period, and the replaced order is handed back so it is dropped off the
// realtime path.

use super::{AudioGraph, PipelineType, ProcessCycle};
use crate::config::PluginConfig;
use crate::error::PluginError;
use crate::plugins::{EffectKind, Plugin, PluginContext};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

type Chain = Vec<Arc<dyn Plugin>>;

#[derive(Default)]
struct Staged {
    pending: Option<Chain>,
    retired: Option<Chain>,
}

/// State owned by the realtime thread
struct RtChain {
    order: Chain,
    out_left: Vec<f32>,
    out_right: Vec<f32>,
}

pub struct Pipeline {
    pipeline: PipelineType,
    graph: Arc<dyn AudioGraph>,
    max_period: usize,
    plugins: Mutex<Chain>,
    staged: Mutex<Staged>,
    rt: Mutex<RtChain>,
    relinks: AtomicU64,
}

impl Pipeline {
    pub fn new(graph: Arc<dyn AudioGraph>, pipeline: PipelineType, max_period: usize) -> Self {
        let max_period = max_period.max(1);
        Self {
            pipeline,
            graph,
            max_period,
            plugins: Mutex::new(Vec::new()),
            staged: Mutex::new(Staged::default()),
            rt: Mutex::new(RtChain {
                order: Vec::new(),
                out_left: vec![0.0; max_period],
                out_right: vec![0.0; max_period],
            }),
            relinks: AtomicU64::new(0),
        }
    }

    /// Build and connect a chain from configuration entries
    pub fn from_config(configs: &[PluginConfig], ctx: &PluginContext) -> Result<Self, PluginError> {
        let pipeline = Self::new(Arc::clone(&ctx.graph), ctx.pipeline, ctx.max_period);
        for config in configs {
            let kind: EffectKind = config.plugin_type.parse()?;
            let plugin = kind.instantiate(config, ctx)?;
            pipeline.add_plugin(plugin)?;
        }
        log::info!(
            "{} pipeline: {}",
            pipeline.pipeline.as_str(),
            pipeline.order().join(" -> ")
        );
        Ok(pipeline)
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.pipeline
    }

    pub fn len(&self) -> usize {
        self.plugins.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.lock().is_empty()
    }

    /// Connect, activate and append a plugin
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let mut plugins = self.plugins.lock();
        if plugins.iter().any(|p| p.tag() == plugin.tag()) {
            return Err(PluginError::Parameter(format!(
                "duplicate plugin tag '{}'",
                plugin.tag()
            )));
        }
        plugin.connect()?;
        if let Err(e) = plugin.set_active(true) {
            plugin.shutdown();
            return Err(e.into());
        }
        plugins.push(plugin);
        self.stage(plugins.clone());
        Ok(())
    }

    /// Remove a plugin and shut it down
    pub fn remove_plugin(&self, tag: &str) -> Option<Arc<dyn Plugin>> {
        let removed = {
            let mut plugins = self.plugins.lock();
            let index = plugins.iter().position(|p| p.tag() == tag)?;
            let removed = plugins.remove(index);
            self.stage(plugins.clone());
            removed
        };
        // deactivation waits for a callback that may still be running it
        removed.shutdown();
        Some(removed)
    }

    /// Reorder the chain
    ///
    /// `tags` must name every plugin exactly once. Returns false when the
    /// order is unchanged.
    pub fn set_order(&self, tags: &[&str]) -> Result<bool, PluginError> {
        let mut plugins = self.plugins.lock();
        if tags.len() != plugins.len() {
            return Err(PluginError::Parameter(format!(
                "order names {} plugins, the chain has {}",
                tags.len(),
                plugins.len()
            )));
        }
        let mut reordered = Vec::with_capacity(tags.len());
        for tag in tags {
            let plugin = plugins
                .iter()
                .find(|p| p.tag() == *tag)
                .ok_or_else(|| PluginError::Parameter(format!("unknown plugin tag '{tag}'")))?;
            if reordered.iter().any(|p: &Arc<dyn Plugin>| p.tag() == *tag) {
                return Err(PluginError::Parameter(format!("plugin tag '{tag}' repeated")));
            }
            reordered.push(Arc::clone(plugin));
        }
        let changed = reordered
            .iter()
            .zip(plugins.iter())
            .any(|(a, b)| a.tag() != b.tag());
        if changed {
            *plugins = reordered;
            self.stage(plugins.clone());
            log::debug!("{} pipeline reordered: {}", self.pipeline.as_str(), tags.join(" -> "));
        }
        Ok(changed)
    }

    fn stage(&self, chain: Chain) {
        let retired = {
            let mut staged = self.staged.lock();
            staged.pending = Some(chain);
            staged.retired.take()
        };
        drop(retired);
    }

    /// Tags in processing order
    pub fn order(&self) -> Vec<String> {
        self.plugins
            .lock()
            .iter()
            .map(|p| p.tag().to_string())
            .collect()
    }

    pub fn plugin(&self, tag: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.lock().iter().find(|p| p.tag() == tag).cloned()
    }

    /// Sum of the latencies announced by every plugin
    pub fn total_latency_seconds(&self) -> f32 {
        self.plugins.lock().iter().map(|p| p.latency_seconds()).sum()
    }

    /// Number of orders adopted by the realtime thread
    pub fn relink_count(&self) -> u64 {
        self.relinks.load(Ordering::Acquire)
    }

    /// Run the chain over one host period, in place
    ///
    /// Realtime entry point. Periods longer than the preallocated maximum
    /// are processed in equal chunks; plugins see the chunk size as their
    /// period even when the last chunk is shorter.
    pub fn process(
        &self,
        rate: u32,
        left: &mut [f32],
        right: &mut [f32],
        probe: Option<(&[f32], &[f32])>,
    ) {
        let mut guard = self.rt.lock();
        let rt = &mut *guard;

        // safe point: adopt a staged order before any sample is processed
        if let Some(mut staged) = self.staged.try_lock()
            && let Some(order) = staged.pending.take()
        {
            staged.retired = Some(std::mem::replace(&mut rt.order, order));
            self.relinks.fetch_add(1, Ordering::AcqRel);
        }

        let n = left.len().min(right.len());
        if n == 0 {
            return;
        }
        // equal chunks keep the negotiated period stable across calls
        let chunk = n.div_ceil(n.div_ceil(self.max_period));
        let mut offset = 0;
        while offset < n {
            let end = (offset + chunk).min(n);
            let chunk_probe = probe
                .filter(|(pl, pr)| pl.len() >= end && pr.len() >= end)
                .map(|(pl, pr)| (&pl[offset..end], &pr[offset..end]));
            self.process_chunk(
                rt,
                rate,
                chunk,
                &mut left[offset..end],
                &mut right[offset..end],
                chunk_probe,
            );
            offset = end;
        }
    }

    fn process_chunk(
        &self,
        rt: &mut RtChain,
        rate: u32,
        period: usize,
        left: &mut [f32],
        right: &mut [f32],
        probe: Option<(&[f32], &[f32])>,
    ) {
        let n = left.len();
        let RtChain {
            order,
            out_left,
            out_right,
        } = rt;

        for plugin in order.iter() {
            let Some(handle) = plugin.filter_handle() else {
                continue;
            };
            let out_l = &mut out_left[..n];
            let out_r = &mut out_right[..n];
            let mut cycle =
                ProcessCycle::new(rate, &*left, &*right, out_l, out_r).with_period(period);
            if plugin.has_probe()
                && let Some((pl, pr)) = probe
            {
                cycle = cycle.with_probe(pl, pr);
            }
            // inactive or unknown filters pass audio through
            if self.graph.dispatch(handle, &mut cycle) {
                left.copy_from_slice(&out_left[..n]);
                right.copy_from_slice(&out_right[..n]);
            }
        }
    }

    /// Shut every plugin down; the pipeline is empty afterwards
    pub fn shutdown(&self) {
        let plugins: Chain = {
            let mut plugins = self.plugins.lock();
            let drained = plugins.drain(..).collect();
            self.stage(Vec::new());
            drained
        };
        for plugin in &plugins {
            plugin.shutdown();
        }
        if !plugins.is_empty() {
            log::debug!("{} pipeline shut down", self.pipeline.as_str());
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Driver - the realtime thread
// ============================================================================

/// Audio source and sink of a driven pipeline
pub trait StreamEndpoint: Send + 'static {
    fn rate(&self) -> u32;

    /// Samples per channel in one period
    fn period(&self) -> usize;

    /// Fill one period of input; false ends the stream
    fn capture(&mut self, left: &mut [f32], right: &mut [f32]) -> bool;

    /// Consume one period of processed output
    fn playback(&mut self, left: &[f32], right: &[f32]);
}

/// Realtime thread calling `Pipeline::process` once per period
pub struct PipelineDriver {
    stop: Arc<AtomicBool>,
    periods: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl PipelineDriver {
    /// Spawn the realtime thread (`rt-input` or `rt-output`)
    pub fn spawn<E: StreamEndpoint>(
        pipeline: Arc<Pipeline>,
        mut endpoint: E,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let periods = Arc::new(AtomicU64::new(0));
        let name = format!("rt-{}", pipeline.pipeline_type().as_str());

        let thread_stop = Arc::clone(&stop);
        let thread_periods = Arc::clone(&periods);
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let rate = endpoint.rate();
            let period = endpoint.period();
            let mut left = vec![0.0_f32; period];
            let mut right = vec![0.0_f32; period];
            while !thread_stop.load(Ordering::Acquire) {
                if !endpoint.capture(&mut left, &mut right) {
                    break;
                }
                pipeline.process(rate, &mut left, &mut right, None);
                endpoint.playback(&left, &right);
                thread_periods.fetch_add(1, Ordering::AcqRel);
            }
        })?;
        log::debug!("{} started", name);

        Ok(Self {
            stop,
            periods,
            thread: Some(thread),
        })
    }

    /// Periods processed so far
    pub fn periods(&self) -> u64 {
        self.periods.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the thread and return the number of periods processed
    pub fn stop(&mut self) -> u64 {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("realtime thread panicked");
        }
        self.periods()
    }
}

impl Drop for PipelineDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
