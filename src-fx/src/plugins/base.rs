// ============================================================================
// Plugin Base - state shared by every plugin instance
// ============================================================================
//
// Format atomics, readiness, rebuild bookkeeping and the graph connection.
// Fields touched from the realtime thread are atomics; the rest is only used
// from control threads and the worker.

use super::plugin::{PluginEvent, PluginInfo, StreamFormat};
use super::kind::PluginContext;
use crate::error::GraphError;
use crate::graph::{
    AudioGraph, FilterHandle, FilterState, GraphParam, NodeId, PipelineType, PortSpec,
    ProcessHandler,
};
use crate::util::LogOnce;
use crate::worker::{Deferred, WorkerHandle};
use crossbeam::channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

const NO_FILTER: u64 = u64::MAX;

pub struct PluginBase {
    pub(crate) tag: String,
    pub(crate) info: PluginInfo,
    pub(crate) pipeline: PipelineType,
    pub(crate) max_period: usize,
    with_probe: bool,

    rate: AtomicU32,
    n_samples: AtomicUsize,
    pub(crate) bypass: AtomicBool,
    pub(crate) ready: AtomicBool,
    pub(crate) destroyed: AtomicBool,

    /// A rebuild was requested and has not been picked up by the worker
    pub(crate) rebuild_pending: AtomicBool,
    /// Bumped by every rebuild request; stale builds are discarded
    pub(crate) generation: AtomicU64,
    pub(crate) latency_pending: AtomicBool,
    pub(crate) engine_failed: AtomicBool,
    /// A submission was dropped on a full queue; retried next period
    resubmit: AtomicBool,
    latency_bits: AtomicU32,
    announced_frames: AtomicUsize,

    pub(crate) missing_input: LogOnce,
    pub(crate) missing_output: LogOnce,
    pub(crate) oversized_period: LogOnce,
    pub(crate) queue_full: LogOnce,

    filter: AtomicU64,
    graph: Arc<dyn AudioGraph>,
    pub(crate) worker: WorkerHandle,
    events: Option<Sender<PluginEvent>>,
    connect_retries: u32,
    retry_interval: Duration,
}

impl PluginBase {
    pub fn new(tag: &str, info: PluginInfo, with_probe: bool, ctx: &PluginContext) -> Self {
        Self {
            tag: tag.to_string(),
            info,
            pipeline: ctx.pipeline,
            max_period: ctx.max_period.max(1),
            with_probe,
            rate: AtomicU32::new(ctx.rate),
            n_samples: AtomicUsize::new(0),
            bypass: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            rebuild_pending: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            latency_pending: AtomicBool::new(false),
            engine_failed: AtomicBool::new(false),
            resubmit: AtomicBool::new(false),
            latency_bits: AtomicU32::new(0.0_f32.to_bits()),
            announced_frames: AtomicUsize::new(0),
            missing_input: LogOnce::new(),
            missing_output: LogOnce::new(),
            oversized_period: LogOnce::new(),
            queue_full: LogOnce::new(),
            filter: AtomicU64::new(NO_FILTER),
            graph: Arc::clone(&ctx.graph),
            worker: ctx.worker.clone(),
            events: ctx.events.clone(),
            connect_retries: ctx.connect_retries,
            retry_interval: ctx.connect_retry_interval,
        }
    }

    pub fn with_probe(&self) -> bool {
        self.with_probe
    }

    pub fn format(&self) -> StreamFormat {
        StreamFormat {
            rate: self.rate.load(Ordering::Acquire),
            n_samples: self.n_samples.load(Ordering::Acquire),
        }
    }

    /// Record the format of the current cycle; true when it changed
    pub fn store_format(&self, rate: u32, n_samples: usize) -> bool {
        let old_rate = self.rate.swap(rate, Ordering::AcqRel);
        let old_n = self.n_samples.swap(n_samples, Ordering::AcqRel);
        old_rate != rate || old_n != n_samples
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Post a deferred task; realtime safe
    ///
    /// A full queue leaves the pending flags set and marks the task for
    /// [`PluginBase::take_resubmit`].
    pub fn submit(&self, target: Weak<dyn Deferred>) -> bool {
        if self.worker.submit(target) {
            return true;
        }
        self.resubmit.store(true, Ordering::Release);
        if self.queue_full.first() {
            log::warn!("{}: worker queue is full, retrying next period", self.tag);
        }
        false
    }

    /// True once after a dropped submission
    pub fn take_resubmit(&self) -> bool {
        self.resubmit.swap(false, Ordering::AcqRel)
    }

    pub fn emit(&self, event: PluginEvent) {
        if let Some(events) = &self.events
            && events.try_send(event).is_err()
        {
            log::trace!("{}: event channel full", self.tag);
        }
    }

    pub fn latency_seconds(&self) -> f32 {
        f32::from_bits(self.latency_bits.load(Ordering::Acquire))
    }

    /// Push a new latency to the graph and the event channel
    ///
    /// Nothing is sent when `frames` equals the last announced value.
    pub fn announce_latency(&self, frames: usize) {
        if self.announced_frames.swap(frames, Ordering::AcqRel) == frames {
            return;
        }
        let rate = self.rate.load(Ordering::Acquire);
        let seconds = if rate == 0 {
            0.0
        } else {
            frames as f32 / rate as f32
        };
        self.latency_bits.store(seconds.to_bits(), Ordering::Release);

        if let Some(handle) = self.filter_handle()
            && let Err(e) = self
                .graph
                .update_params(handle, GraphParam::process_latency(seconds))
        {
            log::debug!("{}: latency update not delivered: {}", self.tag, e);
        }
        log::debug!(
            "{}: latency {} frames ({:.2} ms)",
            self.tag,
            frames,
            seconds * 1000.0
        );
        self.emit(PluginEvent::LatencyChanged {
            tag: self.tag.clone(),
            seconds,
        });
    }

    // ------------------------------------------------------------------------
    // Graph connection
    // ------------------------------------------------------------------------

    pub fn filter_handle(&self) -> Option<FilterHandle> {
        match self.filter.load(Ordering::Acquire) {
            NO_FILTER => None,
            h => Some(FilterHandle(h)),
        }
    }

    /// Register the filter and poll until its node id and ports are visible
    pub fn connect(&self, handler: Arc<dyn ProcessHandler>) -> Result<(), GraphError> {
        if self.filter_handle().is_some() {
            return Ok(());
        }
        let ports = PortSpec::stereo(self.with_probe);
        let expected = ports.len();
        let handle = self.graph.create_filter(&self.tag, ports, handler)?;

        for _ in 0..self.connect_retries {
            if let Some(id) = self.graph.node_id(handle)
                && self.graph.visible_ports(handle) == expected
            {
                self.filter.store(handle.0, Ordering::Release);
                log::debug!(
                    "{}: connected as node {} ({} pipeline, {} ports)",
                    self.tag,
                    id,
                    self.pipeline.as_str(),
                    expected
                );
                return Ok(());
            }
            thread::sleep(self.retry_interval);
        }

        if let Err(e) = self.graph.disconnect(handle) {
            log::debug!("{}: cleanup after failed connect: {}", self.tag, e);
        }
        Err(GraphError::ConnectTimeout {
            name: self.tag.clone(),
            ports: expected,
            attempts: self.connect_retries,
        })
    }

    /// Deactivate, remove the listener and wait for `Unconnected`
    pub fn disconnect(&self) -> Result<(), GraphError> {
        let handle = match self.filter.swap(NO_FILTER, Ordering::AcqRel) {
            NO_FILTER => return Err(GraphError::NotConnected(self.tag.clone())),
            h => FilterHandle(h),
        };
        self.graph.set_active(handle, false)?;
        self.graph.disconnect(handle)?;

        for _ in 0..self.connect_retries {
            if self.graph.state(handle) == FilterState::Unconnected {
                log::debug!("{}: disconnected", self.tag);
                return Ok(());
            }
            thread::sleep(self.retry_interval);
        }
        Err(GraphError::DisconnectTimeout(self.tag.clone()))
    }

    pub fn set_active(&self, active: bool) -> Result<(), GraphError> {
        let handle = self
            .filter_handle()
            .ok_or_else(|| GraphError::NotConnected(self.tag.clone()))?;
        self.graph.set_active(handle, active)
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.graph.node_id(self.filter_handle()?)
    }

    pub fn state(&self) -> FilterState {
        match self.filter_handle() {
            Some(handle) => self.graph.state(handle),
            None => FilterState::Unconnected,
        }
    }
}
