// ============================================================================
// Plugin Node - binds an Effect to the graph, the worker and its settings
// ============================================================================
//
// Realtime path: format check, buffer substitution, gains, effect.
// Worker path: rebuilds (snapshot under the lock, build outside it, swap under
// it), latency announcements and retirement of old resources.

use super::base::PluginBase;
use super::kind::PluginContext;
use super::plugin::{
    AudioBuffers, Effect, EffectSettings, Plugin, PluginEvent, PluginInfo, Reaction, StreamFormat,
};
use crate::error::{GraphError, PluginError};
use crate::graph::{FilterHandle, FilterState, NodeId, PipelineType, ProcessCycle, ProcessHandler};
use crate::settings::{ALL_KEYS, Settings, Subscription};
use crate::util::{apply_gain, db_to_linear};
use crate::worker::Deferred;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// Everything behind the data lock
struct Slot<E> {
    effect: E,
    input_gain: f32,
    output_gain: f32,
    zeros: Vec<f32>,
    scratch_left: Vec<f32>,
    scratch_right: Vec<f32>,
}

/// A plugin instance running effect `E`
pub struct PluginNode<E: Effect> {
    base: PluginBase,
    slot: Mutex<Slot<E>>,
    settings: Settings<E::Settings>,
    _subscription: Subscription,
    weak_self: Weak<PluginNode<E>>,
}

/// Graph-facing handler; holds the node weakly so the graph does not keep it alive
struct NodeHandler<E: Effect> {
    node: Weak<PluginNode<E>>,
}

impl<E: Effect> ProcessHandler for NodeHandler<E> {
    fn process(&self, cycle: &mut ProcessCycle<'_>) {
        if let Some(node) = self.node.upgrade() {
            node.on_process(cycle);
        }
    }

    fn state_changed(&self, old: FilterState, new: FilterState, error: Option<&str>) {
        if let Some(node) = self.node.upgrade() {
            match (new, error) {
                (FilterState::Error, Some(reason)) => {
                    log::warn!("{}: filter error: {}", node.base.tag, reason)
                }
                _ => log::debug!("{}: filter {} -> {}", node.base.tag, old, new),
            }
        }
    }
}

impl<E: Effect> PluginNode<E> {
    /// Create a node; DSP state is built on the worker after the first `setup`
    ///
    /// # Arguments
    /// * `effect` - The effect implementation
    /// * `initial` - Initial settings; `reset` restores `E::Settings::default()`
    /// * `tag` - Stable name, unique within a pipeline
    /// * `ctx` - Graph, worker and host-wide limits
    pub fn new(effect: E, initial: E::Settings, tag: &str, ctx: &PluginContext) -> Arc<Self> {
        let info = effect.info();
        let with_probe = effect.uses_probe();
        let max_period = ctx.max_period.max(1);
        let settings = Settings::new(initial);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let callback_target = weak.clone();
            let subscription = settings.subscribe(move |s: &E::Settings, key| {
                if let Some(node) = callback_target.upgrade() {
                    node.on_settings(s, key);
                }
            });

            let base = PluginBase::new(tag, info, with_probe, ctx);
            let mut slot = Slot {
                effect,
                input_gain: 1.0,
                output_gain: 1.0,
                zeros: vec![0.0; max_period],
                scratch_left: vec![0.0; max_period],
                scratch_right: vec![0.0; max_period],
            };
            let current = settings.get();
            Self::apply_common(&base, &mut slot, &current);
            slot.effect.apply_settings(&current, ALL_KEYS);

            Self {
                base,
                slot: Mutex::new(slot),
                settings,
                _subscription: subscription,
                weak_self: weak.clone(),
            }
        })
    }

    /// Settings object shared with the configuration layer
    pub fn settings(&self) -> &Settings<E::Settings> {
        &self.settings
    }

    /// Run `f` with the effect under the data lock
    pub fn with_effect<R>(&self, f: impl FnOnce(&E) -> R) -> R {
        f(&self.slot.lock().effect)
    }

    fn deferred(&self) -> Weak<dyn Deferred> {
        self.weak_self.clone()
    }

    fn apply_common(base: &PluginBase, slot: &mut Slot<E>, settings: &E::Settings) {
        let common = settings.common();
        base.bypass.store(common.bypass, Ordering::Release);
        slot.input_gain = db_to_linear(common.input_gain_db);
        slot.output_gain = db_to_linear(common.output_gain_db);
    }

    fn on_settings(&self, settings: &E::Settings, key: &str) {
        let reaction = {
            let mut slot = self.slot.lock();
            Self::apply_common(&self.base, &mut slot, settings);
            slot.effect.apply_settings(settings, key)
        };
        match reaction {
            Reaction::None => {}
            Reaction::Rebuild => self.request_rebuild(),
            Reaction::Clear => Plugin::clear_data(self),
        }
    }

    /// Schedule a rebuild without dropping readiness
    fn request_rebuild(&self) {
        self.base.generation.fetch_add(1, Ordering::AcqRel);
        if !self.base.rebuild_pending.swap(true, Ordering::AcqRel) {
            self.base.submit(self.deferred());
        }
    }

    // ------------------------------------------------------------------------
    // Realtime path
    // ------------------------------------------------------------------------

    fn on_process(&self, cycle: &mut ProcessCycle<'_>) {
        if cycle.n_samples > self.base.max_period && self.base.oversized_period.first() {
            log::warn!(
                "{}: period {} exceeds the preallocated {} samples",
                self.base.tag,
                cycle.n_samples,
                self.base.max_period
            );
        }
        // the format follows the negotiated period, not this block's length
        let period = cycle.n_samples.min(self.base.max_period);
        let mut n = period;
        for len in [
            cycle.in_left.map(<[f32]>::len),
            cycle.in_right.map(<[f32]>::len),
            cycle.out_left.as_deref().map(<[f32]>::len),
            cycle.out_right.as_deref().map(<[f32]>::len),
        ]
        .into_iter()
        .flatten()
        {
            n = n.min(len);
        }
        if n == 0 {
            return;
        }

        if self.base.take_resubmit() {
            self.base.submit(self.deferred());
        }
        if self.base.store_format(cycle.rate, period) {
            Plugin::setup(self);
        }

        let mut guard = self.slot.lock();
        let slot = &mut *guard;

        if (cycle.in_left.is_none() || cycle.in_right.is_none()) && self.base.missing_input.first()
        {
            log::warn!("{}: missing input buffer, using silence", self.base.tag);
        }
        if (cycle.out_left.is_none() || cycle.out_right.is_none())
            && self.base.missing_output.first()
        {
            log::warn!("{}: missing output buffer, using scratch", self.base.tag);
        }

        let zeros = &slot.zeros[..n];
        let in_left = cycle.in_left.map_or(zeros, |b| &b[..n]);
        let in_right = cycle.in_right.map_or(zeros, |b| &b[..n]);
        let out_left: &mut [f32] = match cycle.out_left.as_deref_mut() {
            Some(b) => &mut b[..n],
            None => &mut slot.scratch_left[..n],
        };
        let out_right: &mut [f32] = match cycle.out_right.as_deref_mut() {
            Some(b) => &mut b[..n],
            None => &mut slot.scratch_right[..n],
        };

        out_left.copy_from_slice(in_left);
        out_right.copy_from_slice(in_right);

        if self.base.bypass.load(Ordering::Acquire) || !self.base.is_ready() {
            return;
        }

        let probe = if self.base.with_probe() {
            let left = cycle.probe_left.filter(|b| b.len() >= n).map(|b| &b[..n]);
            let right = cycle.probe_right.filter(|b| b.len() >= n).map(|b| &b[..n]);
            if (left.is_none() || right.is_none()) && self.base.missing_input.first() {
                log::warn!("{}: missing probe buffer, using silence", self.base.tag);
            }
            Some((left.unwrap_or(zeros), right.unwrap_or(zeros)))
        } else {
            None
        };

        apply_gain(out_left, slot.input_gain);
        apply_gain(out_right, slot.input_gain);

        let result = slot.effect.process(AudioBuffers {
            left: &mut *out_left,
            right: &mut *out_right,
            probe,
        });

        if result.is_err() {
            // pass-through until the worker rebuilds
            out_left.copy_from_slice(in_left);
            out_right.copy_from_slice(in_right);
            self.base.ready.store(false, Ordering::Release);
            self.base.engine_failed.store(true, Ordering::Release);
            self.base.submit(self.deferred());
            return;
        }

        apply_gain(out_left, slot.output_gain);
        apply_gain(out_right, slot.output_gain);

        if slot.effect.take_latency_change().is_some() {
            self.base.latency_pending.store(true, Ordering::Release);
            self.base.submit(self.deferred());
        }
    }

    // ------------------------------------------------------------------------
    // Worker path
    // ------------------------------------------------------------------------

    fn rebuild(&self) {
        while self.base.rebuild_pending.swap(false, Ordering::AcqRel) {
            let generation = self.base.generation.load(Ordering::Acquire);
            let format = self.base.format();
            if !format.is_valid() {
                return;
            }

            let job = self.slot.lock().effect.prepare(format);
            let Some(job) = job else {
                self.finish_rebuild(generation, None);
                continue;
            };

            let result = E::build(job);
            if self.base.is_destroyed() {
                return;
            }
            self.finish_rebuild(generation, Some(result));
        }
    }

    fn finish_rebuild(
        &self,
        generation: u64,
        result: Option<Result<E::Resources, PluginError>>,
    ) {
        let (notice, latency, ready, retired) = {
            let mut slot = self.slot.lock();
            if self.base.generation.load(Ordering::Acquire) != generation {
                // superseded; the pending flag is already set again
                log::trace!("{}: discarding stale rebuild", self.base.tag);
                return;
            }
            let (ready, retired) = match result {
                None => (true, None),
                Some(Ok(resources)) => (true, slot.effect.install(resources)),
                Some(Err(e)) => {
                    log::debug!("{}: rebuild failed: {}", self.base.tag, e);
                    slot.effect.build_failed(&e);
                    (false, None)
                }
            };
            self.base.ready.store(ready, Ordering::Release);
            (
                slot.effect.take_notice(),
                slot.effect.latency_frames(),
                ready,
                retired,
            )
        };

        drop(retired);
        if let Some(notice) = notice {
            self.base.emit(notice.into_event(&self.base.tag));
        }
        if ready {
            log::debug!("{}: ready", self.base.tag);
            self.base.emit(PluginEvent::Ready {
                tag: self.base.tag.clone(),
            });
        }
        self.base.announce_latency(latency);
    }
}

impl<E: Effect> Deferred for PluginNode<E> {
    fn run_deferred(&self) {
        if self.base.is_destroyed() {
            return;
        }
        if self.base.engine_failed.swap(false, Ordering::AcqRel) {
            let reason = "engine rejected a block";
            log::warn!("{}: {}, passing audio through", self.base.tag, reason);
            self.base.emit(PluginEvent::EngineFailed {
                tag: self.base.tag.clone(),
                reason: reason.to_string(),
            });
            self.request_rebuild();
        }
        if self.base.rebuild_pending.load(Ordering::Acquire) {
            self.rebuild();
        }
        if self.base.latency_pending.swap(false, Ordering::AcqRel) {
            let frames = self.slot.lock().effect.latency_frames();
            self.base.announce_latency(frames);
        }
    }
}

impl<E: Effect> Plugin for PluginNode<E> {
    fn info(&self) -> PluginInfo {
        self.base.info.clone()
    }

    fn tag(&self) -> &str {
        &self.base.tag
    }

    fn pipeline_type(&self) -> PipelineType {
        self.base.pipeline
    }

    fn setup(&self) {
        self.base.ready.store(false, Ordering::Release);
        let format: StreamFormat = self.base.format();
        self.slot.lock().effect.invalidate(format);
        self.request_rebuild();
    }

    fn process(
        &self,
        left_in: Option<&[f32]>,
        right_in: Option<&[f32]>,
        left_out: Option<&mut [f32]>,
        right_out: Option<&mut [f32]>,
    ) {
        self.process_with_probe(left_in, right_in, left_out, right_out, None, None);
    }

    fn process_with_probe(
        &self,
        left_in: Option<&[f32]>,
        right_in: Option<&[f32]>,
        left_out: Option<&mut [f32]>,
        right_out: Option<&mut [f32]>,
        probe_left: Option<&[f32]>,
        probe_right: Option<&[f32]>,
    ) {
        let n_samples = [
            left_in.map(<[f32]>::len),
            right_in.map(<[f32]>::len),
            left_out.as_deref().map(<[f32]>::len),
            right_out.as_deref().map(<[f32]>::len),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0);

        let mut cycle = ProcessCycle {
            rate: self.base.format().rate,
            n_samples,
            in_left: left_in,
            in_right: right_in,
            out_left: left_out,
            out_right: right_out,
            probe_left,
            probe_right,
        };
        self.on_process(&mut cycle);
    }

    fn reset(&self) {
        self.settings.reset();
    }

    fn clear_data(&self) {
        self.slot.lock().effect.clear_data();
        self.base.latency_pending.store(true, Ordering::Release);
        self.base.submit(self.deferred());
    }

    fn latency_seconds(&self) -> f32 {
        self.base.latency_seconds()
    }

    fn connect(&self) -> Result<(), GraphError> {
        let handler: Arc<dyn ProcessHandler> = Arc::new(NodeHandler {
            node: self.weak_self.clone(),
        });
        self.base.connect(handler)
    }

    fn disconnect(&self) -> Result<(), GraphError> {
        self.base.disconnect()
    }

    fn set_active(&self, active: bool) -> Result<(), GraphError> {
        self.base.set_active(active)
    }

    fn node_id(&self) -> Option<NodeId> {
        self.base.node_id()
    }

    fn state(&self) -> FilterState {
        self.base.state()
    }

    fn is_ready(&self) -> bool {
        self.base.is_ready()
    }

    fn is_bypassed(&self) -> bool {
        self.base.bypass.load(Ordering::Acquire)
    }

    fn filter_handle(&self) -> Option<FilterHandle> {
        self.base.filter_handle()
    }

    fn has_probe(&self) -> bool {
        self.base.with_probe()
    }

    fn set_parameters(&self, parameters: &serde_json::Value) -> Result<(), PluginError> {
        let value: E::Settings =
            serde_json::from_value(parameters.clone()).map_err(|source| PluginError::Parameters {
                plugin: self.base.tag.clone(),
                source,
            })?;
        self.settings.replace(value);
        Ok(())
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::to_value(self.settings.get()).unwrap_or(serde_json::Value::Null)
    }

    fn shutdown(&self) {
        if self.base.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.base.disconnect() {
            Ok(()) | Err(GraphError::NotConnected(_)) => {}
            Err(e) => log::warn!("{}: disconnect during shutdown failed: {}", self.base.tag, e),
        }
        let released = {
            let mut slot = self.slot.lock();
            self.base.ready.store(false, Ordering::Release);
            slot.effect.release()
        };
        if let Some(resources) = released {
            self.base.worker.retire(resources);
        }
        log::debug!("{}: shut down", self.base.tag);
    }
}

impl<E: Effect> Drop for PluginNode<E> {
    fn drop(&mut self) {
        if !self.base.is_destroyed() {
            Plugin::shutdown(self);
        }
    }
}
