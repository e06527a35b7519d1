// ============================================================================
// LocalGraph - in-process audio graph
// ============================================================================
//
// Behaves like an asynchronous graph server: node ids and ports are published
// by a loop thread some time after `create_filter`, removal completes on the
// same thread, and deactivation waits for callbacks that are still running.

use super::{
    AudioGraph, FilterHandle, FilterState, GraphParam, NodeId, PortSpec, ProcessCycle,
    ProcessHandler, INVALID_NODE_ID,
};
use crate::error::GraphError;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Timing and failure knobs for [`LocalGraph`]
#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Delay before a new filter gets its node id
    pub registration_delay: Duration,
    /// Delay between two ports becoming visible
    pub port_delay: Duration,
    /// When false, node ids are never assigned (connect must time out)
    pub assign_node_ids: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            registration_delay: Duration::from_millis(2),
            port_delay: Duration::from_micros(200),
            assign_node_ids: true,
        }
    }
}

struct Filter {
    name: String,
    ports: Vec<PortSpec>,
    handler: Arc<dyn ProcessHandler>,
    node_id: AtomicU32,
    visible_ports: AtomicUsize,
    active: AtomicBool,
    state: Mutex<FilterState>,
    in_flight: RwLock<()>,
    params: Mutex<Vec<GraphParam>>,
}

impl Filter {
    fn transition(&self, new: FilterState, error: Option<&str>) {
        let old = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, new)
        };
        if old != new {
            log::debug!("{}: state changed {} -> {}", self.name, old, new);
            self.handler.state_changed(old, new, error);
        }
    }
}

enum LoopMsg {
    Register(Arc<Filter>),
    Remove(u64),
    Quit,
}

struct Shared {
    filters: RwLock<HashMap<u64, Arc<Filter>>>,
    next_node_id: AtomicU32,
}

/// In-process implementation of [`AudioGraph`]
pub struct LocalGraph {
    shared: Arc<Shared>,
    next_handle: AtomicU64,
    tx: Sender<LoopMsg>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LocalGraph {
    pub fn new() -> std::io::Result<Self> {
        Self::with_options(GraphOptions::default())
    }

    pub fn with_options(options: GraphOptions) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            filters: RwLock::new(HashMap::new()),
            next_node_id: AtomicU32::new(30),
        });
        let (tx, rx) = channel::unbounded();
        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("graph-loop".to_string())
            .spawn(move || Self::run_loop(loop_shared, rx, options))?;

        Ok(Self {
            shared,
            next_handle: AtomicU64::new(1),
            tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn run_loop(shared: Arc<Shared>, rx: Receiver<LoopMsg>, options: GraphOptions) {
        while let Ok(msg) = rx.recv() {
            match msg {
                LoopMsg::Register(filter) => {
                    if !options.assign_node_ids {
                        continue;
                    }
                    thread::sleep(options.registration_delay);
                    let id = shared.next_node_id.fetch_add(1, Ordering::Relaxed);
                    filter.node_id.store(id, Ordering::Release);
                    for _ in &filter.ports {
                        thread::sleep(options.port_delay);
                        filter.visible_ports.fetch_add(1, Ordering::Release);
                    }
                    if *filter.state.lock() == FilterState::Connecting {
                        filter.transition(FilterState::Paused, None);
                    }
                }
                LoopMsg::Remove(handle) => {
                    let removed = shared.filters.write().remove(&handle);
                    if let Some(filter) = removed {
                        filter.transition(FilterState::Unconnected, None);
                    }
                }
                LoopMsg::Quit => break,
            }
        }
    }

    fn filter(&self, handle: FilterHandle) -> Result<Arc<Filter>, GraphError> {
        self.shared
            .filters
            .read()
            .get(&handle.0)
            .cloned()
            .ok_or(GraphError::UnknownFilter(handle.0))
    }

    /// Parameters pushed by a filter, oldest first
    pub fn params(&self, handle: FilterHandle) -> Vec<GraphParam> {
        self.filter(handle)
            .map(|f| f.params.lock().clone())
            .unwrap_or_default()
    }

    /// Most recent latency announced by a filter, in nanoseconds
    pub fn latency_ns(&self, handle: FilterHandle) -> Option<u64> {
        self.params(handle).iter().rev().find_map(|p| match p {
            GraphParam::ProcessLatency { ns } => Some(*ns),
        })
    }

    /// Force a filter into the error state
    pub fn fail(&self, handle: FilterHandle, reason: &str) -> Result<(), GraphError> {
        let filter = self.filter(handle)?;
        filter.active.store(false, Ordering::Release);
        filter.transition(FilterState::Error, Some(reason));
        Ok(())
    }

    pub fn filter_count(&self) -> usize {
        self.shared.filters.read().len()
    }
}

impl AudioGraph for LocalGraph {
    fn create_filter(
        &self,
        name: &str,
        ports: Vec<PortSpec>,
        handler: Arc<dyn ProcessHandler>,
    ) -> Result<FilterHandle, GraphError> {
        if ports.is_empty() {
            return Err(GraphError::PortRegistration(format!("{name}: no ports")));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let filter = Arc::new(Filter {
            name: name.to_string(),
            ports,
            handler,
            node_id: AtomicU32::new(INVALID_NODE_ID),
            visible_ports: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            state: Mutex::new(FilterState::Unconnected),
            in_flight: RwLock::new(()),
            params: Mutex::new(Vec::new()),
        });
        self.shared
            .filters
            .write()
            .insert(handle, Arc::clone(&filter));
        filter.transition(FilterState::Connecting, None);

        self.tx
            .send(LoopMsg::Register(filter))
            .map_err(|_| GraphError::PortRegistration(format!("{name}: graph loop stopped")))?;
        Ok(FilterHandle(handle))
    }

    fn node_id(&self, filter: FilterHandle) -> Option<NodeId> {
        let id = self.filter(filter).ok()?.node_id.load(Ordering::Acquire);
        (id != INVALID_NODE_ID).then_some(id)
    }

    fn visible_ports(&self, filter: FilterHandle) -> usize {
        self.filter(filter)
            .map(|f| f.visible_ports.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn set_active(&self, filter: FilterHandle, active: bool) -> Result<(), GraphError> {
        let filter = self.filter(filter)?;
        if active {
            if *filter.state.lock() == FilterState::Error {
                return Ok(());
            }
            filter.active.store(true, Ordering::Release);
            filter.transition(FilterState::Streaming, None);
        } else {
            filter.active.store(false, Ordering::Release);
            // wait for the callback currently running, if any
            drop(filter.in_flight.write());
            if *filter.state.lock() == FilterState::Streaming {
                filter.transition(FilterState::Paused, None);
            }
        }
        Ok(())
    }

    fn state(&self, filter: FilterHandle) -> FilterState {
        self.filter(filter)
            .map(|f| *f.state.lock())
            .unwrap_or(FilterState::Unconnected)
    }

    fn update_params(&self, filter: FilterHandle, param: GraphParam) -> Result<(), GraphError> {
        let filter = self.filter(filter)?;
        log::debug!("{}: update params {:?}", filter.name, param);
        filter.params.lock().push(param);
        Ok(())
    }

    fn disconnect(&self, filter: FilterHandle) -> Result<(), GraphError> {
        let f = self.filter(filter)?;
        f.active.store(false, Ordering::Release);
        self.tx
            .send(LoopMsg::Remove(filter.0))
            .map_err(|_| GraphError::DisconnectTimeout(f.name.clone()))
    }

    fn dispatch(&self, filter: FilterHandle, cycle: &mut ProcessCycle<'_>) -> bool {
        let Some(filter) = self.shared.filters.read().get(&filter.0).cloned() else {
            return false;
        };
        let _guard = filter.in_flight.read();
        if !filter.active.load(Ordering::Acquire) {
            return false;
        }
        filter.handler.process(cycle);
        true
    }
}

impl Drop for LocalGraph {
    fn drop(&mut self) {
        let _ = self.tx.send(LoopMsg::Quit);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}
