// ============================================================================
// Audio graph boundary
// ============================================================================
//
// The graph owns scheduling and port buffers. Plugins register a filter node
// with mono f32 ports, receive one `ProcessCycle` per host period and push
// control parameters (latency) back through `update_params`.

use crate::error::GraphError;
use std::fmt;
use std::sync::Arc;

pub mod local;
pub mod pipeline;

pub use local::{GraphOptions, LocalGraph};
pub use pipeline::{Pipeline, PipelineDriver, StreamEndpoint};

/// Node identifier assigned by the graph
pub type NodeId = u32;

/// Placeholder until the graph assigns a real id
pub const INVALID_NODE_ID: NodeId = u32::MAX;

/// Opaque handle to a filter created through [`AudioGraph::create_filter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterHandle(pub u64);

/// Connection state of a filter node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Unconnected,
    Connecting,
    Paused,
    Streaming,
    Error,
}

impl fmt::Display for FilterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterState::Unconnected => "unconnected",
            FilterState::Connecting => "connecting",
            FilterState::Paused => "paused",
            FilterState::Streaming => "streaming",
            FilterState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Which side of the graph a pipeline sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineType {
    /// Capture path (microphone → applications)
    Input,
    /// Render path (applications → speakers)
    Output,
}

impl PipelineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::Input => "input",
            PipelineType::Output => "output",
        }
    }
}

/// Role of a port on a stereo filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    InLeft,
    InRight,
    OutLeft,
    OutRight,
    ProbeLeft,
    ProbeRight,
}

impl PortRole {
    pub fn is_input(&self) -> bool {
        !matches!(self, PortRole::OutLeft | PortRole::OutRight)
    }

    pub fn port_name(&self) -> &'static str {
        match self {
            PortRole::InLeft => "input_FL",
            PortRole::InRight => "input_FR",
            PortRole::OutLeft => "output_FL",
            PortRole::OutRight => "output_FR",
            PortRole::ProbeLeft => "probe_FL",
            PortRole::ProbeRight => "probe_FR",
        }
    }
}

/// One mono 32-bit float port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    pub role: PortRole,
}

impl PortSpec {
    /// The four mandatory stereo ports, plus the probe pair when requested
    pub fn stereo(with_probe: bool) -> Vec<PortSpec> {
        let mut roles = vec![
            PortRole::InLeft,
            PortRole::InRight,
            PortRole::OutLeft,
            PortRole::OutRight,
        ];
        if with_probe {
            roles.extend([PortRole::ProbeLeft, PortRole::ProbeRight]);
        }
        roles
            .into_iter()
            .map(|role| PortSpec {
                name: role.port_name().to_string(),
                role,
            })
            .collect()
    }
}

/// Control parameters pushed to the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphParam {
    /// Processing latency in nanoseconds
    ProcessLatency { ns: u64 },
}

impl GraphParam {
    pub fn process_latency(seconds: f32) -> Self {
        let ns = (seconds.max(0.0) as f64 * 1e9).round() as u64;
        GraphParam::ProcessLatency { ns }
    }
}

/// Buffers for one host period
///
/// Any port may be `None` when the graph has no buffer for it this cycle.
/// `n_samples` is the negotiated period; buffers may be shorter.
pub struct ProcessCycle<'a> {
    pub rate: u32,
    pub n_samples: usize,
    pub in_left: Option<&'a [f32]>,
    pub in_right: Option<&'a [f32]>,
    pub out_left: Option<&'a mut [f32]>,
    pub out_right: Option<&'a mut [f32]>,
    pub probe_left: Option<&'a [f32]>,
    pub probe_right: Option<&'a [f32]>,
}

impl<'a> ProcessCycle<'a> {
    pub fn new(
        rate: u32,
        in_left: &'a [f32],
        in_right: &'a [f32],
        out_left: &'a mut [f32],
        out_right: &'a mut [f32],
    ) -> Self {
        Self {
            rate,
            n_samples: in_left.len(),
            in_left: Some(in_left),
            in_right: Some(in_right),
            out_left: Some(out_left),
            out_right: Some(out_right),
            probe_left: None,
            probe_right: None,
        }
    }

    pub fn with_probe(mut self, probe_left: &'a [f32], probe_right: &'a [f32]) -> Self {
        self.probe_left = Some(probe_left);
        self.probe_right = Some(probe_right);
        self
    }

    /// Negotiated period when the buffers hold a shorter final chunk
    pub fn with_period(mut self, n_samples: usize) -> Self {
        self.n_samples = n_samples;
        self
    }
}

/// Callbacks the graph invokes on a filter
pub trait ProcessHandler: Send + Sync {
    /// Realtime callback, once per host period
    fn process(&self, cycle: &mut ProcessCycle<'_>);

    /// State transition notification (non-realtime)
    fn state_changed(&self, old: FilterState, new: FilterState, error: Option<&str>) {
        let _ = (old, new, error);
    }
}

/// Contract of the external audio graph
pub trait AudioGraph: Send + Sync {
    /// Register a filter node and its ports
    ///
    /// Node id and ports become visible asynchronously; callers poll
    /// [`AudioGraph::node_id`] and [`AudioGraph::visible_ports`].
    fn create_filter(
        &self,
        name: &str,
        ports: Vec<PortSpec>,
        handler: Arc<dyn ProcessHandler>,
    ) -> Result<FilterHandle, GraphError>;

    fn node_id(&self, filter: FilterHandle) -> Option<NodeId>;

    fn visible_ports(&self, filter: FilterHandle) -> usize;

    /// Start or stop realtime callbacks. Deactivation returns only after the
    /// last in-flight callback has completed.
    fn set_active(&self, filter: FilterHandle, active: bool) -> Result<(), GraphError>;

    fn state(&self, filter: FilterHandle) -> FilterState;

    /// Push a control parameter (never the data path)
    fn update_params(&self, filter: FilterHandle, param: GraphParam) -> Result<(), GraphError>;

    /// Remove the listener; the filter reaches `Unconnected` asynchronously
    fn disconnect(&self, filter: FilterHandle) -> Result<(), GraphError>;

    /// Run one filter's process callback for the current period
    ///
    /// Returns false when the filter is unknown or inactive.
    fn dispatch(&self, filter: FilterHandle, cycle: &mut ProcessCycle<'_>) -> bool;
}
