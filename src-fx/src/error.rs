// ============================================================================
// Error types
// ============================================================================

use std::path::PathBuf;

/// Errors raised while acquiring or transforming impulse-response kernels
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("kernel name is empty")]
    EmptyName,

    #[error("kernel '{0}' not found")]
    NotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("unsupported channel count {0} (expected 1, 2 or 4)")]
    UnsupportedChannels(u16),

    #[error("kernel file contains no samples")]
    Empty,

    #[error("invalid kernel: {0}")]
    Invalid(String),

    #[error("spatial dataset error: {0}")]
    Spatial(String),

    #[error("resampling failed: {0}")]
    Resample(String),

    #[error("storage location unavailable: {0}")]
    Storage(#[from] rtfx_env::EnvError),
}

impl KernelError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KernelError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors at the audio graph boundary
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("filter '{name}' was not assigned a node id with {ports} visible ports after {attempts} attempts")]
    ConnectTimeout {
        name: String,
        ports: usize,
        attempts: u32,
    },

    #[error("filter '{0}' did not reach the unconnected state")]
    DisconnectTimeout(String),

    #[error("unknown filter handle {0}")]
    UnknownFilter(u64),

    #[error("port registration failed: {0}")]
    PortRegistration(String),

    #[error("plugin '{0}' is not connected to the graph")]
    NotConnected(String),
}

/// Errors from the partitioned convolution engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("block size must be at least 1")]
    InvalidBlockSize,

    #[error("engine has no paths or an empty impulse response")]
    EmptyKernel,

    #[error("mismatch in buffer sizes: expected {expected}, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("path references channel {0}, the engine has two")]
    InvalidChannel(usize),
}

/// Errors reported by plugins and their worker-side rebuilds
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unknown plugin type '{0}'")]
    UnknownPlugin(String),

    #[error("invalid parameter: {0}")]
    Parameter(String),

    #[error("invalid parameters for '{plugin}': {source}")]
    Parameters {
        plugin: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors while reading host configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Env(#[from] rtfx_env::EnvError),
}
