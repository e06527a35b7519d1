// ============================================================================
// Signal processing building blocks
// ============================================================================

pub mod block_adapter;
pub mod fir;
pub mod nlms;
pub mod partitioned;

pub use block_adapter::{Block, BlockAdapter};
pub use fir::FilterMode;
pub use nlms::Nlms;
pub use partitioned::{PartitionedConvolver, PathSpec};
