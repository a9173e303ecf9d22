//! Placement protocol error types.

use keyplace_core::NodeId;
use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("message from {0}, which is not in the member view")]
    UnknownSender(NodeId),

    #[error("message from the local node to itself")]
    SelfAddressed,

    #[error("membership changed during round {round}; round aborted")]
    TopologyChanged { round: u64 },

    #[error("round {round} is beyond this node's window (latest accepted {limit})")]
    RoundOutOfWindow { round: u64, limit: u64 },

    #[error("invalid placement configuration: {0}")]
    Config(#[from] keyplace_core::CoreError),

    #[error("ownership resolver failed: {0}")]
    Resolver(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("migration executor failed: {0}")]
    Executor(String),

    #[error("relocation index error: {0}")]
    Index(#[from] keyplace_index::IndexError),
}
