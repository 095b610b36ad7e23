//! Crate-wide error type.

use crate::job::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid config document: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("node {0} is not in the configured membership")]
    UnknownNode(NodeId),

    #[error("no leader available")]
    NoLeader,

    #[error("pending queue is full")]
    QueueFull,

    #[error("peer {peer} unreachable: {source}")]
    PeerUnreachable {
        peer: NodeId,
        #[source]
        source: reqwest::Error,
    },

    #[error("step execution failed: {0}")]
    StepFailed(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
