use thiserror::Error;

/// Why this node cannot serve traffic right now.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReady {
    #[error("No shard allocated")]
    Unassigned,

    #[error("Coordination service unreachable")]
    CoordinationUnreachable,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Barrier error: {0}")]
    Barrier(String),

    #[error("Rebalance handler failed: {0}")]
    Handler(#[from] anyhow::Error),

    #[error("Not ready: {0}")]
    NotReady(#[from] NotReady),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn barrier(msg: impl Into<String>) -> Self {
        Self::Barrier(msg.into())
    }
}
