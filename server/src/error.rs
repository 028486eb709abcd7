use thiserror::Error;

/// Failures turning frames into envelopes and back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("binary frame is not valid UTF-8")]
    Binary,
}

/// The Hub mailbox is no longer accepting commands.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub mailbox closed")]
    Closed,
}

/// Rejected configuration values. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("session.queue_capacity ({got}) must be at least {min}")]
    QueueTooSmall { got: usize, min: usize },

    #[error("ping interval ({ping}s) must be shorter than pong timeout ({pong}s)")]
    PingNotShorterThanPong { ping: u64, pong: u64 },
}
