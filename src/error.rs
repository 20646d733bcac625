use thiserror::Error;

use crate::exchange::ExchangeError;

/// Crate-level error
#[derive(Debug, Error)]
pub enum BotError {
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("strategy error: {0}")]
    Strategy(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<config::ConfigError> for BotError {
    fn from(err: config::ConfigError) -> Self {
        BotError::Config(err.to_string())
    }
}

/// A control line that could not be turned into a command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("malformed command {line:?}: {source}")]
    Malformed {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}
