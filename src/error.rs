use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{Completion, QueryId};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Remote service failed query {query}: {error_type} ({detail})")]
    Remote {
        query: QueryId,
        error_type: String,
        detail: String,
    },
    #[error("Session disconnected while query {query} was in flight.")]
    DisconnectDuringQuery { query: QueryId },

    #[error("Latch counted down past zero (armed with {initial}). More completions than dispatched queries!")]
    LatchUnderflow { initial: usize },
    #[error("Phase '{phase}' timed out with {remaining} queries still unfinished.")]
    Timeout { phase: String, remaining: usize },
    #[error("Phase was armed for {expected} queries, refusing to dispatch another one.")]
    PhaseOverflow { expected: usize },
    #[error("Listing #{listing} (query {query}) expected exactly one detail record, found {found}.")]
    JoinArityMismatch {
        listing: usize,
        query: QueryId,
        found: usize,
    },

    #[error("Extraction service is not connected.")]
    NotConnected,
    #[error("Config Error: {0}")]
    Config(String),

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Csv Error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tokio Join Error, couldn't await a task! {0}")]
    RuntimeJoin(#[from] tokio::task::JoinError),
    #[error("Couldn't send a completion through a channel.")]
    RuntimeSendError,

    #[error("Reqwest Error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

impl From<mpsc::error::SendError<Completion>> for Error {
    fn from(_value: mpsc::error::SendError<Completion>) -> Self {
        Error::RuntimeSendError
    }
}
