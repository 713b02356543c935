use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::{Completion, Message, Query, QueryHandle};
use crate::Result;

/// Where a service delivers messages for a query. Cheap to clone, one per in-flight query.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    tx: mpsc::UnboundedSender<Completion>,
}

impl CompletionSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Completion>) -> Self {
        Self { tx }
    }

    /// Delivers a message that more messages for the same query will follow.
    pub fn deliver(&self, handle: &QueryHandle, message: Message) -> Result<()> {
        self.send(handle, message, false)
    }

    /// Marks the query finished, then delivers its last message.
    pub fn finish(&self, handle: &QueryHandle, message: Message) -> Result<()> {
        handle.mark_finished();
        self.send(handle, message, true)
    }

    fn send(&self, handle: &QueryHandle, message: Message, last: bool) -> Result<()> {
        self.tx.send(Completion {
            handle: handle.clone(),
            message,
            last,
        })?;
        Ok(())
    }
}

/// The remote extraction capability.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// Fire-and-forget. Messages for `handle` arrive on `sink`, the last one after
    /// `handle.finished()` turned true.
    fn query(&self, query: Query, handle: QueryHandle, sink: CompletionSink) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Runs `work` inside a connected session and disconnects afterwards, whether or not `work` failed.
pub async fn with_session<S, F, Fut, T>(service: &S, work: F) -> Result<T>
where
    S: ExtractionService + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    service.connect().await?;
    tracing::debug!("Session connected");

    let outcome = work().await;

    let released = service.disconnect().await;
    tracing::debug!("Session disconnected");
    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), released) => {
            if let Err(release_err) = released {
                tracing::warn!(error = %release_err, "Disconnect failed after an earlier error");
            }
            Err(e)
        }
    }
}
