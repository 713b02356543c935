use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::latch::CountdownLatch;
use crate::model::{Completion, Message, Payload, QueryId, Record};
use crate::{Error, Result};

/// A query that contributed nothing because it failed.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryFailure {
    Remote {
        query: QueryId,
        error_type: String,
        detail: String,
    },
    Disconnected {
        query: QueryId,
    },
}

impl QueryFailure {
    pub fn query(&self) -> QueryId {
        match self {
            QueryFailure::Remote { query, .. } | QueryFailure::Disconnected { query } => *query,
        }
    }
}

impl From<QueryFailure> for Error {
    fn from(value: QueryFailure) -> Self {
        match value {
            QueryFailure::Remote {
                query,
                error_type,
                detail,
            } => Error::Remote {
                query,
                error_type,
                detail,
            },
            QueryFailure::Disconnected { query } => Error::DisconnectDuringQuery { query },
        }
    }
}

#[derive(Debug, Default)]
struct Buffer {
    records: BTreeMap<QueryId, Vec<Record>>,
    completion_order: Vec<QueryId>,
    failures: Vec<QueryFailure>,
    finished: usize,
}

/// Everything a phase collected, handed out once the barrier released.
#[derive(Debug, Default)]
pub struct PhaseOutput {
    /// Records per query, in delivery order within each query.
    pub records: BTreeMap<QueryId, Vec<Record>>,
    /// Queries in the order they finished.
    pub completion_order: Vec<QueryId>,
    pub failures: Vec<QueryFailure>,
    pub finished: usize,
}

impl PhaseOutput {
    /// All records, grouped by query in dispatch order.
    pub fn records_in_dispatch_order(&self) -> Vec<Record> {
        self.records.values().flatten().cloned().collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn results_for(&self, query: QueryId) -> &[Record] {
        self.records.get(&query).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Folds completion messages into the phase buffer and counts the latch down
/// once per finished query.
#[derive(Debug, Clone)]
pub struct Aggregator {
    buffer: Arc<Mutex<Buffer>>,
    latch: Arc<CountdownLatch>,
}

impl Aggregator {
    pub fn new(latch: Arc<CountdownLatch>) -> Self {
        Self {
            buffer: Arc::default(),
            latch,
        }
    }

    /// Counts the latch down for the message a query sent as its last one. The handle's
    /// `finished()` is not consulted, it may already be up while earlier messages of the
    /// same query are still queued.
    pub fn accept(&self, completion: Completion) -> Result<()> {
        let Completion {
            handle,
            message,
            last,
        } = completion;
        let query = handle.id();
        {
            let mut buffer = self.lock();
            match message {
                Message::Disconnect(detail) => {
                    tracing::warn!(%query, %detail, "Query in progress when the session disconnected");
                    buffer.failures.push(QueryFailure::Disconnected { query });
                }
                Message::Data(Payload::Error(failure)) => {
                    tracing::warn!(
                        %query,
                        error_type = %failure.error_type,
                        detail = %failure.detail,
                        "Remote service returned an error"
                    );
                    buffer.failures.push(QueryFailure::Remote {
                        query,
                        error_type: failure.error_type,
                        detail: failure.detail.to_string(),
                    });
                }
                Message::Data(Payload::Results(records)) => {
                    tracing::debug!(%query, count = records.len(), "Received records");
                    buffer.records.entry(query).or_default().extend(records);
                }
            }

            if !last {
                return Ok(());
            }
            buffer.finished += 1;
            buffer.completion_order.push(query);
            tracing::debug!(
                %query,
                rows = buffer.records.values().map(Vec::len).sum::<usize>(),
                "Query finished"
            );
        }

        self.latch.countdown()?;
        Ok(())
    }

    /// Takes the buffer, leaving an empty one behind.
    pub fn finish(&self) -> PhaseOutput {
        let buffer = std::mem::take(&mut *self.lock());
        PhaseOutput {
            records: buffer.records,
            completion_order: buffer.completion_order,
            failures: buffer.failures,
            finished: buffer.finished,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        // A panic mid-append leaves at worst a partially extended Vec.
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
