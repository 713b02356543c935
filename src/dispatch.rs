use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::aggregate::{Aggregator, PhaseOutput};
use crate::latch::CountdownLatch;
use crate::model::{Completion, Query, QueryHandle, QueryId};
use crate::service::{CompletionSink, ExtractionService};
use crate::{info_time, Error, Result};

/// One round of dispatch + wait. Owns the latch, the buffer and the completion channel
/// for that round, nothing outlives it.
pub struct Phase<'s, S: ?Sized> {
    name: String,
    service: &'s S,
    expected: usize,
    next_id: u64,
    latch: Arc<CountdownLatch>,
    aggregator: Aggregator,
    sink: CompletionSink,
    collector: JoinHandle<Result<()>>,
    stop_collector: oneshot::Sender<()>,
    started: DateTime<Local>,
}

impl<'s, S> Phase<'s, S>
where
    S: ExtractionService + ?Sized,
{
    /// Arms the latch with `expected` before anything can be dispatched.
    pub fn open(name: impl Into<String>, service: &'s S, expected: usize) -> Self {
        let name = name.into();
        let latch = Arc::new(CountdownLatch::new(expected));
        let aggregator = Aggregator::new(latch.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_collector, stop_rx) = oneshot::channel();
        let collector = tokio::spawn({
            let aggregator = aggregator.clone();
            async move { collect_completions(rx, aggregator, stop_rx).await }
        });

        info_time!("Phase '{}' armed for {} queries", name, expected);
        Self {
            name,
            service,
            expected,
            next_id: 0,
            latch,
            aggregator,
            sink: CompletionSink::new(tx),
            collector,
            stop_collector,
            started: Local::now(),
        }
    }

    pub fn dispatched(&self) -> usize {
        self.next_id as usize
    }

    /// Fire-and-forget: the handle comes back immediately, results arrive through the collector.
    pub fn dispatch(&mut self, query: Query) -> Result<QueryHandle> {
        if self.dispatched() >= self.expected {
            return Err(Error::PhaseOverflow {
                expected: self.expected,
            });
        }
        let handle = QueryHandle::new(QueryId(self.next_id));
        self.next_id += 1;

        tracing::debug!(phase = %self.name, query = %handle.id(), url = query.url(), "Dispatching query");
        self.service.query(query, handle.clone(), self.sink.clone())?;
        Ok(handle)
    }

    /// Blocks until every dispatched query finished (or `timeout` runs out), then hands out the buffer.
    pub async fn wait(self, timeout: Duration) -> Result<PhaseOutput> {
        let waited = self.latch.wait_timeout(timeout, &self.name).await;
        drop(self.sink);

        // Service tasks may still hold sinks, so the channel won't close by itself.
        let _ = self.stop_collector.send(());
        // A collector error (an extra completion) explains a timeout better than the timeout does.
        self.collector.await??;
        waited?;

        let output = self.aggregator.finish();
        info_time!(
            self.started,
            "Phase '{}' done: {} queries finished, {} records, {} failed",
            self.name,
            output.finished,
            output.record_count(),
            output.failures.len()
        );
        Ok(output)
    }
}

/// Feeds every completion into the aggregator until all senders are gone or `stop` fires.
/// On `stop`, whatever is already queued is still accepted, so a surplus completion
/// shows up as `LatchUnderflow` instead of vanishing with the task.
async fn collect_completions(
    mut rx: mpsc::UnboundedReceiver<Completion>,
    aggregator: Aggregator,
    mut stop: oneshot::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            completion = rx.recv() => match completion {
                Some(completion) => accept(&aggregator, completion)?,
                None => return Ok(()),
            },
            _ = &mut stop => break,
        }
    }

    while let Ok(completion) = rx.try_recv() {
        accept(&aggregator, completion)?;
    }
    Ok(())
}

fn accept(aggregator: &Aggregator, completion: Completion) -> Result<()> {
    let query = completion.handle.id();
    if let Err(e) = aggregator.accept(completion) {
        tracing::error!(%query, error = %e, "Completion doesn't belong to any unfinished query");
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::model::{ConnectorId, Message, Record};

    /// Answers every query with `rows` records from a spawned task; urls ending in "bad" fail.
    /// With `stream` the first record goes out as a partial batch right before the rest.
    /// Keeps every sink it was handed, like a service that never drops its session state.
    struct Echo {
        rows: usize,
        stream: bool,
        slow: Option<(&'static str, Duration)>,
        seen: Mutex<Vec<String>>,
        sinks: Mutex<Vec<(QueryHandle, CompletionSink)>>,
    }

    impl Echo {
        fn new(rows: usize) -> Self {
            Self {
                rows,
                stream: false,
                slow: None,
                seen: Mutex::default(),
                sinks: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl ExtractionService for Echo {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        fn query(&self, query: Query, handle: QueryHandle, sink: CompletionSink) -> Result<()> {
            self.seen.lock().unwrap().push(query.url().to_string());
            self.sinks.lock().unwrap().push((handle.clone(), sink.clone()));
            let rows = self.rows;
            let stream = self.stream;
            let delay = match self.slow {
                Some((url, delay)) if url == query.url() => delay,
                _ => Duration::ZERO,
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if query.url().ends_with("bad") {
                    let message = Message::error("InputError", json!({ "url": query.url() }));
                    sink.finish(&handle, message).unwrap();
                    return;
                }
                let mut records: Vec<_> = (0..rows).map(|i| Record::new().with("i", i)).collect();
                if stream && !records.is_empty() {
                    let first = records.remove(0);
                    sink.deliver(&handle, Message::results(vec![first])).unwrap();
                }
                sink.finish(&handle, Message::results(records)).unwrap();
            });
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn query(url: &str) -> Query {
        Query::new(url, ConnectorId::new("c"))
    }

    #[tokio::test]
    async fn five_pages_of_ten_make_fifty() {
        let service = Echo::new(10);
        let mut phase = Phase::open("listing", &service, 5);
        for page in 0..5 {
            phase.dispatch(query(&format!("http://l.test/{page}"))).unwrap();
        }
        let output = phase.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(output.record_count(), 50);
        assert_eq!(output.finished, 5);
        assert_eq!(service.seen.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn failed_queries_still_release_the_barrier() {
        let service = Echo::new(2);
        let mut phase = Phase::open("listing", &service, 3);
        phase.dispatch(query("http://l.test/0")).unwrap();
        let bad = phase.dispatch(query("http://l.test/bad")).unwrap();
        phase.dispatch(query("http://l.test/2")).unwrap();

        let output = phase.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(output.record_count(), 4);
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].query(), bad.id());
        assert!(output.results_for(bad.id()).is_empty());
    }

    #[tokio::test]
    async fn dispatching_past_the_armed_count_fails() {
        let service = Echo::new(1);
        let mut phase = Phase::open("detail", &service, 1);
        phase.dispatch(query("http://l.test/0")).unwrap();
        let err = phase.dispatch(query("http://l.test/1")).unwrap_err();
        assert!(matches!(err, Error::PhaseOverflow { expected: 1 }));
        phase.wait(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn empty_phase_releases_immediately() {
        let service = Echo::new(1);
        let phase = Phase::open("detail", &service, 0);
        let output = phase.wait(Duration::from_millis(50)).await.unwrap();
        assert_eq!(output.finished, 0);
        assert!(output.records.is_empty());
    }

    #[tokio::test]
    async fn undercounted_phase_times_out() {
        let service = Echo::new(1);
        let mut phase = Phase::open("listing", &service, 2);
        phase.dispatch(query("http://l.test/0")).unwrap();
        let err = phase.wait(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { remaining: 1, .. }));
    }

    #[tokio::test]
    async fn streamed_batches_hold_the_barrier_until_every_query_finished() {
        let service = Echo {
            stream: true,
            slow: Some(("http://l.test/slow", Duration::from_millis(300))),
            ..Echo::new(2)
        };
        let started = std::time::Instant::now();
        let mut phase = Phase::open("listing", &service, 2);
        phase.dispatch(query("http://l.test/fast")).unwrap();
        let slow = phase.dispatch(query("http://l.test/slow")).unwrap();

        let output = phase.wait(Duration::from_secs(2)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(output.finished, 2);
        assert_eq!(output.record_count(), 4);
        assert_eq!(output.results_for(slow.id()).len(), 2);
    }

    #[tokio::test]
    async fn duplicate_sent_after_the_barrier_opened_is_underflow() {
        let service = Echo::new(1);
        let mut phase = Phase::open("listing", &service, 1);
        phase.dispatch(query("http://l.test/0")).unwrap();
        // The real completion is in and the latch is at zero.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (handle, sink) = service.sinks.lock().unwrap().remove(0);
        sink.finish(&handle, Message::results(Vec::new())).unwrap();

        let err = phase.wait(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::LatchUnderflow { initial: 1 }));
    }
}
