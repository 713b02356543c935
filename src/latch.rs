use std::time::Duration;

use tokio::sync::watch;

use crate::{Error, Result};

/// One-shot countdown barrier. Waiters are released once the count hits zero,
/// counting down past zero is an error.
#[derive(Debug)]
pub struct CountdownLatch {
    initial: usize,
    count: watch::Sender<usize>,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        let (tx, _rx) = watch::channel(count);
        Self {
            initial: count,
            count: tx,
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Decrements by one and returns what is left.
    pub fn countdown(&self) -> Result<usize> {
        let mut remaining = None;
        // Check and decrement happen under the channel's lock.
        self.count.send_if_modified(|count| {
            if *count == 0 {
                return false;
            }
            *count -= 1;
            remaining = Some(*count);
            true
        });
        remaining.ok_or(Error::LatchUnderflow {
            initial: self.initial,
        })
    }

    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel can't close while we borrow it.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    pub async fn wait_timeout(&self, timeout: Duration, phase: &str) -> Result<()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| Error::Timeout {
                phase: phase.to_string(),
                remaining: self.count(),
            })
    }
}
