#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use listing_digest::config::{DigestSettings, PartialPolicy};
use listing_digest::model::{ConnectorId, Message, Query, QueryHandle, Record};
use listing_digest::service::{CompletionSink, ExtractionService};
use listing_digest::Result;
use serde_json::json;

pub const TEMPLATE: &str = "http://listings.test/page/{page}?offset={offset}";

#[derive(Debug, Clone)]
pub enum Reply {
    Records(Vec<Record>),
    Error(&'static str),
    Disconnect,
    /// Never answers.
    Silent,
}

/// In-memory `ExtractionService`: answers each url from a script, optionally after a delay.
/// Unknown urls get an empty result set.
#[derive(Default)]
pub struct ScriptedService {
    replies: HashMap<String, (Reply, Duration)>,
    pub dispatched: Mutex<Vec<String>>,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, url: impl Into<String>, reply: Reply) -> Self {
        self.reply_after(url, reply, Duration::ZERO)
    }

    pub fn reply_after(mut self, url: impl Into<String>, reply: Reply, delay: Duration) -> Self {
        self.replies.insert(url.into(), (reply, delay));
        self
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionService for ScriptedService {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn query(&self, query: Query, handle: QueryHandle, sink: CompletionSink) -> Result<()> {
        let url = query.url().to_string();
        self.dispatched.lock().unwrap().push(url.clone());
        let (reply, delay) = self
            .replies
            .get(&url)
            .cloned()
            .unwrap_or((Reply::Records(Vec::new()), Duration::ZERO));

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let message = match reply {
                Reply::Records(records) => Message::results(records),
                Reply::Error(kind) => Message::error(kind, json!({ "errorType": kind, "url": url })),
                Reply::Disconnect => Message::Disconnect(json!({ "url": url })),
                Reply::Silent => return,
            };
            let _ = sink.finish(&handle, message);
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn page_url(page: usize) -> String {
    format!("http://listings.test/page/{page}?offset={}", page * 50)
}

pub fn detail_url(id: &str) -> String {
    format!("http://listings.test/item/{id}")
}

pub fn listing(id: &str, date: &str) -> Record {
    Record::new()
        .with("title", format!("Bike {id}"))
        .with("price", format!("£{id}00"))
        .with("date_posted", date)
        .with("detail_link", detail_url(id))
}

pub fn seller(name: &str) -> Record {
    Record::new().with("seller_name", name)
}

pub fn settings(output_dir: &Path, policy: PartialPolicy) -> DigestSettings {
    DigestSettings {
        listing_url_template: TEMPLATE.to_string(),
        listing_connector: ConnectorId::new("listing"),
        detail_connector: ConnectorId::new("detail"),
        listing_pages: 5,
        offset_step: 50,
        target_day: Some("04-Jan".to_string()),
        output_dir: output_dir.to_path_buf(),
        phase_timeout: Duration::from_secs(2),
        partial_policy: policy,
    }
}
