use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::model::{Message, Payload, Query, QueryHandle};
use crate::service::{CompletionSink, ExtractionService};
use crate::{Error, Result};

struct Session {
    shutdown: watch::Sender<bool>,
    in_flight: JoinSet<()>,
}

/// `ExtractionService` over the connector REST endpoint
/// `GET {base_url}/store/connector/{connector}/_query`.
pub struct HttpExtractionService {
    client: Client,
    base_url: String,
    user_id: String,
    api_key: String,
    session: Mutex<Option<Session>>,
}

impl HttpExtractionService {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            api_key: api_key.into(),
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ExtractionService for HttpExtractionService {
    async fn connect(&self) -> Result<()> {
        let mut session = self.session();
        if session.is_none() {
            let (shutdown, _rx) = watch::channel(false);
            *session = Some(Session {
                shutdown,
                in_flight: JoinSet::new(),
            });
            tracing::info!(base_url = %self.base_url, "Connected to extraction service");
        }
        Ok(())
    }

    fn query(&self, query: Query, handle: QueryHandle, sink: CompletionSink) -> Result<()> {
        let mut guard = self.session();
        let session = guard.as_mut().ok_or(Error::NotConnected)?;
        // Reap queries that already delivered, the set otherwise grows for the whole session.
        while let Some(res) = session.in_flight.try_join_next() {
            if let Err(e) = res {
                tracing::warn!(error = %e, "Query task failed");
            }
        }

        let request = QueryRequest {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            user_id: self.user_id.clone(),
            api_key: self.api_key.clone(),
            query,
        };
        let shutdown = session.shutdown.subscribe();
        session.in_flight.spawn(async move {
            let url = request.query.url().to_string();
            let message = tokio::select! {
                message = request.send() => message,
                _ = disconnected(shutdown) => Message::Disconnect(json!({ "url": url })),
            };
            if let Err(e) = sink.finish(&handle, message) {
                tracing::debug!(query = %handle.id(), error = %e, "Nobody is listening for this query anymore");
            }
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Take the session out so the lock isn't held across the await below.
        let session = self.session().take();
        let Some(mut session) = session else {
            return Ok(());
        };
        let pending = session.in_flight.len();
        session.shutdown.send_replace(true);
        while let Some(res) = session.in_flight.join_next().await {
            res?;
        }
        tracing::info!(pending, "Disconnected from extraction service");
        Ok(())
    }
}

async fn disconnected(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|down| *down).await;
}

struct QueryRequest {
    client: Client,
    base_url: String,
    user_id: String,
    api_key: String,
    query: Query,
}

impl QueryRequest {
    /// Per-query failures come back as error messages, never as `Err`.
    async fn send(&self) -> Message {
        let Some(connector) = self.query.connectors.first() else {
            return Message::error("InputError", json!({ "error": "query names no connector" }));
        };
        let endpoint = format!("{}/store/connector/{}/_query", self.base_url, connector);
        let params = [
            ("input", format!("webpage/url:{}", self.query.url())),
            ("_user", self.user_id.clone()),
            ("_apikey", self.api_key.clone()),
        ];

        let resp = match self.client.get(&endpoint).query(&params).send().await {
            Ok(resp) => resp,
            Err(e) => {
                return Message::error("TransportError", json!({ "url": self.query.url(), "error": e.to_string() }))
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Message::error(
                "HttpStatus",
                json!({ "url": self.query.url(), "status": status.as_u16(), "body": body }),
            );
        }

        match resp.json::<Value>().await.map_err(Error::from).and_then(|value| Ok(Payload::from_json(value)?)) {
            Ok(payload) => Message::Data(payload),
            Err(e) => Message::error("MalformedResponse", json!({ "url": self.query.url(), "error": e.to_string() })),
        }
    }
}
