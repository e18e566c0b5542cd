//! Scripted in-memory transport for state machine tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::protocol::ABNORMAL_CLOSURE;
use crate::transport::{CloseEvent, Transport, TransportEvents};

/// What the next `connect` call does.
#[derive(Debug, Clone)]
pub(crate) enum ConnectScript {
    Open,
    Fail(&'static str),
    /// Never resolves; only a disconnect ends it.
    Hang,
}

#[derive(Default)]
struct Inner {
    script: VecDeque<ConnectScript>,
    connects: Vec<(String, Instant)>,
    sent: Vec<String>,
    connected: bool,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    events: TransportEvents,
    inner: Mutex<Inner>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for upcoming connects. An empty queue opens.
    pub(crate) fn script(&self, steps: impl IntoIterator<Item = ConnectScript>) {
        self.inner.lock().unwrap().script.extend(steps);
    }

    pub(crate) fn connect_urls(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .connects
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub(crate) fn connect_times(&self) -> Vec<Instant> {
        self.inner
            .lock()
            .unwrap()
            .connects
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// The `type` of every frame sent so far.
    pub(crate) fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|frame| {
                let value: serde_json::Value = serde_json::from_str(frame).unwrap();
                value["type"].as_str().unwrap().to_string()
            })
            .collect()
    }

    pub(crate) fn pings(&self) -> usize {
        self.sent_types().iter().filter(|t| *t == "ping").count()
    }

    pub(crate) fn server_send(&self, frame: &str) {
        self.events.message.emit(&frame.to_string());
    }

    pub(crate) fn server_close(&self, code: u16) {
        self.inner.lock().unwrap().connected = false;
        self.events.close.emit(&CloseEvent::new(code, "server close"));
    }

    /// A socket failure: error, then the abnormal close that follows it.
    pub(crate) fn server_error(&self) {
        self.inner.lock().unwrap().connected = false;
        self.events
            .error
            .emit(&TransportError::Socket("connection reset".into()));
        self.events
            .close
            .emit(&CloseEvent::new(ABNORMAL_CLOSURE, "connection reset"));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        let step = {
            let mut inner = self.inner.lock().unwrap();
            inner.connected = false;
            inner.connects.push((url.to_string(), Instant::now()));
            inner.script.pop_front().unwrap_or(ConnectScript::Open)
        };

        match step {
            ConnectScript::Open => {
                self.inner.lock().unwrap().connected = true;
                self.events.open.emit(&());
                Ok(())
            }
            ConnectScript::Fail(reason) => Err(TransportError::Connect(reason.into())),
            ConnectScript::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self) {
        self.inner.lock().unwrap().connected = false;
    }

    async fn send(&self, frame: String) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        inner.sent.push(frame);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    fn abort(&self) {
        self.inner.lock().unwrap().connected = false;
    }

    fn events(&self) -> &TransportEvents {
        &self.events
    }
}
