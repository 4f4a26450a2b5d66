//! Channel-backed transport for exercising connections without a network.
//!
//! Every `open` hands out a [`MockLink`] through which a test plays the
//! server: it can report the stream open, push frames and keep-alives, fail
//! the link or end it, and check whether the client has closed it.

use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use url::Url;

use crate::error::{transport_error, Error, TransportErrorKind};
use crate::message::Frame;
use crate::transport::{EventTransport, TransportEvent, TransportStream};

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

#[derive(Default)]
struct MockInner {
    links: Vec<MockLink>,
    attempts: usize,
    refuse_next: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `open` fail at construction.
    pub fn refuse_next(&self, count: usize) {
        self.lock().refuse_next = count;
    }

    /// Number of `open` calls, refused ones included.
    pub fn open_count(&self) -> usize {
        self.lock().attempts
    }

    pub fn links(&self) -> Vec<MockLink> {
        self.lock().links.clone()
    }

    pub fn last_link(&self) -> Option<MockLink> {
        self.lock().links.last().cloned()
    }

    /// Links the client still holds open.
    pub fn live_links(&self) -> usize {
        self.lock()
            .links
            .iter()
            .filter(|link| !link.is_closed())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventTransport for MockTransport {
    fn open(&self, url: &Url) -> Result<TransportStream, Error> {
        let mut inner = self.lock();
        inner.attempts += 1;

        if inner.refuse_next > 0 {
            inner.refuse_next -= 1;
            return Err(transport_error(
                TransportErrorKind::Builder,
                "mock transport refused to open",
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.links.push(MockLink {
            url: url.clone(),
            sender: Arc::new(Mutex::new(Some(tx))),
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}

/// The server side of one opened mock transport.
#[derive(Clone)]
pub struct MockLink {
    url: Url,
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>,
}

impl MockLink {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The `token` query parameter the client connected with.
    pub fn token(&self) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    }

    pub fn open(&self) {
        self.send(TransportEvent::Opened);
    }

    pub fn frame(&self, event_type: &str, payload: Value) {
        self.raw_frame(event_type, &payload.to_string());
    }

    pub fn raw_frame(&self, event_type: &str, data: &str) {
        self.send(TransportEvent::Frame(Frame::new(event_type, data)));
    }

    pub fn heartbeat(&self) {
        self.send(TransportEvent::Heartbeat);
    }

    pub fn fail(&self, message: &str) {
        self.send(TransportEvent::Failed(transport_error(
            TransportErrorKind::Connection,
            message,
        )));
    }

    /// End the stream from the server side.
    pub fn end(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// True once the client dropped the stream or the server ended it.
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|tx| tx.is_closed())
            .unwrap_or(true)
    }

    fn send(&self, event: TransportEvent) {
        if let Some(tx) = self.sender.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            // The client may already have closed this link
            let _ = tx.send(event);
        }
    }
}
