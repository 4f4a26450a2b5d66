use async_stream::stream;
use eventsource_client::{self as es, Client};
use futures_util::stream::{BoxStream, StreamExt};
use log::*;
use url::Url;

use crate::error::{Error, ErrorKind, TransportErrorKind};
use crate::message::Frame;

/// Something that happened on an open transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The stream is established and the server is sending.
    Opened,
    /// A named server-pushed message.
    Frame(Frame),
    /// Keep-alive traffic (an SSE comment) carrying no event.
    Heartbeat,
    /// The transport failed; no further events follow.
    Failed(Error),
}

/// Events from one open transport. Dropping the stream closes the transport.
pub type TransportStream = BoxStream<'static, TransportEvent>;

/// Opens server-push streams. Implemented by [`EventSourceTransport`] for real
/// connections and by `MockTransport` in tests.
pub trait EventTransport: Send + Sync + 'static {
    /// Open a stream to `url`. An `Err` means the transport could not even be
    /// constructed; failures after construction arrive as
    /// [`TransportEvent::Failed`].
    fn open(&self, url: &Url) -> Result<TransportStream, Error>;
}

/// Append the bearer token as the `token` query parameter. Streaming
/// transports of this kind can't set arbitrary headers from every client.
pub fn authenticated_url(endpoint: &Url, token: &str) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut().append_pair("token", token);
    url
}

/// Transport backed by `eventsource-client`.
///
/// The client's own reconnect logic is disabled; retrying is owned by
/// `StreamConnection` so that there is a single retry policy and a single
/// transport per connection. The client reports no explicit open signal, so
/// `Opened` is emitted ahead of the first item the server sends (the server
/// sends a `connected` frame as soon as the stream is established).
#[derive(Debug, Default, Clone)]
pub struct EventSourceTransport {}

impl EventSourceTransport {
    pub fn new() -> Self {
        Self {}
    }
}

impl EventTransport for EventSourceTransport {
    fn open(&self, url: &Url) -> Result<TransportStream, Error> {
        let client = es::ClientBuilder::for_url(url.as_str())
            .map_err(|e| Error {
                source: Some(Box::new(e)),
                error_kind: ErrorKind::Transport(TransportErrorKind::Builder),
            })?
            .reconnect(es::ReconnectOptions::reconnect(false).build())
            .build();

        let endpoint = url.path().to_string();

        Ok(stream! {
            let mut stream = client.stream();
            let mut opened = false;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(sse) => {
                        if !opened {
                            opened = true;
                            debug!("SSE stream established for {}", endpoint);
                            yield TransportEvent::Opened;
                        }
                        match sse {
                            es::SSE::Event(event) => {
                                yield TransportEvent::Frame(Frame::new(event.event_type, event.data));
                            }
                            es::SSE::Comment(_) => {
                                yield TransportEvent::Heartbeat;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("SSE error for {}: {}", endpoint, e);
                        yield TransportEvent::Failed(Error::from(e));
                        break;
                    }
                }
            }

            debug!("SSE stream ended for {}", endpoint);
        }
        .boxed())
    }
}
