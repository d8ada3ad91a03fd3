//! push transports: server-sent events (preferred) and http long polling.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::Deserialize;

use crate::error::TransportError;

/// one named event as it comes off the wire
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WireMessage {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

pub type MessageStream = BoxStream<'static, Result<WireMessage, TransportError>>;

/// a way of reaching the push service.
///
/// `open` resolves once the connection is usable; the returned stream ends
/// (or yields an error) when the connection is lost.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(&self, url: &str) -> Result<MessageStream, TransportError>;
}

/// transports selectable from config, in preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Streaming,
    Polling,
}

// ==============================================================================
// streaming (server-sent events)
// ==============================================================================

/// `GET {url}/events` as `text/event-stream`
#[derive(Debug, Clone)]
pub struct StreamingTransport {
    client: Client,
}

impl StreamingTransport {
    /// no overall request timeout: the response body lives as long as the
    /// connection does
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for StreamingTransport {
    fn name(&self) -> &'static str {
        "streaming"
    }

    async fn open(&self, url: &str) -> Result<MessageStream, TransportError> {
        let resp = self
            .client
            .get(format!("{}/events", url.trim_end_matches('/')))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status().as_u16()));
        }

        let bytes = Box::pin(resp.bytes_stream());
        let events = stream::unfold(
            (bytes, SseParser::default(), VecDeque::new()),
            |(mut bytes, mut parser, mut pending)| async move {
                loop {
                    if let Some(item) = pending.pop_front() {
                        return Some((item, (bytes, parser, pending)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => pending.extend(parser.push(&chunk)),
                        Some(Err(e)) => {
                            pending.push_back(Err(TransportError::Closed(e.to_string())));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(events.boxed())
    }
}

/// incremental `text/event-stream` decoder.
///
/// frames are separated by a blank line; `event:` names the frame (default
/// `message`), `data:` lines are joined with newlines and parsed as json,
/// lines starting with `:` are heartbeats.
///
/// chunks are buffered as raw bytes and each complete frame is decoded once,
/// so a multi-byte character cut by a chunk boundary survives.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<WireMessage, TransportError>> {
        self.buf.extend_from_slice(chunk);
        if self.buf.contains(&b'\r') {
            self.buf = strip_crlf(&self.buf);
        }

        let mut out = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(msg) = parse_frame(&String::from_utf8_lossy(&frame)) {
                out.push(msg);
            }
        }
        out
    }
}

/// `\r\n` -> `\n`. a trailing lone `\r` is kept until its `\n` arrives.
fn strip_crlf(buf: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(buf.len());
    for (i, &b) in buf.iter().enumerate() {
        if b == b'\r' && buf.get(i + 1) == Some(&b'\n') {
            continue;
        }
        out.push(b);
    }
    out
}

fn parse_frame(frame: &str) -> Option<Result<WireMessage, TransportError>> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() {
        return None;
    }

    let event = event.unwrap_or("message").to_string();
    Some(
        serde_json::from_str(&data.join("\n"))
            .map(|data| WireMessage { event, data })
            .map_err(|e| TransportError::Frame(e.to_string())),
    )
}

// ==============================================================================
// polling
// ==============================================================================

#[derive(Debug, Deserialize)]
struct PollBatch {
    cursor: u64,
    #[serde(default)]
    events: Vec<WireMessage>,
}

/// `GET {url}/events/poll?cursor=n` every `interval`
#[derive(Debug, Clone)]
pub struct PollingTransport {
    client: Client,
    interval: Duration,
}

impl PollingTransport {
    pub fn new(request_timeout: Duration, interval: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, interval })
    }
}

async fn poll_once(client: &Client, url: &str, cursor: u64) -> Result<PollBatch, TransportError> {
    let resp = client
        .get(format!("{url}/events/poll"))
        .query(&[("cursor", cursor)])
        .send()
        .await?
        .error_for_status()?;
    resp.json::<PollBatch>()
        .await
        .map_err(|e| TransportError::Frame(e.to_string()))
}

#[async_trait]
impl Transport for PollingTransport {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn open(&self, url: &str) -> Result<MessageStream, TransportError> {
        let url = url.trim_end_matches('/').to_string();

        // the handshake poll doubles as the first batch
        let first = poll_once(&self.client, &url, 0).await?;
        let pending: VecDeque<WireMessage> = first.events.into();

        let client = self.client.clone();
        let interval = self.interval;
        let events = stream::unfold(
            (client, url, first.cursor, pending),
            move |(client, url, mut cursor, mut pending)| async move {
                loop {
                    if let Some(msg) = pending.pop_front() {
                        return Some((Ok(msg), (client, url, cursor, pending)));
                    }
                    tokio::time::sleep(interval).await;
                    match poll_once(&client, &url, cursor).await {
                        Ok(batch) => {
                            cursor = batch.cursor;
                            pending.extend(batch.events);
                        }
                        Err(e) => return Some((Err(e), (client, url, cursor, pending))),
                    }
                }
            },
        );

        Ok(events.boxed())
    }
}
