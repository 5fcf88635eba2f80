use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ChatConfig, QueryRecord};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("frame decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Http(e) => e.into(),
            other => AppError::new(crate::error::ErrorCode::ConnectionError, other.to_string()),
        }
    }
}

// ============================================================================
// Wire Frames
// ============================================================================

/// Where a slot connection lives: one per (session, slot index).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SlotAddress {
    pub session_id: String,
    pub slot: usize,
}

impl SlotAddress {
    pub fn new(session_id: impl Into<String>, slot: usize) -> Self {
        Self {
            session_id: session_id.into(),
            slot,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Query {
        query_id: Uuid,
        content: String,
        config: ChatConfig,
    },
}

impl OutboundFrame {
    pub fn query(record: &QueryRecord) -> Self {
        Self::Query {
            query_id: record.id,
            content: record.content.clone(),
            config: record.config.clone(),
        }
    }

    pub fn query_id(&self) -> Uuid {
        match self {
            Self::Query { query_id, .. } => *query_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    TypingStart,
    TypingEnd,
    Message {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query_id: Option<Uuid>,
    },
    System {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Error {
        message: String,
    },
}

// ============================================================================
// Transport Traits
// ============================================================================

/// Opens slot connections. Handshake timeouts are the implementation's job.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, address: &SlotAddress) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// One open, bidirectional slot connection.
#[async_trait]
pub trait TransportLink: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Next inbound frame. `None` means the remote closed the link; `Some(Err)`
    /// is fatal to the link. Must be cancel-safe.
    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>>;

    async fn close(&mut self) {}
}

// ============================================================================
// NDJSON Decoder
// ============================================================================

/// Splits a byte stream into newline-delimited JSON frames.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: BytesMut,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<InboundFrame, TransportError>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            if let Some(frame) = Self::decode_line(&line[..pos]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Decode whatever is left once the stream ends without a trailing newline.
    pub fn finish(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        let rest = self.buffer.split();
        Self::decode_line(&rest)
    }

    fn decode_line(line: &[u8]) -> Option<Result<InboundFrame, TransportError>> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return None;
        }
        Some(serde_json::from_slice(line).map_err(TransportError::from))
    }
}

// ============================================================================
// HTTP Streaming Transport
// ============================================================================

/// Speaks the slot protocol to an inference gateway over HTTP.
///
/// Handshake: `GET {base}/v1/sessions/{session}/slots/{slot}` must answer 2xx.
/// Each query is `POST .../query` with the outbound frame as JSON; the response
/// body streams inbound frames as NDJSON.
#[derive(Debug, Clone)]
pub struct HttpStreamTransport {
    client: reqwest::Client,
    base_url: String,
    connect_timeout: Duration,
}

impl HttpStreamTransport {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            connect_timeout,
        })
    }

    fn slot_url(&self, address: &SlotAddress) -> String {
        format!(
            "{}/v1/sessions/{}/slots/{}",
            self.base_url.trim_end_matches('/'),
            address.session_id,
            address.slot
        )
    }
}

#[async_trait]
impl Transport for HttpStreamTransport {
    async fn connect(&self, address: &SlotAddress) -> Result<Box<dyn TransportLink>, TransportError> {
        let url = self.slot_url(address);

        let response = tokio::time::timeout(self.connect_timeout, self.client.get(&url).send())
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;

        if !response.status().is_success() {
            return Err(TransportError::Handshake(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Box::new(HttpStreamLink {
            client: self.client.clone(),
            query_url: format!("{}/query", url),
            inbound_tx,
            inbound_rx,
            streams: Vec::new(),
        }))
    }
}

struct HttpStreamLink {
    client: reqwest::Client,
    query_url: String,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    inbound_rx: mpsc::UnboundedReceiver<InboundFrame>,
    streams: Vec<JoinHandle<()>>,
}

#[async_trait]
impl TransportLink for HttpStreamLink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.query_url)
            .json(&frame)
            .send()
            .await?
            .error_for_status()?;

        let tx = self.inbound_tx.clone();
        self.streams.retain(|handle| !handle.is_finished());
        self.streams.push(tokio::spawn(pump_ndjson(response, tx)));
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        self.inbound_rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        for handle in self.streams.drain(..) {
            handle.abort();
        }
    }
}

async fn pump_ndjson(response: reqwest::Response, tx: mpsc::UnboundedSender<InboundFrame>) {
    let mut decoder = NdjsonDecoder::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for frame in decoder.feed(&bytes) {
                    match frame {
                        Ok(frame) => {
                            if tx.send(frame).is_err() {
                                return;
                            }
                        }
                        Err(e) => log::warn!("Skipping malformed frame: {}", e),
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(InboundFrame::Error {
                    message: format!("Stream error: {}", e),
                });
                return;
            }
        }
    }

    match decoder.finish() {
        Some(Ok(frame)) => {
            let _ = tx.send(frame);
        }
        Some(Err(e)) => log::warn!("Skipping malformed trailing frame: {}", e),
        None => {}
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = NdjsonDecoder::new();
        let first = decoder.feed(b"{\"type\":\"typing_start\"}\n{\"type\":\"mess");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref().unwrap(), &InboundFrame::TypingStart);

        let second = decoder.feed(b"age\",\"content\":\"hi\"}\n\n");
        assert_eq!(second.len(), 1);
        assert_eq!(
            second[0].as_ref().unwrap(),
            &InboundFrame::Message {
                content: "hi".to_string(),
                query_id: None
            }
        );
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_trailing_frame_and_garbage() {
        let mut decoder = NdjsonDecoder::new();
        let frames = decoder.feed(b"not json\n{\"type\":\"system\"}");
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(TransportError::Decode(_))));

        let last = decoder.finish().unwrap().unwrap();
        assert_eq!(last, InboundFrame::System { content: None });
    }

    #[test]
    fn test_outbound_wire_format() {
        let record = QueryRecord::new(0, "hello", ChatConfig::new("mistral"));
        let json = serde_json::to_value(OutboundFrame::query(&record)).unwrap();
        assert_eq!(json["type"], "query");
        assert_eq!(json["content"], "hello");
        assert_eq!(json["config"]["model"], "mistral");
        assert_eq!(json["query_id"], record.id.to_string());
    }

    async fn handshake(Path((_session, slot)): Path<(String, usize)>) -> StatusCode {
        if slot == 3 {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        }
    }

    async fn query(
        Path((_session, _slot)): Path<(String, usize)>,
        Json(frame): Json<OutboundFrame>,
    ) -> String {
        let OutboundFrame::Query {
            query_id,
            content,
            config,
        } = frame;
        let frames = [
            serde_json::to_string(&InboundFrame::TypingStart).unwrap(),
            serde_json::to_string(&InboundFrame::System { content: None }).unwrap(),
            serde_json::to_string(&InboundFrame::Message {
                content: format!("{} says {}", config.model, content),
                query_id: Some(query_id),
            })
            .unwrap(),
            serde_json::to_string(&InboundFrame::TypingEnd).unwrap(),
        ];
        frames.join("\n") + "\n"
    }

    async fn spawn_gateway() -> String {
        let app = Router::new()
            .route("/v1/sessions/{session}/slots/{slot}", get(handshake))
            .route("/v1/sessions/{session}/slots/{slot}/query", post(query));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_http_transport_round_trip() {
        let base = spawn_gateway().await;
        let transport = HttpStreamTransport::new(base, Duration::from_secs(2)).unwrap();

        let mut link = transport
            .connect(&SlotAddress::new("s-1", 0))
            .await
            .unwrap();

        let record = QueryRecord::new(0, "ping", ChatConfig::new("phi3"));
        link.send(OutboundFrame::query(&record)).await.unwrap();

        let mut frames = Vec::new();
        for _ in 0..4 {
            let frame = tokio::time::timeout(Duration::from_secs(2), link.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            frames.push(frame);
        }
        assert_eq!(frames[0], InboundFrame::TypingStart);
        assert_eq!(frames[1], InboundFrame::System { content: None });
        assert_eq!(
            frames[2],
            InboundFrame::Message {
                content: "phi3 says ping".to_string(),
                query_id: Some(record.id)
            }
        );
        assert_eq!(frames[3], InboundFrame::TypingEnd);
        link.close().await;
    }

    #[tokio::test]
    async fn test_http_transport_handshake_rejected() {
        let base = spawn_gateway().await;
        let transport = HttpStreamTransport::new(base, Duration::from_secs(2)).unwrap();

        let result = transport.connect(&SlotAddress::new("s-1", 3)).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }
}
